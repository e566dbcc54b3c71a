//! Response cache keyed by the verbatim request-line URL.
//!
//! Entries accumulate chunks while the owning relay connection is active
//! (`open`), and become immutable once that connection exits. Expiry is lazy:
//! a stale entry is simply never returned, and stays in memory until the next
//! write to the same key overwrites it. There is no active eviction.

use crate::error::ProxyError;
use crate::request::find_subslice;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

/// Fallback max-age when a response carries no `max-age` directive.
pub const DEFAULT_MAX_AGE_SECS: u64 = 60;

#[derive(Debug, Clone)]
struct CacheEntry {
    chunks: Vec<Bytes>,
    open: bool,
    expires_at: SystemTime,
    etag: Option<Bytes>,
}

/// Shared response cache. Workers on different tasks write concurrently, so
/// the table lives behind a mutex with short critical sections.
#[derive(Debug, Default)]
pub struct ResponseCache {
    entries: Mutex<HashMap<Bytes, CacheEntry>>,
}

/// Extract `(max_age, cachable)` from a raw `Cache-Control` value.
///
/// `no-store` or `no-cache` anywhere in the value makes the response
/// uncachable. A `max-age=<n>` token overrides the default; `n` may be 0,
/// which disables caching through the `max_age > 0` gate in `store`.
pub fn parse_cache_control(value: &[u8]) -> Result<(u64, bool), ProxyError> {
    let cachable = find_subslice(value, b"no-store").is_none()
        && find_subslice(value, b"no-cache").is_none();

    let mut max_age = DEFAULT_MAX_AGE_SECS;
    for part in value.split(|&b| b == b',') {
        if find_subslice(part, b"max-age").is_some() {
            let raw = part.split(|&b| b == b'=').nth(1).ok_or_else(|| {
                ProxyError::Parse(format!(
                    "max-age directive without value: {:?}",
                    String::from_utf8_lossy(part)
                ))
            })?;
            max_age = std::str::from_utf8(raw)
                .ok()
                .and_then(|s| s.trim().parse::<u64>().ok())
                .ok_or_else(|| {
                    ProxyError::Parse(format!(
                        "unparseable max-age value: {:?}",
                        String::from_utf8_lossy(raw)
                    ))
                })?;
        }
    }
    Ok((max_age, cachable))
}

impl ResponseCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one origin chunk for `key`, using the response headers to decide
    /// cachability. Appends to an entry that is still open and unexpired;
    /// otherwise starts a fresh entry, overwriting whatever closed or stale
    /// entry occupied the key.
    pub fn store(&self, key: &Bytes, data: Bytes, headers: &HashMap<&[u8], &[u8]>) {
        self.store_at(key, data, headers, SystemTime::now());
    }

    fn store_at(
        &self,
        key: &Bytes,
        data: Bytes,
        headers: &HashMap<&[u8], &[u8]>,
        now: SystemTime,
    ) {
        let control = headers
            .get(b"Cache-Control".as_slice())
            .copied()
            .unwrap_or(b"");
        let etag = headers
            .get(b"ETag".as_slice())
            .map(|v| Bytes::copy_from_slice(v));

        let (max_age, cachable) = match parse_cache_control(control) {
            Ok(parsed) => parsed,
            Err(e) => {
                log::debug!("skipping cache write for {:?}: {}", key, e);
                return;
            }
        };
        if !cachable || max_age == 0 {
            return;
        }

        let mut entries = self.entries.lock().unwrap();
        match entries.get_mut(key) {
            Some(entry) if entry.open && entry.expires_at >= now => {
                entry.chunks.push(data);
            }
            _ => {
                entries.insert(
                    key.clone(),
                    CacheEntry {
                        chunks: vec![data],
                        open: true,
                        expires_at: now + Duration::from_secs(max_age),
                        etag,
                    },
                );
            }
        }
    }

    /// Return the accumulated chunks for `key` if the entry is still fresh.
    /// No side effects; expired entries are left in place.
    pub fn lookup(&self, key: &Bytes) -> Option<Vec<Bytes>> {
        self.lookup_at(key, SystemTime::now())
    }

    fn lookup_at(&self, key: &Bytes, now: SystemTime) -> Option<Vec<Bytes>> {
        let entries = self.entries.lock().unwrap();
        entries
            .get(key)
            .filter(|entry| entry.expires_at >= now)
            .map(|entry| entry.chunks.clone())
    }

    /// Seal the entry for `key`: the owning relay connection has exited and
    /// no further chunks may be appended. Called once per worker, on every
    /// exit path. A no-op when the entry has already expired.
    pub fn close(&self, key: &Bytes) {
        self.close_at(key, SystemTime::now());
    }

    fn close_at(&self, key: &Bytes, now: SystemTime) {
        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.get_mut(key) {
            if entry.expires_at >= now {
                entry.open = false;
            }
        }
    }
}
