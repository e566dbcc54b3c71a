use crate::error::ProxyError;
use bytes::Bytes;
use std::collections::HashMap;

/// Target of an inbound browser request, derived once from the raw request
/// buffer. `url` is the verbatim request-line token and doubles as the cache
/// key and the in-flight dedup key; it is always compared byte-exact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetAddress {
    pub host: Bytes,
    pub port: u16,
    pub url: Bytes,
}

impl TargetAddress {
    /// Lossy text form of the URL, for console events and process logs.
    pub fn url_text(&self) -> String {
        String::from_utf8_lossy(&self.url).into_owned()
    }

    pub fn host_text(&self) -> String {
        String::from_utf8_lossy(&self.host).into_owned()
    }
}

/// First occurrence of `needle` in `haystack`.
pub(crate) fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Extract `(host, port, url)` from the first line of a raw request buffer.
///
/// The second space-separated token of the first CRLF line is the URL. Any
/// scheme prefix is stripped at `://`; the first `:` after that is the
/// candidate port separator and the first `/` the candidate path start. A
/// missing port, or a `/` occurring before the `:`, selects the default
/// port 80 with the host running up to the `/`.
pub fn parse_request(request: &[u8]) -> Result<TargetAddress, ProxyError> {
    let first_line = match find_subslice(request, b"\r\n") {
        Some(pos) => &request[..pos],
        None => request,
    };

    let url = first_line
        .split(|&b| b == b' ')
        .nth(1)
        .filter(|tok| !tok.is_empty())
        .ok_or_else(|| {
            ProxyError::Parse(format!(
                "no URL token in request line: {:?}",
                String::from_utf8_lossy(first_line)
            ))
        })?;

    let rest = match find_subslice(url, b"://") {
        Some(pos) => &url[pos + 3..],
        None => url,
    };

    let port_pos = rest.iter().position(|&b| b == b':');
    let path_pos = rest.iter().position(|&b| b == b'/').unwrap_or(rest.len());

    let (host, port) = match port_pos {
        // No explicit port, or the path starts before the colon (a colon
        // inside the path is not a port separator).
        None => (&rest[..path_pos], 80),
        Some(p) if path_pos < p => (&rest[..path_pos], 80),
        Some(p) => {
            let port_bytes = &rest[p + 1..path_pos];
            let port = std::str::from_utf8(port_bytes)
                .ok()
                .and_then(|s| s.parse::<u16>().ok())
                .ok_or_else(|| {
                    ProxyError::Parse(format!(
                        "invalid port in URL: {:?}",
                        String::from_utf8_lossy(url)
                    ))
                })?;
            (&rest[..p], port)
        }
    };

    Ok(TargetAddress {
        host: Bytes::copy_from_slice(host),
        port,
        url: Bytes::copy_from_slice(url),
    })
}

/// Split a raw buffer into an HTTP header map: one entry per CRLF line that
/// contains a `": "` separator. Header names are kept byte-exact.
pub fn parse_headers(data: &[u8]) -> HashMap<&[u8], &[u8]> {
    let mut headers = HashMap::new();
    let mut rest = data;
    loop {
        let (line, next) = match find_subslice(rest, b"\r\n") {
            Some(pos) => (&rest[..pos], &rest[pos + 2..]),
            None => (rest, &rest[rest.len()..]),
        };
        if let Some(sep) = find_subslice(line, b": ") {
            headers.insert(&line[..sep], &line[sep + 2..]);
        }
        if next.is_empty() {
            break;
        }
        rest = next;
    }
    headers
}
