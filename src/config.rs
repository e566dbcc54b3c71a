use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;

fn default_listen_addr() -> SocketAddr {
    "127.0.0.1:8002".parse().expect("static default address")
}

fn default_console_port() -> u16 {
    8008
}

fn default_blacklist_file() -> PathBuf {
    PathBuf::from("bl.json")
}

fn default_console_verbosity() -> u8 {
    1
}

fn default_max_buffer() -> usize {
    4096
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Address the proxy accepts browser connections on.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Port the operator console's WebSocket server binds.
    #[serde(default = "default_console_port")]
    pub console_port: u16,

    /// Blocklist persistence file (JSON object, domain -> "").
    #[serde(default = "default_blacklist_file")]
    pub blacklist_file: PathBuf,

    /// Console event verbosity: lifecycle events are level 1, relay payload
    /// dumps level 3. Events above this threshold are dropped.
    #[serde(default = "default_console_verbosity")]
    pub console_verbosity: u8,

    /// Size of each bounded socket read. Requests larger than one buffer are
    /// not reassembled.
    #[serde(default = "default_max_buffer")]
    pub max_buffer: usize,

    /// Optional origin connect timeout in seconds. `None` keeps the default
    /// behavior of relying on OS-level timeouts only.
    #[serde(default)]
    pub connect_timeout_secs: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            console_port: default_console_port(),
            blacklist_file: default_blacklist_file(),
            console_verbosity: default_console_verbosity(),
            max_buffer: default_max_buffer(),
            connect_timeout_secs: None,
        }
    }
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    pub fn to_file(&self, path: &str) -> Result<(), Box<dyn std::error::Error>> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_json_yields_all_defaults() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:8002".parse().unwrap());
        assert_eq!(config.console_port, 8008);
        assert_eq!(config.blacklist_file, PathBuf::from("bl.json"));
        assert_eq!(config.console_verbosity, 1);
        assert_eq!(config.max_buffer, 4096);
        assert_eq!(config.connect_timeout_secs, None);
    }

    #[test]
    fn partial_json_overrides_only_named_fields() {
        let config: Config =
            serde_json::from_str(r#"{"console_port": 9009, "connect_timeout_secs": 10}"#).unwrap();
        assert_eq!(config.console_port, 9009);
        assert_eq!(config.connect_timeout_secs, Some(10));
        assert_eq!(config.max_buffer, 4096);
    }
}
