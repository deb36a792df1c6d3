//! Load config from file and environment.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Node configuration. File: ~/.config/chirp/config.toml or /etc/chirp/config.toml.
/// Env overrides: CHIRP_TRACKER_BIND, CHIRP_TRACKER_PORT, CHIRP_TRACKER_URL, CHIRP_PEER_PORT,
/// CHIRP_BRIDGE_PORT, CHIRP_ADVERTISE_IP, CHIRP_READ_TIMEOUT_SECS.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Address the tracker binds (default 0.0.0.0).
    #[serde(default = "default_tracker_bind")]
    pub tracker_bind: String,
    /// Tracker HTTP port (default 8001).
    #[serde(default = "default_tracker_port")]
    pub tracker_port: u16,
    /// Tracker base URL used by peers and the bridge.
    #[serde(default = "default_tracker_url")]
    pub tracker_url: String,
    /// Peer listen port for direct connections (default 9000).
    #[serde(default = "default_peer_port")]
    pub peer_port: u16,
    /// Bridge HTTP port (default 8002).
    #[serde(default = "default_bridge_port")]
    pub bridge_port: u16,
    /// IP to advertise to the tracker. Detected when unset.
    #[serde(default)]
    pub advertise_ip: Option<String>,
    /// Close a peer connection after this many idle seconds. Unset: never.
    #[serde(default)]
    pub read_timeout_secs: Option<u64>,
}

fn default_tracker_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_tracker_port() -> u16 {
    8001
}
fn default_tracker_url() -> String {
    "http://127.0.0.1:8001".to_string()
}
fn default_peer_port() -> u16 {
    9000
}
fn default_bridge_port() -> u16 {
    8002
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tracker_bind: default_tracker_bind(),
            tracker_port: default_tracker_port(),
            tracker_url: default_tracker_url(),
            peer_port: default_peer_port(),
            bridge_port: default_bridge_port(),
            advertise_ip: None,
            read_timeout_secs: None,
        }
    }
}

impl Config {
    pub fn read_timeout(&self) -> Option<Duration> {
        self.read_timeout_secs
            .filter(|s| *s > 0)
            .map(Duration::from_secs)
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    apply_env(&mut c, |key| std::env::var(key).ok());
    c
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(s) = var("CHIRP_TRACKER_BIND") {
        c.tracker_bind = s;
    }
    if let Some(p) = var("CHIRP_TRACKER_PORT").and_then(|s| s.parse().ok()) {
        c.tracker_port = p;
    }
    if let Some(s) = var("CHIRP_TRACKER_URL") {
        c.tracker_url = s;
    }
    if let Some(p) = var("CHIRP_PEER_PORT").and_then(|s| s.parse().ok()) {
        c.peer_port = p;
    }
    if let Some(p) = var("CHIRP_BRIDGE_PORT").and_then(|s| s.parse().ok()) {
        c.bridge_port = p;
    }
    if let Some(s) = var("CHIRP_ADVERTISE_IP") {
        c.advertise_ip = Some(s);
    }
    if let Some(t) = var("CHIRP_READ_TIMEOUT_SECS").and_then(|s| s.parse().ok()) {
        c.read_timeout_secs = Some(t);
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/chirp/config.toml"));
    }
    out.push(PathBuf::from("/etc/chirp/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            match std::fs::read_to_string(&p) {
                Ok(s) => match toml::from_str::<Config>(&s) {
                    Ok(c) => return Some(c),
                    Err(e) => tracing::warn!(path = %p.display(), "ignoring config file: {}", e),
                },
                Err(e) => tracing::warn!(path = %p.display(), "cannot read config file: {}", e),
            }
            break;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn partial_file_keeps_defaults() {
        let c: Config = toml::from_str("peer_port = 9100\nread_timeout_secs = 30\n").unwrap();
        assert_eq!(c.peer_port, 9100);
        assert_eq!(c.tracker_port, 8001);
        assert_eq!(c.read_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(c.advertise_ip, None);
    }

    #[test]
    fn unknown_key_rejected() {
        assert!(toml::from_str::<Config>("proxy_port = 3128\n").is_err());
    }

    #[test]
    fn env_overrides_file() {
        let env: HashMap<&str, &str> = [
            ("CHIRP_TRACKER_URL", "http://10.0.0.1:8001"),
            ("CHIRP_PEER_PORT", "9200"),
            ("CHIRP_BRIDGE_PORT", "not-a-port"),
            ("CHIRP_ADVERTISE_IP", "10.0.0.7"),
        ]
        .into_iter()
        .collect();
        let mut c = Config::default();
        apply_env(&mut c, |k| env.get(k).map(|v| v.to_string()));
        assert_eq!(c.tracker_url, "http://10.0.0.1:8001");
        assert_eq!(c.peer_port, 9200);
        assert_eq!(c.bridge_port, 8002);
        assert_eq!(c.advertise_ip.as_deref(), Some("10.0.0.7"));
    }

    #[test]
    fn zero_timeout_disables() {
        let c = Config {
            read_timeout_secs: Some(0),
            ..Config::default()
        };
        assert_eq!(c.read_timeout(), None);
    }
}
