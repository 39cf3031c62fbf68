//! Load config from file and environment.

use serde::Deserialize;
use std::path::PathBuf;
use tether_core::DeliveryConfig;
use uuid::Uuid;

/// App identity both ends must agree on during the handshake.
pub const DEFAULT_APP_UUID: Uuid = Uuid::from_u128(0x5f1c_2e7a_93b4_4d0e_8a61_0c3f_d2b7_e914);

/// Daemon configuration. File: ~/.config/tether/config.toml or /etc/tether/config.toml.
/// Env overrides: TETHER_PEER_ADDR, TETHER_LISTEN_PORT, TETHER_OUTPUT_DIR, TETHER_MAX_RETRIES,
/// TETHER_FRAME_LIMIT.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Peer to connect to in send mode (default 127.0.0.1:47000).
    #[serde(default = "default_peer_addr")]
    pub peer_addr: String,
    /// Listen port in receive mode (default 47000).
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    #[serde(default = "default_app_uuid")]
    pub app_uuid: Uuid,
    /// Where received objects are written.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default)]
    pub delivery: DeliveryConfig,
}

fn default_peer_addr() -> String {
    "127.0.0.1:47000".to_string()
}
fn default_listen_port() -> u16 {
    47000
}
fn default_app_uuid() -> Uuid {
    DEFAULT_APP_UUID
}
fn default_output_dir() -> PathBuf {
    PathBuf::from("received")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            peer_addr: default_peer_addr(),
            listen_port: default_listen_port(),
            app_uuid: default_app_uuid(),
            output_dir: default_output_dir(),
            delivery: DeliveryConfig::default(),
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    apply_env(&mut c, |key| std::env::var(key).ok());
    c
}

/// Parse a config file body.
pub fn parse(s: &str) -> Result<Config, toml::de::Error> {
    toml::from_str::<Config>(s)
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(s) = var("TETHER_PEER_ADDR") {
        c.peer_addr = s;
    }
    if let Some(p) = var("TETHER_LISTEN_PORT").and_then(|s| s.parse::<u16>().ok()) {
        c.listen_port = p;
    }
    if let Some(s) = var("TETHER_OUTPUT_DIR") {
        c.output_dir = PathBuf::from(s);
    }
    if let Some(n) = var("TETHER_MAX_RETRIES").and_then(|s| s.parse::<u32>().ok()) {
        c.delivery.max_retries = n;
    }
    if let Some(n) = var("TETHER_FRAME_LIMIT").and_then(|s| s.parse::<usize>().ok()) {
        c.delivery.frame_limit = n;
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/tether/config.toml"));
    }
    out.push(PathBuf::from("/etc/tether/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            match std::fs::read_to_string(&p) {
                Ok(s) => match parse(&s) {
                    Ok(c) => return Some(c),
                    Err(e) => tracing::warn!(path = %p.display(), error = %e, "invalid config, using defaults"),
                },
                Err(e) => tracing::warn!(path = %p.display(), error = %e, "cannot read config"),
            }
            break;
        }
    }
    None
}
