//! Load config from file, environment and command line.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use peerspeak_core::registry::DEFAULT_FINGERPRINT_CAPACITY;
use peerspeak_core::PeerId;

use crate::network::Settings;

/// Default port for direct peer connections.
pub const DEFAULT_LISTEN_PORT: u16 = 2738;

/// Node configuration. File: ~/.config/peerspeak/config.toml or /etc/peerspeak/config.toml.
/// Env overrides: PEERSPEAK_PEER_ID, PEERSPEAK_DISCOVERY, PEERSPEAK_LISTEN_PORT.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Our id on the mesh. Random when absent.
    #[serde(default)]
    pub peer_id: Option<u64>,
    /// Rendezvous server as `host:port`. Connected at start when set.
    #[serde(default)]
    pub discovery_addr: Option<String>,
    /// Direct peer listener port (default 2738, 0 disables).
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    #[serde(default = "default_timeout_secs")]
    pub handshake_timeout_secs: u64,
    #[serde(default = "default_timeout_secs")]
    pub punch_timeout_secs: u64,
    #[serde(default = "default_fingerprint_capacity")]
    pub fingerprint_capacity: usize,
}

fn default_listen_port() -> u16 {
    DEFAULT_LISTEN_PORT
}
fn default_timeout_secs() -> u64 {
    10
}
fn default_fingerprint_capacity() -> usize {
    DEFAULT_FINGERPRINT_CAPACITY
}

impl Default for Config {
    fn default() -> Self {
        Self {
            peer_id: None,
            discovery_addr: None,
            listen_port: default_listen_port(),
            handshake_timeout_secs: default_timeout_secs(),
            punch_timeout_secs: default_timeout_secs(),
            fingerprint_capacity: default_fingerprint_capacity(),
        }
    }
}

impl Config {
    /// Network settings. Picks a random id if none was configured.
    pub fn settings(&self) -> Settings {
        Settings {
            self_id: self.peer_id.map(PeerId).unwrap_or_else(PeerId::random),
            handshake_timeout: Duration::from_secs(self.handshake_timeout_secs),
            punch_timeout: Duration::from_secs(self.punch_timeout_secs),
            fingerprint_capacity: self.fingerprint_capacity,
        }
    }

    /// Apply command-line flags on top of file and env values.
    pub fn apply_args<I>(&mut self, args: I) -> Result<(), ArgError>
    where
        I: IntoIterator<Item = String>,
    {
        let mut args = args.into_iter();
        while let Some(flag) = args.next() {
            let mut value = || args.next().ok_or_else(|| ArgError::MissingValue(flag.clone()));
            match flag.as_str() {
                "--id" => {
                    let v = value()?;
                    self.peer_id = Some(v.parse().map_err(|_| ArgError::Invalid(flag.clone(), v))?);
                }
                "--discovery" => {
                    let v = value()?;
                    split_host_port(&v).ok_or_else(|| ArgError::Invalid(flag.clone(), v.clone()))?;
                    self.discovery_addr = Some(v);
                }
                "--listen" => {
                    let v = value()?;
                    self.listen_port = v.parse().map_err(|_| ArgError::Invalid(flag.clone(), v))?;
                }
                _ => return Err(ArgError::Unknown(flag)),
            }
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ArgError {
    #[error("unknown argument {0}")]
    Unknown(String),
    #[error("{0} needs a value")]
    MissingValue(String),
    #[error("invalid value for {0}: {1}")]
    Invalid(String, String),
}

/// Split `host:port`. The host part may not be empty.
pub fn split_host_port(s: &str) -> Option<(&str, u16)> {
    let (host, port) = s.rsplit_once(':')?;
    if host.is_empty() {
        return None;
    }
    Some((host, port.parse().ok()?))
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    apply_env(&mut c, |k| std::env::var(k).ok());
    c
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(s) = var("PEERSPEAK_PEER_ID") {
        if let Ok(id) = s.parse::<u64>() {
            c.peer_id = Some(id);
        }
    }
    if let Some(s) = var("PEERSPEAK_DISCOVERY") {
        if split_host_port(&s).is_some() {
            c.discovery_addr = Some(s);
        }
    }
    if let Some(s) = var("PEERSPEAK_LISTEN_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.listen_port = p;
        }
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/peerspeak/config.toml"));
    }
    out.push(PathBuf::from("/etc/peerspeak/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            match std::fs::read_to_string(&p) {
                Ok(s) => match toml::from_str::<Config>(&s) {
                    Ok(c) => return Some(c),
                    Err(e) => log::warn!("ignoring {}: {}", p.display(), e),
                },
                Err(e) => log::warn!("cannot read {}: {}", p.display(), e),
            }
            break;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn file_fills_defaults() {
        let c: Config = toml::from_str("peer_id = 7\ndiscovery_addr = \"rdv.example:4000\"\n").unwrap();
        assert_eq!(c.peer_id, Some(7));
        assert_eq!(c.listen_port, DEFAULT_LISTEN_PORT);
        assert_eq!(c.handshake_timeout_secs, 10);
        assert_eq!(c.fingerprint_capacity, DEFAULT_FINGERPRINT_CAPACITY);
        assert!(toml::from_str::<Config>("bogus = 1").is_err());
    }

    #[test]
    fn env_overrides_and_ignores_garbage() {
        let mut c = Config::default();
        apply_env(&mut c, |k| match k {
            "PEERSPEAK_PEER_ID" => Some("99".into()),
            "PEERSPEAK_DISCOVERY" => Some("no-port".into()),
            "PEERSPEAK_LISTEN_PORT" => Some("0".into()),
            _ => None,
        });
        assert_eq!(c.peer_id, Some(99));
        assert_eq!(c.discovery_addr, None);
        assert_eq!(c.listen_port, 0);
    }

    #[test]
    fn flags_override() {
        let mut c = Config::default();
        c.apply_args(args(&["--id", "12", "--discovery", "10.0.0.1:9000", "--listen", "0"]))
            .unwrap();
        assert_eq!(c.peer_id, Some(12));
        assert_eq!(c.discovery_addr.as_deref(), Some("10.0.0.1:9000"));
        assert_eq!(c.listen_port, 0);
        assert_eq!(c.settings().self_id, PeerId(12));
    }

    #[test]
    fn bad_flags() {
        let mut c = Config::default();
        assert_eq!(
            c.apply_args(args(&["--id"])),
            Err(ArgError::MissingValue("--id".into()))
        );
        assert_eq!(
            c.apply_args(args(&["--listen", "huge"])),
            Err(ArgError::Invalid("--listen".into(), "huge".into()))
        );
        assert_eq!(
            c.apply_args(args(&["--verbose"])),
            Err(ArgError::Unknown("--verbose".into()))
        );
    }

    #[test]
    fn host_port_split() {
        assert_eq!(split_host_port("localhost:2738"), Some(("localhost", 2738)));
        assert_eq!(split_host_port(":1"), None);
        assert_eq!(split_host_port("host:"), None);
    }
}
