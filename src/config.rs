//! Configuration file model.
//!
//! One JSON file drives one process; `mode` selects the role and the rest of
//! the object is decoded as that role's section. Validation resolves every
//! method name against the transform registry, so the engines only ever see
//! [`Port`]s whose cipher and compressor exist.

use crate::error::{Error, Result};
use crate::transform::{self, Cipher, Compressor};
use log::LevelFilter;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;

#[derive(Debug, Deserialize)]
struct BaseConfig {
    #[serde(default)]
    mode: String,
    #[serde(default = "default_log_level")]
    log_level: String,
}

fn default_log_level() -> String {
    "info".into()
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub listen_at: String,
    pub master_key: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub master: String,
    pub master_key: String,
    pub ports: Vec<PortConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub master: String,
    pub ports: Vec<PortConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PortConfig {
    pub mark: String,
    pub local_address: String,
    pub port_key: String,
    pub encrypt_method: String,
    pub compress_method: String,
}

/// A validated port: where to dial (server) or listen (client), and how the
/// tunnel is wrapped.
#[derive(Debug, Clone)]
pub struct Port {
    pub mark: String,
    pub address: String,
    pub port_key: String,
    pub cipher: &'static Cipher,
    pub compressor: &'static Compressor,
}

#[derive(Debug, Clone)]
pub struct BrokerOptions {
    pub listen_addr: String,
    pub master_key: String,
}

#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub broker_addr: String,
    pub master_key: String,
    pub ports: Vec<Port>,
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub broker_addr: String,
    pub ports: Vec<Port>,
}

#[derive(Debug, Clone)]
pub enum Mode {
    Broker(BrokerOptions),
    Server(ServerOptions),
    Client(ClientOptions),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: LevelFilter,
    pub mode: Mode,
}

fn require(value: &str, what: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::Config(format!("{} empty", what)));
    }
    Ok(())
}

fn parse_log_level(level: &str) -> Result<LevelFilter> {
    match level.to_ascii_lowercase().as_str() {
        "fatal" | "panic" => Ok(LevelFilter::Error),
        "warning" => Ok(LevelFilter::Warn),
        l => l
            .parse()
            .map_err(|_| Error::Config(format!("unsupported log level {}", level))),
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let buf = std::fs::read(path)?;
        Self::from_slice(&buf)
    }

    pub fn from_slice(buf: &[u8]) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_slice(buf)?;
        let base = BaseConfig::deserialize(&value)?;
        require(&base.mode, "mode")?;
        require(&base.log_level, "log level (log_level)")?;
        let log_level = parse_log_level(&base.log_level)?;

        let mode = match base.mode.to_ascii_lowercase().as_str() {
            "master" | "broker" => Mode::Broker(BrokerConfig::deserialize(&value)?.validate()?),
            "server" => Mode::Server(ServerConfig::deserialize(&value)?.validate()?),
            "client" => Mode::Client(ClientConfig::deserialize(&value)?.validate()?),
            _ => return Err(Error::Config(format!("unsupported mode {}", base.mode))),
        };

        Ok(Self { log_level, mode })
    }
}

impl BrokerConfig {
    pub fn validate(self) -> Result<BrokerOptions> {
        require(&self.listen_at, "listen address (listen_at)")?;
        require(&self.master_key, "master key (master_key)")?;

        Ok(BrokerOptions {
            listen_addr: self.listen_at,
            master_key: self.master_key,
        })
    }
}

impl ServerConfig {
    pub fn validate(self) -> Result<ServerOptions> {
        require(&self.master, "master address (master)")?;
        require(&self.master_key, "master key (master_key)")?;

        Ok(ServerOptions {
            broker_addr: self.master,
            master_key: self.master_key,
            ports: validate_ports(&self.ports)?,
        })
    }
}

impl ClientConfig {
    pub fn validate(self) -> Result<ClientOptions> {
        require(&self.master, "master address (master)")?;

        Ok(ClientOptions {
            broker_addr: self.master,
            ports: validate_ports(&self.ports)?,
        })
    }
}

fn validate_ports(ports: &[PortConfig]) -> Result<Vec<Port>> {
    if ports.is_empty() {
        return Err(Error::Config("ports empty".into()));
    }

    let mut keys = HashSet::new();
    let mut out = Vec::with_capacity(ports.len());
    for (i, p) in ports.iter().enumerate() {
        let port = p.validate().map_err(|e| {
            Error::Config(format!("port (at pos {}) validate failed: {}", i, e))
        })?;
        if !keys.insert(port.port_key.clone()) {
            return Err(Error::Config(format!(
                "port (at pos {}) validate failed: duplicate port key",
                i
            )));
        }
        out.push(port);
    }
    Ok(out)
}

impl PortConfig {
    pub fn validate(&self) -> Result<Port> {
        require(&self.local_address, "local address (local_address)")?;
        require(&self.port_key, "port key (port_key)")?;
        require(&self.encrypt_method, "encrypt method (encrypt_method)")?;
        require(&self.compress_method, "compress method (compress_method)")?;
        if self.port_key.len() > u8::MAX as usize {
            return Err(Error::Config("port key (port_key) longer than 255 bytes".into()));
        }

        Ok(Port {
            mark: self.mark.clone(),
            address: self.local_address.clone(),
            port_key: self.port_key.clone(),
            cipher: transform::cipher(&self.encrypt_method)?,
            compressor: transform::compressor(&self.compress_method)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broker_config() {
        let cfg = Config::from_slice(
            br#"{"mode": "Master", "log_level": "debug", "listen_at": ":9000", "master_key": "mk"}"#,
        )
        .unwrap();
        assert_eq!(cfg.log_level, LevelFilter::Debug);
        match cfg.mode {
            Mode::Broker(b) => {
                assert_eq!(b.listen_addr, ":9000");
                assert_eq!(b.master_key, "mk");
            }
            other => panic!("unexpected mode {:?}", other),
        }
    }

    #[test]
    fn server_config_resolves_methods() {
        let cfg = Config::from_slice(
            br#"{
                "mode": "server",
                "master": "broker.example:9000",
                "master_key": "mk",
                "ports": [
                    {"mark": "web", "local_address": "127.0.0.1:8080", "port_key": "pk1",
                     "encrypt_method": "AES-128-CFB", "compress_method": "s2"},
                    {"local_address": "127.0.0.1:22", "port_key": "pk2",
                     "encrypt_method": "plain", "compress_method": "null"}
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(cfg.log_level, LevelFilter::Info);

        let Mode::Server(s) = cfg.mode else {
            panic!("expected server mode");
        };
        assert_eq!(s.ports.len(), 2);
        assert_eq!(s.ports[0].cipher.name(), "aes-128-cfb");
        assert_eq!(s.ports[0].compressor.name(), "s2");
        assert_eq!(s.ports[1].mark, "");
        assert_eq!(s.ports[1].address, "127.0.0.1:22");
    }

    #[test]
    fn rejects_bad_ports() {
        let unknown = br#"{"mode": "client", "master": "m:1", "ports": [
            {"local_address": "a", "port_key": "k", "encrypt_method": "rc4", "compress_method": "null"}]}"#;
        let err = Config::from_slice(unknown).unwrap_err().to_string();
        assert!(err.contains("at pos 0"), "{}", err);
        assert!(err.contains("rc4"), "{}", err);

        let dup = br#"{"mode": "client", "master": "m:1", "ports": [
            {"local_address": "a", "port_key": "k", "encrypt_method": "plain", "compress_method": "null"},
            {"local_address": "b", "port_key": "k", "encrypt_method": "plain", "compress_method": "zstd"}]}"#;
        let err = Config::from_slice(dup).unwrap_err().to_string();
        assert!(err.contains("at pos 1"), "{}", err);

        let empty = br#"{"mode": "client", "master": "m:1", "ports": []}"#;
        assert!(matches!(Config::from_slice(empty), Err(Error::Config(_))));

        let missing = br#"{"mode": "client", "master": "m:1", "ports": [
            {"local_address": "a", "encrypt_method": "plain", "compress_method": "null"}]}"#;
        let err = Config::from_slice(missing).unwrap_err().to_string();
        assert!(err.contains("port_key"), "{}", err);
    }

    #[test]
    fn rejects_bad_base() {
        assert!(Config::from_slice(br#"{"log_level": "info"}"#).is_err());
        assert!(Config::from_slice(br#"{"mode": "relay"}"#).is_err());
        assert!(Config::from_slice(br#"{"mode": "master", "log_level": "loud"}"#).is_err());
        assert!(matches!(
            Config::from_slice(b"not json"),
            Err(Error::Json(_))
        ));
        assert!(matches!(
            Config::from_slice(br#"{"mode": "master", "listen_at": ":1"}"#),
            Err(Error::Config(_))
        ));
    }
}
