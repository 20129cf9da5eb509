use std::{
    fs::read_to_string,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::{Arc, OnceLock, RwLock},
};

use anyhow::{Context, Result, bail};

use crate::consts::{DEFAULT_PORT, PUBLIC_PASSWORD};

/// Process-wide proxy configuration, immutable after `open()` loads it.
///
/// The source format is `key = value` lines, `#` comments, blank lines
/// ignored, case-sensitive keys — close to TOML but not quite (bare
/// comma-separated address lists), so it gets its own small parser below
/// rather than being forced through `toml`.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub bind_addr: Option<String>,
    pub bind_addr_ext: Option<String>,
    pub bind_addr_ext_add: Vec<String>,
    pub public_addr: Option<String>,
    pub port: u16,
    pub password: String,
    pub calls_allowed: Option<String>,
    pub calls_denied: Option<String>,
    pub reg_name: Option<String>,
    pub reg_comment: Option<String>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        ProxyConfig {
            bind_addr: None,
            bind_addr_ext: None,
            bind_addr_ext_add: Vec::new(),
            public_addr: None,
            port: DEFAULT_PORT,
            password: String::new(),
            calls_allowed: None,
            calls_denied: None,
            reg_name: None,
            reg_comment: None,
        }
    }
}

impl ProxyConfig {
    pub fn parse_str(src: &str) -> Result<Self> {
        let mut config = ProxyConfig::default();
        for (lineno, raw_line) in src.lines().enumerate() {
            let line = raw_line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let (key, value) = line
                .split_once('=')
                .with_context(|| format!("line {}: expected `key = value`", lineno + 1))?;
            let key = key.trim();
            let value = value.trim();
            match key {
                "BindAddress" => config.bind_addr = Some(value.to_string()),
                "ExternalBindAddress" => config.bind_addr_ext = Some(value.to_string()),
                "AdditionalExternalBindAddresses" => {
                    config.bind_addr_ext_add =
                        value.split(',').map(|s| s.trim().to_string()).collect();
                }
                "PublicAddress" => config.public_addr = Some(value.to_string()),
                "Port" => {
                    config.port = value
                        .parse()
                        .with_context(|| format!("line {}: invalid Port value", lineno + 1))?;
                }
                "Password" => config.password = value.to_string(),
                "CallsignsAllowed" => config.calls_allowed = Some(value.to_string()),
                "CallsignsDenied" => config.calls_denied = Some(value.to_string()),
                "RegistrationName" => config.reg_name = Some(value.to_string()),
                "RegistrationComment" => config.reg_comment = Some(value.to_string()),
                other => bail!("line {}: unrecognized key `{}`", lineno + 1, other),
            }
        }
        Ok(config)
    }

    pub fn from_file(path: &str) -> Result<Self> {
        let contents = read_to_string(path)
            .with_context(|| format!("failed to read configuration file {}", path))?;
        Self::parse_str(&contents)
    }

    /// `password` must be present and not the literal `notset`.
    pub fn validate(&self) -> Result<()> {
        if self.password.is_empty() {
            bail!("Password is required");
        }
        if self.password == "notset" {
            bail!("Password must not be left as `notset`");
        }
        Ok(())
    }

    pub fn is_public(&self) -> bool {
        self.password == PUBLIC_PASSWORD
    }

    /// Number of slots the server exposes: one, plus one per additional
    /// external bind address.
    pub fn slot_count(&self) -> usize {
        1 + self.bind_addr_ext_add.len()
    }

    /// The external IPv4 source address for slot `index` (0-based): slot 0
    /// uses `bind_addr_ext` (or the wildcard if unset), later slots use the
    /// corresponding entry of `bind_addr_ext_add`.
    pub fn slot_source_addr(&self, index: usize) -> Result<Ipv4Addr> {
        let raw = if index == 0 {
            self.bind_addr_ext.as_deref()
        } else {
            self.bind_addr_ext_add
                .get(index - 1)
                .map(String::as_str)
        };
        match raw {
            Some(addr) => addr
                .parse()
                .with_context(|| format!("invalid external bind address `{}`", addr)),
            None => Ok(Ipv4Addr::UNSPECIFIED),
        }
    }

    pub fn listen_sockaddr(&self) -> SocketAddr {
        let ip = self
            .bind_addr
            .as_deref()
            .and_then(|s| s.parse::<IpAddr>().ok())
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        SocketAddr::new(ip, self.port)
    }

    pub fn registration_enabled(&self) -> bool {
        self.reg_name.is_some()
    }
}

pub fn get() -> Arc<RwLock<ProxyConfig>> {
    static PROXY_CONFIG: OnceLock<Arc<RwLock<ProxyConfig>>> = OnceLock::new();
    PROXY_CONFIG
        .get_or_init(|| Arc::new(RwLock::new(ProxyConfig::default())))
        .clone()
}

pub fn set(config: ProxyConfig) {
    *get().write().unwrap() = config;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_recognized_keys() {
        let src = r#"
            # a comment
            Port = 8100
            Password = PUBLIC
            BindAddress = 0.0.0.0
            ExternalBindAddress = 203.0.113.1
            AdditionalExternalBindAddresses = 203.0.113.2, 203.0.113.3
            CallsignsAllowed = ^KM0H$
            RegistrationName = N0CALL-L
            RegistrationComment = test proxy
        "#;
        let config = ProxyConfig::parse_str(src).unwrap();
        assert_eq!(config.port, 8100);
        assert_eq!(config.password, "PUBLIC");
        assert_eq!(config.bind_addr_ext.as_deref(), Some("203.0.113.1"));
        assert_eq!(
            config.bind_addr_ext_add,
            vec!["203.0.113.2".to_string(), "203.0.113.3".to_string()]
        );
        assert_eq!(config.calls_allowed.as_deref(), Some("^KM0H$"));
        assert!(config.is_public());
        assert_eq!(config.slot_count(), 3);
    }

    #[test]
    fn rejects_notset_password() {
        let config = ProxyConfig::parse_str("Password = notset").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_missing_password() {
        let config = ProxyConfig::parse_str("Port = 8100").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_unrecognized_key() {
        assert!(ProxyConfig::parse_str("Bogus = 1").is_err());
    }

    #[test]
    fn default_slot_source_addr_is_wildcard() {
        let config = ProxyConfig::default();
        assert_eq!(config.slot_source_addr(0).unwrap(), Ipv4Addr::UNSPECIFIED);
    }
}
