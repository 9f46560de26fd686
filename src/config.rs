//! Middleware configuration.
//!
//! CLI/config-file loading is out of scope. The host embeds this crate and
//! constructs [`EdlGuardConfig`] programmatically, the same way
//! `sem_os_server::main` assembles `JwtConfig` from already-resolved values
//! rather than parsing a file itself.

use rand::RngCore;

use crate::error::EdlError;

/// Client-IP extraction policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpStrategy {
    Direct,
    XForwardedFor,
    RealIp,
    Custom,
}

impl IpStrategy {
    pub fn parse(s: &str) -> Self {
        match s {
            "xff" => Self::XForwardedFor,
            "real-ip" => Self::RealIp,
            "custom" => Self::Custom,
            _ => Self::Direct,
        }
    }
}

/// Host-supplied configuration table.
#[derive(Debug, Clone)]
pub struct EdlGuardConfig {
    pub bootstrap_token: String,
    pub log_level: tracing::Level,
    pub machine_id: String,
    pub ip_strategy: IpStrategy,
    pub trusted_header: String,
    pub trusted_proxies: Vec<String>,
}

impl EdlGuardConfig {
    /// Construct with defaults for every field but `bootstrap_token`.
    pub fn new(bootstrap_token: impl Into<String>) -> Self {
        Self {
            bootstrap_token: bootstrap_token.into(),
            log_level: tracing::Level::INFO,
            machine_id: random_machine_id(),
            ip_strategy: IpStrategy::Direct,
            trusted_header: String::new(),
            trusted_proxies: Vec::new(),
        }
    }

    pub fn with_ip_strategy(mut self, strategy: IpStrategy, trusted_header: &str) -> Self {
        self.ip_strategy = strategy;
        self.trusted_header = trusted_header.to_string();
        self
    }

    pub fn with_trusted_proxies(mut self, proxies: Vec<String>) -> Self {
        self.trusted_proxies = proxies;
        self
    }

    /// Validate the configuration eagerly, the way `main.rs` treats a
    /// missing required env var as fatal at startup rather than at first
    /// use: configuration errors fail initialization, not a later request.
    pub fn validate(&self) -> Result<(), EdlError> {
        if self.bootstrap_token.trim().is_empty() {
            return Err(EdlError::InvalidBootstrapToken(
                "bootstrap_token is empty".into(),
            ));
        }
        if self.ip_strategy == IpStrategy::Custom && self.trusted_header.trim().is_empty() {
            return Err(EdlError::InvalidBootstrapToken(
                "trusted_header is required when ip_strategy=custom".into(),
            ));
        }
        Ok(())
    }
}

fn random_machine_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_bootstrap_token() {
        let cfg = EdlGuardConfig::new("");
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_custom_strategy_without_header() {
        let cfg = EdlGuardConfig::new("tok").with_ip_strategy(IpStrategy::Custom, "");
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn accepts_custom_strategy_with_header() {
        let cfg = EdlGuardConfig::new("tok").with_ip_strategy(IpStrategy::Custom, "X-Client-Ip");
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn machine_id_is_32_hex_chars() {
        let cfg = EdlGuardConfig::new("tok");
        assert_eq!(cfg.machine_id.len(), 32);
        assert!(cfg.machine_id.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
