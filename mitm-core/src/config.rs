//! Configuration types and utilities

use crate::error::MitmError;
use crate::transport::route::{DownstreamProxy, ProxyRoute};
use crate::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Packets larger than this are forwarded without interception.
pub const DEFAULT_PACKET_LIMIT: usize = 80 * 1024 * 1024;

/// Session startup configuration.
///
/// Carried by the first message of a session. Everything here is fixed for
/// the session lifetime except the downstream proxy and routes, which can be
/// swapped at runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Address to listen on
    pub listen_host: String,
    /// Port to listen on
    pub listen_port: u16,
    /// Upstream TLS behaviour
    pub tls: TlsSettings,
    /// Default downstream proxy; blank or "0" disables chaining
    pub downstream_proxy: String,
    /// Host pattern routing table, consulted before the default proxy
    pub proxy_routes: Vec<ProxyRoute>,
    /// Domain to address overrides; SNI still carries the domain
    pub host_mapping: HashMap<String, String>,
    pub enable_http2: bool,
    /// Start with manual hijack mode switched on
    pub enable_manual_hijack: bool,
    /// Skip websocket traffic entirely (no hijack, no storage)
    pub filter_websocket: bool,
    pub packet_limit: usize,
    /// Plugins to load at startup
    pub plugins: Vec<String>,
    pub plugin_params: HashMap<String, String>,
    pub engine: EngineSettings,
    /// Admin API port, disabled when absent
    pub admin_port: Option<u16>,
    /// Where the CA and persisted rule blobs live
    pub data_dir: Option<PathBuf>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            listen_host: "127.0.0.1".to_string(),
            listen_port: 8089,
            tls: TlsSettings::default(),
            downstream_proxy: String::new(),
            proxy_routes: Vec::new(),
            host_mapping: HashMap::new(),
            enable_http2: false,
            enable_manual_hijack: false,
            filter_websocket: false,
            packet_limit: DEFAULT_PACKET_LIMIT,
            plugins: Vec::new(),
            plugin_params: HashMap::new(),
            engine: EngineSettings::default(),
            admin_port: None,
            data_dir: None,
        }
    }
}

impl SessionConfig {
    /// Checks everything that must fail the whole session start.
    pub fn validate(&self) -> Result<()> {
        if self.listen_host.trim().is_empty() {
            return Err(MitmError::Configuration("listen host is empty".to_string()));
        }
        DownstreamProxy::parse(&self.downstream_proxy)?;
        for route in &self.proxy_routes {
            route.validate()?;
        }
        for (domain, addr) in &self.host_mapping {
            if domain.trim().is_empty() || addr.trim().is_empty() {
                return Err(MitmError::Configuration(format!(
                    "invalid host mapping {:?} -> {:?}",
                    domain, addr
                )));
            }
        }
        for cert in &self.tls.client_certificates {
            if cert.cert_pem.trim().is_empty() || cert.key_pem.trim().is_empty() {
                return Err(MitmError::Configuration(
                    "client certificate requires both certificate and key".to_string(),
                ));
            }
        }
        if self.engine.hook_concurrency == 0 {
            return Err(MitmError::Configuration(
                "hook concurrency must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.listen_host, self.listen_port)
    }
}

/// Upstream TLS settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsSettings {
    pub mode: TlsMode,
    /// Certificates presented to upstream servers (mutual TLS)
    pub client_certificates: Vec<ClientCertificate>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum TlsMode {
    #[default]
    Standard,
    /// GM-TLS. `prefer` tries GM first and falls back, `only` never falls back.
    Gm { prefer: bool, only: bool },
}

/// A client certificate for mutual TLS
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientCertificate {
    pub cert_pem: String,
    pub key_pem: String,
    /// CAs used to verify the upstream server when this certificate is used
    #[serde(default)]
    pub ca_pems: Vec<String>,
    /// Wildcard host pattern; empty applies to every host
    #[serde(default)]
    pub host_pattern: String,
}

/// Engine tuning knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Max concurrently executing plugin invocations
    pub hook_concurrency: usize,
    pub hook_timeout_secs: u64,
    pub plugin_load_timeout_secs: u64,
    /// Replacer invocations slower than this are reported
    pub slow_rule_threshold_ms: u64,
    pub flow_save_attempts: u32,
    pub flow_retry_jitter_ms: u64,
    pub connect_timeout_secs: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            hook_concurrency: 20,
            hook_timeout_secs: 30,
            plugin_load_timeout_secs: 10,
            slow_rule_threshold_ms: 300,
            flow_save_attempts: 3,
            flow_retry_jitter_ms: 300,
            connect_timeout_secs: 15,
        }
    }
}

impl EngineSettings {
    pub fn hook_timeout(&self) -> Duration {
        Duration::from_secs(self.hook_timeout_secs.max(1))
    }

    pub fn plugin_load_timeout(&self) -> Duration {
        Duration::from_secs(self.plugin_load_timeout_secs.max(1))
    }

    pub fn slow_rule_threshold(&self) -> Duration {
        Duration::from_millis(self.slow_rule_threshold_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = SessionConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.engine.hook_concurrency, 20);
        assert_eq!(config.engine.slow_rule_threshold(), Duration::from_millis(300));
        assert_eq!(config.packet_limit, DEFAULT_PACKET_LIMIT);
    }

    #[test]
    fn test_proxy_without_port_is_rejected() {
        let config = SessionConfig {
            downstream_proxy: "http://127.0.0.1".to_string(),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(MitmError::Configuration(_))));
    }

    #[test]
    fn test_unparsable_proxy_is_rejected() {
        let config = SessionConfig {
            downstream_proxy: "http://[::1:8080".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_proxy_means_none() {
        let config = SessionConfig {
            downstream_proxy: "0".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: SessionConfig =
            serde_json::from_str(r#"{"listen_port": 9000, "tls": {"mode": {"kind": "gm", "prefer": true, "only": false}}}"#)
                .unwrap();
        assert_eq!(config.listen_port, 9000);
        assert_eq!(config.listen_host, "127.0.0.1");
        assert_eq!(config.tls.mode, TlsMode::Gm { prefer: true, only: false });
        assert_eq!(config.engine.flow_save_attempts, 3);
    }
}
