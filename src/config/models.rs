//! Configuration data structures for Sandgate.
//!
//! These types map directly to YAML (also JSON / TOML) configuration
//! files. They are serde-friendly and carry defaults so minimal configs
//! stay concise. The whole tree is threaded into component constructors
//! as an `Arc<GatewayConfig>`; there is no process-wide singleton.
use serde::{Deserialize, Serialize};

/// Admin listener and API key settings.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct AppConfig {
    /// Admin listener port.
    pub port: u16,
    /// Verbose per-request logging on the data path.
    pub debug: bool,
    /// Key checked on the gateway listener.
    pub gateway_key: String,
    /// Key checked on the admin listener.
    pub admin_key: String,
    /// Legacy shared key, the fallback for both listeners.
    pub key: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            port: 8195,
            debug: true,
            gateway_key: String::new(),
            admin_key: String::new(),
            key: "sandgate".to_string(),
        }
    }
}

/// Outbound proxy settings, reserved for the proxy handler extension.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct ProxyConfig {
    pub socks5: String,
    pub http: String,
    pub https: String,
}

/// Data-plane listener settings.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct GatewaySection {
    /// Gateway listener port.
    pub port: u16,
    /// `least-connections`, `round-robin`, or `random`.
    pub load_balancer_strategy: String,
    /// Seconds between sandbox health probes.
    pub health_check_interval: u64,
    pub cors_enabled: bool,
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            port: 8080,
            load_balancer_strategy: "least-connections".to_string(),
            health_check_interval: 15,
            cors_enabled: true,
        }
    }
}

/// Shared store coordinates.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct RedisConfig {
    pub addr: String,
    pub password: String,
    pub db: i64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            addr: "localhost:6379".to_string(),
            password: String::new(),
            db: 0,
        }
    }
}

/// Full gateway configuration.
///
/// The worker-tuning fields (`max_workers` through `allowed_syscalls`)
/// are consumed by the external sandbox layer; the gateway only carries
/// them so a single file configures the whole deployment.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct GatewayConfig {
    pub app: AppConfig,
    pub max_workers: u32,
    pub max_requests: u32,
    pub worker_timeout: u64,
    pub enable_network: bool,
    pub enable_preload: bool,
    pub allowed_syscalls: Vec<String>,
    pub proxy: ProxyConfig,
    pub gateway: GatewaySection,
    pub redis: RedisConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            app: AppConfig::default(),
            max_workers: 4,
            max_requests: 50,
            worker_timeout: 5,
            enable_network: true,
            enable_preload: false,
            allowed_syscalls: Vec::new(),
            proxy: ProxyConfig::default(),
            gateway: GatewaySection::default(),
            redis: RedisConfig::default(),
        }
    }
}

impl GatewayConfig {
    /// Key expected on the gateway listener: `gateway_key`, falling back
    /// to the legacy shared key.
    pub fn gateway_api_key(&self) -> &str {
        if self.app.gateway_key.is_empty() {
            &self.app.key
        } else {
            &self.app.gateway_key
        }
    }

    /// Key expected on the admin listener: `admin_key`, falling back to
    /// the legacy shared key.
    pub fn admin_api_key(&self) -> &str {
        if self.app.admin_key.is_empty() {
            &self.app.key
        } else {
            &self.app.admin_key
        }
    }

    /// Boot-time sanity checks. Failure here is fatal.
    pub fn validate(&self) -> Result<(), String> {
        if self.app.port == 0 {
            return Err("app.port must be non-zero".to_string());
        }
        if self.gateway.port == 0 {
            return Err("gateway.port must be non-zero".to_string());
        }
        if self.app.port == self.gateway.port {
            return Err("app.port and gateway.port must differ".to_string());
        }
        match self.gateway.load_balancer_strategy.as_str() {
            "least-connections" | "round-robin" | "random" => {}
            other => {
                return Err(format!(
                    "gateway.load_balancer_strategy must be one of least-connections, \
                     round-robin, random (got '{other}')"
                ));
            }
        }
        if self.gateway.health_check_interval == 0 {
            return Err("gateway.health_check_interval must be non-zero".to_string());
        }
        if self.redis.addr.is_empty() {
            return Err("redis.addr must not be empty".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = GatewayConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.app.port, 8195);
        assert_eq!(config.gateway.port, 8080);
        assert_eq!(config.gateway.load_balancer_strategy, "least-connections");
        assert_eq!(config.gateway.health_check_interval, 15);
    }

    #[test]
    fn dedicated_keys_take_precedence_over_legacy() {
        let mut config = GatewayConfig::default();
        config.app.key = "legacy".to_string();
        assert_eq!(config.gateway_api_key(), "legacy");
        assert_eq!(config.admin_api_key(), "legacy");

        config.app.gateway_key = "gw".to_string();
        config.app.admin_key = "adm".to_string();
        assert_eq!(config.gateway_api_key(), "gw");
        assert_eq!(config.admin_api_key(), "adm");
    }

    #[test]
    fn validate_rejects_bad_strategy_and_ports() {
        let mut config = GatewayConfig::default();
        config.gateway.load_balancer_strategy = "weighted".to_string();
        assert!(config.validate().is_err());

        let mut config = GatewayConfig::default();
        config.gateway.port = config.app.port;
        assert!(config.validate().is_err());
    }
}
