use std::path::Path;

use config::{Config, File, FileFormat};
use eyre::{Context, Result};

use crate::config::models::GatewayConfig;

/// Load configuration from a file using the config crate.
/// Supports multiple formats: YAML, JSON, TOML.
pub fn load_config(config_path: &str) -> Result<GatewayConfig> {
    let path = Path::new(config_path);

    // Determine file format based on extension
    let format = match path.extension().and_then(|ext| ext.to_str()) {
        Some("yaml") | Some("yml") => FileFormat::Yaml,
        Some("json") => FileFormat::Json,
        Some("toml") => FileFormat::Toml,
        _ => FileFormat::Yaml, // Default to YAML
    };

    let settings = Config::builder()
        .add_source(File::new(
            path.to_str()
                .ok_or_else(|| eyre::eyre!("Invalid UTF-8 path: {}", path.display()))?,
            format,
        ))
        .build()
        .with_context(|| format!("Failed to build config from {}", path.display()))?;

    let gateway_config: GatewayConfig = settings
        .try_deserialize()
        .with_context(|| format!("Failed to deserialize config from {}", path.display()))?;

    Ok(gateway_config)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;

    #[test]
    fn load_yaml_config() {
        let yaml_content = r#"
app:
  port: 9195
  gateway_key: "gw-secret"
gateway:
  port: 9080
  load_balancer_strategy: "round-robin"
redis:
  addr: "redis.internal:6379"
"#;

        let mut temp_file = NamedTempFile::with_suffix(".yaml").unwrap();
        write!(temp_file, "{}", yaml_content).unwrap();

        let config = load_config(temp_file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.app.port, 9195);
        assert_eq!(config.gateway.port, 9080);
        assert_eq!(config.gateway.load_balancer_strategy, "round-robin");
        assert_eq!(config.redis.addr, "redis.internal:6379");
        // Unset sections keep their defaults.
        assert_eq!(config.gateway.health_check_interval, 15);
    }

    #[test]
    fn load_json_config() {
        let json_content = r#"
{
  "app": { "port": 9195, "admin_key": "adm-secret" },
  "gateway": { "port": 9080 }
}
"#;

        let mut temp_file = NamedTempFile::with_suffix(".json").unwrap();
        write!(temp_file, "{}", json_content).unwrap();

        let config = load_config(temp_file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.app.port, 9195);
        assert_eq!(config.admin_api_key(), "adm-secret");
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(load_config("/nonexistent/config.yaml").is_err());
    }
}
