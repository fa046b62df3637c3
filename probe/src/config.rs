use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub commands: CommandsConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub uuid: UuidConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_host")]
    pub host: String,
    #[serde(default = "default_ws_path")]
    pub ws_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandsConfig {
    /// Wall-clock budget for every external tool run, in seconds.
    #[serde(default = "default_command_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default = "default_backoff_min")]
    pub backoff_min_ms: u64,
    #[serde(default = "default_backoff_max")]
    pub backoff_max_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UuidConfig {
    /// Where the persistent probe identity lives.
    #[serde(default = "default_uuid_path")]
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Optional tracing filter directive for fine-grained control.
    #[serde(default)]
    pub filter: Option<String>,
}

fn default_api_host() -> String {
    "wss://api.netpulse.dev".to_string()
}

fn default_ws_path() -> String {
    "/probes".to_string()
}

fn default_command_timeout() -> u64 {
    30
}

fn default_backoff_min() -> u64 {
    100
}

fn default_backoff_max() -> u64 {
    500
}

fn default_uuid_path() -> String {
    "netpulse-probe.uuid".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            ws_path: default_ws_path(),
        }
    }
}

impl Default for CommandsConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_command_timeout(),
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            backoff_min_ms: default_backoff_min(),
            backoff_max_ms: default_backoff_max(),
        }
    }
}

impl Default for UuidConfig {
    fn default() -> Self {
        Self {
            path: default_uuid_path(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            filter: None,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self, config::ConfigError> {
        let config = config::Config::builder()
            .add_source(config::File::with_name("probe_config").required(false))
            .add_source(config::Environment::with_prefix("NETPULSE").separator("__"))
            .build()?;

        config.try_deserialize()
    }

    pub fn load_or_default() -> Self {
        Self::load().unwrap_or_else(|e| {
            eprintln!("Warning: Failed to load config file: {}. Using defaults.", e);
            Self::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_complete() {
        let config = Config::default();
        assert_eq!(config.commands.timeout_secs, 30);
        assert_eq!(config.reconnect.backoff_min_ms, 100);
        assert_eq!(config.reconnect.backoff_max_ms, 500);
        assert_eq!(config.api.ws_path, "/probes");
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn partial_toml_fills_in_defaults() {
        let config: Config = serde_json::from_str(r#"{"commands": {"timeout_secs": 10}}"#).unwrap();
        assert_eq!(config.commands.timeout_secs, 10);
        assert_eq!(config.api.host, default_api_host());
    }
}
