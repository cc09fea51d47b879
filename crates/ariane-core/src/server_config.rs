use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tracing::info;

pub const SERVER_CONFIG_PATH: &str = "server-config.yaml";

pub const DEFAULT_SERVER_ADDRESS: &str = "127.0.0.1";
pub const DEFAULT_SERVER_PORT: u16 = 8080;
pub const DEFAULT_VERSION: &str = "0.0.1-dirty";
pub const DEFAULT_RUN_DELAY: Duration = Duration::from_secs(30);
pub const DEFAULT_CLIENT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_RETRY_ATTEMPTS: u32 = 3;

/// Process-level configuration, read once at startup from
/// `server-config.yaml` or, when the file is absent, from the environment.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub server: HttpConfig,
    #[serde(default)]
    pub github: GithubConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default = "default_version")]
    pub version: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_address")]
    pub address: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GithubConfig {
    #[serde(default)]
    pub v3_api_url: String,
    #[serde(default)]
    pub app: AppConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub integration_id: u64,
    #[serde(default)]
    pub webhook_secret: String,
    #[serde(default)]
    pub private_key: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    /// Delay between rerunning the Commit Status Start job and rerunning
    /// failed jobs.
    #[serde(rename = "runDelay", default = "default_run_delay", with = "duration_str")]
    pub run_delay: Duration,
    #[serde(rename = "timeout", default = "default_timeout", with = "duration_str")]
    pub timeout: Duration,
    #[serde(rename = "maxRetryAttempts", default = "default_max_retry_attempts")]
    pub max_retry_attempts: u32,
}

fn default_address() -> String {
    DEFAULT_SERVER_ADDRESS.to_string()
}
fn default_port() -> u16 {
    DEFAULT_SERVER_PORT
}
fn default_version() -> String {
    DEFAULT_VERSION.to_string()
}
fn default_run_delay() -> Duration {
    DEFAULT_RUN_DELAY
}
fn default_timeout() -> Duration {
    DEFAULT_CLIENT_TIMEOUT
}
fn default_max_retry_attempts() -> u32 {
    DEFAULT_MAX_RETRY_ATTEMPTS
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            port: default_port(),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            run_delay: default_run_delay(),
            timeout: default_timeout(),
            max_retry_attempts: default_max_retry_attempts(),
        }
    }
}

impl ServerConfig {
    /// Read the config file at `path`, falling back to environment
    /// variables when it does not exist.
    pub fn read(path: &str) -> Result<Self> {
        if !std::path::Path::new(path).exists() {
            info!("server config file not found, using environment variables");
            return Self::from_env();
        }
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed reading server config file {path}"))?;
        serde_yaml::from_str(&contents).context("failed parsing configuration file")
    }

    pub fn from_env() -> Result<Self> {
        let mut config = Self {
            server: HttpConfig::default(),
            github: GithubConfig::default(),
            client: ClientConfig::default(),
            version: default_version(),
        };

        config.github.v3_api_url = env_str("GITHUB_V3_API_URL", "");
        config.github.app.webhook_secret = env_str("GITHUB_APP_WEBHOOK_SECRET", "");
        // private keys arrive with escaped newlines from most env tooling
        config.github.app.private_key =
            env_str("GITHUB_APP_PRIVATE_KEY", "").replace("\\n", "\n");
        if let Some(id) = env_parse::<u64>("GITHUB_APP_INTEGRATION_ID") {
            config.github.app.integration_id = id;
        }

        if config.github.v3_api_url.is_empty()
            || config.github.app.webhook_secret.is_empty()
            || config.github.app.private_key.is_empty()
            || config.github.app.integration_id == 0
        {
            bail!(
                "missing required GitHub app configuration: \
                 GITHUB_V3_API_URL, GITHUB_APP_WEBHOOK_SECRET, GITHUB_APP_PRIVATE_KEY, \
                 or GITHUB_APP_INTEGRATION_ID"
            );
        }

        config.server.address = env_str("ARIANE_SERVER_ADDRESS", DEFAULT_SERVER_ADDRESS);
        if let Some(port) = env_parse::<u16>("ARIANE_SERVER_PORT") {
            config.server.port = port;
        }
        config.version = env_str("ARIANE_VERSION", DEFAULT_VERSION);
        if let Some(delay) = env_duration("ARIANE_RUN_DELAY") {
            config.client.run_delay = delay;
        }
        if let Some(timeout) = env_duration("ARIANE_CLIENT_TIMEOUT") {
            config.client.timeout = timeout;
        }
        if let Some(attempts) = env_parse::<u32>("ARIANE_MAX_RETRY_ATTEMPTS") {
            if attempts > 0 {
                config.client.max_retry_attempts = attempts;
            }
        }

        Ok(config)
    }
}

fn env_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_duration(key: &str) -> Option<Duration> {
    std::env::var(key).ok().and_then(|v| parse_duration(&v).ok())
}

/// Parse a duration like `500ms`, `10s`, `5m` or `2h`.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    let unit_start = s
        .find(|c: char| !c.is_ascii_digit())
        .with_context(|| format!("duration {s:?} is missing a unit"))?;
    let (value, unit) = s.split_at(unit_start);
    let value: u64 = value
        .parse()
        .with_context(|| format!("invalid duration value in {s:?}"))?;
    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 3600)),
        _ => bail!("unknown duration unit {unit:?} in {s:?}"),
    }
}

mod duration_str {
    use super::parse_duration;
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_duration_units() {
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
    }

    #[test]
    fn parse_duration_rejects_garbage() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("10").is_err());
        assert!(parse_duration("10d").is_err());
        assert!(parse_duration("s").is_err());
    }

    #[test]
    fn yaml_config_with_durations() {
        let cfg: ServerConfig = serde_yaml::from_str(
            r#"
server:
  address: 0.0.0.0
  port: 9090
github:
  v3_api_url: https://api.github.com
  app:
    integration_id: 42
    webhook_secret: hush
    private_key: pem
client:
  runDelay: 45s
  timeout: 3s
  maxRetryAttempts: 5
version: 1.2.3
"#,
        )
        .unwrap();
        assert_eq!(cfg.server.address, "0.0.0.0");
        assert_eq!(cfg.server.port, 9090);
        assert_eq!(cfg.client.run_delay, Duration::from_secs(45));
        assert_eq!(cfg.client.timeout, Duration::from_secs(3));
        assert_eq!(cfg.client.max_retry_attempts, 5);
        assert_eq!(cfg.version, "1.2.3");
        assert_eq!(cfg.github.app.integration_id, 42);
    }

    #[test]
    fn yaml_defaults_apply() {
        let cfg: ServerConfig = serde_yaml::from_str("github:\n  v3_api_url: x\n").unwrap();
        assert_eq!(cfg.server.address, DEFAULT_SERVER_ADDRESS);
        assert_eq!(cfg.server.port, DEFAULT_SERVER_PORT);
        assert_eq!(cfg.client.run_delay, DEFAULT_RUN_DELAY);
        assert_eq!(cfg.version, DEFAULT_VERSION);
    }
}
