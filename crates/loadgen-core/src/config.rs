use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::warn;

/// Root config (matches the YAML layout).
///
/// Loading never fails: defaults are filled in first, the YAML file (if any)
/// overlays them, and environment variables win last.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub services: ServicesConfig,
    pub chaos: ChaosConfig,
    pub web_port: u16,
    pub metrics_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServicesConfig {
    pub user_service: ServiceConfig,
    pub chat_service: ServiceConfig,
    pub posts_service: ServiceConfig,
    pub profile_service: ServiceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub base_url: String,
    /// Request timeout, e.g. "10s".
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl ServiceConfig {
    fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.to_string(),
            timeout: Duration::from_secs(10),
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self::new("http://localhost:8080")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChaosConfig {
    /// Probability of rewriting a successful response to a 500.
    pub error_rate: f64,
    /// Probability of injecting a delay before a request.
    pub delay_rate: f64,
    /// Upper bound (exclusive) for injected delays in milliseconds.
    pub max_delay_ms: u64,
}

impl Default for ChaosConfig {
    fn default() -> Self {
        Self {
            error_rate: 0.1,
            delay_rate: 0.15,
            max_delay_ms: 1000,
        }
    }
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            user_service: ServiceConfig::new("http://localhost:8080"),
            chat_service: ServiceConfig::new("http://localhost:3001"),
            posts_service: ServiceConfig::new("http://localhost:8083"),
            profile_service: ServiceConfig::new("http://localhost:8081"),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            services: ServicesConfig::default(),
            chaos: ChaosConfig::default(),
            web_port: 3002,
            metrics_port: 9090,
        }
    }
}

impl Config {
    /// Load configuration from `path` with environment overrides.
    ///
    /// A missing or malformed file is ignored and defaults are used instead.
    pub fn load(path: impl AsRef<Path>) -> Self {
        let mut config = match std::fs::read_to_string(path.as_ref()) {
            Ok(contents) => match serde_yaml::from_str(&contents) {
                Ok(config) => config,
                Err(e) => {
                    warn!(path = %path.as_ref().display(), "ignoring malformed config file: {e}");
                    Config::default()
                }
            },
            Err(_) => Config::default(),
        };
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("USER_SERVICE_URL") {
            self.services.user_service.base_url = url;
        }
        if let Ok(url) = std::env::var("CHAT_SERVICE_URL") {
            self.services.chat_service.base_url = url;
        }
        if let Ok(url) = std::env::var("POSTS_SERVICE_URL") {
            self.services.posts_service.base_url = url;
        }
        if let Ok(url) = std::env::var("PROFILE_SERVICE_URL") {
            self.services.profile_service.base_url = url;
        }
        if let Ok(rate) = std::env::var("CHAOS_ERROR_RATE") {
            match rate.parse() {
                Ok(rate) => self.chaos.error_rate = rate,
                Err(_) => warn!("ignoring invalid CHAOS_ERROR_RATE: {rate}"),
            }
        }
        if let Ok(rate) = std::env::var("CHAOS_DELAY_RATE") {
            match rate.parse() {
                Ok(rate) => self.chaos.delay_rate = rate,
                Err(_) => warn!("ignoring invalid CHAOS_DELAY_RATE: {rate}"),
            }
        }
        if let Ok(delay) = std::env::var("CHAOS_MAX_DELAY_MS") {
            match delay.parse() {
                Ok(delay) => self.chaos.max_delay_ms = delay,
                Err(_) => warn!("ignoring invalid CHAOS_MAX_DELAY_MS: {delay}"),
            }
        }
        if let Ok(port) = std::env::var("WEB_PORT") {
            match port.parse() {
                Ok(port) => self.web_port = port,
                Err(_) => warn!("ignoring invalid WEB_PORT: {port}"),
            }
        }
        if let Ok(port) = std::env::var("METRICS_PORT") {
            match port.parse() {
                Ok(port) => self.metrics_port = port,
                Err(_) => warn!("ignoring invalid METRICS_PORT: {port}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_all_services() {
        let config = Config::default();
        assert_eq!(config.services.user_service.base_url, "http://localhost:8080");
        assert_eq!(config.services.chat_service.base_url, "http://localhost:3001");
        assert_eq!(config.services.posts_service.base_url, "http://localhost:8083");
        assert_eq!(config.services.profile_service.base_url, "http://localhost:8081");
        assert_eq!(config.services.user_service.timeout, Duration::from_secs(10));
        assert_eq!(config.web_port, 3002);
        assert_eq!(config.metrics_port, 9090);
    }

    #[test]
    fn yaml_overlays_defaults() {
        let config_str = r#"
services:
  user_service:
    base_url: "http://user.svc:9000"
    timeout: 5s
chaos:
  error_rate: 0.5
web_port: 4000
"#;
        let config: Config = serde_yaml::from_str(config_str).unwrap();
        assert_eq!(config.services.user_service.base_url, "http://user.svc:9000");
        assert_eq!(config.services.user_service.timeout, Duration::from_secs(5));
        // untouched fields keep their defaults
        assert_eq!(config.services.chat_service.base_url, "http://localhost:3001");
        assert_eq!(config.chaos.error_rate, 0.5);
        assert_eq!(config.chaos.delay_rate, 0.15);
        assert_eq!(config.web_port, 4000);
        assert_eq!(config.metrics_port, 9090);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let config = Config::load("/nonexistent/loadgen.yaml");
        assert_eq!(config.web_port, 3002);
    }

    #[test]
    fn malformed_file_yields_defaults() {
        let path = std::env::temp_dir().join("loadgen-config-malformed-test.yaml");
        std::fs::write(&path, ": not : valid : yaml [").unwrap();
        let config = Config::load(&path);
        assert_eq!(config.metrics_port, 9090);
        std::fs::remove_file(&path).ok();
    }
}
