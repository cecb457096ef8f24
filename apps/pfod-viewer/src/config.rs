use std::env;
#[cfg(test)]
use std::sync::Mutex;

use pfod_transport::HttpTransportConfig;
use thiserror::Error;
use url::Url;

const DEFAULT_TARGET: &str = "http://127.0.0.1/";
const DEFAULT_IDENTIFIER: &str = "pfodWeb";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid device address {value:?}: {reason}")]
    InvalidTarget { value: String, reason: String },
    #[error("{var} must be a non-negative integer, got {value:?}")]
    InvalidNumber { var: &'static str, value: String },
}

/// Viewer configuration
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Device base address; commands go to `{target}pfodWeb?cmd=...`
    pub target: String,
    /// Seconds to wait for each response, clamped to 30; 0 waits a minute
    pub response_timeout_secs: u64,
    pub max_retries: u32,
    /// Touch identifier used until a menu supplies one
    pub identifier: String,
    /// Open this drawing directly instead of probing the main menu
    pub initial_drawing: Option<String>,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Ok(target) = env::var("PFOD_TARGET") {
            config.target = parse_target(&target)?.to_string();
        }
        if let Some(secs) = env_number("PFOD_TIMEOUT")? {
            config.response_timeout_secs = secs;
        }
        if let Some(retries) = env_number("PFOD_MAX_RETRIES")? {
            config.max_retries = u32::try_from(retries).map_err(|_| ConfigError::InvalidNumber {
                var: "PFOD_MAX_RETRIES",
                value: retries.to_string(),
            })?;
        }
        if let Ok(identifier) = env::var("PFOD_IDENTIFIER") {
            if !identifier.trim().is_empty() {
                config.identifier = identifier.trim().to_string();
            }
        }
        config.initial_drawing = env::var("PFOD_DRAWING")
            .ok()
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty());
        Ok(config)
    }

    pub fn http_config(&self) -> Result<HttpTransportConfig, ConfigError> {
        let mut http = HttpTransportConfig::new(parse_target(&self.target)?);
        http.response_timeout =
            HttpTransportConfig::response_timeout_from_secs(self.response_timeout_secs);
        http.max_retries = self.max_retries;
        Ok(http)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            target: DEFAULT_TARGET.to_string(),
            response_timeout_secs: 3,
            max_retries: 2,
            identifier: DEFAULT_IDENTIFIER.to_string(),
            initial_drawing: None,
        }
    }
}

/// Accepts bare hosts (`192.168.1.20`) as well as full URLs.
pub fn parse_target(value: &str) -> Result<Url, ConfigError> {
    let trimmed = value.trim();
    let candidate = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("http://{trimmed}")
    };
    let mut url = Url::parse(&candidate).map_err(|err| ConfigError::InvalidTarget {
        value: value.to_string(),
        reason: err.to_string(),
    })?;
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

fn env_number(var: &'static str) -> Result<Option<u64>, ConfigError> {
    match env::var(var) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidNumber { var, value }),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::LazyLock;
    use std::time::Duration;

    // Mutex to ensure environment variable tests don't run in parallel
    static ENV_MUTEX: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

    const VARS: &[&str] = &[
        "PFOD_TARGET",
        "PFOD_TIMEOUT",
        "PFOD_MAX_RETRIES",
        "PFOD_IDENTIFIER",
        "PFOD_DRAWING",
    ];

    fn clear_env() {
        unsafe {
            for var in VARS {
                env::remove_var(var);
            }
        }
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.target, "http://127.0.0.1/");
        assert_eq!(config.identifier, "pfodWeb");
        assert_eq!(
            config.http_config().unwrap().response_timeout,
            Duration::from_secs(3)
        );
    }

    #[test]
    fn test_config_from_env_default() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        assert_eq!(Config::from_env(), Ok(Config::default()));
    }

    #[test]
    fn test_config_from_env_custom() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        unsafe {
            env::set_var("PFOD_TARGET", "192.168.1.20:8080");
            env::set_var("PFOD_TIMEOUT", "0");
            env::set_var("PFOD_MAX_RETRIES", "5");
            env::set_var("PFOD_DRAWING", " gauge ");
        }
        let config = Config::from_env().unwrap();
        clear_env();

        assert_eq!(config.target, "http://192.168.1.20:8080/");
        assert_eq!(config.initial_drawing.as_deref(), Some("gauge"));
        let http = config.http_config().unwrap();
        assert_eq!(http.response_timeout, Duration::from_secs(60));
        assert_eq!(http.max_retries, 5);
    }

    #[test]
    fn test_config_rejects_bad_numbers() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        unsafe {
            env::set_var("PFOD_TIMEOUT", "soon");
        }
        let result = Config::from_env();
        clear_env();
        assert_eq!(
            result,
            Err(ConfigError::InvalidNumber {
                var: "PFOD_TIMEOUT",
                value: "soon".into()
            })
        );
    }

    #[test]
    fn test_target_keeps_path_as_directory() {
        let url = parse_target("https://device.local/sub").unwrap();
        assert_eq!(url.as_str(), "https://device.local/sub/");
    }
}
