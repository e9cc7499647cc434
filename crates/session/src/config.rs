use std::time::Duration;
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    /// HTTP endpoint that issues session credentials.
    pub token_endpoint: String,
    /// Agent preset to request on connect, if any.
    pub preset_id: Option<String>,
    /// Remote participants whose identity starts with this prefix are
    /// treated as the agent.
    pub agent_identity_prefix: String,
    /// How long a connect attempt may run before it is torn down.
    pub connect_timeout: Duration,
    /// Delay before the single automatic reconnect after an unexpected drop.
    pub reconnect_delay: Duration,
    pub log_level: Level,
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let token_endpoint = std::env::var("TOKEN_ENDPOINT")
            .map_err(|_| ConfigError::MissingVar("TOKEN_ENDPOINT".to_string()))?;

        let preset_id = std::env::var("PRESET_ID").ok().filter(|s| !s.is_empty());

        let agent_identity_prefix =
            std::env::var("AGENT_IDENTITY_PREFIX").unwrap_or_else(|_| "agent".to_string());

        let connect_timeout = parse_secs("CONNECT_TIMEOUT_SECS", 30)?;
        let reconnect_delay = parse_secs("RECONNECT_DELAY_SECS", 3)?;

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        Ok(Self {
            token_endpoint,
            preset_id,
            agent_identity_prefix,
            connect_timeout,
            reconnect_delay,
            log_level,
        })
    }
}

fn parse_secs(var: &str, default: u64) -> Result<Duration, ConfigError> {
    match std::env::var(var) {
        Ok(raw) => raw
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|e| ConfigError::InvalidValue(var.to_string(), e.to_string())),
        Err(_) => Ok(Duration::from_secs(default)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;
    use tracing::Level;

    fn clear_env_vars() {
        unsafe {
            env::remove_var("TOKEN_ENDPOINT");
            env::remove_var("PRESET_ID");
            env::remove_var("AGENT_IDENTITY_PREFIX");
            env::remove_var("CONNECT_TIMEOUT_SECS");
            env::remove_var("RECONNECT_DELAY_SECS");
            env::remove_var("RUST_LOG");
        }
    }

    fn set_minimal_env() {
        unsafe {
            env::set_var("TOKEN_ENDPOINT", "http://localhost:8090/token");
        }
    }

    #[test]
    fn test_config_error_display() {
        let missing_var = ConfigError::MissingVar("TEST_VAR".to_string());
        assert_eq!(
            format!("{}", missing_var),
            "Missing environment variable: TEST_VAR"
        );

        let invalid_value =
            ConfigError::InvalidValue("TEST_VAR".to_string(), "bad_value".to_string());
        assert_eq!(
            format!("{}", invalid_value),
            "Invalid value for environment variable TEST_VAR: bad_value"
        );
    }

    #[test]
    #[serial]
    fn test_config_from_env_minimal() {
        clear_env_vars();
        set_minimal_env();

        let config = Config::from_env().expect("Config should load successfully");

        assert_eq!(config.token_endpoint, "http://localhost:8090/token");
        assert_eq!(config.preset_id, None);
        assert_eq!(config.agent_identity_prefix, "agent");
        assert_eq!(config.connect_timeout, Duration::from_secs(30));
        assert_eq!(config.reconnect_delay, Duration::from_secs(3));
        assert_eq!(config.log_level, Level::INFO);
    }

    #[test]
    #[serial]
    fn test_config_from_env_custom_values() {
        clear_env_vars();
        unsafe {
            env::set_var("TOKEN_ENDPOINT", "https://voice.example.com/token");
            env::set_var("PRESET_ID", "preset-7");
            env::set_var("AGENT_IDENTITY_PREFIX", "assistant");
            env::set_var("CONNECT_TIMEOUT_SECS", "10");
            env::set_var("RECONNECT_DELAY_SECS", "1");
            env::set_var("RUST_LOG", "debug");
        }

        let config = Config::from_env().expect("Config should load successfully");

        assert_eq!(config.token_endpoint, "https://voice.example.com/token");
        assert_eq!(config.preset_id, Some("preset-7".to_string()));
        assert_eq!(config.agent_identity_prefix, "assistant");
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.reconnect_delay, Duration::from_secs(1));
        assert_eq!(config.log_level, Level::DEBUG);
    }

    #[test]
    #[serial]
    fn test_config_missing_token_endpoint() {
        clear_env_vars();

        let err = Config::from_env().unwrap_err();
        match err {
            ConfigError::MissingVar(var) => assert_eq!(var, "TOKEN_ENDPOINT"),
            _ => panic!("Expected MissingVar for TOKEN_ENDPOINT"),
        }
    }

    #[test]
    #[serial]
    fn test_config_empty_preset_is_none() {
        clear_env_vars();
        set_minimal_env();
        unsafe {
            env::set_var("PRESET_ID", "");
        }

        let config = Config::from_env().expect("Config should load successfully");
        assert_eq!(config.preset_id, None);
    }

    #[test]
    #[serial]
    fn test_config_invalid_timeout() {
        clear_env_vars();
        set_minimal_env();
        unsafe {
            env::set_var("CONNECT_TIMEOUT_SECS", "soon");
        }

        let err = Config::from_env().unwrap_err();
        match err {
            ConfigError::InvalidValue(var, _) => assert_eq!(var, "CONNECT_TIMEOUT_SECS"),
            _ => panic!("Expected InvalidValue for CONNECT_TIMEOUT_SECS"),
        }
    }

    #[test]
    #[serial]
    fn test_config_invalid_log_level() {
        clear_env_vars();
        set_minimal_env();
        unsafe {
            env::set_var("RUST_LOG", "not-a-level");
        }

        let err = Config::from_env().unwrap_err();
        match err {
            ConfigError::InvalidValue(var, _) => assert_eq!(var, "RUST_LOG"),
            _ => panic!("Expected InvalidValue for RUST_LOG"),
        }
    }
}
