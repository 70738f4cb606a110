//! Typed configuration loaded from the environment -- A1.

use crate::error::AppError;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    /// Service-level component of the version clock.
    pub service_version: u32,
    /// Connection target for the authoritative store.
    pub durable_store_url: String,
    /// Connection target for the shared cache.
    pub hot_tier_url: String,
    /// Key used by the external bearer-token verifier.
    pub token_secret: String,
    /// Bind port for the HTTP + upgrade endpoint.
    pub listen_port: u16,
    pub db_max_connections: u32,
    pub hot_tier_max_retries: u32,
    pub request_timeout: Duration,
    pub max_connections: usize,
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        Ok(Self {
            service_version: std::env::var("SERVICE_VERSION")
                .unwrap_or_else(|_| "1".to_string())
                .parse()
                .map_err(|e| AppError::Fatal(format!("invalid SERVICE_VERSION: {e}")))?,
            durable_store_url: std::env::var("DURABLE_STORE_URL")
                .map_err(|_| AppError::Fatal("DURABLE_STORE_URL is required".into()))?,
            hot_tier_url: std::env::var("HOT_TIER_URL")
                .map_err(|_| AppError::Fatal("HOT_TIER_URL is required".into()))?,
            token_secret: std::env::var("TOKEN_SECRET")
                .map_err(|_| AppError::Fatal("TOKEN_SECRET is required".into()))?,
            listen_port: std::env::var("LISTEN_PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()
                .map_err(|e| AppError::Fatal(format!("invalid LISTEN_PORT: {e}")))?,
            db_max_connections: std::env::var("DB_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "20".to_string())
                .parse()
                .unwrap_or(20),
            hot_tier_max_retries: std::env::var("HOT_TIER_MAX_RETRIES")
                .unwrap_or_else(|_| "3".to_string())
                .parse()
                .unwrap_or(3),
            request_timeout: Duration::from_secs(
                std::env::var("REQUEST_TIMEOUT_SECS")
                    .unwrap_or_else(|_| "30".to_string())
                    .parse()
                    .unwrap_or(30),
            ),
            max_connections: std::env::var("MAX_CONNECTIONS")
                .unwrap_or_else(|_| "10000".to_string())
                .parse()
                .unwrap_or(10000),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn set_required_vars() {
        std::env::set_var("DURABLE_STORE_URL", "postgres://localhost/test");
        std::env::set_var("HOT_TIER_URL", "redis://localhost");
        std::env::set_var("TOKEN_SECRET", "shh");
    }

    fn clear_all_vars() {
        for var in [
            "SERVICE_VERSION",
            "DURABLE_STORE_URL",
            "HOT_TIER_URL",
            "TOKEN_SECRET",
            "LISTEN_PORT",
        ] {
            std::env::remove_var(var);
        }
    }

    #[test]
    fn from_env_fails_fast_when_a_required_var_is_missing() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_all_vars();
        let result = Config::from_env();
        assert!(matches!(result, Err(AppError::Fatal(_))));
    }

    #[test]
    fn from_env_applies_documented_defaults() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_all_vars();
        set_required_vars();
        let config = Config::from_env().unwrap();
        assert_eq!(config.listen_port, 8080);
        assert_eq!(config.service_version, 1);
        assert_eq!(config.max_connections, 10000);
        clear_all_vars();
    }
}
