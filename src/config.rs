use dotenvy::dotenv;
use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct JwtConfig {
    pub secret: String,
    pub issuer: Option<String>,
}

/// Bounds applied by the router and the conversation registry.
#[derive(Debug, Clone)]
pub struct LimitsConfig {
    pub max_group_participants: usize,
    pub max_message_length: usize,
    pub message_rate_per_second: u32,
    pub message_rate_burst: u32,
    pub typing_broadcast_interval: Duration,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_group_participants: 256,
            max_message_length: 10_000,
            message_rate_per_second: 10,
            message_rate_burst: 20,
            typing_broadcast_interval: Duration::from_millis(2000),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    /// `None` selects the in-memory store.
    pub database_url: Option<String>,
    pub db_max_connections: usize,
    pub jwt: JwtConfig,
    /// Per-session outbound queue capacity.
    pub ws_outbound_buffer: usize,
    pub limits: LimitsConfig,
    pub log_json: bool,
}

fn parse_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Result<Self, crate::error::AppError> {
        dotenv().ok();

        let database_url = env::var("DATABASE_URL")
            .ok()
            .filter(|s| !s.trim().is_empty());

        let secret = env::var("JWT_SECRET")
            .map_err(|_| crate::error::AppError::Config("JWT_SECRET missing".into()))?;
        if secret.trim().is_empty() {
            return Err(crate::error::AppError::Config(
                "JWT_SECRET must not be empty".into(),
            ));
        }
        let issuer = env::var("JWT_ISSUER").ok().filter(|s| !s.is_empty());

        let defaults = LimitsConfig::default();
        let limits = LimitsConfig {
            max_group_participants: parse_or(
                "MAX_GROUP_PARTICIPANTS",
                defaults.max_group_participants,
            ),
            max_message_length: parse_or("MAX_MESSAGE_LENGTH", defaults.max_message_length),
            message_rate_per_second: parse_or(
                "MESSAGE_RATE_PER_SECOND",
                defaults.message_rate_per_second,
            ),
            message_rate_burst: parse_or("MESSAGE_RATE_BURST", defaults.message_rate_burst),
            typing_broadcast_interval: Duration::from_millis(parse_or(
                "TYPING_BROADCAST_INTERVAL_MS",
                defaults.typing_broadcast_interval.as_millis() as u64,
            )),
        };

        if limits.max_group_participants < 2 {
            return Err(crate::error::AppError::Config(
                "MAX_GROUP_PARTICIPANTS must be at least 2".into(),
            ));
        }

        let ws_outbound_buffer = parse_or("WS_OUTBOUND_BUFFER", 256usize);
        if ws_outbound_buffer == 0 {
            return Err(crate::error::AppError::Config(
                "WS_OUTBOUND_BUFFER must be greater than zero".into(),
            ));
        }

        Ok(Self {
            port: parse_or("PORT", 3000),
            database_url,
            db_max_connections: parse_or("DB_MAX_CONNECTIONS", 16),
            jwt: JwtConfig { secret, issuer },
            ws_outbound_buffer,
            limits,
            log_json: env::var("LOG_FORMAT")
                .map(|v| v.eq_ignore_ascii_case("json"))
                .unwrap_or(false),
        })
    }

    pub fn test_defaults() -> Self {
        Self {
            port: 0,
            database_url: None,
            db_max_connections: 4,
            jwt: JwtConfig {
                secret: "test-secret".into(),
                issuer: None,
            },
            ws_outbound_buffer: 64,
            limits: LimitsConfig::default(),
            log_json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clear_env() {
        for key in [
            "DATABASE_URL",
            "JWT_SECRET",
            "JWT_ISSUER",
            "PORT",
            "WS_OUTBOUND_BUFFER",
            "MAX_GROUP_PARTICIPANTS",
            "TYPING_BROADCAST_INTERVAL_MS",
        ] {
            env::remove_var(key);
        }
    }

    #[test]
    #[serial_test::serial]
    fn missing_jwt_secret_is_a_config_error() {
        clear_env();
        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, crate::error::AppError::Config(_)));
    }

    #[test]
    #[serial_test::serial]
    fn defaults_select_memory_store() {
        clear_env();
        env::set_var("JWT_SECRET", "s3cret");

        let cfg = Config::from_env().unwrap();
        assert!(cfg.database_url.is_none());
        assert_eq!(cfg.port, 3000);
        assert_eq!(cfg.ws_outbound_buffer, 256);
        assert_eq!(cfg.limits.max_group_participants, 256);
        assert_eq!(
            cfg.limits.typing_broadcast_interval,
            Duration::from_millis(2000)
        );

        clear_env();
    }

    #[test]
    #[serial_test::serial]
    fn overrides_are_parsed() {
        clear_env();
        env::set_var("JWT_SECRET", "s3cret");
        env::set_var("PORT", "8080");
        env::set_var("TYPING_BROADCAST_INTERVAL_MS", "500");
        env::set_var("DATABASE_URL", "postgres://localhost/chat");

        let cfg = Config::from_env().unwrap();
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.limits.typing_broadcast_interval, Duration::from_millis(500));
        assert_eq!(cfg.database_url.as_deref(), Some("postgres://localhost/chat"));

        clear_env();
    }

    #[test]
    #[serial_test::serial]
    fn zero_outbound_buffer_is_rejected() {
        clear_env();
        env::set_var("JWT_SECRET", "s3cret");
        env::set_var("WS_OUTBOUND_BUFFER", "0");

        assert!(Config::from_env().is_err());

        clear_env();
    }
}
