use config_validator::{env_or, env_parse_or, env_set_or, require_env, ConfigError};

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub bus_type: String,
    pub nats_url: String,
    pub http_port: u16,
    pub bus_auth_token: String,
    pub is_test: bool,
    pub silence_timeout_seconds: i64,
    /// The single configuration value both the coordinator and every
    /// participant's evaluator consume, per spec.md §9's "expected-services
    /// configuration drift" design note.
    pub expected_services_for_deletion: Vec<String>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            database_url: require_env("DATABASE_URL")?,
            bus_type: env_or("BUS_TYPE", "inmemory"),
            nats_url: env_or("NATS_URL", "nats://localhost:4222"),
            http_port: env_parse_or("HTTP_PORT", 8082)?,
            bus_auth_token: env_or("BUS_AUTH_TOKEN", "dev-shared-token"),
            is_test: env_or("APP_ENV", "development") == "test",
            silence_timeout_seconds: env_parse_or("SILENCE_TIMEOUT_SECONDS", 60)?,
            expected_services_for_deletion: env_set_or(
                "EXPECTED_SERVICES_FOR_DELETION",
                &["billing", "inventory", "payment"],
            ),
        })
    }
}
