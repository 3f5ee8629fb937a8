//! Environment-sourced configuration, in the spirit of the original
//! `internal/infra/initial/env.go` typed-parse helper: each field names its
//! env var and whether it's required, and a single pass over the process
//! environment either produces a complete `Config` or a named error.

#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP push/pop/ack/nack listener, e.g. `0.0.0.0:8080`.
    pub service_addr: String,
    /// Binary subscription TCP listener, e.g. `0.0.0.0:8081`. Not named in
    /// the distilled environment table, which omits a second listener
    /// address despite requiring one for the subscription protocol.
    pub subscriber_addr: String,
    /// Postgres connection string.
    pub psql_source: String,
    /// One of disabled|error|warning|info|debug; unrecognized values fall
    /// back to `info`, matching the original's `GetLogOptions`.
    pub log_level: String,
}

#[derive(Debug, thiserror::Error)]
#[error("required env: {0}")]
pub struct ConfigError(pub String);

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            service_addr: required("SERVICE_ADDR")?,
            subscriber_addr: required("SUBSCRIBER_ADDR")?,
            psql_source: required("PSQL_SOURCE")?,
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }

    /// Maps `log_level` to a `tracing_subscriber::EnvFilter` directive.
    /// `disabled` silences everything; unrecognized values behave like
    /// `info`.
    pub fn tracing_filter(&self) -> &'static str {
        match self.log_level.to_lowercase().as_str() {
            "disabled" => "off",
            "debug" => "debug",
            "warning" => "warn",
            "error" => "error",
            _ => "info",
        }
    }
}

fn required(name: &str) -> Result<String, ConfigError> {
    std::env::var(name).map_err(|_| ConfigError(name.to_string()))
}
