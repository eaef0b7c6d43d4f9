//! Application configuration loaded from environment variables and config files.
//!
//! Supports `.env` files for development and environment variables for
//! production. Config precedence: env vars > .env file > config.toml > defaults

use serde::Deserialize;
use std::sync::OnceLock;

static CONFIG: OnceLock<AppConfig> = OnceLock::new();

/// Get the global application configuration.
///
/// # Panics
/// Panics if config has not been initialized via [`init`].
pub fn get() -> &'static AppConfig {
    CONFIG
        .get()
        .expect("Config not initialized. Call huddle_common::config::init() first.")
}

/// Initialize the global configuration from environment.
///
/// Should be called once at application startup, before any other code
/// accesses config.
pub fn init() -> Result<&'static AppConfig, config::ConfigError> {
    // Load .env file if present (development)
    let _ = dotenvy::dotenv();

    let cfg = config::Config::builder()
        // Defaults
        .set_default("server.host", "0.0.0.0")?
        .set_default("server.port", 8090)?
        .set_default("auth.token_leeway_secs", 30)?
        .set_default("relay.heartbeat_interval_ms", 45_000)?
        .set_default("relay.max_message_bytes", 65_536)?
        // Optional config file
        .add_source(config::File::with_name("config").required(false))
        // Environment variables (HUDDLE_SERVER__HOST, HUDDLE_AUTH__JWT_SECRET, etc.)
        .add_source(
            config::Environment::with_prefix("HUDDLE")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    let app_config: AppConfig = cfg.try_deserialize()?;
    Ok(CONFIG.get_or_init(|| app_config))
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub relay: RelayConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AuthConfig {
    /// JWT signing secret (HS256) — should be 256+ bits of entropy.
    /// Issued by the auth service; the relay only validates.
    pub jwt_secret: String,
    /// Clock-skew leeway applied during token validation.
    pub token_leeway_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RelayConfig {
    /// Keepalive interval advertised to clients in the Hello frame.
    pub heartbeat_interval_ms: u64,
    /// Upper bound on a single inbound signaling frame.
    pub max_message_bytes: usize,
}
