//! Runtime configuration.
//!
//! Settings are layered, later sources winning: built-in defaults, then an
//! optional `config.toml`, then a `.env` file, then real environment
//! variables under the `PARLEY__` prefix. The resolved result is frozen in
//! a process-wide `OnceLock`.

use serde::Deserialize;
use std::sync::OnceLock;

static CONFIG: OnceLock<AppConfig> = OnceLock::new();

/// The process-wide configuration.
///
/// # Panics
/// If [`init`] has not run yet.
pub fn get() -> &'static AppConfig {
    CONFIG
        .get()
        .expect("Config not initialized. Call parley_common::config::init() first.")
}

/// Resolve and freeze the configuration. Call exactly once, early in
/// `main`, before anything touches [`get`].
pub fn init() -> Result<&'static AppConfig, config::ConfigError> {
    // .env is a development convenience; absence is fine
    let _ = dotenvy::dotenv();

    let cfg = config::Config::builder()
        // Defaults
        .set_default("server.host", "0.0.0.0")?
        .set_default("server.port", 8080)?
        .set_default("server.outbound_queue", 256)?
        .set_default("server.handshake_timeout_secs", 10)?
        .set_default("database.url", "")?
        .set_default("database.max_connections", 20)?
        .set_default("database.min_connections", 5)?
        .set_default("ice.stun_urls", vec!["stun:stun.l.google.com:19302".to_string()])?
        .set_default("ice.turn_urls", Vec::<String>::new())?
        .set_default("ice.turn_username", "")?
        .set_default("ice.turn_password", "")?
        .set_default("ice.sfu_enabled", true)?
        .set_default("call.answer_timeout_secs", 15)?
        // config.toml sits between the defaults and the environment
        .add_source(config::File::with_name("config").required(false))
        // PARLEY__SERVER__HOST, PARLEY__DATABASE__URL, and so on
        .add_source(
            config::Environment::with_prefix("PARLEY")
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
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub auth: AuthConfig,
    pub ice: IceConfig,
    pub call: CallConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Per-connection outbound frame queue capacity. A connection that lets
    /// this fill up is considered slow and is dropped.
    pub outbound_queue: usize,
    /// How long a fresh socket may sit unauthenticated before it is closed.
    pub handshake_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL. Empty selects the in-memory store.
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RedisConfig {
    /// Redis connection URL — optional; omit for the in-process bus.
    pub url: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AuthConfig {
    /// JWT signing secret (HS256) — should be 256+ bits of entropy
    pub jwt_secret: String,
}

/// STUN/TURN configuration advertised to call participants and used by the
/// SFU's own peer connections.
#[derive(Debug, Deserialize, Clone)]
pub struct IceConfig {
    pub stun_urls: Vec<String>,
    pub turn_urls: Vec<String>,
    pub turn_username: String,
    pub turn_password: String,
    /// When false, every call is signaled peer-to-peer regardless of size.
    pub sfu_enabled: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CallConfig {
    /// How long a server-initiated renegotiation offer waits for the client's
    /// answer before the negotiation slot is forcibly freed.
    pub answer_timeout_secs: u64,
}
