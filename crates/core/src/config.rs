use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

/// Read a profiled env var: tries {PROFILE}_{KEY} first, falls back to {KEY}.
fn profiled_env_opt(profile: &str, key: &str) -> Option<String> {
    if !profile.is_empty() {
        let prefixed = format!("{}_{}", profile, key);
        if let Some(v) = env_opt(&prefixed) {
            return Some(v);
        }
    }
    env_opt(key)
}

fn profiled_env_or(profile: &str, key: &str, default: &str) -> String {
    profiled_env_opt(profile, key).unwrap_or_else(|| default.to_string())
}

fn profiled_env_u16(profile: &str, key: &str, default: u16) -> u16 {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn profiled_env_u32(profile: &str, key: &str, default: u32) -> u32 {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn profiled_env_u64(profile: &str, key: &str, default: u64) -> u64 {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

// ── Top-level config ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Active profile name (empty = default).
    pub profile: String,
    pub server: ServerConfig,
    pub postgres: PostgresConfig,
    pub nats: NatsConfig,
}

impl Config {
    /// Build config from environment variables (call `load_dotenv()` first).
    /// Profile is read from `ORDERFLOW_PROFILE`. When set (e.g. `PROD`),
    /// every key is first looked up as `{PROFILE}_{KEY}`, falling back to `{KEY}`.
    pub fn from_env() -> Self {
        let profile = env_or("ORDERFLOW_PROFILE", "").to_uppercase();
        Self::for_profile(&profile)
    }

    /// Build config for a specific named profile (empty string = default).
    pub fn for_profile(profile: &str) -> Self {
        let p = profile.to_uppercase();
        let p = p.as_str();
        Self {
            profile: p.to_string(),
            server: ServerConfig::from_env_profiled(p),
            postgres: PostgresConfig::from_env_profiled(p),
            nats: NatsConfig::from_env_profiled(p),
        }
    }

    pub fn profile_label(&self) -> &str {
        if self.profile.is_empty() { "default" } else { &self.profile }
    }

    /// Print a redacted summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded (profile: {}):", self.profile_label());
        tracing::info!("  server:      {}:{}, rate_limit={}/s burst {}", self.server.host, self.server.port, self.server.rate_limit_per_sec, self.server.rate_limit_burst);
        tracing::info!("  postgres:    host={}, db={}, budget={:?}", self.postgres.host, self.postgres.database, self.postgres.connect_budget());
        tracing::info!(
            "  nats:        url={}, stream={}, channel={}, durable={}",
            self.nats.url,
            self.nats.stream,
            self.nats.channel,
            self.nats.durable_name.as_deref().unwrap_or("(none)")
        );
    }
}

// ── Server ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Token refill rate for the read API throttle.
    pub rate_limit_per_sec: u32,
    pub rate_limit_burst: u32,
}

impl ServerConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            host: profiled_env_or(p, "HOST", "0.0.0.0"),
            port: profiled_env_u16(p, "PORT", 8080),
            rate_limit_per_sec: profiled_env_u32(p, "RATE_LIMIT_PER_SEC", 10),
            rate_limit_burst: profiled_env_u32(p, "RATE_LIMIT_BURST", 30),
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

// ── PostgreSQL ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostgresConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub ssl_mode: String,
    pub max_connections: u32,
    /// Total time the startup bootstrap may spend before giving up.
    pub connect_timeout_secs: u64,
    pub retry_interval_secs: u64,
    /// Upper bound on a single connection attempt.
    pub attempt_timeout_secs: u64,
}

impl PostgresConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            host: profiled_env_or(p, "PG_HOST", "localhost"),
            port: profiled_env_u16(p, "PG_PORT", 5432),
            database: profiled_env_or(p, "PG_DATABASE", "orders"),
            username: profiled_env_opt(p, "PG_USERNAME"),
            password: profiled_env_opt(p, "PG_PASSWORD"),
            ssl_mode: profiled_env_or(p, "PG_SSL_MODE", "prefer"),
            max_connections: profiled_env_u32(p, "PG_MAX_CONNECTIONS", 10),
            connect_timeout_secs: profiled_env_u64(p, "PG_CONNECT_TIMEOUT_SECS", 30),
            retry_interval_secs: profiled_env_u64(p, "PG_RETRY_INTERVAL_SECS", 5),
            attempt_timeout_secs: profiled_env_u64(p, "PG_ATTEMPT_TIMEOUT_SECS", 5),
        }
    }

    pub fn connection_string(&self) -> String {
        let user = self.username.as_deref().unwrap_or("postgres");
        let pass = self.password.as_deref().unwrap_or("");
        format!(
            "postgres://{}:{}@{}:{}/{}?sslmode={}",
            user, pass, self.host, self.port, self.database, self.ssl_mode
        )
    }

    pub fn connect_budget(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn retry_interval(&self) -> Duration {
        // A zero interval would spin; clamp to one second.
        Duration::from_secs(self.retry_interval_secs.max(1))
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs.max(1))
    }
}

// ── NATS ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NatsConfig {
    pub url: String,
    /// JetStream stream that captures the channel subject.
    pub stream: String,
    /// Subject carrying order events.
    pub channel: String,
    /// Durable consumer name. `None` means an ephemeral subscription that is
    /// removed on shutdown.
    pub durable_name: Option<String>,
    pub client_name: String,
}

impl NatsConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            url: profiled_env_or(p, "NATS_URL", "nats://localhost:4222"),
            stream: profiled_env_or(p, "NATS_STREAM", "ORDERS"),
            channel: profiled_env_or(p, "NATS_CHANNEL", "orders"),
            durable_name: profiled_env_opt(p, "NATS_DURABLE").and_then(normalize_durable),
            client_name: profiled_env_or(p, "NATS_CLIENT_NAME", "orderflow"),
        }
    }
}

/// Blank durable names mean "no durable".
fn normalize_durable(name: String) -> Option<String> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn postgres() -> PostgresConfig {
        PostgresConfig {
            host: "db".into(),
            port: 5433,
            database: "orders".into(),
            username: Some("svc".into()),
            password: Some("secret".into()),
            ssl_mode: "disable".into(),
            max_connections: 4,
            connect_timeout_secs: 30,
            retry_interval_secs: 0,
            attempt_timeout_secs: 5,
        }
    }

    #[test]
    fn connection_string_includes_credentials_and_ssl_mode() {
        assert_eq!(
            postgres().connection_string(),
            "postgres://svc:secret@db:5433/orders?sslmode=disable"
        );
    }

    #[test]
    fn connection_string_defaults_user() {
        let mut cfg = postgres();
        cfg.username = None;
        cfg.password = None;
        assert!(cfg.connection_string().starts_with("postgres://postgres:@db"));
    }

    #[test]
    fn zero_retry_interval_is_clamped() {
        assert_eq!(postgres().retry_interval(), Duration::from_secs(1));
        assert_eq!(postgres().connect_budget(), Duration::from_secs(30));
    }

    #[test]
    fn blank_durable_is_none() {
        assert_eq!(normalize_durable("   ".into()), None);
        assert_eq!(normalize_durable(" orders-durable ".into()), Some("orders-durable".into()));
    }

    #[test]
    fn profile_prefix_wins_over_plain_key() {
        // Keys unique to this test so parallel tests never observe them.
        env::set_var("ORDERFLOW_CFGTEST_ONLY_KEY", "plain");
        env::set_var("CFGTEST_ORDERFLOW_CFGTEST_ONLY_KEY", "profiled");
        assert_eq!(
            profiled_env_opt("CFGTEST", "ORDERFLOW_CFGTEST_ONLY_KEY").as_deref(),
            Some("profiled")
        );
        assert_eq!(
            profiled_env_opt("", "ORDERFLOW_CFGTEST_ONLY_KEY").as_deref(),
            Some("plain")
        );
        env::remove_var("ORDERFLOW_CFGTEST_ONLY_KEY");
        env::remove_var("CFGTEST_ORDERFLOW_CFGTEST_ONLY_KEY");
    }
}
