//! Server configuration, loaded from environment variables at startup.

use std::time::Duration;

use slipway_core::EngineConfig;

/// Runtime configuration for slipway-server.
///
/// Every field has a default so a development instance starts without any
/// environment variables set.
#[derive(Debug, Clone)]
pub struct Config {
    /// TCP address to bind (default: `"0.0.0.0:9000"`).
    pub bind_address: String,

    /// sqlx SQLite URL (default: `"sqlite://slipway.db"`).
    pub database_url: String,

    /// `tracing` filter string, e.g. `"info"` or `"debug,sqlx=warn"`.
    pub log_level: String,

    /// When `true`, emit log records as newline-delimited JSON.
    pub log_json: bool,

    /// Write logs to this file instead of stdout.
    pub log_file: Option<String>,

    pub leader_grace_period: Duration,
    pub leadership_claim_interval: Duration,
    pub poll_interval: Duration,
    pub max_retries: u32,
    pub retry_backoff: Duration,
    pub subtask_timeout: Duration,
    pub bootaction_report_timeout: Duration,
    pub max_parallel_subtasks: usize,

    /// Base URL rendered into boot-action assets for status callbacks.
    pub report_url: String,

    /// Bearer token required on the task and build-data API when set.
    pub admin_token: Option<String>,

    /// Serve Swagger UI at `/swagger-ui` (default: `true`).
    pub enable_swagger: bool,

    /// Register the simulated driver for every driver action.
    pub simulated_driver: bool,

    /// Comma-separated CORS origins; wildcard when unset.
    pub cors_allowed_origins: Option<String>,
}

impl Config {
    /// Build [`Config`] from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let engine = EngineConfig::default();
        Self {
            bind_address: env_or("SLIPWAY_BIND", "0.0.0.0:9000"),
            database_url: env_or("SLIPWAY_DATABASE_URL", "sqlite://slipway.db"),
            log_level: env_or("SLIPWAY_LOG", "info"),
            log_json: env_flag("SLIPWAY_LOG_JSON", false),
            log_file: env_opt("SLIPWAY_LOG_FILE"),
            leader_grace_period: secs_env("SLIPWAY_LEADER_GRACE_SECS", engine.leader_grace_period),
            leadership_claim_interval: secs_env(
                "SLIPWAY_LEADER_CLAIM_INTERVAL_SECS",
                engine.leadership_claim_interval,
            ),
            poll_interval: secs_env("SLIPWAY_POLL_INTERVAL_SECS", engine.poll_interval),
            max_retries: parse_env("SLIPWAY_MAX_RETRIES", engine.max_retries),
            retry_backoff: secs_env("SLIPWAY_RETRY_BACKOFF_SECS", engine.retry_backoff),
            subtask_timeout: secs_env("SLIPWAY_SUBTASK_TIMEOUT_SECS", engine.subtask_timeout),
            bootaction_report_timeout: secs_env(
                "SLIPWAY_BOOTACTION_REPORT_TIMEOUT_SECS",
                engine.bootaction_report_timeout,
            ),
            max_parallel_subtasks: parse_env(
                "SLIPWAY_MAX_PARALLEL_SUBTASKS",
                engine.max_parallel_subtasks,
            ),
            report_url: env_or("SLIPWAY_REPORT_URL", &engine.report_url),
            admin_token: env_opt("SLIPWAY_ADMIN_TOKEN"),
            enable_swagger: env_flag("SLIPWAY_ENABLE_SWAGGER", true),
            simulated_driver: env_flag("SLIPWAY_SIMULATED_DRIVER", false),
            cors_allowed_origins: env_opt("SLIPWAY_CORS_ORIGINS"),
        }
    }

    /// Engine tunables derived from this configuration.
    pub fn to_engine_config(&self) -> EngineConfig {
        EngineConfig {
            leader_grace_period: self.leader_grace_period,
            leadership_claim_interval: self.leadership_claim_interval,
            poll_interval: self.poll_interval,
            max_retries: self.max_retries,
            retry_backoff: self.retry_backoff,
            subtask_timeout: self.subtask_timeout,
            bootaction_report_timeout: self.bootaction_report_timeout,
            max_parallel_subtasks: self.max_parallel_subtasks.max(1),
            report_url: self.report_url.clone(),
            ..EngineConfig::default()
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        let engine = EngineConfig::default();
        Self {
            bind_address: "0.0.0.0:9000".to_owned(),
            database_url: "sqlite://slipway.db".to_owned(),
            log_level: "info".to_owned(),
            log_json: false,
            log_file: None,
            leader_grace_period: engine.leader_grace_period,
            leadership_claim_interval: engine.leadership_claim_interval,
            poll_interval: engine.poll_interval,
            max_retries: engine.max_retries,
            retry_backoff: engine.retry_backoff,
            subtask_timeout: engine.subtask_timeout,
            bootaction_report_timeout: engine.bootaction_report_timeout,
            max_parallel_subtasks: engine.max_parallel_subtasks,
            report_url: engine.report_url,
            admin_token: None,
            enable_swagger: true,
            simulated_driver: false,
            cors_allowed_origins: None,
        }
    }
}

// ── private helpers ──────────────────────────────────────────────────────────

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_owned())
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(default)
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn secs_env(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<f64>().ok())
        .filter(|s| s.is_finite() && *s >= 0.0)
        .map(Duration::from_secs_f64)
        .unwrap_or(default)
}
