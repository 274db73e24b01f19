//! Worker configuration.

use std::time::Duration;

use crate::models::OrganizationId;

/// Configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection URL
    pub database_url: String,

    /// Queue poll interval
    pub poll_interval: Duration,

    /// Max queue jobs claimed per poll
    pub batch_size: i64,

    /// Max concurrently handled jobs
    pub max_concurrent: usize,

    /// Per-call HTTP timeout for endpoint requests
    pub endpoint_timeout: Duration,

    /// Whether the deprecated resume-task field is still honoured
    pub accept_deprecated_resume: bool,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;

        let poll_interval_ms: u64 = std::env::var("DROVER_POLL_INTERVAL_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(250);

        let batch_size: i64 = std::env::var("DROVER_BATCH_SIZE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(20);

        let max_concurrent: usize = std::env::var("DROVER_WORKER_COUNT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(8);

        let endpoint_timeout_secs: u64 = std::env::var("DROVER_ENDPOINT_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(120);

        let accept_deprecated_resume = std::env::var("DROVER_ACCEPT_DEPRECATED_RESUME")
            .map(|s| s != "0" && !s.eq_ignore_ascii_case("false"))
            .unwrap_or(true);

        Ok(Config {
            database_url,
            poll_interval: Duration::from_millis(poll_interval_ms),
            batch_size,
            max_concurrent,
            endpoint_timeout: Duration::from_secs(endpoint_timeout_secs),
            accept_deprecated_resume,
        })
    }
}

/// Whether the organisation is blocked. `BLOCKED_ORGS` is substring-matched
/// and re-read on every call so an operator can block without a restart.
pub fn organization_blocked(id: OrganizationId) -> bool {
    match std::env::var("BLOCKED_ORGS") {
        Ok(blocked) => blocked.contains(&id.to_string()),
        Err(_) => false,
    }
}
