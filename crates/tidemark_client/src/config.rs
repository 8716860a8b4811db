//! Configuration for the sync client.

use std::time::Duration;
use tidemark_protocol::SchemaHistory;

/// Configuration for a sync orchestrator.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// The client's current schema version.
    pub schema_version: u32,
    /// Additive schema history used to negotiate migration backfill when
    /// the stored cursor lags `schema_version`.
    pub history: Option<SchemaHistory>,
    /// Request the pre-serialized bootstrap payload on first sync.
    pub turbo_bootstrap: bool,
    /// How many times a conflicted push re-enters the pull phase before
    /// the conflict is surfaced to the caller.
    pub max_conflict_retries: u32,
    /// Backoff behavior for transient failures.
    pub retry: RetryConfig,
}

impl SyncConfig {
    /// Creates a configuration for a schema version.
    pub fn new(schema_version: u32) -> Self {
        Self {
            schema_version,
            history: None,
            turbo_bootstrap: false,
            max_conflict_retries: 5,
            retry: RetryConfig::default(),
        }
    }

    /// Attaches the schema history, builder style.
    pub fn with_history(mut self, history: SchemaHistory) -> Self {
        self.history = Some(history);
        self
    }

    /// Enables turbo bootstrap, builder style.
    pub fn with_turbo_bootstrap(mut self) -> Self {
        self.turbo_bootstrap = true;
        self
    }

    /// Sets the conflict retry bound, builder style.
    pub fn with_max_conflict_retries(mut self, retries: u32) -> Self {
        self.max_conflict_retries = retries;
        self
    }

    /// Sets the retry configuration, builder style.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}

/// Configuration for backoff on transient failures.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,
    /// Initial delay between attempts.
    pub initial_delay: Duration,
    /// Cap on the delay between attempts.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a retry configuration.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// A configuration that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Sets the initial delay, builder style.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the delay cap, builder style.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Calculates the delay before a given attempt (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base = self.initial_delay.as_secs_f64()
            * self
                .backoff_multiplier
                .powi(attempt.saturating_sub(1) as i32);
        let capped = base.min(self.max_delay.as_secs_f64());

        if self.add_jitter {
            // Up to 25% jitter
            let jitter = capped * 0.25 * pseudo_jitter();
            Duration::from_secs_f64(capped + jitter)
        } else {
            Duration::from_secs_f64(capped)
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}

/// Cheap time-derived jitter, avoiding an RNG dependency.
fn pseudo_jitter() -> f64 {
    use std::time::SystemTime;
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    f64::from(nanos % 1000) / 1000.0
}
