//! Configuration for the sync server.

/// How the push path treats record-level validation failures.
///
/// Conflicts always abort regardless of mode; this flag only governs
/// validation failures (bad ids and the like).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RejectionMode {
    /// Any invalid record fails the whole push with `ValidationRejected`.
    #[default]
    AbortAll,
    /// Invalid records are excluded, the rest commits, and the rejected ids
    /// are reported so the client can mark just those as failed.
    RejectOffending,
}

/// Configuration for the sync services.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Validation strictness for push.
    pub rejection_mode: RejectionMode,
    /// Maximum number of records accepted in one push.
    pub max_push_records: usize,
    /// Whether the turbo bootstrap fast-path may be served.
    pub turbo_enabled: bool,
}

impl ServerConfig {
    /// Sets the rejection mode, builder style.
    pub fn with_rejection_mode(mut self, mode: RejectionMode) -> Self {
        self.rejection_mode = mode;
        self
    }

    /// Sets the push batch limit, builder style.
    pub fn with_max_push_records(mut self, max: usize) -> Self {
        self.max_push_records = max;
        self
    }

    /// Disables the turbo bootstrap fast-path, builder style.
    pub fn without_turbo(mut self) -> Self {
        self.turbo_enabled = false;
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            rejection_mode: RejectionMode::AbortAll,
            max_push_records: 10_000,
            turbo_enabled: true,
        }
    }
}
