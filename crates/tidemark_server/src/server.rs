//! The sync server facade.

use crate::clock::LogicalClock;
use crate::config::ServerConfig;
use crate::error::ServerResult;
use crate::pull::PullService;
use crate::push::PushService;
use crate::store::RecordStore;
use std::sync::Arc;
use tidemark_protocol::{PullRequest, PullResponse, PushRequest, PushResponse, Schema};

/// Bundles the record store, schema, clock and both services.
///
/// This is the entry point a transport layer calls into. There is no wire
/// listener here: expose `handle_pull`/`handle_push` over whatever
/// request/response channel the deployment uses.
///
/// # Example
///
/// ```
/// use tidemark_protocol::{PullRequest, Schema, TableSchema};
/// use tidemark_server::{ServerConfig, SyncServer};
///
/// let schema = Schema::new(1).with_table("posts", TableSchema::with_columns(["title"]));
/// let server = SyncServer::new(ServerConfig::default(), schema);
///
/// let response = server.handle_pull(&PullRequest::new(0, 1)).unwrap();
/// ```
pub struct SyncServer {
    pull: PullService,
    push: PushService,
    store: Arc<RecordStore>,
}

impl SyncServer {
    /// Creates a sync server over an empty store.
    pub fn new(config: ServerConfig, schema: Schema) -> Self {
        Self::with_store(config, schema, Arc::new(RecordStore::new()))
    }

    /// Creates a sync server over an existing store.
    ///
    /// The clock is seeded from the store's highest persisted timestamp so
    /// a restart can never reissue one.
    pub fn with_store(config: ServerConfig, schema: Schema, store: Arc<RecordStore>) -> Self {
        let schema = Arc::new(schema);
        let clock = Arc::new(LogicalClock::starting_at(store.max_last_modified()));

        let pull = PullService::new(
            Arc::clone(&store),
            Arc::clone(&schema),
            Arc::clone(&clock),
            config.clone(),
        );
        let push = PushService::new(
            Arc::clone(&store),
            Arc::clone(&schema),
            Arc::clone(&clock),
            config,
        );

        Self { pull, push, store }
    }

    /// Handles a pull request.
    pub fn handle_pull(&self, request: &PullRequest) -> ServerResult<PullResponse> {
        self.pull.pull(request)
    }

    /// Handles a push request.
    pub fn handle_push(&self, request: &PushRequest) -> ServerResult<PushResponse> {
        self.push.push(request)
    }

    /// The underlying record store, for administrative access.
    pub fn store(&self) -> &Arc<RecordStore> {
        &self.store
    }
}
