//! Server-side delta computation.

use crate::clock::LogicalClock;
use crate::config::ServerConfig;
use crate::error::ServerResult;
use crate::store::RecordStore;
use std::collections::HashSet;
use std::sync::Arc;
use tidemark_protocol::{
    ChangeSet, MigrationDescriptor, PullRequest, PullResponse, RecordId, Schema, TableChanges,
    Timestamp,
};
use tracing::debug;

/// Computes the change-set a client is missing.
///
/// Read-only: a pull never mutates `last_modified` or anything else. The
/// consistency point is captured from the clock before any query runs, so
/// every write committed after that instant is excluded here and shows up
/// in the client's next pull instead.
pub struct PullService {
    store: Arc<RecordStore>,
    schema: Arc<Schema>,
    clock: Arc<LogicalClock>,
    config: ServerConfig,
}

impl PullService {
    /// Creates a pull service.
    pub fn new(
        store: Arc<RecordStore>,
        schema: Arc<Schema>,
        clock: Arc<LogicalClock>,
        config: ServerConfig,
    ) -> Self {
        Self {
            store,
            schema,
            clock,
            config,
        }
    }

    /// Handles a pull request.
    pub fn pull(&self, request: &PullRequest) -> ServerResult<PullResponse> {
        if let Some(migration) = &request.migration {
            migration.validate_against(&self.schema)?;
        }

        // Consistency point: captured once, before any query. Everything
        // committed after this instant belongs to the next pull.
        let server_timestamp = self.clock.next();

        let mut changes = if request.is_first_sync() {
            self.bootstrap(server_timestamp)
        } else {
            self.incremental(request.last_pulled_at, server_timestamp)
        };

        if let Some(migration) = &request.migration {
            self.expand_for_migration(&mut changes, migration, server_timestamp);
        }

        changes.prune_empty();
        debug_assert!(changes.validate().is_ok());

        debug!(
            last_pulled_at = request.last_pulled_at,
            timestamp = server_timestamp,
            records = changes.len(),
            "pull computed"
        );

        if request.is_first_sync() && request.turbo && self.config.turbo_enabled {
            Ok(PullResponse::turbo(changes, server_timestamp)?)
        } else {
            Ok(PullResponse::structured(changes, server_timestamp))
        }
    }

    /// First sync: every accessible record, classified as created. A blank
    /// client has nothing to tombstone, so deleted rows stay out entirely.
    fn bootstrap(&self, up_to: Timestamp) -> ChangeSet {
        let mut changes = ChangeSet::new();
        for table in self.schema.tables.keys() {
            let created: Vec<_> = self
                .store
                .table_live(table, up_to)
                .into_iter()
                .map(|(id, row)| row.to_wire(&id))
                .collect();
            if !created.is_empty() {
                changes.table_mut(table.clone()).created = created;
            }
        }
        changes
    }

    /// Incremental sync: partition everything written in
    /// `(last_pulled_at, up_to]` by tombstone flag and first-seen time.
    fn incremental(&self, last_pulled_at: Timestamp, up_to: Timestamp) -> ChangeSet {
        let mut changes = ChangeSet::new();
        for (table, id, row) in self.store.changed_since(last_pulled_at, up_to) {
            let bucket = changes.table_mut(table);
            if row.is_deleted {
                bucket.deleted.push(id);
            } else if row.server_created_at > last_pulled_at {
                bucket.created.push(row.to_wire(&id));
            } else {
                bucket.updated.push(row.to_wire(&id));
            }
        }
        changes
    }

    /// Broadens the response for a client that upgraded its schema.
    fn expand_for_migration(
        &self,
        changes: &mut ChangeSet,
        migration: &MigrationDescriptor,
        up_to: Timestamp,
    ) {
        // New tables: the client has no rows for them, so every live row is
        // a create regardless of timestamp. This replaces whatever the
        // timestamp partition put there, keeping each id listed once.
        for table in &migration.new_tables {
            let created: Vec<_> = self
                .store
                .table_live(table, up_to)
                .into_iter()
                .map(|(id, row)| row.to_wire(&id))
                .collect();
            *changes.table_mut(table.clone()) = TableChanges {
                created,
                ..TableChanges::default()
            };
        }

        // New columns: backfill rows where any of the named columns holds a
        // non-default value, even below the timestamp cutoff. Rows already
        // in the response keep their existing classification.
        for (table, columns) in &migration.new_columns {
            if migration.new_tables.contains(table) {
                continue;
            }
            let present: HashSet<RecordId> = changes
                .table(table)
                .map(|bucket| bucket.ids().cloned().collect())
                .unwrap_or_default();

            for (id, row) in self.store.table_live(table, up_to) {
                if present.contains(&id) {
                    continue;
                }
                let backfill = columns
                    .iter()
                    .any(|column| !row.field_is_default(column));
                if backfill {
                    changes
                        .table_mut(table.clone())
                        .updated
                        .push(row.to_wire(&id));
                }
            }
        }
    }
}
