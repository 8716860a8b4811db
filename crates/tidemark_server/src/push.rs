//! Server-side transactional apply.

use crate::clock::LogicalClock;
use crate::config::{RejectionMode, ServerConfig};
use crate::error::{ServerError, ServerResult};
use crate::store::{RecordStore, StoreTransaction, VersionedRecord};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tidemark_protocol::{
    is_bookkeeping_field, FieldValue, PushRequest, PushResponse, Record, RecordId, Schema,
    TableName, MAX_RECORD_ID_LEN,
};
use tracing::{debug, warn};

/// Applies a client's change-set as one all-or-nothing transaction.
///
/// The single correctness invariant lives here: for every incoming updated
/// or deleted id, if the stored row's `last_modified` is newer than the
/// client's `last_pulled_at`, another writer got there first and the whole
/// push aborts with a conflict. A client never overwrites a remote edit it
/// has not pulled.
pub struct PushService {
    store: Arc<RecordStore>,
    schema: Arc<Schema>,
    clock: Arc<LogicalClock>,
    config: ServerConfig,
}

impl PushService {
    /// Creates a push service.
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

    /// Handles a push request.
    pub fn push(&self, request: &PushRequest) -> ServerResult<PushResponse> {
        if request.changes.len() > self.config.max_push_records {
            return Err(ServerError::InvalidRequest(format!(
                "too many records: {} > {}",
                request.changes.len(),
                self.config.max_push_records
            )));
        }

        // Allow-list and invariant checks happen before any storage access.
        request.changes.validate()?;
        self.check_names(request)?;

        let rejected = self.invalid_record_ids(request);
        if !rejected.is_empty() && self.config.rejection_mode == RejectionMode::AbortAll {
            return Err(ServerError::ValidationRejected { rejected });
        }
        let rejected_set: HashSet<&RecordId> = rejected.iter().collect();

        let mut txn = self.store.begin();

        // Bulk-fetch every referenced row, one lookup pass per table.
        let mut existing: BTreeMap<TableName, BTreeMap<RecordId, VersionedRecord>> =
            BTreeMap::new();
        for (table, changes) in &request.changes.tables {
            existing.insert(table.clone(), txn.get_many(table, changes.ids()));
        }

        // Conflict detection. Created records are exempt: a retried create
        // must remain idempotent, and its own first application would
        // otherwise always look like a concurrent edit.
        for (table, changes) in &request.changes.tables {
            let rows = &existing[table];
            for id in changes.updated.iter().map(|r| &r.id).chain(&changes.deleted) {
                if let Some(row) = rows.get(id) {
                    if row.last_modified > request.last_pulled_at {
                        warn!(
                            table = table.as_str(),
                            id = id.as_str(),
                            last_modified = row.last_modified,
                            last_pulled_at = request.last_pulled_at,
                            "push conflict"
                        );
                        drop(txn);
                        return Ok(PushResponse::Conflict);
                    }
                }
            }
        }

        // Apply. Every write gets a fresh server timestamp; client-sent
        // timestamps never survive.
        for (table, changes) in &request.changes.tables {
            for record in changes.created.iter().chain(&changes.updated) {
                if rejected_set.contains(&record.id) {
                    continue;
                }
                self.upsert(&mut txn, table, record);
            }
            for id in &changes.deleted {
                if rejected_set.contains(id) {
                    continue;
                }
                self.soft_delete(&mut txn, table, id);
            }
        }

        debug!(staged = txn.staged_len(), "push committing");
        txn.commit();

        if rejected.is_empty() {
            Ok(PushResponse::Applied)
        } else {
            Ok(PushResponse::PartiallyApplied {
                rejected_ids: rejected,
            })
        }
    }

    /// Validates every table and column name against the allow-list.
    fn check_names(&self, request: &PushRequest) -> ServerResult<()> {
        for (table, changes) in &request.changes.tables {
            self.schema.check_table(table)?;
            for record in changes.created.iter().chain(&changes.updated) {
                for column in record.fields.keys() {
                    if !is_bookkeeping_field(column) {
                        self.schema.check_column(table, column)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Collects ids failing record-level validation, in request order.
    fn invalid_record_ids(&self, request: &PushRequest) -> Vec<RecordId> {
        let mut rejected = Vec::new();
        for changes in request.changes.tables.values() {
            for id in changes.ids() {
                if id.is_empty() || id.len() > MAX_RECORD_ID_LEN {
                    rejected.push(id.clone());
                }
            }
        }
        rejected
    }

    /// Writes a record, creating or replacing as needed.
    ///
    /// A created id that already exists becomes an update (duplicate
    /// submission after a dropped response); an updated id that does not
    /// exist becomes a create (the client missed a prior create and must
    /// not wedge forever).
    fn upsert(&self, txn: &mut StoreTransaction<'_>, table: &str, record: &Record) {
        let fields: BTreeMap<String, FieldValue> = record
            .fields
            .iter()
            .filter(|(name, _)| !is_bookkeeping_field(name))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();

        let timestamp = self.clock.next();
        let server_created_at = txn
            .get(table, &record.id)
            .map(|row| row.server_created_at)
            .unwrap_or(timestamp);

        txn.put(
            table,
            &record.id,
            VersionedRecord {
                fields,
                last_modified: timestamp,
                server_created_at,
                is_deleted: false,
            },
        );
    }

    /// Tombstones a record and, recursively, every record that references
    /// it through a schema `references` edge, so no orphaned children
    /// survive their parent.
    fn soft_delete(&self, txn: &mut StoreTransaction<'_>, table: &str, id: &str) {
        let mut worklist: Vec<(TableName, RecordId)> = vec![(table.to_string(), id.to_string())];

        while let Some((table, id)) = worklist.pop() {
            let Some(row) = txn.get(&table, &id) else {
                // Deleting something the server never saw is a no-op, which
                // keeps deletion pushes idempotent.
                continue;
            };
            if row.is_deleted {
                continue;
            }

            let mut tombstone = row.clone();
            tombstone.is_deleted = true;
            tombstone.last_modified = self.clock.next();
            txn.put(&table, &id, tombstone);

            for (child_table, fk_column) in self.schema.children_of(&table) {
                for (child_id, child) in txn.records_in(child_table) {
                    if !child.is_deleted
                        && child.fields.get(fk_column).and_then(FieldValue::as_text)
                            == Some(id.as_str())
                    {
                        worklist.push((child_table.clone(), child_id));
                    }
                }
            }
        }
    }

    /// Returns the last timestamp handed out by this service's clock.
    #[cfg(test)]
    fn last_timestamp(&self) -> tidemark_protocol::Timestamp {
        self.clock.last()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidemark_protocol::{ChangeSet, TableSchema};

    fn schema() -> Arc<Schema> {
        Arc::new(
            Schema::new(1)
                .with_table("posts", TableSchema::with_columns(["title", "body"]))
                .with_table(
                    "comments",
                    TableSchema::with_columns(["post_id", "body"])
                        .with_reference("post_id", "posts"),
                )
                .with_table(
                    "reactions",
                    TableSchema::with_columns(["comment_id", "kind"])
                        .with_reference("comment_id", "comments"),
                ),
        )
    }

    fn service(config: ServerConfig) -> (PushService, Arc<RecordStore>) {
        let store = Arc::new(RecordStore::new());
        let push = PushService::new(
            Arc::clone(&store),
            schema(),
            Arc::new(LogicalClock::new()),
            config,
        );
        (push, store)
    }

    fn created(table: &str, record: Record) -> ChangeSet {
        let mut changes = ChangeSet::new();
        changes.table_mut(table).created.push(record);
        changes
    }

    #[test]
    fn create_then_fetch() {
        let (push, store) = service(ServerConfig::default());

        let changes = created("posts", Record::new("p1").with_field("title", "hello"));
        let response = push.push(&PushRequest::new(changes, 0)).unwrap();
        assert!(response.is_applied());

        let row = store.get("posts", "p1").unwrap();
        assert_eq!(row.fields["title"], FieldValue::Text("hello".into()));
        assert!(!row.is_deleted);
        assert_eq!(row.server_created_at, row.last_modified);
    }

    #[test]
    fn idempotent_create_keeps_one_record_with_second_values() {
        let (push, store) = service(ServerConfig::default());

        let first = created("posts", Record::new("p1").with_field("title", "v1"));
        push.push(&PushRequest::new(first, 0)).unwrap();
        let created_at = store.get("posts", "p1").unwrap().server_created_at;

        // Retried create after a dropped response, with newer values.
        let second = created("posts", Record::new("p1").with_field("title", "v2"));
        let response = push.push(&PushRequest::new(second, 0)).unwrap();
        assert!(response.is_applied());

        assert_eq!(store.len(), 1);
        let row = store.get("posts", "p1").unwrap();
        assert_eq!(row.fields["title"], FieldValue::Text("v2".into()));
        assert_eq!(row.server_created_at, created_at);
        assert!(row.last_modified > created_at);
    }

    #[test]
    fn update_of_missing_record_creates_it() {
        let (push, store) = service(ServerConfig::default());

        let mut changes = ChangeSet::new();
        changes
            .table_mut("posts")
            .updated
            .push(Record::new("orphan").with_field("title", "t"));

        let response = push.push(&PushRequest::new(changes, 0)).unwrap();
        assert!(response.is_applied());
        assert!(store.get("posts", "orphan").is_some());
    }

    #[test]
    fn stale_update_conflicts_and_writes_nothing() {
        let (push, store) = service(ServerConfig::default());

        push.push(&PushRequest::new(
            created("posts", Record::new("p1").with_field("title", "server")),
            0,
        ))
        .unwrap();
        let server_ts = store.get("posts", "p1").unwrap().last_modified;

        // Another client pushing with a pull cursor older than server_ts.
        let mut changes = ChangeSet::new();
        changes
            .table_mut("posts")
            .updated
            .push(Record::new("p1").with_field("title", "stale"));
        changes
            .table_mut("posts")
            .created
            .push(Record::new("p2").with_field("title", "new"));

        let response = push
            .push(&PushRequest::new(changes, server_ts - 1))
            .unwrap();
        assert_eq!(response, PushResponse::Conflict);

        // The whole transaction rolled back: p2 was not written either.
        assert_eq!(
            store.get("posts", "p1").unwrap().fields["title"],
            FieldValue::Text("server".into())
        );
        assert!(store.get("posts", "p2").is_none());
    }

    #[test]
    fn stale_delete_conflicts() {
        let (push, store) = service(ServerConfig::default());

        push.push(&PushRequest::new(
            created("posts", Record::new("p1").with_field("title", "t")),
            0,
        ))
        .unwrap();
        let server_ts = store.get("posts", "p1").unwrap().last_modified;

        let mut changes = ChangeSet::new();
        changes.table_mut("posts").deleted.push("p1".into());

        let response = push
            .push(&PushRequest::new(changes.clone(), server_ts - 1))
            .unwrap();
        assert_eq!(response, PushResponse::Conflict);

        // With a current cursor the same delete goes through.
        let response = push.push(&PushRequest::new(changes, server_ts)).unwrap();
        assert!(response.is_applied());
        assert!(store.get("posts", "p1").unwrap().is_deleted);
    }

    #[test]
    fn delete_cascades_to_descendants() {
        let (push, store) = service(ServerConfig::default());

        let mut changes = ChangeSet::new();
        changes
            .table_mut("posts")
            .created
            .push(Record::new("p1").with_field("title", "t"));
        changes
            .table_mut("comments")
            .created
            .push(Record::new("c1").with_field("post_id", "p1"));
        changes
            .table_mut("comments")
            .created
            .push(Record::new("c2").with_field("post_id", "other"));
        changes
            .table_mut("reactions")
            .created
            .push(Record::new("r1").with_field("comment_id", "c1"));
        push.push(&PushRequest::new(changes, 0)).unwrap();
        let cursor = push.last_timestamp();

        let mut delete = ChangeSet::new();
        delete.table_mut("posts").deleted.push("p1".into());
        push.push(&PushRequest::new(delete, cursor)).unwrap();

        assert!(store.get("posts", "p1").unwrap().is_deleted);
        assert!(store.get("comments", "c1").unwrap().is_deleted);
        assert!(store.get("reactions", "r1").unwrap().is_deleted);
        // Unrelated sibling survives.
        assert!(!store.get("comments", "c2").unwrap().is_deleted);
    }

    #[test]
    fn delete_of_unknown_id_is_a_noop() {
        let (push, store) = service(ServerConfig::default());

        let mut changes = ChangeSet::new();
        changes.table_mut("posts").deleted.push("never-seen".into());

        let response = push.push(&PushRequest::new(changes, 0)).unwrap();
        assert!(response.is_applied());
        assert!(store.is_empty());
    }

    #[test]
    fn bookkeeping_fields_are_stripped() {
        let (push, store) = service(ServerConfig::default());

        let record = Record::new("p1")
            .with_field("title", "t")
            .with_field("_status", "updated")
            .with_field("_changed", "title");
        push.push(&PushRequest::new(created("posts", record), 0))
            .unwrap();

        let row = store.get("posts", "p1").unwrap();
        assert!(row.fields.contains_key("title"));
        assert!(!row.fields.keys().any(|k| k.starts_with('_')));
    }

    #[test]
    fn unknown_names_rejected_before_writes() {
        let (push, store) = service(ServerConfig::default());

        let changes = created("ghosts", Record::new("g1"));
        assert!(matches!(
            push.push(&PushRequest::new(changes, 0)),
            Err(ServerError::InvalidRequest(_))
        ));

        let changes = created("posts", Record::new("p1").with_field("secret", "x"));
        assert!(matches!(
            push.push(&PushRequest::new(changes, 0)),
            Err(ServerError::InvalidRequest(_))
        ));

        assert!(store.is_empty());
    }

    #[test]
    fn duplicate_ids_rejected() {
        let (push, _) = service(ServerConfig::default());

        let mut changes = ChangeSet::new();
        changes.table_mut("posts").created.push(Record::new("p1"));
        changes.table_mut("posts").deleted.push("p1".into());

        assert!(matches!(
            push.push(&PushRequest::new(changes, 0)),
            Err(ServerError::InvalidRequest(_))
        ));
    }

    #[test]
    fn strict_mode_aborts_on_invalid_record() {
        let (push, store) = service(ServerConfig::default());

        let mut changes = ChangeSet::new();
        changes.table_mut("posts").created.push(Record::new("ok"));
        changes.table_mut("posts").created.push(Record::new(""));

        let result = push.push(&PushRequest::new(changes, 0));
        assert!(matches!(
            result,
            Err(ServerError::ValidationRejected { .. })
        ));
        assert!(store.is_empty());
    }

    #[test]
    fn partial_mode_commits_the_rest() {
        let (push, store) = service(
            ServerConfig::default().with_rejection_mode(RejectionMode::RejectOffending),
        );

        let oversized = "x".repeat(MAX_RECORD_ID_LEN + 1);
        let mut changes = ChangeSet::new();
        changes
            .table_mut("posts")
            .created
            .push(Record::new("ok").with_field("title", "t"));
        changes
            .table_mut("posts")
            .created
            .push(Record::new(oversized.clone()));

        let response = push.push(&PushRequest::new(changes, 0)).unwrap();
        assert_eq!(
            response,
            PushResponse::PartiallyApplied {
                rejected_ids: vec![oversized.clone()]
            }
        );

        assert!(store.get("posts", "ok").is_some());
        assert!(store.get("posts", &oversized).is_none());
    }

    #[test]
    fn batch_limit_enforced() {
        let (push, _) = service(ServerConfig::default().with_max_push_records(1));

        let mut changes = ChangeSet::new();
        changes.table_mut("posts").created.push(Record::new("a"));
        changes.table_mut("posts").created.push(Record::new("b"));

        assert!(matches!(
            push.push(&PushRequest::new(changes, 0)),
            Err(ServerError::InvalidRequest(_))
        ));
    }
}
