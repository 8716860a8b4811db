//! The client sync state machine.

use crate::config::SyncConfig;
use crate::cursor::{CursorStore, SyncCursor};
use crate::error::{SyncError, SyncResult};
use crate::store::LocalStore;
use crate::transport::SyncTransport;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tidemark_protocol::{
    ChangeSet, MigrationDescriptor, PullRequest, PushRequest, PushResponse, RecordId,
};

/// Phase of the sync cycle, observable from other threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// No sync in progress.
    Idle,
    /// Fetching remote changes.
    Pulling,
    /// Applying pulled changes to the local store.
    Merging,
    /// Sending local changes to the server.
    Pushing,
}

/// Cumulative counters across the orchestrator's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStats {
    /// Sync cycles that finished successfully.
    pub syncs_completed: u64,
    /// Sync cycles that returned an error.
    pub syncs_failed: u64,
    /// Records pulled and merged.
    pub records_pulled: u64,
    /// Records pushed and accepted.
    pub records_pushed: u64,
    /// Pull-again retries caused by push conflicts.
    pub conflict_retries: u64,
}

/// Outcome of one successful sync cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncReport {
    /// Records pulled and merged, summed across retries.
    pub pulled: usize,
    /// Records the server accepted from the final push.
    pub pushed: usize,
    /// Ids the server rejected; they are marked failed locally.
    pub rejected: Vec<RecordId>,
    /// How many times a conflicted push re-entered the pull phase.
    pub conflict_retries: u32,
    /// Wall time of the whole cycle.
    pub duration: Duration,
}

/// Drives the pull → merge → push cycle against a transport.
///
/// One orchestrator serves one local store; concurrent [`sync`] calls are
/// rejected with [`SyncError::AlreadySyncing`] rather than queued. All
/// methods take `&self`, so the orchestrator can live behind an `Arc` and
/// be cancelled from another thread.
///
/// [`sync`]: SyncOrchestrator::sync
pub struct SyncOrchestrator<T, S, C> {
    transport: T,
    store: S,
    cursor: C,
    config: SyncConfig,
    state: Mutex<SyncState>,
    cancelled: AtomicBool,
    stats: Mutex<SyncStats>,
}

impl<T, S, C> SyncOrchestrator<T, S, C>
where
    T: SyncTransport,
    S: LocalStore,
    C: CursorStore,
{
    /// Creates an orchestrator.
    pub fn new(transport: T, store: S, cursor: C, config: SyncConfig) -> Self {
        Self {
            transport,
            store,
            cursor,
            config,
            state: Mutex::new(SyncState::Idle),
            cancelled: AtomicBool::new(false),
            stats: Mutex::new(SyncStats::default()),
        }
    }

    /// Returns the current phase.
    pub fn state(&self) -> SyncState {
        *self.state.lock()
    }

    /// Returns a snapshot of the lifetime counters.
    pub fn stats(&self) -> SyncStats {
        *self.stats.lock()
    }

    /// Requests cancellation of the running (or next) sync cycle.
    ///
    /// The cycle stops at the next phase boundary. A merge that has begun
    /// always completes, so the store and cursor stay consistent.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Accesses the local store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Accesses the transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Runs one sync cycle: pull, merge, push, retrying the pull on push
    /// conflict up to the configured bound.
    pub fn sync(&self) -> SyncResult<SyncReport> {
        {
            let mut state = self.state.lock();
            if *state != SyncState::Idle {
                return Err(SyncError::AlreadySyncing);
            }
            *state = SyncState::Pulling;
        }

        let result = self.run_cycle();

        *self.state.lock() = SyncState::Idle;
        let mut stats = self.stats.lock();
        match &result {
            Ok(report) => {
                stats.syncs_completed += 1;
                stats.records_pulled += report.pulled as u64;
                stats.records_pushed += report.pushed as u64;
                stats.conflict_retries += u64::from(report.conflict_retries);
            }
            Err(_) => stats.syncs_failed += 1,
        }
        result
    }

    /// Runs [`sync`], retrying with backoff while the error is transient.
    ///
    /// Conflicts are not retried here; the bounded conflict loop inside the
    /// cycle already handles them.
    ///
    /// [`sync`]: SyncOrchestrator::sync
    pub fn sync_with_retry(&self) -> SyncResult<SyncReport> {
        let retry = self.config.retry.clone();
        let mut attempt = 0;
        loop {
            match self.sync() {
                Ok(report) => return Ok(report),
                Err(err) if err.is_retryable() && attempt + 1 < retry.max_attempts => {
                    attempt += 1;
                    let delay = retry.delay_for_attempt(attempt);
                    tracing::debug!(attempt, ?delay, error = %err, "retrying sync");
                    std::thread::sleep(delay);
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn run_cycle(&self) -> SyncResult<SyncReport> {
        let started = Instant::now();
        let mut report = SyncReport::default();

        for attempt in 0..=self.config.max_conflict_retries {
            self.check_cancelled()?;
            *self.state.lock() = SyncState::Pulling;

            let mut cursor = self.cursor.load()?;
            let request = self.build_pull_request(&mut cursor)?;
            tracing::debug!(
                last_pulled_at = request.last_pulled_at,
                turbo = request.turbo,
                migration = request.migration.is_some(),
                "pulling"
            );
            let response = self.transport.pull(&request)?;

            self.check_cancelled()?;
            *self.state.lock() = SyncState::Merging;

            let (changes, timestamp) = response.into_parts()?;
            report.pulled += changes.len();
            self.store.apply_changes(&changes)?;

            // The cursor only moves once the merge has fully landed.
            cursor = SyncCursor {
                last_pulled_at: timestamp,
                schema_version: self.config.schema_version,
                pending_migration: None,
            };
            self.cursor.save(&cursor)?;

            self.check_cancelled()?;
            *self.state.lock() = SyncState::Pushing;

            let dirty = self.store.collect_dirty()?;
            if dirty.is_empty() {
                report.duration = started.elapsed();
                tracing::info!(pulled = report.pulled, "sync complete, nothing to push");
                return Ok(report);
            }

            let push = PushRequest::new(dirty.clone(), cursor.last_pulled_at);
            match self.transport.push(&push)? {
                PushResponse::Applied => {
                    self.store.mark_synced(&dirty)?;
                    report.pushed += dirty.len();
                    report.duration = started.elapsed();
                    tracing::info!(
                        pulled = report.pulled,
                        pushed = report.pushed,
                        "sync complete"
                    );
                    return Ok(report);
                }
                PushResponse::PartiallyApplied { rejected_ids } => {
                    let accepted = without_ids(&dirty, &rejected_ids);
                    self.store.mark_failed(&rejected_ids)?;
                    self.store.mark_synced(&accepted)?;
                    report.pushed += accepted.len();
                    report.rejected = rejected_ids;
                    report.duration = started.elapsed();
                    tracing::warn!(
                        pushed = report.pushed,
                        rejected = report.rejected.len(),
                        "sync complete with rejected records"
                    );
                    return Ok(report);
                }
                PushResponse::Conflict => {
                    report.conflict_retries = attempt + 1;
                    tracing::debug!(attempt, "push conflicted, pulling again");
                }
            }
        }

        Err(SyncError::Conflict {
            attempts: self.config.max_conflict_retries + 1,
        })
    }

    fn build_pull_request(&self, cursor: &mut SyncCursor) -> SyncResult<PullRequest> {
        let mut request = PullRequest::new(cursor.last_pulled_at, self.config.schema_version);

        if let Some(migration) = self.migration_for(cursor)? {
            request = request.with_migration(migration);
        }
        if request.is_first_sync() && self.config.turbo_bootstrap {
            request = request.with_turbo();
        }
        Ok(request)
    }

    /// Determines the backfill descriptor for this pull, if any.
    ///
    /// A freshly computed descriptor is persisted on the cursor before the
    /// pull, so an interrupted upgrade keeps requesting backfill from the
    /// original version even across restarts.
    fn migration_for(&self, cursor: &mut SyncCursor) -> SyncResult<Option<MigrationDescriptor>> {
        if let Some(pending) = &cursor.pending_migration {
            return Ok(Some(pending.clone()));
        }
        // A blank client bootstraps everything; no backfill needed.
        if cursor.last_pulled_at == 0 || cursor.schema_version >= self.config.schema_version {
            return Ok(None);
        }

        let Some(history) = &self.config.history else {
            return Ok(None);
        };
        let Some(descriptor) = history.descriptor_since(cursor.schema_version) else {
            return Ok(None);
        };

        cursor.pending_migration = Some(descriptor.clone());
        self.cursor.save(cursor)?;
        Ok(Some(descriptor))
    }

    fn check_cancelled(&self) -> SyncResult<()> {
        // The flag is consumed when observed, so a stale cancel does not
        // poison the next cycle.
        if self.cancelled.swap(false, Ordering::SeqCst) {
            return Err(SyncError::Cancelled);
        }
        Ok(())
    }
}

/// Returns a copy of `changes` with the given ids filtered out everywhere.
fn without_ids(changes: &ChangeSet, ids: &[RecordId]) -> ChangeSet {
    let excluded: HashSet<&RecordId> = ids.iter().collect();
    let mut remaining = changes.clone();
    for table in remaining.tables.values_mut() {
        table.created.retain(|r| !excluded.contains(&r.id));
        table.updated.retain(|r| !excluded.contains(&r.id));
        table.deleted.retain(|id| !excluded.contains(id));
    }
    remaining.prune_empty();
    remaining
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::MemoryCursorStore;
    use crate::store::MemoryLocalStore;
    use crate::transport::MockTransport;
    use std::collections::BTreeMap;
    use tidemark_protocol::{FieldValue, PullResponse, Record, SchemaHistory, SchemaStep};

    type Orchestrator = SyncOrchestrator<MockTransport, MemoryLocalStore, MemoryCursorStore>;

    fn orchestrator(config: SyncConfig) -> Orchestrator {
        SyncOrchestrator::new(
            MockTransport::new(),
            MemoryLocalStore::new(),
            MemoryCursorStore::new(),
            config,
        )
    }

    fn remote_changes(ids: &[&str]) -> ChangeSet {
        let mut changes = ChangeSet::new();
        for id in ids {
            changes
                .table_mut("posts")
                .created
                .push(Record::new(*id).with_field("title", "remote"));
        }
        changes
    }

    fn title(value: &str) -> BTreeMap<String, FieldValue> {
        BTreeMap::from([("title".to_string(), FieldValue::Text(value.into()))])
    }

    #[test]
    fn full_cycle_pulls_merges_and_pushes() {
        let sync = orchestrator(SyncConfig::new(1));
        sync.store().insert_with_id("posts", "local-1", title("mine"));

        sync.transport
            .queue_pull(Ok(PullResponse::structured(remote_changes(&["remote-1"]), 10)));
        sync.transport.queue_push(Ok(PushResponse::Applied));

        let report = sync.sync().unwrap();
        assert_eq!(report.pulled, 1);
        assert_eq!(report.pushed, 1);
        assert_eq!(report.conflict_retries, 0);

        // Remote record landed, local record is clean.
        assert!(sync.store().get("posts", "remote-1").is_some());
        assert!(sync.store().collect_dirty().unwrap().is_empty());

        // The push carried the post-merge cursor.
        let pushes = sync.transport.push_requests();
        assert_eq!(pushes.len(), 1);
        assert_eq!(pushes[0].last_pulled_at, 10);

        assert_eq!(sync.cursor.load().unwrap().last_pulled_at, 10);
        assert_eq!(sync.state(), SyncState::Idle);
    }

    #[test]
    fn clean_store_skips_push() {
        let sync = orchestrator(SyncConfig::new(1));
        sync.transport
            .queue_pull(Ok(PullResponse::structured(ChangeSet::new(), 5)));

        let report = sync.sync().unwrap();
        assert_eq!(report.pushed, 0);
        assert!(sync.transport.push_requests().is_empty());
    }

    #[test]
    fn conflict_pulls_again_then_succeeds() {
        let sync = orchestrator(SyncConfig::new(1));
        sync.store().insert_with_id("posts", "local-1", title("mine"));

        sync.transport
            .queue_pull(Ok(PullResponse::structured(ChangeSet::new(), 10)));
        sync.transport.queue_push(Ok(PushResponse::Conflict));
        sync.transport
            .queue_pull(Ok(PullResponse::structured(remote_changes(&["racer"]), 20)));
        sync.transport.queue_push(Ok(PushResponse::Applied));

        let report = sync.sync().unwrap();
        assert_eq!(report.conflict_retries, 1);
        assert_eq!(report.pushed, 1);

        // Second push used the refreshed cursor.
        assert_eq!(sync.transport.push_requests()[1].last_pulled_at, 20);
        assert_eq!(sync.stats().conflict_retries, 1);
    }

    #[test]
    fn conflict_exhaustion_surfaces_the_conflict() {
        let sync = orchestrator(SyncConfig::new(1).with_max_conflict_retries(1));
        sync.store().insert_with_id("posts", "local-1", title("mine"));

        for timestamp in [10, 20] {
            sync.transport
                .queue_pull(Ok(PullResponse::structured(ChangeSet::new(), timestamp)));
            sync.transport.queue_push(Ok(PushResponse::Conflict));
        }

        let err = sync.sync().unwrap_err();
        assert!(matches!(err, SyncError::Conflict { attempts: 2 }));
        assert_eq!(sync.state(), SyncState::Idle);
        assert_eq!(sync.stats().syncs_failed, 1);

        // The record is still dirty and will ride the next cycle.
        assert_eq!(sync.store().collect_dirty().unwrap().len(), 1);
    }

    #[test]
    fn partial_rejection_marks_only_the_rejected() {
        let sync = orchestrator(SyncConfig::new(1));
        sync.store().insert_with_id("posts", "bad", title("a"));
        sync.store().insert_with_id("posts", "good", title("b"));

        sync.transport
            .queue_pull(Ok(PullResponse::structured(ChangeSet::new(), 10)));
        sync.transport.queue_push(Ok(PushResponse::PartiallyApplied {
            rejected_ids: vec!["bad".into()],
        }));

        let report = sync.sync().unwrap();
        assert_eq!(report.pushed, 1);
        assert_eq!(report.rejected, vec!["bad".to_string()]);

        // Neither record is dirty any more: one synced, one failed.
        assert!(sync.store().collect_dirty().unwrap().is_empty());
        assert!(sync.store().get("posts", "bad").is_some());
    }

    #[test]
    fn cancellation_stops_before_the_pull() {
        let sync = orchestrator(SyncConfig::new(1));
        sync.cancel();

        assert!(matches!(sync.sync().unwrap_err(), SyncError::Cancelled));
        assert!(sync.transport.pull_requests().is_empty());
        assert_eq!(sync.state(), SyncState::Idle);

        // The flag was consumed; the next cycle runs normally.
        sync.transport
            .queue_pull(Ok(PullResponse::structured(ChangeSet::new(), 5)));
        sync.sync().unwrap();
    }

    #[test]
    fn turbo_requested_only_on_first_sync() {
        let sync = orchestrator(SyncConfig::new(1).with_turbo_bootstrap());
        sync.transport.queue_pull(Ok(PullResponse::turbo(
            remote_changes(&["seed"]),
            10,
        )
        .unwrap()));
        sync.transport
            .queue_pull(Ok(PullResponse::structured(ChangeSet::new(), 20)));

        sync.sync().unwrap();
        sync.sync().unwrap();

        let pulls = sync.transport.pull_requests();
        assert!(pulls[0].turbo);
        assert!(!pulls[1].turbo);
        assert!(sync.store().get("posts", "seed").is_some());
    }

    #[test]
    fn schema_upgrade_attaches_a_migration() {
        let history = SchemaHistory::new()
            .with_step(SchemaStep::to(1).adds_table("posts"))
            .unwrap()
            .with_step(SchemaStep::to(2).adds_table("comments"))
            .unwrap();

        let cursor_store = MemoryCursorStore::new();
        cursor_store
            .save(&SyncCursor {
                last_pulled_at: 10,
                schema_version: 1,
                pending_migration: None,
            })
            .unwrap();

        let sync = SyncOrchestrator::new(
            MockTransport::new(),
            MemoryLocalStore::new(),
            cursor_store,
            SyncConfig::new(2).with_history(history),
        );
        sync.transport
            .queue_pull(Ok(PullResponse::structured(ChangeSet::new(), 20)));

        sync.sync().unwrap();

        let pulls = sync.transport.pull_requests();
        let migration = pulls[0].migration.as_ref().unwrap();
        assert_eq!(migration.from_version, 1);
        assert!(migration.new_tables.contains("comments"));

        // The upgrade is confirmed: no migration on the next pull.
        let cursor = sync.cursor.load().unwrap();
        assert_eq!(cursor.schema_version, 2);
        assert!(cursor.pending_migration.is_none());
    }

    #[test]
    fn bootstrap_skips_migration() {
        let history = SchemaHistory::new()
            .with_step(SchemaStep::to(2).adds_table("posts"))
            .unwrap();
        let sync = orchestrator(SyncConfig::new(2).with_history(history));
        sync.transport
            .queue_pull(Ok(PullResponse::structured(ChangeSet::new(), 5)));

        sync.sync().unwrap();
        assert!(sync.transport.pull_requests()[0].migration.is_none());
    }

    #[test]
    fn stats_accumulate_across_cycles() {
        let sync = orchestrator(SyncConfig::new(1));
        sync.transport
            .queue_pull(Ok(PullResponse::structured(remote_changes(&["a", "b"]), 5)));
        sync.transport
            .queue_pull(Ok(PullResponse::structured(ChangeSet::new(), 6)));

        sync.sync().unwrap();
        sync.sync().unwrap();

        let stats = sync.stats();
        assert_eq!(stats.syncs_completed, 2);
        assert_eq!(stats.records_pulled, 2);
    }
}
