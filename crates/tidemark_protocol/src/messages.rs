//! Protocol messages for pull and push.

use crate::changes::ChangeSet;
use crate::error::{ProtocolError, ProtocolResult};
use crate::migration::MigrationDescriptor;
use crate::record::{RecordId, Timestamp};
use serde::{Deserialize, Serialize};

/// Pull request from client.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PullRequest {
    /// Timestamp of the last fully merged pull; `0` forces a bootstrap.
    pub last_pulled_at: Timestamp,
    /// The client's current schema version.
    pub schema_version: u32,
    /// Schema additions the client needs backfilled, if it upgraded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub migration: Option<MigrationDescriptor>,
    /// Requests the pre-serialized bootstrap payload. Only meaningful
    /// when `last_pulled_at == 0`; otherwise ignored.
    #[serde(default)]
    pub turbo: bool,
}

impl PullRequest {
    /// Creates a plain incremental pull request.
    pub fn new(last_pulled_at: Timestamp, schema_version: u32) -> Self {
        Self {
            last_pulled_at,
            schema_version,
            migration: None,
            turbo: false,
        }
    }

    /// Attaches a migration descriptor, builder style.
    pub fn with_migration(mut self, migration: MigrationDescriptor) -> Self {
        self.migration = Some(migration);
        self
    }

    /// Requests turbo bootstrap, builder style.
    pub fn with_turbo(mut self) -> Self {
        self.turbo = true;
        self
    }

    /// Returns true if this request starts from a blank client.
    pub fn is_first_sync(&self) -> bool {
        self.last_pulled_at == 0
    }

    /// Encodes to JSON.
    pub fn encode(&self) -> ProtocolResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decodes from JSON.
    pub fn decode(text: &str) -> ProtocolResult<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Pull response from server.
///
/// Either the structured change-set or, in turbo mode, the same structure
/// pre-serialized as one opaque text payload. The two forms carry identical
/// information: [`PullResponse::into_parts`] reconstructs the structured
/// change-set from either.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PullResponse {
    /// Structured per-table changes.
    Structured {
        /// Changes since the request's `last_pulled_at`.
        changes: ChangeSet,
        /// The consistency point: commit timestamp of this response.
        timestamp: Timestamp,
    },
    /// Pre-serialized bootstrap payload.
    Turbo {
        /// The structured response, serialized once server-side.
        payload: String,
    },
}

impl PullResponse {
    /// Creates a structured response.
    pub fn structured(changes: ChangeSet, timestamp: Timestamp) -> Self {
        Self::Structured { changes, timestamp }
    }

    /// Creates a turbo response carrying the given changes pre-serialized.
    pub fn turbo(changes: ChangeSet, timestamp: Timestamp) -> ProtocolResult<Self> {
        let payload = serde_json::to_string(&Self::Structured { changes, timestamp })?;
        Ok(Self::Turbo { payload })
    }

    /// Returns the changes and consistency timestamp, decoding the turbo
    /// payload if necessary.
    pub fn into_parts(self) -> ProtocolResult<(ChangeSet, Timestamp)> {
        match self {
            Self::Structured { changes, timestamp } => Ok((changes, timestamp)),
            Self::Turbo { payload } => {
                let inner: PullResponse = serde_json::from_str(&payload)
                    .map_err(|e| ProtocolError::TurboPayload(e.to_string()))?;
                match inner {
                    Self::Structured { changes, timestamp } => Ok((changes, timestamp)),
                    Self::Turbo { .. } => Err(ProtocolError::TurboPayload(
                        "nested turbo payload".into(),
                    )),
                }
            }
        }
    }

    /// Encodes to JSON.
    pub fn encode(&self) -> ProtocolResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decodes from JSON.
    pub fn decode(text: &str) -> ProtocolResult<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Push request from client.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PushRequest {
    /// The client's locally dirty records.
    pub changes: ChangeSet,
    /// The timestamp of the client's last fully merged pull. The server
    /// rejects the push if any targeted record changed after this point.
    pub last_pulled_at: Timestamp,
}

impl PushRequest {
    /// Creates a push request.
    pub fn new(changes: ChangeSet, last_pulled_at: Timestamp) -> Self {
        Self {
            changes,
            last_pulled_at,
        }
    }

    /// Encodes to JSON.
    pub fn encode(&self) -> ProtocolResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decodes from JSON.
    pub fn decode(text: &str) -> ProtocolResult<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Push response from server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PushResponse {
    /// Every change was applied in one transaction.
    Applied,
    /// A targeted record changed server-side after the client's last pull.
    /// Nothing was applied; the client must re-pull before retrying.
    Conflict,
    /// Record-level validation excluded some ids; the rest committed.
    PartiallyApplied {
        /// Ids the client should mark permanently failed.
        rejected_ids: Vec<RecordId>,
    },
}

impl PushResponse {
    /// Returns true if every submitted change was applied.
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied)
    }

    /// Encodes to JSON.
    pub fn encode(&self) -> ProtocolResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decodes from JSON.
    pub fn decode(text: &str) -> ProtocolResult<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Record;

    fn sample_changes() -> ChangeSet {
        let mut changes = ChangeSet::new();
        let posts = changes.table_mut("posts");
        posts
            .created
            .push(Record::new("p1").with_field("title", "hello"));
        posts.deleted.push("p0".into());
        changes
    }

    #[test]
    fn pull_request_roundtrip() {
        let request = PullRequest::new(42, 3).with_turbo();
        let text = request.encode().unwrap();
        let decoded = PullRequest::decode(&text).unwrap();

        assert_eq!(decoded, request);
        assert!(!decoded.is_first_sync());
    }

    #[test]
    fn pull_request_migration_omitted_when_absent() {
        let text = PullRequest::new(0, 1).encode().unwrap();
        assert!(!text.contains("migration"));
        assert!(PullRequest::decode(&text).unwrap().is_first_sync());
    }

    #[test]
    fn structured_pull_response() {
        let response = PullResponse::structured(sample_changes(), 99);
        let text = response.encode().unwrap();
        let decoded = PullResponse::decode(&text).unwrap();

        let (changes, timestamp) = decoded.into_parts().unwrap();
        assert_eq!(timestamp, 99);
        assert_eq!(changes, sample_changes());
    }

    #[test]
    fn turbo_reconstructs_identical_changes() {
        let turbo = PullResponse::turbo(sample_changes(), 99).unwrap();
        let structured = PullResponse::structured(sample_changes(), 99);

        // Same bytes inside the payload as the structured encoding
        if let PullResponse::Turbo { payload } = &turbo {
            assert_eq!(payload, &structured.encode().unwrap());
        } else {
            panic!("expected turbo response");
        }

        assert_eq!(turbo.into_parts().unwrap(), structured.into_parts().unwrap());
    }

    #[test]
    fn corrupt_turbo_payload_rejected() {
        let response = PullResponse::Turbo {
            payload: "{not json".into(),
        };
        assert!(matches!(
            response.into_parts(),
            Err(ProtocolError::TurboPayload(_))
        ));
    }

    #[test]
    fn push_response_wire_tags() {
        assert_eq!(
            PushResponse::Applied.encode().unwrap(),
            r#"{"status":"applied"}"#
        );
        assert_eq!(
            PushResponse::Conflict.encode().unwrap(),
            r#"{"status":"conflict"}"#
        );

        let partial = PushResponse::PartiallyApplied {
            rejected_ids: vec!["bad".into()],
        };
        let decoded = PushResponse::decode(&partial.encode().unwrap()).unwrap();
        assert_eq!(decoded, partial);
        assert!(!decoded.is_applied());
    }

    mod properties {
        use super::*;
        use crate::record::FieldValue;
        use proptest::prelude::*;

        fn field_value() -> impl Strategy<Value = FieldValue> {
            prop_oneof![
                Just(FieldValue::Null),
                any::<bool>().prop_map(FieldValue::Bool),
                any::<i64>().prop_map(FieldValue::Integer),
                "[a-z ]{0,12}".prop_map(FieldValue::Text),
            ]
        }

        fn record(id: usize) -> impl Strategy<Value = Record> {
            proptest::collection::btree_map("[a-z]{1,6}", field_value(), 0..4).prop_map(
                move |fields| Record {
                    id: format!("rec-{id}"),
                    fields,
                },
            )
        }

        fn change_set() -> impl Strategy<Value = ChangeSet> {
            (0usize..5, 0usize..5, 0usize..5).prop_flat_map(|(c, u, d)| {
                let created: Vec<_> = (0..c).map(record).collect();
                let updated: Vec<_> = (c..c + u).map(record).collect();
                let deleted: Vec<_> = (c + u..c + u + d).map(|i| format!("rec-{i}")).collect();
                (created, updated, Just(deleted)).prop_map(|(created, updated, deleted)| {
                    let mut changes = ChangeSet::new();
                    let table = changes.table_mut("posts");
                    table.created = created;
                    table.updated = updated;
                    table.deleted = deleted;
                    changes
                })
            })
        }

        proptest! {
            // The turbo payload must stay byte-for-byte reconstructable
            // into the same structured change-set.
            #[test]
            fn turbo_equals_structured(changes in change_set(), timestamp in 1u64..1_000_000) {
                let turbo = PullResponse::turbo(changes.clone(), timestamp).unwrap();
                let (decoded, ts) = turbo.into_parts().unwrap();
                prop_assert_eq!(decoded, changes);
                prop_assert_eq!(ts, timestamp);
            }
        }
    }
}
