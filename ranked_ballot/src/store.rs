//! The boundary with the synced record store.
//!
//! A committed transaction is sent as one [MutationBatch]: an ordered list of
//! operations on the `session_votes` relation. The store answers with a single
//! pass/fail outcome.

use std::collections::{BTreeMap, HashMap, HashSet};

use log::{debug, info};
use serde::{Deserialize, Serialize};
use snafu::Snafu;

use crate::config::*;
use crate::ranked_list::Mutation;
use crate::records::collect_ballots;

/// The relation that holds the vote records.
pub const SESSION_VOTES: &str = "session_votes";

#[derive(Eq, PartialEq, Debug, Clone, Snafu)]
#[snafu(visibility(pub))]
pub enum StoreError {
    #[snafu(display("store unavailable: {message}"))]
    Unavailable { message: String },

    #[snafu(display("conflicting write on record {key}: {message}"))]
    Conflict { key: VoteId, message: String },

    #[snafu(display("store rejected the batch ({status}): {message}"))]
    Rejected { status: u16, message: String },
}

impl StoreError {
    /// Transport failures may succeed when sent again. Conflicts and rejections will not,
    /// unless the local state is first reconciled with the store.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Unavailable { .. })
    }
}

#[derive(Eq, PartialEq, Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Insert,
    Update,
    Delete,
}

#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct SyncMetadata {
    pub relation: String,
}

/// The fields of a record that an operation sets.
#[derive(Eq, PartialEq, Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecordChanges {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub id: Option<VoteId>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub session_id: Option<SessionId>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub voter_id: Option<VoterId>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub option_id: Option<OptionId>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub rank: Option<u32>,
}

#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    #[serde(rename = "type")]
    pub kind: OperationKind,
    pub key: VoteId,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub original: Option<VoteRecord>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub modified: Option<VoteRecord>,
    pub changes: RecordChanges,
    #[serde(rename = "syncMetadata")]
    pub sync_metadata: SyncMetadata,
}

impl From<&Mutation> for Operation {
    fn from(m: &Mutation) -> Operation {
        let sync_metadata = SyncMetadata {
            relation: SESSION_VOTES.to_string(),
        };
        match m {
            Mutation::Insert { record } => Operation {
                kind: OperationKind::Insert,
                key: record.id.clone(),
                original: None,
                modified: Some(record.clone()),
                changes: RecordChanges {
                    id: Some(record.id.clone()),
                    session_id: Some(record.session_id.clone()),
                    voter_id: Some(record.voter_id.clone()),
                    option_id: Some(record.option_id.clone()),
                    rank: Some(record.rank),
                },
                sync_metadata,
            },
            Mutation::Update { original, modified } => Operation {
                kind: OperationKind::Update,
                key: original.id.clone(),
                original: Some(original.clone()),
                modified: Some(modified.clone()),
                changes: RecordChanges {
                    rank: Some(modified.rank),
                    ..Default::default()
                },
                sync_metadata,
            },
            Mutation::Delete { original } => Operation {
                kind: OperationKind::Delete,
                key: original.id.clone(),
                original: Some(original.clone()),
                modified: None,
                changes: RecordChanges::default(),
                sync_metadata,
            },
        }
    }
}

/// The body of one commit request.
#[derive(Eq, PartialEq, Debug, Clone, Default, Serialize, Deserialize)]
pub struct MutationBatch {
    pub operations: Vec<Operation>,
}

impl MutationBatch {
    pub fn from_mutations(mutations: &[Mutation]) -> MutationBatch {
        MutationBatch {
            operations: mutations.iter().map(Operation::from).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// SHA-256 of the JSON form of the batch.
    pub fn digest(&self) -> String {
        let js = serde_json::to_string(self).unwrap_or_default();
        sha256::digest(js.as_str())
    }
}

/// The remote source of truth for vote records.
pub trait SyncedStore {
    /// Applies the whole batch, in order, or nothing.
    fn commit(&mut self, session_id: &SessionId, batch: &MutationBatch)
        -> Result<TxId, StoreError>;
}

/// A store that keeps the records in memory.
///
/// It validates batches the way a server would: conflicting keys are refused and a batch
/// may not leave a voter with non-contiguous ranks.
#[derive(Debug, Default)]
pub struct MemoryStore {
    sessions: HashMap<SessionId, BTreeMap<VoteId, VoteRecord>>,
    commits: u64,
    fail_next: Option<StoreError>,
}

impl MemoryStore {
    pub fn new() -> MemoryStore {
        MemoryStore::default()
    }

    /// The next commit fails with the given error, without touching the records.
    pub fn fail_next_commit(&mut self, err: StoreError) {
        self.fail_next = Some(err);
    }

    pub fn commit_count(&self) -> u64 {
        self.commits
    }

    /// All the records of a session, by voter then rank.
    pub fn records(&self, session_id: &SessionId) -> Vec<VoteRecord> {
        let mut res: Vec<VoteRecord> = self
            .sessions
            .get(session_id)
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default();
        res.sort_by(|a, b| (&a.voter_id, a.rank).cmp(&(&b.voter_id, b.rank)));
        res
    }

    pub fn voter_records(&self, session_id: &SessionId, voter_id: &VoterId) -> Vec<VoteRecord> {
        self.records(session_id)
            .into_iter()
            .filter(|r| r.voter_id == *voter_id)
            .collect()
    }

    pub fn ballots(&self, session_id: &SessionId) -> Result<Vec<Ballot>, TallyError> {
        collect_ballots(&self.records(session_id))
    }

    fn apply(
        table: &mut BTreeMap<VoteId, VoteRecord>,
        session_id: &SessionId,
        op: &Operation,
    ) -> Result<(), StoreError> {
        match op.kind {
            OperationKind::Insert => {
                let record = op.modified.as_ref().ok_or_else(|| StoreError::Rejected {
                    status: 422,
                    message: format!("insert of {} carries no record", op.key),
                })?;
                if record.session_id != *session_id {
                    return RejectedSnafu {
                        status: 422u16,
                        message: format!("record {} belongs to session {}", op.key, record.session_id),
                    }
                    .fail();
                }
                if table.contains_key(&op.key) {
                    return ConflictSnafu {
                        key: op.key.clone(),
                        message: "record already exists",
                    }
                    .fail();
                }
                table.insert(op.key.clone(), record.clone());
            }
            OperationKind::Update => {
                let current = table.get_mut(&op.key).ok_or_else(|| StoreError::Conflict {
                    key: op.key.clone(),
                    message: "no such record".to_string(),
                })?;
                if let Some(original) = &op.original {
                    if *original != *current {
                        return ConflictSnafu {
                            key: op.key.clone(),
                            message: "record changed since it was read",
                        }
                        .fail();
                    }
                }
                if let Some(rank) = op.changes.rank {
                    current.rank = rank;
                }
            }
            OperationKind::Delete => {
                if table.remove(&op.key).is_none() {
                    return ConflictSnafu {
                        key: op.key.clone(),
                        message: "no such record",
                    }
                    .fail();
                }
            }
        }
        Ok(())
    }
}

impl SyncedStore for MemoryStore {
    fn commit(
        &mut self,
        session_id: &SessionId,
        batch: &MutationBatch,
    ) -> Result<TxId, StoreError> {
        if let Some(err) = self.fail_next.take() {
            debug!("commit: simulated failure {:?}", err);
            return Err(err);
        }

        // Work on a copy so that a failing operation leaves nothing behind.
        let mut table = self.sessions.get(session_id).cloned().unwrap_or_default();
        let mut touched: HashSet<VoterId> = HashSet::new();
        for op in batch.operations.iter() {
            MemoryStore::apply(&mut table, session_id, op)?;
            if let Some(r) = op.original.as_ref().or(op.modified.as_ref()) {
                touched.insert(r.voter_id.clone());
            }
        }

        for voter_id in touched.iter() {
            let mut ranks: Vec<(u32, &OptionId)> = table
                .values()
                .filter(|r| r.voter_id == *voter_id)
                .map(|r| (r.rank, &r.option_id))
                .collect();
            ranks.sort();
            let mut seen: HashSet<&OptionId> = HashSet::new();
            for (idx, (rank, option_id)) in ranks.iter().enumerate() {
                if *rank != (idx + 1) as u32 || !seen.insert(*option_id) {
                    return RejectedSnafu {
                        status: 422u16,
                        message: format!("ranks of voter {} would not be contiguous", voter_id),
                    }
                    .fail();
                }
            }
        }

        self.sessions.insert(session_id.clone(), table);
        self.commits += 1;
        let digest = batch.digest();
        let txid = TxId(format!("{}-{}", self.commits, &digest[..16]));
        info!(
            "commit: session {} applied {} operations as {}",
            session_id,
            batch.len(),
            txid
        );
        Ok(txid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ranked_list::RankedList;

    fn sid() -> SessionId {
        SessionId::from("lunch")
    }

    #[test]
    fn operations_carry_the_relation_name() {
        let mut l = RankedList::new("lunch", "alice");
        let muts = l.add(&OptionId::from("A")).unwrap();
        let batch = MutationBatch::from_mutations(&muts);
        let js = serde_json::to_value(&batch).unwrap();
        let op = &js["operations"][0];
        assert_eq!(op["type"], "insert");
        assert_eq!(op["syncMetadata"]["relation"], "session_votes");
        assert_eq!(op["changes"]["rank"], 1);
        assert!(op.get("original").is_none());
    }

    #[test]
    fn store_applies_batches_in_order() {
        let mut store = MemoryStore::new();
        let mut l = RankedList::new("lunch", "alice");
        let mut muts = l.add(&OptionId::from("A")).unwrap();
        muts.extend(l.add(&OptionId::from("B")).unwrap());
        muts.extend(l.move_up(&OptionId::from("B")).unwrap());
        let txid = store
            .commit(&sid(), &MutationBatch::from_mutations(&muts))
            .unwrap();
        assert!(txid.as_str().starts_with("1-"));
        assert_eq!(store.records(&sid()), l.records());

        let muts = l.remove(&OptionId::from("B")).unwrap();
        store
            .commit(&sid(), &MutationBatch::from_mutations(&muts))
            .unwrap();
        let ballots = store.ballots(&sid()).unwrap();
        assert_eq!(ballots, vec![Ballot::new("alice", &["A"])]);
    }

    #[test]
    fn conflicting_batches_leave_the_store_untouched() {
        let mut store = MemoryStore::new();
        let mut l = RankedList::new("lunch", "alice");
        let muts = l.add(&OptionId::from("A")).unwrap();
        let batch = MutationBatch::from_mutations(&muts);
        store.commit(&sid(), &batch).unwrap();
        let before = store.records(&sid());

        // Same insert again.
        let err = store.commit(&sid(), &batch).unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));
        assert!(!err.is_retryable());
        assert_eq!(store.records(&sid()), before);
        assert_eq!(store.commit_count(), 1);
    }

    #[test]
    fn gaps_in_ranks_are_rejected() {
        let mut store = MemoryStore::new();
        let mut l = RankedList::new("lunch", "alice");
        let mut muts = l.add(&OptionId::from("A")).unwrap();
        muts.extend(l.add(&OptionId::from("B")).unwrap());
        // Drop the insert of A: B would be alone at rank 2.
        let batch = MutationBatch::from_mutations(&muts[1..]);
        let err = store.commit(&sid(), &batch).unwrap_err();
        assert!(matches!(err, StoreError::Rejected { status: 422, .. }));
        assert!(store.records(&sid()).is_empty());
    }

    #[test]
    fn simulated_failure_is_consumed_once() {
        let mut store = MemoryStore::new();
        store.fail_next_commit(StoreError::Unavailable {
            message: "timeout".to_string(),
        });
        let batch = MutationBatch::default();
        let err = store.commit(&sid(), &batch).unwrap_err();
        assert!(err.is_retryable());
        assert!(store.commit(&sid(), &batch).is_ok());
    }
}
