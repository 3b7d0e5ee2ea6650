//! Optimistic ballot transactions.
//!
//! A [BallotRegistry] owns the [RankedList] of every (session, voter) pair it has seen.
//! Edits go through a [PendingTransaction]: they are applied to the local list at once
//! and recorded, in call order, as record mutations. Committing sends the whole log to a
//! [SyncedStore] as one batch. The outcome is either a [ConfirmedTransaction] or a
//! [RolledBackTransaction], which the caller may [reopen](BallotRegistry::reopen) to retry
//! or [discard](BallotRegistry::discard) to return to the pre-transaction ranking.
//!
//! At most one transaction is open per (session, voter). Asking for a transaction while
//! one is pending returns that same transaction.

use std::collections::{HashMap, HashSet};
use std::fmt::Display;
use std::sync::Arc;

use log::{debug, info, warn};
use snafu::{OptionExt, ResultExt, Snafu};

use crate::config::*;
use crate::ranked_list::{Edit, Mutation, RankError, RankedList};
use crate::store::{MutationBatch, StoreError, SyncedStore};

#[derive(Eq, PartialEq, Debug, Clone, Hash)]
pub struct BallotKey {
    pub session_id: SessionId,
    pub voter_id: VoterId,
}

impl BallotKey {
    pub fn new(session_id: impl Into<SessionId>, voter_id: impl Into<VoterId>) -> BallotKey {
        BallotKey {
            session_id: session_id.into(),
            voter_id: voter_id.into(),
        }
    }
}

impl Display for BallotKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.voter_id, self.session_id)
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum BallotError {
    #[snafu(display("edit rejected: {source}"))]
    Rank { source: RankError },

    #[snafu(display("a transaction is already open for {key}"))]
    TransactionAlreadyOpen { key: BallotKey },

    #[snafu(display("the transaction of {key} has been sent and is not resolved yet"))]
    CommitInFlight { key: BallotKey },

    #[snafu(display("no pending transaction for {key}"))]
    NoPendingTransaction { key: BallotKey },

    #[snafu(display("transaction {seq} of {key} no longer matches the ballot"))]
    StaleTransaction { key: BallotKey, seq: u64 },

    #[snafu(display("commit of transaction {} failed: {source}", transaction.seq))]
    CommitFailed {
        source: StoreError,
        transaction: Box<RolledBackTransaction>,
    },
}

impl BallotError {
    /// The failed transaction, if this error comes from a commit.
    pub fn into_rolled_back(self) -> Option<RolledBackTransaction> {
        match self {
            BallotError::CommitFailed { transaction, .. } => Some(*transaction),
            _ => None,
        }
    }
}

/// Where a ballot stands with respect to its transaction.
#[derive(Eq, PartialEq, Debug, Clone, Copy)]
pub enum SlotState {
    Idle,
    Pending,
    Committing,
}

/// The open transaction of a ballot. It is the only state that accepts edits.
#[derive(Debug)]
pub struct PendingTransaction {
    seq: u64,
    key: BallotKey,
    base: RankedList,
    mutations: Vec<Mutation>,
}

impl PendingTransaction {
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn key(&self) -> &BallotKey {
        &self.key
    }

    pub fn mutations(&self) -> &[Mutation] {
        &self.mutations
    }
}

/// A transaction that has been handed over to the store.
#[derive(Debug)]
pub struct CommittingTransaction {
    seq: u64,
    key: BallotKey,
    base: RankedList,
    mutations: Vec<Mutation>,
    batch: MutationBatch,
}

impl CommittingTransaction {
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn key(&self) -> &BallotKey {
        &self.key
    }

    /// The request body to send.
    pub fn batch(&self) -> &MutationBatch {
        &self.batch
    }

    pub fn mutations(&self) -> &[Mutation] {
        &self.mutations
    }
}

#[derive(Debug)]
pub struct ConfirmedTransaction {
    seq: u64,
    key: BallotKey,
    txid: TxId,
    mutations: Vec<Mutation>,
}

impl ConfirmedTransaction {
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn key(&self) -> &BallotKey {
        &self.key
    }

    pub fn txid(&self) -> &TxId {
        &self.txid
    }

    pub fn mutations(&self) -> &[Mutation] {
        &self.mutations
    }
}

/// A transaction the store refused. The local ranking still shows its edits.
#[derive(Debug)]
pub struct RolledBackTransaction {
    seq: u64,
    key: BallotKey,
    base: RankedList,
    mutations: Vec<Mutation>,
    reason: StoreError,
    revision: u64,
}

impl RolledBackTransaction {
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn key(&self) -> &BallotKey {
        &self.key
    }

    pub fn mutations(&self) -> &[Mutation] {
        &self.mutations
    }

    pub fn reason(&self) -> &StoreError {
        &self.reason
    }

    pub fn is_retryable(&self) -> bool {
        self.reason.is_retryable()
    }
}

/// Records the mutations produced by the edits of one `mutate` call.
pub struct Recorder<'a> {
    list: &'a mut RankedList,
    log: Vec<Mutation>,
}

impl Recorder<'_> {
    pub fn ranking(&self) -> &RankedList {
        &*self.list
    }

    pub fn add(&mut self, option_id: &OptionId) -> Result<(), RankError> {
        let muts = self.list.add(option_id)?;
        self.log.extend(muts);
        Ok(())
    }

    pub fn remove(&mut self, option_id: &OptionId) -> Result<(), RankError> {
        let muts = self.list.remove(option_id)?;
        self.log.extend(muts);
        Ok(())
    }

    pub fn move_up(&mut self, option_id: &OptionId) -> Result<(), RankError> {
        let muts = self.list.move_up(option_id)?;
        self.log.extend(muts);
        Ok(())
    }

    pub fn move_down(&mut self, option_id: &OptionId) -> Result<(), RankError> {
        let muts = self.list.move_down(option_id)?;
        self.log.extend(muts);
        Ok(())
    }

    pub fn clear(&mut self) {
        let muts = self.list.clear();
        self.log.extend(muts);
    }

    pub fn apply(&mut self, edit: &Edit) -> Result<(), RankError> {
        let muts = self.list.apply(edit)?;
        self.log.extend(muts);
        Ok(())
    }
}

/// Mutable access to a pending transaction and the ranking it edits.
pub struct TransactionMut<'a> {
    ranking: &'a mut RankedList,
    tx: &'a mut PendingTransaction,
}

impl TransactionMut<'_> {
    pub fn seq(&self) -> u64 {
        self.tx.seq
    }

    pub fn ranking(&self) -> &RankedList {
        &*self.ranking
    }

    pub fn mutations(&self) -> &[Mutation] {
        &self.tx.mutations
    }

    /// Runs the edits in `f` against the local ranking and records what they produced.
    ///
    /// Either all the edits of `f` are kept or, when `f` fails, the ranking is put back
    /// as it was before the call and nothing is recorded. Returns the number of
    /// mutations added to the log.
    pub fn mutate<F>(&mut self, f: F) -> Result<usize, BallotError>
    where
        F: FnOnce(&mut Recorder<'_>) -> Result<(), RankError>,
    {
        let snapshot = self.ranking.clone();
        let mut rec = Recorder {
            list: &mut *self.ranking,
            log: Vec::new(),
        };
        match f(&mut rec) {
            Ok(()) => {
                let log = rec.log;
                let count = log.len();
                debug!(
                    "mutate: transaction {} of {} recorded {} mutations",
                    self.tx.seq, self.tx.key, count
                );
                self.tx.mutations.extend(log);
                Ok(count)
            }
            Err(source) => {
                debug!(
                    "mutate: transaction {} of {} reverted: {}",
                    self.tx.seq, self.tx.key, source
                );
                *self.ranking = snapshot;
                Err(BallotError::Rank { source })
            }
        }
    }

    /// Applies a sequence of edits as one `mutate` call.
    pub fn apply(&mut self, edits: &[Edit]) -> Result<usize, BallotError> {
        self.mutate(|rec| edits.iter().try_for_each(|e| rec.apply(e)))
    }
}

#[derive(Debug)]
struct Slot {
    key: BallotKey,
    ranking: RankedList,
    pending: Option<PendingTransaction>,
    // Sequence number of the transaction sent to the store, if any.
    in_flight: Option<u64>,
    // Bumped whenever the ranking is settled by something else than the open transaction.
    revision: u64,
}

impl Slot {
    fn state(&self) -> SlotState {
        if self.in_flight.is_some() {
            SlotState::Committing
        } else if self.pending.is_some() {
            SlotState::Pending
        } else {
            SlotState::Idle
        }
    }
}

/// Owner of the rankings and of their transactions.
#[derive(Debug, Default)]
pub struct BallotRegistry {
    slots: Vec<Slot>,
    index: HashMap<BallotKey, usize>,
    rosters: HashMap<SessionId, Arc<HashSet<OptionId>>>,
    next_seq: u64,
}

impl BallotRegistry {
    pub fn new() -> BallotRegistry {
        BallotRegistry::default()
    }

    /// Restricts the rankings of a session to the given options.
    pub fn set_roster(&mut self, session_id: &SessionId, options: &[VoteOption]) {
        let roster: Arc<HashSet<OptionId>> =
            Arc::new(options.iter().map(|o| o.id.clone()).collect());
        for slot in self.slots.iter_mut() {
            if slot.key.session_id == *session_id {
                slot.ranking.set_roster(Some(roster.clone()));
            }
        }
        self.rosters.insert(session_id.clone(), roster);
    }

    pub fn ranking(&self, key: &BallotKey) -> Option<&RankedList> {
        self.index.get(key).map(|idx| &self.slots[*idx].ranking)
    }

    pub fn state(&self, key: &BallotKey) -> SlotState {
        self.index
            .get(key)
            .map(|idx| self.slots[*idx].state())
            .unwrap_or(SlotState::Idle)
    }

    /// The local rankings of a session as ballots, ordered by voter. Empty rankings are
    /// left out.
    pub fn ballots(&self, session_id: &SessionId) -> Vec<Ballot> {
        let mut res: Vec<Ballot> = self
            .slots
            .iter()
            .filter(|s| s.key.session_id == *session_id && !s.ranking.is_empty())
            .map(|s| s.ranking.to_ballot())
            .collect();
        res.sort_by(|a, b| a.voter_id.cmp(&b.voter_id));
        res
    }

    /// The pending transaction of the ballot, opened if there is none.
    pub fn transaction(&mut self, key: &BallotKey) -> Result<TransactionMut<'_>, BallotError> {
        let idx = self.slot_index(key);
        let slot = &mut self.slots[idx];
        if slot.in_flight.is_some() {
            return TransactionAlreadyOpenSnafu { key: key.clone() }.fail();
        }
        if slot.pending.is_none() {
            self.next_seq += 1;
            debug!("transaction: opening {} for {}", self.next_seq, key);
        }
        let seq = self.next_seq;
        let tx = slot.pending.get_or_insert_with(|| PendingTransaction {
            seq,
            key: slot.key.clone(),
            base: slot.ranking.clone(),
            mutations: Vec::new(),
        });
        Ok(TransactionMut {
            ranking: &mut slot.ranking,
            tx,
        })
    }

    /// Takes the pending transaction out for sending. Until
    /// [finish_commit](BallotRegistry::finish_commit) is called, the ballot accepts no
    /// new transaction and no rollback.
    pub fn begin_commit(&mut self, key: &BallotKey) -> Result<CommittingTransaction, BallotError> {
        let slot = self.slot_mut(key)?;
        ensure_not_in_flight(slot)?;
        let tx = slot
            .pending
            .take()
            .context(NoPendingTransactionSnafu { key: key.clone() })?;
        slot.in_flight = Some(tx.seq);
        let batch = MutationBatch::from_mutations(&tx.mutations);
        debug!(
            "begin_commit: transaction {} of {} carries {} operations",
            tx.seq,
            key,
            batch.len()
        );
        Ok(CommittingTransaction {
            seq: tx.seq,
            key: tx.key,
            base: tx.base,
            mutations: tx.mutations,
            batch,
        })
    }

    /// Settles a sent transaction with the answer of the store.
    ///
    /// On failure the local ranking keeps the optimistic edits. The error carries the
    /// rolled-back transaction so that the caller can reopen or discard it.
    pub fn finish_commit(
        &mut self,
        tx: CommittingTransaction,
        outcome: Result<TxId, StoreError>,
    ) -> Result<ConfirmedTransaction, BallotError> {
        let slot = self.slot_mut(&tx.key)?;
        if slot.in_flight != Some(tx.seq) {
            return StaleTransactionSnafu {
                key: tx.key.clone(),
                seq: tx.seq,
            }
            .fail();
        }
        slot.in_flight = None;
        slot.revision += 1;
        match outcome {
            Ok(txid) => {
                info!(
                    "finish_commit: transaction {} of {} confirmed as {}",
                    tx.seq, tx.key, txid
                );
                Ok(ConfirmedTransaction {
                    seq: tx.seq,
                    key: tx.key,
                    txid,
                    mutations: tx.mutations,
                })
            }
            Err(reason) => {
                warn!(
                    "finish_commit: transaction {} of {} rolled back: {}",
                    tx.seq, tx.key, reason
                );
                let rolled = RolledBackTransaction {
                    seq: tx.seq,
                    key: tx.key,
                    base: tx.base,
                    mutations: tx.mutations,
                    reason: reason.clone(),
                    revision: slot.revision,
                };
                Err(reason).context(CommitFailedSnafu {
                    transaction: Box::new(rolled),
                })
            }
        }
    }

    /// Sends the pending transaction of the ballot to the store and waits for the outcome.
    pub fn commit<S: SyncedStore + ?Sized>(
        &mut self,
        key: &BallotKey,
        store: &mut S,
    ) -> Result<ConfirmedTransaction, BallotError> {
        let tx = self.begin_commit(key)?;
        let outcome = store.commit(&tx.key.session_id, &tx.batch);
        self.finish_commit(tx, outcome)
    }

    /// Drops the pending transaction and restores the ranking it started from.
    /// Returns the discarded mutations.
    pub fn rollback(&mut self, key: &BallotKey) -> Result<Vec<Mutation>, BallotError> {
        let slot = self.slot_mut(key)?;
        ensure_not_in_flight(slot)?;
        let tx = slot
            .pending
            .take()
            .context(NoPendingTransactionSnafu { key: key.clone() })?;
        debug!(
            "rollback: transaction {} of {} dropped {} mutations",
            tx.seq,
            key,
            tx.mutations.len()
        );
        slot.ranking = tx.base;
        Ok(tx.mutations)
    }

    /// Makes a failed transaction pending again, with its log intact.
    pub fn reopen(
        &mut self,
        rolled: RolledBackTransaction,
    ) -> Result<TransactionMut<'_>, BallotError> {
        let slot = self.settled_slot(&rolled)?;
        debug!(
            "reopen: transaction {} of {} is pending again",
            rolled.seq, rolled.key
        );
        let tx = slot.pending.insert(PendingTransaction {
            seq: rolled.seq,
            key: rolled.key,
            base: rolled.base,
            mutations: rolled.mutations,
        });
        Ok(TransactionMut {
            ranking: &mut slot.ranking,
            tx,
        })
    }

    /// Gives up on a failed transaction: the ranking returns to its state before it.
    pub fn discard(
        &mut self,
        rolled: RolledBackTransaction,
    ) -> Result<Vec<Mutation>, BallotError> {
        let slot = self.settled_slot(&rolled)?;
        debug!(
            "discard: transaction {} of {} dropped {} mutations",
            rolled.seq,
            rolled.key,
            rolled.mutations.len()
        );
        slot.ranking = rolled.base;
        slot.revision += 1;
        Ok(rolled.mutations)
    }

    /// Replaces the local ranking with the records read from the store.
    pub fn load(&mut self, key: &BallotKey, records: &[VoteRecord]) -> Result<(), BallotError> {
        let idx = self.slot_index(key);
        let roster = self.rosters.get(&key.session_id).cloned();
        let slot = &mut self.slots[idx];
        if slot.state() != SlotState::Idle {
            return TransactionAlreadyOpenSnafu { key: key.clone() }.fail();
        }
        let mut ranking =
            RankedList::from_records(key.session_id.clone(), key.voter_id.clone(), records)
                .context(RankSnafu)?;
        ranking.set_roster(roster);
        debug!("load: {} now ranks {} options", key, ranking.len());
        slot.ranking = ranking;
        slot.revision += 1;
        Ok(())
    }

    fn slot_index(&mut self, key: &BallotKey) -> usize {
        if let Some(idx) = self.index.get(key) {
            return *idx;
        }
        let mut ranking = RankedList::new(key.session_id.clone(), key.voter_id.clone());
        ranking.set_roster(self.rosters.get(&key.session_id).cloned());
        self.slots.push(Slot {
            key: key.clone(),
            ranking,
            pending: None,
            in_flight: None,
            revision: 0,
        });
        let idx = self.slots.len() - 1;
        self.index.insert(key.clone(), idx);
        idx
    }

    fn slot_mut(&mut self, key: &BallotKey) -> Result<&mut Slot, BallotError> {
        let idx = *self
            .index
            .get(key)
            .context(NoPendingTransactionSnafu { key: key.clone() })?;
        Ok(&mut self.slots[idx])
    }

    // The slot of a rolled-back transaction, provided nothing happened to it since.
    fn settled_slot(&mut self, rolled: &RolledBackTransaction) -> Result<&mut Slot, BallotError> {
        let slot = self.slot_mut(&rolled.key)?;
        if slot.state() != SlotState::Idle {
            return TransactionAlreadyOpenSnafu {
                key: rolled.key.clone(),
            }
            .fail();
        }
        if slot.revision != rolled.revision {
            return StaleTransactionSnafu {
                key: rolled.key.clone(),
                seq: rolled.seq,
            }
            .fail();
        }
        Ok(slot)
    }
}

fn ensure_not_in_flight(slot: &Slot) -> Result<(), BallotError> {
    if slot.in_flight.is_some() {
        return CommitInFlightSnafu {
            key: slot.key.clone(),
        }
        .fail();
    }
    Ok(())
}
