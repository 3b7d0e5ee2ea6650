//! The in-progress ranking of one voter.
//!
//! Every operation on a [RankedList] keeps the ranks contiguous (`1..=n`, in list order)
//! and returns the record-level [Mutation]s that the synced store must apply to reach
//! the same state.

use std::collections::HashSet;
use std::sync::Arc;

use log::debug;
use serde::{Deserialize, Serialize};
use snafu::{ensure, OptionExt, Snafu};

use crate::config::*;

#[derive(Eq, PartialEq, Debug, Clone, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum RankError {
    #[snafu(display("option {option_id} is already ranked"))]
    DuplicateOption { option_id: OptionId },

    #[snafu(display("option {option_id} is not in the ranking"))]
    NotFound { option_id: OptionId },

    #[snafu(display("option {option_id} is not part of the session"))]
    UnknownOption { option_id: OptionId },

    #[snafu(display("snapshot ranks are not contiguous: expected rank {expected}, found {found}"))]
    NonContiguousRanks { expected: u32, found: u32 },
}

#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct RankedEntry {
    pub vote_id: VoteId,
    pub option_id: OptionId,
    pub rank: u32,
}

/// A record-level change, tagged with the record it applies to.
#[derive(Eq, PartialEq, Debug, Clone)]
pub enum Mutation {
    Insert {
        record: VoteRecord,
    },
    Update {
        original: VoteRecord,
        modified: VoteRecord,
    },
    Delete {
        original: VoteRecord,
    },
}

impl Mutation {
    pub fn key(&self) -> &VoteId {
        match self {
            Mutation::Insert { record } => &record.id,
            Mutation::Update { original, .. } => &original.id,
            Mutation::Delete { original } => &original.id,
        }
    }
}

/// An edit request, as issued by the voter.
#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", content = "option", rename_all = "camelCase")]
pub enum Edit {
    Add(OptionId),
    Remove(OptionId),
    MoveUp(OptionId),
    MoveDown(OptionId),
    Clear,
}

#[derive(Eq, PartialEq, Debug, Clone)]
pub struct RankedList {
    session_id: SessionId,
    voter_id: VoterId,
    // Invariant: entries[i].rank == i + 1
    entries: Vec<RankedEntry>,
    roster: Option<Arc<HashSet<OptionId>>>,
}

impl RankedList {
    pub fn new(session_id: impl Into<SessionId>, voter_id: impl Into<VoterId>) -> RankedList {
        RankedList {
            session_id: session_id.into(),
            voter_id: voter_id.into(),
            entries: Vec::new(),
            roster: None,
        }
    }

    /// Restricts future additions to the given options.
    pub fn with_roster(self, roster: Arc<HashSet<OptionId>>) -> RankedList {
        RankedList {
            roster: Some(roster),
            ..self
        }
    }

    /// Rebuilds a ranking from the vote records of one voter in the store.
    pub fn from_records(
        session_id: impl Into<SessionId>,
        voter_id: impl Into<VoterId>,
        records: &[VoteRecord],
    ) -> Result<RankedList, RankError> {
        let mut sorted: Vec<&VoteRecord> = records.iter().collect();
        sorted.sort_by_key(|r| r.rank);
        let mut list = RankedList::new(session_id, voter_id);
        for (idx, r) in sorted.iter().enumerate() {
            let expected = (idx + 1) as u32;
            ensure!(
                r.rank == expected,
                NonContiguousRanksSnafu {
                    expected,
                    found: r.rank
                }
            );
            ensure!(
                list.rank_of(&r.option_id).is_none(),
                DuplicateOptionSnafu {
                    option_id: r.option_id.clone()
                }
            );
            list.entries.push(RankedEntry {
                vote_id: r.id.clone(),
                option_id: r.option_id.clone(),
                rank: r.rank,
            });
        }
        Ok(list)
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn voter_id(&self) -> &VoterId {
        &self.voter_id
    }

    pub fn entries(&self) -> &[RankedEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn option_ids(&self) -> Vec<&OptionId> {
        self.entries.iter().map(|e| &e.option_id).collect()
    }

    pub fn rank_of(&self, option_id: &OptionId) -> Option<u32> {
        self.entries
            .iter()
            .find(|e| e.option_id == *option_id)
            .map(|e| e.rank)
    }

    /// The options of `roster` this list does not rank yet, in roster order.
    pub fn available<'a>(&self, roster: &'a [VoteOption]) -> Vec<&'a VoteOption> {
        roster
            .iter()
            .filter(|o| self.rank_of(&o.id).is_none())
            .collect()
    }

    /// True if the ranks are exactly `1..=len` in list order and no option repeats.
    pub fn is_contiguous(&self) -> bool {
        let mut seen: HashSet<&OptionId> = HashSet::new();
        self.entries
            .iter()
            .enumerate()
            .all(|(idx, e)| e.rank == (idx + 1) as u32 && seen.insert(&e.option_id))
    }

    pub fn to_ballot(&self) -> Ballot {
        Ballot {
            voter_id: self.voter_id.clone(),
            ranking: self.entries.iter().map(|e| e.option_id.clone()).collect(),
        }
    }

    pub fn records(&self) -> Vec<VoteRecord> {
        self.entries.iter().map(|e| self.record(e)).collect()
    }

    pub fn add(&mut self, option_id: &OptionId) -> Result<Vec<Mutation>, RankError> {
        ensure!(
            self.rank_of(option_id).is_none(),
            DuplicateOptionSnafu {
                option_id: option_id.clone()
            }
        );
        if let Some(roster) = &self.roster {
            ensure!(
                roster.contains(option_id),
                UnknownOptionSnafu {
                    option_id: option_id.clone()
                }
            );
        }
        let entry = RankedEntry {
            vote_id: VoteId::generate(),
            option_id: option_id.clone(),
            rank: (self.entries.len() + 1) as u32,
        };
        debug!(
            "add: voter {} ranks {} at {}",
            self.voter_id, option_id, entry.rank
        );
        let record = self.record(&entry);
        self.entries.push(entry);
        Ok(vec![Mutation::Insert { record }])
    }

    pub fn remove(&mut self, option_id: &OptionId) -> Result<Vec<Mutation>, RankError> {
        let idx = self.position(option_id)?;
        let removed = self.entries.remove(idx);
        let mut res = vec![Mutation::Delete {
            original: self.record(&removed),
        }];
        // Everything below the removed entry moves up by one.
        for i in idx..self.entries.len() {
            let original = self.record(&self.entries[i]);
            self.entries[i].rank -= 1;
            res.push(Mutation::Update {
                original,
                modified: self.record(&self.entries[i]),
            });
        }
        debug!(
            "remove: voter {} dropped {} (rank {}), {} entries shifted",
            self.voter_id,
            option_id,
            removed.rank,
            res.len() - 1
        );
        Ok(res)
    }

    pub fn move_up(&mut self, option_id: &OptionId) -> Result<Vec<Mutation>, RankError> {
        let idx = self.position(option_id)?;
        if idx == 0 {
            return Ok(vec![]);
        }
        Ok(self.swap_with_next(idx - 1))
    }

    pub fn move_down(&mut self, option_id: &OptionId) -> Result<Vec<Mutation>, RankError> {
        let idx = self.position(option_id)?;
        if idx + 1 == self.entries.len() {
            return Ok(vec![]);
        }
        Ok(self.swap_with_next(idx))
    }

    pub fn clear(&mut self) -> Vec<Mutation> {
        let removed: Vec<RankedEntry> = self.entries.drain(..).collect();
        removed
            .iter()
            .map(|e| Mutation::Delete {
                original: self.record(e),
            })
            .collect()
    }

    pub fn apply(&mut self, edit: &Edit) -> Result<Vec<Mutation>, RankError> {
        match edit {
            Edit::Add(option_id) => self.add(option_id),
            Edit::Remove(option_id) => self.remove(option_id),
            Edit::MoveUp(option_id) => self.move_up(option_id),
            Edit::MoveDown(option_id) => self.move_down(option_id),
            Edit::Clear => Ok(self.clear()),
        }
    }

    pub(crate) fn set_roster(&mut self, roster: Option<Arc<HashSet<OptionId>>>) {
        self.roster = roster;
    }

    fn position(&self, option_id: &OptionId) -> Result<usize, RankError> {
        self.entries
            .iter()
            .position(|e| e.option_id == *option_id)
            .context(NotFoundSnafu {
                option_id: option_id.clone(),
            })
    }

    // Transposes the entries at idx and idx + 1. Only these two ranks change.
    fn swap_with_next(&mut self, idx: usize) -> Vec<Mutation> {
        let first_before = self.record(&self.entries[idx]);
        let second_before = self.record(&self.entries[idx + 1]);
        self.entries.swap(idx, idx + 1);
        self.entries[idx].rank = (idx + 1) as u32;
        self.entries[idx + 1].rank = (idx + 2) as u32;
        let first_after = self.record(&self.entries[idx + 1]);
        let second_after = self.record(&self.entries[idx]);
        vec![
            Mutation::Update {
                original: first_before,
                modified: first_after,
            },
            Mutation::Update {
                original: second_before,
                modified: second_after,
            },
        ]
    }

    fn record(&self, entry: &RankedEntry) -> VoteRecord {
        VoteRecord {
            id: entry.vote_id.clone(),
            session_id: self.session_id.clone(),
            voter_id: self.voter_id.clone(),
            option_id: entry.option_id.clone(),
            rank: entry.rank,
        }
    }
}
