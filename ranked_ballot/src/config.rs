// ********* Identifiers ***********

use std::collections::BTreeMap;
use std::fmt::Display;

use serde::{Deserialize, Serialize};
use snafu::Snafu;

macro_rules! opaque_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Eq, PartialEq, Debug, Clone, Hash, Ord, PartialOrd, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(s: impl Into<String>) -> $name {
                $name(s.into())
            }

            pub fn as_str(&self) -> &str {
                self.0.as_str()
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> $name {
                $name(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> $name {
                $name(s)
            }
        }
    };
}

opaque_id!(
    /// Identifier of an option in a voting session.
    OptionId
);
opaque_id!(
    /// Identifier of a voter, as resolved by the identity layer.
    VoterId
);
opaque_id!(SessionId);
opaque_id!(
    /// Identifier of one vote record (one ranked entry of one voter).
    VoteId
);
opaque_id!(
    /// Opaque transaction identifier returned by the store on a successful commit.
    /// Only used for tracing.
    TxId
);

impl VoteId {
    /// A fresh, random record identifier.
    pub fn generate() -> VoteId {
        VoteId(uuid::Uuid::new_v4().to_string())
    }
}

// ********* Input data structures ***********

/// One of the choices offered to the voters of a session.
#[derive(Eq, PartialEq, Debug, Clone, Hash, Serialize, Deserialize)]
pub struct VoteOption {
    pub id: OptionId,
    pub name: String,
}

impl VoteOption {
    pub fn new(id: impl Into<OptionId>, name: impl Into<String>) -> VoteOption {
        VoteOption {
            id: id.into(),
            name: name.into(),
        }
    }
}

/// A submitted ranking. The rank of an option is its position in `ranking`, starting at 1.
#[derive(Eq, PartialEq, Debug, Clone, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ballot {
    pub voter_id: VoterId,
    pub ranking: Vec<OptionId>,
}

impl Ballot {
    pub fn new(voter_id: impl Into<VoterId>, ranking: &[&str]) -> Ballot {
        Ballot {
            voter_id: voter_id.into(),
            ranking: ranking.iter().map(|s| OptionId::from(*s)).collect(),
        }
    }
}

/// A row of the `session_votes` relation, as kept by the synced store.
#[derive(Eq, PartialEq, Debug, Clone, Hash, Serialize, Deserialize)]
pub struct VoteRecord {
    pub id: VoteId,
    pub session_id: SessionId,
    pub voter_id: VoterId,
    pub option_id: OptionId,
    pub rank: u32,
}

// ******** Output data structures *********

/// Where the ballots of an eliminated option went.
#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct Transfer {
    pub from: OptionId,
    pub to: BTreeMap<OptionId, u64>,
    pub exhausted: u64,
}

#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct Elimination {
    pub option_ids: Vec<OptionId>,
    pub tied_for_last: bool,
    pub transfers: Vec<Transfer>,
}

#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct TiedWinner {
    pub option_id: OptionId,
    pub vote_count: u64,
}

#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Winner {
    Single { option_id: OptionId, vote_count: u64 },
    Tied { tied_winners: Vec<TiedWinner> },
}

impl Winner {
    /// The winning options, in roster order.
    pub fn option_ids(&self) -> Vec<&OptionId> {
        match self {
            Winner::Single { option_id, .. } => vec![option_id],
            Winner::Tied { tied_winners } => tied_winners.iter().map(|w| &w.option_id).collect(),
        }
    }

    pub fn is_tie(&self) -> bool {
        matches!(self, Winner::Tied { .. })
    }
}

/// Statistics for one round
#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct Round {
    pub round: u32,
    pub vote_counts: BTreeMap<OptionId, u64>,
    /// Ballots that still had a preference in this round.
    pub total_votes: u64,
    /// Ballots with no remaining preference.
    pub exhausted: u64,
    pub majority_threshold: u64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub eliminated: Option<Elimination>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub winner: Option<Winner>,
}

#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct TallyResult {
    pub total_voters: u64,
    pub total_options: u64,
    pub rounds: Vec<Round>,
    pub winner: Winner,
}

/// Aggregate weighted score of one option.
#[derive(PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct OptionScore {
    pub option_id: OptionId,
    pub total_points: u64,
    pub vote_count: u64,
    /// Mean rank among the ballots that ranked this option, 0 if nobody did.
    pub average_rank: f64,
    pub rank_distribution: BTreeMap<u32, u64>,
}

/// Errors that prevent the tally from completing.
#[derive(Eq, PartialEq, Debug, Clone, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum TallyError {
    #[snafu(display("the session has no options"))]
    NoOptions,

    #[snafu(display("option {option_id} appears twice in the roster"))]
    DuplicateRosterEntry { option_id: OptionId },

    #[snafu(display("malformed ballot from voter {voter_id}: {reason}"))]
    MalformedBallot { voter_id: VoterId, reason: String },

    #[snafu(display("no winner after {rounds} rounds"))]
    NoConvergence { rounds: u32 },
}

// ********* Configuration **********

/// The point scale of the weighted score.
///
/// The option at rank `r` receives `max(top_points + 1 - r, floor_points)` points.
#[derive(Eq, PartialEq, Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ScoreRules {
    pub top_points: u32,
    pub floor_points: u32,
}

impl ScoreRules {
    pub const DEFAULT_RULES: ScoreRules = ScoreRules {
        top_points: 5,
        floor_points: 1,
    };

    pub fn points(&self, rank: u32) -> u32 {
        // At most top_points, so the result fits back in u32.
        let raw = (self.top_points as u64 + 1).saturating_sub(rank as u64);
        raw.max(self.floor_points as u64) as u32
    }
}

impl Default for ScoreRules {
    fn default() -> ScoreRules {
        ScoreRules::DEFAULT_RULES
    }
}
