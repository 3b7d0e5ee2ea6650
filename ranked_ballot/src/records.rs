use std::collections::{BTreeMap, HashSet};

use log::debug;

use crate::config::*;

/// Groups the vote records of a session into one ballot per voter.
///
/// The ballots are ordered by voter id. Within a voter, the records must carry the ranks
/// `1..=n` and name each option at most once.
pub fn collect_ballots(records: &[VoteRecord]) -> Result<Vec<Ballot>, TallyError> {
    let mut by_voter: BTreeMap<&VoterId, Vec<&VoteRecord>> = BTreeMap::new();
    for r in records.iter() {
        by_voter.entry(&r.voter_id).or_default().push(r);
    }

    let mut res: Vec<Ballot> = Vec::with_capacity(by_voter.len());
    for (voter_id, mut rows) in by_voter {
        rows.sort_by_key(|r| r.rank);
        let mut seen: HashSet<&OptionId> = HashSet::new();
        for (idx, r) in rows.iter().enumerate() {
            if r.rank != (idx + 1) as u32 {
                return MalformedBallotSnafu {
                    voter_id: voter_id.clone(),
                    reason: format!("expected rank {} but found rank {}", idx + 1, r.rank),
                }
                .fail();
            }
            if !seen.insert(&r.option_id) {
                return MalformedBallotSnafu {
                    voter_id: voter_id.clone(),
                    reason: format!("option {} is ranked twice", r.option_id),
                }
                .fail();
            }
        }
        res.push(Ballot {
            voter_id: voter_id.clone(),
            ranking: rows.iter().map(|r| r.option_id.clone()).collect(),
        });
    }
    debug!(
        "collect_ballots: {} records -> {} ballots",
        records.len(),
        res.len()
    );
    Ok(res)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(voter: &str, option: &str, rank: u32) -> VoteRecord {
        VoteRecord {
            id: VoteId::new(format!("{}-{}", voter, option)),
            session_id: "lunch".into(),
            voter_id: voter.into(),
            option_id: option.into(),
            rank,
        }
    }

    #[test]
    fn records_are_grouped_and_ordered_by_rank() {
        let records = vec![
            rec("bob", "Y", 2),
            rec("alice", "X", 1),
            rec("bob", "Z", 1),
            rec("alice", "Y", 2),
        ];
        let ballots = collect_ballots(&records).unwrap();
        assert_eq!(
            ballots,
            vec![
                Ballot::new("alice", &["X", "Y"]),
                Ballot::new("bob", &["Z", "Y"])
            ]
        );
    }

    #[test]
    fn gaps_make_a_ballot_malformed() {
        let records = vec![rec("alice", "X", 1), rec("alice", "Y", 3)];
        let err = collect_ballots(&records).unwrap_err();
        assert!(matches!(err, TallyError::MalformedBallot { ref voter_id, .. } if voter_id.as_str() == "alice"));
    }

    #[test]
    fn repeated_option_makes_a_ballot_malformed() {
        let records = vec![rec("alice", "X", 1), rec("alice", "X", 2)];
        assert!(matches!(
            collect_ballots(&records),
            Err(TallyError::MalformedBallot { .. })
        ));
    }
}
