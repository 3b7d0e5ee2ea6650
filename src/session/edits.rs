// Replays a script of ballot edits through the transaction layer and an in-memory store.

use std::collections::{BTreeSet, HashSet};

use ranked_ballot::ranked_list::Edit;
use ranked_ballot::store::{MemoryStore, StoreError, SyncedStore};
use ranked_ballot::transaction::{BallotKey, BallotRegistry, ConfirmedTransaction};
use serde::{Deserialize, Serialize};

use crate::session::*;

#[derive(Eq, PartialEq, Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepAction {
    Commit,
    Rollback,
}

/// A failure the store reports instead of applying the next commit.
#[derive(Eq, PartialEq, Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SimulatedFailure {
    /// The commit is sent again.
    Unavailable,
    /// The transaction is discarded.
    Rejected,
}

impl SimulatedFailure {
    fn to_store_error(self, voter: &str) -> StoreError {
        match self {
            SimulatedFailure::Unavailable => StoreError::Unavailable {
                message: format!("simulated outage while committing {}", voter),
            },
            SimulatedFailure::Rejected => StoreError::Rejected {
                status: 422,
                message: format!("simulated refusal of {}", voter),
            },
        }
    }
}

/// One voter's edits, then a commit or a rollback.
#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct EditStep {
    pub voter: String,
    #[serde(default)]
    pub edits: Vec<Edit>,
    pub action: StepAction,
    #[serde(rename = "simulateFailure", default)]
    pub simulate_failure: Option<SimulatedFailure>,
}

pub fn read_edit_script(path: &str) -> CliResult<Vec<EditStep>> {
    let contents = fs::read_to_string(path).context(OpeningJsonSnafu { path })?;
    let steps: Vec<EditStep> = serde_json::from_str(&contents).context(ParsingJsonSnafu {})?;
    info!("read_edit_script: {} steps from {:?}", steps.len(), path);
    Ok(steps)
}

/// Stores the seed ballots, applies the steps and returns the ballots held by the store.
///
/// Every seeded voter keeps a ballot, possibly empty. Voters that only appear in the
/// script count once they hold records.
pub fn replay_edits(
    session_id: &SessionId,
    options: &[VoteOption],
    seed: &[Ballot],
    steps: &[EditStep],
) -> CliResult<Vec<Ballot>> {
    let mut registry = BallotRegistry::new();
    registry.set_roster(session_id, options);
    let mut store = MemoryStore::new();

    // A voter holds one ranking, so two seed ballots may not share an id.
    let mut seeded: HashSet<&VoterId> = HashSet::new();
    for ballot in seed.iter() {
        ensure!(
            seeded.insert(&ballot.voter_id),
            DuplicateVoterSnafu {
                voter_id: ballot.voter_id.as_str()
            }
        );
        let key = BallotKey::new(session_id.clone(), ballot.voter_id.clone());
        let edits: Vec<Edit> = ballot.ranking.iter().cloned().map(Edit::Add).collect();
        registry
            .transaction(&key)
            .context(EditingSnafu {})?
            .apply(&edits)
            .context(EditingSnafu {})?;
        commit_logged(&mut registry, &mut store, &key, None)?;
    }
    debug!(
        "replay_edits: seeded {} ballots in {} commits",
        seed.len(),
        store.commit_count()
    );

    for (idx, step) in steps.iter().enumerate() {
        let key = BallotKey::new(session_id.clone(), step.voter.as_str());
        let count = registry
            .transaction(&key)
            .context(EditingSnafu {})?
            .apply(&step.edits)
            .context(EditingSnafu {})?;
        debug!("replay_edits: step {}: {} mutations for {}", idx + 1, count, key);
        match step.action {
            StepAction::Commit => {
                commit_logged(&mut registry, &mut store, &key, step.simulate_failure)?;
            }
            StepAction::Rollback => {
                let dropped = registry.rollback(&key).context(EditingSnafu {})?;
                info!(
                    "replay_edits: step {}: rolled back {} mutations for {}",
                    idx + 1,
                    dropped.len(),
                    key
                );
            }
        }
    }

    let mut ballots = store.ballots(session_id).context(TallyingSnafu {})?;
    let stored: BTreeSet<VoterId> = ballots.iter().map(|b| b.voter_id.clone()).collect();
    for ballot in seed.iter() {
        if !stored.contains(&ballot.voter_id) {
            ballots.push(Ballot {
                voter_id: ballot.voter_id.clone(),
                ranking: Vec::new(),
            });
        }
    }
    ballots.sort_by(|a, b| a.voter_id.cmp(&b.voter_id));
    Ok(ballots)
}

// Commits the pending transaction of the voter and logs the batch sent to the store.
// A retryable failure is sent once more, any other failure discards the transaction.
fn commit_logged(
    registry: &mut BallotRegistry,
    store: &mut MemoryStore,
    key: &BallotKey,
    failure: Option<SimulatedFailure>,
) -> CliResult<Option<ConfirmedTransaction>> {
    if let Some(f) = failure {
        store.fail_next_commit(f.to_store_error(key.voter_id.as_str()));
    }
    let first = send(registry, store, key);
    let rolled = match first {
        Ok(confirmed) => return Ok(Some(confirmed)),
        Err(e) => e.into_rolled_back(),
    };
    let rolled = match rolled {
        Some(rolled) => rolled,
        None => whatever!("Commit of {} failed before reaching the store", key),
    };
    if rolled.is_retryable() {
        info!("commit_logged: retrying {} after: {}", key, rolled.reason());
        registry.reopen(rolled).context(EditingSnafu {})?;
        let confirmed = send(registry, store, key).context(EditingSnafu {})?;
        Ok(Some(confirmed))
    } else {
        warn!("commit_logged: giving up on {}: {}", key, rolled.reason());
        let dropped = registry.discard(rolled).context(EditingSnafu {})?;
        debug!("commit_logged: discarded {} mutations", dropped.len());
        Ok(None)
    }
}

fn send(
    registry: &mut BallotRegistry,
    store: &mut MemoryStore,
    key: &BallotKey,
) -> Result<ConfirmedTransaction, BallotError> {
    let tx = registry.begin_commit(key)?;
    match serde_json::to_string(tx.batch()) {
        Ok(js) => info!("send: {} -> {}", key, js),
        Err(e) => warn!("send: could not render the batch of {}: {}", key, e),
    }
    let outcome = store.commit(&key.session_id, tx.batch());
    registry.finish_commit(tx, outcome)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roster() -> Vec<VoteOption> {
        vec![
            VoteOption::new("A", "A"),
            VoteOption::new("B", "B"),
            VoteOption::new("C", "C"),
        ]
    }

    fn steps(js: &str) -> Vec<EditStep> {
        serde_json::from_str(js).unwrap()
    }

    #[test]
    fn edits_are_committed_or_rolled_back() {
        let seed = vec![Ballot::new("v1", &["A", "B"]), Ballot::new("v2", &["C"])];
        let script = steps(
            r#"[
                {"voter": "v1", "edits": [{"op": "moveDown", "option": "A"}], "action": "commit"},
                {"voter": "v2", "edits": [{"op": "add", "option": "A"}], "action": "rollback"},
                {"voter": "v3", "edits": [{"op": "add", "option": "B"}], "action": "commit"}
            ]"#,
        );
        let ballots = replay_edits(&SessionId::from("s"), &roster(), &seed, &script).unwrap();
        assert_eq!(
            ballots,
            vec![
                Ballot::new("v1", &["B", "A"]),
                Ballot::new("v2", &["C"]),
                Ballot::new("v3", &["B"]),
            ]
        );
    }

    #[test]
    fn unavailable_store_is_retried_and_rejection_discards() {
        let seed = vec![Ballot::new("v1", &["A"])];
        let script = steps(
            r#"[
                {"voter": "v1", "edits": [{"op": "add", "option": "B"}], "action": "commit",
                 "simulateFailure": "unavailable"},
                {"voter": "v1", "edits": [{"op": "add", "option": "C"}], "action": "commit",
                 "simulateFailure": "rejected"}
            ]"#,
        );
        let ballots = replay_edits(&SessionId::from("s"), &roster(), &seed, &script).unwrap();
        assert_eq!(ballots, vec![Ballot::new("v1", &["A", "B"])]);
    }

    #[test]
    fn cleared_seed_ballot_stays_as_empty() {
        let seed = vec![Ballot::new("v1", &["A"]), Ballot::new("v2", &["B"])];
        let script = steps(r#"[{"voter": "v1", "edits": [{"op": "clear"}], "action": "commit"}]"#);
        let ballots = replay_edits(&SessionId::from("s"), &roster(), &seed, &script).unwrap();
        assert_eq!(
            ballots,
            vec![Ballot::new("v1", &[]), Ballot::new("v2", &["B"])]
        );
    }

    #[test]
    fn seed_ballots_sharing_a_voter_are_refused() {
        let seed = vec![Ballot::new("v1", &["A"]), Ballot::new("v1", &["B"])];
        let err = replay_edits(&SessionId::from("s"), &roster(), &seed, &[]).unwrap_err();
        assert!(matches!(
            err,
            CliError::DuplicateVoter { ref voter_id } if voter_id == "v1"
        ));
    }

    #[test]
    fn unknown_option_is_an_edit_error() {
        let script = steps(
            r#"[{"voter": "v1", "edits": [{"op": "add", "option": "Z"}], "action": "commit"}]"#,
        );
        let err = replay_edits(&SessionId::from("s"), &roster(), &[], &script).unwrap_err();
        assert!(matches!(err, CliError::Editing { .. }));
    }

    #[test]
    fn empty_rollback_leaves_no_ballot() {
        let script = steps(r#"[{"voter": "v1", "action": "rollback"}]"#);
        let res = replay_edits(&SessionId::from("s"), &roster(), &[], &script);
        assert!(res.unwrap().is_empty());
    }
}
