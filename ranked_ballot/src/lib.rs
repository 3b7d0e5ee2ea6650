mod config;
pub mod builder;
pub mod manual;
pub mod ranked_list;
pub mod records;
mod score;
pub mod store;
pub mod transaction;

use log::{debug, info};

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    ops::{Add, AddAssign},
};

pub use crate::config::*;
pub use crate::records::collect_ballots;
pub use crate::score::{score, score_with_rules};

// **** Private structures ****

type RoundId = u32;

/// Position of an option in the roster.
#[derive(Eq, PartialEq, Debug, Clone, Copy, Hash, Ord, PartialOrd)]
pub(crate) struct OptionIdx(pub(crate) u32);

// Invariant: first_valid is still running when the choice is stored in a vote.
#[derive(Eq, PartialEq, Debug, Clone, Hash)]
struct RankedChoice {
    first_valid: OptionIdx,
    rest: Vec<OptionIdx>,
}

impl RankedChoice {
    /// Moves the ballot to its first option that is still running, or exhausts it.
    fn filtered_candidate(&self, still_valid: &HashSet<OptionIdx>) -> Option<RankedChoice> {
        if still_valid.contains(&self.first_valid) {
            return Some(self.clone());
        }
        advance_voting(&self.rest, still_valid).map(|(first_valid, rest)| RankedChoice {
            first_valid,
            rest,
        })
    }
}

#[derive(Eq, PartialEq, Debug, Clone, Copy, PartialOrd, Ord, Hash)]
struct VoteCount(u64);

impl VoteCount {
    const EMPTY: VoteCount = VoteCount(0);
}

impl std::iter::Sum for VoteCount {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        VoteCount(iter.map(|vc| vc.0).sum())
    }
}

impl AddAssign for VoteCount {
    fn add_assign(&mut self, rhs: VoteCount) {
        self.0 += rhs.0;
    }
}

impl Add for VoteCount {
    type Output = VoteCount;
    fn add(self: VoteCount, rhs: VoteCount) -> VoteCount {
        VoteCount(self.0 + rhs.0)
    }
}

/// All the ballots that share the same ranking.
#[derive(Eq, PartialEq, Debug, Clone)]
struct VoteInternal {
    candidates: RankedChoice,
    count: VoteCount,
}

/// Where the ballots of one eliminated option went: running options and exhausted.
type TransferInternal = (OptionIdx, BTreeMap<OptionIdx, VoteCount>, VoteCount);

#[derive(Eq, PartialEq, Debug, Clone)]
enum RoundOutcome {
    Elected(Vec<OptionIdx>),
    Eliminated(Vec<OptionIdx>, Vec<TransferInternal>),
}

#[derive(Eq, PartialEq, Debug, Clone)]
struct RoundStatistics {
    // In roster order
    tally: Vec<(OptionIdx, VoteCount)>,
    total: VoteCount,
    exhausted: VoteCount,
    threshold: VoteCount,
    outcome: RoundOutcome,
}

#[derive(Eq, PartialEq, Debug, Clone)]
struct RoundResult {
    votes: Vec<VoteInternal>,
    // Exhausted ballots carried to the next round
    exhausted: VoteCount,
    stats: RoundStatistics,
}

/// Runs an instant-runoff count over the ballots.
///
/// Arguments:
/// * `options` the roster of the session. Its order decides the order of tie sets.
/// * `ballots` the submitted rankings. Each of them may only name roster options, once.
///
/// Every round counts each ballot for its first option still running. If an option
/// reaches `floor(total / 2) + 1` votes, it wins. Otherwise all the options tied for the
/// lowest count are eliminated together. When every running option is tied for the
/// lowest count, they all win together.
pub fn tally(options: &[VoteOption], ballots: &[Ballot]) -> Result<TallyResult, TallyError> {
    info!(
        "tally: processing {} ballots, {} options",
        ballots.len(),
        options.len()
    );

    let cr = checks(options, ballots)?;
    debug!(
        "tally: {} distinct rankings, {} empty ballots",
        cr.votes.len(),
        cr.exhausted.0
    );

    // The options that are still running, in roster order.
    let mut running: Vec<OptionIdx> = (0..options.len() as u32).map(OptionIdx).collect();
    let mut cur_votes: Vec<VoteInternal> = cr.votes;
    let mut cur_exhausted: VoteCount = cr.exhausted;
    let mut cur_stats: Vec<RoundStatistics> = Vec::new();

    // At least one option leaves each round that is not decided.
    let max_rounds = options.len();
    while cur_stats.len() < max_rounds {
        let round_id = (cur_stats.len() + 1) as RoundId;
        let round_res = run_one_round(&cur_votes, cur_exhausted, &running);
        info!(
            "tally: round {}: tally {:?} threshold {:?} outcome {:?}",
            round_id, round_res.stats.tally, round_res.stats.threshold, round_res.stats.outcome
        );
        cur_votes = round_res.votes;
        cur_exhausted = round_res.exhausted;
        let outcome = round_res.stats.outcome.clone();
        cur_stats.push(round_res.stats);

        match outcome {
            RoundOutcome::Elected(winners) => {
                let rounds = cur_stats
                    .iter()
                    .enumerate()
                    .map(|(idx, s)| round_to_public(s, idx as RoundId + 1, options))
                    .collect::<Vec<Round>>();
                let winner = winner_to_public(&winners, &cur_stats[cur_stats.len() - 1], options);
                return Ok(TallyResult {
                    total_voters: ballots.len() as u64,
                    total_options: options.len() as u64,
                    rounds,
                    winner,
                });
            }
            RoundOutcome::Eliminated(eliminated, _) => {
                running.retain(|oid| !eliminated.contains(oid));
            }
        }
    }
    NoConvergenceSnafu {
        rounds: cur_stats.len() as u32,
    }
    .fail()
}

fn compute_tally(votes: &[VoteInternal], running: &[OptionIdx]) -> Vec<(OptionIdx, VoteCount)> {
    // Every running option shows up, even without votes.
    let mut tally: BTreeMap<OptionIdx, VoteCount> =
        running.iter().map(|oid| (*oid, VoteCount::EMPTY)).collect();
    for v in votes.iter() {
        if let Some(vc) = tally.get_mut(&v.candidates.first_valid) {
            *vc += v.count;
        }
    }
    tally.into_iter().collect()
}

fn get_threshold(total: VoteCount) -> VoteCount {
    VoteCount((total.0 / 2) + 1)
}

fn run_one_round(
    votes: &[VoteInternal],
    exhausted: VoteCount,
    running: &[OptionIdx],
) -> RoundResult {
    let tally = compute_tally(votes, running);
    let total: VoteCount = tally.iter().map(|(_, vc)| *vc).sum();
    let threshold = get_threshold(total);
    debug!(
        "run_one_round: tally: {:?} total: {:?} threshold: {:?}",
        tally, total, threshold
    );

    let winners: Vec<OptionIdx> = tally
        .iter()
        .filter(|(_, vc)| *vc >= threshold)
        .map(|(oid, _)| *oid)
        .collect();
    if !winners.is_empty() {
        return RoundResult {
            votes: votes.to_vec(),
            exhausted,
            stats: RoundStatistics {
                tally,
                total,
                exhausted,
                threshold,
                outcome: RoundOutcome::Elected(winners),
            },
        };
    }

    let min_count = tally
        .iter()
        .map(|(_, vc)| *vc)
        .min()
        .unwrap_or(VoteCount::EMPTY);
    let lowest: Vec<OptionIdx> = tally
        .iter()
        .filter(|(_, vc)| *vc == min_count)
        .map(|(oid, _)| *oid)
        .collect();
    debug!("run_one_round: lowest: {:?} with {:?}", lowest, min_count);

    // Nobody can be eliminated without emptying the race: they all share the win.
    if lowest.len() == tally.len() {
        return RoundResult {
            votes: votes.to_vec(),
            exhausted,
            stats: RoundStatistics {
                tally,
                total,
                exhausted,
                threshold,
                outcome: RoundOutcome::Elected(lowest),
            },
        };
    }

    let remaining: HashSet<OptionIdx> = running
        .iter()
        .filter(|oid| !lowest.contains(oid))
        .cloned()
        .collect();
    let mut transfers: BTreeMap<OptionIdx, (BTreeMap<OptionIdx, VoteCount>, VoteCount)> = lowest
        .iter()
        .map(|oid| (*oid, (BTreeMap::new(), VoteCount::EMPTY)))
        .collect();
    let mut next_exhausted = exhausted;

    let rem_votes: Vec<VoteInternal> = votes
        .iter()
        .filter_map(|va| {
            let new_rank = va.candidates.filtered_candidate(&remaining);
            let old_first = va.candidates.first_valid;
            match (&new_rank, transfers.get_mut(&old_first)) {
                (None, Some(e)) => {
                    e.1 += va.count;
                    next_exhausted += va.count;
                }
                (Some(nr), Some(e)) => {
                    *e.0.entry(nr.first_valid).or_insert(VoteCount::EMPTY) += va.count;
                }
                // The first choice is still running.
                _ => {}
            }
            new_rank.map(|candidates| VoteInternal {
                candidates,
                count: va.count,
            })
        })
        .collect();

    RoundResult {
        votes: rem_votes,
        exhausted: next_exhausted,
        stats: RoundStatistics {
            tally,
            total,
            exhausted,
            threshold,
            outcome: RoundOutcome::Eliminated(
                lowest,
                transfers
                    .into_iter()
                    .map(|(oid, (to, exh))| (oid, to, exh))
                    .collect(),
            ),
        },
    }
}

fn advance_voting(
    choices: &[OptionIdx],
    still_valid: &HashSet<OptionIdx>,
) -> Option<(OptionIdx, Vec<OptionIdx>)> {
    choices
        .iter()
        .position(|oid| still_valid.contains(oid))
        .map(|idx| (choices[idx], choices[idx + 1..].to_vec()))
}

fn option_id(options: &[VoteOption], oid: OptionIdx) -> OptionId {
    options[oid.0 as usize].id.clone()
}

fn round_to_public(stats: &RoundStatistics, round_id: RoundId, options: &[VoteOption]) -> Round {
    let vote_counts: BTreeMap<OptionId, u64> = stats
        .tally
        .iter()
        .map(|(oid, vc)| (option_id(options, *oid), vc.0))
        .collect();
    let (eliminated, winner) = match &stats.outcome {
        RoundOutcome::Elected(winners) => (None, Some(winner_to_public(winners, stats, options))),
        RoundOutcome::Eliminated(eliminated, transfers) => {
            let elimination = Elimination {
                option_ids: eliminated.iter().map(|oid| option_id(options, *oid)).collect(),
                tied_for_last: eliminated.len() > 1,
                transfers: transfers
                    .iter()
                    .map(|(from, to, exhausted)| Transfer {
                        from: option_id(options, *from),
                        to: to
                            .iter()
                            .map(|(oid, vc)| (option_id(options, *oid), vc.0))
                            .collect(),
                        exhausted: exhausted.0,
                    })
                    .collect(),
            };
            (Some(elimination), None)
        }
    };
    Round {
        round: round_id,
        vote_counts,
        total_votes: stats.total.0,
        exhausted: stats.exhausted.0,
        majority_threshold: stats.threshold.0,
        eliminated,
        winner,
    }
}

fn winner_to_public(
    winners: &[OptionIdx],
    stats: &RoundStatistics,
    options: &[VoteOption],
) -> Winner {
    let count_of = |oid: &OptionIdx| -> u64 {
        stats
            .tally
            .iter()
            .find(|(oid2, _)| oid2 == oid)
            .map(|(_, vc)| vc.0)
            .unwrap_or(0)
    };
    match winners {
        [single] => Winner::Single {
            option_id: option_id(options, *single),
            vote_count: count_of(single),
        },
        _ => Winner::Tied {
            tied_winners: winners
                .iter()
                .map(|oid| TiedWinner {
                    option_id: option_id(options, *oid),
                    vote_count: count_of(oid),
                })
                .collect(),
        },
    }
}

/// Indexes the roster. Option ids must be unique and the roster must not be empty.
pub(crate) fn checked_roster(
    options: &[VoteOption],
) -> Result<HashMap<&OptionId, OptionIdx>, TallyError> {
    snafu::ensure!(!options.is_empty(), NoOptionsSnafu);
    let mut index: HashMap<&OptionId, OptionIdx> = HashMap::new();
    for (idx, o) in options.iter().enumerate() {
        if index.insert(&o.id, OptionIdx(idx as u32)).is_some() {
            return DuplicateRosterEntrySnafu {
                option_id: o.id.clone(),
            }
            .fail();
        }
    }
    Ok(index)
}

/// The roster positions of a ballot, in rank order.
pub(crate) fn checked_ranking(
    ballot: &Ballot,
    index: &HashMap<&OptionId, OptionIdx>,
) -> Result<Vec<OptionIdx>, TallyError> {
    let mut seen: HashSet<OptionIdx> = HashSet::new();
    let mut res: Vec<OptionIdx> = Vec::with_capacity(ballot.ranking.len());
    for option_id in ballot.ranking.iter() {
        let oid = match index.get(option_id) {
            Some(oid) => *oid,
            None => {
                return MalformedBallotSnafu {
                    voter_id: ballot.voter_id.clone(),
                    reason: format!("option {} is not part of the session", option_id),
                }
                .fail()
            }
        };
        if !seen.insert(oid) {
            return MalformedBallotSnafu {
                voter_id: ballot.voter_id.clone(),
                reason: format!("option {} is ranked twice", option_id),
            }
            .fail();
        }
        res.push(oid);
    }
    Ok(res)
}

struct CheckResult {
    votes: Vec<VoteInternal>,
    // Ballots that rank nothing
    exhausted: VoteCount,
}

fn checks(options: &[VoteOption], ballots: &[Ballot]) -> Result<CheckResult, TallyError> {
    let index = checked_roster(options)?;
    // Identical rankings are counted once, with their multiplicity.
    let mut aggregated: BTreeMap<Vec<OptionIdx>, VoteCount> = BTreeMap::new();
    let mut exhausted = VoteCount::EMPTY;
    for b in ballots.iter() {
        let ranking = checked_ranking(b, &index)?;
        if ranking.is_empty() {
            exhausted += VoteCount(1);
        } else {
            *aggregated.entry(ranking).or_insert(VoteCount::EMPTY) += VoteCount(1);
        }
    }
    let votes = aggregated
        .into_iter()
        .filter_map(|(ranking, count)| {
            ranking.split_first().map(|(first, rest)| VoteInternal {
                candidates: RankedChoice {
                    first_valid: *first,
                    rest: rest.to_vec(),
                },
                count,
            })
        })
        .collect();
    Ok(CheckResult { votes, exhausted })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn roster(names: &[&str]) -> Vec<VoteOption> {
        names.iter().map(|n| VoteOption::new(*n, *n)).collect()
    }

    fn ballots(groups: &[(&[&str], usize)]) -> Vec<Ballot> {
        let mut res = Vec::new();
        for (ranking, count) in groups.iter() {
            for _ in 0..*count {
                res.push(Ballot::new(format!("v{}", res.len()), ranking));
            }
        }
        res
    }

    fn counts(round: &Round) -> Vec<(String, u64)> {
        round
            .vote_counts
            .iter()
            .map(|(k, v)| (k.to_string(), *v))
            .collect()
    }

    #[test]
    fn elimination_then_majority() {
        init();
        let options = roster(&["X", "Y", "Z"]);
        let bs = ballots(&[
            (&["X", "Y", "Z"], 2),
            (&["Y", "X", "Z"], 2),
            (&["Z", "X", "Y"], 1),
        ]);
        let res = tally(&options, &bs).unwrap();
        assert_eq!(res.total_voters, 5);
        assert_eq!(res.total_options, 3);
        assert_eq!(res.rounds.len(), 2);

        let r1 = &res.rounds[0];
        assert_eq!(
            counts(r1),
            vec![
                ("X".to_string(), 2),
                ("Y".to_string(), 2),
                ("Z".to_string(), 1)
            ]
        );
        assert_eq!(r1.majority_threshold, 3);
        let elim = r1.eliminated.as_ref().unwrap();
        assert_eq!(elim.option_ids, vec![OptionId::from("Z")]);
        assert!(!elim.tied_for_last);
        assert_eq!(elim.transfers[0].to.get(&OptionId::from("X")), Some(&1));
        assert!(r1.winner.is_none());

        let r2 = &res.rounds[1];
        assert_eq!(counts(r2), vec![("X".to_string(), 3), ("Y".to_string(), 2)]);
        assert_eq!(
            res.winner,
            Winner::Single {
                option_id: "X".into(),
                vote_count: 3
            }
        );
        assert_eq!(r2.winner, Some(res.winner.clone()));
    }

    #[test]
    fn even_split_is_a_tie() {
        init();
        let options = roster(&["A", "B"]);
        let bs = ballots(&[(&["A"], 2), (&["B"], 2)]);
        let res = tally(&options, &bs).unwrap();
        assert_eq!(res.rounds.len(), 1);
        assert!(res.rounds[0].eliminated.is_none());
        assert_eq!(
            res.winner,
            Winner::Tied {
                tied_winners: vec![
                    TiedWinner {
                        option_id: "A".into(),
                        vote_count: 2
                    },
                    TiedWinner {
                        option_id: "B".into(),
                        vote_count: 2
                    }
                ]
            }
        );
    }

    #[test]
    fn tied_last_options_leave_together_and_exhausted_ballots_are_counted() {
        init();
        let options = roster(&["A", "B", "C", "D", "E"]);
        let bs = ballots(&[(&["A", "B"], 2), (&["B"], 2), (&["C"], 1)]);
        let res = tally(&options, &bs).unwrap();
        assert_eq!(res.rounds.len(), 3);

        let r1 = &res.rounds[0];
        assert_eq!(r1.vote_counts.len(), 5);
        let e1 = r1.eliminated.as_ref().unwrap();
        assert_eq!(e1.option_ids, vec![OptionId::from("D"), OptionId::from("E")]);
        assert!(e1.tied_for_last);

        let r2 = &res.rounds[1];
        let e2 = r2.eliminated.as_ref().unwrap();
        assert_eq!(e2.option_ids, vec![OptionId::from("C")]);
        assert_eq!(e2.transfers[0].exhausted, 1);

        let r3 = &res.rounds[2];
        assert_eq!(r3.total_votes, 4);
        assert_eq!(r3.exhausted, 1);
        assert_eq!(r3.majority_threshold, 3);
        assert!(res.winner.is_tie());
        assert_eq!(
            res.winner.option_ids(),
            vec![&OptionId::from("A"), &OptionId::from("B")]
        );
    }

    #[test]
    fn empty_ballots_are_exhausted_from_the_start() {
        let options = roster(&["A", "B"]);
        let mut bs = ballots(&[(&["A"], 2), (&["B"], 1)]);
        bs.push(Ballot::new("blank", &[]));
        let res = tally(&options, &bs).unwrap();
        assert_eq!(res.total_voters, 4);
        assert_eq!(res.rounds[0].exhausted, 1);
        assert_eq!(res.rounds[0].total_votes, 3);
        assert_eq!(res.winner.option_ids(), vec![&OptionId::from("A")]);
    }

    #[test]
    fn single_option_wins_without_ballots() {
        let res = tally(&roster(&["A"]), &[]).unwrap();
        assert_eq!(
            res.winner,
            Winner::Single {
                option_id: "A".into(),
                vote_count: 0
            }
        );
    }

    #[test]
    fn malformed_inputs_are_rejected() {
        let options = roster(&["A", "B"]);
        assert_eq!(tally(&[], &[]), Err(TallyError::NoOptions));
        assert!(matches!(
            tally(&options, &ballots(&[(&["A", "Q"], 1)])),
            Err(TallyError::MalformedBallot { .. })
        ));
        assert!(matches!(
            tally(&options, &ballots(&[(&["A", "A"], 1)])),
            Err(TallyError::MalformedBallot { .. })
        ));
        assert_eq!(
            tally(&roster(&["A", "A"]), &[]),
            Err(TallyError::DuplicateRosterEntry {
                option_id: "A".into()
            })
        );
    }

    struct Lcg(u64);

    impl Lcg {
        fn next(&mut self, bound: usize) -> usize {
            self.0 = self
                .0
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            ((self.0 >> 33) as usize) % bound
        }
    }

    fn random_ballots(rng: &mut Lcg, names: &[&str], count: usize) -> Vec<Ballot> {
        (0..count)
            .map(|i| {
                let mut pool: Vec<&str> = names.to_vec();
                let len = rng.next(names.len() + 1);
                let mut ranking = Vec::new();
                for _ in 0..len {
                    ranking.push(pool.remove(rng.next(pool.len())));
                }
                Ballot::new(format!("voter{}", i), &ranking)
            })
            .collect()
    }

    #[test]
    fn result_does_not_depend_on_ballot_order() {
        let names = ["A", "B", "C", "D"];
        let options = roster(&names);
        for seed in 0..30 {
            let mut rng = Lcg(seed);
            let bs = random_ballots(&mut rng, &names, 25);
            let expected = tally(&options, &bs).unwrap();
            let mut shuffled = bs.clone();
            for i in (1..shuffled.len()).rev() {
                let j = rng.next(i + 1);
                shuffled.swap(i, j);
            }
            assert_eq!(tally(&options, &shuffled).unwrap(), expected, "seed {}", seed);
        }
    }

    #[test]
    fn tally_ends_within_one_round_per_option() {
        let names = ["A", "B", "C", "D", "E", "F"];
        let options = roster(&names);
        for seed in 0..50 {
            let mut rng = Lcg(seed + 100);
            let n = rng.next(40);
            let bs = random_ballots(&mut rng, &names, n);
            let res = tally(&options, &bs).unwrap();
            assert!(res.rounds.len() <= names.len());
            let last = res.rounds.last().unwrap();
            assert_eq!(last.winner.as_ref(), Some(&res.winner));
            assert!(res.rounds[..res.rounds.len() - 1]
                .iter()
                .all(|r| r.eliminated.is_some() && r.winner.is_none()));
        }
    }

    #[test]
    fn results_are_shareable_across_threads() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<TallyResult>();
        assert_send_sync::<OptionScore>();
        assert_send_sync::<TallyError>();
    }
}
