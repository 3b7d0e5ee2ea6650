use std::collections::BTreeMap;

use log::{debug, info};

use crate::config::*;
use crate::{checked_ranking, checked_roster};

/// Weighted score of every option, with the default point scale.
///
/// See [score_with_rules].
pub fn score(options: &[VoteOption], ballots: &[Ballot]) -> Result<Vec<OptionScore>, TallyError> {
    score_with_rules(options, ballots, &ScoreRules::DEFAULT_RULES)
}

/// Weighted score of every option.
///
/// Each ballot gives `rules.points(r)` points to the option it ranks at `r`. The result
/// lists every roster option by decreasing total points. Options with the same total
/// keep their roster order.
pub fn score_with_rules(
    options: &[VoteOption],
    ballots: &[Ballot],
    rules: &ScoreRules,
) -> Result<Vec<OptionScore>, TallyError> {
    info!(
        "score: processing {} ballots, {} options, rules: {:?}",
        ballots.len(),
        options.len(),
        rules
    );
    let index = checked_roster(options)?;

    let mut points: Vec<u64> = vec![0; options.len()];
    let mut rank_sums: Vec<u64> = vec![0; options.len()];
    let mut distributions: Vec<BTreeMap<u32, u64>> = vec![BTreeMap::new(); options.len()];
    for b in ballots.iter() {
        let ranking = checked_ranking(b, &index)?;
        for (pos, oid) in ranking.iter().enumerate() {
            let rank = (pos + 1) as u32;
            let idx = oid.0 as usize;
            points[idx] += rules.points(rank) as u64;
            rank_sums[idx] += rank as u64;
            *distributions[idx].entry(rank).or_insert(0) += 1;
        }
    }

    let mut res: Vec<OptionScore> = options
        .iter()
        .zip(distributions.into_iter())
        .enumerate()
        .map(|(idx, (o, rank_distribution))| {
            let vote_count: u64 = rank_distribution.values().sum();
            let average_rank = if vote_count == 0 {
                0.0
            } else {
                rank_sums[idx] as f64 / vote_count as f64
            };
            OptionScore {
                option_id: o.id.clone(),
                total_points: points[idx],
                vote_count,
                average_rank,
                rank_distribution,
            }
        })
        .collect();
    // Stable: equal totals stay in roster order.
    res.sort_by(|a, b| b.total_points.cmp(&a.total_points));
    debug!(
        "score: {:?}",
        res.iter()
            .map(|s| (s.option_id.as_str(), s.total_points))
            .collect::<Vec<_>>()
    );
    Ok(res)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roster(names: &[&str]) -> Vec<VoteOption> {
        names.iter().map(|n| VoteOption::new(*n, *n)).collect()
    }

    #[test]
    fn points_decrease_with_rank() {
        let options = roster(&["A", "B", "C"]);
        let ballots = vec![
            Ballot::new("v1", &["A", "B", "C"]),
            Ballot::new("v2", &["A", "C", "B"]),
            Ballot::new("v3", &["A", "B", "C"]),
            Ballot::new("v4", &["B", "C", "A"]),
        ];
        let res = score(&options, &ballots).unwrap();
        let a = &res[0];
        assert_eq!(a.option_id, OptionId::from("A"));
        assert_eq!(a.total_points, 18);
        assert_eq!(a.vote_count, 4);
        assert_eq!(a.average_rank, 1.5);
        assert_eq!(a.rank_distribution, BTreeMap::from([(1, 3), (3, 1)]));
        // B: 4 + 3 + 4 + 5, C: 3 + 4 + 3 + 4
        assert_eq!(res[1].option_id, OptionId::from("B"));
        assert_eq!(res[1].total_points, 16);
        assert_eq!(res[2].total_points, 14);
    }

    #[test]
    fn equal_totals_keep_roster_order_and_unranked_options_show_up() {
        let options = roster(&["A", "B", "C", "D"]);
        let ballots = vec![Ballot::new("v1", &["B", "C"]), Ballot::new("v2", &["C", "B"])];
        let res = score(&options, &ballots).unwrap();
        let order: Vec<&str> = res.iter().map(|s| s.option_id.as_str()).collect();
        assert_eq!(order, vec!["B", "C", "A", "D"]);
        assert_eq!(res[2].vote_count, 0);
        assert_eq!(res[2].average_rank, 0.0);
        assert!(res[3].rank_distribution.is_empty());
    }

    #[test]
    fn low_ranks_get_the_floor() {
        let names = ["A", "B", "C", "D", "E", "F", "G"];
        let options = roster(&names);
        let res = score(&options, &[Ballot::new("v1", &names)]).unwrap();
        let totals: Vec<u64> = res.iter().map(|s| s.total_points).collect();
        assert_eq!(totals, vec![5, 4, 3, 2, 1, 1, 1]);

        let rules = ScoreRules {
            top_points: 3,
            floor_points: 0,
        };
        let res = score_with_rules(&options, &[Ballot::new("v1", &names)], &rules).unwrap();
        let totals: Vec<u64> = res.iter().map(|s| s.total_points).collect();
        assert_eq!(totals, vec![3, 2, 1, 0, 0, 0, 0]);
    }

    #[test]
    fn largest_top_points_are_summed_without_overflow() {
        let options = roster(&["A", "B"]);
        let rules = ScoreRules {
            top_points: u32::MAX,
            floor_points: 1,
        };
        let ballots = vec![Ballot::new("v1", &["A", "B"]), Ballot::new("v2", &["A"])];
        let res = score_with_rules(&options, &ballots, &rules).unwrap();
        assert_eq!(res[0].total_points, 2 * u32::MAX as u64);
        assert_eq!(res[1].total_points, u32::MAX as u64 - 1);
    }

    #[test]
    fn unknown_option_is_malformed() {
        let options = roster(&["A"]);
        assert!(matches!(
            score(&options, &[Ballot::new("v1", &["Z"])]),
            Err(TallyError::MalformedBallot { .. })
        ));
        assert_eq!(score(&[], &[]), Err(TallyError::NoOptions));
    }
}
