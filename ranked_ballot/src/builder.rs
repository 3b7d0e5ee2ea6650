pub use crate::config::*;

/// A builder for assembling a session from option names.
///
/// Option ids are the names themselves. Voter ids are assigned in the order the ballots
/// are added.
///
/// ```
/// pub use ranked_ballot::builder::Builder;
/// pub use ranked_ballot::ScoreRules;
/// # use ranked_ballot::TallyError;
///
/// let mut builder = Builder::new(&ScoreRules::DEFAULT_RULES)?
///     .options(&["Pizza".to_string(), "Sushi".to_string(), "Tacos".to_string()])?;
///
/// builder.add_ballot_simple(&["Sushi".to_string(), "".to_string(), "Pizza".to_string()])?;
/// builder.add_ballot(&["Pizza".to_string()], 2)?;
///
/// let result = builder.tally()?;
/// assert_eq!(result.total_voters, 3);
/// assert_eq!(result.winner.option_ids()[0].as_str(), "Pizza");
///
/// # Ok::<(), TallyError>(())
/// ```
///
/// Without a roster, the options are taken from the ballots, in order of appearance:
///
/// ```
/// # use ranked_ballot::builder::Builder;
/// # use ranked_ballot::{ScoreRules, TallyError};
/// let mut builder = Builder::new(&ScoreRules::DEFAULT_RULES)?;
/// builder.add_ballot(&["Tacos".to_string(), "Sushi".to_string()], 3)?;
/// builder.add_ballot(&["Sushi".to_string()], 1)?;
///
/// let scores = builder.score()?;
/// assert_eq!(scores[0].option_id.as_str(), "Sushi");
/// assert_eq!(scores[0].total_points, 17);
/// assert_eq!(scores[1].total_points, 15);
/// # Ok::<(), TallyError>(())
/// ```
pub struct Builder {
    pub(crate) _rules: ScoreRules,
    pub(crate) _options: Option<Vec<VoteOption>>,
    pub(crate) _ballots: Vec<Ballot>,
}

impl Builder {
    pub fn new(rules: &ScoreRules) -> Result<Builder, TallyError> {
        Ok(Builder {
            _rules: *rules,
            _options: None,
            _ballots: Vec::new(),
        })
    }

    pub fn options(self, names: &[String]) -> Result<Builder, TallyError> {
        Ok(Builder {
            _rules: self._rules,
            _options: Some(
                names
                    .iter()
                    .map(|name| VoteOption::new(name.as_str(), name.as_str()))
                    .collect(),
            ),
            _ballots: Vec::new(),
        })
    }

    /// Adds one ballot.
    pub fn add_ballot_simple(&mut self, names: &[String]) -> Result<(), TallyError> {
        self.add_ballot(names, 1)
    }

    /// Adds `count` identical ballots.
    ///
    /// names: the options chosen by the voter, in order. Empty names are skipped, the
    /// following choices move up.
    pub fn add_ballot(&mut self, names: &[String], count: u32) -> Result<(), TallyError> {
        let ranking: Vec<OptionId> = names
            .iter()
            .filter(|n| !n.is_empty())
            .map(|n| OptionId::from(n.as_str()))
            .collect();
        for _ in 0..count {
            let voter_id = VoterId(format!("voter-{}", self._ballots.len() + 1));
            self.add_ballot_2(&Ballot {
                voter_id,
                ranking: ranking.clone(),
            })?;
        }
        Ok(())
    }

    pub fn add_ballot_2(&mut self, ballot: &Ballot) -> Result<(), TallyError> {
        self._ballots.push(ballot.clone());
        Ok(())
    }

    /// The roster and the ballots collected so far.
    pub fn build(&self) -> (Vec<VoteOption>, Vec<Ballot>) {
        let options = match &self._options {
            Some(opts) => opts.clone(),
            None => {
                let mut res: Vec<VoteOption> = Vec::new();
                for oid in self._ballots.iter().flat_map(|b| b.ranking.iter()) {
                    if !res.iter().any(|o| o.id == *oid) {
                        res.push(VoteOption::new(oid.clone(), oid.as_str()));
                    }
                }
                res
            }
        };
        (options, self._ballots.clone())
    }

    pub fn tally(&self) -> Result<TallyResult, TallyError> {
        let (options, ballots) = self.build();
        crate::tally(&options, &ballots)
    }

    pub fn score(&self) -> Result<Vec<OptionScore>, TallyError> {
        let (options, ballots) = self.build();
        crate::score_with_rules(&options, &ballots, &self._rules)
    }
}
