use log::{debug, info, warn};

use ranked_ballot::transaction::BallotError;
use ranked_ballot::*;
use snafu::{prelude::*, Snafu};

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use serde_json::json;
use serde_json::Map as JSMap;
use serde_json::Value as JSValue;
use text_diff::print_diff;

use crate::args::Args;
use crate::session::config_reader::*;
use crate::session::edits::{read_edit_script, replay_edits};

pub mod config_reader;
pub mod edits;
mod io_common;
mod io_csv;
mod io_json;
mod io_xlsx;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum CliError {
    #[snafu(display("Error opening file {path}"))]
    OpeningExcel {
        source: calamine::XlsxError,
        path: String,
    },
    #[snafu(display("The Excel file has no worksheet {name:?}"))]
    MissingWorksheet { name: String },
    #[snafu(display("Unexpected cell in row {lineno}: {content}"))]
    ExcelWrongCellType { lineno: u64, content: String },
    #[snafu(display("Error opening file {path}"))]
    OpeningJson {
        source: std::io::Error,
        path: String,
    },
    #[snafu(display("Error parsing JSON content"))]
    ParsingJson { source: serde_json::Error },
    #[snafu(display("Expected a positive number or a column name, found {value}"))]
    ParsingJsonNumber { value: String },
    #[snafu(display("Error opening CSV file {path}"))]
    CsvOpen { source: csv::Error, path: String },
    #[snafu(display("Error reading a CSV line"))]
    CsvLineParse { source: csv::Error },
    #[snafu(display("Row {lineno} has no cell at column {column}"))]
    RowTooShort { lineno: usize, column: usize },
    #[snafu(display("Invalid ballot count {value:?} at line {lineno}"))]
    InvalidCount { lineno: usize, value: String },
    #[snafu(display("The configuration file has no parent directory"))]
    MissingParentDir {},
    #[snafu(display("Error writing {path}"))]
    WritingOutput {
        source: std::io::Error,
        path: String,
    },
    #[snafu(display("Tally failed: {source}"))]
    Tallying { source: TallyError },
    #[snafu(display("Ballot {ballot} has a count of {count}, above the limit of {limit}"))]
    CountTooLarge { ballot: String, count: u64, limit: u64 },
    #[snafu(display("Voter {voter_id} has more than one ballot"))]
    DuplicateVoter { voter_id: String },
    #[snafu(display("Ballot edit failed: {source}"))]
    Editing { source: BallotError },

    #[snafu(whatever, display("{message}"))]
    Whatever {
        message: String,
        #[snafu(source(from(Box<dyn std::error::Error>, Some)))]
        source: Option<Box<dyn std::error::Error>>,
    },
}

pub type CliResult<T> = Result<T, CliError>;
pub type BCliResult<T> = Result<T, Box<CliError>>;

/// One line of an input file, before the choices are resolved against the roster.
#[derive(Eq, PartialEq, Debug, Clone)]
pub struct ParsedBallot {
    pub id: Option<String>,
    pub count: Option<u64>,
    // Option names or ids, in rank order. Blank entries are allowed.
    pub choices: Vec<String>,
}

fn read_ranking_data(root_path: &Path, cfs: &FileSource) -> CliResult<Vec<ParsedBallot>> {
    let p: PathBuf = root_path.join(&cfs.file_path);
    let p2 = p.as_path().display().to_string();
    info!("Attempting to read rank file {:?}", p2);
    let res = match cfs.provider.as_str() {
        "csv" => io_csv::read_csv_ranking(p2, cfs),
        "json" => io_json::read_json_ranking(p2, cfs),
        "xlsx" => io_xlsx::read_xlsx_ranking(p2, cfs),
        x => whatever!("Provider not implemented {:?}", x),
    };
    res.map_err(|e| *e)
}

/// The options named by the ballots, in order of first appearance.
fn infer_options(parsed_ballots: &[ParsedBallot]) -> Vec<VoteOption> {
    let mut seen: HashSet<&str> = HashSet::new();
    let mut res: Vec<VoteOption> = Vec::new();
    for c in parsed_ballots
        .iter()
        .flat_map(|pb| pb.choices.iter())
        .map(|c| c.trim())
    {
        if !c.is_empty() && seen.insert(c) {
            res.push(VoteOption::new(c, c));
        }
    }
    res
}

/// Resolves the choices against the roster and expands the weighted ballots.
///
/// A choice matches an option by id first, then by name. Blank choices are dropped.
/// Choices that match nothing are kept as they are and rejected by the tally.
fn validate_ballots(
    parsed_ballots: &[ParsedBallot],
    options: &[VoteOption],
) -> CliResult<Vec<Ballot>> {
    let ids: HashSet<&str> = options.iter().map(|o| o.id.as_str()).collect();
    let by_name: HashMap<&str, &OptionId> =
        options.iter().map(|o| (o.name.as_str(), &o.id)).collect();

    let mut res: Vec<Ballot> = Vec::new();
    for (idx, pb) in parsed_ballots.iter().enumerate() {
        let ranking: Vec<OptionId> = pb
            .choices
            .iter()
            .map(|c| c.trim())
            .filter(|c| !c.is_empty())
            .map(|c| {
                if ids.contains(c) {
                    OptionId::from(c)
                } else if let Some(oid) = by_name.get(c) {
                    (*oid).clone()
                } else {
                    warn!("validate_ballots: ballot {:?}: unknown choice {:?}", pb.id, c);
                    OptionId::from(c)
                }
            })
            .collect();

        // Default of 1 if not specified
        let count = pb.count.unwrap_or(1);
        let base_id = pb
            .id
            .clone()
            .unwrap_or_else(|| format!("ballot-{:08}", idx + 1));
        ensure!(
            count <= io_common::MAX_COUNT,
            CountTooLargeSnafu {
                ballot: base_id.as_str(),
                count,
                limit: io_common::MAX_COUNT,
            }
        );
        debug!(
            "validate_ballots: {} x{}: {:?}",
            base_id, count, ranking
        );
        for k in 0..count {
            let voter_id = if count == 1 {
                VoterId::new(base_id.clone())
            } else {
                VoterId::new(format!("{}-{}", base_id, k + 1))
            };
            res.push(Ballot {
                voter_id,
                ranking: ranking.clone(),
            });
        }
    }
    Ok(res)
}

fn build_summary_js(
    config: &SessionConfig,
    options: &[VoteOption],
    result: &TallyResult,
    scores: &[OptionScore],
) -> JSValue {
    let mut names: JSMap<String, JSValue> = JSMap::new();
    for o in options.iter() {
        names.insert(o.id.to_string(), json!(o.name));
    }
    json!({
        "config": {
            "session": config.output_settings.session_name,
            "sessionId": config.session_id(),
        },
        "results": {
            "total_voters": result.total_voters,
            "total_options": result.total_options,
            "options": names,
            "rounds": result.rounds,
            "winner": result.winner,
        },
        "scores": scores,
    })
}

fn write_summary(pretty_js: &str, out_path: Option<PathBuf>) -> CliResult<()> {
    match out_path {
        None => {
            println!("{}", pretty_js);
        }
        Some(p) => {
            let path = p.display().to_string();
            info!("Writing summary to {:?}", path);
            fs::write(&p, pretty_js).context(WritingOutputSnafu { path })?;
        }
    }
    Ok(())
}

/// Reads the session, replays the edit script if there is one, then tallies and scores
/// the ballots.
pub fn run_session(args: &Args) -> CliResult<()> {
    let (mut config, root_p): (SessionConfig, PathBuf) = match &args.config {
        Some(config_path) => {
            let config = read_config(config_path)?;
            let root_p = Path::new(config_path.as_str())
                .parent()
                .context(MissingParentDirSnafu {})?
                .to_path_buf();
            (config, root_p)
        }
        None => match &args.input {
            Some(input) => (SessionConfig::for_input(input), PathBuf::new()),
            None => whatever!("Either --config or --input must be provided"),
        },
    };
    // The command line input replaces the sources of the configuration.
    if let Some(input) = &args.input {
        let provider = args
            .input_type
            .clone()
            .unwrap_or_else(|| provider_from_path(input));
        let mut source = FileSource::from_input(input, &provider);
        source.excel_worksheet_name = args.excel_worksheet_name.clone();
        config.ballot_sources = vec![source];
    }
    info!("config: {:?}", config);

    let rules = config.score_rules()?;

    let mut parsed: Vec<ParsedBallot> = Vec::new();
    for cfs in config.ballot_sources.iter() {
        let mut file_data = read_ranking_data(&root_p, cfs)?;
        parsed.append(&mut file_data);
    }
    debug!("parsed ballots: {:?}", parsed.len());

    let options = if config.options.is_empty() {
        let inferred = infer_options(&parsed);
        info!("No options in the configuration, inferred {:?}", inferred);
        inferred
    } else {
        config.roster()
    };
    let mut ballots = validate_ballots(&parsed, &options)?;

    if let Some(edits_path) = &args.edits {
        let steps = read_edit_script(edits_path)?;
        ballots = replay_edits(&config.session_id(), &options, &ballots, &steps)?;
    }

    let result = tally(&options, &ballots).context(TallyingSnafu {})?;
    let scores = score_with_rules(&options, &ballots, &rules).context(TallyingSnafu {})?;
    info!("winner: {:?}", result.winner);

    let result_js = build_summary_js(&config, &options, &result, &scores);
    let pretty_js_stats = serde_json::to_string_pretty(&result_js).context(ParsingJsonSnafu {})?;

    let out_path: Option<PathBuf> = match args.out.as_deref() {
        Some("stdout") => None,
        Some(p) => Some(PathBuf::from(p)),
        None => config
            .output_settings
            .output_directory
            .as_ref()
            .map(|d| root_p.join(d).join("summary.json")),
    };
    write_summary(&pretty_js_stats, out_path)?;

    // The reference summary, if provided for comparison
    if let Some(summary_p) = &args.reference {
        let summary_ref = read_summary(summary_p).map_err(|e| *e)?;
        let pretty_js_summary_ref =
            serde_json::to_string_pretty(&summary_ref).context(ParsingJsonSnafu {})?;
        if pretty_js_summary_ref != pretty_js_stats {
            warn!("Found differences with the reference string");
            print_diff(
                pretty_js_summary_ref.as_str(),
                pretty_js_stats.as_ref(),
                "\n",
            );
            whatever!("Difference detected between calculated summary and reference summary")
        }
        info!("Summary matches the reference {:?}", summary_p);
    }

    Ok(())
}

fn provider_from_path(path: &str) -> String {
    match Path::new(path).extension().and_then(|e| e.to_str()) {
        Some("json") => "json".to_string(),
        Some("xlsx") => "xlsx".to_string(),
        _ => "csv".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pb(id: &str, count: Option<u64>, choices: &[&str]) -> ParsedBallot {
        ParsedBallot {
            id: Some(id.to_string()),
            count,
            choices: choices.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("rbtally-{}-{}", name, std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn args() -> Args {
        Args {
            config: None,
            reference: None,
            out: None,
            input: None,
            input_type: None,
            edits: None,
            excel_worksheet_name: None,
            verbose: false,
        }
    }

    #[test]
    fn choices_resolve_by_id_then_name() {
        let options = vec![VoteOption::new("o1", "Pizza"), VoteOption::new("o2", "Sushi")];
        let ballots = validate_ballots(
            &[
                pb("a", None, &["Sushi", "", "o1"]),
                pb("b", Some(2), &[" Pizza "]),
                pb("c", Some(0), &["Pizza"]),
            ],
            &options,
        )
        .unwrap();
        assert_eq!(
            ballots,
            vec![
                Ballot::new("a", &["o2", "o1"]),
                Ballot::new("b-1", &["o1"]),
                Ballot::new("b-2", &["o1"]),
            ]
        );
    }

    #[test]
    fn oversized_count_is_refused() {
        let options = vec![VoteOption::new("A", "A")];
        let res = validate_ballots(&[pb("big", Some(u64::MAX), &["A"])], &options);
        assert!(matches!(
            res,
            Err(CliError::CountTooLarge { count: u64::MAX, .. })
        ));
    }

    #[test]
    fn options_are_inferred_in_order_of_appearance() {
        let options = infer_options(&[pb("a", None, &["B", "", "A"]), pb("b", None, &["C", "B"])]);
        let ids: Vec<&str> = options.iter().map(|o| o.id.as_str()).collect();
        assert_eq!(ids, vec!["B", "A", "C"]);
    }

    #[test]
    fn provider_follows_the_extension() {
        assert_eq!(provider_from_path("votes.json"), "json");
        assert_eq!(provider_from_path("votes.xlsx"), "xlsx");
        assert_eq!(provider_from_path("votes.txt"), "csv");
    }

    #[test]
    fn session_runs_end_to_end_and_matches_its_reference() {
        let dir = temp_dir("e2e");
        fs::write(
            dir.join("votes.csv"),
            "id,count,first,second,third\nv1,2,X,Y,Z\nv2,2,Y,X,Z\nv3,1,Z,X,Y\n",
        )
        .unwrap();
        fs::write(
            dir.join("session.json"),
            r#"{
                "outputSettings": {"sessionName": "lunch", "outputDirectory": "out"},
                "options": [{"name": "X"}, {"name": "Y"}, {"name": "Z"}],
                "ballotSources": [{
                    "provider": "csv",
                    "filePath": "votes.csv",
                    "firstVoteColumnIndex": "C",
                    "firstVoteRowIndex": 2,
                    "idColumnIndex": 1,
                    "countColumnIndex": 2
                }]
            }"#,
        )
        .unwrap();
        fs::create_dir_all(dir.join("out")).unwrap();

        let mut a = args();
        a.config = Some(dir.join("session.json").display().to_string());
        run_session(&a).unwrap();

        let summary: JSValue =
            serde_json::from_str(&fs::read_to_string(dir.join("out/summary.json")).unwrap())
                .unwrap();
        assert_eq!(summary["config"]["session"], "lunch");
        assert_eq!(summary["results"]["total_voters"], 5);
        assert_eq!(summary["results"]["winner"]["option_id"], "X");
        assert_eq!(summary["results"]["rounds"][0]["eliminated"]["option_ids"][0], "Z");
        assert_eq!(summary["scores"][0]["option_id"], "X");

        // The summary is its own reference.
        a.reference = Some(dir.join("out/summary.json").display().to_string());
        run_session(&a).unwrap();

        // A different reference is reported.
        fs::write(dir.join("other.json"), r#"{"results": {}}"#).unwrap();
        a.reference = Some(dir.join("other.json").display().to_string());
        assert!(matches!(run_session(&a), Err(CliError::Whatever { .. })));
    }

    #[test]
    fn unknown_choice_fails_the_tally() {
        let dir = temp_dir("unknown");
        fs::write(dir.join("votes.csv"), "A,B\nA,Q\n").unwrap();
        fs::write(
            dir.join("session.json"),
            r#"{
                "outputSettings": {"sessionName": "lunch"},
                "options": [{"name": "A"}, {"name": "B"}],
                "ballotSources": [{"provider": "csv", "filePath": "votes.csv"}]
            }"#,
        )
        .unwrap();
        let mut a = args();
        a.config = Some(dir.join("session.json").display().to_string());
        a.out = Some(dir.join("summary.json").display().to_string());
        assert!(matches!(
            run_session(&a),
            Err(CliError::Tallying {
                source: TallyError::MalformedBallot { .. }
            })
        ));
    }
}
