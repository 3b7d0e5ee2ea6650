use crate::session::*;

use serde::{Deserialize, Serialize};
use serde_json::Value as JSValue;

use crate::session::io_common::simplify_file_name;

#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct OutputSettings {
    #[serde(rename = "sessionName")]
    pub session_name: String,
    #[serde(rename = "sessionId")]
    pub session_id: Option<String>,
    #[serde(rename = "outputDirectory")]
    pub output_directory: Option<String>,
}

/// A file of ballots.
///
/// Row and column positions are 1-based. Columns may also be given as spreadsheet letters
/// (`"A"`, `"AB"`).
#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct FileSource {
    pub provider: String,
    #[serde(rename = "filePath")]
    pub file_path: String,
    #[serde(rename = "firstVoteColumnIndex")]
    _first_vote_column_index: Option<JSValue>,
    #[serde(rename = "firstVoteRowIndex")]
    _first_vote_row_index: Option<JSValue>,
    #[serde(rename = "idColumnIndex")]
    pub id_column_index: Option<JSValue>,
    #[serde(rename = "countColumnIndex")]
    pub count_column_index: Option<JSValue>,
    #[serde(rename = "excelWorksheetName")]
    pub excel_worksheet_name: Option<String>,
}

impl FileSource {
    /// A source given on the command line: choices start in the first column of the
    /// first row.
    pub fn from_input(path: &str, provider: &str) -> FileSource {
        FileSource {
            provider: provider.to_string(),
            file_path: path.to_string(),
            _first_vote_column_index: None,
            _first_vote_row_index: None,
            id_column_index: None,
            count_column_index: None,
            excel_worksheet_name: None,
        }
    }

    /// 0-based index of the first choice column. Defaults to the first column.
    pub fn first_vote_column_index(&self) -> CliResult<usize> {
        match &self._first_vote_column_index {
            None => Ok(0),
            x => read_js_position(x),
        }
    }

    /// 0-based index of the first ballot row. Defaults to the first row.
    pub fn first_vote_row_index(&self) -> CliResult<usize> {
        match &self._first_vote_row_index {
            None => Ok(0),
            x => read_js_position(x),
        }
    }

    pub fn id_column_index_int(&self) -> CliResult<Option<usize>> {
        match &self.id_column_index {
            None => Ok(None),
            x => read_js_position(x).map(Some),
        }
    }

    pub fn count_column_index_int(&self) -> CliResult<Option<usize>> {
        match &self.count_column_index {
            None => Ok(None),
            x => read_js_position(x).map(Some),
        }
    }
}

#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct SessionOption {
    pub id: Option<String>,
    pub name: String,
}

#[derive(Eq, PartialEq, Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionRules {
    #[serde(rename = "topPoints")]
    pub top_points: Option<u32>,
    #[serde(rename = "floorPoints")]
    pub floor_points: Option<u32>,
}

#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(rename = "outputSettings")]
    pub output_settings: OutputSettings,
    #[serde(default)]
    pub options: Vec<SessionOption>,
    #[serde(rename = "ballotSources", default)]
    pub ballot_sources: Vec<FileSource>,
    #[serde(default)]
    pub rules: SessionRules,
}

impl SessionConfig {
    /// The configuration used when only an input file is given.
    pub fn for_input(path: &str) -> SessionConfig {
        SessionConfig {
            output_settings: OutputSettings {
                session_name: simplify_file_name(path),
                session_id: None,
                output_directory: None,
            },
            options: Vec::new(),
            ballot_sources: Vec::new(),
            rules: SessionRules::default(),
        }
    }

    /// The session id, or the session name if none is set.
    pub fn session_id(&self) -> SessionId {
        match &self.output_settings.session_id {
            Some(id) if !id.is_empty() => SessionId::new(id.as_str()),
            _ => SessionId::new(self.output_settings.session_name.as_str()),
        }
    }

    /// Options without an id are identified by their name.
    pub fn roster(&self) -> Vec<VoteOption> {
        self.options
            .iter()
            .map(|o| match &o.id {
                Some(id) if !id.is_empty() => VoteOption::new(id.as_str(), o.name.as_str()),
                _ => VoteOption::new(o.name.as_str(), o.name.as_str()),
            })
            .collect()
    }

    pub fn score_rules(&self) -> CliResult<ScoreRules> {
        let defaults = ScoreRules::DEFAULT_RULES;
        let rules = ScoreRules {
            top_points: self.rules.top_points.unwrap_or(defaults.top_points),
            floor_points: self.rules.floor_points.unwrap_or(defaults.floor_points),
        };
        if rules.top_points == 0 {
            whatever!("topPoints must be at least 1");
        }
        if rules.floor_points > rules.top_points {
            whatever!(
                "floorPoints ({}) may not exceed topPoints ({})",
                rules.floor_points,
                rules.top_points
            );
        }
        Ok(rules)
    }
}

pub fn read_config(path: &str) -> CliResult<SessionConfig> {
    let config_str = fs::read_to_string(path).context(OpeningJsonSnafu { path })?;
    let config: SessionConfig = serde_json::from_str(&config_str).context(ParsingJsonSnafu {})?;
    Ok(config)
}

pub fn read_summary(path: &str) -> BCliResult<JSValue> {
    let contents = fs::read_to_string(path).context(OpeningJsonSnafu { path })?;
    let js: JSValue = serde_json::from_str(contents.as_str()).context(ParsingJsonSnafu {})?;
    Ok(js)
}

/// Reads a 1-based position (number, numeric string or spreadsheet column letters) and
/// returns it 0-based.
fn read_js_position(x: &Option<JSValue>) -> CliResult<usize> {
    let pos: Option<usize> = match x {
        Some(JSValue::Number(n)) => n.as_u64().map(|x| x as usize),
        // Parsing the Excel-style columns
        Some(JSValue::String(s)) if !s.is_empty() && s.chars().all(|c| c.is_ascii_alphabetic()) => {
            Some(s.to_ascii_lowercase().chars().fold(0, |acc, c| {
                acc * 26 + ((c as usize) - ('a' as usize) + 1)
            }))
        }
        Some(JSValue::String(s)) => s.parse::<usize>().ok(),
        _ => None,
    };
    pos.and_then(|p| p.checked_sub(1))
        .context(ParsingJsonNumberSnafu {
            value: format!("{:?}", x),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn positions_accept_numbers_and_column_letters() {
        assert_eq!(read_js_position(&Some(json!(1))).unwrap(), 0);
        assert_eq!(read_js_position(&Some(json!("3"))).unwrap(), 2);
        assert_eq!(read_js_position(&Some(json!("C"))).unwrap(), 2);
        assert_eq!(read_js_position(&Some(json!("aa"))).unwrap(), 26);
        assert!(matches!(
            read_js_position(&Some(json!(0))),
            Err(CliError::ParsingJsonNumber { .. })
        ));
        assert!(read_js_position(&Some(json!("B2"))).is_err());
        assert!(read_js_position(&None).is_err());
    }

    #[test]
    fn config_fills_defaults() {
        let config: SessionConfig = serde_json::from_str(
            r#"{
                "outputSettings": {"sessionName": "Friday lunch", "sessionId": "s-42"},
                "options": [{"id": "p", "name": "Pizza"}, {"name": "Sushi"}],
                "rules": {"topPoints": 3}
            }"#,
        )
        .unwrap();
        assert!(config.ballot_sources.is_empty());
        assert_eq!(config.session_id(), SessionId::from("s-42"));
        assert_eq!(
            config.roster(),
            vec![VoteOption::new("p", "Pizza"), VoteOption::new("Sushi", "Sushi")]
        );
        assert_eq!(
            config.score_rules().unwrap(),
            ScoreRules {
                top_points: 3,
                floor_points: 1
            }
        );
    }

    #[test]
    fn inconsistent_point_scale_is_refused() {
        let mut config = SessionConfig::for_input("/tmp/votes.csv");
        assert_eq!(config.session_id(), SessionId::from("votes.csv"));
        config.rules.floor_points = Some(9);
        assert!(matches!(
            config.score_rules(),
            Err(CliError::Whatever { .. })
        ));
    }
}
