// Ballots in JSON: either submitted rankings or the vote records of the store.

use serde::Deserialize;

use crate::session::{io_common::make_default_id, *};

#[derive(Debug, Clone, Deserialize)]
struct JsonBallot {
    #[serde(rename = "voterId")]
    voter_id: Option<String>,
    ranking: Vec<String>,
    count: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum JsonInput {
    Ballots(Vec<JsonBallot>),
    Records(Vec<VoteRecord>),
}

pub fn read_json_ranking(path: String, _cfs: &FileSource) -> BCliResult<Vec<ParsedBallot>> {
    let default_id = make_default_id(&path);
    let contents = fs::read_to_string(&path).context(OpeningJsonSnafu { path: &path })?;
    let input: JsonInput = serde_json::from_str(&contents).context(ParsingJsonSnafu {})?;
    let res: Vec<ParsedBallot> = match input {
        JsonInput::Ballots(ballots) => ballots
            .into_iter()
            .enumerate()
            .map(|(idx, b)| ParsedBallot {
                id: Some(b.voter_id.unwrap_or_else(|| default_id(idx + 1))),
                count: b.count,
                choices: b.ranking,
            })
            .collect(),
        JsonInput::Records(records) => {
            debug!("read_json_ranking: {} vote records", records.len());
            collect_ballots(&records)
                .context(TallyingSnafu {})?
                .into_iter()
                .map(|b| ParsedBallot {
                    id: Some(b.voter_id.to_string()),
                    count: Some(1),
                    choices: b.ranking.iter().map(|o| o.to_string()).collect(),
                })
                .collect()
        }
    };
    debug!("read_json_ranking: {} ballots from {:?}", res.len(), path);
    Ok(res)
}
