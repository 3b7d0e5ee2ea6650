/*!

This is the long-form manual for `ranked_ballot` and `rbtally`.

## Editing a ballot

A ballot is a [RankedList](crate::ranked_list::RankedList): the options of one voter in a
session, ranked 1, 2, 3 with no gap. Every edit returns the record mutations that bring the
store to the new state. Moving an option swaps it with its neighbour, so only two records
change.

Edits go through a [BallotRegistry](crate::transaction::BallotRegistry). The first edit
opens a transaction, which goes through these states:

```text
pending --begin_commit--> committing --finish_commit--> confirmed
   |                                        |
   +--rollback                              +--> rolled back --reopen--> pending
                                                             --discard
```

A rolled-back transaction keeps the edits in the local ranking until it is reopened or
discarded. `Unavailable` failures are worth sending again. `Conflict` and `Rejected` are not.

## Input formats

`rbtally` reads ballots in three formats:
* `csv` Comma Separated Values, one ballot per row
* `json` rankings or vote records
* `xlsx` an Excel worksheet laid out like the CSV files

When the format is not given, it follows the extension of the file (`csv` by default).

### csv

Each column from the first vote column on is a choice, in rank order. Blank cells are skipped.
Choices are matched against the option ids, then the option names.

```text
id,count,choice 1,choice 2,choice 3
id1,20,Pizza,Sushi,Tacos
id2,3,Sushi,,
```

The `id` and `count` columns are optional. A row with a count of 0 is ignored, and a row
with a count of 3 stands for three voters (`id2-1`, `id2-2`, `id2-3`). Without an id column,
the ballots are named after the file and the line number.

### json

Either a list of rankings:

```json
[
  {"voterId": "alice", "ranking": ["Pizza", "Sushi"]},
  {"ranking": ["Tacos"], "count": 2}
]
```

or the vote records of a session, as kept by the store:

```json
[{"id": "r1", "session_id": "lunch", "voter_id": "alice", "option_id": "Pizza", "rank": 1}]
```

The records of a voter must carry the ranks 1..n without gaps or repeats.

### xlsx

Same layout as `csv`. Numbers in cells are read as text. The worksheet is chosen with
`excelWorksheetName` or `--excel-worksheet-name`, else the first one is used.

## Configuration

```json
{
  "outputSettings": {
    "sessionName": "Friday lunch",
    "sessionId": "lunch-42",
    "outputDirectory": "out"
  },
  "options": [{"id": "p", "name": "Pizza"}, {"name": "Sushi"}, {"name": "Tacos"}],
  "ballotSources": [{
    "provider": "csv",
    "filePath": "votes.csv",
    "firstVoteColumnIndex": "C",
    "firstVoteRowIndex": 2,
    "idColumnIndex": 1,
    "countColumnIndex": 2
  }],
  "rules": {"topPoints": 5, "floorPoints": 1}
}
```

- `options` (optional): without it, the options are the distinct choices of the ballots, in
  order of first appearance. An option without `id` is identified by its name.
- positions are 1-based. Columns may also be written as spreadsheet letters.
- `rules` (optional): the first choice of a ballot gets `topPoints`, each following rank one
  point less, never below `floorPoints`.
- the session id defaults to the session name.

## Edit scripts

`--edits` replays a list of steps after the ballots are loaded. Each seeded ballot is first
committed to an in-memory store; the ballots tallied are the ones the store holds at the end.

```json
[
  {"voter": "id1", "edits": [{"op": "moveDown", "option": "Pizza"}], "action": "commit"},
  {"voter": "id2", "edits": [{"op": "clear"}], "action": "rollback"},
  {"voter": "new", "edits": [{"op": "add", "option": "Tacos"}], "action": "commit",
   "simulateFailure": "unavailable"}
]
```

The operations are `add`, `remove`, `moveUp`, `moveDown` and `clear`. Edits name options by
id. `simulateFailure` makes the store refuse the commit: an `unavailable` commit is sent
again, a `rejected` one is discarded.

## Output

The summary is written to `<outputDirectory>/summary.json`, to the path given with `--out`,
or to the standard output. It holds the rounds of the instant-runoff tally, the winner (one
option, or several when all the remaining options tie) and the scores. With `--reference`,
the summary is compared with a previous one and any difference is reported.

 */
