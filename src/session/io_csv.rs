// Ballots from CSV files.

use std::fs::File;

use crate::session::{
    io_common::{make_default_id, RowLayout},
    *,
};

/// One ballot per row. The choices are the cells from the first vote column on, in rank
/// order.
pub fn read_csv_ranking(path: String, cfs: &FileSource) -> BCliResult<Vec<ParsedBallot>> {
    let default_id = make_default_id(&path);
    let layout = RowLayout::from_source(cfs)?;

    let rows = open_rows(&path, layout.first_row)?;
    let mut res: Vec<ParsedBallot> = Vec::new();
    for (idx, row_r) in rows.enumerate() {
        let lineno = layout.first_row + idx + 1;
        let row = row_r.context(CsvLineParseSnafu {})?;
        let cells: Vec<String> = row.iter().map(|c| c.to_string()).collect();
        debug!("read_csv_ranking: lineno: {:?} cells: {:?}", lineno, &cells);
        res.push(layout.ballot(&cells, lineno, &default_id)?);
    }
    Ok(res)
}

// The rows of the file, past the first `skip` ones. Rows may have different lengths.
fn open_rows(path: &str, skip: usize) -> CliResult<std::iter::Skip<csv::StringRecordsIntoIter<File>>> {
    let rdr = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path)
        .context(CsvOpenSnafu { path })?;
    Ok(rdr.into_records().skip(skip))
}
