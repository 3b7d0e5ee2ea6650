use std::path::Path;

use crate::session::config_reader::FileSource;
use crate::session::*;

pub fn simplify_file_name(path: &str) -> String {
    Path::new(path)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(path)
        .to_string()
}

/// Ballot ids for files without an id column: the file name and the line number.
pub fn make_default_id(path: &str) -> impl Fn(usize) -> String {
    let simplified_file_name = simplify_file_name(path);
    move |lineno| format!("{}-{:08}", simplified_file_name, lineno)
}

/// Largest count a single row may carry.
pub const MAX_COUNT: u64 = 1_000_000;

/// Reads a ballot count: an integer, possibly written with a zero fraction (`"4.0"`) as
/// spreadsheets export numbers. Empty cells count as 1.
pub fn parse_count(s: &str) -> Option<u64> {
    let s = s.trim();
    if s.is_empty() {
        return Some(1);
    }
    let digits = match s.split_once('.') {
        Some((int, frac)) if frac.chars().all(|c| c == '0') => int,
        Some(_) => return None,
        None => s,
    };
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    digits.parse::<u64>().ok().filter(|c| *c <= MAX_COUNT)
}

/// Where the id, the count and the choices sit in a row of a tabular file.
#[derive(Eq, PartialEq, Debug, Clone, Copy)]
pub struct RowLayout {
    pub id_column: Option<usize>,
    pub count_column: Option<usize>,
    pub first_choice_column: usize,
    pub first_row: usize,
}

impl RowLayout {
    pub fn from_source(cfs: &FileSource) -> CliResult<RowLayout> {
        Ok(RowLayout {
            id_column: cfs.id_column_index_int()?,
            count_column: cfs.count_column_index_int()?,
            first_choice_column: cfs.first_vote_column_index()?,
            first_row: cfs.first_vote_row_index()?,
        })
    }

    /// Reads one row. `lineno` is 1-based and only used for ids and messages.
    pub fn ballot<F>(&self, cells: &[String], lineno: usize, default_id: F) -> CliResult<ParsedBallot>
    where
        F: Fn(usize) -> String,
    {
        let id = match self.id_column {
            Some(c) => cell_at(cells, lineno, c)?.clone(),
            None => default_id(lineno),
        };
        let count = match self.count_column {
            Some(c) => {
                let value = cell_at(cells, lineno, c)?;
                parse_count(value).context(InvalidCountSnafu { lineno, value })?
            }
            None => 1,
        };
        Ok(ParsedBallot {
            id: Some(id),
            count: Some(count),
            choices: cells.iter().skip(self.first_choice_column).cloned().collect(),
        })
    }
}

fn cell_at(cells: &[String], lineno: usize, column: usize) -> CliResult<&String> {
    cells.get(column).context(RowTooShortSnafu {
        lineno,
        column: column + 1,
    })
}
