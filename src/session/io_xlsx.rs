// Ballots from an Excel worksheet, laid out like the CSV files.

use calamine::{open_workbook, DataType, Range, Reader, Xlsx};

use crate::session::{
    io_common::{make_default_id, RowLayout},
    *,
};

pub fn read_xlsx_ranking(path: String, cfs: &FileSource) -> BCliResult<Vec<ParsedBallot>> {
    let default_id = make_default_id(&path);
    let layout = RowLayout::from_source(cfs)?;
    let wrange = get_range(&path, cfs.excel_worksheet_name.as_deref())?;

    let mut res: Vec<ParsedBallot> = Vec::new();
    for (idx, row) in wrange.rows().enumerate().skip(layout.first_row) {
        let lineno = idx + 1;
        debug!("read_xlsx_ranking: lineno: {:?} row: {:?}", lineno, row);
        let cells = row
            .iter()
            .map(|cell| read_cell(cell, lineno, row))
            .collect::<CliResult<Vec<String>>>()?;
        res.push(layout.ballot(&cells, lineno, &default_id)?);
    }
    Ok(res)
}

// Numbers are read as text, so that ids and counts can be numeric cells.
fn read_cell(cell: &DataType, lineno: usize, row: &[DataType]) -> CliResult<String> {
    match cell {
        DataType::String(s) => Ok(s.clone()),
        DataType::Empty => Ok("".to_string()),
        DataType::Int(i) => Ok(i.to_string()),
        DataType::Float(f) if f.fract() == 0.0 => Ok(format!("{}", *f as i64)),
        DataType::Float(f) => Ok(f.to_string()),
        _ => ExcelWrongCellTypeSnafu {
            lineno: lineno as u64,
            content: format!("{:?} IN {:?}", cell, row),
        }
        .fail(),
    }
}

fn get_range(path: &str, worksheet_name: Option<&str>) -> CliResult<Range<DataType>> {
    debug!("get_range: path: {:?} worksheet: {:?}", path, worksheet_name);
    let mut workbook: Xlsx<_> = open_workbook(path).context(OpeningExcelSnafu { path })?;
    let name = match worksheet_name {
        Some(name) => name.to_string(),
        None => workbook
            .sheet_names()
            .first()
            .cloned()
            .context(MissingWorksheetSnafu { name: "(first)" })?,
    };
    workbook
        .worksheet_range(&name)
        .context(MissingWorksheetSnafu { name: name.as_str() })?
        .context(OpeningExcelSnafu { path })
}
