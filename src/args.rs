use clap::Parser;

/// Tallies ranked ballots: instant-runoff winner and positional scores.
#[derive(Parser, Debug, Clone)]
#[clap(author, version, about, long_about = None)]
pub struct Args {
    /// (file path, optional) The JSON file describing the session: options, ballot sources
    /// and scoring rules. Relative paths inside it are resolved from its directory.
    #[clap(short, long, value_parser)]
    pub config: Option<String>,
    /// (file path) A reference summary in JSON format. If provided, rbtally will
    /// check that the computed summary matches the reference.
    #[clap(short, long, value_parser)]
    pub reference: Option<String>,

    /// (file path, 'stdout' or empty) If specified, the summary of the session will be written in JSON format to the given
    /// location. Setting this option overrides the output directory of the --config option.
    #[clap(short, long, value_parser)]
    pub out: Option<String>,

    /// (file path or empty) A file of ballots. Setting this option replaces the ballot sources
    /// of the --config option.
    #[clap(short, long, value_parser)]
    pub input: Option<String>,

    /// (csv, json or xlsx) The type of the input. Inferred from the file extension when not given.
    #[clap(long, value_parser)]
    pub input_type: Option<String>,

    /// (file path, optional) A JSON script of ballot edits, replayed through transactions
    /// before the tally.
    #[clap(short, long, value_parser)]
    pub edits: Option<String>,

    /// (default: first worksheet) When using an Excel file, indicates the name of the worksheet to use.
    #[clap(long, value_parser)]
    pub excel_worksheet_name: Option<String>,

    // Other arguments
    /// If passed as an argument, will turn on verbose logging to the standard output.
    #[clap(long, takes_value = false)]
    pub verbose: bool,
}
