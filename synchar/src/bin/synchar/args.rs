//! Arguments

// Imports
use std::path::PathBuf;

/// Arguments
#[derive(Debug)]
#[derive(clap::Parser)]
pub struct Args {
	/// Log file
	///
	/// Specifies a file to perform verbose logging to.
	/// You can use `RUST_LOG_FILE` to set filtering options
	#[clap(long = "log-file")]
	pub log_file: Option<PathBuf>,

	/// Whether to append to the log file
	#[clap(long = "log-file-append")]
	pub log_file_append: bool,

	/// Sub-command
	#[command(subcommand)]
	pub sub_cmd: SubCmd,
}

/// Sub-command
#[derive(Debug, clap::Subcommand)]
pub enum SubCmd {
	#[clap(name = "scan")]
	Scan(Scan),

	#[clap(name = "analyze")]
	Analyze(Analyze),
}

/// Finds lock instructions in a disassembly
#[derive(Debug, clap::Args)]
pub struct Scan {
	/// Disassembly file, or `-` for stdin
	pub input_file: PathBuf,

	/// Output file for the lock map, stdout if unspecified
	#[clap(long = "output")]
	pub output_file: Option<PathBuf>,
}

/// Analyzes the worksets of a sync log
#[derive(Debug, clap::Args)]
pub struct Analyze {
	/// Sync log file
	pub log_file: PathBuf,

	/// Config file
	#[clap(long = "config")]
	pub config_file: Option<PathBuf>,

	/// Random seed
	#[clap(long = "seed")]
	pub seed: Option<u64>,

	/// Percentage of worksets to sample
	#[clap(long = "sample-rate")]
	pub sample_rate: Option<u32>,

	/// Worksets per window
	#[clap(long = "window-size")]
	pub window_size: Option<usize>,

	/// Samples per cpu count
	#[clap(long = "sample-repeat")]
	pub sample_repeat: Option<usize>,

	/// Only analyze user-space locks
	#[clap(long = "user-only")]
	pub user_only: bool,

	/// Compute the legacy data dependence metric
	#[clap(long = "legacy-metric")]
	pub legacy_metric: bool,

	/// Output file, stdout if unspecified
	#[clap(long = "output")]
	pub output_file: Option<PathBuf>,
}
