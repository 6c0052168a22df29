//! Synchronization characterization (`synchar`)

// Modules
mod args;

// Imports
use {
	self::args::{Args, SubCmd},
	anyhow::Context,
	clap::Parser,
	std::{
		fs,
		io::{self, BufWriter, Write},
		path::Path,
		time::Duration,
	},
	synchar::{data, scanner, Catalog, Config, ContentionAnalyzer, DisassemblyScanner, Driver, SyncLogReader},
	synchar_util::logger,
};

fn main() -> Result<(), anyhow::Error> {
	// Get arguments
	let args = Args::parse();
	logger::pre_init::debug(format!("Args: {args:?}"));

	// Initialize logging
	logger::init(args.log_file.as_deref(), args.log_file_append);

	// Then check the sub-command
	match args.sub_cmd {
		SubCmd::Scan(cmd_args) => self::scan(&cmd_args),
		SubCmd::Analyze(cmd_args) => self::analyze(&cmd_args),
	}
}

/// Scans a disassembly and writes the lock map
fn scan(cmd_args: &args::Scan) -> Result<(), anyhow::Error> {
	let catalog = Catalog::kernel();
	let mut scanner = DisassemblyScanner::new(&catalog);

	match cmd_args.input_file == Path::new("-") {
		true => scanner.scan(io::stdin().lock()),
		false => {
			let input_file = fs::File::open(&cmd_args.input_file).context("Unable to open input file")?;
			scanner.scan(io::BufReader::new(input_file))
		},
	}
	.context("Unable to scan disassembly")?;

	let lines_skipped = scanner.lines_skipped();
	let records = scanner.finish().context("Unable to finish scanning")?;
	let locks = scanner::lock_records(&records).count();
	tracing::info!(locks, lines_skipped, "Scanned disassembly");

	let mut output = self::create_output(cmd_args.output_file.as_deref())?;
	for lock in scanner::lock_records(&records) {
		writeln!(output, "{lock}").context("Unable to write to output file")?;
	}
	output.flush().context("Unable to flush output file")?;

	Ok(())
}

/// Analyzes a sync log and writes the reports
fn analyze(cmd_args: &args::Analyze) -> Result<(), anyhow::Error> {
	// Read the config file, if any
	let mut config = match &cmd_args.config_file {
		Some(config_path) => {
			let config_file = fs::File::open(config_path).context("Unable to open config file")?;
			serde_json::from_reader::<_, Config>(io::BufReader::new(config_file))
				.context("Unable to parse config file")?
		},
		None => Config::default(),
	};

	// Then override it with any arguments
	if let Some(seed) = cmd_args.seed {
		config.seed = seed;
	}
	if let Some(sample_rate) = cmd_args.sample_rate {
		config.sample_rate = sample_rate;
	}
	if let Some(window_size) = cmd_args.window_size {
		config.window_size = window_size;
		config.window_increment = config.window_increment.min(window_size);
	}
	if let Some(sample_repeat) = cmd_args.sample_repeat {
		config.sample_repeat = sample_repeat;
	}
	config.user_only |= cmd_args.user_only;
	config.legacy_metric |= cmd_args.legacy_metric;
	tracing::debug!(?config, "Using config");

	// Run the analyzer
	let log_file = fs::File::open(&cmd_args.log_file).context("Unable to open sync log")?;
	let mut reader = SyncLogReader::new(io::BufReader::new(log_file));
	let mut driver = Driver::new(Duration::from_secs_f64(config.debug_output_period_secs));
	let mut analyzer = ContentionAnalyzer::new(config).context("Unable to create analyzer")?;

	// Note: On an aborted run, we still output all benchmarks that finished before it
	let run_res = driver.run(&mut reader, &mut analyzer);
	let benchmarks = match &run_res {
		Ok(run_output) => {
			tracing::info!(?run_output, "Analyzed sync log");
			analyzer.finish()
		},
		Err(_) => analyzer.reports().to_vec(),
	};

	let data = data::Data {
		lines_read: reader.lines_read(),
		benchmarks,
	};
	self::write_data(cmd_args.output_file.as_deref(), &data)?;

	run_res.map(|_| ()).context("Unable to analyze sync log")
}

/// Writes `data` as json to the output
fn write_data(output_path: Option<&Path>, data: &data::Data) -> Result<(), anyhow::Error> {
	let mut output = self::create_output(output_path)?;
	serde_json::to_writer_pretty(&mut output, data).context("Unable to write to output file")?;
	writeln!(output).context("Unable to write to output file")?;
	output.flush().context("Unable to flush output file")?;

	Ok(())
}

/// Creates the output, or uses stdout if no path is given
fn create_output(output_path: Option<&Path>) -> Result<Box<dyn Write>, anyhow::Error> {
	let output: Box<dyn Write> = match output_path {
		Some(output_path) => Box::new(fs::File::create(output_path).context("Unable to create output file")?),
		None => Box::new(io::stdout().lock()),
	};

	Ok(Box::new(BufWriter::new(output)))
}
