//! Logger

// Imports
use {
	std::{
		env,
		fs,
		io,
		path::Path,
		sync::{Mutex, PoisonError},
	},
	tracing::metadata::LevelFilter,
	tracing_subscriber::{filter::EnvFilter, fmt, prelude::*},
};

/// Environment variable for the terminal filter
pub const TERM_FILTER_VAR: &str = "RUST_LOG";

/// Environment variable for the log file filter
pub const FILE_FILTER_VAR: &str = "RUST_LOG_FILE";

/// Initializes the logger.
///
/// Logs to stderr, filtered by [`TERM_FILTER_VAR`], and, if `log_file` is
/// given, to that file, filtered by [`FILE_FILTER_VAR`].
///
/// Any messages queued through [`pre_init`] are emitted once the logger is set up.
pub fn init(log_file: Option<&Path>, log_file_append: bool) {
	let term_layer = fmt::layer()
		.with_writer(io::stderr)
		.with_filter(self::env_filter(TERM_FILTER_VAR, LevelFilter::INFO));

	let file_layer = log_file.and_then(|log_file| {
		let file = fs::OpenOptions::new()
			.create(true)
			.write(true)
			.append(log_file_append)
			.truncate(!log_file_append)
			.open(log_file);

		match file {
			Ok(file) => Some(
				fmt::layer()
					.with_ansi(false)
					.with_writer(Mutex::new(file))
					.with_filter(self::env_filter(FILE_FILTER_VAR, LevelFilter::TRACE)),
			),
			Err(err) => {
				pre_init::warn(format!("Unable to open log file {log_file:?}: {err}"));
				None
			},
		}
	});

	let res = tracing_subscriber::registry().with(term_layer).with(file_layer).try_init();
	if let Err(err) = res {
		eprintln!("Unable to initialize logger: {err}");
	}

	pre_init::flush();
}

/// Builds an env filter from `var`, defaulting to `default`
fn env_filter(var: &str, default: LevelFilter) -> EnvFilter {
	match env::var(var) {
		Ok(directives) => EnvFilter::builder()
			.with_default_directive(default.into())
			.parse_lossy(directives),
		Err(_) => EnvFilter::default().add_directive(default.into()),
	}
}

/// Logging before the logger is initialized
pub mod pre_init {
	// Imports
	use super::*;

	/// Queued messages
	static MESSAGES: Mutex<Vec<(Level, String)>> = Mutex::new(vec![]);

	/// Queued message level
	#[derive(Clone, Copy, Debug)]
	enum Level {
		Debug,
		Warn,
	}

	/// Queues a debug message
	pub fn debug(msg: impl Into<String>) {
		self::push(Level::Debug, msg.into());
	}

	/// Queues a warning message
	pub fn warn(msg: impl Into<String>) {
		self::push(Level::Warn, msg.into());
	}

	fn push(level: Level, msg: String) {
		MESSAGES.lock().unwrap_or_else(PoisonError::into_inner).push((level, msg));
	}

	/// Emits all queued messages through `tracing`
	pub(super) fn flush() {
		let messages = std::mem::take(&mut *MESSAGES.lock().unwrap_or_else(PoisonError::into_inner));
		for (level, msg) in messages {
			match level {
				Level::Debug => tracing::debug!("{msg}"),
				Level::Warn => tracing::warn!("{msg}"),
			}
		}
	}
}
