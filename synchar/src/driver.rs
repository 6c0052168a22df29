//! Driver

// Imports
use {
	crate::{sync_log::LogRecord, SyncLogReader},
	anyhow::Context,
	std::{
		fmt,
		io,
		time::{Duration, Instant},
	},
};

/// Driver
#[derive(Debug)]
pub struct Driver {
	/// Debug output period
	///
	/// Interval in which to output debug output for the consumer
	debug_output_period: Duration,
}

impl Driver {
	/// Creates a new driver
	pub fn new(debug_output_period: Duration) -> Self {
		Self { debug_output_period }
	}

	/// Runs the driver on all records from `reader` with consumer `consumer`.
	///
	/// Malformed records are logged and skipped, any other error aborts the run.
	pub fn run<C: LogConsumer>(
		&mut self,
		reader: &mut SyncLogReader<impl io::BufRead>,
		consumer: &mut C,
	) -> Result<RunOutput, anyhow::Error> {
		// Note: We start in the past so that we output right away at the start
		let mut last_debug_time = Instant::now()
			.checked_sub(self.debug_output_period)
			.unwrap_or_else(Instant::now);

		let mut records = 0;
		let mut records_skipped = 0;
		loop {
			let record = match reader.read_next() {
				Ok(Some(record)) => record,
				Ok(None) => break,
				Err(err) if err.is_recoverable() => {
					tracing::warn!(line = reader.lines_read(), "Skipping record: {err}");
					records_skipped += 1;
					continue;
				},
				Err(err) => {
					tracing::error!(line = reader.lines_read(), "Aborting run: {err}");
					return Err(err).context("Unable to read next record");
				},
			};

			consumer
				.handle_record(record)
				.context("Unable to handle record with consumer")?;
			records += 1;

			// Then show debug output, if it's been long enough
			let cur_time = Instant::now();
			if cur_time.duration_since(last_debug_time) >= self.debug_output_period {
				tracing::info!(
					"[{} lines] Debug: {}",
					reader.lines_read(),
					synchar_util::DisplayWrapper::new(|f| consumer.fmt_debug(f))
				);
				last_debug_time = cur_time;
			}
		}

		Ok(RunOutput {
			records,
			records_skipped,
			lines_read: reader.lines_read(),
		})
	}
}

/// Output for [`Driver::run`]
#[derive(Clone, Copy, Debug)]
pub struct RunOutput {
	/// Records handled
	pub records: usize,

	/// Malformed records skipped
	pub records_skipped: usize,

	/// Text lines read
	pub lines_read: usize,
}

/// Log consumer
pub trait LogConsumer {
	/// Handles a record
	fn handle_record(&mut self, record: LogRecord) -> Result<(), anyhow::Error>;

	/// Formats debug output to `f`.
	fn fmt_debug(&mut self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error>;
}

#[cfg(test)]
mod tests {
	use {
		super::{Driver, LogConsumer},
		crate::{
			sync_log::LogRecord,
			Error,
			SyncLogReader,
		},
		byteorder::{LittleEndian, WriteBytesExt},
		std::{fmt, io::Cursor, time::Duration},
	};

	/// Consumer that records the kind of every record
	#[derive(Default)]
	struct Recorder(Vec<&'static str>);

	impl LogConsumer for Recorder {
		fn handle_record(&mut self, record: LogRecord) -> Result<(), anyhow::Error> {
			self.0.push(match record {
				LogRecord::WorkSet(_) => "workset",
				LogRecord::LockSummary(_) => "summary",
				LogRecord::Cycles(_) => "cycles",
				LogRecord::Reset => "reset",
				_ => "other",
			});
			Ok(())
		}

		fn fmt_debug(&mut self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
			write!(f, "{} records", self.0.len())
		}
	}

	#[test]
	fn skips_malformed_records() {
		let log = "Cycles 0: 10\n0x10(l) 1 1 7 1 0 0 0 0 0 0 0 0 0 0 0 0 [bad\nRESET_STATS\n";
		let mut reader = SyncLogReader::new(Cursor::new(log.as_bytes()));
		let mut recorder = Recorder::default();

		let output = Driver::new(Duration::ZERO).run(&mut reader, &mut recorder).unwrap();
		assert_eq!(recorder.0, ["cycles", "reset"]);
		assert_eq!(output.records, 2);
		assert_eq!(output.records_skipped, 1);
		assert_eq!(output.lines_read, 3);
	}

	#[test]
	fn truncation_aborts() {
		let mut log = b"Cycles 0: 10\nWS_CLOSE 0x10 1 0 (1) 0 C[ ] \n".to_vec();
		log.write_u32::<LittleEndian>(3).unwrap();
		log.write_u32::<LittleEndian>(0x1000).unwrap();
		let mut reader = SyncLogReader::new(Cursor::new(log));
		let mut recorder = Recorder::default();

		let err = Driver::new(Duration::from_secs(60))
			.run(&mut reader, &mut recorder)
			.unwrap_err();
		assert!(matches!(
			err.downcast_ref::<Error>(),
			Some(Error::TruncatedBinaryBlob { expected: 10, read: 2, .. })
		));
		assert_eq!(recorder.0, ["cycles"]);
	}
}
