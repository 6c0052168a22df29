//! Sync log parsing.
//!
//! The sync log is a text log with interleaved binary data: every `WS_CLOSE`
//! record is immediately followed by a little-endian blob with the workset's
//! access chunks, and then a single newline.

// Imports
use {
	crate::{
		catalog,
		workset::{AccessChunk, WorkSet, WorkSetInfo},
		Error,
	},
	byteorder::{LittleEndian, ReadBytesExt},
	regex::{Captures, Regex},
	std::{collections::BTreeMap, io, str::FromStr},
	synchar_util::ReadLineTrimmed,
};

/// Sync log reader
#[derive(Debug)]
pub struct SyncLogReader<R> {
	/// Reader
	reader: R,

	/// Record patterns
	patterns: Patterns,

	/// Current line
	line: String,

	/// Lines read
	lines_read: usize,
}

impl<R: io::BufRead> SyncLogReader<R> {
	/// Creates a new reader
	pub fn new(reader: R) -> Self {
		Self {
			reader,
			patterns: Patterns::new(),
			line: String::new(),
			lines_read: 0,
		}
	}

	/// Reads the next record.
	///
	/// Returns [`Error::MalformedRecord`] for text records with invalid fields, after
	/// which reading may continue. Any other error leaves the reader at an unknown
	/// position within the log.
	pub fn read_next(&mut self) -> Result<Option<LogRecord>, Error> {
		if !self.reader.read_line_trimmed(&mut self.line)? {
			return Ok(None);
		}
		self.lines_read += 1;

		let patterns = &self.patterns;
		let line = self.line.as_str();
		if patterns.end_of_stats.is_match(line) {
			return Ok(Some(LogRecord::EndOfBenchmark));
		}

		if line.is_empty() {
			return Ok(Some(LogRecord::Blank));
		}

		if let Some(captures) = patterns.lock_summary.captures(line) {
			let summary = self::parse_lock_summary(&captures, line, &patterns.caller)?;
			return Ok(Some(LogRecord::LockSummary(summary)));
		}

		// Note: The blob must be consumed even if the header is malformed, else
		//       we'd try to parse it as text.
		let workset_info = patterns
			.ws_close
			.captures(line)
			.map(|captures| self::parse_workset_info(&captures));
		if let Some(info) = workset_info {
			let chunks = self.read_blob()?;
			self.skip_blob_terminator()?;

			let workset = WorkSet::new(info?, chunks);
			tracing::trace!(info = ?workset.info(), size = workset.size(), "Read workset");
			return Ok(Some(LogRecord::WorkSet(workset)));
		}

		if let Some(captures) = patterns.cycles.captures(line) {
			return Ok(Some(LogRecord::Cycles(self::parse_field(&captures, "cycles")?)));
		}

		if let Some(captures) = patterns.idle_cycles.captures(line) {
			return Ok(Some(LogRecord::IdleCycles(self::parse_field(&captures, "idle")?)));
		}

		if patterns.reset.is_match(line) {
			return Ok(Some(LogRecord::Reset));
		}

		if let Some(captures) = patterns.cpu_info.captures(line) {
			return Ok(Some(LogRecord::CpuInfo {
				cpu_count: self::parse_field(&captures, "cpu_count")?,
				freq_mhz:  self::parse_field(&captures, "freq_mhz")?,
			}));
		}

		Ok(Some(LogRecord::Other(self.line.clone())))
	}

	/// Returns the number of text lines read
	pub fn lines_read(&self) -> usize {
		self.lines_read
	}

	/// Reads a workset blob
	fn read_blob(&mut self) -> Result<BTreeMap<u64, Vec<AccessChunk>>, Error> {
		let entries = self::read_word(&mut self.reader, 1, 0)? as usize;
		let expected = 1 + 3 * entries;

		let mut chunks = BTreeMap::new();
		for entry_idx in 0..entries {
			let read = 1 + 3 * entry_idx;
			let addr = self::read_word(&mut self.reader, expected, read)?;
			let chunk1 = self::read_word(&mut self.reader, expected, read + 1)?;
			let chunk2 = self::read_word(&mut self.reader, expected, read + 2)?;

			chunks.insert(u64::from(addr), vec![
				AccessChunk::from_bits(chunk1),
				AccessChunk::from_bits(chunk2),
			]);
		}

		Ok(chunks)
	}

	/// Skips the newline after a workset blob
	fn skip_blob_terminator(&mut self) -> Result<(), Error> {
		if self.reader.read_line_trimmed(&mut self.line)? && !self.line.is_empty() {
			tracing::warn!(line = ?self.line, "Expected an empty line after workset data");
		}

		Ok(())
	}
}

/// Sync log record
#[derive(Clone, Debug)]
pub enum LogRecord {
	/// Workset of a critical section
	WorkSet(WorkSet),

	/// End-of-life summary for a lock
	LockSummary(LockSummary),

	/// Cycle count
	Cycles(u64),

	/// Idle cycle count
	IdleCycles(u64),

	/// Cpu information
	CpuInfo { cpu_count: u64, freq_mhz: u64 },

	/// Statistics reset
	Reset,

	/// End of benchmark
	EndOfBenchmark,

	/// Blank line
	Blank,

	/// Any other line
	Other(String),
}

/// Lock summary
#[derive(Clone, PartialEq, Debug)]
pub struct LockSummary {
	/// Lock key, as logged (`<addr>` or `<addr>_<suffix>`)
	pub key: String,

	/// Lock address
	pub lock_addr: u64,

	/// Lock name
	pub name: String,

	/// Generation
	pub generation: u64,

	/// Worksets created by this lock
	pub workset_count: u64,

	/// Lock kind id
	pub lock_id: u64,

	/// Acquiring process count
	pub acq_pids: u64,

	/// Aggregate read size
	pub rsize: u64,

	/// Aggregate write size
	pub wsize: u64,

	/// Aggregate size
	pub size: u64,

	/// Nesting depth averages
	pub nest_depth: Vec<f64>,

	/// Caller entries
	pub callers: Vec<CallerEntry>,
}

/// Caller entry of a lock summary
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct CallerEntry {
	/// Return address, or inlined pc
	pub ra: u64,

	/// Record flags
	pub flags: u64,

	/// Acquisitions
	pub count: u64,

	/// Contended acquisitions
	pub q_count: u64,

	/// Releases with nobody waiting
	pub useless_releases: u64,

	/// Acquire time accumulators
	pub acq_total: [u64; ACCUMULATORS],

	/// Hold time accumulators
	pub hold_total: [u64; ACCUMULATORS],
}

/// Number of values in each time accumulator
pub const ACCUMULATORS: usize = 9;

/// Record patterns
#[derive(Debug)]
struct Patterns {
	end_of_stats: Regex,
	lock_summary: Regex,
	caller:       Regex,
	ws_close:     Regex,
	cycles:       Regex,
	idle_cycles:  Regex,
	reset:        Regex,
	cpu_info:     Regex,
}

impl Patterns {
	fn new() -> Self {
		let caller_values = vec![r"(\d+)"; 4 + 2 * ACCUMULATORS].join(r"\s+");

		Self {
			end_of_stats: catalog::regex(r"^SYNCCHAR:\s+End\s+of\s+Stats"),
			lock_summary: catalog::regex(concat!(
				r"^(?P<lock_addr>0x[a-fA-F0-9_]+)\((?P<name>.*)\)\s+",
				r"(?P<generation>\d+)\s+(?P<workset_count>\d+)\s+(?P<lock_id>\d+)\s+(?P<acq_pids>\d+)\s+",
				r"(?P<rsize>\d+)\s+(?P<wsize>\d+)\s+(?P<size>\d+)\s+",
				r"(?P<nest_depth>(?:[\d\.]+\s+){9})",
			)),
			caller:       catalog::regex(&format!(r"^\s*(?P<ra>0?x?[a-fA-F0-9]+)\s+{caller_values}")),
			ws_close:     catalog::regex(concat!(
				r"^WS_CLOSE\s+(?P<lock_addr>(?:0x)?[a-fA-F0-9]+)\s+(?P<generation>\d+)\s+(?P<index>\d+)\s+",
				r"\((?P<pids>[0-9\s]+)\)\s+(?P<cpu>\d+)\s+",
				r"C\[\s*(?P<contending>[0-9\s]*)\s*\]\s*(?P<io>I?O?)",
			)),
			cycles:       catalog::regex(r"^Cycles \d+: (?P<cycles>\d+)"),
			idle_cycles:  catalog::regex(r"^KSTAT_SNAPSHOT.*cycle\s+\d+\s+\d+\s+\d+\s+\d+\s+\d+\s+\d+\s+(?P<idle>\d+)"),
			reset:        catalog::regex(r"^RESET_STATS"),
			cpu_info:     catalog::regex(r"^(?P<cpu_count>\d+)\s+(?P<freq_mhz>\d+)MHz\s+processors"),
		}
	}
}

/// Reads a single blob word, mapping end of input to [`Error::TruncatedBinaryBlob`]
fn read_word<R: io::Read>(reader: &mut R, expected: usize, read: usize) -> Result<u32, Error> {
	reader
		.read_u32::<LittleEndian>()
		.map_err(|source| match source.kind() {
			io::ErrorKind::UnexpectedEof => Error::TruncatedBinaryBlob { expected, read, source },
			_ => Error::Io(source),
		})
}

/// Parses the header of a `WS_CLOSE` record
fn parse_workset_info(captures: &Captures<'_>) -> Result<WorkSetInfo, Error> {
	let lock_addr = self::parse_hex(&captures["lock_addr"])?;
	let pids = self::parse_list(&captures["pids"])?.into_iter().collect();
	let contending = self::parse_list(&captures["contending"])?;

	Ok(WorkSetInfo {
		lock_addr,
		generation: self::parse_field(captures, "generation")?,
		index: self::parse_field(captures, "index")?,
		pids,
		cpu: self::parse_field(captures, "cpu")?,
		contending,
		io: &captures["io"] == "IO",
	})
}

/// Parses a lock summary record
fn parse_lock_summary(captures: &Captures<'_>, line: &str, caller_pattern: &Regex) -> Result<LockSummary, Error> {
	let key = captures["lock_addr"].to_owned();
	let lock_addr = self::parse_hex(key.split('_').next().unwrap_or(&key))?;

	let nest_depth = captures["nest_depth"]
		.split_whitespace()
		.map(|value| {
			value
				.parse::<f64>()
				.map_err(|_| Error::malformed(format!("Invalid nest depth {value:?}")))
		})
		.collect::<Result<_, _>>()?;

	let callers = line
		.split('[')
		.skip(1)
		.map(|entry| {
			let captures = caller_pattern
				.captures(entry)
				.ok_or_else(|| Error::malformed(format!("Invalid caller entry {entry:?}")))?;
			self::parse_caller(&captures)
		})
		.collect::<Result<_, _>>()?;

	Ok(LockSummary {
		key,
		lock_addr,
		name: captures["name"].to_owned(),
		generation: self::parse_field(captures, "generation")?,
		workset_count: self::parse_field(captures, "workset_count")?,
		lock_id: self::parse_field(captures, "lock_id")?,
		acq_pids: self::parse_field(captures, "acq_pids")?,
		rsize: self::parse_field(captures, "rsize")?,
		wsize: self::parse_field(captures, "wsize")?,
		size: self::parse_field(captures, "size")?,
		nest_depth,
		callers,
	})
}

/// Parses a caller entry
fn parse_caller(captures: &Captures<'_>) -> Result<CallerEntry, Error> {
	let accumulator = |start: usize| -> Result<[u64; ACCUMULATORS], Error> {
		let mut values = [0; ACCUMULATORS];
		for (value_idx, value) in values.iter_mut().enumerate() {
			*value = self::parse_caller_value(captures, start + value_idx)?;
		}
		Ok(values)
	};

	Ok(CallerEntry {
		ra:               self::parse_hex(&captures["ra"])?,
		flags:            self::parse_caller_value(captures, 2)?,
		count:            self::parse_caller_value(captures, 3)?,
		q_count:          self::parse_caller_value(captures, 4)?,
		useless_releases: self::parse_caller_value(captures, 5)?,
		acq_total:        accumulator(6)?,
		hold_total:       accumulator(6 + ACCUMULATORS)?,
	})
}

/// Parses the caller value at capture group `idx`
fn parse_caller_value(captures: &Captures<'_>, idx: usize) -> Result<u64, Error> {
	let value = captures.get(idx).map_or("", |value| value.as_str());
	value
		.parse()
		.map_err(|_| Error::malformed(format!("Invalid caller value {value:?}")))
}

/// Parses the named field `name`
fn parse_field<T: FromStr>(captures: &Captures<'_>, name: &str) -> Result<T, Error> {
	let value = captures.name(name).map_or("", |value| value.as_str());
	value
		.parse()
		.map_err(|_| Error::malformed(format!("Invalid {name} {value:?}")))
}

/// Parses a whitespace-separated list of numbers
fn parse_list<T: FromStr>(list: &str) -> Result<Vec<T>, Error> {
	list.split_whitespace()
		.map(|value| {
			value
				.parse()
				.map_err(|_| Error::malformed(format!("Invalid list value {value:?}")))
		})
		.collect()
}

/// Parses a hex number, with an optional `0x` or `x` prefix
fn parse_hex(value: &str) -> Result<u64, Error> {
	let digits = value
		.strip_prefix("0x")
		.or_else(|| value.strip_prefix('x'))
		.unwrap_or(value);
	u64::from_str_radix(digits, 16).map_err(|_| Error::malformed(format!("Invalid hex number {value:?}")))
}
