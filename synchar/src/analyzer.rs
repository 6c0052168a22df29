//! Contention analyzer

// Modules
pub mod histogram;
pub mod legacy;
pub mod window;

// Exports
pub use self::{
	histogram::ConflictHistogram,
	legacy::LegacyMetric,
	window::{ContentionWindow, WindowStats},
};

// Imports
use {
	crate::{
		data,
		driver::LogConsumer,
		sync_log::{CallerEntry, LockSummary, LogRecord, ACCUMULATORS},
		workset::WorkSet,
		Config,
		Error,
	},
	itertools::Itertools,
	rand::{rngs::StdRng, SeedableRng},
	std::{collections::BTreeMap, fmt, mem},
};

/// Lock addresses at or above this belong to the kernel
pub const KERNEL_BASE: u64 = 0xc000_0000;

/// Contention analyzer
#[derive(Debug)]
pub struct ContentionAnalyzer {
	/// Config
	config: Config,

	/// Random source for sampling
	rng: StdRng,

	/// Windows, by lock address and generation
	windows: BTreeMap<(u64, u64), ContentionWindow>,

	/// Most recent asymmetry detectors, newest first
	detectors: [Option<WorkSet>; 2],

	/// Reported locks, by key
	locks: BTreeMap<String, data::LockReport>,

	/// Callers, by return address
	callers: BTreeMap<u64, data::CallerReport>,

	/// Histogram of the current benchmark
	histogram: ConflictHistogram,

	// Benchmark counters
	cycles:      u64,
	idle_cycles: u64,
	cpu_count:   u64,
	freq_mhz:    u64,

	/// Finished benchmarks
	reports: Vec<data::BenchmarkReport>,

	/// Counters for debug output
	counters: Counters,
}

impl ContentionAnalyzer {
	/// Creates a new analyzer
	pub fn new(config: Config) -> Result<Self, Error> {
		config.validate()?;

		Ok(Self {
			rng: StdRng::seed_from_u64(config.seed),
			config,
			windows: BTreeMap::new(),
			detectors: [None, None],
			locks: BTreeMap::new(),
			callers: BTreeMap::new(),
			histogram: ConflictHistogram::new(),
			cycles: 0,
			idle_cycles: 0,
			cpu_count: 0,
			freq_mhz: 0,
			reports: vec![],
			counters: Counters::default(),
		})
	}

	/// Handles a workset
	pub fn handle_workset(&mut self, workset: WorkSet) {
		let lock_addr = workset.lock_addr();
		let generation = workset.generation();
		self.counters.worksets_seen += 1;

		if self.config.user_only && lock_addr >= KERNEL_BASE {
			tracing::trace!(lock_addr = format_args!("{lock_addr:#x}"), "Ignoring kernel workset");
			return;
		}

		// Asymmetry detectors aren't locks
		if lock_addr == 0 || lock_addr == KERNEL_BASE {
			let prev = self.detectors[0].replace(workset);
			self.detectors[1] = prev;
			return;
		}

		// Close any older generations of this lock
		for window in self.windows.range_mut((lock_addr, 0)..(lock_addr, generation)).map(|(_, window)| window) {
			if !window.is_closed() {
				window.close(&self.config, &mut self.rng, &mut self.histogram);
			}
		}

		let window = self
			.windows
			.entry((lock_addr, generation))
			.or_insert_with(|| ContentionWindow::new(lock_addr, generation, &self.config));
		if window.is_closed() {
			tracing::trace!(
				lock_addr = format_args!("{lock_addr:#x}"),
				generation,
				"Ignoring workset of a closed generation"
			);
			return;
		}

		if window.offer(workset, self.detectors.iter().flatten(), &self.config, &mut self.rng) {
			self.counters.worksets_retained += 1;
		}

		if window.is_full(&self.config) {
			window.analyze(&self.config, &mut self.rng, &mut self.histogram);
			window.advance(&self.config);
			self.counters.windows_analyzed += 1;
		}
	}

	/// Handles the summary of a lock, closing its window
	pub fn handle_lock_summary(&mut self, summary: LockSummary) {
		// Note: The window is dropped even if the lock itself is filtered
		let window = self.windows.remove(&(summary.lock_addr, summary.generation));

		if summary.wsize < self.config.size_threshold {
			tracing::trace!(key = %summary.key, wsize = summary.wsize, "Ignoring fine-grained lock");
			self.counters.locks_filtered += 1;
			return;
		}

		if self.config.user_only && summary.lock_addr >= KERNEL_BASE {
			tracing::trace!(key = %summary.key, "Ignoring kernel lock");
			self.counters.locks_filtered += 1;
			return;
		}

		let stats = match window {
			Some(mut window) => window.close(&self.config, &mut self.rng, &mut self.histogram).clone(),
			None => WindowStats::empty(&self.config),
		};

		let mut lock = data::LockReport {
			key:              summary.key,
			lock_addr:        summary.lock_addr,
			name:             summary.name,
			generation:       summary.generation,
			lock_ids:         [summary.lock_id].into(),
			acq_pids:         summary.acq_pids,
			workset_count:    summary.workset_count,
			count:            0,
			q_count:          0,
			useless_releases: 0,
			acq_total:        vec![0; ACCUMULATORS],
			hold_total:       vec![0; ACCUMULATORS],
			rsize:            summary.rsize,
			wsize:            summary.wsize,
			size:             summary.size,
			nest_depth:       summary.nest_depth,
			contention:       stats.contention,
			legacy:           stats.legacy,
			histogram:        stats.histogram.to_data(),
		};

		for caller in &summary.callers {
			lock.count += caller.count;
			lock.q_count += caller.q_count;
			lock.useless_releases += caller.useless_releases;
			self::add_accumulator(&mut lock.acq_total, &caller.acq_total);
			self::add_accumulator(&mut lock.hold_total, &caller.hold_total);

			let report = self
				.callers
				.entry(caller.ra)
				.or_insert_with(|| self::empty_caller_report(caller));
			report.flags = caller.flags;
			report.count += caller.count;
			report.q_count += caller.q_count;
			report.useless_releases += caller.useless_releases;
			report.lock_ids.insert(summary.lock_id);
			self::add_accumulator(&mut report.acq_total, &caller.acq_total);
			self::add_accumulator(&mut report.hold_total, &caller.hold_total);
		}

		tracing::trace!(key = %lock.key, contention = ?lock.contention, "Reported lock");
		if let Some(prev) = self.locks.insert(lock.key.clone(), lock) {
			tracing::warn!(key = %prev.key, "Replaced a duplicate lock summary");
		}
	}

	/// Discards everything collected in the current benchmark
	pub fn reset(&mut self) {
		tracing::debug!(locks = self.locks.len(), windows = self.windows.len(), "Resetting statistics");
		self.windows.clear();
		self.locks.clear();
		self.callers.clear();
		self.cycles = 0;
	}

	/// Ends the current benchmark, storing its report
	pub fn end_benchmark(&mut self) {
		let report = data::BenchmarkReport {
			cycles:      self.cycles,
			idle_cycles: self.idle_cycles,
			cpu_count:   self.cpu_count,
			freq_mhz:    self.freq_mhz,
			cpu_counts:  self.config.cpu_counts.clone(),
			locks:       mem::take(&mut self.locks).into_values().collect(),
			callers:     mem::take(&mut self.callers).into_values().collect(),
			histogram:   mem::take(&mut self.histogram).to_data(),
		};
		tracing::info!(
			cycles = report.cycles,
			locks = report.locks.len(),
			callers = report.callers.len(),
			"Benchmark finished"
		);

		self.windows.clear();
		self.cycles = 0;
		self.idle_cycles = 0;
		self.reports.push(report);
	}

	/// Returns the reports of all finished benchmarks
	pub fn reports(&self) -> &[data::BenchmarkReport] {
		&self.reports
	}

	/// Returns the window of a lock generation
	pub fn window(&self, lock_addr: u64, generation: u64) -> Option<&ContentionWindow> {
		self.windows.get(&(lock_addr, generation))
	}

	/// Finishes the analysis, returning all benchmark reports.
	///
	/// A benchmark still in progress is ended if it reported anything.
	pub fn finish(mut self) -> Vec<data::BenchmarkReport> {
		if !self.locks.is_empty() || self.cycles != 0 {
			self.end_benchmark();
		}

		self.reports
	}
}

impl LogConsumer for ContentionAnalyzer {
	fn handle_record(&mut self, record: LogRecord) -> Result<(), anyhow::Error> {
		match record {
			LogRecord::WorkSet(workset) => self.handle_workset(workset),
			LogRecord::LockSummary(summary) => self.handle_lock_summary(summary),
			LogRecord::Cycles(cycles) => self.cycles += cycles,
			LogRecord::IdleCycles(idle_cycles) => self.idle_cycles += idle_cycles,
			LogRecord::CpuInfo { cpu_count, freq_mhz } => {
				tracing::debug!(cpu_count, freq_mhz, "Found cpu information");
				self.cpu_count = cpu_count;
				self.freq_mhz = freq_mhz;
			},
			LogRecord::Reset => self.reset(),
			LogRecord::EndOfBenchmark => self.end_benchmark(),

			// Note: Blank lines only separate benchmarks after some cycles were logged
			LogRecord::Blank => match self.cycles {
				0 => (),
				_ => self.end_benchmark(),
			},
			LogRecord::Other(line) => tracing::trace!(?line, "Ignoring line"),
		}

		Ok(())
	}

	fn fmt_debug(&mut self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
		// Note: Start with a newline, since we're a multi-line output
		f.pad("\n")?;

		let counters = &self.counters;
		let retained_percentage = match counters.worksets_seen {
			0 => 0.0,
			seen => 100.0 * (counters.worksets_retained as f64 / seen as f64),
		};
		writeln!(
			f,
			"Worksets: {} seen, {} retained ({retained_percentage:.2}%)",
			counters.worksets_seen, counters.worksets_retained
		)?;

		let window_lens = self
			.windows
			.values()
			.filter(|window| !window.is_closed())
			.map(|window| window.len() as f64);
		let average_window_len = window_lens.clone().collect::<average::Variance>();
		let (min_window_len, max_window_len) = window_lens.minmax().into_option().unwrap_or((0.0, 0.0));
		writeln!(
			f,
			"Open windows: {} ({:.2} ± {:.2} worksets, {min_window_len}..{max_window_len}), {} analyzed",
			average_window_len.len(),
			average_window_len.mean(),
			average_window_len.error(),
			counters.windows_analyzed,
		)?;

		writeln!(
			f,
			"Locks: {} reported, {} filtered",
			self.locks.len(),
			counters.locks_filtered
		)?;

		let hottest = self
			.histogram
			.hottest(3)
			.into_iter()
			.map(|(conflict, count)| format!("{conflict} ({count})"))
			.join(", ");
		writeln!(f, "Hottest conflicts: [{hottest}] of {}", self.histogram.total())?;

		writeln!(f, "Benchmarks: {}", self.reports.len())?;

		Ok(())
	}
}

/// Counters for debug output
#[derive(Clone, Copy, Default, Debug)]
struct Counters {
	worksets_seen:     usize,
	worksets_retained: usize,
	windows_analyzed:  usize,
	locks_filtered:    usize,
}

/// Creates an empty report for `caller`
fn empty_caller_report(caller: &CallerEntry) -> data::CallerReport {
	data::CallerReport {
		ra:               caller.ra,
		flags:            caller.flags,
		count:            0,
		q_count:          0,
		useless_releases: 0,
		lock_ids:         [].into(),
		acq_total:        vec![0; ACCUMULATORS],
		hold_total:       vec![0; ACCUMULATORS],
	}
}

/// Adds all values of an accumulator to `total`
fn add_accumulator(total: &mut [u64], values: &[u64; ACCUMULATORS]) {
	for (total, value) in total.iter_mut().zip(values) {
		*total += value;
	}
}
