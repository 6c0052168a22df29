//! Contention window

// Imports
use {
	super::{histogram::ConflictHistogram, legacy::LegacyMetric},
	crate::{data, workset::WorkSet, Config},
	rand::{seq::SliceRandom, Rng},
	std::{
		collections::{BTreeMap, BTreeSet},
		rc::Rc,
	},
};

/// Contention window.
///
/// Accumulates the worksets of a single lock generation and periodically
/// samples them to estimate how often concurrent critical sections conflict.
#[derive(Debug)]
pub struct ContentionWindow {
	/// Lock address
	lock_addr: u64,

	/// Generation
	generation: u64,

	/// Retained worksets, oldest first
	worksets: Vec<Rc<WorkSet>>,

	/// Distinct processes of the retained worksets, in order of appearance
	current_pids: Vec<u32>,

	/// All processes ever analyzed
	max_threads: BTreeSet<u32>,

	/// Sums of every sample, per cpu count
	sums: Vec<SampleSums>,

	/// Total words of all retained worksets
	workset_size_words: usize,

	/// Worksets retained
	sampled: usize,

	/// Retained worksets that overlapped an asymmetry detector
	asym_detected: usize,

	/// Histogram
	histogram: ConflictHistogram,

	/// Legacy metric, if enabled
	legacy: Option<LegacyMetric>,

	/// Statistics, once closed
	stats: Option<WindowStats>,
}

impl ContentionWindow {
	/// Creates a new, empty, window
	pub fn new(lock_addr: u64, generation: u64, config: &Config) -> Self {
		Self {
			lock_addr,
			generation,
			worksets: vec![],
			current_pids: vec![],
			max_threads: BTreeSet::new(),
			sums: vec![SampleSums::default(); config.cpu_counts.len()],
			workset_size_words: 0,
			sampled: 0,
			asym_detected: 0,
			histogram: ConflictHistogram::new(),
			legacy: config.legacy_metric.then(|| LegacyMetric::new(config.legacy_window)),
			stats: None,
		}
	}

	/// Offers a workset to this window.
	///
	/// The workset is retained with a probability of `config.sample_rate` percent.
	/// Returns whether it was retained.
	pub fn offer<'a>(
		&mut self,
		workset: WorkSet,
		detectors: impl IntoIterator<Item = &'a WorkSet>,
		config: &Config,
		rng: &mut impl Rng,
	) -> bool {
		if self.is_closed() || rng.gen_range(0..100) >= config.sample_rate {
			return false;
		}

		// Note: Only a single new process is added per workset
		if let Some(&pid) = workset.info().pids.iter().find(|pid| !self.current_pids.contains(pid)) {
			self.current_pids.push(pid);
		}

		self.workset_size_words += workset.size_words();
		self.sampled += 1;
		if detectors
			.into_iter()
			.any(|detector| workset.compare(detector, None, false) > 0)
		{
			self.asym_detected += 1;
		}

		let workset = Rc::new(workset);
		if let Some(legacy) = &mut self.legacy {
			legacy.push(Rc::clone(&workset));
		}
		self.worksets.push(workset);

		true
	}

	/// Returns if this window should be analyzed and advanced
	pub fn is_full(&self, config: &Config) -> bool {
		self.worksets.len() >= config.window_size || self.current_pids.len() >= config.max_cpus
	}

	/// Samples the retained worksets, for each cpu count.
	///
	/// Every dependent pair found is recorded on both this window's histogram
	/// and `global_histogram`.
	pub fn analyze(&mut self, config: &Config, rng: &mut impl Rng, global_histogram: &mut ConflictHistogram) {
		let mut by_pid = BTreeMap::<u32, Vec<&WorkSet>>::new();
		for workset in &self.worksets {
			let Some(pid) = workset.first_pid() else {
				continue;
			};
			by_pid.entry(pid).or_default().push(workset);
			self.max_threads.insert(pid);
		}
		let pids = by_pid.keys().copied().collect::<Vec<_>>();

		for (sums, &cpu_count) in self.sums.iter_mut().zip(&config.cpu_counts) {
			let sample_size = pids.len().min(cpu_count);
			for _ in 0..config.sample_repeat {
				let sample_pids = pids.choose_multiple(rng, sample_size).copied().collect::<Vec<_>>();
				let sample = sample_pids
					.iter()
					.filter_map(|pid| by_pid.get(pid)?.choose(rng).copied())
					.collect::<Vec<_>>();

				let result = self::analyze_sample(&sample, &mut self.histogram, global_histogram);
				sums.samples += 1;
				sums.conflicts += result.conflicting as f64;
				sums.completions += result.completions as f64;
				sums.threads += sample_size as f64;
				sums.density += result.density;
			}
		}

		tracing::debug!(
			lock_addr = format_args!("{:#x}", self.lock_addr),
			generation = self.generation,
			worksets = self.worksets.len(),
			processes = pids.len(),
			"Analyzed window"
		);
	}

	/// Drops the oldest `config.window_increment` worksets
	pub fn advance(&mut self, config: &Config) {
		let dropped = config.window_increment.min(self.worksets.len());
		self.worksets.drain(..dropped);

		self.current_pids.clear();
		for workset in &self.worksets {
			if let Some(&pid) = workset.info().pids.iter().find(|pid| !self.current_pids.contains(pid)) {
				self.current_pids.push(pid);
			}
		}
	}

	/// Closes this window, returning its statistics.
	///
	/// Any worksets remaining are analyzed and dropped. Closing an already
	/// closed window returns the same statistics.
	pub fn close(&mut self, config: &Config, rng: &mut impl Rng, global_histogram: &mut ConflictHistogram) -> &WindowStats {
		if self.stats.is_none() {
			if !self.worksets.is_empty() {
				self.analyze(config, rng, global_histogram);
			}
			self.worksets = vec![];
			self.current_pids = vec![];

			let stats = self.compute_stats();
			tracing::debug!(
				lock_addr = format_args!("{:#x}", self.lock_addr),
				generation = self.generation,
				contention = ?stats.contention,
				"Closed window"
			);
			self.stats = Some(stats);
		}

		self.stats.as_ref().expect("Stats were just set")
	}

	/// Returns if this window is closed
	pub fn is_closed(&self) -> bool {
		self.stats.is_some()
	}

	/// Returns the number of retained worksets
	pub fn len(&self) -> usize {
		self.worksets.len()
	}

	/// Returns if no worksets are retained
	pub fn is_empty(&self) -> bool {
		self.worksets.is_empty()
	}

	/// Computes the average of every sum
	fn compute_stats(&self) -> WindowStats {
		let average = |value: fn(&SampleSums) -> f64| {
			self.sums
				.iter()
				.map(|sums| match sums.samples {
					0 => value(sums),
					samples => value(sums) / samples as f64,
				})
				.collect::<Vec<_>>()
		};
		let per_sampled = |value: usize| match self.sampled {
			0 => 0.0,
			sampled => value as f64 / sampled as f64,
		};

		WindowStats {
			contention: data::ContentionReport {
				max_threads:            self.max_threads.len(),
				average_conflicts:      average(|sums| sums.conflicts),
				average_completions:    average(|sums| sums.completions),
				average_threads:        average(|sums| sums.threads),
				conflict_density:       average(|sums| sums.density),
				asymmetry_rate:         per_sampled(self.asym_detected),
				avg_workset_size_words: per_sampled(self.workset_size_words),
			},
			legacy:     self.legacy.as_ref().map(LegacyMetric::report),
			histogram:  self.histogram.clone(),
		}
	}
}

/// Statistics of a closed window
#[derive(Clone, PartialEq, Debug)]
pub struct WindowStats {
	/// Contention
	pub contention: data::ContentionReport,

	/// Legacy metric, if enabled
	pub legacy: Option<data::LegacyReport>,

	/// Histogram
	pub histogram: ConflictHistogram,
}

impl WindowStats {
	/// Statistics for a lock that never had a window
	pub fn empty(config: &Config) -> Self {
		let zeros = vec![0.0; config.cpu_counts.len()];
		Self {
			contention: data::ContentionReport {
				max_threads:            0,
				average_conflicts:      zeros.clone(),
				average_completions:    zeros.clone(),
				average_threads:        zeros.clone(),
				conflict_density:       zeros,
				asymmetry_rate:         0.0,
				avg_workset_size_words: 0.0,
			},
			legacy:     config.legacy_metric.then(data::LegacyReport::default),
			histogram:  ConflictHistogram::new(),
		}
	}
}

/// Sums of all samples for a cpu count
#[derive(Clone, Copy, Default, Debug)]
struct SampleSums {
	samples:     usize,
	conflicts:   f64,
	completions: f64,
	threads:     f64,
	density:     f64,
}

/// Result of analyzing a single sample
#[derive(Clone, Copy, Debug)]
struct SampleResult {
	/// Worksets that depend on another in the sample
	conflicting: usize,

	/// Worksets that depend on no other
	completions: usize,

	/// Average fraction of the other conflicting worksets each conflicting workset depends on
	density: f64,
}

/// Analyzes a sample of worksets, each from a different process
fn analyze_sample(
	sample: &[&WorkSet],
	histogram: &mut ConflictHistogram,
	global_histogram: &mut ConflictHistogram,
) -> SampleResult {
	let conflicting = sample
		.iter()
		.enumerate()
		.filter(|&(idx, workset)| {
			sample
				.iter()
				.enumerate()
				.any(|(other_idx, other)| idx != other_idx && workset.compare(other, None, true) > 0)
		})
		.map(|(_, &workset)| workset)
		.collect::<Vec<_>>();

	let mut intersection = vec![];
	let mut density = 0.0;
	for (idx, workset) in conflicting.iter().enumerate() {
		let mut local_conflicts = 0;
		for (other_idx, other) in conflicting.iter().enumerate() {
			if idx == other_idx || workset.compare(other, Some(&mut intersection), true) == 0 {
				continue;
			}

			local_conflicts += 1;
			histogram.record(&intersection);
			global_histogram.record(&intersection);
		}

		if conflicting.len() > 1 {
			density += local_conflicts as f64 / (conflicting.len() - 1) as f64;
		}
	}
	if !conflicting.is_empty() {
		density /= conflicting.len() as f64;
	}

	SampleResult {
		conflicting: conflicting.len(),
		completions: sample.len() - conflicting.len(),
		density,
	}
}
