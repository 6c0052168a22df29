//! Output data

// Imports
use std::collections::{BTreeMap, BTreeSet};

/// Output data
#[derive(Debug)]
#[derive(serde::Serialize, serde::Deserialize)]
pub struct Data {
	pub lines_read: usize,
	pub benchmarks: Vec<BenchmarkReport>,
}

/// Benchmark report
#[derive(Clone, PartialEq, Debug)]
#[derive(serde::Serialize, serde::Deserialize)]
pub struct BenchmarkReport {
	pub cycles:      u64,
	pub idle_cycles: u64,
	pub cpu_count:   u64,
	pub freq_mhz:    u64,

	/// Cpu counts that each contention vector is indexed by
	pub cpu_counts: Vec<usize>,

	pub locks:     Vec<LockReport>,
	pub callers:   Vec<CallerReport>,
	pub histogram: Histogram,
}

/// Lock report
#[derive(Clone, PartialEq, Debug)]
#[derive(serde::Serialize, serde::Deserialize)]
pub struct LockReport {
	pub key:           String,
	pub lock_addr:     u64,
	pub name:          String,
	pub generation:    u64,
	pub lock_ids:      BTreeSet<u64>,
	pub acq_pids:      u64,
	pub workset_count: u64,

	// Caller totals
	pub count:            u64,
	pub q_count:          u64,
	pub useless_releases: u64,
	pub acq_total:        Vec<u64>,
	pub hold_total:       Vec<u64>,

	// Workset sizes
	pub rsize: u64,
	pub wsize: u64,
	pub size:  u64,

	pub nest_depth: Vec<f64>,
	pub contention: ContentionReport,
	pub legacy:     Option<LegacyReport>,
	pub histogram:  Histogram,
}

/// Sampled contention statistics
#[derive(Clone, PartialEq, Debug)]
#[derive(serde::Serialize, serde::Deserialize)]
pub struct ContentionReport {
	/// Distinct processes that used the lock
	pub max_threads: usize,

	// Per cpu count averages
	pub average_conflicts:   Vec<f64>,
	pub average_completions: Vec<f64>,
	pub average_threads:     Vec<f64>,
	pub conflict_density:    Vec<f64>,

	pub asymmetry_rate:         f64,
	pub avg_workset_size_words: f64,
}

/// Legacy data dependence statistics
#[derive(Clone, Copy, PartialEq, Debug, Default)]
#[derive(serde::Serialize, serde::Deserialize)]
pub struct LegacyReport {
	/// Fraction of cross-process comparisons with any dependence
	pub dependence_rate: f64,

	/// Mean conflicts per dependent comparison
	pub dependent_bytes: f64,

	/// Mean fraction of the workset that conflicts, per dependent comparison
	pub dependent_bytes_pct: f64,
}

/// Caller report
#[derive(Clone, PartialEq, Eq, Debug)]
#[derive(serde::Serialize, serde::Deserialize)]
pub struct CallerReport {
	pub ra:               u64,
	pub flags:            u64,
	pub count:            u64,
	pub q_count:          u64,
	pub useless_releases: u64,
	pub lock_ids:         BTreeSet<u64>,
	pub acq_total:        Vec<u64>,
	pub hold_total:       Vec<u64>,
}

/// Conflict histogram
#[derive(Clone, PartialEq, Eq, Debug, Default)]
#[derive(serde::Serialize, serde::Deserialize)]
pub struct Histogram {
	/// Dependent pairs recorded
	pub total: u64,

	/// Occurrences of each conflict (`io` or a word address)
	pub conflicts: BTreeMap<String, u64>,
}
