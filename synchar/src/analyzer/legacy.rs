//! Legacy data dependence metric.
//!
//! Compares every retained workset against the ones retained just before it,
//! skipping pairs owned by the same process.

// Imports
use {
	crate::{data::LegacyReport, workset::WorkSet},
	std::{collections::VecDeque, rc::Rc},
};

/// Legacy data dependence metric
#[derive(Clone, Debug)]
pub struct LegacyMetric {
	/// Most recent worksets
	window: VecDeque<Rc<WorkSet>>,

	/// Window capacity
	capacity: usize,

	/// Comparisons between different processes
	total: usize,

	/// Comparisons with any dependence
	dependent: usize,

	/// Sum of all dependences
	dependent_bytes: usize,

	/// Sum of dependence fractions, over comparisons with a non-empty workset
	dependent_pct: f64,
	dependent_pct_count: usize,
}

impl LegacyMetric {
	/// Creates a new metric looking back at most `capacity` worksets
	pub fn new(capacity: usize) -> Self {
		Self {
			window: VecDeque::with_capacity(capacity),
			capacity,
			total: 0,
			dependent: 0,
			dependent_bytes: 0,
			dependent_pct: 0.0,
			dependent_pct_count: 0,
		}
	}

	/// Compares `workset` against the window, then adds it
	pub fn push(&mut self, workset: Rc<WorkSet>) {
		for prev in &self.window {
			if workset.shares_pid(prev) {
				continue;
			}

			self.total += 1;
			let dependence = workset.compare(prev, None, true);
			if dependence > 0 {
				self.dependent += 1;
				self.dependent_bytes += dependence;
				if workset.size() > 0 {
					self.dependent_pct += dependence as f64 / workset.size() as f64;
					self.dependent_pct_count += 1;
				}
			}
		}

		if self.capacity == 0 {
			return;
		}
		if self.window.len() == self.capacity {
			self.window.pop_front();
		}
		self.window.push_back(workset);
	}

	/// Returns the current values
	pub fn report(&self) -> LegacyReport {
		let ratio = |num: f64, denom: usize| match denom {
			0 => 0.0,
			_ => num / denom as f64,
		};

		LegacyReport {
			dependence_rate:     ratio(self.dependent as f64, self.total),
			dependent_bytes:     ratio(self.dependent_bytes as f64, self.dependent),
			dependent_bytes_pct: ratio(self.dependent_pct, self.dependent_pct_count),
		}
	}
}
