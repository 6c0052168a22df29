//! Conflict histogram

// Imports
use {
	crate::{data, workset::Conflict},
	std::collections::BTreeMap,
};

/// Conflict histogram.
///
/// Counts every conflict of every dependent workset pair found while sampling.
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct ConflictHistogram {
	/// Dependent pairs recorded
	total: u64,

	/// Occurrences of each conflict
	counts: BTreeMap<Conflict, u64>,
}

impl ConflictHistogram {
	/// Creates an empty histogram
	pub fn new() -> Self {
		Self::default()
	}

	/// Records the intersection of a dependent pair
	pub fn record(&mut self, intersection: &[Conflict]) {
		self.total += 1;
		for &conflict in intersection {
			*self.counts.entry(conflict).or_default() += 1;
		}
	}

	/// Returns the dependent pairs recorded
	pub fn total(&self) -> u64 {
		self.total
	}

	/// Returns the occurrences of `conflict`
	pub fn count(&self, conflict: Conflict) -> u64 {
		self.counts.get(&conflict).copied().unwrap_or(0)
	}

	/// Returns the `n` most frequent conflicts
	pub fn hottest(&self, n: usize) -> Vec<(Conflict, u64)> {
		let mut counts = self.counts.iter().map(|(&conflict, &count)| (conflict, count)).collect::<Vec<_>>();
		counts.sort_by(|lhs, rhs| rhs.1.cmp(&lhs.1).then(lhs.0.cmp(&rhs.0)));
		counts.truncate(n);
		counts
	}

	/// Converts this histogram to its output form
	pub fn to_data(&self) -> data::Histogram {
		data::Histogram {
			total:     self.total,
			conflicts: self
				.counts
				.iter()
				.map(|(conflict, &count)| (conflict.to_string(), count))
				.collect(),
		}
	}
}

#[cfg(test)]
mod tests {
	use {super::ConflictHistogram, crate::workset::Conflict};

	#[test]
	fn record() {
		let mut histogram = ConflictHistogram::new();
		histogram.record(&[Conflict::Io, Conflict::Addr(0x1000)]);
		histogram.record(&[Conflict::Addr(0x1000)]);
		histogram.record(&[Conflict::Addr(0x2004)]);

		assert_eq!(histogram.total(), 3);
		assert_eq!(histogram.count(Conflict::Addr(0x1000)), 2);
		assert_eq!(histogram.count(Conflict::Addr(0x3000)), 0);
		assert_eq!(histogram.hottest(2), [(Conflict::Addr(0x1000), 2), (Conflict::Io, 1)]);

		let data = histogram.to_data();
		assert_eq!(data.total, 3);
		assert_eq!(data.conflicts["io"], 1);
		assert_eq!(data.conflicts["0x1000"], 2);
		assert_eq!(data.conflicts["0x2004"], 1);
	}
}
