//! Configuration

// Imports
use crate::Error;

/// Configuration
#[derive(Clone, PartialEq, Debug)]
#[derive(serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct Config {
	/// Percentage of worksets retained for analysis (0..=100)
	pub sample_rate: u32,

	/// Worksets retained before a window is analyzed
	pub window_size: usize,

	/// Worksets dropped from the start of a window after it's analyzed
	pub window_increment: usize,

	/// Samples drawn per cpu count on each analysis
	pub sample_repeat: usize,

	/// Cpu counts to sample for
	pub cpu_counts: Vec<usize>,

	/// Distinct processes that close a window
	pub max_cpus: usize,

	/// Random seed
	pub seed: u64,

	/// Minimum summary write size for a lock to be reported
	pub size_threshold: u64,

	/// Whether to only analyze user-space locks
	pub user_only: bool,

	/// Whether to compute the legacy data dependence metric
	pub legacy_metric: bool,

	/// Backwards window of the legacy metric
	pub legacy_window: usize,

	/// Debug output period (in seconds)
	pub debug_output_period_secs: f64,
}

impl Config {
	/// Checks that this configuration is usable
	pub fn validate(&self) -> Result<(), Error> {
		let invalid = |reason: &str| {
			Err(Error::InvalidConfig {
				reason: reason.to_owned(),
			})
		};

		if self.sample_rate > 100 {
			return invalid("Sample rate must be a percentage");
		}
		if self.window_size == 0 {
			return invalid("Window size must not be 0");
		}
		if self.window_increment == 0 || self.window_increment > self.window_size {
			return invalid("Window increment must be within 1..=window_size");
		}
		if self.sample_repeat == 0 {
			return invalid("Sample repeat must not be 0");
		}
		if self.cpu_counts.is_empty() {
			return invalid("At least one cpu count is required");
		}
		if self.max_cpus == 0 {
			return invalid("Max cpus must not be 0");
		}
		if !(self.debug_output_period_secs.is_finite() && self.debug_output_period_secs >= 0.0) {
			return invalid("Debug output period must be a non-negative number of seconds");
		}

		Ok(())
	}
}

impl Default for Config {
	fn default() -> Self {
		Self {
			sample_rate:              100,
			window_size:              512,
			window_increment:         512,
			sample_repeat:            1,
			cpu_counts:               vec![8, 16, 32],
			max_cpus:                 32,
			seed:                     1,
			size_threshold:           0,
			user_only:                false,
			legacy_metric:            false,
			legacy_window:            128,
			debug_output_period_secs: 1.0,
		}
	}
}

#[cfg(test)]
mod tests {
	use {super::Config, crate::Error};

	#[test]
	fn defaults_are_valid() {
		Config::default().validate().unwrap();
	}

	#[test]
	fn partial_json() {
		let config = serde_json::from_str::<Config>(r#"{ "sample_rate": 50, "cpu_counts": [2, 4] }"#).unwrap();
		assert_eq!(config.sample_rate, 50);
		assert_eq!(config.cpu_counts, [2, 4]);
		assert_eq!(config.window_size, 512);
		assert_eq!(config.seed, 1);
	}

	#[test]
	fn invalid() {
		let configs = [
			Config {
				sample_rate: 101,
				..Config::default()
			},
			Config {
				window_size: 0,
				..Config::default()
			},
			Config {
				window_increment: 1024,
				..Config::default()
			},
			Config {
				sample_repeat: 0,
				..Config::default()
			},
			Config {
				cpu_counts: vec![],
				..Config::default()
			},
			Config {
				max_cpus: 0,
				..Config::default()
			},
		];

		for config in configs {
			assert!(
				matches!(config.validate(), Err(Error::InvalidConfig { .. })),
				"Config should be invalid: {config:?}"
			);
		}
	}
}
