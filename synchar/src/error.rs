//! Errors

// Imports
use std::io;

/// Library error
#[derive(Debug)]
#[derive(thiserror::Error)]
pub enum Error {
	/// A state was used that has no rule table
	#[error("No such state: {state}")]
	NoSuchState { state: String },

	/// No rule in the current state accepted the input
	#[error("No rule in state {state} matched input {input:?}")]
	UnmatchedInput { state: String, input: String },

	/// A record matched its outer shape, but not its inner fields
	#[error("Malformed record: {reason}")]
	MalformedRecord { reason: String },

	/// An action requested a restart twice during the same transition
	#[error("Restart to {second} requested after a restart to {first} in the same transition")]
	DoubleRestart { first: String, second: String },

	/// Input ended while reading a binary blob
	#[error("Binary blob truncated: expected {expected} words, read {read}")]
	TruncatedBinaryBlob {
		expected: usize,
		read:     usize,
		#[source]
		source:   io::Error,
	},

	/// Configuration is invalid
	#[error("Invalid configuration: {reason}")]
	InvalidConfig { reason: String },

	/// Io
	#[error("Io error")]
	Io(#[from] io::Error),
}

impl Error {
	/// Returns if this error only affects a single line or record.
	///
	/// Recoverable errors should be logged and processing continued.
	#[must_use]
	pub fn is_recoverable(&self) -> bool {
		matches!(self, Self::UnmatchedInput { .. } | Self::MalformedRecord { .. })
	}

	/// Creates a malformed record error
	pub(crate) fn malformed(reason: impl Into<String>) -> Self {
		Self::MalformedRecord { reason: reason.into() }
	}
}
