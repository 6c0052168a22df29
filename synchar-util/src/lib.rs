//! Utilities

// Modules
pub mod logger;

// Imports
use std::{cell::RefCell, fmt, io};

/// Extension trait for `R: io::BufRead` types to read text lines
#[extend::ext(name = ReadLineTrimmed)]
pub impl<R: io::BufRead> R {
	/// Reads a single line into `line`, stripping the `\n` / `\r\n` terminator.
	///
	/// `line` is cleared beforehand. Invalid utf-8 is replaced, since text
	/// records may be interleaved with binary data.
	///
	/// Returns `Ok(false)` if the reader was already at the end.
	fn read_line_trimmed(&mut self, line: &mut String) -> Result<bool, io::Error> {
		line.clear();

		let mut bytes = vec![];
		if self.read_until(b'\n', &mut bytes)? == 0 {
			return Ok(false);
		}

		// Pop the newline
		if bytes.last() == Some(&b'\n') {
			bytes.pop();
			if bytes.last() == Some(&b'\r') {
				bytes.pop();
			}
		}

		line.push_str(&String::from_utf8_lossy(&bytes));
		Ok(true)
	}
}

/// [`fmt::Display`] helper to display using a `FnMut(&mut fmt::Formatter)`
pub struct DisplayWrapper<F: FnMut(&mut fmt::Formatter) -> fmt::Result>(RefCell<F>);

impl<F: FnMut(&mut fmt::Formatter) -> fmt::Result> DisplayWrapper<F> {
	/// Creates a new display wrapper
	#[must_use]
	pub const fn new(func: F) -> Self {
		Self(RefCell::new(func))
	}
}

impl<F: FnMut(&mut fmt::Formatter) -> fmt::Result> fmt::Display for DisplayWrapper<F> {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		// Note: `f` cannot be re-entrant, so this cannot fail
		self.0.borrow_mut()(f)
	}
}

#[cfg(test)]
mod tests {
	use {
		super::{DisplayWrapper, ReadLineTrimmed},
		std::io::{BufReader, Cursor},
	};

	#[test]
	fn read_lines_strips_terminators() {
		let mut reader = BufReader::new(Cursor::new(b"first\r\nsecond\n\nlast".to_vec()));
		let mut line = String::new();

		assert!(reader.read_line_trimmed(&mut line).unwrap());
		assert_eq!(line, "first");
		assert!(reader.read_line_trimmed(&mut line).unwrap());
		assert_eq!(line, "second");
		assert!(reader.read_line_trimmed(&mut line).unwrap());
		assert_eq!(line, "");
		assert!(reader.read_line_trimmed(&mut line).unwrap());
		assert_eq!(line, "last");
		assert!(!reader.read_line_trimmed(&mut line).unwrap());
		assert_eq!(line, "");
	}

	#[test]
	fn display_wrapper_forwards() {
		let value = 5;
		let wrapper = DisplayWrapper::new(|f| write!(f, "value={value}"));
		assert_eq!(wrapper.to_string(), "value=5");
	}
}
