//! Disassembly scanner
//!
//! Walks `objdump --disassemble --line-numbers` output and records every lock
//! instruction found in the catalog's non-inlined functions and inlined primitives.

// Imports
use {
	crate::{
		catalog::{self, Catalog, LockFlags, LockKind, NonInlinedFunc},
		fsm::{Input, Pattern, StateMatcher, Transition},
		Error,
	},
	regex::Captures,
	std::{fmt, io},
	synchar_util::ReadLineTrimmed,
};

/// Function definition, `<addr> <name>:`
const FUNC_DEF: &str = r"^(?P<addr>[A-Fa-f0-9]+) <(?P<func_name>[A-Za-z0-9_$#@./]+)>:";

/// Inlined function marker, `<name>():`
const INLINED_FUNC: &str = r"^(?P<func_name>[A-Za-z0-9_$#@./]+)\(\):";

/// Source location, `<file>:<line>`
const FILE_LINE: &str = r"^(?P<file_line>[A-Za-z0-9_$#@./-]+:[0-9]+)";

/// Blank line
const WHITESPACE: &str = r"^\s*$";

/// Any instruction with a mnemonic.
///
/// Excludes continuation lines holding only the remaining bytes of a long instruction.
const ANY_INSN: &str = r"^\s*(?P<addr>[A-Fa-f0-9]+):\s+(?P<bytes>(?:[0-9a-z][0-9a-z][ \t])+)\s*?\t[a-z]+.*?$";

/// Scanner state
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum ScanState {
	/// Looking for functions and source locations
	Scan,

	/// Inside a non-inlined lock function, looking for its lock instruction
	InFunc,

	/// After an inlined function or source location, looking for inlined lock primitives
	Inlined,
}

/// Lock instruction record
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct LockInstruction {
	/// Address of the enclosing non-inlined function
	pub func_pc: u64,

	/// Name of the lock function
	pub func_name: String,

	/// Instruction address
	pub pc: u64,

	/// Address offset operand
	pub offset: Option<u64>,

	/// Base register operand
	pub reg: Option<String>,

	/// Flags
	pub flags: LockFlags,

	/// Kind
	pub kind: LockKind,
}

impl fmt::Display for LockInstruction {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let offset = format!("{:#x}", self.offset.unwrap_or(0));
		write!(
			f,
			"{:#x} {offset:>10} {} {} {:#4x} 0x{:8x} {}",
			self.pc,
			self.reg.as_deref().unwrap_or("nil"),
			self.kind.id(),
			self.flags.bits(),
			self.func_pc,
			self.func_name
		)
	}
}

/// Instruction following a lock instruction
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct NextInsn {
	/// Address of the lock instruction
	pub lock_pc: u64,

	/// Name of the lock function
	pub func_name: String,

	/// Address of the next instruction, once seen
	pub pc: Option<u64>,
}

/// Scan record
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum ScanRecord {
	/// Lock instruction
	Lock(LockInstruction),

	/// Instruction following a lock instruction
	NextInsn(NextInsn),
}

/// Scanner context
#[derive(Debug)]
pub struct ScanContext<'c> {
	/// Catalog
	catalog: &'c Catalog,

	/// Current function name
	func_name: String,

	/// Address of the current non-inlined function
	func_pc: u64,

	/// Current source location
	file_line: Option<String>,

	/// Current non-inlined lock function
	func: Option<&'c NonInlinedFunc>,

	/// All records
	records: Vec<ScanRecord>,

	/// Index of the next instruction record awaiting its address
	pending_next: Option<usize>,
}

impl<'c> ScanContext<'c> {
	fn new(catalog: &'c Catalog) -> Self {
		Self {
			catalog,
			func_name: String::new(),
			func_pc: 0,
			file_line: None,
			func: None,
			records: vec![],
			pending_next: None,
		}
	}

	/// Fills in the pending next instruction record, if any
	fn resolve_next(&mut self, pc: u64) {
		let Some(idx) = self.pending_next.take() else {
			return;
		};

		if let Some(ScanRecord::NextInsn(next)) = self.records.get_mut(idx) {
			tracing::trace!(lock_pc = next.lock_pc, pc, "Resolved next instruction");
			next.pc = Some(pc);
		}
	}

	/// Records the lock instruction matched by `captures`
	fn record_lock(
		&mut self,
		captures: &Captures<'_>,
		func_name: &str,
		flags: LockFlags,
		kind: LockKind,
	) -> Result<(), Error> {
		let pc = self::parse_hex(&captures["addr"])?;
		let offset = captures.name("offset").map(|m| self::parse_hex(m.as_str())).transpose()?;
		let reg = match flags.contains(LockFlags::ADDR_IN_EAX) {
			true => Some("eax".to_owned()),
			false => captures.name("reg").map(|m| m.as_str().to_owned()),
		};

		if !flags.contains(LockFlags::NO_ADDR) && offset.unwrap_or(0) == 0 && reg.is_none() {
			return Err(Error::malformed(format!(
				"Lock instruction {pc:#x} in {func_name} has neither an offset nor a register"
			)));
		}

		let lock = LockInstruction {
			func_pc: self.func_pc,
			func_name: func_name.to_owned(),
			pc,
			offset,
			reg,
			flags,
			kind,
		};
		tracing::debug!(%lock, "Found lock instruction");
		self.records.push(ScanRecord::Lock(lock));

		// Note: Address in `eax` means the function entry is marked instead
		if !flags.contains(LockFlags::ADDR_IN_EAX) {
			self.pending_next = Some(self.records.len());
			self.records.push(ScanRecord::NextInsn(NextInsn {
				lock_pc:   pc,
				func_name: func_name.to_owned(),
				pc:        None,
			}));
		}

		Ok(())
	}

	/// Leaves the current function
	fn leave_func(&mut self) {
		self.func_name.clear();
		self.func = None;
	}
}

/// Disassembly scanner
#[derive(Debug)]
pub struct DisassemblyScanner<'c> {
	/// Matcher
	matcher: StateMatcher<ScanState, ScanContext<'c>>,

	/// Context
	ctx: ScanContext<'c>,

	/// Lines skipped due to errors
	lines_skipped: usize,
}

impl<'c> DisassemblyScanner<'c> {
	/// Creates a new scanner over the lock functions in `catalog`
	#[must_use]
	pub fn new(catalog: &'c Catalog) -> Self {
		use ScanState::*;

		let func_def = catalog::regex(FUNC_DEF);
		let inlined_func = catalog::regex(INLINED_FUNC);
		let file_line = catalog::regex(FILE_LINE);
		let whitespace = catalog::regex(WHITESPACE);
		let any_insn = catalog::regex(ANY_INSN);
		let addr_line = catalog::regex(catalog::ADDR_LINE);

		let mut matcher = StateMatcher::<ScanState, ScanContext<'c>>::new();

		matcher.add(Scan, Pattern::Regex(func_def.clone()), InFunc, Some(self::enter_func));
		matcher.add(Scan, Pattern::Regex(inlined_func.clone()), Inlined, Some(self::set_func_name));
		matcher.add(Scan, Pattern::Regex(file_line.clone()), Inlined, Some(self::set_file_line));
		matcher.add(Scan, Pattern::Regex(any_insn.clone()), Scan, Some(self::found_insn));
		matcher.add(Scan, Pattern::Default, Scan, None);

		matcher.add(Inlined, Pattern::Regex(file_line), Inlined, Some(self::set_file_line));
		matcher.add(Inlined, Pattern::Regex(inlined_func), Inlined, Some(self::set_func_name));
		matcher.add(Inlined, Pattern::Regex(any_insn), Inlined, Some(self::found_inlined_insn));
		matcher.add(Inlined, Pattern::Regex(func_def.clone()), InFunc, Some(self::enter_func));
		matcher.add(Inlined, Pattern::Default, Inlined, None);

		matcher.add(InFunc, Pattern::Regex(func_def), InFunc, Some(self::enter_func));
		matcher.add(InFunc, Pattern::Regex(addr_line), InFunc, Some(self::found_func_insn));
		matcher.add(InFunc, Pattern::Regex(whitespace), InFunc, Some(self::end_unrolled));
		matcher.add(InFunc, Pattern::Default, InFunc, None);

		for state in [Scan, Inlined, InFunc] {
			matcher.add(state, Pattern::Eof, Scan, Some(self::end_of_input));
		}

		matcher.start(Scan);

		Self {
			matcher,
			ctx: ScanContext::new(catalog),
			lines_skipped: 0,
		}
	}

	/// Scans a single line.
	///
	/// Unmatched lines are skipped, and malformed lock instructions discard the
	/// current function, resuming the scan at the next one.
	pub fn scan_line(&mut self, line: &str) -> Result<(), Error> {
		match self.matcher.execute(&mut self.ctx, Input::Line(line)) {
			Ok(_) => Ok(()),
			Err(err) if err.is_recoverable() => {
				tracing::warn!(?line, state = ?self.state(), "Skipping line: {err}");
				self.lines_skipped += 1;

				if matches!(err, Error::MalformedRecord { .. }) {
					self.ctx.leave_func();
					self.matcher.start(ScanState::Scan);
				}

				Ok(())
			},
			Err(err) => Err(err),
		}
	}

	/// Scans all lines of `reader`
	pub fn scan<R: io::BufRead>(&mut self, mut reader: R) -> Result<(), Error> {
		let mut line = String::new();
		while reader.read_line_trimmed(&mut line)? {
			self.scan_line(&line)?;
		}

		Ok(())
	}

	/// Finishes scanning, returning all records
	pub fn finish(mut self) -> Result<Vec<ScanRecord>, Error> {
		self.matcher.execute(&mut self.ctx, Input::Eof)?;
		tracing::debug!(
			records = self.ctx.records.len(),
			lines_skipped = self.lines_skipped,
			"Finished scanning"
		);

		Ok(self.ctx.records)
	}

	/// Returns the current state
	#[must_use]
	pub fn state(&self) -> ScanState {
		self.matcher.state().unwrap_or(ScanState::Scan)
	}

	/// Returns all records so far
	#[must_use]
	pub fn records(&self) -> &[ScanRecord] {
		&self.ctx.records
	}

	/// Returns all lock instruction records so far
	pub fn lock_records(&self) -> impl Iterator<Item = &LockInstruction> + '_ {
		self::lock_records(&self.ctx.records)
	}

	/// Returns the number of skipped lines
	#[must_use]
	pub fn lines_skipped(&self) -> usize {
		self.lines_skipped
	}
}

/// Returns all lock instruction records in `records`
pub fn lock_records(records: &[ScanRecord]) -> impl Iterator<Item = &LockInstruction> + '_ {
	records.iter().filter_map(|record| match record {
		ScanRecord::Lock(lock) => Some(lock),
		ScanRecord::NextInsn(_) => None,
	})
}

/// Enters a function definition
fn enter_func(ctx: &mut ScanContext<'_>, transition: &mut Transition<'_, ScanState>) -> Result<(), Error> {
	let func_name = transition.capture("func_name").unwrap_or_default();
	let func_pc = self::parse_hex(transition.capture("addr").unwrap_or_default())?;

	ctx.func_name = func_name.to_owned();
	ctx.func_pc = func_pc;
	match ctx.catalog.non_inlined(func_name) {
		Some(func) => {
			tracing::trace!(func_name, func_pc, "Entered lock function");
			ctx.func = Some(func);
			Ok(())
		},
		None => {
			ctx.leave_func();
			transition.restart(ScanState::Scan)
		},
	}
}

/// Sets the current function name from an inlined function marker
fn set_func_name(ctx: &mut ScanContext<'_>, transition: &mut Transition<'_, ScanState>) -> Result<(), Error> {
	let func_name = transition.capture("func_name").unwrap_or_default();

	// Note: `__xchg` is inlined within the mutex slow path, whose name we want to keep
	if func_name != "__xchg" {
		ctx.func_name = func_name.to_owned();
	}

	Ok(())
}

/// Sets the current source location
fn set_file_line(ctx: &mut ScanContext<'_>, transition: &mut Transition<'_, ScanState>) -> Result<(), Error> {
	ctx.file_line = transition.capture("file_line").map(str::to_owned);
	Ok(())
}

/// Handles any instruction outside of lock functions
fn found_insn(ctx: &mut ScanContext<'_>, transition: &mut Transition<'_, ScanState>) -> Result<(), Error> {
	let pc = self::parse_hex(transition.capture("addr").unwrap_or_default())?;
	ctx.resolve_next(pc);
	Ok(())
}

/// Handles any instruction after an inlined function or source location
fn found_inlined_insn(ctx: &mut ScanContext<'_>, transition: &mut Transition<'_, ScanState>) -> Result<(), Error> {
	self::found_insn(ctx, transition)?;

	let Some(line) = transition.input.as_line() else {
		return Ok(());
	};
	let catalog = ctx.catalog;
	if let Some((signature, captures)) = catalog.find_inlined(line, &ctx.func_name, ctx.file_line.as_deref()) {
		ctx.record_lock(&captures, &signature.func_name, signature.flags, signature.kind)?;
	}

	Ok(())
}

/// Handles any instruction inside of a lock function
fn found_func_insn(ctx: &mut ScanContext<'_>, transition: &mut Transition<'_, ScanState>) -> Result<(), Error> {
	self::found_insn(ctx, transition)?;

	let func = ctx
		.func
		.ok_or_else(|| Error::malformed("Instruction inside a lock function without a current function"))?;
	let Some(captures) = transition
		.input
		.as_line()
		.and_then(|line| catalog::match_start(&func.insn, line))
	else {
		return Ok(());
	};

	let func_name = ctx.func_name.clone();
	ctx.record_lock(&captures, &func_name, func.flags, func.kind)?;

	// Unrolled loops may have more lock instructions until the end of the function
	match func.flags.contains(LockFlags::LOOP_UNROLL) {
		true => Ok(()),
		false => transition.restart(ScanState::Scan),
	}
}

/// Leaves a function with an unrolled loop at the blank line ending it
fn end_unrolled(ctx: &mut ScanContext<'_>, transition: &mut Transition<'_, ScanState>) -> Result<(), Error> {
	match ctx.func.is_some_and(|func| func.flags.contains(LockFlags::LOOP_UNROLL)) {
		true => transition.restart(ScanState::Scan),
		false => Ok(()),
	}
}

/// Handles the end of input
fn end_of_input(ctx: &mut ScanContext<'_>, _transition: &mut Transition<'_, ScanState>) -> Result<(), Error> {
	if let Some(ScanRecord::NextInsn(next)) = ctx.pending_next.and_then(|idx| ctx.records.get(idx)) {
		tracing::warn!(lock_pc = next.lock_pc, func_name = %next.func_name, "Input ended before the instruction after a lock");
	}

	Ok(())
}

/// Parses a hexadecimal value, with or without a `0x` prefix
fn parse_hex(s: &str) -> Result<u64, Error> {
	let digits = s.strip_prefix("0x").unwrap_or(s);
	u64::from_str_radix(digits, 16).map_err(|err| Error::malformed(format!("Invalid hex value {s:?}: {err}")))
}

#[cfg(test)]
mod tests {
	use {
		super::{DisassemblyScanner, LockInstruction, NextInsn, ScanRecord, ScanState},
		crate::catalog::{Catalog, LockFlags, LockKind},
		std::io::Cursor,
	};

	fn scan(lines: &[&str]) -> (ScanState, Vec<ScanRecord>) {
		let catalog = Catalog::kernel();
		let mut scanner = DisassemblyScanner::new(&catalog);
		scanner.scan(Cursor::new(lines.join("\n"))).unwrap();
		let state = scanner.state();
		(state, scanner.finish().unwrap())
	}

	fn locks(records: &[ScanRecord]) -> Vec<&LockInstruction> {
		super::lock_records(records).collect()
	}

	#[test]
	fn mutex_lock() {
		let (_, records) = scan(&[
			"c0100000 <mutex_lock>:",
			"c0100000:\t89 c2                \tmov    %eax,%edx",
			"c0100005:\tf0 ff 0a             \tlock decl (%edx)",
			"c0100008:\t79 05                \tjns    c010000f <mutex_lock+0xf>",
		]);

		assert_eq!(records, [
			ScanRecord::Lock(LockInstruction {
				func_pc:   0xc010_0000,
				func_name: "mutex_lock".to_owned(),
				pc:        0xc010_0005,
				offset:    None,
				reg:       Some("edx".to_owned()),
				flags:     LockFlags::LOCK | LockFlags::TIME_RET,
				kind:      LockKind::Mutex,
			}),
			ScanRecord::NextInsn(NextInsn {
				lock_pc:   0xc010_0005,
				func_name: "mutex_lock".to_owned(),
				pc:        Some(0xc010_0008),
			}),
		]);
	}

	#[test]
	fn uninteresting_function() {
		let (state, records) = scan(&[
			"c0200000 <printk>:",
			"c0200005:\tf0 ff 0a             \tlock decl (%edx)",
		]);
		assert_eq!(state, ScanState::Scan);
		assert!(records.is_empty());
	}

	#[test]
	fn unrolled_loop() {
		let (state, records) = scan(&[
			"c0300000 <__down>:",
			"c0300003:\tf0 ff 48 10          \tlock decl 0x10(%eax)",
			"c0300007:\t78 f7                \tjs     c0300000 <__down>",
			"c0300009:\tf0 ff 48 10          \tlock decl 0x10(%eax)",
			"c030000d:\tc3                   \tret    ",
			"",
			"c0300010:\tf0 ff 48 10          \tlock decl 0x10(%eax)",
		]);

		assert_eq!(state, ScanState::Scan);
		let locks = self::locks(&records);
		assert_eq!(locks.len(), 2);
		assert_eq!(locks[0].pc, 0xc030_0003);
		assert_eq!(locks[1].pc, 0xc030_0009);
		assert!(locks.iter().all(|lock| lock.offset == Some(0x10) && lock.kind == LockKind::Semaphore));
	}

	#[test]
	fn inlined_down() {
		let (state, records) = scan(&[
			"c0259a00 <tty_ioctl>:",
			"down():",
			"include/asm/semaphore.h:100",
			"c0259a2b:\tf0 ff 4e 54          \tlock decl 0x54(%esi)",
			"c0259a2f:\t0f 88 cd 01 00 00    \tjs     c0259c02 <.text.lock.tty_ioctl+0x1a>",
		]);

		assert_eq!(state, ScanState::Inlined);
		assert_eq!(records, [
			ScanRecord::Lock(LockInstruction {
				func_pc:   0xc025_9a00,
				func_name: "down".to_owned(),
				pc:        0xc025_9a2b,
				offset:    Some(0x54),
				reg:       Some("esi".to_owned()),
				flags:     LockFlags::INLINED | LockFlags::LOCK,
				kind:      LockKind::Semaphore,
			}),
			ScanRecord::NextInsn(NextInsn {
				lock_pc:   0xc025_9a2b,
				func_name: "down".to_owned(),
				pc:        Some(0xc025_9a2f),
			}),
		]);
	}

	#[test]
	fn xchg_keeps_func_name() {
		let (_, records) = scan(&[
			"__mutex_lock_common():",
			"__xchg():",
			"c02a0100:\t87 02                \txchg   %eax,(%edx)",
		]);

		let locks = self::locks(&records);
		assert_eq!(locks.len(), 1);
		assert_eq!(locks[0].func_name, "__mutex_lock_common");
		assert_eq!(locks[0].reg.as_deref(), Some("edx"));
	}

	#[test]
	fn completion_marks_function_entry() {
		let (state, records) = scan(&[
			"c0400000 <complete>:",
			"c0400000:\t55                   \tpush   %ebp",
			"c0400001:\t89 e5                \tmov    %esp,%ebp",
		]);

		assert_eq!(state, ScanState::Scan);
		assert_eq!(records.len(), 1);
		let locks = self::locks(&records);
		assert_eq!(locks[0].pc, 0xc040_0000);
		assert_eq!(locks[0].reg.as_deref(), Some("eax"));
		assert_eq!(locks[0].kind, LockKind::Completion);
	}

	#[test]
	fn malformed_lock_is_discarded() {
		let catalog = Catalog::kernel();
		let mut scanner = DisassemblyScanner::new(&catalog);

		for line in [
			"down():",
			"include/asm/semaphore.h:100",
			"c0259a2b:\tf0 ff 0d 00 00 00 00 \tlock decl 0x0",
		] {
			scanner.scan_line(line).unwrap();
		}

		assert_eq!(scanner.state(), ScanState::Scan);
		assert_eq!(scanner.lines_skipped(), 1);
		assert!(scanner.records().is_empty());

		// Scanning continues afterwards
		scanner.scan_line("c0100000 <mutex_lock>:").unwrap();
		scanner.scan_line("c0100005:\tf0 ff 0a             \tlock decl (%edx)").unwrap();
		assert_eq!(scanner.lock_records().count(), 1);
	}

	#[test]
	fn map_line() {
		let lock = LockInstruction {
			func_pc:   0xc010_0000,
			func_name: "mutex_lock".to_owned(),
			pc:        0xc010_0005,
			offset:    None,
			reg:       Some("eax".to_owned()),
			flags:     LockFlags::LOCK | LockFlags::TIME_RET,
			kind:      LockKind::Mutex,
		};
		assert_eq!(lock.to_string(), "0xc0100005        0x0 eax 7 0x21 0xc0100000 mutex_lock");

		let lock = LockInstruction {
			offset: Some(0x54),
			reg: None,
			flags: LockFlags::UNLOCK,
			..lock
		};
		assert_eq!(lock.to_string(), "0xc0100005       0x54 nil 7  0x2 0xc0100000 mutex_lock");
	}
}
