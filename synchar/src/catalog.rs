//! Lock function catalog
//!
//! Describes which functions contain lock instructions and how to recognize them.
//! Non-inlined functions are found by name at their definition, while inlined
//! lock primitives are found by matching instructions against a priority-ordered
//! list of signatures.

// Imports
use {
	regex::{Captures, Regex},
	std::collections::HashMap,
};

bitflags::bitflags! {
	/// Lock instruction flags
	#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
	pub struct LockFlags: u8 {
		/// Acquires the lock
		const LOCK = 0x1;

		/// Releases the lock
		const UNLOCK = 0x2;

		/// May acquire the lock
		const TRYLOCK = 0x4;

		/// Found in an inlined primitive
		const INLINED = 0x8;

		/// Lock address is in `eax` at the function entry
		const ADDR_IN_EAX = 0x10;

		/// Return is relevant for timing
		const TIME_RET = 0x20;

		/// Lock has no address
		const NO_ADDR = 0x40;

		/// Lock instruction may appear several times in an unrolled loop
		const LOOP_UNROLL = 0x80;
	}
}

/// Lock kind
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[derive(strum::Display, strum::FromRepr, strum::IntoStaticStr)]
#[derive(serde::Serialize, serde::Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum LockKind {
	Semaphore = 1,
	ReadSemaphore = 2,
	WriteSemaphore = 3,
	Spin = 4,
	ReadSpin = 5,
	WriteSpin = 6,
	Mutex = 7,
	Completion = 8,
	Rcu = 9,
	Futex = 10,
	CxAtomic = 11,
	CxExclusive = 12,
}

impl LockKind {
	/// Returns the numeric id of this kind
	#[must_use]
	pub const fn id(self) -> u8 {
		self as u8
	}
}

/// Non-inlined lock function
#[derive(Clone, Debug)]
pub struct NonInlinedFunc {
	/// Flags
	pub flags: LockFlags,

	/// Kind
	pub kind: LockKind,

	/// Instruction that locates the lock address
	pub insn: Regex,
}

/// Inlined lock primitive signature
#[derive(Clone, Debug)]
pub struct InlinedSignature {
	/// Instruction that locates the lock address
	pub insn: Regex,

	/// Name of the inlined function
	pub func_name: String,

	/// Substring of the source location annotation.
	///
	/// If `None`, only the function name is matched.
	pub file_line: Option<String>,

	/// Flags
	pub flags: LockFlags,

	/// Kind
	pub kind: LockKind,
}

impl InlinedSignature {
	/// Returns if this signature applies in the current function and source location
	#[must_use]
	pub fn applies_to(&self, func_name: &str, file_line: Option<&str>) -> bool {
		if self.func_name == func_name {
			return true;
		}

		match (&self.file_line, file_line) {
			(Some(expected), Some(file_line)) => file_line.contains(expected.as_str()),
			_ => false,
		}
	}
}

/// Lock function catalog
#[derive(Clone, Debug)]
pub struct Catalog {
	/// Non-inlined functions, by name
	non_inlined: HashMap<String, NonInlinedFunc>,

	/// Inlined signatures, by priority
	inlined: Vec<InlinedSignature>,
}

impl Catalog {
	/// Creates a catalog
	#[must_use]
	pub fn new(non_inlined: HashMap<String, NonInlinedFunc>, inlined: Vec<InlinedSignature>) -> Self {
		Self { non_inlined, inlined }
	}

	/// Returns the non-inlined function `name`
	#[must_use]
	pub fn non_inlined(&self, name: &str) -> Option<&NonInlinedFunc> {
		self.non_inlined.get(name)
	}

	/// Returns all inlined signatures, by priority
	#[must_use]
	pub fn inlined(&self) -> &[InlinedSignature] {
		&self.inlined
	}

	/// Finds the first inlined signature whose instruction matches `line` and
	/// which applies to the current function / source location.
	pub fn find_inlined<'a, 'l>(
		&'a self,
		line: &'l str,
		func_name: &str,
		file_line: Option<&str>,
	) -> Option<(&'a InlinedSignature, Captures<'l>)> {
		self.inlined.iter().find_map(|signature| {
			let captures = self::match_start(&signature.insn, line)?;
			signature
				.applies_to(func_name, file_line)
				.then_some((signature, captures))
		})
	}

	/// Creates the catalog for the i386 linux kernel (2.4 and 2.6 series)
	#[must_use]
	#[allow(clippy::too_many_lines)] // It's a table
	pub fn kernel() -> Self {
		use {LockFlags as F, LockKind as K};

		let lock = self::insn(r"lock .*?");
		let xcas = self::regex(&format!(r"{INSN_PREFIX}xcas.*"));
		let addr = self::regex(ADDR_LINE);
		let raw_spin_unlock = self::insn(r"movb\s+\$0x1,");

		let mut non_inlined = HashMap::new();
		let mut add = |names: &[&str], flags: F, kind: K, insn: &Regex| {
			for &name in names {
				let prev = non_inlined.insert(name.to_owned(), NonInlinedFunc {
					flags,
					kind,
					insn: insn.clone(),
				});
				debug_assert!(prev.is_none(), "Duplicate catalog entry {name:?}");
			}
		};

		add(&["_spin_lock", "_spin_lock_irqsave", "_spin_lock_irq", "_spin_lock_bh"], F::LOCK | F::TIME_RET, K::Spin, &lock);
		add(&["_cspin_lock", "_cspin_lock_irqsave", "_cspin_lock_irq", "_cspin_lock_bh"], F::LOCK | F::TIME_RET, K::Spin, &lock);
		add(&["_read_trylock"], F::TRYLOCK, K::ReadSpin, &lock);
		add(&["_write_trylock"], F::TRYLOCK, K::WriteSpin, &lock);
		add(&["_read_lock_irqsave", "_read_lock_irq", "_read_lock_bh", "_read_lock"], F::LOCK | F::TIME_RET, K::ReadSpin, &lock);
		add(&["_write_lock_irqsave", "_write_lock_irq", "_write_lock_bh", "_write_lock"], F::LOCK | F::TIME_RET, K::WriteSpin, &lock);
		add(&["mutex_lock", "mutex_lock_interruptible"], F::LOCK | F::TIME_RET, K::Mutex, &lock);
		add(&["mutex_trylock"], F::TRYLOCK, K::Mutex, &lock);
		add(&["mutex_unlock"], F::UNLOCK | F::TIME_RET, K::Mutex, &lock);
		add(&["__down"], F::LOCK | F::TIME_RET | F::LOOP_UNROLL, K::Semaphore, &lock);
		add(&["complete", "complete_all"], F::UNLOCK | F::ADDR_IN_EAX | F::TIME_RET, K::Completion, &addr);
		add(
			&["wait_for_completion", "wait_for_completion_timeout", "wait_for_completion_interruptible_timeout", "wait_for_completion_interruptible"],
			F::LOCK | F::ADDR_IN_EAX, K::Completion, &addr,
		);
		add(&["_cx_atomic", "_cx_atomic_bh", "_cx_atomic_irq", "_cx_atomic_irqsave"], F::LOCK | F::ADDR_IN_EAX | F::LOOP_UNROLL, K::CxAtomic, &xcas);
		add(&["_cx_exclusive", "_cx_exclusive_bh", "_cx_exclusive_irq", "_cx_exclusive_irqsave"], F::LOCK | F::ADDR_IN_EAX, K::CxExclusive, &xcas);
		add(&["_cx_unlock_wait"], F::ADDR_IN_EAX, K::CxAtomic, &xcas);
		add(&["_cx_atomic_trylock", "_cx_atomic_trylock_bh"], F::TRYLOCK | F::ADDR_IN_EAX, K::CxAtomic, &xcas);
		add(&["_cx_exclusive_trylock", "_cx_exclusive_trylock_bh"], F::TRYLOCK | F::ADDR_IN_EAX, K::CxExclusive, &xcas);
		add(&["_cx_end", "_cx_end_bh", "_cx_end_irq", "_cx_end_irqrestore"], F::UNLOCK, K::CxExclusive, &raw_spin_unlock);

		let down = self::insn(r"lock decl ");
		let down_read = self::regex(&format!(
			r"{INSN_PREFIX}lock incl (?P<offset>[A-Fa-f0-9x]+)?\(%(?P<reg>eax)\)$"
		));
		let down_read_trylock = self::insn(r"lock cmpxchg.*?");
		let up = self::insn(r"lock incl ");
		let xadd = self::insn(r"lock xadd.*?");
		let raw_write_unlock = self::insn(r"lock addl \$0x1000000,");
		let xchg = self::insn(r"xchg .*?");
		let raw_read_lock = self::insn(r"lock subl \$0x1,");
		let raw_write_lock = self::insn(r"lock subl \$0x1000000,");
		let raw_spin_lock = self::insn(r"lock decb\s+");
		let rwsem_atomic_add = self::insn(r"lock add.*?,");
		let nop = self::regex(&format!(r"{INSN_PREFIX}nop\s*$"));
		let movl = self::insn(r"movl\s+\$0x1,");

		let sig = |insn: &Regex, func_name: &str, file_line: Option<&str>, flags: F, kind: K| InlinedSignature {
			insn: insn.clone(),
			func_name: func_name.to_owned(),
			file_line: file_line.map(str::to_owned),
			flags,
			kind,
		};

		#[rustfmt::skip]
		let inlined = vec![
			sig(&down,              "down",                    Some("include/asm/semaphore.h:100"),  F::INLINED | F::LOCK,                K::Semaphore),
			sig(&down,              "down_interruptible",      Some("include/asm/semaphore.h:124"),  F::INLINED | F::LOCK,                K::Semaphore),
			sig(&down,              "down_trylock",            Some("include/asm/semaphore.h:149"),  F::INLINED | F::TRYLOCK,             K::Semaphore),
			sig(&up,                "up",                      Some("include/asm/semaphore.h:174"),  F::INLINED | F::UNLOCK,              K::Semaphore),
			sig(&down_read,         "__down_read",             Some("include/asm/rwsem.h:101"),      F::INLINED | F::LOCK,                K::ReadSemaphore),
			sig(&down_read_trylock, "__down_read_trylock",     Some("include/asm/rwsem.h:127"),      F::INLINED | F::TRYLOCK,             K::ReadSemaphore),
			sig(&xadd,              "__down_write",            Some("include/asm/rwsem.h:152"),      F::INLINED | F::LOCK,                K::WriteSemaphore),
			sig(&xadd,              "__up_read",               Some("include/asm/rwsem.h:190"),      F::INLINED | F::UNLOCK,              K::ReadSemaphore),
			sig(&xadd,              "__up_write",              Some("include/asm/rwsem.h:215"),      F::INLINED | F::UNLOCK,              K::WriteSemaphore),
			sig(&xchg,              "__raw_spin_trylock",      Some("include/asm/spinlock.h:69"),    F::INLINED | F::TRYLOCK,             K::Spin),
			sig(&raw_spin_unlock,   "__raw_spin_unlock",       Some("include/asm/spinlock.h:92"),    F::INLINED | F::UNLOCK,              K::Spin),
			sig(&raw_spin_lock,     "__raw_spin_lock",         Some("include/asm/spinlock.h:54"),    F::INLINED | F::LOCK,                K::Spin),
			sig(&raw_read_lock,     "__raw_read_lock",         Some("include/asm/spinlock.h:153"),   F::INLINED | F::LOCK | F::TIME_RET,  K::ReadSpin),
			sig(&raw_read_lock,     "__raw_read_lock",         Some("include/asm/spinlock.h:167"),   F::INLINED | F::LOCK | F::TIME_RET,  K::ReadSpin),
			sig(&raw_write_lock,    "__raw_write_lock",        Some("include/asm/spinlock.h:158"),   F::INLINED | F::LOCK | F::TIME_RET,  K::WriteSpin),
			sig(&raw_write_lock,    "__raw_write_lock",        Some("include/asm/spinlock.h:172"),   F::INLINED | F::LOCK | F::TIME_RET,  K::WriteSpin),
			sig(&raw_write_lock,    "__write_lock_failed",     None,                                 F::INLINED | F::LOCK,                K::WriteSpin),
			sig(&down,              "__read_lock_failed",      None,                                 F::INLINED | F::LOCK,                K::ReadSpin),
			sig(&rwsem_atomic_add,  "rwsem_atomic_add",        Some("include/asm/rwsem.h:266"),      F::INLINED | F::LOCK,                K::ReadSemaphore),
			// Note: Either a lock or an unlock, so neither flag is set
			sig(&xadd,              "rwsem_atomic_update",     Some("include/asm/rwsem.h:279"),      F::INLINED,                          K::WriteSemaphore),
			sig(&up,                "__raw_read_unlock",       Some("include/asm/spinlock.h:182"),   F::INLINED | F::UNLOCK,              K::ReadSpin),
			sig(&raw_write_unlock,  "__raw_write_unlock",      Some("include/asm/spinlock.h:187"),   F::INLINED | F::UNLOCK,              K::WriteSpin),
			sig(&up,                "__raw_read_unlock",       Some("include/asm/spinlock.h:196"),   F::INLINED | F::UNLOCK,              K::ReadSpin),
			sig(&raw_write_unlock,  "__raw_write_unlock",      Some("include/asm/spinlock.h:201"),   F::INLINED | F::UNLOCK,              K::WriteSpin),
			sig(&nop,               "rcu_read_lock",           Some("include/linux/rcupdate.h:168"), F::INLINED | F::LOCK | F::NO_ADDR,   K::Rcu),
			sig(&xchg,              "__mutex_lock_common",     None,                                 F::INLINED | F::LOCK,                K::Mutex),
			sig(&movl,              "__mutex_unlock_slowpath", Some("kernel/mutex.c:238"),           F::INLINED | F::LOCK,                K::Mutex),

			// 2.4 series
			sig(&xchg,              "spin_trylock",            Some("include/asm/spinlock.h:224"),   F::INLINED | F::TRYLOCK,             K::Spin),
			sig(&raw_spin_unlock,   "spin_unlock",             Some("include/asm/spinlock.h:193"),   F::INLINED | F::UNLOCK,              K::Spin),
			sig(&raw_spin_lock,     "spin_lock",               Some("include/asm/spinlock.h:241"),   F::INLINED | F::LOCK,                K::Spin),
			sig(&xchg,              "raw_spin_trylock",        Some("include/asm/spinlock.h:127"),   F::INLINED | F::TRYLOCK,             K::Spin),
			sig(&raw_spin_unlock,   "raw_spin_unlock",         Some("include/asm/spinlock.h:96"),    F::INLINED | F::UNLOCK,              K::Spin),
			sig(&raw_spin_lock,     "raw_spin_lock",           Some("include/asm/spinlock.h:144"),   F::INLINED | F::LOCK,                K::Spin),
			sig(&raw_read_lock,     "read_lock",               Some("include/asm/spinlock.h:294"),   F::INLINED | F::LOCK | F::TIME_RET,  K::ReadSpin),
			sig(&raw_write_lock,    "write_lock",              Some("include/asm/spinlock.h:303"),   F::INLINED | F::LOCK | F::TIME_RET,  K::WriteSpin),
			sig(&raw_write_lock,    "__write_lock_failed",     None,                                 F::INLINED | F::LOCK,                K::WriteSpin),
			sig(&down,              "__read_lock_failed",      None,                                 F::INLINED | F::LOCK,                K::ReadSpin),
			sig(&up,                "read_unlock",             Some("include/asm/spinlock.h:320"),   F::INLINED | F::UNLOCK,              K::ReadSpin),
			sig(&raw_write_unlock,  "write_unlock",            Some("include/asm/spinlock.h:325"),   F::INLINED | F::UNLOCK,              K::WriteSpin),
		];

		Self::new(non_inlined, inlined)
	}
}

/// Prefix of a disassembled instruction line, up to the mnemonic
pub const INSN_PREFIX: &str = r"^\s*(?P<addr>[A-Fa-f0-9]+):\s+(?P<bytes>(?:[0-9a-z][0-9a-z][ \t])+)\s*?\t";

/// Lock address operand, `<offset>(%<reg>)`, with both parts optional
pub const ADDR_OPERAND: &str = r"(?P<offset>[A-Fa-f0-9x]+)?\(?%?(?P<reg>[a-z][a-z][a-z])?\)?$";

/// Any line starting with an instruction address
pub const ADDR_LINE: &str = r"^\s*(?P<addr>[A-Fa-f0-9]+):\s+";

/// Matches `regex` against `line`, only accepting matches at the start
pub fn match_start<'l>(regex: &Regex, line: &'l str) -> Option<Captures<'l>> {
	let captures = regex.captures(line)?;
	(captures.get(0)?.start() == 0).then_some(captures)
}

/// Builds an instruction regex for `mnemonic` followed by an address operand
fn insn(mnemonic: &str) -> Regex {
	self::regex(&format!("{INSN_PREFIX}{mnemonic}{ADDR_OPERAND}"))
}

/// Compiles a built-in regex
pub(crate) fn regex(re: &str) -> Regex {
	Regex::new(re).expect("Built-in regex should be valid")
}

#[cfg(test)]
mod tests {
	use super::{Catalog, LockFlags, LockKind};

	#[test]
	fn non_inlined_lookup() {
		let catalog = Catalog::kernel();

		let mutex_lock = catalog.non_inlined("mutex_lock").unwrap();
		assert_eq!(mutex_lock.kind, LockKind::Mutex);
		assert_eq!(mutex_lock.flags, LockFlags::LOCK | LockFlags::TIME_RET);
		assert!(mutex_lock.insn.is_match("c0100005:\tf0 ff 08             \tlock decl (%eax)"));
		assert!(!mutex_lock.insn.is_match("c0100005:\t89 c3                \tmov    %eax,%ebx"));

		let down = catalog.non_inlined("__down").unwrap();
		assert!(down.flags.contains(LockFlags::LOOP_UNROLL));

		assert!(catalog.non_inlined("printk").is_none());
	}

	#[test]
	fn lock_kind_ids() {
		assert_eq!(LockKind::Semaphore.id(), 1);
		assert_eq!(LockKind::Mutex.id(), 7);
		assert_eq!(LockKind::CxExclusive.id(), 12);
		assert_eq!(LockKind::from_repr(9), Some(LockKind::Rcu));
		assert_eq!(LockKind::from_repr(13), None);
		assert_eq!(LockKind::ReadSpin.to_string(), "read_spin");
	}

	#[test]
	fn inlined_by_file_line() {
		let catalog = Catalog::kernel();
		let line = "c0259a2b:       f0 ff 4e 54             \tlock decl 0x54(%esi)";

		let (signature, captures) = catalog
			.find_inlined(line, "tty_ioctl", Some("include/asm/semaphore.h:100"))
			.unwrap();
		assert_eq!(signature.func_name, "down");
		assert_eq!(signature.kind, LockKind::Semaphore);
		assert_eq!(&captures["addr"], "c0259a2b");
		assert_eq!(&captures["offset"], "0x54");
		assert_eq!(&captures["reg"], "esi");

		// The `down_interruptible` entry has a lower priority, but matches by name
		let (signature, _) = catalog
			.find_inlined(line, "down_interruptible", Some("include/asm/semaphore.h:124"))
			.unwrap();
		assert_eq!(signature.func_name, "down_interruptible");
	}

	#[test]
	fn inlined_name_only() {
		let catalog = Catalog::kernel();
		let line = "c01e0000:\tf0 ff 08             \tlock decl (%eax)";

		assert!(catalog.find_inlined(line, "some_func", Some("lib/foo.c:10")).is_none());
		assert!(catalog.find_inlined(line, "some_func", None).is_none());

		let (signature, _) = catalog.find_inlined(line, "__read_lock_failed", None).unwrap();
		assert_eq!(signature.kind, LockKind::ReadSpin);
		assert_eq!(signature.file_line, None);
	}

	#[test]
	fn rcu_nop() {
		let catalog = Catalog::kernel();
		let (signature, captures) = catalog
			.find_inlined("c0110000:\t90                   \tnop", "x", Some("include/linux/rcupdate.h:168"))
			.unwrap();
		assert_eq!(signature.kind, LockKind::Rcu);
		assert!(signature.flags.contains(LockFlags::NO_ADDR));
		assert!(captures.name("offset").is_none());
	}
}
