//! Worksets
//!
//! A workset is the set of memory addresses touched during a single critical
//! section. Accesses are stored as [`AccessChunk`]s, each covering 16 consecutive
//! bytes with interleaved read/write bits.

// Imports
use std::{
	collections::{BTreeMap, BTreeSet, HashSet},
	fmt,
};

/// Access chunk.
///
/// Covers [`AccessChunk::BYTES`] consecutive bytes. For byte `j` of the chunk,
/// bit `2 * j` is set if it was read and bit `2 * j + 1` if it was written.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct AccessChunk(u32);

impl AccessChunk {
	/// Bytes covered by each chunk
	pub const BYTES: u64 = 16;
	/// Mask of all read bits
	pub const READ_MASK: u32 = 0x5555_5555;
	/// Mask of all write bits
	pub const WRITE_MASK: u32 = 0xAAAA_AAAA;

	/// Creates a chunk from its raw bits
	#[must_use]
	pub const fn from_bits(bits: u32) -> Self {
		Self(bits)
	}

	/// Creates a chunk from per-byte read and write masks, where bit `j` refers to byte `j`.
	#[must_use]
	pub fn from_masks(reads: u16, writes: u16) -> Self {
		let bits = (0..16).fold(0, |bits, byte| {
			let read = u32::from(reads >> byte & 1);
			let write = u32::from(writes >> byte & 1);
			bits | read << (2 * byte) | write << (2 * byte + 1)
		});

		Self(bits)
	}

	/// Returns the raw bits
	#[must_use]
	pub const fn bits(self) -> u32 {
		self.0
	}

	/// Returns the read bits, at the even positions
	#[must_use]
	pub const fn reads(self) -> u32 {
		self.0 & Self::READ_MASK
	}

	/// Returns the write bits, shifted to the even positions
	#[must_use]
	pub const fn writes(self) -> u32 {
		(self.0 & Self::WRITE_MASK) >> 1
	}

	/// Returns the touched bits, at the even positions
	#[must_use]
	pub const fn touched(self) -> u32 {
		self.reads() | self.writes()
	}

	/// Returns the bytes of this chunk that conflict with `other`, at the even positions.
	///
	/// A byte conflicts if either chunk writes it while the other accesses it.
	#[must_use]
	pub const fn conflicts(self, other: Self) -> u32 {
		(self.reads() & other.writes()) | (other.reads() & self.writes()) | (self.writes() & other.writes())
	}

	/// Returns all byte offsets set in `bits` (at the even positions)
	pub fn byte_offsets(bits: u32) -> impl Iterator<Item = u64> {
		(0..Self::BYTES).filter(move |&byte| bits >> (2 * byte) & 1 != 0)
	}
}

impl fmt::Debug for AccessChunk {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "AccessChunk({:#010x})", self.0)
	}
}

/// Workset information, as logged when the critical section closes
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct WorkSetInfo {
	/// Lock address
	pub lock_addr: u64,

	/// Lock generation
	pub generation: u64,

	/// Index within the generation
	pub index: u64,

	/// Owning process ids
	pub pids: BTreeSet<u32>,

	/// Owning cpu
	pub cpu: u32,

	/// Indices of the worksets contending for the lock
	pub contending: Vec<u64>,

	/// Whether any io occurred
	pub io: bool,
}

/// Workset
#[derive(Clone, Debug)]
pub struct WorkSet {
	/// Info
	info: WorkSetInfo,

	/// Chunks, by start address
	chunks: BTreeMap<u64, Vec<AccessChunk>>,

	// Cached sizes
	size:       usize,
	wsize:      usize,
	size_words: usize,
}

impl WorkSet {
	/// Creates a new workset
	#[must_use]
	pub fn new(info: WorkSetInfo, chunks: BTreeMap<u64, Vec<AccessChunk>>) -> Self {
		let all_chunks = || chunks.values().flatten();
		let size = all_chunks().map(|chunk| chunk.touched().count_ones() as usize).sum();
		let wsize = all_chunks().map(|chunk| chunk.writes().count_ones() as usize).sum();
		let size_words = self::touched_words(&chunks).len();

		Self {
			info,
			chunks,
			size,
			wsize,
			size_words,
		}
	}

	/// Returns the info
	#[must_use]
	pub fn info(&self) -> &WorkSetInfo {
		&self.info
	}

	/// Returns the lock address
	#[must_use]
	pub fn lock_addr(&self) -> u64 {
		self.info.lock_addr
	}

	/// Returns the lock generation
	#[must_use]
	pub fn generation(&self) -> u64 {
		self.info.generation
	}

	/// Returns the first (lowest) owning process id
	#[must_use]
	pub fn first_pid(&self) -> Option<u32> {
		self.info.pids.first().copied()
	}

	/// Returns if this workset shares an owning process with `other`
	#[must_use]
	pub fn shares_pid(&self, other: &Self) -> bool {
		!self.info.pids.is_disjoint(&other.info.pids)
	}

	/// Returns the chunks, by start address
	#[must_use]
	pub fn chunks(&self) -> &BTreeMap<u64, Vec<AccessChunk>> {
		&self.chunks
	}

	/// Returns the number of bytes touched
	#[must_use]
	pub fn size(&self) -> usize {
		self.size
	}

	/// Returns the number of bytes written
	#[must_use]
	pub fn wsize(&self) -> usize {
		self.wsize
	}

	/// Returns the number of distinct words touched
	#[must_use]
	pub fn size_words(&self) -> usize {
		self.size_words
	}

	/// Compares this workset with `other`, returning the number of conflicts.
	///
	/// Only chunks at addresses present in both worksets are compared. Conflicting
	/// bytes are rounded down to their word and each word is counted once. If
	/// `count_io` is set and either workset performed io, an extra [`Conflict::Io`]
	/// is counted.
	///
	/// If `intersection` is given, it is cleared and filled with every conflict
	/// counted, so that its length equals the returned count.
	pub fn compare(&self, other: &Self, intersection: Option<&mut Vec<Conflict>>, count_io: bool) -> usize {
		let mut local_intersection = vec![];
		let intersection = intersection.unwrap_or(&mut local_intersection);
		intersection.clear();

		if count_io && (self.info.io || other.info.io) {
			intersection.push(Conflict::Io);
		}

		let mut seen = HashSet::new();
		for (&addr, chunks) in &self.chunks {
			let Some(other_chunks) = other.chunks.get(&addr) else {
				continue;
			};

			for (chunk_idx, (chunk, other_chunk)) in chunks.iter().zip(other_chunks).enumerate() {
				let conflicts = chunk.conflicts(*other_chunk);
				let chunk_addr = addr + chunk_idx as u64 * AccessChunk::BYTES;
				for byte in AccessChunk::byte_offsets(conflicts) {
					let word = self::word_of(chunk_addr + byte);
					if seen.insert(word) {
						intersection.push(Conflict::Addr(word));
					}
				}
			}
		}

		intersection.len()
	}
}

/// Conflict between two worksets
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
#[derive(serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Conflict {
	/// Either workset performed io
	Io,

	/// Both worksets accessed this word, with at least one write
	Addr(u64),
}

impl fmt::Display for Conflict {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Io => f.pad("io"),
			Self::Addr(addr) => f.pad(&format!("{addr:#x}")),
		}
	}
}

/// Rounds `addr` down to its word
const fn word_of(addr: u64) -> u64 {
	addr & !0b11
}

/// Returns all distinct words touched in `chunks`
fn touched_words(chunks: &BTreeMap<u64, Vec<AccessChunk>>) -> BTreeSet<u64> {
	let mut words = BTreeSet::new();
	for (&addr, chunks) in chunks {
		for (chunk_idx, &chunk) in chunks.iter().enumerate() {
			let chunk_addr = addr + chunk_idx as u64 * AccessChunk::BYTES;
			words.extend(AccessChunk::byte_offsets(chunk.touched()).map(|byte| self::word_of(chunk_addr + byte)));
		}
	}

	words
}

#[cfg(test)]
pub(crate) mod tests {
	use {
		super::{AccessChunk, Conflict, WorkSet, WorkSetInfo},
		std::collections::{BTreeMap, BTreeSet},
	};

	/// Creates a workset for `pid` from `(addr, reads, writes)` chunks
	pub(crate) fn workset(lock_addr: u64, pid: u32, io: bool, chunks: &[(u64, u16, u16)]) -> WorkSet {
		let info = WorkSetInfo {
			lock_addr,
			generation: 1,
			index: 0,
			pids: BTreeSet::from([pid]),
			cpu: 0,
			contending: vec![],
			io,
		};
		let chunks = chunks
			.iter()
			.map(|&(addr, reads, writes)| (addr, vec![AccessChunk::from_masks(reads, writes)]))
			.collect::<BTreeMap<_, _>>();

		WorkSet::new(info, chunks)
	}

	#[test]
	fn chunk_layout() {
		let chunk = AccessChunk::from_masks(0b01, 0b10);
		assert_eq!(chunk.bits(), 0b1001);
		assert_eq!(chunk.reads(), 0b0001);
		assert_eq!(chunk.writes(), 0b0100);
		assert_eq!(chunk.touched(), 0b0101);

		let chunk = AccessChunk::from_masks(0xffff, 0xffff);
		assert_eq!(chunk.bits(), u32::MAX);
		assert_eq!(AccessChunk::byte_offsets(chunk.touched()).count(), 16);
	}

	#[test]
	fn sizes() {
		// Bytes 0..3 read and bytes 2..4 written
		let ws = self::workset(0x10, 1, false, &[(0x1000, 0b0111, 0b1100), (0x2000, 0, 0)]);
		assert_eq!(ws.size(), 4);
		assert_eq!(ws.wsize(), 2);
		assert_eq!(ws.size_words(), 1);

		let ws = self::workset(0x10, 1, false, &[(0x1000, 0x1111, 0), (0x1010, 0, 0x8000)]);
		assert_eq!(ws.size(), 5);
		assert_eq!(ws.wsize(), 1);
		assert_eq!(ws.size_words(), 5);
	}

	#[test]
	fn read_write_conflict() {
		let ws1 = self::workset(0x10, 1, false, &[(0x1000, 0b01, 0b00)]);
		let ws2 = self::workset(0x10, 2, false, &[(0x1000, 0b00, 0b01)]);

		let mut intersection = vec![];
		assert_eq!(ws1.compare(&ws2, Some(&mut intersection), false), 1);
		assert_eq!(intersection, [Conflict::Addr(0x1000)]);
	}

	#[test]
	fn reads_dont_conflict() {
		let ws1 = self::workset(0x10, 1, false, &[(0x1000, 0xffff, 0)]);
		let ws2 = self::workset(0x10, 2, false, &[(0x1000, 0xffff, 0)]);
		assert_eq!(ws1.compare(&ws2, None, false), 0);
	}

	#[test]
	fn conflicts_are_counted_per_word() {
		// Bytes 0..4 share a word, as do bytes 4..8
		let ws1 = self::workset(0x10, 1, false, &[(0x1000, 0, 0b1111_0111), (0x3000, 0, 0xffff)]);
		let ws2 = self::workset(0x10, 2, false, &[(0x1000, 0b1111_1111, 0), (0x2000, 0, 0xffff)]);

		let mut intersection = vec![];
		let count = ws1.compare(&ws2, Some(&mut intersection), false);
		assert_eq!(count, 2);
		assert_eq!(intersection, [Conflict::Addr(0x1000), Conflict::Addr(0x1004)]);

		let mut other_intersection = vec![Conflict::Io];
		assert_eq!(ws2.compare(&ws1, Some(&mut other_intersection), false), count);
		assert_eq!(other_intersection.len(), count);
	}

	#[test]
	fn io_conflict() {
		let ws1 = self::workset(0x10, 1, true, &[(0x1000, 0b1, 0)]);
		let ws2 = self::workset(0x10, 2, false, &[(0x1000, 0, 0b1)]);

		let mut intersection = vec![];
		assert_eq!(ws1.compare(&ws2, Some(&mut intersection), true), 2);
		assert_eq!(intersection, [Conflict::Io, Conflict::Addr(0x1000)]);
		assert_eq!(ws1.compare(&ws2, None, false), 1);
	}

	#[test]
	fn self_compare() {
		let ws = self::workset(0x10, 1, false, &[(0x1000, 0, 0x1111), (0x2000, 0, 0x0001)]);
		assert_eq!(ws.compare(&ws, None, false), ws.size());
	}

	#[test]
	fn conflict_display() {
		assert_eq!(Conflict::Io.to_string(), "io");
		assert_eq!(Conflict::Addr(0xc010).to_string(), "0xc010");
	}
}
