//! Synchronization characterization (`synchar`)
//!
//! Finds lock instructions in kernel disassembly, and analyzes the worksets of
//! critical sections logged by an instrumented run to estimate how much lock
//! contention is caused by true data dependences.

// Modules
pub mod analyzer;
pub mod catalog;
pub mod config;
pub mod data;
pub mod driver;
pub mod error;
pub mod fsm;
pub mod scanner;
pub mod sync_log;
pub mod workset;

// Exports
pub use self::{
	analyzer::ContentionAnalyzer,
	catalog::Catalog,
	config::Config,
	driver::{Driver, LogConsumer},
	error::Error,
	fsm::StateMatcher,
	scanner::DisassemblyScanner,
	sync_log::SyncLogReader,
	workset::WorkSet,
};
