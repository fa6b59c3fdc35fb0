//! Versioned agent instructions.
//!
//! Append-only history of system-instruction revisions per agent, with
//! at most one revision active at a time. Versions display as
//! `"<major>.<minor>"` and are stored zero-padded so the version index
//! sorts numerically.

pub mod store;
pub mod types;
pub mod version;

pub use store::{InstructionStore, StoreError};
pub use types::{AgentInstruction, ListOptions, NewInstruction, SortOrder};
