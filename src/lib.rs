//! A versioned, content-addressable key-value engine with git-like commit
//! history, branch refs, and three-way merge (spec §1-§9). Storage is
//! abstracted behind [`backend::Backend`]; this crate ships an in-process
//! [`backend::MemoryBackend`] and a [`backend::SledBackend`] on top of it.

pub mod backend;
pub mod branch;
pub mod commit;
pub mod config;
pub mod digest;
pub mod error;
pub mod gc;
pub mod merge;
pub mod meta;

pub use branch::{bootstrap_main, Handle};
pub use commit::{Commit, CommitId, Diff};
pub use config::EngineConfig;
pub use error::{EngineError, Result};
pub use gc::{rebase, GcConfig, KeepSet, RebaseResult};
pub use merge::{advance, MergeOutcome, MergeStrategy, OnConflict, Resolved, Resolver};

use std::sync::Arc;

use backend::Backend;

/// Opens (or bootstraps) `branch` on `backend` and returns a `Handle`
/// positioned at its current head. Convenience entry point mirroring the
/// teacher's `Repo::open` constructor.
pub fn open(backend: Arc<dyn Backend>, gc_config: GcConfig, branch: &str) -> Result<Handle> {
    let head = match branch::read_ref(&backend, branch)? {
        Some(head) => head,
        None => bootstrap_main(&backend, branch)?,
    };
    Ok(Handle::new(backend, Arc::new(gc_config), branch.to_string(), head))
}
