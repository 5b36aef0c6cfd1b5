//! The backend contract (spec §6) and the key-family schema layered over it
//! (spec §4.1). The backend itself is an external collaborator to the core
//! engine — an unordered byte-map whose only synchronization primitive is
//! `cas` — but a crate needs at least one concrete implementation to be
//! usable, so this module ships two: an in-process `MemoryBackend` and a
//! `sled`-backed `SledBackend`.

pub mod memory;
pub mod sled_backend;

use std::collections::BTreeMap;
use thiserror::Error;

pub use memory::MemoryBackend;
pub use sled_backend::SledBackend;

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("{0}")]
    Storage(String),
}

pub type BackendResult<T> = Result<T, BackendError>;

/// The flat, byte-level key-value contract the engine is built on (spec §6).
///
/// All keys are ASCII strings; `/` is the reserved separator used by the
/// key-family schema below. Backends must treat values as opaque bytes and
/// need only guarantee that `cas` is linearizable with respect to other
/// `cas` calls on the same key (spec §5).
pub trait Backend: Send + Sync {
    fn get(&self, key: &str) -> BackendResult<Option<Vec<u8>>>;
    fn set(&self, key: &str, value: &[u8]) -> BackendResult<()>;
    fn remove(&self, key: &str) -> BackendResult<()>;

    fn get_many(&self, keys: &[String]) -> BackendResult<BTreeMap<String, Vec<u8>>> {
        let mut out = BTreeMap::new();
        for key in keys {
            if let Some(value) = self.get(key)? {
                out.insert(key.clone(), value);
            }
        }
        Ok(out)
    }

    fn set_many(&self, entries: &BTreeMap<String, Vec<u8>>) -> BackendResult<()> {
        for (key, value) in entries {
            self.set(key, value)?;
        }
        Ok(())
    }

    fn remove_many(&self, keys: &[String]) -> BackendResult<()> {
        for key in keys {
            self.remove(key)?;
        }
        Ok(())
    }

    fn keys(&self, prefix: &str) -> BackendResult<Vec<String>>;
    fn items(&self, prefix: &str) -> BackendResult<Vec<(String, Vec<u8>)>>;

    fn contains(&self, key: &str) -> BackendResult<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Atomically sets `key` to `new` if its current value equals `expected`.
    /// `expected = None` means "create if not present". Returns whether the
    /// swap happened.
    fn cas(&self, key: &str, new: Option<&[u8]>, expected: Option<&[u8]>) -> BackendResult<bool>;

    fn clear(&self) -> BackendResult<()>;
}

/// Reserved key-family prefixes (spec §4.1 / §6).
pub mod families {
    pub const COMMITS: &str = "commits/";
    pub const REFS: &str = "refs/";
    pub const DATA: &str = "data/";
    pub const META: &str = "meta/";
}

pub fn commit_key(id: &str) -> String {
    format!("{}{}", families::COMMITS, id)
}

pub fn ref_key(branch: &str) -> String {
    format!("{}{}", families::REFS, branch)
}

pub fn data_key(pointer: &str) -> String {
    format!("{}{}", families::DATA, pointer)
}

pub fn meta_key(user_key: &str) -> String {
    format!("{}{}", families::META, user_key)
}

/// Validates a branch name: non-empty, no `/` (spec §6).
pub fn validate_branch_name(name: &str) -> Result<(), crate::error::EngineError> {
    if name.is_empty() {
        return Err(crate::error::EngineError::InvalidArgument(
            "branch name must not be empty".into(),
        ));
    }
    if name.contains('/') {
        return Err(crate::error::EngineError::InvalidArgument(format!(
            "branch name {name:?} must not contain '/'"
        )));
    }
    Ok(())
}

/// Validates a user key: must not begin with any reserved family prefix
/// (spec §6). User keys may otherwise contain `/` (used by namespace
/// prefixing at a higher layer).
pub fn validate_user_key(key: &str) -> Result<(), crate::error::EngineError> {
    if key.is_empty() {
        return Err(crate::error::EngineError::InvalidArgument(
            "key must not be empty".into(),
        ));
    }
    for reserved in [
        families::COMMITS,
        families::REFS,
        families::DATA,
        families::META,
    ] {
        if key.starts_with(reserved) {
            return Err(crate::error::EngineError::InvalidArgument(format!(
                "key {key:?} must not begin with reserved prefix {reserved:?}"
            )));
        }
    }
    Ok(())
}

/// Default protected-key predicate: keys beginning with `__`, including
/// within a namespace prefix (spec §3 "Protected keys").
pub fn default_is_protected(key: &str) -> bool {
    key.starts_with("__") || key.rsplit('/').next().is_some_and(|last| last.starts_with("__"))
}
