//! Branch refs and the `Handle` cursor (spec §4.3, §4.3.2).

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use crate::backend::{ref_key, validate_branch_name, Backend};
use crate::commit::{self, CommitId};
use crate::error::{EngineError, Result};
use crate::gc::GcConfig;
use crate::merge::Resolver;

/// Reads a branch ref's current commit id, if the branch exists.
pub fn read_ref(backend: &Arc<dyn Backend>, branch: &str) -> Result<Option<CommitId>> {
    match backend.get(&ref_key(branch))? {
        Some(bytes) => Ok(Some(String::from_utf8(bytes).map_err(|e| {
            EngineError::Storage(format!("non-utf8 ref value: {e}"))
        })?)),
        None => Ok(None),
    }
}

fn write_ref_bytes(commit_id: &str) -> Vec<u8> {
    commit_id.as_bytes().to_vec()
}

pub fn list_branches(backend: &Arc<dyn Backend>) -> Result<Vec<String>> {
    let mut names: Vec<String> = backend
        .keys(crate::backend::families::REFS)?
        .into_iter()
        .map(|k| k[crate::backend::families::REFS.len()..].to_string())
        .collect();
    names.sort();
    Ok(names)
}

/// The root of a store: the first branch (`"main"`), pointing at an empty
/// sentinel root commit. Mirrors the teacher's `Repo::new` bootstrapping a
/// "main" branch with an initial commit.
pub fn bootstrap_main(backend: &Arc<dyn Backend>, branch: &str) -> Result<CommitId> {
    let root = commit::build(vec![], BTreeMap::new(), None)?;
    commit::persist(backend, &root)?;
    let ok = backend.cas(&ref_key(branch), Some(&write_ref_bytes(&root.id)), None)?;
    if !ok {
        // Another caller bootstrapped first; use whatever is there now.
        return read_ref(backend, branch)?.ok_or_else(|| {
            EngineError::Storage(format!("branch {branch} vanished during bootstrap"))
        });
    }
    Ok(root.id)
}

/// An in-memory cursor onto a specific branch and commit (spec §4.3).
pub struct Handle {
    pub(crate) backend: Arc<dyn Backend>,
    pub(crate) gc_config: Arc<GcConfig>,
    pub(crate) branch_name: String,
    pub(crate) base_commit: CommitId,
    pub(crate) current_commit: CommitId,
    pub(crate) resolvers: BTreeMap<String, Resolver>,
    pub(crate) default_resolver: Option<Resolver>,
}

impl Handle {
    pub(crate) fn new(
        backend: Arc<dyn Backend>,
        gc_config: Arc<GcConfig>,
        branch_name: String,
        commit_id: CommitId,
    ) -> Self {
        Self {
            backend,
            gc_config,
            branch_name,
            base_commit: commit_id.clone(),
            current_commit: commit_id,
            resolvers: BTreeMap::new(),
            default_resolver: None,
        }
    }

    pub fn branch_name(&self) -> &str {
        &self.branch_name
    }

    pub fn current_commit(&self) -> &str {
        &self.current_commit
    }

    pub fn base_commit(&self) -> &str {
        &self.base_commit
    }

    /// The backend this handle is reading and writing through. Cloning it
    /// (an `Arc`) is the supported way to open a second, independent handle
    /// onto the same store — e.g. two concurrent writers on one branch.
    pub fn backend(&self) -> Arc<dyn Backend> {
        self.backend.clone()
    }

    pub fn gc_config(&self) -> Arc<GcConfig> {
        self.gc_config.clone()
    }

    /// Reloads `base_commit`/`current_commit` from the live ref.
    pub fn refresh(&mut self) -> Result<()> {
        let head = read_ref(&self.backend, &self.branch_name)?
            .ok_or_else(|| EngineError::NotFound(format!("branch {}", self.branch_name)))?;
        self.base_commit = head.clone();
        self.current_commit = head;
        Ok(())
    }

    pub fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        commit::read(&self.backend, &self.current_commit, key)
    }

    pub fn read_many(&self, keys: &[String]) -> Result<BTreeMap<String, Vec<u8>>> {
        commit::read_many(&self.backend, &self.current_commit, keys)
    }

    pub fn keys(&self) -> Result<Vec<String>> {
        commit::keys_of(&self.backend, &self.current_commit)
    }

    /// Reads `key` at `branch`'s current ref, without changing this handle.
    pub fn peek(&self, key: &str, branch: &str) -> Result<Option<Vec<u8>>> {
        let head = read_ref(&self.backend, branch)?
            .ok_or_else(|| EngineError::NotFound(format!("branch {branch}")))?;
        commit::read(&self.backend, &head, key)
    }

    pub fn list_branches(&self) -> Result<Vec<String>> {
        list_branches(&self.backend)
    }

    /// Creates `refs/<name>` via CAS against absent, at `at` (default: this
    /// handle's current commit). `AlreadyExists` on CAS failure.
    pub fn create_branch(&self, name: &str, at: Option<&str>) -> Result<Handle> {
        validate_branch_name(name)?;
        let target = at.unwrap_or(&self.current_commit).to_string();
        // Ensure the target commit actually exists before publishing a ref to it.
        commit::get(&self.backend, &target)?;
        let ok = self
            .backend
            .cas(&ref_key(name), Some(&write_ref_bytes(&target)), None)?;
        if !ok {
            return Err(EngineError::AlreadyExists(format!("branch {name}")));
        }
        debug!(branch = name, commit = %target, "branch::create");
        Ok(Handle::new(
            self.backend.clone(),
            self.gc_config.clone(),
            name.to_string(),
            target,
        ))
    }

    /// Atomically rebinds this handle to `refs/<name>`. Any buffered work a
    /// higher-level front-end was holding is the caller's to discard.
    pub fn switch_branch(&mut self, name: &str) -> Result<()> {
        let head = read_ref(&self.backend, name)?
            .ok_or_else(|| EngineError::NotFound(format!("branch {name}")))?;
        self.branch_name = name.to_string();
        self.base_commit = head.clone();
        self.current_commit = head;
        Ok(())
    }

    /// Removes the ref. Commits become unreachable and eligible for orphan
    /// cleanup.
    pub fn delete_branch(&self, name: &str) -> Result<()> {
        self.backend.remove(&ref_key(name))?;
        Ok(())
    }

    /// Returns a new handle positioned at `commit_id` on `branch` (defaults
    /// to this handle's branch); `None` if the commit is missing.
    pub fn checkout(&self, commit_id: &str, branch: Option<&str>) -> Result<Option<Handle>> {
        if commit::get(&self.backend, commit_id).is_err() {
            return Ok(None);
        }
        let branch_name = branch.unwrap_or(&self.branch_name).to_string();
        Ok(Some(Handle::new(
            self.backend.clone(),
            self.gc_config.clone(),
            branch_name,
            commit_id.to_string(),
        )))
    }

    /// Forces `refs/<branch>` to `commit_id`, retrying CAS against whatever
    /// the current value is. Returns `false` if the commit is missing.
    pub fn reset_to(&mut self, commit_id: &str) -> Result<bool> {
        if commit::get(&self.backend, commit_id).is_err() {
            return Ok(false);
        }
        loop {
            let current = read_ref(&self.backend, &self.branch_name)?;
            let expected = current.as_deref().map(|s| s.as_bytes());
            if self
                .backend
                .cas(&ref_key(&self.branch_name), Some(commit_id.as_bytes()), expected)?
            {
                self.base_commit = commit_id.to_string();
                self.current_commit = commit_id.to_string();
                return Ok(true);
            }
            // Lost the race against a concurrent ref mutation; retry with
            // a freshly observed expected value.
        }
    }

    /// Registers a per-key merge resolver (spec §4.3.3).
    pub fn register_resolver(&mut self, key: impl Into<String>, resolver: Resolver) {
        self.resolvers.insert(key.into(), resolver);
    }

    pub fn set_default_resolver(&mut self, resolver: Resolver) {
        self.default_resolver = Some(resolver);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::gc::GcConfig;

    fn handle() -> Handle {
        let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
        let root = bootstrap_main(&backend, "main").unwrap();
        Handle::new(backend, Arc::new(GcConfig::default()), "main".to_string(), root)
    }

    #[test]
    fn create_and_switch() {
        let h = handle();
        let dev = h.create_branch("dev", None).unwrap();
        assert_eq!(dev.branch_name(), "dev");
        assert_eq!(dev.current_commit(), h.current_commit());

        let mut h = h;
        h.switch_branch("dev").unwrap();
        assert_eq!(h.branch_name(), "dev");
    }

    #[test]
    fn create_branch_twice_fails() {
        let h = handle();
        h.create_branch("dev", None).unwrap();
        let err = h.create_branch("dev", None).unwrap_err();
        assert!(matches!(err, EngineError::AlreadyExists(_)));
    }

    #[test]
    fn branch_name_rejects_slash() {
        let h = handle();
        let err = h.create_branch("a/b", None).unwrap_err();
        assert!(matches!(err, EngineError::InvalidArgument(_)));
    }
}
