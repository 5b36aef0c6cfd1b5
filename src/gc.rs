//! Size-bounded garbage collection: rebase and orphan cleanup (spec §4.4).

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::backend::{commit_key, data_key, default_is_protected, families, ref_key, Backend};
use crate::branch::{list_branches, read_ref, Handle};
use crate::commit::{self, CommitId};
use crate::error::{EngineError, Result};
use crate::meta;

/// GC configuration (spec §4.4), loadable from TOML via `config::EngineConfig`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GcConfig {
    /// `None` disables size-triggered rebase entirely.
    pub high_water_bytes: Option<u64>,
    /// Defaults to 80% of `high_water_bytes` when unset.
    pub low_water_bytes: Option<u64>,
    /// Key prefixes that must never be dropped by a rebase. Checked both
    /// against the whole key and its last `/`-separated segment, so a
    /// namespaced key like `ns/__config` is protected too.
    pub protected_prefixes: Vec<String>,
    /// Staleness window for `clean_orphans` (spec §4.4, §9).
    pub min_age_seconds: f64,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            high_water_bytes: None,
            low_water_bytes: None,
            protected_prefixes: vec!["__".to_string()],
            min_age_seconds: 3600.0,
        }
    }
}

impl GcConfig {
    pub fn with_high_water(high_water_bytes: u64) -> Self {
        Self {
            high_water_bytes: Some(high_water_bytes),
            ..Self::default()
        }
    }

    pub fn low_water(&self) -> u64 {
        match self.low_water_bytes {
            Some(v) => v,
            None => (self.high_water_bytes.unwrap_or(0) as f64 * 0.8) as u64,
        }
    }

    pub fn is_protected(&self, key: &str) -> bool {
        if self.protected_prefixes.len() == 1 && self.protected_prefixes[0] == "__" {
            return default_is_protected(key);
        }
        let last = key.rsplit('/').next().unwrap_or(key);
        self.protected_prefixes
            .iter()
            .any(|p| key.starts_with(p.as_str()) || last.starts_with(p.as_str()))
    }
}

pub enum KeepSet {
    /// Coldest-then-largest-first eviction until the total is under the
    /// low-water mark.
    Water,
    /// Caller-supplied keep set, unioned with protected keys.
    Explicit(HashSet<String>),
}

#[derive(Debug, Clone, Default)]
pub struct RebaseResult {
    pub performed: bool,
    pub new_commit: Option<CommitId>,
    pub dropped_keys: Vec<String>,
    pub kept_keys: Vec<String>,
    pub total_size_before: u64,
    pub total_size_after: u64,
    pub orphans_cleaned: usize,
}

fn total_size(backend: &Arc<dyn Backend>, entries: &BTreeMap<String, String>) -> Result<u64> {
    let mut total = 0u64;
    for key in entries.keys() {
        if let Some(m) = meta::get(backend, key)? {
            total += m.size;
        }
    }
    Ok(total)
}

/// Called after every successful `advance` (spec §4.4 "Size tracking").
pub(crate) fn maybe_rebase(handle: &mut Handle) -> Result<()> {
    let Some(high_water) = handle.gc_config.high_water_bytes else {
        return Ok(());
    };
    let commit = commit::get(&handle.backend, &handle.current_commit)?;
    let total = total_size(&handle.backend, &commit.entries)?;
    if total <= high_water {
        return Ok(());
    }
    match rebase(handle, KeepSet::Water) {
        Ok(result) => {
            info!(
                branch = %handle.branch_name,
                dropped = result.dropped_keys.len(),
                before = result.total_size_before,
                after = result.total_size_after,
                "gc::rebase"
            );
            Ok(())
        }
        Err(EngineError::Concurrency) => {
            warn!(branch = %handle.branch_name, "gc::rebase lost CAS race, leaving for the next trigger");
            Ok(())
        }
        Err(err) => Err(err),
    }
}

/// Size-bounded rebase (spec §4.4): rewrites the branch as a fresh root
/// commit retaining only a selected key set, then cleans up the
/// now-unreachable history.
pub fn rebase(handle: &mut Handle, keep_set: KeepSet) -> Result<RebaseResult> {
    let backend = handle.backend.clone();
    let head = read_ref(&backend, &handle.branch_name)?
        .ok_or_else(|| EngineError::NotFound(format!("branch {}", handle.branch_name)))?;
    let commit = commit::get(&backend, &head)?;

    let total_before = total_size(&backend, &commit.entries)?;

    let keep_keys: HashSet<String> = match keep_set {
        KeepSet::Explicit(keys) => keys
            .into_iter()
            .chain(commit.entries.keys().filter(|k| handle.gc_config.is_protected(k)).cloned())
            .collect(),
        KeepSet::Water => {
            let mut ordered: Vec<(String, u64, u64)> = Vec::new(); // (key, touch, size)
            for key in commit.entries.keys() {
                let m = meta::get(&backend, key)?.unwrap_or(crate::meta::KeyMeta {
                    last_touch: 0,
                    size: 0,
                    created_at: 0.0,
                });
                ordered.push((key.clone(), m.last_touch, m.size));
            }
            // Coldest (lowest touch) first; ties broken by size descending.
            ordered.sort_by(|a, b| a.1.cmp(&b.1).then(b.2.cmp(&a.2)));

            let mut remaining = total_before;
            let mut keep: HashSet<String> = commit.entries.keys().cloned().collect();
            let low_water = handle.gc_config.low_water();
            for (key, _touch, size) in &ordered {
                if remaining <= low_water {
                    break;
                }
                if handle.gc_config.is_protected(key) {
                    continue;
                }
                keep.remove(key);
                remaining = remaining.saturating_sub(*size);
            }
            keep
        }
    };

    let dropped_keys: Vec<String> = commit
        .entries
        .keys()
        .filter(|k| !keep_keys.contains(k.as_str()))
        .cloned()
        .collect();
    let kept_keys: Vec<String> = commit
        .entries
        .keys()
        .filter(|k| keep_keys.contains(k.as_str()))
        .cloned()
        .collect();

    let new_entries: BTreeMap<String, String> = commit
        .entries
        .iter()
        .filter(|(k, _)| keep_keys.contains(k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    let total_after = total_size(&backend, &new_entries)?;

    let mut info = BTreeMap::new();
    info.insert("reason".to_string(), "high_water_exceeded".to_string());
    info.insert("dropped_count".to_string(), dropped_keys.len().to_string());
    info.insert("total_size_before".to_string(), total_before.to_string());
    info.insert("total_size_after".to_string(), total_after.to_string());

    let root = commit::build(vec![], new_entries, Some(info))?;
    commit::persist(&backend, &root)?;

    let ok = backend.cas(
        &ref_key(&handle.branch_name),
        Some(root.id.as_bytes()),
        Some(head.as_bytes()),
    )?;
    if !ok {
        return Err(EngineError::Concurrency);
    }

    handle.current_commit = root.id.clone();
    handle.base_commit = root.id.clone();

    let orphans_cleaned = clean_orphans(&backend, 0.0)?;

    Ok(RebaseResult {
        performed: true,
        new_commit: Some(root.id),
        dropped_keys,
        kept_keys,
        total_size_before: total_before,
        total_size_after: total_after,
        orphans_cleaned,
    })
}

/// Deletes unreachable commits older than `min_age_seconds` (spec §4.4),
/// along with the blobs they alone referenced. Reachability is computed
/// from every live branch ref's full DAG.
pub fn clean_orphans(backend: &Arc<dyn Backend>, min_age_seconds: f64) -> Result<usize> {
    let branches = list_branches(backend)?;
    let mut heads = Vec::new();
    for branch in &branches {
        if let Some(head) = read_ref(backend, branch)? {
            heads.push(head);
        }
    }
    let reachable = commit::reachable_from_many(backend, &heads)?;
    let now = commit::now();

    // First pass: classify every stored commit as removable (unreachable
    // and old enough) or retained, and collect every pointer a retained
    // commit references. A blob is only safe to delete once no commit that
    // survives this pass still points at it.
    let mut to_remove: Vec<(String, commit::Commit)> = Vec::new();
    let mut retained_pointers: HashSet<String> = HashSet::new();
    for key in backend.keys(families::COMMITS)? {
        let id = key[families::COMMITS.len()..].to_string();
        let bytes = match backend.get(&key)? {
            Some(bytes) => bytes,
            None => continue,
        };
        let stored: commit::Commit = bincode::deserialize(&bytes)?;
        if !reachable.contains(&id) && now - stored.created_at >= min_age_seconds {
            to_remove.push((id, stored));
        } else {
            retained_pointers.extend(stored.entries.values().cloned());
        }
    }

    let mut removed = 0usize;
    for (id, victim) in &to_remove {
        for pointer in victim.entries.values() {
            if !retained_pointers.contains(pointer) {
                backend.remove(&data_key(pointer))?;
            }
        }
        backend.remove(&commit_key(id))?;
        removed += 1;
    }
    Ok(removed)
}
