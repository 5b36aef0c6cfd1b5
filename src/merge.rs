//! Three-way merge and the primary write operation, `advance` (spec §4.3.1,
//! §4.3.3).

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::backend::{data_key, ref_key};
use crate::branch::{read_ref, Handle};
use crate::commit::{self, Commit, CommitId, Diff, Pointer};
use crate::error::{EngineError, Result};
use crate::gc;

/// A user-supplied per-key conflict resolver (spec §4.3.3). Receives
/// `(old, ours, theirs)`, each `None` when the key is absent on that side,
/// and returns the merged outcome or an error describing why it couldn't
/// resolve the key.
pub type Resolver =
    Arc<dyn Fn(Option<&[u8]>, Option<&[u8]>, Option<&[u8]>) -> std::result::Result<Resolved, String> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolved {
    Value(Vec<u8>),
    Removed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnConflict {
    Raise,
    Abandon,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeStrategy {
    NoOp,
    FastForward,
    ThreeWay,
}

#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub strategy: MergeStrategy,
    pub commit: CommitId,
    pub auto_merged_keys: Vec<String>,
    pub carried_keys: Vec<String>,
}

/// `true` when `updates`/`removals`/`info` together describe no change.
fn is_empty_write(
    updates: &BTreeMap<String, Vec<u8>>,
    removals: &[String],
    info: &Option<BTreeMap<String, String>>,
) -> bool {
    updates.is_empty() && removals.is_empty() && info.as_ref().is_none_or(|m| m.is_empty())
}

/// The primary write operation (spec §4.3.1). Returns `Ok(None)` only when
/// `on_conflict = Abandon` and the attempt could not complete (conflict or
/// lost ref CAS); otherwise a successful no-op/fast-forward/three-way
/// result, or an `Err` under `on_conflict = Raise`.
pub fn advance(
    handle: &mut Handle,
    updates: BTreeMap<String, Vec<u8>>,
    removals: Vec<String>,
    info: Option<BTreeMap<String, String>>,
    on_conflict: OnConflict,
    merge_fns: Option<&BTreeMap<String, Resolver>>,
) -> Result<Option<MergeOutcome>> {
    let backend = handle.backend.clone();
    let head = read_ref(&backend, &handle.branch_name)?
        .ok_or_else(|| EngineError::NotFound(format!("branch {}", handle.branch_name)))?;

    if is_empty_write(&updates, &removals, &info) && handle.current_commit == head {
        return Ok(Some(MergeOutcome {
            strategy: MergeStrategy::NoOp,
            commit: head,
            auto_merged_keys: vec![],
            carried_keys: vec![],
        }));
    }

    if handle.current_commit == head {
        let ours = commit::write_full(&backend, &handle.current_commit, &updates, &removals, info.clone())?;
        let ok = backend.cas(
            &ref_key(&handle.branch_name),
            Some(ours.id.as_bytes()),
            Some(head.as_bytes()),
        )?;
        if ok {
            handle.current_commit = ours.id.clone();
            handle.base_commit = ours.id.clone();
            maybe_rebase(handle)?;
            debug!(branch = %handle.branch_name, commit = %handle.current_commit, "merge::fast_forward");
            return Ok(Some(MergeOutcome {
                strategy: MergeStrategy::FastForward,
                commit: handle.current_commit.clone(),
                auto_merged_keys: vec![],
                carried_keys: vec![],
            }));
        }
        warn!(branch = %handle.branch_name, "merge::fast_forward lost CAS race, retrying as three-way");
        let new_head = read_ref(&backend, &handle.branch_name)?
            .ok_or_else(|| EngineError::NotFound(format!("branch {}", handle.branch_name)))?;
        return three_way(handle, ours, new_head, on_conflict, merge_fns);
    }

    let ours = commit::write_full(&backend, &handle.current_commit, &updates, &removals, info)?;
    three_way(handle, ours, head, on_conflict, merge_fns)
}

fn changed(diff: &Diff) -> BTreeMap<String, Option<Pointer>> {
    let mut out = BTreeMap::new();
    for (key, pointer) in diff.added.iter().chain(diff.modified.iter()) {
        out.insert(key.clone(), Some(pointer.clone()));
    }
    for key in &diff.removed {
        out.insert(key.clone(), None);
    }
    out
}

fn three_way(
    handle: &mut Handle,
    ours: Commit,
    head: CommitId,
    on_conflict: OnConflict,
    merge_fns: Option<&BTreeMap<String, Resolver>>,
) -> Result<Option<MergeOutcome>> {
    let backend = handle.backend.clone();
    let theirs = commit::get(&backend, &head)?;

    let base_id = commit::lca(&backend, &ours.id, &head)?
        .ok_or_else(|| EngineError::Storage(format!("no common ancestor between {} and {head}", ours.id)))?;
    let base = commit::get(&backend, &base_id)?;

    let delta_us = changed(&commit::diff(&backend, &base_id, &ours.id)?);
    let delta_them = changed(&commit::diff(&backend, &base_id, &head)?);

    let side_value = |delta: &BTreeMap<String, Option<Pointer>>, side: &Commit, key: &str| -> Option<Pointer> {
        delta
            .get(key)
            .cloned()
            .unwrap_or_else(|| side.entries.get(key).cloned())
    };

    let keys: BTreeSet<String> = delta_us.keys().chain(delta_them.keys()).cloned().collect();

    let mut merged_entries = base.entries.clone();
    let mut carried_keys = Vec::new();
    let mut auto_merged_keys = Vec::new();
    let mut conflicting_keys = Vec::new();
    let mut merge_errors = std::collections::HashMap::new();

    for key in &keys {
        let in_us = delta_us.contains_key(key);
        let in_them = delta_them.contains_key(key);
        let us_value = side_value(&delta_us, &ours, key);
        let them_value = side_value(&delta_them, &theirs, key);

        if in_us && !in_them {
            apply(&mut merged_entries, key, us_value);
            carried_keys.push(key.clone());
            continue;
        }
        if in_them && !in_us {
            apply(&mut merged_entries, key, them_value);
            carried_keys.push(key.clone());
            continue;
        }

        // Present on both sides.
        if us_value == them_value {
            apply(&mut merged_entries, key, us_value);
            carried_keys.push(key.clone());
            continue;
        }

        let resolver = merge_fns
            .and_then(|m| m.get(key))
            .or_else(|| handle.resolvers.get(key))
            .or(handle.default_resolver.as_ref());

        match resolver {
            None => conflicting_keys.push(key.clone()),
            Some(resolver) => {
                let old_bytes = commit::fetch_bytes(&backend, &base, key)?;
                let ours_bytes = commit::fetch_bytes(&backend, &ours, key)?;
                let theirs_bytes = commit::fetch_bytes(&backend, &theirs, key)?;
                match resolver(old_bytes.as_deref(), ours_bytes.as_deref(), theirs_bytes.as_deref()) {
                    Ok(Resolved::Removed) => {
                        merged_entries.remove(key);
                        auto_merged_keys.push(key.clone());
                    }
                    Ok(Resolved::Value(bytes)) => {
                        let pointer = format!("s:{}/{key}/{}", ours.id, crate::digest::hex_digest(&bytes));
                        backend.set(&data_key(&pointer), &bytes)?;
                        merged_entries.insert(key.clone(), pointer);
                        auto_merged_keys.push(key.clone());
                    }
                    Err(message) => {
                        conflicting_keys.push(key.clone());
                        merge_errors.insert(key.clone(), message);
                    }
                }
            }
        }
    }

    if !conflicting_keys.is_empty() {
        return match on_conflict {
            OnConflict::Raise => Err(EngineError::MergeConflict {
                conflicting_keys,
                merge_errors,
            }),
            OnConflict::Abandon => Ok(None),
        };
    }

    let merge_commit = commit::build_merge(vec![ours.id.clone(), head.clone()], merged_entries, None)?;
    commit::persist(&backend, &merge_commit)?;

    let ok = backend.cas(
        &ref_key(&handle.branch_name),
        Some(merge_commit.id.as_bytes()),
        Some(head.as_bytes()),
    )?;

    if !ok {
        return match on_conflict {
            OnConflict::Raise => Err(EngineError::Concurrency),
            OnConflict::Abandon => Ok(None),
        };
    }

    handle.current_commit = merge_commit.id.clone();
    handle.base_commit = merge_commit.id.clone();
    maybe_rebase(handle)?;
    debug!(branch = %handle.branch_name, commit = %handle.current_commit, "merge::three_way");

    Ok(Some(MergeOutcome {
        strategy: MergeStrategy::ThreeWay,
        commit: handle.current_commit.clone(),
        auto_merged_keys,
        carried_keys,
    }))
}

fn apply(entries: &mut BTreeMap<String, Pointer>, key: &str, value: Option<Pointer>) {
    match value {
        Some(pointer) => {
            entries.insert(key.to_string(), pointer);
        }
        None => {
            entries.remove(key);
        }
    }
}

/// After a successful `advance`, checks the high-water mark and triggers a
/// rebase if needed (spec §4.4).
fn maybe_rebase(handle: &mut Handle) -> Result<()> {
    gc::maybe_rebase(handle)
}
