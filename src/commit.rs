//! Content-addressed commit objects and the commit engine (spec §4.2).

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::backend::{commit_key, data_key, validate_user_key, Backend};
use crate::digest::hex_digest;
use crate::error::{EngineError, Result};
use crate::meta;

pub type CommitId = String;

/// A pointer to a value blob. Either content-addressed (dedups identical
/// bytes across commits) or commit-scoped (simpler, no dedup). Both are
/// permitted by spec §4.1; `write` defaults to commit-scoped, `write_dedup`
/// opts into content addressing (SPEC_FULL.md Open Question #1).
pub type Pointer = String;

fn content_pointer(bytes: &[u8]) -> Pointer {
    format!("c:{}", hex_digest(bytes))
}

/// Commit-scoped pointer for a single write. Folding a digest of the value
/// into the pointer (rather than keying purely on `(parent_id, key)`) is
/// what makes two sibling commits that write different bytes to the same
/// key under the same parent resolve to *different* pointers, so `diff`'s
/// pointer-equality check (spec §4.2) can actually tell them apart instead
/// of treating a genuine conflict as concordant.
fn commit_scoped_pointer(parent_id: &str, key: &str, bytes: &[u8]) -> Pointer {
    format!("s:{parent_id}/{key}/{}", hex_digest(bytes))
}

/// An immutable, content-addressed snapshot of the key→pointer map plus
/// parents and metadata (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Commit {
    pub id: CommitId,
    pub parents: Vec<CommitId>,
    pub entries: BTreeMap<String, Pointer>,
    pub info: Option<BTreeMap<String, String>>,
    pub created_at: f64,
}

/// The subset of a commit's fields that determine its id (spec §4.1:
/// "fields in fixed order"). `entries`/`info` are `BTreeMap`s, which
/// `bincode` serializes in already-sorted key order, giving deterministic
/// canonical bytes for free (SPEC_FULL.md Open Question #2).
#[derive(Serialize)]
struct CanonicalCommit<'a> {
    parents: &'a [CommitId],
    entries: &'a BTreeMap<String, Pointer>,
    info: &'a Option<BTreeMap<String, String>>,
    created_at: f64,
}

fn compute_id(
    parents: &[CommitId],
    entries: &BTreeMap<String, Pointer>,
    info: &Option<BTreeMap<String, String>>,
    created_at: f64,
) -> Result<CommitId> {
    let canonical = CanonicalCommit {
        parents,
        entries,
        info,
        created_at,
    };
    let bytes = bincode::serialize(&canonical)?;
    Ok(hex_digest(&bytes))
}

pub(crate) fn now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Diff between two commits' keysets, by pointer equality (spec §4.2).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Diff {
    pub added: BTreeMap<String, Pointer>,
    pub removed: Vec<String>,
    pub modified: BTreeMap<String, Pointer>,
}

/// Persists a commit under its content id. If the id already exists, the
/// existing commit is reused (spec §4.2: "Commit id collisions are treated
/// as exact-match reuse, not conflict").
pub fn persist(backend: &Arc<dyn Backend>, commit: &Commit) -> Result<()> {
    let key = commit_key(&commit.id);
    if backend.contains(&key)? {
        return Ok(());
    }
    backend.set(&key, &bincode::serialize(commit)?)?;
    Ok(())
}

/// Builds, persists, and returns a new commit without touching any ref.
pub fn build(
    parents: Vec<CommitId>,
    entries: BTreeMap<String, Pointer>,
    info: Option<BTreeMap<String, String>>,
) -> Result<Commit> {
    let created_at = now();
    let id = compute_id(&parents, &entries, &info, created_at)?;
    Ok(Commit {
        id,
        parents,
        entries,
        info,
        created_at,
    })
}

pub fn get(backend: &Arc<dyn Backend>, id: &str) -> Result<Commit> {
    let bytes = backend
        .get(&commit_key(id))?
        .ok_or_else(|| EngineError::NotFound(format!("commit {id}")))?;
    let commit: Commit = bincode::deserialize(&bytes)?;
    Ok(commit)
}

/// Fetches `key`'s bytes as of `commit_id`, bumping the key's touch counter.
pub fn read(backend: &Arc<dyn Backend>, commit_id: &str, key: &str) -> Result<Option<Vec<u8>>> {
    let commit = get(backend, commit_id)?;
    match commit.entries.get(key) {
        Some(pointer) => {
            let bytes = backend
                .get(&data_key(pointer))?
                .ok_or_else(|| EngineError::Storage(format!("dangling pointer {pointer}")))?;
            meta::touch(backend, key, bytes.len() as u64, now())?;
            Ok(Some(bytes))
        }
        None => Ok(None),
    }
}

pub fn read_many(
    backend: &Arc<dyn Backend>,
    commit_id: &str,
    keys: &[String],
) -> Result<BTreeMap<String, Vec<u8>>> {
    let mut out = BTreeMap::new();
    for key in keys {
        if let Some(bytes) = read(backend, commit_id, key)? {
            out.insert(key.clone(), bytes);
        }
    }
    Ok(out)
}

pub fn keys_of(backend: &Arc<dyn Backend>, commit_id: &str) -> Result<Vec<String>> {
    let commit = get(backend, commit_id)?;
    Ok(commit.entries.keys().cloned().collect())
}

/// Fetches `key`'s bytes as recorded by `commit`, without touching its
/// touch-counter metadata. Used internally by merge resolution, which
/// inspects historical commits rather than serving a user-facing read.
pub(crate) fn fetch_bytes(
    backend: &Arc<dyn Backend>,
    commit: &Commit,
    key: &str,
) -> Result<Option<Vec<u8>>> {
    match commit.entries.get(key) {
        Some(pointer) => Ok(backend.get(&data_key(pointer))?),
        None => Ok(None),
    }
}

/// Persists all new blobs, then a new commit whose map equals
/// `parent.entries - removals + updates` (spec §4.2). Never touches a ref.
pub fn write(
    backend: &Arc<dyn Backend>,
    parent_id: &str,
    updates: &BTreeMap<String, Vec<u8>>,
    removals: &[String],
    info: Option<BTreeMap<String, String>>,
) -> Result<CommitId> {
    Ok(write_full(backend, parent_id, updates, removals, info)?.id)
}

/// Same as `write` but returns the full `Commit`, saving merge.rs a
/// redundant `get` when it needs more than just the new id.
pub fn write_full(
    backend: &Arc<dyn Backend>,
    parent_id: &str,
    updates: &BTreeMap<String, Vec<u8>>,
    removals: &[String],
    info: Option<BTreeMap<String, String>>,
) -> Result<Commit> {
    for key in updates.keys().chain(removals.iter()) {
        validate_user_key(key)?;
    }

    let parent = get(backend, parent_id)?;
    let mut entries = parent.entries.clone();

    for key in removals {
        entries.remove(key);
    }

    let new_id_hint = now();
    for (key, value) in updates {
        let pointer = commit_scoped_pointer(parent_id, key, value);
        backend.set(&data_key(&pointer), value)?;
        meta::touch(backend, key, value.len() as u64, new_id_hint)?;
        entries.insert(key.clone(), pointer);
    }

    let commit = build(vec![parent_id.to_string()], entries, info)?;
    persist(backend, &commit)?;
    debug!(parent = parent_id, child = %commit.id, "commit::write");
    Ok(commit)
}

/// Same contract as `write`, but new blobs are stored content-addressed so
/// identical bytes across commits dedup naturally (SPEC_FULL.md Open
/// Question #1).
pub fn write_dedup(
    backend: &Arc<dyn Backend>,
    parent_id: &str,
    updates: &BTreeMap<String, Vec<u8>>,
    removals: &[String],
    info: Option<BTreeMap<String, String>>,
) -> Result<CommitId> {
    for key in updates.keys().chain(removals.iter()) {
        validate_user_key(key)?;
    }

    let parent = get(backend, parent_id)?;
    let mut entries = parent.entries.clone();

    for key in removals {
        entries.remove(key);
    }

    let stamp = now();
    for (key, value) in updates {
        let pointer = content_pointer(value);
        if !backend.contains(&data_key(&pointer))? {
            backend.set(&data_key(&pointer), value)?;
        }
        meta::touch(backend, key, value.len() as u64, stamp)?;
        entries.insert(key.clone(), pointer);
    }

    let commit = build(vec![parent_id.to_string()], entries, info)?;
    persist(backend, &commit)?;
    Ok(commit.id)
}

/// Builds a merge commit with the given parents and resolved entries,
/// without writing any new blobs (the blobs already exist, referenced by
/// the entries inherited from `ours`/`theirs`).
pub fn build_merge(
    parents: Vec<CommitId>,
    entries: BTreeMap<String, Pointer>,
    info: Option<BTreeMap<String, String>>,
) -> Result<Commit> {
    build(parents, entries, info)
}

/// Newest-to-oldest commit id history. `all_parents = false` walks only
/// first parents (linear); `true` does a de-duplicating BFS over the whole
/// DAG. Materialized eagerly but cheap to call again (spec: "restartable").
pub fn history(backend: &Arc<dyn Backend>, commit_id: &str, all_parents: bool) -> Result<Vec<CommitId>> {
    let mut out = Vec::new();
    if all_parents {
        let mut seen = HashSet::new();
        let mut queue = VecDeque::new();
        queue.push_back(commit_id.to_string());
        while let Some(id) = queue.pop_front() {
            if !seen.insert(id.clone()) {
                continue;
            }
            let commit = get(backend, &id)?;
            out.push(id);
            for parent in commit.parents {
                queue.push_back(parent);
            }
        }
    } else {
        let mut current = Some(commit_id.to_string());
        while let Some(id) = current {
            let commit = get(backend, &id)?;
            current = commit.parents.first().cloned();
            out.push(id);
        }
    }
    Ok(out)
}

pub fn diff(backend: &Arc<dyn Backend>, a: &str, b: &str) -> Result<Diff> {
    let ca = get(backend, a)?;
    let cb = get(backend, b)?;

    let mut result = Diff::default();
    for (key, pointer) in &cb.entries {
        match ca.entries.get(key) {
            None => {
                result.added.insert(key.clone(), pointer.clone());
            }
            Some(old_pointer) if old_pointer != pointer => {
                result.modified.insert(key.clone(), pointer.clone());
            }
            _ => {}
        }
    }
    for key in ca.entries.keys() {
        if !cb.entries.contains_key(key) {
            result.removed.push(key.clone());
        }
    }
    Ok(result)
}

fn ancestor_set(backend: &Arc<dyn Backend>, id: &str) -> Result<HashSet<CommitId>> {
    let mut seen = HashSet::new();
    let mut queue = VecDeque::new();
    queue.push_back(id.to_string());
    while let Some(current) = queue.pop_front() {
        if !seen.insert(current.clone()) {
            continue;
        }
        let commit = get(backend, &current)?;
        for parent in commit.parents {
            queue.push_back(parent);
        }
    }
    Ok(seen)
}

/// Lowest common ancestor of `a` and `b` (spec §4.2): mark ancestors of `a`,
/// walk ancestors of `b` breadth-first, return the first one already
/// marked. `None` only if the two commits share no history.
pub fn lca(backend: &Arc<dyn Backend>, a: &str, b: &str) -> Result<Option<CommitId>> {
    let ancestors_a = ancestor_set(backend, a)?;

    let mut seen = HashSet::new();
    let mut queue = VecDeque::new();
    queue.push_back(b.to_string());
    while let Some(id) = queue.pop_front() {
        if !seen.insert(id.clone()) {
            continue;
        }
        if ancestors_a.contains(&id) {
            return Ok(Some(id));
        }
        let commit = get(backend, &id)?;
        for parent in commit.parents {
            queue.push_back(parent);
        }
    }
    Ok(None)
}

/// Parallel variant of the ancestor-reachability walk used by GC's orphan
/// scan (spec §4.4): given a list of branch heads, returns the union of
/// all ids reachable from any of them. Each head's walk is independent so
/// we fan them out with `rayon`, matching the teacher's use of `rayon` for
/// embarrassingly parallel per-branch work.
pub fn reachable_from_many(backend: &Arc<dyn Backend>, heads: &[CommitId]) -> Result<HashSet<CommitId>> {
    let sets: Result<Vec<HashSet<CommitId>>> = heads
        .par_iter()
        .map(|head| ancestor_set(backend, head))
        .collect();
    let mut union = HashSet::new();
    for set in sets? {
        union.extend(set);
    }
    Ok(union)
}
