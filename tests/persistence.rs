//! Exercises the on-disk `SledBackend` against a real temp-directory path
//! (rather than `sled`'s in-memory `temporary` mode) and initializes
//! `tracing-subscriber` so the engine's structured logging is observable,
//! matching SPEC_FULL.md's ambient-stack test tooling section.

use std::collections::BTreeMap;
use std::sync::Arc;

use vxkv::backend::{Backend, SledBackend};
use vxkv::{advance, commit, GcConfig, OnConflict};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new("vxkv=debug"))
        .with_test_writer()
        .try_init();
}

#[test]
fn sled_backend_survives_reopen_at_the_same_path() {
    init_tracing();
    let dir = tempfile::tempdir().expect("temp dir");

    let root = {
        let backend: Arc<dyn Backend> = Arc::new(SledBackend::open(dir.path()).expect("open sled db"));
        let mut h = vxkv::open(backend, GcConfig::default(), "main").unwrap();
        let mut updates = BTreeMap::new();
        updates.insert("a".to_string(), b"1".to_vec());
        advance(&mut h, updates, vec![], None, OnConflict::Raise, None)
            .unwrap()
            .unwrap();
        h.current_commit().to_string()
    };
    // The backend (and its `sled::Db`) is fully dropped here, flushing to
    // disk; reopening at the same path must see the same branch state.

    let backend: Arc<dyn Backend> = Arc::new(SledBackend::open(dir.path()).expect("reopen sled db"));
    let h = vxkv::open(backend, GcConfig::default(), "main").unwrap();
    assert_eq!(h.current_commit(), root);
    assert_eq!(h.read("a").unwrap(), Some(b"1".to_vec()));
    assert_eq!(commit::history(&h.backend(), &root, false).unwrap().len(), 2);
}
