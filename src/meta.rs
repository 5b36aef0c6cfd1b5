//! Per-key metadata (spec §3): a monotonically increasing touch counter,
//! the value's serialized size, and its creation timestamp. Process-wide
//! bookkeeping used only by GC; not versioned, best-effort durability
//! (SPEC_FULL.md §C.4).

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::backend::{meta_key, Backend};
use crate::error::Result;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KeyMeta {
    pub last_touch: u64,
    pub size: u64,
    pub created_at: f64,
}

/// Bumps the touch counter for `key`, refreshing its size; creates the
/// record (touch counter 1) if absent.
pub fn touch(backend: &Arc<dyn Backend>, key: &str, size: u64, now: f64) -> Result<()> {
    let storage_key = meta_key(key);
    let existing = backend.get(&storage_key)?;
    let meta = match existing {
        Some(bytes) => {
            let mut meta: KeyMeta = bincode::deserialize(&bytes)?;
            meta.last_touch += 1;
            meta.size = size;
            meta
        }
        None => KeyMeta {
            last_touch: 1,
            size,
            created_at: now,
        },
    };
    backend.set(&storage_key, &bincode::serialize(&meta)?)?;
    Ok(())
}

pub fn get(backend: &Arc<dyn Backend>, key: &str) -> Result<Option<KeyMeta>> {
    match backend.get(&meta_key(key))? {
        Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
        None => Ok(None),
    }
}

pub fn remove(backend: &Arc<dyn Backend>, key: &str) -> Result<()> {
    backend.remove(&meta_key(key))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;

    #[test]
    fn touch_increments_counter() {
        let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
        touch(&backend, "k", 10, 1.0).unwrap();
        touch(&backend, "k", 12, 2.0).unwrap();
        let meta = get(&backend, "k").unwrap().unwrap();
        assert_eq!(meta.last_touch, 2);
        assert_eq!(meta.size, 12);
        assert_eq!(meta.created_at, 1.0);
    }
}
