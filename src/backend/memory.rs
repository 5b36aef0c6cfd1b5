use std::collections::BTreeMap;
use std::sync::Mutex;

use super::{Backend, BackendError, BackendResult};

/// In-process backend over a `BTreeMap` guarded by a single mutex.
///
/// The mutex around every operation — not just `cas` — is stricter than
/// spec §5 requires (only `cas` must be linearizable), but it is the
/// simplest correct implementation and mirrors the teacher's own approach
/// of wrapping `sled`'s CAS in a coarse lock for the in-memory case.
#[derive(Default)]
pub struct MemoryBackend {
    data: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Backend for MemoryBackend {
    fn get(&self, key: &str) -> BackendResult<Option<Vec<u8>>> {
        let data = self.data.lock().map_err(poison)?;
        Ok(data.get(key).cloned())
    }

    fn set(&self, key: &str, value: &[u8]) -> BackendResult<()> {
        let mut data = self.data.lock().map_err(poison)?;
        data.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn remove(&self, key: &str) -> BackendResult<()> {
        let mut data = self.data.lock().map_err(poison)?;
        data.remove(key);
        Ok(())
    }

    fn keys(&self, prefix: &str) -> BackendResult<Vec<String>> {
        let data = self.data.lock().map_err(poison)?;
        Ok(data.range(prefix.to_string()..).take_while(|(k, _)| k.starts_with(prefix)).map(|(k, _)| k.clone()).collect())
    }

    fn items(&self, prefix: &str) -> BackendResult<Vec<(String, Vec<u8>)>> {
        let data = self.data.lock().map_err(poison)?;
        Ok(data
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn cas(&self, key: &str, new: Option<&[u8]>, expected: Option<&[u8]>) -> BackendResult<bool> {
        let mut data = self.data.lock().map_err(poison)?;
        let current = data.get(key).map(|v| v.as_slice());
        if current != expected {
            return Ok(false);
        }
        match new {
            Some(value) => {
                data.insert(key.to_string(), value.to_vec());
            }
            None => {
                data.remove(key);
            }
        }
        Ok(true)
    }

    fn clear(&self) -> BackendResult<()> {
        let mut data = self.data.lock().map_err(poison)?;
        data.clear();
        Ok(())
    }
}

fn poison<T>(_: std::sync::PoisonError<T>) -> BackendError {
    BackendError::Storage("memory backend mutex poisoned".to_string())
}
