use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::{CacheError, LocalCache};
use crate::origin::DocPath;

/// In-process cache. Contents die with the process.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<DocPath, Vec<u8>>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, path: &DocPath) -> bool {
        self.lock().contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<DocPath, Vec<u8>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl LocalCache for MemoryCache {
    fn get(&self, path: &DocPath) -> Result<Option<Vec<u8>>, CacheError> {
        Ok(self.lock().get(path).cloned())
    }

    fn set(&self, path: &DocPath, state: &[u8]) -> Result<(), CacheError> {
        self.lock().insert(path.clone(), state.to_vec());
        Ok(())
    }

    fn delete(&self, path: &DocPath) -> Result<(), CacheError> {
        self.lock().remove(path);
        Ok(())
    }
}
