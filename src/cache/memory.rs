//! In-process cache backend: a mutex-guarded map with an eviction sweep.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::{CacheError, KvBackend};

/// Sweep expired entries once the map grows past this many keys.
const SWEEP_THRESHOLD: usize = 10_000;

struct Entry {
    value: Vec<u8>,
    expires_at: Instant,
}

pub struct MemoryBackend {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn sweep(entries: &mut HashMap<String, Entry>) {
        let now = Instant::now();
        entries.retain(|_, entry| entry.expires_at > now);
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.lock().expect("cache mutex").len()
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let mut entries = self.entries.lock().expect("cache mutex");
        match entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Ok(Some(entry.value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError> {
        let mut entries = self.entries.lock().expect("cache mutex");
        if entries.len() >= SWEEP_THRESHOLD {
            Self::sweep(&mut entries);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.entries.lock().expect("cache mutex").remove(key);
        Ok(())
    }

    async fn get_multiple(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>, CacheError> {
        let mut entries = self.entries.lock().expect("cache mutex");
        let now = Instant::now();
        let mut results = Vec::with_capacity(keys.len());
        for key in keys {
            match entries.get(key) {
                Some(entry) if entry.expires_at > now => results.push(Some(entry.value.clone())),
                Some(_) => {
                    entries.remove(key);
                    results.push(None);
                }
                None => results.push(None),
            }
        }
        Ok(results)
    }

    async fn set_multiple(
        &self,
        batch: Vec<(String, Vec<u8>)>,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let mut entries = self.entries.lock().expect("cache mutex");
        if entries.len() >= SWEEP_THRESHOLD {
            Self::sweep(&mut entries);
        }
        let expires_at = Instant::now() + ttl;
        for (key, value) in batch {
            entries.insert(key, Entry { value, expires_at });
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), CacheError> {
        self.entries.lock().expect("cache mutex").clear();
        Ok(())
    }
}
