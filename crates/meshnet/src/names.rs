//! Name registry: resolves the 8-byte node hashes carried in data headers
//! back to node names.

use std::collections::HashMap;
use std::sync::Mutex;

use meshnet_core::name_hash;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NameError {
    #[error("name hash {hash:016x} already bound to {existing:?}, refusing {name:?}")]
    Collision {
        hash: u64,
        existing: String,
        name: String,
    },
}

#[derive(Default)]
struct Bindings {
    by_hash: HashMap<u64, String>,
    by_name: HashMap<String, u64>,
}

/// Bidirectional hash ↔ name map. A hash, once bound, is never rebound.
#[derive(Default)]
pub struct NameRegistry {
    bindings: Mutex<Bindings>,
}

impl NameRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `name` to its hash and return the hash.
    pub fn add(&self, name: &str) -> Result<u64, NameError> {
        let mut b = self.bindings.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(hash) = b.by_name.get(name) {
            return Ok(*hash);
        }
        let hash = name_hash(name);
        if let Some(existing) = b.by_hash.get(&hash) {
            return Err(NameError::Collision {
                hash,
                existing: existing.clone(),
                name: name.to_string(),
            });
        }
        b.by_hash.insert(hash, name.to_string());
        b.by_name.insert(name.to_string(), hash);
        Ok(hash)
    }

    /// Hash `name` would carry on the wire, without binding it. Fails if the
    /// hash is already bound to a different name.
    pub fn resolve(&self, name: &str) -> Result<u64, NameError> {
        let b = self.bindings.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(hash) = b.by_name.get(name) {
            return Ok(*hash);
        }
        let hash = name_hash(name);
        match b.by_hash.get(&hash) {
            Some(existing) => Err(NameError::Collision {
                hash,
                existing: existing.clone(),
                name: name.to_string(),
            }),
            None => Ok(hash),
        }
    }

    /// Hash of a bound name.
    pub fn hash_of(&self, name: &str) -> Option<u64> {
        let b = self.bindings.lock().unwrap_or_else(|e| e.into_inner());
        b.by_name.get(name).copied()
    }

    /// Resolve a hash seen on the wire.
    pub fn lookup(&self, hash: u64) -> Option<String> {
        let b = self.bindings.lock().unwrap_or_else(|e| e.into_inner());
        b.by_hash.get(&hash).cloned()
    }

    pub fn len(&self) -> usize {
        let b = self.bindings.lock().unwrap_or_else(|e| e.into_inner());
        b.by_hash.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    fn bind_raw(&self, hash: u64, name: &str) {
        let mut b = self.bindings.lock().unwrap_or_else(|e| e.into_inner());
        b.by_hash.insert(hash, name.to_string());
        b.by_name.insert(name.to_string(), hash);
    }
}
