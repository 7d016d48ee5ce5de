//! Rotating API-key profiles.
//!
//! A profile holds an ordered, non-empty set of keys for one chain entry.
//! The chain rotates on rate limits so the next attempt sees a fresh key.

use std::sync::Mutex;

use crate::llm::LlmError;

/// Ordered key ring with a current index. All operations are serialized;
/// keys never leave the profile except through `current()`.
#[derive(Debug)]
pub struct AuthProfile {
    keys: Vec<String>,
    index: Mutex<usize>,
}

impl AuthProfile {
    /// Create a profile from an ordered key list.
    ///
    /// Returns `LlmError::NoKeys` for an empty list; an empty profile is a
    /// configuration bug, not a runtime condition.
    pub fn new(keys: Vec<String>) -> Result<Self, LlmError> {
        if keys.is_empty() {
            return Err(LlmError::NoKeys);
        }
        Ok(Self {
            keys,
            index: Mutex::new(0),
        })
    }

    /// Convenience constructor for the common single-key case.
    pub fn single(key: impl Into<String>) -> Self {
        Self {
            keys: vec![key.into()],
            index: Mutex::new(0),
        }
    }

    /// The key at the current index.
    pub fn current(&self) -> String {
        let index = self.index.lock().unwrap_or_else(|e| e.into_inner());
        self.keys[*index].clone()
    }

    /// Advance to the next key, wrapping around. Returns `false` when there
    /// is nothing to rotate to.
    pub fn rotate(&self) -> bool {
        if self.keys.len() <= 1 {
            return false;
        }
        let mut index = self.index.lock().unwrap_or_else(|e| e.into_inner());
        *index = (*index + 1) % self.keys.len();
        true
    }

    /// Number of keys in the ring.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Always false: construction rejects empty rings.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}
