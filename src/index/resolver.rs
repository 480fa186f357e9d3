//! Mapping from external keys to dense slots.

use std::collections::HashMap;

use tracing::trace;

use super::IndexError;
use crate::key::Key;

/// Assigns each distinct key the next free slot and remembers insertion order.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct KeyResolver {
    slots: HashMap<Key, u32>,
    order: Vec<Key>,
}

impl KeyResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds a resolver from keys listed in slot order.
    pub fn from_ordered(keys: Vec<Key>) -> Result<Self, IndexError> {
        let mut slots = HashMap::with_capacity(keys.len());
        for (slot, key) in keys.iter().enumerate() {
            let slot = u32::try_from(slot).map_err(|_| IndexError::Full)?;
            if slots.insert(key.clone(), slot).is_some() {
                return Err(IndexError::Corrupt(format!("duplicate key {key} in key map")));
            }
        }
        Ok(Self { slots, order: keys })
    }

    pub fn resolve(&self, key: &Key) -> Option<u32> {
        self.slots.get(key).copied()
    }

    /// Returns the slot for `key`, assigning `len()` if it is new.
    /// The flag is `true` when the slot was just created.
    pub fn resolve_or_create(&mut self, key: &Key) -> Result<(u32, bool), IndexError> {
        if let Some(slot) = self.slots.get(key) {
            return Ok((*slot, false));
        }
        let slot = u32::try_from(self.order.len()).map_err(|_| IndexError::Full)?;
        self.slots.insert(key.clone(), slot);
        self.order.push(key.clone());
        trace!(%key, slot, "key assigned");
        Ok((slot, true))
    }

    /// Forgets the newest key. Used to roll back a slot that could not be
    /// backed by an index record.
    pub(crate) fn pop(&mut self) {
        if let Some(key) = self.order.pop() {
            self.slots.remove(&key);
        }
    }

    /// Keys in insertion order.
    pub fn keys(&self) -> &[Key] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
