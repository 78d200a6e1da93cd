//! Pending-output barrier.
//!
//! Tracks the tool invocations triggered during one turn.  Each triggering key
//! is registered once, then resolved once with its output; the turn may only
//! advance when every registered key holds a value.  Resolution may arrive in
//! any order, but outputs are always handed back in registration order.
//!
//! ```text
//!   register(a) register(b) register(c)      resolve(c) resolve(a) resolve(b)
//!   [a: -, b: -, c: -]  ──────────────────>  [a: x, b: y, c: z]  complete
//!                                             take_outputs() == [x, y, z]
//! ```

use std::collections::HashMap;
use std::fmt::Display;
use std::hash::Hash;

use crate::error::{KernelError, Result};

#[derive(Debug, Clone)]
struct Slot<K, V> {
    key: K,
    value: Option<V>,
}

/// Guarded map from triggering key to pending or resolved output.
#[derive(Debug, Clone)]
pub struct PendingOutputBarrier<K, V> {
    /// Slots in registration order.
    slots: Vec<Slot<K, V>>,
    /// Key to slot position.
    index: HashMap<K, usize>,
    /// Number of slots still waiting for a value.
    pending: usize,
}

impl<K, V> PendingOutputBarrier<K, V>
where
    K: Eq + Hash + Clone + Display,
{
    /// Create an empty barrier.  An empty barrier is complete.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            index: HashMap::new(),
            pending: 0,
        }
    }

    /// Register a key with no value yet.
    ///
    /// Fails with [`KernelError::DuplicateKey`] if the key is already present
    /// this turn.
    pub fn register(&mut self, key: K) -> Result<()> {
        if self.index.contains_key(&key) {
            return Err(KernelError::DuplicateKey {
                key: key.to_string(),
            });
        }

        tracing::trace!(key = %key, "barrier slot registered");
        self.index.insert(key.clone(), self.slots.len());
        self.slots.push(Slot { key, value: None });
        self.pending += 1;
        Ok(())
    }

    /// Store the output for `key`.
    ///
    /// Returns `true` exactly when this call resolved the last pending slot.
    pub fn resolve(&mut self, key: &K, value: V) -> Result<bool> {
        let position = *self
            .index
            .get(key)
            .ok_or_else(|| KernelError::UnknownKey {
                key: key.to_string(),
            })?;

        let slot = &mut self.slots[position];
        if slot.value.is_some() {
            return Err(KernelError::AlreadyResolved {
                key: key.to_string(),
            });
        }

        slot.value = Some(value);
        self.pending -= 1;
        tracing::trace!(key = %key, pending = self.pending, "barrier slot resolved");
        Ok(self.pending == 0)
    }

    /// True iff every registered key has a value.
    pub fn is_complete(&self) -> bool {
        self.pending == 0
    }

    /// Number of unresolved slots.
    pub fn pending(&self) -> usize {
        self.pending
    }

    /// Keys still waiting for a value, in registration order.
    pub fn pending_keys(&self) -> Vec<&K> {
        self.slots
            .iter()
            .filter(|s| s.value.is_none())
            .map(|s| &s.key)
            .collect()
    }

    /// Whether `key` is registered this turn.
    pub fn contains(&self, key: &K) -> bool {
        self.index.contains_key(key)
    }

    /// Number of registered slots.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether nothing has been registered this turn.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Hand back every output in registration order and clear the barrier.
    ///
    /// Fails with [`KernelError::BarrierIncomplete`] (leaving the barrier
    /// untouched) while any slot is pending.
    pub fn take_outputs(&mut self) -> Result<Vec<V>> {
        if !self.is_complete() {
            return Err(KernelError::BarrierIncomplete {
                pending: self.pending,
            });
        }

        let outputs = std::mem::take(&mut self.slots)
            .into_iter()
            .filter_map(|s| s.value)
            .collect();
        self.clear();
        Ok(outputs)
    }

    /// Drop every slot, resolved or not.
    pub fn clear(&mut self) {
        self.slots.clear();
        self.index.clear();
        self.pending = 0;
    }
}

impl<K, V> Default for PendingOutputBarrier<K, V>
where
    K: Eq + Hash + Clone + Display,
{
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
