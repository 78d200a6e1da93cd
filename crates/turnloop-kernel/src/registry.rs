//! Tool registry.
//!
//! Holds attached tool handlers keyed by descriptor name.  Names are unique
//! per owner; batch attach and detach are all-or-nothing, so a rejected batch
//! leaves the registry exactly as it was.
//!
//! The registry is a plain owned value.  Owners that mutate it from several
//! tasks wrap it in their own lock.
//!
//! # Example
//!
//! ```rust
//! # use turnloop_kernel::registry::ToolRegistry;
//! let mut registry = ToolRegistry::new();
//! registry.attach([("get_weather".to_string(), 1u32)]).unwrap();
//!
//! assert!(registry.attach([("get_weather".to_string(), 2)]).is_err());
//! assert_eq!(registry.get("get_weather"), Some(&1));
//! ```

use std::collections::{HashMap, HashSet};

use crate::error::{KernelError, Result};

/// Name-keyed set of handlers.
#[derive(Debug, Clone)]
pub struct ToolRegistry<H> {
    entries: HashMap<String, H>,
    /// Attach order, used for stable listing.
    order: Vec<String>,
}

impl<H> ToolRegistry<H> {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            order: Vec::new(),
        }
    }

    /// Attach a batch of handlers.
    ///
    /// Fails with [`KernelError::DuplicateTool`] if any name is already
    /// attached or appears twice in the batch; in that case nothing is
    /// attached.
    pub fn attach<I>(&mut self, handlers: I) -> Result<()>
    where
        I: IntoIterator<Item = (String, H)>,
    {
        let batch: Vec<(String, H)> = handlers.into_iter().collect();

        let mut seen = HashSet::with_capacity(batch.len());
        for (name, _) in &batch {
            if self.entries.contains_key(name) || !seen.insert(name.as_str()) {
                return Err(KernelError::DuplicateTool { name: name.clone() });
            }
        }

        for (name, handler) in batch {
            tracing::debug!(tool = %name, "tool attached");
            self.order.push(name.clone());
            self.entries.insert(name, handler);
        }

        Ok(())
    }

    /// Detach a batch of handlers by name, returning them in request order.
    ///
    /// Fails with [`KernelError::UnknownTool`] if any name is not attached
    /// (or is listed twice); in that case nothing is detached.
    pub fn detach<I, S>(&mut self, names: I) -> Result<Vec<H>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let names: Vec<S> = names.into_iter().collect();

        let mut seen = HashSet::with_capacity(names.len());
        for name in &names {
            let name = name.as_ref();
            if !self.entries.contains_key(name) || !seen.insert(name) {
                return Err(KernelError::UnknownTool {
                    name: name.to_owned(),
                });
            }
        }

        let removed = names
            .iter()
            .filter_map(|name| {
                let name = name.as_ref();
                self.order.retain(|n| n != name);
                tracing::debug!(tool = %name, "tool detached");
                self.entries.remove(name)
            })
            .collect();

        Ok(removed)
    }

    /// Detach everything, returning handlers in attach order.
    pub fn detach_all(&mut self) -> Vec<H> {
        let order = std::mem::take(&mut self.order);
        order
            .into_iter()
            .filter_map(|name| self.entries.remove(&name))
            .collect()
    }

    /// Look up a handler by name.
    pub fn get(&self, name: &str) -> Option<&H> {
        self.entries.get(name)
    }

    /// Whether a handler with this name is attached.
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// The attached handlers.  Callers must not rely on the order.
    pub fn list(&self) -> Vec<&H> {
        self.order
            .iter()
            .filter_map(|name| self.entries.get(name))
            .collect()
    }

    /// The attached names.
    pub fn names(&self) -> Vec<String> {
        self.order.clone()
    }

    /// Number of attached handlers.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<H> Default for ToolRegistry<H> {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
