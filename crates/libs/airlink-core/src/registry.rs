//! Bounded table of attached adapters, the attach/detach lock that
//! serializes their lifecycle transitions, and the interface-name allocator
//! shared across adapters.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use log::debug;

use crate::adapter::Adapter;
use crate::error::WlanError;
use crate::subsystem::CardId;
use crate::sync::{lock, Semaphore, SemaphorePermit};

/// Adapters a registry holds unless configured otherwise.
pub const MAX_ADAPTERS: usize = 2;

pub struct AdapterRegistry {
    attach_lock: Arc<Semaphore>,
    slots: Mutex<Vec<Option<Arc<Adapter>>>>,
    names: Mutex<BTreeSet<String>>,
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::new(MAX_ADAPTERS)
    }
}

impl AdapterRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            attach_lock: Semaphore::new("attach"),
            slots: Mutex::new(vec![None; capacity]),
            names: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn capacity(&self) -> usize {
        lock(&self.slots).len()
    }

    pub fn len(&self) -> usize {
        lock(&self.slots).iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Serializes add/switch/remove across every adapter.
    pub fn acquire_attach(&self) -> SemaphorePermit {
        self.attach_lock.acquire()
    }

    pub fn attach_lock(&self) -> &Arc<Semaphore> {
        &self.attach_lock
    }

    /// Builds an adapter for the first free slot and stores it there.
    /// Callers hold the attach permit.
    pub(crate) fn install<F>(&self, card: CardId, build: F) -> Result<Arc<Adapter>, WlanError>
    where
        F: FnOnce(usize) -> Arc<Adapter>,
    {
        let mut slots = lock(&self.slots);
        if slots.iter().flatten().any(|adapter| adapter.card() == card) {
            return Err(WlanError::busy(format!("{card} already attached")));
        }
        let capacity = slots.len();
        let (index, slot) = slots
            .iter_mut()
            .enumerate()
            .find(|(_, slot)| slot.is_none())
            .ok_or(WlanError::RegistryFull { capacity })?;
        let adapter = build(index);
        *slot = Some(Arc::clone(&adapter));
        debug!("registry: {card} installed in slot {index}");
        Ok(adapter)
    }

    pub(crate) fn release(&self, index: usize) -> Option<Arc<Adapter>> {
        let released = lock(&self.slots).get_mut(index).and_then(Option::take);
        if let Some(adapter) = &released {
            debug!("registry: {} released slot {index}", adapter.card());
        }
        released
    }

    pub fn find_by_card(&self, card: CardId) -> Option<Arc<Adapter>> {
        lock(&self.slots)
            .iter()
            .flatten()
            .find(|adapter| adapter.card() == card)
            .cloned()
    }

    pub fn get(&self, index: usize) -> Option<Arc<Adapter>> {
        lock(&self.slots).get(index).cloned().flatten()
    }

    pub fn adapters(&self) -> Vec<Arc<Adapter>> {
        lock(&self.slots).iter().flatten().cloned().collect()
    }

    /// Reserves `<prefix><n>` with the lowest free `n`.
    pub fn alloc_name(&self, prefix: &str) -> String {
        let mut names = lock(&self.names);
        let name = (0usize..)
            .map(|n| format!("{prefix}{n}"))
            .find(|candidate| !names.contains(candidate))
            .unwrap_or_else(|| format!("{prefix}{}", names.len()));
        names.insert(name.clone());
        name
    }

    pub fn release_name(&self, name: &str) {
        lock(&self.names).remove(name);
    }

    pub fn names(&self) -> Vec<String> {
        lock(&self.names).iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_reuse_lowest_free_index() {
        let registry = AdapterRegistry::default();
        assert_eq!(registry.alloc_name("mlan"), "mlan0");
        assert_eq!(registry.alloc_name("mlan"), "mlan1");
        assert_eq!(registry.alloc_name("uap"), "uap0");
        registry.release_name("mlan0");
        assert_eq!(registry.alloc_name("mlan"), "mlan0");
        assert_eq!(registry.alloc_name("mlan"), "mlan2");
    }

    #[test]
    fn attach_permit_is_exclusive() {
        let registry = AdapterRegistry::new(1);
        let permit = registry.acquire_attach();
        assert!(registry.attach_lock().try_acquire().is_none());
        drop(permit);
        assert!(registry.attach_lock().try_acquire().is_some());
        assert_eq!(registry.capacity(), 1);
        assert!(registry.is_empty());
    }
}
