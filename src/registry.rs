use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::{Mutex, MutexGuard, PoisonError};

use lazy_static::lazy_static;

use crate::err::PatchError;
use crate::patch::Patch;

lazy_static! {
    static ref REGISTRY: Mutex<Registry> = Mutex::new(Registry::default());
}

/// Locks the process-wide registry. Every install and removal of patch bytes happens while
/// this guard is held.
pub(crate) fn lock() -> MutexGuard<'static, Registry> {
    // the map is never left half-updated, so a poisoned lock is still usable
    REGISTRY.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Armed patches by target address.
#[derive(Default)]
pub(crate) struct Registry {
    patches: HashMap<usize, Patch>,
}

impl Registry {
    pub fn register(&mut self, address: usize, patch: Patch) -> Result<(), PatchError> {
        match self.patches.entry(address) {
            Entry::Occupied(_) => Err(PatchError::AlreadyPatched(address)),
            Entry::Vacant(v) => {
                v.insert(patch);
                Ok(())
            }
        }
    }

    pub fn lookup(&self, address: usize) -> Option<&Patch> {
        self.patches.get(&address)
    }

    pub fn unregister(&mut self, address: usize) -> Result<Patch, PatchError> {
        self.patches
            .remove(&address)
            .ok_or(PatchError::NotPatched(address))
    }

    pub fn contains(&self, address: usize) -> bool {
        self.patches.contains_key(&address)
    }

    pub fn patches(&self) -> Vec<Patch> {
        self.patches.values().cloned().collect()
    }
}
