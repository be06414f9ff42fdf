//! The storage plugin contract (spec §4.5, §6.4): the facade's only
//! window onto I/O. A plugin's `get`/`set` mutate a [`KeySet`] in place
//! and report what happened through [`PluginStatus`]; everything above
//! this trait is pure and in-memory.

use kdb_core::{Key, KeySet};
use std::cell::RefCell;
use std::collections::BTreeMap;

/// The outcome of a single `get` or `set` call (spec §6.4: `-1`/`0`/`1`).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PluginStatus {
    /// Nothing changed.
    NoChange,
    /// The key-set was modified.
    Updated,
    /// The call failed; details belong on the `parent` key's meta.
    Error,
}

/// A storage back end mountable under a name prefix.
///
/// Implementations own their I/O state. `get`/`set` take the `parent`
/// key purely so they can attach warning/error meta on it, per spec §7's
/// policy; they must never otherwise mutate `parent`.
pub trait Plugin: std::fmt::Debug {
    /// Opens the backing store. Called once, before the first `get`.
    fn open(&mut self) -> PluginStatus {
        PluginStatus::NoChange
    }

    /// Fetches keys at or below `parent`'s name from storage and merges
    /// them into `set` (append-set semantics).
    fn get(&mut self, set: &mut KeySet, parent: &Key) -> PluginStatus;

    /// Commits the subtree of `set` at or below `parent`'s name to
    /// storage.
    fn set(&mut self, set: &KeySet, parent: &Key) -> PluginStatus;

    /// Tears down the backing store.
    fn close(&mut self) -> PluginStatus {
        PluginStatus::NoChange
    }
}

/// An in-memory reference plugin, grounded on the teacher's
/// `Backend::memory()`/`sled::Config::new().temporary(true)` idiom: a
/// storage back end that exists only for the duration of the process,
/// useful for tests and as a template for real plugins. Not a
/// production back end — spec.md's Non-goals explicitly exclude
/// concrete storage formats beyond this.
#[derive(Debug, Default)]
pub struct MemoryPlugin {
    store: RefCell<BTreeMap<Vec<u8>, Key>>,
}

impl MemoryPlugin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Plugin for MemoryPlugin {
    fn get(&mut self, set: &mut KeySet, parent: &Key) -> PluginStatus {
        let parent_name = parent.name();
        let store = self.store.borrow();
        let mut changed = false;
        for (_, key) in store.iter() {
            let name = key.name();
            if kdb_core::is_below_or_same(parent_name.unescaped(), name.unescaped()) {
                if set.append_key(key.clone()).is_ok() {
                    changed = true;
                }
            }
        }
        if changed {
            PluginStatus::Updated
        } else {
            PluginStatus::NoChange
        }
    }

    fn set(&mut self, set: &KeySet, parent: &Key) -> PluginStatus {
        let parent_name = parent.name();
        let mut store = self.store.borrow_mut();
        let mut changed = false;
        for key in set.iter() {
            let name = key.name();
            if kdb_core::is_below_or_same(parent_name.unescaped(), name.unescaped()) {
                store.insert(name.unescaped().as_bytes().to_vec(), key.clone());
                changed = true;
            }
        }
        if changed {
            PluginStatus::Updated
        } else {
            PluginStatus::NoChange
        }
    }
}
