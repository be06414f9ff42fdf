//! Meta-attachment (spec §4.4): free-function helpers over [`Key`]'s meta
//! accessors. Meta keys are themselves regular keys, attached to another
//! key's own `KeySet` rather than living in a dedicated container type;
//! this module gives that relationship the named home SPEC_FULL.md's
//! module list expects, while the storage and locking it wraps stay on
//! `Key` itself (`kdb_core::key`), since meta access has to go through
//! the same lock/refcount checks as any other key mutation.

use crate::error::Result;
use crate::key::Key;

/// `get-meta(k, name)`.
pub fn get(key: &Key, name: &str) -> Option<Key> {
    key.get_meta(name)
}

/// `set-meta(k, name, value)`. `value = None` removes the entry.
pub fn set(key: &Key, name: &str, value: Option<&str>) -> Result<()> {
    key.set_meta(name, value)
}

/// `copy-meta`: copies a single meta entry by reference (shallow).
pub fn copy(dest: &Key, src: &Key, name: &str) -> Result<()> {
    dest.copy_meta(src, name)
}

/// `copy-all-meta`: copies every meta entry by reference (shallow).
pub fn copy_all(dest: &Key, src: &Key) -> Result<()> {
    dest.copy_all_meta(src)
}
