//! An ordered, deduplicated collection of [`Key`] handles with cursor
//! semantics (spec §3 `KeySet`, §4.3).
//!
//! Keys are kept sorted by unescaped name at all times, which is what
//! lets `lookup_by_name`, `cut` and the cascading-resolution walk in
//! `lookup` run as binary searches instead of linear scans.

use crate::error::{KdbError, Result};
use crate::key::Key;
use crate::name::{is_below_or_same, CASCADE_ORDER};

/// Options controlling [`KeySet::lookup_by_name`] (spec §4.3 `lookup`:
/// "none/pop/delete" option flags).
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct LookupOptions {
    /// Remove the matched key from the set before returning it.
    pub pop: bool,
    /// `pop` plus immediately drop the caller's own reference to it —
    /// the returned key is released rather than handed back live.
    pub delete: bool,
}

impl LookupOptions {
    pub const NONE: LookupOptions = LookupOptions {
        pop: false,
        delete: false,
    };
    pub const POP: LookupOptions = LookupOptions {
        pop: true,
        delete: false,
    };
    pub const DELETE: LookupOptions = LookupOptions {
        pop: true,
        delete: true,
    };
}

/// An ordered key-set. Cloning a `KeySet` is a shallow copy: the
/// underlying `Vec` is duplicated but every element is a shared [`Key`]
/// handle, so mutating a key reached through one clone is visible
/// through the other (spec §3 I5).
///
/// A key-set carries its own reference count, separate from the
/// refcounts of the keys it holds (spec §3 "Key-set" attributes;
/// §4.3 "refcount operations parallel those on keys"). It starts at
/// zero, like a freshly `new`ed key, and is a bookkeeping device for
/// callers that share a `KeySet` by convention — [`KeySet::destroy`]
/// is the corresponding lifecycle operation (spec §3 Lifecycles:
/// "destroyed when ref reaches 0 and delete is called; destruction
/// decrements each contained key").
#[derive(Clone, Debug)]
pub struct KeySet {
    keys: Vec<Key>,
    /// `-1` is before-first; `0..keys.len()` is a valid position.
    cursor: isize,
    dirty: bool,
    refcount: u32,
}

impl Default for KeySet {
    fn default() -> Self {
        KeySet {
            keys: Vec::new(),
            cursor: -1,
            dirty: false,
            refcount: 0,
        }
    }
}

impl KeySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a set from an unsorted, possibly-duplicated key list.
    /// Later entries win on a name collision (spec §4.3 `ksNew`
    /// semantics mirrored from the `append_key` replace rule).
    pub fn with_keys(keys: impl IntoIterator<Item = Key>) -> Result<Self> {
        let mut set = KeySet::new();
        for key in keys {
            set.append_key(key)?;
        }
        Ok(set)
    }

    pub fn size(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// `search(k)`: binary search by unescaped name (spec §4.3). `Ok`
    /// gives the index of an exact match; `Err` gives the index `k`
    /// would need to be inserted at to keep the set sorted.
    pub fn search(&self, key: &Key) -> std::result::Result<usize, usize> {
        self.keys
            .binary_search_by(|probe| Key::compare(probe, key))
    }

    /// Inserts `key`, replacing any existing key of the same name. On
    /// replacement the old key's reference count is decremented and the
    /// new key's is incremented, preserving I5 (a key's refcount tracks
    /// how many sets hold it). Invalidates the cursor to before-first,
    /// since insertion can shift every later index (spec §4.3).
    pub fn append_key(&mut self, key: Key) -> Result<()> {
        match self.search(&key) {
            Ok(idx) => {
                let _ = self.keys[idx].dec_ref();
                key.inc_ref()?;
                self.keys[idx] = key;
            }
            Err(idx) => {
                key.inc_ref()?;
                self.keys.insert(idx, key);
            }
        }
        self.dirty = true;
        self.cursor = -1;
        Ok(())
    }

    /// Merges every key of `other` into `self`, in order (spec §4.3
    /// `ksAppend`).
    pub fn append_set(&mut self, other: &KeySet) -> Result<()> {
        for key in other.keys.iter() {
            self.append_key(key.clone())?;
        }
        Ok(())
    }

    /// Removes and returns the key named `name`, if present, decrementing
    /// its reference count and invalidating the cursor.
    pub fn remove_by_name(&mut self, name: &str) -> Option<Key> {
        let probe = Key::new(name).ok()?;
        match self.search(&probe) {
            Ok(idx) => {
                let key = self.keys.remove(idx);
                let _ = key.dec_ref();
                self.dirty = true;
                self.cursor = -1;
                Some(key)
            }
            Err(_) => None,
        }
    }

    /// Looks up a single key by exact name (no cascading), optionally
    /// removing it.
    pub fn lookup_by_name(&mut self, name: &str, opts: LookupOptions) -> Option<Key> {
        let probe = Key::new(name).ok()?;
        let idx = self.search(&probe).ok()?;
        if opts.pop {
            let key = self.keys.remove(idx);
            let _ = key.dec_ref();
            self.dirty = true;
            self.cursor = -1;
            if opts.delete {
                let _ = key.dec_ref();
                None
            } else {
                Some(key)
            }
        } else {
            Some(self.keys[idx].clone())
        }
    }

    /// `lookup`: resolves a name via cascading namespace probing when the
    /// key itself is cascading, or as an exact lookup otherwise
    /// (spec §4.3).
    pub fn lookup(&mut self, key: &Key, opts: LookupOptions) -> Option<Key> {
        use crate::name::Namespace;
        let name = key.name();
        if !matches!(name.namespace(), Namespace::Cascading) {
            return self.lookup_by_name(name.as_canonical_str(), opts);
        }
        let tail = &name.as_canonical_str()[1..];
        for make_ns in CASCADE_ORDER.iter() {
            let ns = make_ns();
            let candidate = join_namespace(&ns, tail);
            if let Some(found) = self.lookup_by_name(&candidate, opts) {
                return Some(found);
            }
        }
        None
    }

    /// Splits off and returns the subset of keys at or below `cutpoint`'s
    /// name, removing them from `self` and invalidating the cursor
    /// (spec §4.3 `ksCut`).
    pub fn cut(&mut self, cutpoint: &Key) -> KeySet {
        let cut_name = cutpoint.name();
        let mut removed = Vec::new();
        let mut kept = Vec::with_capacity(self.keys.len());
        for key in self.keys.drain(..) {
            if is_below_or_same(cut_name.unescaped(), key.name().unescaped()) {
                let _ = key.dec_ref();
                removed.push(key);
            } else {
                kept.push(key);
            }
        }
        self.keys = kept;
        self.dirty = true;
        self.cursor = -1;
        let mut out = KeySet::new();
        out.keys = removed;
        out
    }

    /// Removes and returns the last key in sort order, invalidating the
    /// cursor (spec §4.3 `ksPop`).
    pub fn pop(&mut self) -> Option<Key> {
        let key = self.keys.pop()?;
        let _ = key.dec_ref();
        self.dirty = true;
        self.cursor = -1;
        Some(key)
    }

    /// A deep-structure duplicate: same keys (still shared handles,
    /// matching `ksDup`'s documented shallow-copy-of-references
    /// semantics), independent cursor and Vec storage.
    pub fn duplicate(&self) -> Result<KeySet> {
        let mut out = KeySet::new();
        for key in &self.keys {
            out.append_key(key.clone())?;
        }
        Ok(out)
    }

    /// `copy`: replaces the full contents of `self` with those of `src`.
    pub fn copy(&mut self, src: &KeySet) -> Result<()> {
        for key in self.keys.drain(..) {
            let _ = key.dec_ref();
        }
        self.cursor = -1;
        self.append_set(src)
    }

    pub fn head(&self) -> Option<&Key> {
        self.keys.first()
    }

    pub fn tail(&self) -> Option<&Key> {
        self.keys.last()
    }

    pub fn at(&self, index: usize) -> Option<&Key> {
        self.keys.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Key> {
        self.keys.iter()
    }

    /// `-1` means before-first; otherwise a valid index into the set.
    pub fn get_cursor(&self) -> isize {
        self.cursor
    }

    /// Clamped to `[-1, size() - 1]`.
    pub fn set_cursor(&mut self, pos: isize) {
        let max = self.keys.len() as isize - 1;
        self.cursor = pos.clamp(-1, max.max(-1));
    }

    /// Resets the cursor to before-first (spec §3: cursor attribute
    /// `-1 = before-first`).
    pub fn rewind(&mut self) {
        self.cursor = -1;
    }

    /// The key at the cursor, or `None` while the cursor is before-first.
    pub fn current(&self) -> Option<&Key> {
        if self.cursor < 0 {
            return None;
        }
        self.keys.get(self.cursor as usize)
    }

    /// Advances the cursor by one and returns the key it now points to,
    /// or `None` (leaving the cursor unmoved) once the end is reached.
    pub fn next(&mut self) -> Option<&Key> {
        let candidate = self.cursor + 1;
        if candidate as usize >= self.keys.len() {
            return None;
        }
        self.cursor = candidate;
        self.keys.get(self.cursor as usize)
    }

    pub fn need_sync(&self) -> bool {
        self.dirty
    }

    pub fn clear_sync(&mut self) {
        self.dirty = false;
    }

    /// The key-set's own reference count, distinct from the refcounts of
    /// the keys it holds (spec §3 `KeySet` attributes). Saturating into
    /// an explicit error on overflow, matching `Key::inc_ref`.
    pub fn refcount(&self) -> u32 {
        self.refcount
    }

    pub fn inc_ref(&mut self) -> Result<u32> {
        self.refcount = self
            .refcount
            .checked_add(1)
            .ok_or(KdbError::RefcountOverflow)?;
        Ok(self.refcount)
    }

    pub fn dec_ref(&mut self) -> Result<u32> {
        if self.refcount == 0 {
            return Err(KdbError::InvalidArgument);
        }
        self.refcount -= 1;
        Ok(self.refcount)
    }

    /// *del*: decrements the set's own reference count and, if that
    /// brings it to zero, tears the set down — decrementing every
    /// contained key in turn (spec §3 Lifecycles: "destroyed when ref
    /// reaches 0 and delete is called; destruction decrements each
    /// contained key"). A positive remaining refcount leaves the set
    /// untouched, mirroring a key surviving `decRef` above zero.
    pub fn destroy(mut self) -> Result<()> {
        self.dec_ref()?;
        if self.refcount == 0 {
            for key in self.keys.drain(..) {
                let _ = key.dec_ref();
            }
        }
        Ok(())
    }
}

fn join_namespace(ns: &crate::name::Namespace, tail: &str) -> String {
    use crate::name::Namespace;
    let keyword = match ns {
        Namespace::Spec => "spec",
        Namespace::Proc => "proc",
        Namespace::Dir => "dir",
        Namespace::User(_) => "user",
        Namespace::System => "system",
        Namespace::Default => "default",
        _ => unreachable!("CASCADE_ORDER only yields concrete namespaces"),
    };
    if tail.is_empty() {
        keyword.to_string()
    } else {
        format!("{}/{}", keyword, tail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_sorts_and_dedups() {
        let mut set = KeySet::new();
        set.append_key(Key::new("user/b").unwrap()).unwrap();
        set.append_key(Key::new("user/a").unwrap()).unwrap();
        let replacement = Key::new("user/a").unwrap();
        replacement.set_string("new").unwrap();
        set.append_key(replacement).unwrap();
        assert_eq!(set.size(), 2);
        assert_eq!(set.head().unwrap().name().as_canonical_str(), "user/a");
        assert_eq!(set.head().unwrap().string_value().unwrap(), "new");
        assert_eq!(set.tail().unwrap().name().as_canonical_str(), "user/b");
    }

    #[test]
    fn refcount_tracks_membership() {
        let key = Key::new("user/a").unwrap();
        let mut set1 = KeySet::new();
        set1.append_key(key.clone()).unwrap();
        assert_eq!(key.refcount(), 1);
        let mut set2 = KeySet::new();
        set2.append_key(key.clone()).unwrap();
        assert_eq!(key.refcount(), 2);
        set1.remove_by_name("user/a");
        assert_eq!(key.refcount(), 1);
    }

    #[test]
    fn cut_splits_hierarchy() {
        let mut set = KeySet::new();
        for name in ["user/a", "user/a/b", "user/a/c", "user/b"] {
            set.append_key(Key::new(name).unwrap()).unwrap();
        }
        let cutpoint = Key::new("user/a").unwrap();
        let below = set.cut(&cutpoint);
        assert_eq!(below.size(), 3);
        assert_eq!(set.size(), 1);
        assert_eq!(set.head().unwrap().name().as_canonical_str(), "user/b");
    }

    #[test]
    fn lookup_cascades_through_namespaces() {
        let mut set = KeySet::new();
        set.append_key(Key::new("system/sw/app/opt").unwrap())
            .unwrap();
        let query = Key::new("/sw/app/opt").unwrap();
        let found = set.lookup(&query, LookupOptions::default()).unwrap();
        assert_eq!(found.name().as_canonical_str(), "system/sw/app/opt");
    }

    #[test]
    fn lookup_prefers_earlier_cascade_entries() {
        let mut set = KeySet::new();
        set.append_key(Key::new("user/sw/app/opt").unwrap())
            .unwrap();
        set.append_key(Key::new("system/sw/app/opt").unwrap())
            .unwrap();
        let query = Key::new("/sw/app/opt").unwrap();
        let found = set.lookup(&query, LookupOptions::default()).unwrap();
        assert_eq!(found.name().as_canonical_str(), "user/sw/app/opt");
    }

    #[test]
    fn cursor_starts_and_rewinds_to_before_first() {
        let mut set = KeySet::new();
        for name in ["user/a", "user/b", "user/c"] {
            set.append_key(Key::new(name).unwrap()).unwrap();
        }
        assert!(set.current().is_none());
        assert_eq!(set.get_cursor(), -1);
        set.next();
        assert!(set.current().is_some());
        set.rewind();
        assert!(set.current().is_none());
        assert_eq!(set.get_cursor(), -1);
    }

    #[test]
    fn cursor_walks_in_order() {
        let mut set = KeySet::new();
        for name in ["user/a", "user/b", "user/c"] {
            set.append_key(Key::new(name).unwrap()).unwrap();
        }
        let mut seen = Vec::new();
        while let Some(k) = set.next() {
            seen.push(k.name().as_canonical_str().to_string());
        }
        assert_eq!(seen, vec!["user/a", "user/b", "user/c"]);
        assert!(set.next().is_none());
    }

    #[test]
    fn append_cut_and_pop_invalidate_the_cursor() {
        let mut set = KeySet::new();
        for name in ["user/a", "user/b", "user/c"] {
            set.append_key(Key::new(name).unwrap()).unwrap();
        }
        set.next();
        set.next();
        assert!(set.current().is_some());

        set.append_key(Key::new("user/d").unwrap()).unwrap();
        assert!(set.current().is_none());

        set.next();
        set.next();
        let _ = set.pop();
        assert!(set.current().is_none());

        set.next();
        let cutpoint = Key::new("user/a").unwrap();
        let _ = set.cut(&cutpoint);
        assert!(set.current().is_none());
    }

    #[test]
    fn own_refcount_destroy_releases_contained_keys() {
        let key = Key::new("user/a").unwrap();
        let mut set = KeySet::new();
        set.append_key(key.clone()).unwrap();
        assert_eq!(key.refcount(), 1);

        set.inc_ref().unwrap();
        assert_eq!(set.refcount(), 1);
        set.destroy().unwrap();
        assert_eq!(key.refcount(), 0);
    }

    #[test]
    fn destroy_without_inc_ref_errors() {
        let set = KeySet::new();
        assert!(set.destroy().is_err());
    }

    #[test]
    fn duplicate_shares_key_handles() {
        let mut set = KeySet::new();
        let key = Key::new("user/a").unwrap();
        set.append_key(key.clone()).unwrap();
        let dup = set.duplicate().unwrap();
        dup.head().unwrap().set_string("changed").unwrap();
        assert_eq!(key.string_value().unwrap(), "changed");
    }

    use proptest::prelude::*;

    fn arb_distinct_names(n: usize) -> impl Strategy<Value = Vec<String>> {
        prop::collection::hash_set(1u32..1000, n).prop_map(|set| {
            set.into_iter()
                .map(|i| format!("user/k{:04}", i))
                .collect()
        })
    }

    proptest! {
        #[test]
        fn p3_sort_matches_insertion_after_append(names in arb_distinct_names(8)) {
            let mut set = KeySet::new();
            for name in &names {
                set.append_key(Key::new(name).unwrap()).unwrap();
            }
            let mut expected = names.clone();
            expected.sort();
            let actual: Vec<String> = set
                .iter()
                .map(|k| k.name().as_canonical_str().to_string())
                .collect();
            prop_assert_eq!(actual, expected);
        }

        #[test]
        fn p5_refcount_balances_with_membership(names in arb_distinct_names(6)) {
            let keys: Vec<Key> = names.iter().map(|n| Key::new(n).unwrap()).collect();
            let mut a = KeySet::new();
            let mut b = KeySet::new();
            for key in &keys {
                a.append_key(key.clone()).unwrap();
                b.append_key(key.clone()).unwrap();
            }
            for key in &keys {
                prop_assert_eq!(key.refcount(), 2);
            }
            for key in &keys {
                a.remove_by_name(key.name().as_canonical_str());
            }
            for key in &keys {
                prop_assert_eq!(key.refcount(), 1);
            }
        }

        #[test]
        fn p6_lookup_never_returns_a_mismatched_key(names in arb_distinct_names(8)) {
            let mut set = KeySet::new();
            for name in &names {
                set.append_key(Key::new(name).unwrap()).unwrap();
            }
            for name in &names {
                let query = Key::new(name).unwrap();
                let found = set.lookup(&query, LookupOptions::NONE);
                prop_assert!(found.is_some());
                prop_assert_eq!(found.unwrap().name().as_canonical_str(), name.as_str());
            }
            let miss = Key::new("user/not-present").unwrap();
            prop_assert!(set.lookup(&miss, LookupOptions::NONE).is_none());
        }

        #[test]
        fn p7_cut_partitions_the_set(names in arb_distinct_names(8)) {
            let mut set = KeySet::new();
            for name in &names {
                set.append_key(Key::new(name).unwrap()).unwrap();
            }
            let total_before = set.size();
            let cutpoint = Key::new("user/k0500").unwrap();
            let removed = set.cut(&cutpoint);
            prop_assert_eq!(removed.size() + set.size(), total_before);
            for key in removed.iter() {
                prop_assert!(is_below_or_same(cutpoint.name().unescaped(), key.name().unescaped()));
            }
            for key in set.iter() {
                prop_assert!(!is_below_or_same(cutpoint.name().unescaped(), key.name().unescaped()));
            }
        }
    }
}
