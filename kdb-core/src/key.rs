//! The `Key` type: a reference-counted handle onto a name, value, meta
//! and lock-flags tuple (spec §3, §4.2).
//!
//! A `Key` is a cheap `Rc<RefCell<KeyData>>` handle, not the data itself:
//! cloning a `Key` shares the same underlying entry, which is exactly
//! what lets "the same key live simultaneously in multiple sets" (spec
//! §1). The spec's own reference count (spec §3 "Reference count") is a
//! distinct, explicit counter inside `KeyData`, bumped by
//! [`Key::inc_ref`]/[`Key::dec_ref`] — it tracks *logical* holders
//! (key-sets plus explicit external holders), not `Rc`'s strong count,
//! matching I5 and the C API's explicit `keyIncRef`/`keyDecRef`.

use crate::error::{KdbError, Result};
use crate::keyset::KeySet;
use crate::name::Name;
use std::cell::{Ref, RefCell};
use std::rc::Rc;

/// Which facets of a key a `copy`/`duplicate`/`clear` call should touch
/// (spec §4.2 `copy`).
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Facets {
    pub name: bool,
    pub value: bool,
    pub meta: bool,
}

impl Facets {
    pub const ALL: Facets = Facets {
        name: true,
        value: true,
        meta: true,
    };
    pub const NAME: Facets = Facets {
        name: true,
        value: false,
        meta: false,
    };
    pub const VALUE: Facets = Facets {
        name: false,
        value: true,
        meta: false,
    };
    pub const META: Facets = Facets {
        name: false,
        value: false,
        meta: true,
    };
}

/// A small bitset of locked facets (spec §9 Design Notes: "Locking
/// facets: represent as a small bitset per key").
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct LockFlags(u8);

const LOCK_NAME: u8 = 1 << 0;
const LOCK_VALUE: u8 = 1 << 1;
const LOCK_META: u8 = 1 << 2;

impl LockFlags {
    pub fn is_name_locked(&self) -> bool {
        self.0 & LOCK_NAME != 0
    }
    pub fn is_value_locked(&self) -> bool {
        self.0 & LOCK_VALUE != 0
    }
    pub fn is_meta_locked(&self) -> bool {
        self.0 & LOCK_META != 0
    }
    pub fn lock_name(&mut self) {
        self.0 |= LOCK_NAME;
    }
    pub fn lock_value(&mut self) {
        self.0 |= LOCK_VALUE;
    }
    pub fn lock_meta(&mut self) {
        self.0 |= LOCK_META;
    }
    fn blocks(&self, what: Facets) -> bool {
        (what.name && self.is_name_locked())
            || (what.value && self.is_value_locked())
            || (what.meta && self.is_meta_locked())
    }
}

/// A key's value, mutually exclusive string/binary per spec §3.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Value {
    /// A UTF-8, conceptually NUL-terminated string value.
    Str(String),
    /// An opaque, length-prefixed byte buffer.
    Binary(Vec<u8>),
}

impl Value {
    pub fn is_binary(&self) -> bool {
        matches!(self, Value::Binary(_))
    }

    pub fn size(&self) -> usize {
        match self {
            Value::Str(s) => s.len(),
            Value::Binary(b) => b.len(),
        }
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::Str(String::new())
    }
}

#[derive(Debug)]
struct KeyData {
    name: Name,
    value: Value,
    flags: u32,
    meta: KeySet,
    locks: LockFlags,
    refcount: u32,
    sync: bool,
}

/// Builder mirroring the `new(name, attr1, attr2, ..., end)` attribute
/// stream of spec §6.3. The C-style `end` sentinel becomes the implicit
/// terminator of the builder chain: calling [`KeyBuilder::build`].
#[derive(Clone, Debug, Default)]
pub struct KeyBuilder {
    value: Option<Value>,
    flags: u32,
    meta: Vec<(String, String)>,
    size_hint: Option<usize>,
    locks: LockFlags,
}

impl KeyBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// `value str` — sets a string value.
    pub fn value(mut self, v: impl Into<String>) -> Self {
        self.value = Some(Value::Str(v.into()));
        self
    }

    /// `binary + length + buf` — sets a binary value (exclusive with
    /// `value`, last writer wins).
    pub fn binary(mut self, buf: impl Into<Vec<u8>>) -> Self {
        self.value = Some(Value::Binary(buf.into()));
        self
    }

    /// `func ptr` — stores an opaque callable. There is no language
    /// binding in this port to call back into, so `func` is accepted only
    /// as a binary-tagged payload; it still marks the key binary, per
    /// spec §6.3.
    pub fn func(self, payload: impl Into<Vec<u8>>) -> Self {
        self.binary(payload)
    }

    /// `flags n` — bitwise ORed into the key's internal flags.
    pub fn flags(mut self, n: u32) -> Self {
        self.flags |= n;
        self
    }

    /// `meta name, value` — repeatable.
    pub fn meta(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.meta.push((name.into(), value.into()));
        self
    }

    /// `size n` — reserved hint, recorded but not otherwise interpreted.
    pub fn size_hint(mut self, n: usize) -> Self {
        self.size_hint = Some(n);
        self
    }

    pub fn lock_name(mut self) -> Self {
        self.locks.lock_name();
        self
    }
    pub fn lock_value(mut self) -> Self {
        self.locks.lock_value();
        self
    }
    pub fn lock_meta(mut self) -> Self {
        self.locks.lock_meta();
        self
    }

    /// Terminates the attribute stream and builds the key.
    pub fn build(self, name: &str) -> Result<Key> {
        let name = Name::parse(name)?;
        let mut meta = KeySet::new();
        for (mname, mvalue) in self.meta {
            let key = Key::new(&mname)?;
            key.set_string(mvalue)?;
            meta.append_key(key)?;
        }
        let _ = self.size_hint;
        Ok(Key(Rc::new(RefCell::new(KeyData {
            name,
            value: self.value.unwrap_or_default(),
            flags: self.flags,
            meta,
            locks: self.locks,
            refcount: 0,
            sync: true,
        }))))
    }
}

/// A named, typed, metadata-carrying entry in the configuration tree
/// (spec §3). Cheap to clone: clones share the same underlying data.
#[derive(Clone, Debug)]
pub struct Key(Rc<RefCell<KeyData>>);

impl Key {
    /// `new(name, end)` with no further attributes.
    pub fn new(name: &str) -> Result<Self> {
        KeyBuilder::new().build(name)
    }

    /// True if `self` and `other` are handles onto the very same entry.
    pub fn is_same_entry(&self, other: &Key) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    /// `clear(k)`: resets name, value and meta to the empty state, unless
    /// any of those facets is locked, in which case nothing changes and
    /// `Locked` is returned.
    pub fn clear(&self) -> Result<()> {
        let mut data = self.0.borrow_mut();
        if data.locks.blocks(Facets::ALL) {
            return Err(KdbError::Locked);
        }
        data.name = Name::empty();
        data.value = Value::default();
        data.meta = KeySet::new();
        data.sync = true;
        Ok(())
    }

    /// `copy(dest, src, what)`: atomically replaces the requested facets.
    /// Locked facets on `dest` block the whole call before anything is
    /// touched.
    pub fn copy(&self, src: &Key, what: Facets) -> Result<()> {
        let mut dest = self.0.borrow_mut();
        if dest.locks.blocks(what) {
            return Err(KdbError::Locked);
        }
        let src = src.0.borrow();
        if what.name {
            dest.name = src.name.clone();
        }
        if what.value {
            dest.value = src.value.clone();
        }
        if what.meta {
            dest.meta = src.meta.clone();
        }
        dest.sync = true;
        Ok(())
    }

    /// `duplicate(src, what)`: copy onto a fresh key.
    pub fn duplicate(src: &Key, what: Facets) -> Key {
        let dest = KeyBuilder::new().build("").expect("empty name always parses");
        dest.copy(src, what).expect("a fresh key is never locked");
        dest
    }

    /// Saturating increment; errors rather than wrapping on overflow
    /// (spec §9 open question, resolved as `RefcountOverflow`).
    pub fn inc_ref(&self) -> Result<u32> {
        let mut data = self.0.borrow_mut();
        data.refcount = data
            .refcount
            .checked_add(1)
            .ok_or(KdbError::RefcountOverflow)?;
        Ok(data.refcount)
    }

    /// `decRef` on zero is a no-op error return, never a panic.
    pub fn dec_ref(&self) -> Result<u32> {
        let mut data = self.0.borrow_mut();
        if data.refcount == 0 {
            return Err(KdbError::InvalidArgument);
        }
        data.refcount -= 1;
        Ok(data.refcount)
    }

    pub fn refcount(&self) -> u32 {
        self.0.borrow().refcount
    }

    pub fn name(&self) -> Name {
        self.0.borrow().name.clone()
    }

    pub fn flags(&self) -> u32 {
        self.0.borrow().flags
    }

    /// `set-name(full)`: canonicalises `full` as a brand-new name. Blocked
    /// by a name lock or by being referenced from more than one key-set
    /// (spec §4.1 `membership-frozen`). On invalid input the name is left
    /// empty — an explicit, intentional quirk carried over for
    /// compatibility (spec §7 policy).
    pub fn set_name(&self, full: &str) -> Result<()> {
        let mut data = self.0.borrow_mut();
        if data.locks.is_name_locked() {
            return Err(KdbError::Locked);
        }
        if data.refcount > 1 {
            return Err(KdbError::MembershipFrozen);
        }
        match Name::parse(full) {
            Ok(name) => {
                data.name = name;
                data.sync = true;
                Ok(())
            }
            Err(err) => {
                data.name = Name::empty();
                Err(err)
            }
        }
    }

    /// `add-name(suffix)`: appends a relative suffix to the current name.
    /// May not change the namespace segment; `..` clamps at the root
    /// rather than erroring (spec §9 open question — see DESIGN.md).
    pub fn add_name(&self, suffix: &str) -> Result<()> {
        let mut data = self.0.borrow_mut();
        if data.locks.is_name_locked() {
            return Err(KdbError::Locked);
        }
        if data.refcount > 1 {
            return Err(KdbError::MembershipFrozen);
        }
        data.name = data.name.add_suffix_clamped(suffix)?;
        data.sync = true;
        Ok(())
    }

    /// `set-base-name(s)`: escapes `s` as a single segment and replaces
    /// the last segment. Fails on a root-only name (nothing to replace).
    pub fn set_base_name(&self, raw: &str) -> Result<()> {
        let mut data = self.0.borrow_mut();
        if data.locks.is_name_locked() {
            return Err(KdbError::Locked);
        }
        if data.refcount > 1 {
            return Err(KdbError::MembershipFrozen);
        }
        data.name = data.name.with_base_name(raw, true)?;
        data.sync = true;
        Ok(())
    }

    /// `add-base-name(s)`: escapes `s` as a single segment and appends it.
    pub fn add_base_name(&self, raw: &str) -> Result<()> {
        let mut data = self.0.borrow_mut();
        if data.locks.is_name_locked() {
            return Err(KdbError::Locked);
        }
        if data.refcount > 1 {
            return Err(KdbError::MembershipFrozen);
        }
        data.name = data.name.with_base_name(raw, false)?;
        data.sync = true;
        Ok(())
    }

    pub fn value(&self) -> Ref<'_, Value> {
        Ref::map(self.0.borrow(), |d| &d.value)
    }

    /// Reads the value as a string. `type-mismatch` if the key is binary.
    pub fn string_value(&self) -> Result<String> {
        match &self.0.borrow().value {
            Value::Str(s) => Ok(s.clone()),
            Value::Binary(_) => Err(KdbError::TypeMismatch),
        }
    }

    /// Reads the value as binary. `type-mismatch` if the key is a string.
    pub fn binary_value(&self) -> Result<Vec<u8>> {
        match &self.0.borrow().value {
            Value::Binary(b) => Ok(b.clone()),
            Value::Str(_) => Err(KdbError::TypeMismatch),
        }
    }

    pub fn set_string(&self, s: impl Into<String>) -> Result<()> {
        let mut data = self.0.borrow_mut();
        if data.locks.is_value_locked() {
            return Err(KdbError::Locked);
        }
        data.value = Value::Str(s.into());
        data.sync = true;
        Ok(())
    }

    pub fn set_binary(&self, buf: impl Into<Vec<u8>>) -> Result<()> {
        let mut data = self.0.borrow_mut();
        if data.locks.is_value_locked() {
            return Err(KdbError::Locked);
        }
        data.value = Value::Binary(buf.into());
        data.sync = true;
        Ok(())
    }

    pub fn lock(&self, what: Facets) {
        let mut data = self.0.borrow_mut();
        if what.name {
            data.locks.lock_name();
        }
        if what.value {
            data.locks.lock_value();
        }
        if what.meta {
            data.locks.lock_meta();
        }
    }

    pub fn is_locked(&self, what: Facets) -> bool {
        self.0.borrow().locks.blocks(what)
    }

    /// `get-meta(name)`.
    pub fn get_meta(&self, name: &str) -> Option<Key> {
        self.0.borrow_mut().meta.lookup_by_name(name, Default::default())
    }

    /// `set-meta(name, value)`. `value = None` removes the entry.
    pub fn set_meta(&self, name: &str, value: Option<&str>) -> Result<()> {
        let mut data = self.0.borrow_mut();
        if data.locks.is_meta_locked() {
            return Err(KdbError::Locked);
        }
        match value {
            Some(v) => {
                let key = Key::new(name)?;
                key.set_string(v)?;
                data.meta.append_key(key)?;
            }
            None => {
                data.meta.remove_by_name(name);
            }
        }
        data.sync = true;
        Ok(())
    }

    /// `copy-meta`: copies a single meta entry by reference (shallow).
    pub fn copy_meta(&self, src: &Key, name: &str) -> Result<()> {
        let mut data = self.0.borrow_mut();
        if data.locks.is_meta_locked() {
            return Err(KdbError::Locked);
        }
        if let Some(entry) = src.0.borrow_mut().meta.lookup_by_name(name, Default::default()) {
            data.meta.append_key(entry)?;
        }
        Ok(())
    }

    /// `copy-all-meta`: copies every meta entry by reference (shallow).
    pub fn copy_all_meta(&self, src: &Key) -> Result<()> {
        let mut data = self.0.borrow_mut();
        if data.locks.is_meta_locked() {
            return Err(KdbError::Locked);
        }
        let src_meta = src.0.borrow().meta.clone();
        data.meta.append_set(&src_meta)?;
        Ok(())
    }

    pub fn meta_set(&self) -> KeySet {
        self.0.borrow().meta.clone()
    }

    /// Total order consistent with unescaped-name byte order; `0` iff the
    /// names are equal (spec §4.2 `compare`).
    pub fn compare(a: &Key, b: &Key) -> std::cmp::Ordering {
        a.name()
            .unescaped()
            .as_bytes()
            .cmp(b.name().unescaped().as_bytes())
    }

    pub fn need_sync(&self) -> bool {
        self.0.borrow().sync
    }

    pub fn clear_sync(&self) {
        self.0.borrow_mut().sync = false;
    }
}
