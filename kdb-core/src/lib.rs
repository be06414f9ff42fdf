//! Name codec, key and key-set primitives for the `kdb` configuration
//! database. This crate is pure and in-memory: it knows nothing about
//! storage backends, mount points or the filesystem — that lives in
//! `kdb-storage` and the root `kdb` facade.

mod error;
mod key;
mod keyset;
pub mod meta;
mod name;

pub use error::{KdbError, Result};
pub use key::{Facets, Key, KeyBuilder, LockFlags, Value};
pub use keyset::{KeySet, LookupOptions};
pub use name::{
    classify, escape_part, is_below, is_below_or_same, is_directly_below, Name, Namespace,
    UnescapedName, UnescapedNameBuf, CASCADE_ORDER,
};
