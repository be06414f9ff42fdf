use thiserror::Error;

/// An error kind produced by a pure, in-memory key or key-set operation.
///
/// These map directly onto spec §7: every mutating operation either
/// succeeds cleanly or fails with exactly one of these, leaving its
/// inputs unchanged except where documented (notably `set_name`, see
/// `Key::set_name`).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KdbError {
    /// Null/empty where non-null was required, or a size bound was exceeded.
    #[error("invalid argument")]
    InvalidArgument,
    /// The name failed validation or canonicalisation.
    #[error("invalid name: {0}")]
    InvalidName(String),
    /// The mutation was blocked by a lock flag.
    #[error("key facet is locked")]
    Locked,
    /// The name would change while the key is referenced by more than one
    /// key-set, which would desynchronise that set's sort order.
    #[error("key name cannot change while shared by multiple key-sets")]
    MembershipFrozen,
    /// A string value was read as binary, or vice versa.
    #[error("type mismatch")]
    TypeMismatch,
    /// A reference count would overflow its representable range.
    #[error("reference count overflow")]
    RefcountOverflow,
    /// An allocation failed. Never raised by pure in-memory key/key-set
    /// code under normal operation; kept as a distinct variant because
    /// storage plugins may legitimately hit it and need to report it
    /// through the same enum.
    #[error("out of memory")]
    OutOfMemory,
    /// `set` was called on a parent that was never `get`.
    #[error("set called without a prior get")]
    NeedsGet,
    /// A storage plugin reported an error.
    #[error("storage error: {0}")]
    StorageError(String),
    /// A name or string value was not well-formed UTF-8.
    #[error("invalid utf-8")]
    InvalidUtf8,
}

/// Convenience alias used throughout the core crates.
pub type Result<T> = std::result::Result<T, KdbError>;
