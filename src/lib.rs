//! The `kdb` database facade (spec §4.5): the only layer that performs
//! I/O. Everything below it — names, keys, key-sets — is pure and
//! in-memory; this crate wires those primitives to a chain of
//! [`kdb_storage::Plugin`]s mounted under name prefixes.

pub use kdb_core::{
    classify, escape_part, is_below, is_below_or_same, is_directly_below, Facets, KdbError, Key,
    KeyBuilder, KeySet, LockFlags, LookupOptions, Name, Namespace, Result as CoreResult, Value,
    CASCADE_ORDER,
};
pub use kdb_storage::{MemoryPlugin, Plugin, PluginStatus};

use anyhow::{anyhow, Result};
use std::collections::HashSet;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

/// Installs a `tracing` subscriber driven by `RUST_LOG`, and routes the
/// `log` crate's output and panic messages through it. Idempotent:
/// intended to be called once by an embedding application, or by each
/// integration test (`.ok()` on the fallible steps absorbs repeat
/// calls).
pub fn init_tracing() {
    tracing_log::LogTracer::init().ok();
    let env = std::env::var(EnvFilter::DEFAULT_ENV).unwrap_or_else(|_| "info".to_owned());
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_span_events(FmtSpan::ACTIVE | FmtSpan::CLOSE)
        .with_env_filter(EnvFilter::new(env))
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok();
    log_panics::init();
}

/// One mount: a storage plugin responsible for everything at or below
/// `prefix`.
struct Mount {
    prefix: Name,
    plugin: Box<dyn Plugin>,
}

/// An ordered list of `(prefix, plugin)` mounts, built programmatically
/// (spec.md's Non-goals exclude parsing a concrete storage-backend file
/// format, so there is no `serde`-backed deserialization here — see
/// SPEC_FULL.md's Configuration module).
#[derive(Default)]
pub struct MountConfig {
    mounts: Vec<Mount>,
}

impl MountConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mounts `plugin` at `prefix`. Earlier mounts take precedence when
    /// prefixes overlap, matching the order plugins are registered in.
    pub fn mount(mut self, prefix: &str, plugin: impl Plugin + 'static) -> Result<Self> {
        let prefix = Name::parse(prefix).map_err(|e| anyhow!(e))?;
        self.mounts.push(Mount {
            prefix,
            plugin: Box::new(plugin),
        });
        Ok(self)
    }
}

/// The outcome of [`Database::get`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum GetStatus {
    NoChange,
    Updated,
}

/// The outcome of [`Database::set`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SetStatus {
    NoChange,
    Updated,
}

/// An open database handle (spec §4.5). Holds the mount map plus the
/// set of parent names that have had a successful `get`, so that `set`
/// can enforce the "`set` requires a prior matching `get`" rule.
pub struct Database {
    mounts: Vec<Mount>,
    got: HashSet<Vec<u8>>,
}

impl Database {
    /// *open(contract, parent)*: resolves the mount map into a live
    /// handle, opening every mounted plugin. `parent` receives any
    /// warnings accumulated while opening.
    #[tracing::instrument(skip(config, parent))]
    pub fn open(config: MountConfig, parent: &Key) -> Result<Self> {
        let mut db = Database {
            mounts: config.mounts,
            got: HashSet::new(),
        };
        for (idx, mount) in db.mounts.iter_mut().enumerate() {
            if mount.plugin.open() == PluginStatus::Error {
                push_warning(
                    parent,
                    idx as u32,
                    &format!("plugin at {} failed to open", mount.prefix.as_canonical_str()),
                    "kdb::open",
                );
            }
        }
        tracing::debug!("database opened with {} mount(s)", db.mounts.len());
        Ok(db)
    }

    fn mounts_for<'a, 'b>(&'a mut self, parent: &'b Name) -> impl Iterator<Item = &'a mut Mount> + use<'a, 'b> {
        self.mounts.iter_mut().filter(move |m| {
            is_below_or_same(m.prefix.unescaped(), parent.unescaped())
                || is_below_or_same(parent.unescaped(), m.prefix.unescaped())
        })
    }

    /// *get(handle, set, parent)*: merges every mounted plugin's view of
    /// the subtree below `parent` into `set`, in mount order. Failures
    /// are attached to `parent` as warnings rather than aborting the
    /// whole call, per spec §7 policy ("at most one error but any number
    /// of warnings per operation").
    #[tracing::instrument(skip(self, set, parent))]
    pub fn get(&mut self, set: &mut KeySet, parent: &Key) -> Result<GetStatus> {
        let parent_name = parent.name();
        let mut updated = false;
        let mut failed = false;
        for (idx, mount) in self.mounts_for(&parent_name).enumerate() {
            match mount.plugin.get(set, parent) {
                PluginStatus::Updated => updated = true,
                PluginStatus::NoChange => {}
                PluginStatus::Error => {
                    failed = true;
                    push_warning(
                        parent,
                        idx as u32,
                        &format!("get failed under {}", mount.prefix.as_canonical_str()),
                        "kdb::get",
                    );
                }
            }
        }
        self.got
            .insert(parent_name.unescaped().as_bytes().to_vec());
        if failed {
            push_error(parent, "one or more plugins failed during get", "kdb::get");
        }
        tracing::debug!(updated, "get completed");
        Ok(if updated {
            GetStatus::Updated
        } else {
            GetStatus::NoChange
        })
    }

    /// *set(handle, set, parent)*: commits exactly the subtree of `set`
    /// at or below `parent`'s name to every matching mount. Fails with
    /// `needs-get` if `get` was never called for this `parent` (spec
    /// §4.5).
    #[tracing::instrument(skip(self, set, parent))]
    pub fn set(&mut self, set: &KeySet, parent: &Key) -> Result<SetStatus> {
        let parent_name = parent.name();
        if !self
            .got
            .contains(parent_name.unescaped().as_bytes())
        {
            return Err(anyhow!(KdbError::NeedsGet));
        }
        let mut updated = false;
        let mut failed = false;
        for (idx, mount) in self.mounts_for(&parent_name).enumerate() {
            match mount.plugin.set(set, parent) {
                PluginStatus::Updated => updated = true,
                PluginStatus::NoChange => {}
                PluginStatus::Error => {
                    failed = true;
                    push_warning(
                        parent,
                        idx as u32,
                        &format!("set failed under {}", mount.prefix.as_canonical_str()),
                        "kdb::set",
                    );
                }
            }
        }
        if failed {
            push_error(parent, "one or more plugins failed during set", "kdb::set");
        }
        tracing::debug!(updated, "set completed");
        Ok(if updated {
            SetStatus::Updated
        } else {
            SetStatus::NoChange
        })
    }

    /// *close(handle, parent)*: tears down every mounted plugin.
    #[tracing::instrument(skip(self, parent))]
    pub fn close(&mut self, parent: &Key) -> Result<()> {
        for (idx, mount) in self.mounts.iter_mut().enumerate() {
            if mount.plugin.close() == PluginStatus::Error {
                push_warning(
                    parent,
                    idx as u32,
                    &format!("plugin at {} failed to close", mount.prefix.as_canonical_str()),
                    "kdb::close",
                );
            }
        }
        tracing::debug!("database closed");
        Ok(())
    }
}

/// Appends one `warnings/#NN/...` meta entry to `parent`, per spec §7's
/// indexed-warning convention.
fn push_warning(parent: &Key, number: u32, description: &str, module: &str) {
    let existing = count_warnings(parent);
    let base = format!("warnings/#{:02}", existing);
    let _ = parent.set_meta(&format!("{base}/number"), Some(&number.to_string()));
    let _ = parent.set_meta(&format!("{base}/description"), Some(description));
    let _ = parent.set_meta(&format!("{base}/module"), Some(module));
}

fn count_warnings(parent: &Key) -> usize {
    parent
        .meta_set()
        .iter()
        .filter(|k| k.name().as_canonical_str().starts_with("warnings/#"))
        .filter(|k| k.name().as_canonical_str().ends_with("/number"))
        .count()
}

fn push_error(parent: &Key, reason: &str, module: &str) {
    let _ = parent.set_meta("error/reason", Some(reason));
    let _ = parent.set_meta("error/module", Some(module));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_then_set_round_trips_through_memory_plugin() {
        let config = MountConfig::new()
            .mount("user", MemoryPlugin::new())
            .unwrap()
            .mount("system", MemoryPlugin::new())
            .unwrap();
        let parent = Key::new("user/app").unwrap();
        let mut db = Database::open(config, &parent).unwrap();

        let mut set = KeySet::new();
        assert_eq!(db.get(&mut set, &parent).unwrap(), GetStatus::NoChange);

        set.append_key({
            let k = Key::new("user/app/opt").unwrap();
            k.set_string("1").unwrap();
            k
        })
        .unwrap();
        assert_eq!(db.set(&set, &parent).unwrap(), SetStatus::Updated);

        let mut reloaded = KeySet::new();
        db.get(&mut reloaded, &parent).unwrap();
        assert_eq!(reloaded.size(), 1);
        assert_eq!(reloaded.head().unwrap().string_value().unwrap(), "1");
        db.close(&parent).unwrap();
    }

    #[test]
    fn set_without_get_fails() {
        let db = MountConfig::new().mount("user", MemoryPlugin::new()).unwrap();
        let parent = Key::new("user/app").unwrap();
        let mut db = Database::open(db, &parent).unwrap();
        let set = KeySet::new();
        let err = db.set(&set, &parent).unwrap_err();
        assert!(err.downcast_ref::<KdbError>().is_some());
    }
}
