//! Shared in-memory state.
//!
//! The [`Store`] is a tree of JSON values addressed by key paths. Writers
//! replace the value at one path at a time; the root is copied on write, so
//! readers holding a [`Snapshot`] never see a later change and never see a
//! half-applied one.

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::sync::Arc;

use crate::identity::Identity;

/// top-level key of the local identity
pub const ME: &str = "me";

/// an immutable view of one path of the store, taken at a point in time
#[derive(Debug, Clone)]
pub struct Snapshot {
    root: Arc<Value>,
    path: Vec<String>,
    version: u64,
}

impl Snapshot {
    /// the value at the snapshot path, if it was set
    pub fn value(&self) -> Option<&Value> {
        lookup(&self.root, &self.path)
    }

    /// the store version the snapshot was taken at
    pub fn version(&self) -> u64 {
        self.version
    }

    /// an owned copy of the snapshot value
    pub fn to_value(&self) -> Option<Value> {
        self.value().cloned()
    }
}

impl PartialEq for Snapshot {
    fn eq(&self, other: &Self) -> bool {
        if Arc::ptr_eq(&self.root, &other.root) && self.path == other.path {
            return true;
        }
        self.value() == other.value()
    }
}

impl PartialEq<Value> for Snapshot {
    fn eq(&self, other: &Value) -> bool {
        self.value() == Some(other)
    }
}

#[derive(Debug)]
struct Inner {
    root: Arc<Value>,
    version: u64,
}

/// process-wide key-value state, shared by every component through an `Arc`
#[derive(Debug)]
pub struct Store {
    inner: RwLock<Inner>,
}

impl Default for Store {
    /// return a new, empty Store
    fn default() -> Self {
        Store {
            inner: RwLock::new(Inner {
                root: Arc::new(Value::Object(Map::new())),
                version: 0,
            }),
        }
    }
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    /// replace the value at `path`, creating intermediate tables as needed
    ///
    /// An empty path replaces the whole tree. A non-table value met on the way
    /// down is overwritten by a table.
    pub fn set(&self, path: &[&str], value: Value) {
        let mut inner = self.inner.write();
        let root = Arc::make_mut(&mut inner.root);
        let slot = path.iter().fold(root, |node, key| {
            if !node.is_object() {
                *node = Value::Object(Map::new());
            }
            match node {
                Value::Object(map) => map.entry(key.to_string()).or_insert(Value::Null),
                _ => unreachable!("node was just made an object"),
            }
        });
        *slot = value;
        inner.version += 1;
        tracing::trace!("store: set {:?} at version {}", path, inner.version);
    }

    /// the value under a top-level key
    pub fn get(&self, key: &str) -> Option<Value> {
        self.get_in(&[key])
    }

    /// the value at `path`, `None` if nothing was ever set there
    pub fn get_in(&self, path: &[&str]) -> Option<Value> {
        let inner = self.inner.read();
        lookup(&inner.root, path).cloned()
    }

    /// the value at `path` decoded into a plain Rust type
    ///
    /// Absent paths and values of the wrong shape both read as `None`.
    pub fn get_as<T: DeserializeOwned>(&self, path: &[&str]) -> Option<T> {
        let value = self.get_in(path)?;
        match serde_json::from_value(value) {
            Ok(decoded) => Some(decoded),
            Err(err) => {
                tracing::warn!("store: unexpected shape at {:?}: {}", path, err);
                None
            }
        }
    }

    /// an immutable view of `path` as it is now
    pub fn snapshot(&self, path: &[&str]) -> Snapshot {
        let inner = self.inner.read();
        Snapshot {
            root: Arc::clone(&inner.root),
            path: path.iter().map(|k| k.to_string()).collect(),
            version: inner.version,
        }
    }

    /// number of completed writes
    pub fn version(&self) -> u64 {
        self.inner.read().version
    }

    /// the local identity, once known
    pub fn me(&self) -> Option<Identity> {
        match self.get(ME)? {
            Value::String(me) => Some(me),
            _ => None,
        }
    }

    pub fn set_me(&self, me: &str) {
        self.set(&[ME], Value::String(me.to_string()));
    }
}

fn lookup<'a, S: AsRef<str>>(root: &'a Value, path: &[S]) -> Option<&'a Value> {
    path.iter()
        .try_fold(root, |node, key| node.as_object()?.get(key.as_ref()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    #[test]
    fn unset_paths_read_as_absent() {
        let store = Store::new();
        assert_eq!(store.get("authors"), None);
        assert_eq!(store.get_in(&["authors", "me123"]), None);
        assert_eq!(store.me(), None);
        assert_eq!(store.snapshot(&["authors"]).value(), None);
    }

    #[test]
    fn set_overwrites_without_merging() {
        let store = Store::new();
        store.set(&["authors"], json!({ "me123": "pete" }));
        store.set(&["authors"], json!({ "you123": "fabian" }));

        assert_eq!(store.get("authors"), Some(json!({ "you123": "fabian" })));
        assert_eq!(store.version(), 2);
    }

    #[test]
    fn nested_set_creates_tables() {
        let store = Store::new();
        store.set(&["authors", "me123"], json!("pete"));
        store.set(&["authors", "you123"], json!("pegasus"));

        assert_eq!(store.get_in(&["authors", "me123"]), Some(json!("pete")));
        let keys: Vec<String> = store
            .get_as::<indexmap::IndexMap<String, String>>(&["authors"])
            .unwrap()
            .into_keys()
            .collect();
        assert_eq!(keys, vec!["me123", "you123"]);
    }

    #[test]
    fn nested_set_replaces_scalars_on_the_way() {
        let store = Store::new();
        store.set(&["friends"], json!(7));
        store.set(&["friends", "following"], json!(["a"]));
        assert_eq!(store.get("friends"), Some(json!({ "following": ["a"] })));
    }

    #[test]
    fn snapshots_do_not_see_later_writes() {
        let store = Store::new();
        store.set(&["authors"], json!({ "me123": "pete" }));
        let before = store.snapshot(&["authors"]);

        store.set(&["authors", "you123"], json!("fabian"));
        let after = store.snapshot(&["authors"]);

        assert_eq!(before, json!({ "me123": "pete" }));
        assert_eq!(after, json!({ "me123": "pete", "you123": "fabian" }));
        assert_ne!(before, after);
        assert!(before.version() < after.version());
    }

    #[test]
    fn snapshots_compare_by_value() {
        let store = Store::new();
        store.set(&["authors"], json!({ "me123": "pete" }));
        let first = store.snapshot(&["authors"]);
        store.set(&["me"], json!("me123"));
        let second = store.snapshot(&["authors"]);

        assert_eq!(first, second);
    }

    #[test]
    fn typed_reads() {
        let store = Store::new();
        store.set(&["authors"], json!({ "me123": "pete" }));
        let authors: HashMap<String, String> = store.get_as(&["authors"]).unwrap();
        assert_eq!(authors["me123"], "pete");

        assert_eq!(store.get_as::<Vec<String>>(&["authors"]), None);
    }

    #[test]
    fn local_identity() {
        let store = Store::new();
        store.set_me("me123");
        assert_eq!(store.me().as_deref(), Some("me123"));

        store.set(&[ME], json!(42));
        assert_eq!(store.me(), None);
    }
}
