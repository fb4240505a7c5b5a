//! Named instance registry.
//!
//! The registry is the only owner of live instances. Lookups are lock-free for
//! readers; entries are only added during `init` and removed during `stop`.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::error;

use crate::error::{Error, LookupError};
use crate::instance::Instance;
use crate::kind::BackendKind;

/// Name used when a lookup does not specify one.
pub const DEFAULT_NAME: &str = "default";

#[derive(Debug)]
pub struct Registry {
    kind: BackendKind,
    entries: DashMap<String, Instance>,
}

impl Registry {
    pub fn new(kind: BackendKind) -> Self {
        Self {
            kind,
            entries: DashMap::new(),
        }
    }

    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    /// Store `instance` under its own name. A name can only be registered once.
    pub fn register(&self, instance: Instance) -> Result<(), Error> {
        match self.entries.entry(instance.name().to_string()) {
            Entry::Occupied(e) => Err(Error::DuplicateInstance {
                kind: self.kind,
                name: e.key().clone(),
            }),
            Entry::Vacant(e) => {
                e.insert(instance);
                Ok(())
            }
        }
    }

    /// Exact-name lookup. `None` or an empty name selects [`DEFAULT_NAME`].
    pub fn lookup(&self, name: Option<&str>) -> Result<Instance, LookupError> {
        let name = match name {
            Some(n) if !n.is_empty() => n,
            _ => DEFAULT_NAME,
        };
        match self.entries.get(name) {
            Some(entry) => Ok(entry.value().clone()),
            None => {
                error!(kind = %self.kind, name, "instance not found");
                Err(LookupError {
                    kind: self.kind,
                    name: name.to_string(),
                })
            }
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Visit every entry until `f` returns `false`.
    pub fn range(&self, mut f: impl FnMut(&Instance) -> bool) {
        for entry in self.entries.iter() {
            if !f(entry.value()) {
                break;
            }
        }
    }

    /// All entries, sorted by name.
    pub fn snapshot(&self) -> Vec<Instance> {
        let mut all: Vec<Instance> = self.entries.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| a.name().cmp(b.name()));
        all
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Remove and return every entry, sorted by name.
    pub fn drain(&self) -> Vec<Instance> {
        self.names()
            .into_iter()
            .filter_map(|name| self.entries.remove(&name).map(|(_, v)| v))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
