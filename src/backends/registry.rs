//! Purpose: Process-wide registry of backend factories keyed by type name.
//! Exports: `Registry`, `init`, `register`, `factory`.
//! Role: `init` installs the built-in backends once at start-up; configuration
//! then instantiates backends by their `type`.
//! Invariants: Names are compared case-insensitively; registering a taken name fails.
use std::collections::HashMap;
use std::sync::{Arc, LazyLock, Once, RwLock};

use super::{Factory, kv};
use crate::core::error::{Error, ErrorKind};

pub struct Registry<T> {
    entries: RwLock<HashMap<String, T>>,
}

impl<T: Clone> Registry<T> {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, name: &str, value: T) -> Result<(), Error> {
        let name = normalize(name);
        let mut entries = self
            .entries
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if entries.contains_key(&name) {
            return Err(Error::new(ErrorKind::Conflict)
                .with_message(format!("backend '{name}' already registered")));
        }
        entries.insert(name, value);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<T> {
        self.entries
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&normalize(name))
            .cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .entries
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}

impl<T: Clone> Default for Registry<T> {
    fn default() -> Self {
        Self::new()
    }
}

fn normalize(name: &str) -> String {
    name.to_lowercase()
}

static FACTORIES: LazyLock<Registry<Factory>> = LazyLock::new(Registry::new);
static BUILTINS: Once = Once::new();

/// Registers the built-in backends. Safe to call more than once.
pub fn init() {
    BUILTINS.call_once(|| {
        let factory: Factory = Arc::new(kv::factory);
        if let Err(err) = FACTORIES.register("kv", factory) {
            tracing::warn!(error = %err, "built-in backend registration failed");
        }
    });
}

pub fn register(kind: &str, factory: Factory) -> Result<(), Error> {
    FACTORIES.register(kind, factory)
}

pub fn factory(kind: &str) -> Option<Factory> {
    FACTORIES.get(kind)
}

pub fn kinds() -> Vec<String> {
    FACTORIES.names()
}
