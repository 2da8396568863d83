//! The uniform key-value contract shared by both backends.

use crate::error::{BindingError, Result};
use crate::json_store::{JsonStore, JsonStoreOptions};
use crate::row_store::{RowStore, RowStoreOptions};
use serde_json::Value;
use std::path::Path;

/// A key-value mapping whose every read and write goes through durable
/// storage.
pub trait Binding {
    /// The value stored under `key`, or `None`.
    fn get(&self, key: &str) -> Result<Option<Value>>;

    fn set(&self, key: &str, value: Value) -> Result<()>;

    /// Remove `key`. Removing a missing key succeeds.
    fn delete(&self, key: &str) -> Result<()>;

    fn has(&self, key: &str) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    fn keys(&self) -> Result<Vec<String>>;
}

impl Binding for JsonStore {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(JsonStore::get(self, key))
    }

    fn set(&self, key: &str, value: Value) -> Result<()> {
        JsonStore::set(self, key, value)
    }

    fn delete(&self, key: &str) -> Result<()> {
        JsonStore::delete(self, key).map(|_| ())
    }

    fn has(&self, key: &str) -> Result<bool> {
        Ok(self.contains_key(key))
    }

    fn keys(&self) -> Result<Vec<String>> {
        Ok(JsonStore::keys(self))
    }
}

impl Binding for RowStore {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        RowStore::get(self, key)
    }

    fn set(&self, key: &str, value: Value) -> Result<()> {
        RowStore::set(self, key, &value)
    }

    fn delete(&self, key: &str) -> Result<()> {
        RowStore::delete(self, key)
    }

    fn has(&self, key: &str) -> Result<bool> {
        self.contains(key)
    }

    fn keys(&self) -> Result<Vec<String>> {
        RowStore::keys(self)
    }
}

/// Which backend a target path selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Json,
    Relational,
}

impl Backend {
    /// `.sqlite`, `.sqlite3` and `.db` files are relational, anything else is
    /// a JSON document.
    pub fn for_path(path: &Path) -> Self {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());
        match ext.as_deref() {
            Some("sqlite") | Some("sqlite3") | Some("db") => Backend::Relational,
            _ => Backend::Json,
        }
    }
}

/// Either backend behind one type.
pub enum AnyBinding {
    Json(JsonStore),
    Relational(RowStore),
}

impl AnyBinding {
    pub fn backend(&self) -> Backend {
        match self {
            AnyBinding::Json(_) => Backend::Json,
            AnyBinding::Relational(_) => Backend::Relational,
        }
    }

    pub fn as_json(&self) -> Option<&JsonStore> {
        match self {
            AnyBinding::Json(store) => Some(store),
            AnyBinding::Relational(_) => None,
        }
    }

    pub fn as_relational(&self) -> Option<&RowStore> {
        match self {
            AnyBinding::Relational(store) => Some(store),
            AnyBinding::Json(_) => None,
        }
    }

    fn inner(&self) -> &dyn Binding {
        match self {
            AnyBinding::Json(store) => store,
            AnyBinding::Relational(store) => store,
        }
    }
}

impl Binding for AnyBinding {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        self.inner().get(key)
    }

    fn set(&self, key: &str, value: Value) -> Result<()> {
        self.inner().set(key, value)
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.inner().delete(key)
    }

    fn has(&self, key: &str) -> Result<bool> {
        self.inner().has(key)
    }

    fn keys(&self) -> Result<Vec<String>> {
        self.inner().keys()
    }
}

/// Open `target` with the backend its extension selects, using default
/// options.
pub fn open_binding(target: impl AsRef<Path>) -> Result<AnyBinding> {
    let target = target.as_ref();
    match Backend::for_path(target) {
        Backend::Json => Ok(AnyBinding::Json(JsonStore::open_with(
            target,
            JsonStoreOptions::default(),
        )?)),
        Backend::Relational => Ok(AnyBinding::Relational(RowStore::open_with(
            target,
            RowStoreOptions::default(),
        )?)),
    }
}

/// Accept a dynamically typed key only if it is a string.
pub fn require_key(key: &Value) -> Result<&str> {
    key.as_str()
        .ok_or_else(|| BindingError::Type(format!("keys must be strings, got {key}")))
}
