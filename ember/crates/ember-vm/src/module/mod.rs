//! Module records and the VM-scoped registry.
//!
//! A module is a single `.ember` file (or a directory with a
//! `package.ember` entry point), keyed in the registry by its canonical
//! path so two spellings of the same file share one record. The status
//! field is the loading state machine: `Loading` is what the circular-
//! import check observes, and a record never moves backwards from
//! `Loaded`.

pub mod resolver;

use std::path::PathBuf;
use std::sync::Arc;

use ember_compile::Function;
use indexmap::IndexMap;

use crate::value::ObjRef;

/// Maximum modules per VM.
pub const MAX_MODULES: usize = 64;

/// Loading state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModuleStatus {
    /// Body currently executing; re-import means a cycle.
    Loading,
    /// Fully loaded; exports are final.
    Loaded,
    /// Load failed; stays failed for the VM's lifetime.
    Failed,
}

/// One module's metadata.
#[derive(Debug)]
pub struct ModuleRecord {
    /// The name it was imported as.
    pub name: String,
    /// Canonical absolute path.
    pub path: PathBuf,
    /// Loading state.
    pub status: ModuleStatus,
    /// The export map object (lives on the owning VM's heap).
    pub exports: ObjRef,
    /// Compiled module body.
    pub chunk: Option<Arc<Function>>,
    /// Canonical keys of modules this one imported.
    pub deps: Vec<String>,
}

impl ModuleRecord {
    /// A fresh record in `Loading` state.
    pub fn loading(name: &str, path: PathBuf, exports: ObjRef) -> Self {
        Self {
            name: name.to_string(),
            path,
            status: ModuleStatus::Loading,
            exports,
            chunk: None,
            deps: Vec::new(),
        }
    }
}

/// The VM-scoped module registry, keyed by canonical path.
#[derive(Debug, Default)]
pub struct ModuleRegistry {
    records: IndexMap<String, ModuleRecord>,
}

impl ModuleRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Looks up a record by canonical key.
    pub fn get(&self, key: &str) -> Option<&ModuleRecord> {
        self.records.get(key)
    }

    /// Looks up a record mutably.
    pub fn get_mut(&mut self, key: &str) -> Option<&mut ModuleRecord> {
        self.records.get_mut(key)
    }

    /// Inserts a new record, enforcing the per-VM capacity.
    pub fn insert(&mut self, key: String, record: ModuleRecord) -> Result<(), String> {
        if self.records.len() >= MAX_MODULES {
            return Err(format!(
                "module capacity exceeded ({MAX_MODULES} modules per interpreter)"
            ));
        }
        self.records.insert(key, record);
        Ok(())
    }

    /// Updates a record's status.
    ///
    /// `Loaded` is final: a loaded module never transitions back.
    pub fn set_status(&mut self, key: &str, status: ModuleStatus) {
        if let Some(record) = self.records.get_mut(key) {
            if record.status != ModuleStatus::Loaded {
                record.status = status;
            }
        }
    }

    /// Attaches the compiled body.
    pub fn set_chunk(&mut self, key: &str, chunk: Arc<Function>) {
        if let Some(record) = self.records.get_mut(key) {
            record.chunk = Some(chunk);
        }
    }

    /// Iterates records in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &ModuleRecord> {
        self.records.values()
    }

    /// Finds a record by the name it was imported as (diagnostics and
    /// tests; canonical-path lookup is the primary index).
    pub fn find_by_name(&self, name: &str) -> Option<&ModuleRecord> {
        self.records.values().find(|record| record.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str) -> ModuleRecord {
        ModuleRecord::loading(name, PathBuf::from(format!("/tmp/{name}.ember")), ObjRef(0))
    }

    #[test]
    fn test_loaded_is_final() {
        let mut registry = ModuleRegistry::new();
        registry.insert("a".to_string(), record("a")).unwrap();
        registry.set_status("a", ModuleStatus::Loaded);
        registry.set_status("a", ModuleStatus::Loading);
        assert_eq!(registry.get("a").unwrap().status, ModuleStatus::Loaded);
        registry.set_status("a", ModuleStatus::Failed);
        assert_eq!(registry.get("a").unwrap().status, ModuleStatus::Loaded);
    }

    #[test]
    fn test_capacity_enforced() {
        let mut registry = ModuleRegistry::new();
        for i in 0..MAX_MODULES {
            registry.insert(format!("m{i}"), record(&format!("m{i}"))).unwrap();
        }
        assert!(registry.insert("overflow".to_string(), record("overflow")).is_err());
    }

    #[test]
    fn test_find_by_name() {
        let mut registry = ModuleRegistry::new();
        registry.insert("/abs/util.ember".to_string(), record("util")).unwrap();
        assert!(registry.find_by_name("util").is_some());
        assert!(registry.find_by_name("missing").is_none());
    }
}
