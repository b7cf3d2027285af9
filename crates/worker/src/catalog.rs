//! Process-wide concurrent catalog registry.
//!
//! Contract:
//! - registration is an atomic insert-if-absent, so exactly one of N
//!   concurrent registrations under the same name succeeds;
//! - lookups and name snapshots never take a registry-wide lock.

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use quarry_common::{QuarryError, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Stable handle identifying one registration of a catalog.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CatalogHandle(
    /// Raw handle value.
    pub String,
);

#[derive(Debug, Clone)]
/// A registered catalog: a named connector instance plus its properties.
pub struct Catalog {
    name: String,
    handle: CatalogHandle,
    connector_name: String,
    properties: BTreeMap<String, String>,
}

impl Catalog {
    /// Create a catalog entry for `connector_name` registered as `name`.
    pub fn new(
        name: impl Into<String>,
        connector_name: impl Into<String>,
        properties: BTreeMap<String, String>,
    ) -> Self {
        let name = name.into();
        let connector_name = connector_name.into();
        let handle = CatalogHandle(format!("{name}:{connector_name}"));
        Self {
            name,
            handle,
            connector_name,
            properties,
        }
    }

    /// Registered catalog name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Handle identifying this registration.
    pub fn handle(&self) -> &CatalogHandle {
        &self.handle
    }

    /// Connector backing the catalog.
    pub fn connector_name(&self) -> &str {
        &self.connector_name
    }

    /// Connector configuration properties.
    pub fn properties(&self) -> &BTreeMap<String, String> {
        &self.properties
    }
}

/// Concurrent name-to-catalog mapping shared by the worker process.
#[derive(Debug, Default)]
pub struct CatalogRegistry {
    catalogs: DashMap<String, Arc<Catalog>>,
}

impl CatalogRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            catalogs: DashMap::new(),
        }
    }

    /// Register `catalog` under its name; fails if the name is taken.
    pub fn register(&self, catalog: Arc<Catalog>) -> Result<()> {
        match self.catalogs.entry(catalog.name().to_string()) {
            Entry::Occupied(_) => Err(QuarryError::InvalidState(format!(
                "catalog '{}' is already registered",
                catalog.name()
            ))),
            Entry::Vacant(slot) => {
                info!(catalog = %catalog.name(), connector = %catalog.connector_name(), "registered catalog");
                slot.insert(catalog);
                Ok(())
            }
        }
    }

    /// Remove the catalog registered as `name`, returning its handle.
    pub fn remove(&self, name: &str) -> Option<CatalogHandle> {
        self.catalogs
            .remove(name)
            .map(|(_, catalog)| catalog.handle().clone())
    }

    /// Snapshot of registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.catalogs.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Look up the catalog registered as `name`.
    pub fn get(&self, name: &str) -> Option<Arc<Catalog>> {
        self.catalogs.get(name).map(|e| Arc::clone(e.value()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog(name: &str) -> Arc<Catalog> {
        Arc::new(Catalog::new(name, "parquet", BTreeMap::new()))
    }

    #[test]
    fn register_rejects_duplicate_names() {
        let registry = CatalogRegistry::new();
        registry.register(catalog("sales")).expect("first register");
        let err = registry.register(catalog("sales")).expect_err("duplicate");
        assert!(matches!(err, QuarryError::InvalidState(_)));
    }

    #[test]
    fn concurrent_registration_succeeds_exactly_once() {
        let registry = Arc::new(CatalogRegistry::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let registry = Arc::clone(&registry);
            handles.push(std::thread::spawn(move || {
                registry.register(catalog("events")).is_ok()
            }));
        }
        let successes = handles
            .into_iter()
            .map(|h| h.join().expect("register thread"))
            .filter(|ok| *ok)
            .count();
        assert_eq!(successes, 1);
        assert_eq!(registry.names(), vec!["events".to_string()]);
    }

    #[test]
    fn remove_returns_handle_and_frees_name() {
        let registry = CatalogRegistry::new();
        registry.register(catalog("sales")).expect("register");

        let handle = registry.remove("sales").expect("removed");
        assert_eq!(handle, CatalogHandle("sales:parquet".to_string()));
        assert!(registry.remove("sales").is_none());
        registry.register(catalog("sales")).expect("name reusable");
    }

    #[test]
    fn names_snapshot_is_sorted() {
        let registry = CatalogRegistry::new();
        registry.register(catalog("b")).expect("register b");
        registry.register(catalog("a")).expect("register a");
        registry.register(catalog("c")).expect("register c");
        assert_eq!(registry.names(), vec!["a", "b", "c"]);
        assert_eq!(registry.get("a").expect("lookup").connector_name(), "parquet");
    }
}
