//! In-memory script registry shared by the executor, loader, and reindexer.
//!
//! Read-mostly: request handling takes read locks; the loader and reindexer
//! write under exclusive access.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::script::{Backend, MigrationScript, MigrationTarget};

#[derive(Default)]
struct RegistryInner {
    /// Scripts in registration order.
    scripts: Vec<MigrationScript>,
    /// {version, name, backend, connection} -> index into `scripts`.
    index: HashMap<(String, String, Backend, String), usize>,
}

/// Process-wide index of loaded migration scripts.
///
/// Owned by the application object and passed to the executor at
/// construction; there is no implicit global.
#[derive(Default)]
pub struct ScriptRegistry {
    inner: RwLock<RegistryInner>,
}

impl ScriptRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent upsert keyed by {version, name, backend, connection}.
    /// Re-registering overwrites the stored script (reload).
    pub fn register(&self, script: MigrationScript) {
        let mut inner = self.inner.write();
        let key = script.key();
        match inner.index.get(&key) {
            Some(&pos) => inner.scripts[pos] = script,
            None => {
                let pos = inner.scripts.len();
                inner.scripts.push(script);
                inner.index.insert(key, pos);
            }
        }
    }

    /// Replace the whole corpus in one exclusive write (reindex path).
    pub fn replace_all(&self, scripts: Vec<MigrationScript>) {
        let mut inner = self.inner.write();
        inner.index = scripts
            .iter()
            .enumerate()
            .map(|(pos, s)| (s.key(), pos))
            .collect();
        inner.scripts = scripts;
    }

    /// Scripts matching the target filter, in registration order.
    /// Empty target fields match all; the executor re-sorts.
    pub fn find_by_target(&self, target: &MigrationTarget) -> Vec<MigrationScript> {
        self.inner
            .read()
            .scripts
            .iter()
            .filter(|s| target.matches(s))
            .cloned()
            .collect()
    }

    /// Every registered script, in registration order.
    pub fn get_all(&self) -> Vec<MigrationScript> {
        self.inner.read().scripts.clone()
    }

    pub fn get_by_connection(&self, connection: &str) -> Vec<MigrationScript> {
        self.inner
            .read()
            .scripts
            .iter()
            .filter(|s| s.connection == connection)
            .cloned()
            .collect()
    }

    pub fn get_by_backend(&self, backend: Backend) -> Vec<MigrationScript> {
        self.inner
            .read()
            .scripts
            .iter()
            .filter(|s| s.backend == backend)
            .cloned()
            .collect()
    }

    /// First script with this name, if any.
    pub fn get_by_name(&self, name: &str) -> Option<MigrationScript> {
        self.inner
            .read()
            .scripts
            .iter()
            .find(|s| s.name == name)
            .cloned()
    }

    /// First script with this version, if any.
    pub fn get_by_version(&self, version: &str) -> Option<MigrationScript> {
        self.inner
            .read()
            .scripts
            .iter()
            .find(|s| s.version == version)
            .cloned()
    }

    pub fn get_by_connection_and_version(
        &self,
        connection: &str,
        version: &str,
    ) -> Option<MigrationScript> {
        self.inner
            .read()
            .scripts
            .iter()
            .find(|s| s.connection == connection && s.version == version)
            .cloned()
    }

    /// Script whose canonical migration-id equals `migration_id`.
    pub fn get_by_migration_id(&self, migration_id: &str) -> Option<MigrationScript> {
        self.inner
            .read()
            .scripts
            .iter()
            .find(|s| s.migration_id() == migration_id)
            .cloned()
    }

    /// Snapshot keyed by migration-id, for the reindexer.
    pub fn snapshot(&self) -> HashMap<String, MigrationScript> {
        self.inner
            .read()
            .scripts
            .iter()
            .map(|s| (s.migration_id(), s.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().scripts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().scripts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn script(version: &str, name: &str, backend: Backend, connection: &str) -> MigrationScript {
        MigrationScript {
            version: version.to_string(),
            name: name.to_string(),
            backend,
            connection: connection.to_string(),
            schema: String::new(),
            up_payload: format!("CREATE TABLE {} (id INT);", name),
            down_payload: format!("DROP TABLE {};", name),
            up_filename: String::new(),
            down_filename: String::new(),
            dependencies: vec![],
            structured_dependencies: vec![],
            checksum: 0,
        }
    }

    #[test]
    fn test_register_and_get_all_preserves_order() {
        let registry = ScriptRegistry::new();
        registry.register(script("20250102000000", "b", Backend::Postgresql, "main"));
        registry.register(script("20250101000000", "a", Backend::Postgresql, "main"));
        let all = registry.get_all();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].name, "b");
        assert_eq!(all[1].name, "a");
    }

    #[test]
    fn test_register_is_idempotent_upsert() {
        let registry = ScriptRegistry::new();
        let mut s = script("20250101000000", "a", Backend::Postgresql, "main");
        registry.register(s.clone());
        s.up_payload = "CREATE TABLE a_v2 (id INT);".to_string();
        registry.register(s);
        assert_eq!(registry.len(), 1);
        assert!(registry.get_all()[0].up_payload.contains("a_v2"));
    }

    #[test]
    fn test_find_by_target_empty_matches_all() {
        let registry = ScriptRegistry::new();
        registry.register(script("20250101000000", "a", Backend::Postgresql, "main"));
        registry.register(script("20250102000000", "b", Backend::Etcd, "kv"));
        let found = registry.find_by_target(&MigrationTarget::default());
        assert_eq!(found.len(), 2);
    }

    #[test]
    fn test_find_by_target_filters() {
        let registry = ScriptRegistry::new();
        registry.register(script("20250101000000", "a", Backend::Postgresql, "main"));
        registry.register(script("20250102000000", "b", Backend::Etcd, "kv"));
        let found = registry.find_by_target(&MigrationTarget {
            backend: Some(Backend::Etcd),
            ..Default::default()
        });
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "b");
    }

    #[test]
    fn test_secondary_lookups() {
        let registry = ScriptRegistry::new();
        registry.register(script("20250101000000", "a", Backend::Postgresql, "main"));
        registry.register(script("20250102000000", "b", Backend::Greptimedb, "metrics"));

        assert_eq!(registry.get_by_connection("metrics").len(), 1);
        assert_eq!(registry.get_by_backend(Backend::Postgresql).len(), 1);
        assert_eq!(registry.get_by_name("a").unwrap().version, "20250101000000");
        assert_eq!(registry.get_by_version("20250102000000").unwrap().name, "b");
        assert!(registry
            .get_by_connection_and_version("main", "20250101000000")
            .is_some());
        assert!(registry
            .get_by_connection_and_version("main", "20250102000000")
            .is_none());
    }

    #[test]
    fn test_get_by_migration_id() {
        let registry = ScriptRegistry::new();
        registry.register(script("20250101000000", "a", Backend::Postgresql, "main"));
        let found = registry.get_by_migration_id("20250101000000_a_postgresql_main");
        assert!(found.is_some());
        assert!(registry.get_by_migration_id("20250101000000_z_postgresql_main").is_none());
    }

    #[test]
    fn test_replace_all_rebuilds_index() {
        let registry = ScriptRegistry::new();
        registry.register(script("20250101000000", "a", Backend::Postgresql, "main"));
        registry.replace_all(vec![script("20250103000000", "c", Backend::Etcd, "kv")]);
        assert_eq!(registry.len(), 1);
        assert!(registry.get_by_name("a").is_none());
        assert!(registry.get_by_name("c").is_some());
    }
}
