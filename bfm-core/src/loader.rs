//! Script corpus loading: scans a directory tree for paired
//! `{version}_{name}.up.{sql|json}` / `{version}_{name}.down.{sql|json}`
//! files, parses their header directives, and registers the results.
//!
//! The watcher re-scans on filesystem events and seeds pending
//! `migrations_list` rows for anything it finds.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use regex_lite::Regex;

use crate::directive::parse_directives;
use crate::error::{BfmError, Result};
use crate::registry::ScriptRegistry;
use crate::script::{validate_version, MigrationScript};
use crate::tracker::StateTracker;

/// Regex over script filenames. Captures: version, name, direction, extension.
fn script_file_re() -> Regex {
    Regex::new(r"^([0-9]{10,20})_([A-Za-z][A-Za-z0-9_]*)\.(up|down)\.(sql|json)$")
        .expect("script filename regex")
}

#[derive(Default)]
struct ScriptPair {
    up: Option<PathBuf>,
    down: Option<PathBuf>,
}

/// Recursively collect candidate files under `root`.
///
/// Filesystem errors are logged and the offending entry skipped; a missing
/// root yields an empty corpus.
fn collect_files(root: &Path, out: &mut Vec<PathBuf>) {
    let entries = match std::fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) => {
            log::warn!("Skipping unreadable directory {}: {}", root.display(), e);
            return;
        }
    };
    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                log::warn!("Skipping unreadable entry under {}: {}", root.display(), e);
                continue;
            }
        };
        let path = entry.path();
        if path.is_dir() {
            collect_files(&path, out);
        } else {
            out.push(path);
        }
    }
}

/// Scan `root` for script pairs and parse them into registry entities.
///
/// Entries that fail to parse are logged and skipped. A missing down file is
/// acceptable; the script simply cannot be rolled back.
pub fn scan_scripts(root: &Path) -> Result<Vec<MigrationScript>> {
    let re = script_file_re();

    let mut files = Vec::new();
    if root.exists() {
        collect_files(root, &mut files);
    } else {
        log::warn!("Script root {} does not exist", root.display());
    }

    // BTreeMap keyed by (version, name) gives deterministic scan order.
    let mut pairs: BTreeMap<(String, String), ScriptPair> = BTreeMap::new();
    for path in files {
        let Some(filename) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Some(caps) = re.captures(filename) else {
            continue;
        };
        let key = (caps[1].to_string(), caps[2].to_string());
        let pair = pairs.entry(key).or_default();
        match &caps[3] {
            "up" => pair.up = Some(path.clone()),
            _ => pair.down = Some(path.clone()),
        }
    }

    let mut scripts = Vec::new();
    for ((version, name), pair) in pairs {
        let Some(up_path) = pair.up else {
            log::warn!(
                "Skipping {}_{}: down script without a matching up script",
                version,
                name
            );
            continue;
        };
        match load_pair(&version, &name, &up_path, pair.down.as_deref()) {
            Ok(script) => scripts.push(script),
            Err(e) => {
                log::warn!("Skipping {}: {}", up_path.display(), e);
            }
        }
    }

    log::info!(
        "Scanned script corpus; root={}, scripts={}",
        root.display(),
        scripts.len()
    );
    Ok(scripts)
}

fn load_pair(
    version: &str,
    name: &str,
    up_path: &Path,
    down_path: Option<&Path>,
) -> Result<MigrationScript> {
    validate_version(version)?;

    let up_payload = std::fs::read_to_string(up_path)?;
    let down_payload = match down_path {
        Some(path) => std::fs::read_to_string(path)?,
        None => String::new(),
    };

    let directives = parse_directives(&up_payload)?;
    let backend = directives
        .backend
        .as_deref()
        .ok_or_else(|| {
            BfmError::ScriptParseError(format!(
                "{}: missing 'bfm:backend' directive",
                up_path.display()
            ))
        })?
        .parse()?;
    let connection = directives.connection.clone().ok_or_else(|| {
        BfmError::ScriptParseError(format!(
            "{}: missing 'bfm:connection' directive",
            up_path.display()
        ))
    })?;

    let checksum = MigrationScript::compute_checksum(&up_payload, &down_payload);
    Ok(MigrationScript {
        version: version.to_string(),
        name: name.to_string(),
        backend,
        connection,
        schema: directives.schema.unwrap_or_default(),
        up_payload,
        down_payload,
        up_filename: up_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string(),
        down_filename: down_path
            .and_then(|p| p.file_name())
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string(),
        dependencies: directives.depends,
        structured_dependencies: directives.requires,
        checksum,
    })
}

/// Scan `root` and register everything found, returning the scripts.
pub fn load_into(root: &Path, registry: &ScriptRegistry) -> Result<Vec<MigrationScript>> {
    let scripts = scan_scripts(root)?;
    for script in &scripts {
        registry.register(script.clone());
    }
    Ok(scripts)
}

/// Handle keeping the filesystem watcher alive.
///
/// Dropping it stops both the notify watcher and the rescan task.
pub struct ScriptWatcher {
    _watcher: RecommendedWatcher,
    task: tokio::task::JoinHandle<()>,
}

impl Drop for ScriptWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Watch `root` for changes; on each event burst, rescan the corpus,
/// re-register every script, and seed pending list rows.
pub fn watch(
    root: PathBuf,
    registry: Arc<ScriptRegistry>,
    tracker: Arc<StateTracker>,
) -> Result<ScriptWatcher> {
    let (tx, mut rx) = tokio::sync::mpsc::channel::<()>(16);

    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        match res {
            Ok(_) => {
                // Coalesce: a full rescan covers any event kind.
                let _ = tx.blocking_send(());
            }
            Err(e) => log::warn!("Watcher event error: {}", e),
        }
    })?;
    watcher.watch(&root, RecursiveMode::Recursive)?;
    log::info!("Watching script corpus; root={}", root.display());

    let task = tokio::spawn(async move {
        while rx.recv().await.is_some() {
            // Debounce event bursts (editor saves touch several files).
            tokio::time::sleep(std::time::Duration::from_millis(500)).await;
            while rx.try_recv().is_ok() {}

            let scripts = match scan_scripts(&root) {
                Ok(scripts) => scripts,
                Err(e) => {
                    log::error!("Rescan after filesystem event failed: {}", e);
                    continue;
                }
            };
            for script in &scripts {
                registry.register(script.clone());
                if let Err(e) = tracker
                    .register_scanned_migration(
                        &script.migration_id(),
                        &script.schema,
                        &script.version,
                        &script.name,
                        &script.connection,
                        script.backend,
                    )
                    .await
                {
                    log::warn!(
                        "Failed to seed list row; migration_id={}, error={}",
                        script.migration_id(),
                        e
                    );
                }
            }
            log::info!("Rescanned corpus after change; scripts={}", scripts.len());
        }
    });

    Ok(ScriptWatcher {
        _watcher: watcher,
        task,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::Backend;

    fn write(dir: &Path, name: &str, content: &str) {
        std::fs::write(dir.join(name), content).unwrap();
    }

    #[test]
    fn test_filename_regex() {
        let re = script_file_re();
        let caps = re.captures("20250101000000_add_users.up.sql").unwrap();
        assert_eq!(&caps[1], "20250101000000");
        assert_eq!(&caps[2], "add_users");
        assert_eq!(&caps[3], "up");
        assert_eq!(&caps[4], "sql");

        assert!(re.captures("20250101000000_seed_flags.down.json").is_some());
        assert!(re.captures("V1__add_users.sql").is_none());
        assert!(re.captures("20250101000000_add_users.sql").is_none());
        assert!(re.captures("123_add_users.up.sql").is_none());
    }

    #[test]
    fn test_scan_pairs_up_and_down() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "20250101000000_add_users.up.sql",
            "-- bfm:backend postgresql\n-- bfm:connection main\nCREATE TABLE users (id INT);",
        );
        write(
            dir.path(),
            "20250101000000_add_users.down.sql",
            "DROP TABLE users;",
        );

        let scripts = scan_scripts(dir.path()).unwrap();
        assert_eq!(scripts.len(), 1);
        let s = &scripts[0];
        assert_eq!(s.backend, Backend::Postgresql);
        assert_eq!(s.connection, "main");
        assert!(s.has_down());
        assert_eq!(s.up_filename, "20250101000000_add_users.up.sql");
        assert_ne!(s.checksum, 0);
    }

    #[test]
    fn test_scan_missing_down_disables_rollback() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "20250101000000_add_users.up.sql",
            "-- bfm:backend postgresql\n-- bfm:connection main\nCREATE TABLE users (id INT);",
        );
        let scripts = scan_scripts(dir.path()).unwrap();
        assert_eq!(scripts.len(), 1);
        assert!(!scripts[0].has_down());
        assert!(scripts[0].down_filename.is_empty());
    }

    #[test]
    fn test_scan_skips_missing_directives() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "20250101000000_orphan.up.sql",
            "CREATE TABLE orphan (id INT);",
        );
        let scripts = scan_scripts(dir.path()).unwrap();
        assert!(scripts.is_empty());
    }

    #[test]
    fn test_scan_recurses_into_subdirectories() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("kv");
        std::fs::create_dir(&sub).unwrap();
        write(
            &sub,
            "20250102000000_seed_flags.up.json",
            "// bfm:backend etcd\n// bfm:connection kv\n[{\"op\":\"put\",\"key\":\"flags/on\",\"value\":\"true\"}]",
        );
        let scripts = scan_scripts(dir.path()).unwrap();
        assert_eq!(scripts.len(), 1);
        assert_eq!(scripts[0].backend, Backend::Etcd);
    }

    #[test]
    fn test_scan_missing_root_is_empty() {
        let scripts = scan_scripts(Path::new("/nonexistent/bfm_scripts")).unwrap();
        assert!(scripts.is_empty());
    }

    #[test]
    fn test_load_into_registers() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "20250101000000_add_users.up.sql",
            "-- bfm:backend postgresql\n-- bfm:connection main\nCREATE TABLE users (id INT);",
        );
        let registry = ScriptRegistry::new();
        let scripts = load_into(dir.path(), &registry).unwrap();
        assert_eq!(scripts.len(), 1);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_scan_order_is_by_version_then_name() {
        let dir = tempfile::tempdir().unwrap();
        for (file, payload) in [
            (
                "20250103000000_c.up.sql",
                "-- bfm:backend postgresql\n-- bfm:connection main\nSELECT 3;",
            ),
            (
                "20250101000000_a.up.sql",
                "-- bfm:backend postgresql\n-- bfm:connection main\nSELECT 1;",
            ),
            (
                "20250102000000_b.up.sql",
                "-- bfm:backend postgresql\n-- bfm:connection main\nSELECT 2;",
            ),
        ] {
            write(dir.path(), file, payload);
        }
        let scripts = scan_scripts(dir.path()).unwrap();
        let names: Vec<&str> = scripts.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }
}
