//! State directory and backend settings bootstrap
//!
//! Before the backend starts, its settings file must list the loopback addresses as
//! trusted proxies so it honours the forwarding headers added on tunnel requests.
//! Existing settings are merged, never replaced: a file that can't be read or parsed
//! aborts startup instead of being overwritten.

use crate::config::StateConfig;
use serde_json::{Map, Value};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error("failed to create state directory {}: {source}", path.display())]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read settings file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("settings file {} is not valid JSON: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("settings file {} must contain a JSON object", path.display())]
    NotAnObject { path: PathBuf },

    #[error("settings key '{key}' must be {expected}")]
    Conflict { key: String, expected: &'static str },

    #[error("failed to write settings file {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// What the bootstrap did to the settings file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapOutcome {
    Created,
    Updated { added: usize },
    Unchanged,
}

/// Ensure the state directory and settings file exist and declare the trusted proxies
pub fn ensure_settings(state: &StateConfig) -> Result<BootstrapOutcome, BootstrapError> {
    let dir = state.state_dir();
    std::fs::create_dir_all(&dir).map_err(|source| BootstrapError::CreateDir {
        path: dir.clone(),
        source,
    })?;

    let path = state.settings_path();
    let existing = read_settings(&path)?;
    let created = existing.is_none();
    let mut doc = existing.unwrap_or_else(|| Value::Object(Map::new()));

    let added = merge_trusted_proxies(&mut doc, &state.trusted_proxies_key, &state.trusted_proxies)?;

    let outcome = match (created, added) {
        (true, _) => BootstrapOutcome::Created,
        (false, 0) => BootstrapOutcome::Unchanged,
        (false, added) => BootstrapOutcome::Updated { added },
    };

    if outcome == BootstrapOutcome::Unchanged {
        debug!(path = %path.display(), "Settings already declare trusted proxies");
    } else {
        write_settings(&dir, &path, &doc)?;
        info!(
            path = %path.display(),
            key = %state.trusted_proxies_key,
            ?outcome,
            "Settings file bootstrapped"
        );
    }

    Ok(outcome)
}

/// Read the settings file. `Ok(None)` means it does not exist yet.
fn read_settings(path: &Path) -> Result<Option<Value>, BootstrapError> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(BootstrapError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    // An empty file holds no settings worth protecting
    if content.trim().is_empty() {
        return Ok(Some(Value::Object(Map::new())));
    }

    let doc: Value = serde_json::from_str(&content).map_err(|source| BootstrapError::Parse {
        path: path.to_path_buf(),
        source,
    })?;

    if !doc.is_object() {
        return Err(BootstrapError::NotAnObject {
            path: path.to_path_buf(),
        });
    }

    Ok(Some(doc))
}

/// Write via a temp file in the same directory so a crash never leaves a torn file
fn write_settings(dir: &Path, path: &Path, doc: &Value) -> Result<(), BootstrapError> {
    let write_err = |source: std::io::Error| BootstrapError::Write {
        path: path.to_path_buf(),
        source,
    };

    let mut content = serde_json::to_string_pretty(doc)
        .map_err(|e| write_err(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;
    content.push('\n');

    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(write_err)?;
    tmp.write_all(content.as_bytes()).map_err(write_err)?;
    tmp.as_file().sync_all().map_err(write_err)?;
    tmp.persist(path).map_err(|e| write_err(e.error))?;
    Ok(())
}

/// Merge `proxies` into the array at dotted `key`, creating intermediate objects.
///
/// Returns how many entries were added. Entries already present are left alone, and
/// so is every other key in the document.
pub fn merge_trusted_proxies(
    doc: &mut Value,
    key: &str,
    proxies: &[String],
) -> Result<usize, BootstrapError> {
    let segments: Vec<&str> = key.split('.').collect();
    let (last, parents) = segments
        .split_last()
        .ok_or_else(|| BootstrapError::Conflict {
            key: key.to_string(),
            expected: "a non-empty path",
        })?;

    let mut current = doc;
    for (depth, segment) in parents.iter().enumerate() {
        let object = current.as_object_mut().ok_or_else(|| BootstrapError::Conflict {
            key: segments[..depth].join("."),
            expected: "an object",
        })?;
        current = object
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }

    let object = current.as_object_mut().ok_or_else(|| BootstrapError::Conflict {
        key: parents.join("."),
        expected: "an object",
    })?;
    let list = object
        .entry(last.to_string())
        .or_insert_with(|| Value::Array(Vec::new()))
        .as_array_mut()
        .ok_or_else(|| BootstrapError::Conflict {
            key: key.to_string(),
            expected: "an array",
        })?;

    let mut added = 0;
    for proxy in proxies {
        if !list.iter().any(|v| v.as_str() == Some(proxy.as_str())) {
            list.push(Value::String(proxy.clone()));
            added += 1;
        }
    }

    Ok(added)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn state_in(dir: &Path) -> StateConfig {
        StateConfig {
            dir: Some(dir.join("state").to_string_lossy().into_owned()),
            ..StateConfig::default()
        }
    }

    fn proxies() -> Vec<String> {
        vec!["127.0.0.1".to_string(), "::1".to_string()]
    }

    #[test]
    fn test_merge_into_empty_document() {
        let mut doc = json!({});
        let added = merge_trusted_proxies(&mut doc, "gateway.trustedProxies", &proxies()).unwrap();
        assert_eq!(added, 2);
        assert_eq!(doc, json!({"gateway": {"trustedProxies": ["127.0.0.1", "::1"]}}));
    }

    #[test]
    fn test_merge_preserves_other_settings() {
        let mut doc = json!({
            "gateway": {"mode": "local", "trustedProxies": ["10.0.0.1", "127.0.0.1"]},
            "theme": "dark"
        });
        let added = merge_trusted_proxies(&mut doc, "gateway.trustedProxies", &proxies()).unwrap();
        assert_eq!(added, 1);
        assert_eq!(doc["gateway"]["mode"], "local");
        assert_eq!(doc["theme"], "dark");
        assert_eq!(
            doc["gateway"]["trustedProxies"],
            json!(["10.0.0.1", "127.0.0.1", "::1"])
        );
    }

    #[test]
    fn test_merge_is_idempotent() {
        let mut doc = json!({});
        merge_trusted_proxies(&mut doc, "trustedProxies", &proxies()).unwrap();
        let added = merge_trusted_proxies(&mut doc, "trustedProxies", &proxies()).unwrap();
        assert_eq!(added, 0);
        assert_eq!(doc["trustedProxies"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_merge_conflicting_types() {
        let mut doc = json!({"gateway": "not an object"});
        let err = merge_trusted_proxies(&mut doc, "gateway.trustedProxies", &proxies()).unwrap_err();
        assert!(matches!(err, BootstrapError::Conflict { expected: "an object", .. }));

        let mut doc = json!({"gateway": {"trustedProxies": "127.0.0.1"}});
        let err = merge_trusted_proxies(&mut doc, "gateway.trustedProxies", &proxies()).unwrap_err();
        assert!(matches!(err, BootstrapError::Conflict { expected: "an array", .. }));
    }

    #[test]
    fn test_creates_directory_and_file() {
        let tmp = tempfile::tempdir().unwrap();
        let state = state_in(tmp.path());

        assert_eq!(ensure_settings(&state).unwrap(), BootstrapOutcome::Created);

        let content = std::fs::read_to_string(state.settings_path()).unwrap();
        let doc: Value = serde_json::from_str(&content).unwrap();
        assert_eq!(doc["gateway"]["trustedProxies"], json!(["127.0.0.1", "::1"]));
    }

    #[test]
    fn test_second_run_unchanged() {
        let tmp = tempfile::tempdir().unwrap();
        let state = state_in(tmp.path());

        ensure_settings(&state).unwrap();
        let before = std::fs::read_to_string(state.settings_path()).unwrap();
        assert_eq!(ensure_settings(&state).unwrap(), BootstrapOutcome::Unchanged);
        let after = std::fs::read_to_string(state.settings_path()).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_existing_file_is_merged() {
        let tmp = tempfile::tempdir().unwrap();
        let state = state_in(tmp.path());
        std::fs::create_dir_all(state.state_dir()).unwrap();
        std::fs::write(state.settings_path(), r#"{"agent": {"model": "x"}}"#).unwrap();

        assert_eq!(
            ensure_settings(&state).unwrap(),
            BootstrapOutcome::Updated { added: 2 }
        );

        let doc: Value =
            serde_json::from_str(&std::fs::read_to_string(state.settings_path()).unwrap()).unwrap();
        assert_eq!(doc["agent"]["model"], "x");
        assert_eq!(doc["gateway"]["trustedProxies"], json!(["127.0.0.1", "::1"]));
    }

    #[test]
    fn test_invalid_json_is_fatal_and_untouched() {
        let tmp = tempfile::tempdir().unwrap();
        let state = state_in(tmp.path());
        std::fs::create_dir_all(state.state_dir()).unwrap();
        std::fs::write(state.settings_path(), "{ not json").unwrap();

        let err = ensure_settings(&state).unwrap_err();
        assert!(matches!(err, BootstrapError::Parse { .. }));
        assert_eq!(
            std::fs::read_to_string(state.settings_path()).unwrap(),
            "{ not json"
        );
    }

    #[test]
    fn test_non_object_root_is_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        let state = state_in(tmp.path());
        std::fs::create_dir_all(state.state_dir()).unwrap();
        std::fs::write(state.settings_path(), "[1, 2]").unwrap();

        let err = ensure_settings(&state).unwrap_err();
        assert!(matches!(err, BootstrapError::NotAnObject { .. }));
    }

    #[test]
    fn test_uncreatable_directory_is_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        let blocker = tmp.path().join("file");
        std::fs::write(&blocker, "x").unwrap();
        let state = StateConfig {
            dir: Some(blocker.join("state").to_string_lossy().into_owned()),
            ..StateConfig::default()
        };

        let err = ensure_settings(&state).unwrap_err();
        assert!(matches!(err, BootstrapError::CreateDir { .. }));
    }
}
