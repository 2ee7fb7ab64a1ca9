//! Durable-file helpers shared by the registry, drive state, and cache store.
//!
//! Every durable JSON file in the application is written through
//! [`atomic_write`]: the payload lands in a temp file in the same directory,
//! is fsynced, and is renamed over the target so a crash mid-write can never
//! leave a truncated file behind.

use std::fs::{self, File};
use std::io::Write;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall clock as unix milliseconds.
pub fn now_unix_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as i64)
        .unwrap_or(0)
}

/// Writes `bytes` to `path` via temp-file + fsync + rename.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> Result<(), String> {
    let parent = path
        .parent()
        .ok_or_else(|| format!("no parent directory for {}", path.display()))?;
    if !parent.exists() {
        fs::create_dir_all(parent)
            .map_err(|err| format!("failed to create {}: {err}", parent.display()))?;
    }

    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| format!("invalid file name in {}", path.display()))?;
    let temp_path = parent.join(format!(".{file_name}.tmp"));

    let mut file = File::create(&temp_path)
        .map_err(|err| format!("failed to create {}: {err}", temp_path.display()))?;
    file.write_all(bytes)
        .map_err(|err| format!("failed to write {}: {err}", temp_path.display()))?;
    file.sync_all()
        .map_err(|err| format!("failed to sync {}: {err}", temp_path.display()))?;
    drop(file);

    fs::rename(&temp_path, path).map_err(|err| {
        format!(
            "failed to rename {} over {}: {err}",
            temp_path.display(),
            path.display()
        )
    })
}

/// Serializes `value` as pretty JSON and writes it atomically.
pub fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<(), String> {
    let bytes = serde_json::to_vec_pretty(value)
        .map_err(|err| format!("failed to serialize {}: {err}", path.display()))?;
    atomic_write(path, &bytes)
}

/// Reads and deserializes a JSON file; `Ok(None)` when the file is absent.
pub fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let bytes =
        fs::read(path).map_err(|err| format!("failed to read {}: {err}", path.display()))?;
    let value = serde_json::from_slice(&bytes)
        .map_err(|err| format!("failed to parse {}: {err}", path.display()))?;
    Ok(Some(value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_atomic_write_replaces_existing_content() {
        let dir = tempfile::tempdir().expect("tempdir");
        let target = dir.path().join("state.json");

        atomic_write(&target, b"first").expect("first write");
        atomic_write(&target, b"second").expect("second write");

        let content = fs::read_to_string(&target).expect("read back");
        assert_eq!(content, "second");
        assert!(
            !dir.path().join(".state.json.tmp").exists(),
            "temp file should be renamed away"
        );
    }

    #[test]
    fn test_read_json_missing_file_is_none() {
        let dir = tempfile::tempdir().expect("tempdir");
        let missing = dir.path().join("absent.json");
        let result: Option<Vec<String>> = read_json(&missing).expect("read");
        assert!(result.is_none());
    }

    #[test]
    fn test_json_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let target = dir.path().join("values.json");
        let values = vec!["a".to_string(), "b".to_string()];

        write_json(&target, &values).expect("write");
        let restored: Option<Vec<String>> = read_json(&target).expect("read");
        assert_eq!(restored, Some(values));
    }
}
