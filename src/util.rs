//! Shared filesystem and identity helpers.

use anyhow::{Context, Result};
use fs2::FileExt;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Write `bytes` to `path` atomically: temp file in the same directory,
/// fsync, then rename over the destination.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("Path has no parent directory: {}", path.display()))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("Failed to create directory: {}", parent.display()))?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "file".to_string());
    let tmp = parent.join(format!(
        ".{}.{}.tmp",
        file_name,
        &uuid::Uuid::new_v4().simple().to_string()[..8]
    ));

    {
        let mut file = fs::File::create(&tmp)
            .with_context(|| format!("Failed to create temp file: {}", tmp.display()))?;
        file.write_all(bytes)
            .with_context(|| format!("Failed to write temp file: {}", tmp.display()))?;
        file.sync_all()
            .with_context(|| format!("Failed to sync temp file: {}", tmp.display()))?;
    }

    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(e).with_context(|| format!("Failed to move temp file to {}", path.display()));
    }
    Ok(())
}

/// Serialize `value` as pretty JSON and write it atomically.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut json = serde_json::to_string_pretty(value).context("Failed to serialize JSON")?;
    json.push('\n');
    atomic_write(path, json.as_bytes())
}

/// Read and parse a JSON file.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
}

/// Append one JSON value as a line to a newline-delimited JSON file.
pub fn append_jsonl<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut line = serde_json::to_string(value).context("Failed to serialize JSON line")?;
    line.push('\n');
    fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?
        .write_all(line.as_bytes())
        .with_context(|| format!("Failed to append to {}", path.display()))
}

/// Advisory exclusive `flock` on a guard file. Released when dropped.
#[derive(Debug)]
pub struct FileLock {
    _file: fs::File,
}

impl FileLock {
    fn open(path: &Path) -> Result<fs::File> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
        fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("Failed to open lock file {}", path.display()))
    }

    /// Block until the lock is held.
    pub fn exclusive(path: &Path) -> Result<Self> {
        let file = Self::open(path)?;
        FileExt::lock_exclusive(&file)
            .with_context(|| format!("Failed to lock {}", path.display()))?;
        Ok(Self { _file: file })
    }

    /// Take the lock if it is free; `None` when another descriptor holds it.
    pub fn try_exclusive(path: &Path) -> Result<Option<Self>> {
        let file = Self::open(path)?;
        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => Ok(Some(Self { _file: file })),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to lock {}", path.display())),
        }
    }
}

/// Best-effort host name for run attribution.
pub fn host_name() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .or_else(|| {
            fs::read_to_string("/etc/hostname")
                .ok()
                .map(|h| h.trim().to_string())
                .filter(|h| !h.is_empty())
        })
        .unwrap_or_else(|| "unknown".to_string())
}

/// Short random hex suffix for identifiers.
pub fn short_hex(len: usize) -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    hex[..len.min(hex.len())].to_string()
}

/// Resolve `raw` against `base` unless it is already absolute.
pub fn resolve_path(base: &Path, raw: &str) -> PathBuf {
    let p = PathBuf::from(raw);
    if p.is_absolute() { p } else { base.join(p) }
}

/// Render `path` relative to `base` when possible, with forward slashes.
pub fn rel_to(base: &Path, path: &Path) -> String {
    path.strip_prefix(base)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/")
}

/// Total size in bytes of a file, or of every file under a directory.
/// Missing paths count as zero.
pub fn disk_usage(path: &Path) -> u64 {
    walkdir::WalkDir::new(path)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::tempdir;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Row {
        n: u32,
    }

    #[test]
    fn atomic_write_creates_parents_and_leaves_no_temp_files() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested/deeper/file.json");
        write_json_atomic(&path, &Row { n: 7 }).unwrap();

        let back: Row = read_json(&path).unwrap();
        assert_eq!(back, Row { n: 7 });

        let leftovers: Vec<_> = fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn append_jsonl_appends_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        append_jsonl(&path, &Row { n: 1 }).unwrap();
        append_jsonl(&path, &Row { n: 2 }).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        let rows: Vec<Row> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(rows, vec![Row { n: 1 }, Row { n: 2 }]);
    }

    #[test]
    fn resolve_and_rel_paths() {
        let base = Path::new("/project");
        assert_eq!(resolve_path(base, "a/b.md"), PathBuf::from("/project/a/b.md"));
        assert_eq!(resolve_path(base, "/abs/c.md"), PathBuf::from("/abs/c.md"));
        assert_eq!(rel_to(base, Path::new("/project/a/b.md")), "a/b.md");
        assert_eq!(rel_to(base, Path::new("/elsewhere/x")), "/elsewhere/x");
    }

    #[test]
    fn try_exclusive_reports_a_held_lock() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.lock");
        let held = FileLock::exclusive(&path).unwrap();
        assert!(FileLock::try_exclusive(&path).unwrap().is_none());
        drop(held);
        assert!(FileLock::try_exclusive(&path).unwrap().is_some());
    }

    #[test]
    fn short_hex_has_requested_length() {
        assert_eq!(short_hex(6).len(), 6);
        assert!(short_hex(6).chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn disk_usage_sums_files_and_ignores_missing_paths() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("d/e")).unwrap();
        fs::write(dir.path().join("d/a.txt"), "12345").unwrap();
        fs::write(dir.path().join("d/e/b.txt"), "678").unwrap();

        assert_eq!(disk_usage(&dir.path().join("d")), 8);
        assert_eq!(disk_usage(&dir.path().join("d/a.txt")), 5);
        assert_eq!(disk_usage(&dir.path().join("nope")), 0);
    }
}
