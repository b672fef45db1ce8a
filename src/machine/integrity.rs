//! Post-phase checks: read-only content digests and the timeout sync hook.

use crate::util::{rel_to, resolve_path};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// SHA-256 of every file under the given paths, keyed by project-relative
/// path. Unreadable files hash as empty so a permission change alone is
/// not reported as a modification.
pub fn digest_paths<'a>(
    project_dir: &Path,
    paths: impl IntoIterator<Item = &'a str>,
) -> BTreeMap<String, String> {
    let mut digests = BTreeMap::new();
    for raw in paths {
        let root = resolve_path(project_dir, raw);
        for entry in walkdir::WalkDir::new(&root)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
        {
            let bytes = std::fs::read(entry.path()).unwrap_or_default();
            let digest = format!("{:x}", Sha256::digest(&bytes));
            digests.insert(rel_to(project_dir, entry.path()), digest);
        }
    }
    digests
}

/// First path that was added, removed, or changed between two digests.
pub fn first_change(
    before: &BTreeMap<String, String>,
    after: &BTreeMap<String, String>,
) -> Option<String> {
    before
        .iter()
        .find(|(path, digest)| after.get(*path) != Some(*digest))
        .map(|(path, _)| path.clone())
        .or_else(|| after.keys().find(|p| !before.contains_key(*p)).cloned())
}

/// Best-effort artifact sync after the watchdog fired. Failures are logged
/// and never change the phase outcome.
pub async fn run_sync_command(command: &str, working_dir: &Path, run_dir: &Path, timeout: Duration) {
    info!(command, run_dir = %run_dir.display(), "Running artifact sync before teardown");

    let child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(working_dir)
        .env("ORCHESTRATE_RUN_DIR", run_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn();

    let child = match child {
        Ok(child) => child,
        Err(e) => {
            warn!(command, error = %e, "Failed to spawn sync command");
            return;
        }
    };

    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) if output.status.success() => debug!(command, "Sync command finished"),
        Ok(Ok(output)) => warn!(
            command,
            exit_code = output.status.code().unwrap_or(-1),
            stderr = %String::from_utf8_lossy(&output.stderr).trim(),
            "Sync command failed"
        ),
        Ok(Err(e)) => warn!(command, error = %e, "Sync command could not be awaited"),
        Err(_) => warn!(command, timeout_secs = timeout.as_secs(), "Sync command timed out"),
    }
}
