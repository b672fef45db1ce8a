use super::{LockEntry, LockMode, LockRequest, LockTable, normalize_path};
use crate::errors::OrchestratorError;
use crate::util::{FileLock, host_name, read_json, write_json_atomic};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Grants held by one holder after a successful `acquire`.
#[derive(Debug, Clone, PartialEq)]
pub struct LockSet {
    pub holder: String,
    pub grants: Vec<LockRequest>,
}

impl LockSet {
    /// Paths granted in `mode`.
    pub fn paths_in(&self, mode: LockMode) -> impl Iterator<Item = &str> {
        self.grants
            .iter()
            .filter(move |g| g.mode == mode)
            .map(|g| g.path.as_str())
    }
}

/// File-backed lock table shared by every orchestrator process on the host.
#[derive(Debug, Clone)]
pub struct LockManager {
    project_dir: PathBuf,
    table_path: PathBuf,
    guard_path: PathBuf,
    wait: Duration,
    os_permissions: bool,
}

impl LockManager {
    pub fn new(project_dir: &Path, state_dir: &Path) -> Self {
        Self {
            project_dir: project_dir.to_path_buf(),
            table_path: state_dir.join("locks.json"),
            guard_path: state_dir.join("locks.lock"),
            wait: Duration::ZERO,
            os_permissions: false,
        }
    }

    /// How long `acquire` keeps retrying a conflicting request.
    pub fn with_wait(mut self, wait: Duration) -> Self {
        self.wait = wait;
        self
    }

    /// Back read-only grants with OS permission bits while they are held.
    pub fn with_os_permissions(mut self, enabled: bool) -> Self {
        self.os_permissions = enabled;
        self
    }

    pub fn table_path(&self) -> &Path {
        &self.table_path
    }

    pub fn project_dir(&self) -> &Path {
        &self.project_dir
    }

    /// Run `f` against the table while holding the flock guard. The table
    /// is rewritten only when `f` reports it dirty.
    fn with_table<T>(
        &self,
        f: impl FnOnce(&mut LockTable) -> Result<(T, bool), OrchestratorError>,
    ) -> Result<T, OrchestratorError> {
        let _guard = FileLock::exclusive(&self.guard_path)?;

        let mut table = self.load_table()?;
        let (value, dirty) = f(&mut table)?;
        if dirty {
            write_json_atomic(&self.table_path, &table)?;
        }
        Ok(value)
    }

    fn load_table(&self) -> Result<LockTable, OrchestratorError> {
        if !self.table_path.exists() {
            return Ok(LockTable::default());
        }
        Ok(read_json(&self.table_path)?)
    }

    /// Current contents of the lock table.
    pub fn snapshot(&self) -> Result<LockTable, OrchestratorError> {
        self.with_table(|table| Ok((table.clone(), false)))
    }

    /// Acquire every requested grant or none of them, without waiting.
    pub fn try_acquire(
        &self,
        holder: &str,
        requests: &[LockRequest],
    ) -> Result<LockSet, OrchestratorError> {
        let grants = self.normalize_requests(requests)?;

        self.with_table(|table| {
            let reaped = reap_dead_holders(table);

            for grant in grants.iter().filter(|g| g.mode != LockMode::Unrestricted) {
                if let Some(existing) = table
                    .foreign_grants(&grant.path, holder)
                    .find(|e| conflicts(grant.mode, e.mode))
                {
                    debug!(
                        path = %grant.path,
                        requested = %grant.mode,
                        holder = %existing.holder,
                        "Lock request conflicts with live grant"
                    );
                    return Err(OrchestratorError::LockConflict {
                        path: grant.path.clone(),
                        holder: existing.holder.clone(),
                    });
                }
            }

            let now = chrono::Utc::now();
            let host = host_name();
            let pid = std::process::id();
            let mut added = false;
            for grant in grants.iter().filter(|g| g.mode != LockMode::Unrestricted) {
                let already = table
                    .entries
                    .iter()
                    .any(|e| e.holder == holder && e.path == grant.path && e.mode == grant.mode);
                if !already {
                    table.entries.push(LockEntry {
                        path: grant.path.clone(),
                        mode: grant.mode,
                        holder: holder.to_string(),
                        acquired_at: now,
                        host: host.clone(),
                        pid,
                    });
                    added = true;
                }
            }

            Ok((
                LockSet {
                    holder: holder.to_string(),
                    grants: grants.clone(),
                },
                added || reaped,
            ))
        })
    }

    /// Acquire the requested grants and wrap them in a guard that releases
    /// on drop. Retries conflicts until the configured wait elapses.
    pub async fn acquire(
        &self,
        holder: &str,
        requests: &[LockRequest],
    ) -> Result<LockGuard, OrchestratorError> {
        let deadline = tokio::time::Instant::now() + self.wait;
        let mut backoff = Duration::from_millis(50);

        loop {
            match self.try_acquire(holder, requests) {
                Ok(set) => return Ok(self.guard(set)),
                Err(OrchestratorError::LockConflict { path, holder: other })
                    if tokio::time::Instant::now() + backoff <= deadline =>
                {
                    debug!(%path, holder = %other, wait_ms = backoff.as_millis() as u64, "Waiting for lock");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(Duration::from_secs(2));
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn guard(&self, set: LockSet) -> LockGuard {
        let restore = if self.os_permissions {
            self.protect_read_only(&set)
        } else {
            Vec::new()
        };
        info!(
            holder = %set.holder,
            grants = set.grants.len(),
            "Locks acquired"
        );
        LockGuard {
            manager: self.clone(),
            set,
            restore,
            released: false,
        }
    }

    /// Release the grants in `set`. Releasing grants that are already gone
    /// is a no-op.
    pub fn release(&self, set: &LockSet) -> Result<(), OrchestratorError> {
        self.with_table(|table| {
            let before = table.entries.len();
            table.entries.retain(|e| {
                !(e.holder == set.holder && set.grants.iter().any(|g| g.path == e.path))
            });
            Ok(((), table.entries.len() != before))
        })
    }

    /// Drop every grant held by `holder`. Returns how many were removed.
    pub fn release_holder(&self, holder: &str) -> Result<usize, OrchestratorError> {
        self.with_table(|table| {
            let before = table.entries.len();
            table.entries.retain(|e| e.holder != holder);
            let removed = before - table.entries.len();
            Ok((removed, removed > 0))
        })
    }

    fn normalize_requests(
        &self,
        requests: &[LockRequest],
    ) -> Result<Vec<LockRequest>, OrchestratorError> {
        let mut grants: Vec<LockRequest> = Vec::new();
        for request in requests {
            let path = normalize_path(&self.project_dir, &request.path);
            if path.is_empty() {
                return Err(OrchestratorError::validation(format!(
                    "Lock path '{}' does not name a resource",
                    request.path
                )));
            }
            match grants.iter_mut().find(|g| g.path == path) {
                Some(existing) => existing.mode = stronger(existing.mode, request.mode),
                None => grants.push(LockRequest::new(path, request.mode)),
            }
        }
        Ok(grants)
    }

    fn protect_read_only(&self, set: &LockSet) -> Vec<(PathBuf, fs::Permissions)> {
        let mut restore = Vec::new();
        for path in set.paths_in(LockMode::ReadOnly) {
            let root = crate::util::resolve_path(&self.project_dir, path);
            for entry in walkdir::WalkDir::new(&root)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
            {
                let file = entry.path();
                let Ok(meta) = fs::metadata(file) else {
                    continue;
                };
                let original = meta.permissions();
                if original.readonly() {
                    continue;
                }
                let mut locked = original.clone();
                locked.set_readonly(true);
                match fs::set_permissions(file, locked) {
                    Ok(()) => restore.push((file.to_path_buf(), original)),
                    Err(e) => warn!(path = %file.display(), error = %e, "Could not mark file read-only"),
                }
            }
        }
        restore
    }
}

/// Whether a new grant in `requested` mode conflicts with a live grant in
/// `held` mode on an overlapping path owned by someone else.
fn conflicts(requested: LockMode, held: LockMode) -> bool {
    match (requested, held) {
        (LockMode::Unrestricted, _) | (_, LockMode::Unrestricted) => false,
        (LockMode::ExclusiveWrite, _) => true,
        (LockMode::ReadOnly, LockMode::ExclusiveWrite) => true,
        (LockMode::ReadOnly, LockMode::ReadOnly) => false,
    }
}

fn stronger(a: LockMode, b: LockMode) -> LockMode {
    fn rank(m: LockMode) -> u8 {
        match m {
            LockMode::Unrestricted => 0,
            LockMode::ReadOnly => 1,
            LockMode::ExclusiveWrite => 2,
        }
    }
    if rank(b) > rank(a) { b } else { a }
}

/// Remove grants whose holder process on this host no longer exists.
fn reap_dead_holders(table: &mut LockTable) -> bool {
    let host = host_name();
    let before = table.entries.len();
    table.entries.retain(|e| {
        let dead = e.host == host && e.pid != std::process::id() && !process_alive(e.pid);
        if dead {
            warn!(holder = %e.holder, path = %e.path, pid = e.pid, "Reaping lock held by dead process");
        }
        !dead
    });
    table.entries.len() != before
}

#[cfg(target_os = "linux")]
fn process_alive(pid: u32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}

#[cfg(not(target_os = "linux"))]
fn process_alive(_pid: u32) -> bool {
    true
}

/// Live grants for one phase. Dropping the guard releases them, so an
/// early return or panic in the phase body cannot leak a lock.
#[derive(Debug)]
pub struct LockGuard {
    manager: LockManager,
    set: LockSet,
    restore: Vec<(PathBuf, fs::Permissions)>,
    released: bool,
}

impl LockGuard {
    pub fn lock_set(&self) -> &LockSet {
        &self.set
    }

    pub fn holder(&self) -> &str {
        &self.set.holder
    }

    /// Release now and surface any error instead of logging it.
    pub fn release(mut self) -> Result<(), OrchestratorError> {
        self.release_inner()
    }

    fn release_inner(&mut self) -> Result<(), OrchestratorError> {
        if self.released {
            return Ok(());
        }

        for (path, permissions) in self.restore.drain(..) {
            if let Err(e) = fs::set_permissions(&path, permissions) {
                warn!(path = %path.display(), error = %e, "Could not restore file permissions");
            }
        }
        // Stays unreleased on error so drop tries again.
        self.manager.release(&self.set)?;
        self.released = true;
        info!(holder = %self.set.holder, "Locks released");
        Ok(())
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = self.release_inner() {
            warn!(holder = %self.set.holder, error = %e, "Failed to release locks");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use tempfile::tempdir;

    fn manager(dir: &Path) -> LockManager {
        LockManager::new(dir, &dir.join(".orchestrate"))
    }

    #[test]
    fn exclusive_request_conflicts_with_foreign_holder() {
        let dir = tempdir().unwrap();
        let locks = manager(dir.path());

        let first = locks
            .try_acquire("run-a", &[LockRequest::exclusive("spec.md")])
            .unwrap();
        let err = locks
            .try_acquire("run-b", &[LockRequest::exclusive("./spec.md")])
            .unwrap_err();
        match err {
            OrchestratorError::LockConflict { path, holder } => {
                assert_eq!(path, "spec.md");
                assert_eq!(holder, "run-a");
            }
            other => panic!("expected LockConflict, got {other:?}"),
        }

        locks.release(&first).unwrap();
        locks
            .try_acquire("run-b", &[LockRequest::exclusive("spec.md")])
            .unwrap();
    }

    #[test]
    fn acquire_is_all_or_nothing() {
        let dir = tempdir().unwrap();
        let locks = manager(dir.path());
        locks
            .try_acquire("run-a", &[LockRequest::exclusive("lean")])
            .unwrap();

        let result = locks.try_acquire(
            "run-b",
            &[
                LockRequest::exclusive("notes.md"),
                LockRequest::read_only("lean/Main.lean"),
            ],
        );
        assert!(result.is_err());

        let table = locks.snapshot().unwrap();
        assert!(table.held_by("run-b").next().is_none());
        assert_eq!(table.entries.len(), 1);
    }

    #[test]
    fn read_only_grants_share_but_block_writers() {
        let dir = tempdir().unwrap();
        let locks = manager(dir.path());
        locks
            .try_acquire("run-a", &[LockRequest::read_only("tests")])
            .unwrap();
        locks
            .try_acquire("run-b", &[LockRequest::read_only("tests")])
            .unwrap();
        assert!(
            locks
                .try_acquire("run-c", &[LockRequest::exclusive("tests/unit.rs")])
                .is_err()
        );
    }

    #[test]
    fn unrestricted_requests_never_conflict_or_persist() {
        let dir = tempdir().unwrap();
        let locks = manager(dir.path());
        locks
            .try_acquire("run-a", &[LockRequest::exclusive("spec.md")])
            .unwrap();
        let set = locks
            .try_acquire(
                "run-b",
                &[LockRequest::new("spec.md", LockMode::Unrestricted)],
            )
            .unwrap();
        assert_eq!(set.grants.len(), 1);
        assert!(locks.snapshot().unwrap().held_by("run-b").next().is_none());
    }

    #[test]
    fn release_is_idempotent() {
        let dir = tempdir().unwrap();
        let locks = manager(dir.path());
        let set = locks
            .try_acquire("run-a", &[LockRequest::exclusive("spec.md")])
            .unwrap();
        locks.release(&set).unwrap();
        locks.release(&set).unwrap();
        assert!(locks.snapshot().unwrap().entries.is_empty());
    }

    #[test]
    fn duplicate_paths_keep_the_strongest_mode() {
        let dir = tempdir().unwrap();
        let locks = manager(dir.path());
        let set = locks
            .try_acquire(
                "run-a",
                &[
                    LockRequest::read_only("spec.md"),
                    LockRequest::exclusive("spec.md"),
                ],
            )
            .unwrap();
        assert_eq!(set.grants, vec![LockRequest::exclusive("spec.md")]);
    }

    #[test]
    fn release_holder_clears_crashed_grants() {
        let dir = tempdir().unwrap();
        let locks = manager(dir.path());
        locks
            .try_acquire(
                "crashed",
                &[
                    LockRequest::exclusive("a.md"),
                    LockRequest::read_only("b.md"),
                ],
            )
            .unwrap();
        assert_eq!(locks.release_holder("crashed").unwrap(), 2);
        assert_eq!(locks.release_holder("crashed").unwrap(), 0);
    }

    #[tokio::test]
    async fn guard_releases_on_drop() {
        let dir = tempdir().unwrap();
        let locks = manager(dir.path());
        {
            let _guard = locks
                .acquire("run-a", &[LockRequest::exclusive("spec.md")])
                .await
                .unwrap();
            assert_eq!(locks.snapshot().unwrap().entries.len(), 1);
        }
        assert!(locks.snapshot().unwrap().entries.is_empty());
    }

    #[tokio::test]
    async fn failed_release_is_retried_on_drop() {
        let dir = tempdir().unwrap();
        let locks = manager(dir.path());
        let mut guard = locks
            .acquire("run-a", &[LockRequest::exclusive("spec.md")])
            .await
            .unwrap();

        // an unreadable table makes the first release fail
        let table = fs::read_to_string(locks.table_path()).unwrap();
        fs::remove_file(locks.table_path()).unwrap();
        fs::create_dir(locks.table_path()).unwrap();
        assert!(guard.release_inner().is_err());

        fs::remove_dir(locks.table_path()).unwrap();
        fs::write(locks.table_path(), table).unwrap();
        assert_eq!(locks.snapshot().unwrap().entries.len(), 1);
        drop(guard);
        assert!(locks.snapshot().unwrap().entries.is_empty());
    }

    #[tokio::test]
    async fn acquire_waits_for_release_within_budget() {
        let dir = tempdir().unwrap();
        let locks = manager(dir.path()).with_wait(Duration::from_secs(5));
        let first = locks
            .try_acquire("run-a", &[LockRequest::exclusive("spec.md")])
            .unwrap();

        let releaser = locks.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            releaser.release(&first).unwrap();
        });

        let guard = locks
            .acquire("run-b", &[LockRequest::exclusive("spec.md")])
            .await
            .unwrap();
        assert_eq!(guard.holder(), "run-b");
        handle.await.unwrap();
    }

    #[test]
    fn concurrent_overlapping_exclusive_requests_admit_exactly_one() {
        let dir = tempdir().unwrap();
        let locks = manager(dir.path());
        let barrier = Arc::new(Barrier::new(2));

        let handles: Vec<_> = ["run-a", "run-b"]
            .into_iter()
            .map(|holder| {
                let locks = locks.clone();
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    locks.try_acquire(holder, &[LockRequest::exclusive("spec.md")])
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let granted = results.iter().filter(|r| r.is_ok()).count();
        let conflicts = results
            .iter()
            .filter(|r| matches!(r, Err(OrchestratorError::LockConflict { .. })))
            .count();
        assert_eq!(granted, 1);
        assert_eq!(conflicts, 1);
    }

    #[test]
    fn disjoint_acquire_release_pairs_leave_an_empty_table() {
        let dir = tempdir().unwrap();
        let locks = manager(dir.path());

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let locks = locks.clone();
                std::thread::spawn(move || {
                    for round in 0..5 {
                        let holder = format!("run-{i}-{round}");
                        let set = locks
                            .try_acquire(&holder, &[LockRequest::exclusive(format!("file-{i}.md"))])
                            .unwrap();
                        locks.release(&set).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert!(locks.snapshot().unwrap().entries.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn os_permissions_are_applied_and_restored() {
        let dir = tempdir().unwrap();
        let spec = dir.path().join("spec.md");
        fs::write(&spec, "# spec").unwrap();
        let locks = manager(dir.path()).with_os_permissions(true);

        let guard = locks
            .acquire("run-a", &[LockRequest::read_only("spec.md")])
            .await
            .unwrap();
        assert!(fs::metadata(&spec).unwrap().permissions().readonly());
        guard.release().unwrap();
        assert!(!fs::metadata(&spec).unwrap().permissions().readonly());
    }

    #[test]
    fn conflict_matrix() {
        use LockMode::*;
        assert!(conflicts(ExclusiveWrite, ExclusiveWrite));
        assert!(conflicts(ExclusiveWrite, ReadOnly));
        assert!(conflicts(ReadOnly, ExclusiveWrite));
        assert!(!conflicts(ReadOnly, ReadOnly));
        assert!(!conflicts(Unrestricted, ExclusiveWrite));
    }
}
