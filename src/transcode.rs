use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::cache::CacheStore;

/// Result of a coordinated transcode attempt for one cache key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranscodeOutcome {
    /// The key resolved (this request led the invocation, or waited on one
    /// that succeeded). The caller re-resolves and serves from the cache.
    Completed,
    /// The invocation failed or was skipped after a recent failure. The
    /// caller falls through to the inner service.
    Failed,
}

enum Role {
    Leader(watch::Sender<bool>),
    Waiter(watch::Receiver<bool>),
}

/// Serializes external tool invocations per cache key.
///
/// The in-flight registry guarantees at most one invocation per key at a
/// time: the first request on a miss becomes the leader, everyone else
/// clones the leader's watch receiver under the same lock and waits, so a
/// completion can never slip between the registry check and the wait.
/// Failures are negatively cached for `failure_ttl` so a broken source does
/// not trigger an invocation storm.
pub struct TranscodeCoordinator {
    tool: PathBuf,
    flags: Vec<String>,
    tool_timeout: Duration,
    failure_ttl: Duration,
    in_flight: Mutex<HashMap<String, watch::Receiver<bool>>>,
    failures: Mutex<HashMap<String, Instant>>,
}

impl TranscodeCoordinator {
    pub fn new(
        tool: PathBuf,
        flags: Vec<String>,
        tool_timeout: Duration,
        failure_ttl: Duration,
    ) -> Self {
        Self {
            tool,
            flags,
            tool_timeout,
            failure_ttl,
            in_flight: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Ensures a transcode for `key` runs exactly once under concurrent
    /// load. Returns once the key has resolved either way; callers then
    /// re-run their cache resolution.
    pub async fn transcode(
        self: &Arc<Self>,
        store: &CacheStore,
        key: &str,
        source: &Path,
        dest: &Path,
    ) -> TranscodeOutcome {
        if self.recently_failed(key) {
            debug!(key, "skipping transcode, failure cached");
            return TranscodeOutcome::Failed;
        }

        let role = {
            let mut map = self.lock_in_flight();
            match map.get(key) {
                Some(rx) => Role::Waiter(rx.clone()),
                None => {
                    let (tx, rx) = watch::channel(false);
                    map.insert(key.to_string(), rx);
                    Role::Leader(tx)
                }
            }
        };

        match role {
            Role::Waiter(mut rx) => {
                debug!(key, "joining in-flight transcode");
                if rx.changed().await.is_err() {
                    // Leader went away without cleanup; drop the entry so
                    // the next request can lead again, but only if it is
                    // still the dead one and not a new leader's.
                    let mut map = self.lock_in_flight();
                    if map.get(key).is_some_and(|entry| entry.has_changed().is_err()) {
                        map.remove(key);
                    }
                }
                if self.recently_failed(key) {
                    TranscodeOutcome::Failed
                } else {
                    TranscodeOutcome::Completed
                }
            }
            Role::Leader(tx) => {
                // A previous leader may have resolved this key between our
                // durable-tier miss and winning the registry slot.
                if store.exists(dest).await {
                    self.finish(key, tx);
                    return TranscodeOutcome::Completed;
                }

                let coordinator = Arc::clone(self);
                let owned_key = key.to_string();
                let source = source.to_path_buf();
                let dest = dest.to_path_buf();
                // The invocation is not tied to the requesting connection:
                // if the client disconnects, the task still completes and
                // populates the cache for future requests.
                let task = tokio::spawn(async move {
                    let ok = coordinator.invoke(&source, &dest).await;
                    if !ok {
                        coordinator.record_failure(&owned_key);
                        // A half-written destination must not be mistaken
                        // for a valid cache entry.
                        let _ = tokio::fs::remove_file(&dest).await;
                    }
                    coordinator.finish(&owned_key, tx);
                    ok
                });

                match task.await {
                    Ok(true) => TranscodeOutcome::Completed,
                    Ok(false) => TranscodeOutcome::Failed,
                    Err(e) => {
                        error!(key, error = %e, "transcode task failed to run");
                        TranscodeOutcome::Failed
                    }
                }
            }
        }
    }

    /// Runs `tool <source> [flags...] -o <dest>` under the configured
    /// timeout. Zero exit with a non-empty destination counts as success.
    async fn invoke(&self, source: &Path, dest: &Path) -> bool {
        debug!(
            tool = %self.tool.display(),
            source = %source.display(),
            dest = %dest.display(),
            "invoking transcode tool"
        );
        let started = Instant::now();

        let mut child = match Command::new(&self.tool)
            .arg(source)
            .args(&self.flags)
            .arg("-o")
            .arg(dest)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                error!(tool = %self.tool.display(), error = %e, "failed to spawn transcode tool");
                return false;
            }
        };

        let status = match tokio::time::timeout(self.tool_timeout, child.wait()).await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                error!(error = %e, "transcode tool did not run");
                return false;
            }
            Err(_) => {
                warn!(source = %source.display(), timeout = ?self.tool_timeout, "transcode tool timed out");
                return false;
            }
        };

        if !status.success() {
            error!(%status, source = %source.display(), "transcode tool exited with failure");
            return false;
        }

        // A clean exit that left nothing usable behind is still a failure.
        match tokio::fs::metadata(dest).await {
            Ok(meta) if meta.len() > 0 => {
                info!(dest = %dest.display(), elapsed = ?started.elapsed(), "transcoded to webp");
                true
            }
            _ => {
                error!(dest = %dest.display(), "transcode tool exited cleanly but produced no output");
                false
            }
        }
    }

    fn recently_failed(&self, key: &str) -> bool {
        let mut failures = self.lock_failures();
        match failures.get(key) {
            Some(at) if at.elapsed() < self.failure_ttl => true,
            Some(_) => {
                failures.remove(key);
                false
            }
            None => false,
        }
    }

    fn record_failure(&self, key: &str) {
        self.lock_failures().insert(key.to_string(), Instant::now());
    }

    /// Releases the registry slot and wakes all waiters.
    fn finish(&self, key: &str, tx: watch::Sender<bool>) {
        self.lock_in_flight().remove(key);
        let _ = tx.send(true);
    }

    fn lock_in_flight(&self) -> MutexGuard<'_, HashMap<String, watch::Receiver<bool>>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_failures(&self) -> MutexGuard<'_, HashMap<String, Instant>> {
        self.failures.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
