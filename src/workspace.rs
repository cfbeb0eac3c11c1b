//! Per-request workspace: identity, deadline, and sandbox lifecycle.
//!
//! Every request owns exactly one [`Sandbox`], a directory named after
//! the request id under the configured sandbox root. Extracted inputs and
//! converter outputs never leave it. The sandbox is removed when the
//! [`RequestContext`] finishes or is dropped, so early returns, panics
//! and a dropped conversion future all end with the directory gone.
//!
//! ```text
//! <sandbox_root>/docbatch_<request-id>/
//!   ├── inputs/    extracted documents (unique-prefixed base names)
//!   └── outputs/   converter results
//! ```

use crate::config::BatchConfig;
use crate::error::BatchError;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

const INPUTS_DIR: &str = "inputs";
const OUTPUTS_DIR: &str = "outputs";

// ── Deadline ─────────────────────────────────────────────────────────────

/// An absolute deadline paired with a cancellation token.
///
/// Expired means either the instant has passed or the token was
/// cancelled. Workers poll [`Deadline::is_expired`] between jobs; adapters
/// race their work against [`Deadline::expired`].
#[derive(Debug, Clone)]
pub struct Deadline {
    at: Instant,
    token: CancellationToken,
}

impl Deadline {
    pub fn new(at: Instant, token: CancellationToken) -> Self {
        Self { at, token }
    }

    /// A deadline `timeout` from now.
    pub fn after(timeout: Duration, token: CancellationToken) -> Self {
        Self::new(Instant::now() + timeout, token)
    }

    pub fn at(&self) -> Instant {
        self.at
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Cancel this deadline (and every deadline derived from it).
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn is_expired(&self) -> bool {
        self.token.is_cancelled() || Instant::now() >= self.at
    }

    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    /// Resolves once the deadline passes or the token is cancelled.
    pub async fn expired(&self) {
        tokio::select! {
            _ = self.token.cancelled() => {}
            _ = tokio::time::sleep_until(self.at) => {}
        }
    }

    /// Derive a job deadline: `timeout` from now, never later than `self`.
    ///
    /// Cancelling the child leaves the parent untouched.
    pub fn child(&self, timeout: Duration) -> Deadline {
        let at = (Instant::now() + timeout).min(self.at);
        Deadline::new(at, self.token.child_token())
    }
}

// ── Sandbox ──────────────────────────────────────────────────────────────

/// The per-request temporary directory.
#[derive(Debug)]
pub struct Sandbox {
    path: PathBuf,
    dir: Option<Arc<TempDir>>,
}

/// Keeps a sandbox directory on disk while blocking work writes into it.
///
/// If the sandbox is cleaned up while a lease is held, removal happens
/// when the last lease is dropped instead, so a blocking task can never
/// outlive the directory it is writing to.
#[derive(Debug, Clone)]
pub struct SandboxLease {
    _dir: Arc<TempDir>,
}

impl Sandbox {
    /// Create `<root>/docbatch_<id>` with `inputs/` and `outputs/` inside.
    ///
    /// Fails if the directory already exists: a sandbox is never reused.
    pub fn create(root: &Path, request_id: Uuid) -> Result<Self, BatchError> {
        let sandbox_err = |source| BatchError::Sandbox {
            root: root.to_path_buf(),
            source,
        };

        std::fs::create_dir_all(root).map_err(sandbox_err)?;
        let prefix = format!("docbatch_{}", request_id.simple());
        let dir = tempfile::Builder::new()
            .prefix(&prefix)
            .rand_bytes(0)
            .tempdir_in(root)
            .map_err(sandbox_err)?;

        // Resolve symlinked roots (e.g. /tmp on macOS) so containment checks
        // compare real paths.
        let path = dir.path().canonicalize().map_err(sandbox_err)?;
        for sub in [INPUTS_DIR, OUTPUTS_DIR] {
            std::fs::create_dir(path.join(sub)).map_err(sandbox_err)?;
        }

        debug!(request_id = %request_id, sandbox = %path.display(), "Sandbox created");
        Ok(Self {
            path,
            dir: Some(Arc::new(dir)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn inputs_dir(&self) -> PathBuf {
        self.path.join(INPUTS_DIR)
    }

    pub fn outputs_dir(&self) -> PathBuf {
        self.path.join(OUTPUTS_DIR)
    }

    /// Whether the sandbox directory is still on disk.
    pub fn is_active(&self) -> bool {
        self.dir.is_some() && self.path.exists()
    }

    /// Pin the directory for work running outside the request's future.
    ///
    /// `None` once the sandbox has been cleaned up.
    pub fn lease(&self) -> Option<SandboxLease> {
        if !self.is_active() {
            return None;
        }
        self.dir.as_ref().map(|dir| SandboxLease {
            _dir: Arc::clone(dir),
        })
    }

    /// Remove the sandbox and everything in it.
    ///
    /// Single best-effort pass. Failures are logged, never returned.
    /// Calling it again is a no-op. Returns whether the directory is gone;
    /// `false` also when a [`SandboxLease`] defers the removal.
    pub fn cleanup(&mut self) -> bool {
        let Some(dir) = self.dir.take() else {
            return true;
        };
        let dir = match Arc::try_unwrap(dir) {
            Ok(dir) => dir,
            Err(_leased) => {
                debug!(sandbox = %self.path.display(), "Sandbox still leased; last lease removes it");
                return false;
            }
        };
        match dir.close() {
            Ok(()) => {
                debug!(sandbox = %self.path.display(), "Sandbox removed");
                true
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(sandbox = %self.path.display(), "Sandbox already removed");
                true
            }
            Err(e) => {
                warn!(sandbox = %self.path.display(), error = %e, "Sandbox cleanup failed");
                false
            }
        }
    }

    /// Move the directory into a new handle, leaving `self` inert.
    fn detach(&mut self) -> Sandbox {
        Sandbox {
            path: self.path.clone(),
            dir: self.dir.take(),
        }
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        self.cleanup();
    }
}

// ── RequestContext ───────────────────────────────────────────────────────

/// Identity, deadline and sandbox of one conversion request.
///
/// Owned by the request's processing flow; never shared between requests.
#[derive(Debug)]
pub struct RequestContext {
    id: Uuid,
    deadline: Deadline,
    sandbox: Sandbox,
    started: std::time::Instant,
}

impl RequestContext {
    /// Start a request: create its sandbox and arm its deadline.
    ///
    /// `cancel` lets the caller abort the request from outside; the
    /// request deadline is derived from a child of it.
    pub fn create(
        id: Uuid,
        config: &BatchConfig,
        cancel: &CancellationToken,
    ) -> Result<Self, BatchError> {
        let sandbox = Sandbox::create(&config.sandbox_root, id)?;
        Ok(Self {
            id,
            deadline: Deadline::after(config.request_timeout, cancel.child_token()),
            sandbox,
            started: std::time::Instant::now(),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn deadline(&self) -> &Deadline {
        &self.deadline
    }

    pub fn sandbox(&self) -> &Sandbox {
        &self.sandbox
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    /// End the request: stop any remaining work and remove the sandbox.
    ///
    /// The removal runs on the blocking pool. If this future is dropped
    /// first, the blocking task still finishes it.
    pub async fn finish(mut self) {
        self.deadline.cancel();
        let mut sandbox = self.sandbox.detach();
        if let Err(e) = tokio::task::spawn_blocking(move || sandbox.cleanup()).await {
            warn!(request_id = %self.id, error = %e, "Sandbox cleanup task failed");
        }
    }
}

impl Drop for RequestContext {
    fn drop(&mut self) {
        self.deadline.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sandbox_is_named_after_request() {
        let root = tempfile::tempdir().unwrap();
        let id = Uuid::new_v4();
        let sandbox = Sandbox::create(root.path(), id).unwrap();

        let name = sandbox.path().file_name().unwrap().to_string_lossy().into_owned();
        assert_eq!(name, format!("docbatch_{}", id.simple()));
        assert!(sandbox.inputs_dir().is_dir());
        assert!(sandbox.outputs_dir().is_dir());
    }

    #[test]
    fn sandbox_is_never_reused() {
        let root = tempfile::tempdir().unwrap();
        let id = Uuid::new_v4();
        let _first = Sandbox::create(root.path(), id).unwrap();
        let second = Sandbox::create(root.path(), id);
        assert!(matches!(second, Err(BatchError::Sandbox { .. })));
    }

    #[test]
    fn cleanup_is_idempotent() {
        let root = tempfile::tempdir().unwrap();
        let mut sandbox = Sandbox::create(root.path(), Uuid::new_v4()).unwrap();
        std::fs::write(sandbox.inputs_dir().join("a.norg"), b"* heading").unwrap();
        let path = sandbox.path().to_path_buf();

        assert!(sandbox.cleanup());
        assert!(!path.exists());
        assert!(sandbox.cleanup());
        assert!(!sandbox.is_active());
    }

    #[test]
    fn cleanup_tolerates_external_removal() {
        let root = tempfile::tempdir().unwrap();
        let mut sandbox = Sandbox::create(root.path(), Uuid::new_v4()).unwrap();
        std::fs::remove_dir_all(sandbox.path()).unwrap();
        assert!(sandbox.cleanup());
    }

    #[test]
    fn lease_defers_removal_until_released() {
        let root = tempfile::tempdir().unwrap();
        let mut sandbox = Sandbox::create(root.path(), Uuid::new_v4()).unwrap();
        let path = sandbox.path().to_path_buf();
        let lease = sandbox.lease().unwrap();

        assert!(!sandbox.cleanup(), "removal must wait for the lease");
        assert!(path.join(INPUTS_DIR).is_dir());
        assert!(sandbox.lease().is_none());

        drop(lease);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn finish_removes_sandbox_off_the_runtime() {
        let root = tempfile::tempdir().unwrap();
        let config = BatchConfig::builder()
            .sandbox_root(root.path())
            .build()
            .unwrap();
        let ctx = RequestContext::create(Uuid::new_v4(), &config, &CancellationToken::new()).unwrap();
        let path = ctx.sandbox().path().to_path_buf();
        std::fs::write(ctx.sandbox().inputs_dir().join("a.norg"), b"* a").unwrap();

        ctx.finish().await;
        assert!(!path.exists());
    }

    #[test]
    fn dropping_context_removes_sandbox() {
        let root = tempfile::tempdir().unwrap();
        let config = BatchConfig::builder()
            .sandbox_root(root.path())
            .build()
            .unwrap();
        let token = CancellationToken::new();
        let ctx = RequestContext::create(Uuid::new_v4(), &config, &token).unwrap();
        let path = ctx.sandbox().path().to_path_buf();
        let deadline = ctx.deadline().clone();
        assert!(path.exists());

        drop(ctx);
        assert!(!path.exists());
        assert!(deadline.is_cancelled());
        assert!(!token.is_cancelled(), "parent token must stay live");
    }

    #[tokio::test]
    async fn child_deadline_is_clipped_to_parent() {
        let parent = Deadline::after(Duration::from_millis(50), CancellationToken::new());
        let child = parent.child(Duration::from_secs(60));
        assert!(child.at() <= parent.at());

        child.cancel();
        assert!(child.is_expired());
        assert!(!parent.is_cancelled());
    }

    #[tokio::test]
    async fn deadline_expires_on_time() {
        let deadline = Deadline::after(Duration::from_millis(20), CancellationToken::new());
        assert!(!deadline.is_expired());
        deadline.expired().await;
        assert!(deadline.is_expired());
        assert_eq!(deadline.remaining(), Duration::ZERO);
    }

    #[tokio::test]
    async fn expired_wakes_on_cancel() {
        let deadline = Deadline::after(Duration::from_secs(60), CancellationToken::new());
        let mut expired = tokio_test::task::spawn(deadline.expired());
        tokio_test::assert_pending!(expired.poll());

        deadline.cancel();
        assert!(expired.is_woken());
        tokio_test::assert_ready!(expired.poll());
    }

    #[tokio::test]
    async fn parent_cancellation_reaches_child() {
        let parent = Deadline::after(Duration::from_secs(60), CancellationToken::new());
        let child = parent.child(Duration::from_secs(60));
        parent.cancel();
        tokio::time::timeout(Duration::from_secs(1), child.expired())
            .await
            .expect("child must observe parent cancellation");
    }
}
