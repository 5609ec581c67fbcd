//! Per-container reload serialization.
//!
//! At most one reload executes per container at a time; requests arriving
//! during an in-flight reload collapse to a single follow-up. Failed
//! reloads retry with 1 s, 4 s, 16 s backoff before the container enters
//! `Failed`, which suppresses synchronizer-driven reloads until a
//! user-initiated start/stop clears it.

use async_trait::async_trait;
use net_servers_core::error::{CoreError, CoreResult, ErrorKind};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

const RETRY_BACKOFF: [Duration; 3] = [
    Duration::from_secs(1),
    Duration::from_secs(4),
    Duration::from_secs(16),
];

/// Seam to the container runtime's `exec` verb, kept narrow so the
/// coordinator is testable without a runtime daemon.
#[async_trait]
pub trait GracefulExec: Send + Sync + 'static {
    async fn exec(&self, container: &str, command: &[String]) -> CoreResult<()>;
}

/// A graceful reload of one container.
#[derive(Debug, Clone)]
pub struct ReloadRequest {
    pub container: String,
    pub command: Vec<String>,
    /// Full service reload as opposed to a cheap table rebuild. When
    /// requests collapse, full wins.
    pub full: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Idle,
    Reloading,
    Failed,
}

#[derive(Default)]
struct Entry {
    state: Option<ContainerState>,
    pending: Option<ReloadRequest>,
    worker_running: bool,
}

pub struct ReloadCoordinator {
    exec: Arc<dyn GracefulExec>,
    containers: Arc<Mutex<HashMap<String, Entry>>>,
    backoff: Vec<Duration>,
}

impl ReloadCoordinator {
    #[must_use]
    pub fn new(exec: Arc<dyn GracefulExec>) -> Self {
        Self {
            exec,
            containers: Arc::new(Mutex::new(HashMap::new())),
            backoff: RETRY_BACKOFF.to_vec(),
        }
    }

    /// Shrink the retry backoff, for tests.
    #[must_use]
    pub fn with_backoff(mut self, backoff: Vec<Duration>) -> Self {
        self.backoff = backoff;
        self
    }

    #[must_use]
    pub async fn state(&self, container: &str) -> ContainerState {
        self.containers
            .lock()
            .await
            .get(container)
            .and_then(|e| e.state)
            .unwrap_or(ContainerState::Idle)
    }

    /// Clear a `Failed` container so automatic reloads resume. Called on
    /// user-initiated start/stop.
    pub async fn clear(&self, container: &str) {
        let mut containers = self.containers.lock().await;
        if let Some(entry) = containers.get_mut(container) {
            if entry.state == Some(ContainerState::Failed) {
                entry.state = Some(ContainerState::Idle);
                info!(container, "cleared failed reload state");
            }
        }
    }

    /// Enqueue a reload. Returns false when the request was suppressed
    /// because the container is in `Failed`.
    pub async fn request(&self, request: ReloadRequest) -> bool {
        let container = request.container.clone();
        let mut containers = self.containers.lock().await;
        let entry = containers.entry(container.clone()).or_default();

        if entry.state == Some(ContainerState::Failed) {
            warn!(container, "suppressing reload for failed container");
            return false;
        }

        // Collapse: keep at most one pending request, full beats tables.
        entry.pending = match entry.pending.take() {
            Some(prev) if prev.full && !request.full => Some(prev),
            _ => Some(request),
        };

        if !entry.worker_running {
            entry.worker_running = true;
            let exec = self.exec.clone();
            let containers = self.containers.clone();
            let backoff = self.backoff.clone();
            tokio::spawn(worker(container, exec, containers, backoff));
        }
        true
    }

    /// Wait until no reload is in flight or queued for `container`.
    pub async fn quiesce(&self, container: &str) {
        loop {
            {
                let containers = self.containers.lock().await;
                match containers.get(container) {
                    Some(entry) if entry.worker_running => {}
                    _ => return,
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

async fn worker(
    container: String,
    exec: Arc<dyn GracefulExec>,
    containers: Arc<Mutex<HashMap<String, Entry>>>,
    backoff: Vec<Duration>,
) {
    loop {
        let request = {
            let mut map = containers.lock().await;
            let entry = map.entry(container.clone()).or_default();
            match entry.pending.take() {
                Some(request) => {
                    entry.state = Some(ContainerState::Reloading);
                    request
                }
                None => {
                    entry.worker_running = false;
                    if entry.state == Some(ContainerState::Reloading) {
                        entry.state = Some(ContainerState::Idle);
                    }
                    return;
                }
            }
        };

        match run_with_retries(&container, &request, exec.as_ref(), &backoff).await {
            Ok(()) => {
                let mut map = containers.lock().await;
                if let Some(entry) = map.get_mut(&container) {
                    entry.state = Some(ContainerState::Idle);
                }
                info!(container, full = request.full, "reload succeeded");
            }
            Err(e) => {
                let mut map = containers.lock().await;
                if let Some(entry) = map.get_mut(&container) {
                    entry.state = Some(ContainerState::Failed);
                    entry.pending = None;
                    entry.worker_running = false;
                }
                error!(container, "reload failed after retries: {e}");
                return;
            }
        }
    }
}

async fn run_with_retries(
    container: &str,
    request: &ReloadRequest,
    exec: &dyn GracefulExec,
    backoff: &[Duration],
) -> CoreResult<()> {
    let mut last_err = None;
    for attempt in 0..=backoff.len() {
        match exec.exec(container, &request.command).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                warn!(container, attempt, "reload attempt failed: {e}");
                last_err = Some(e);
                if attempt < backoff.len() {
                    tokio::time::sleep(backoff[attempt]).await;
                }
            }
        }
    }
    let last = last_err.expect("at least one attempt ran");
    Err(CoreError::new(
        ErrorKind::ReloadFailed,
        format!("reload of {container} failed after {} attempts", backoff.len() + 1),
    )
    .with("container", container)
    .with("last_error", last))
}
