//! Thin invocation layer over the external container runtime.
//!
//! The runtime is a podman- or docker-compatible binary named by
//! `CONTAINER_CMD`; only the common verb subset is used (`build`, `run`,
//! `stop`, `rm`, `exec`, `logs`, `ps`). Every invocation carries a
//! per-operation timeout and a timed-out child is killed with the
//! container left in whatever state the runtime last reported.

use crate::reload::GracefulExec;
use async_trait::async_trait;
use net_servers_core::error::{CoreError, CoreResult, ErrorKind};
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};

/// Binary name override.
pub const CONTAINER_CMD_VAR: &str = "CONTAINER_CMD";

#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    pub build: Duration,
    pub start_stop: Duration,
    pub reload: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            build: Duration::from_secs(120),
            start_stop: Duration::from_secs(30),
            reload: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Concurrent runtime invocations are capped; the daemon is shared with
/// other processes and a batch start must not fork a process per service.
const MAX_CONCURRENT_INVOCATIONS: usize = 4;

#[derive(Debug)]
pub struct RuntimeClient {
    bin: String,
    timeouts: Timeouts,
    slots: tokio::sync::Semaphore,
}

impl RuntimeClient {
    #[must_use]
    pub fn new(bin: String, timeouts: Timeouts) -> Self {
        Self {
            bin,
            timeouts,
            slots: tokio::sync::Semaphore::new(MAX_CONCURRENT_INVOCATIONS),
        }
    }

    /// Resolve the binary from `CONTAINER_CMD`, defaulting to `podman`.
    #[must_use]
    pub fn from_env() -> Self {
        let bin = std::env::var(CONTAINER_CMD_VAR)
            .ok()
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| "podman".to_string());
        Self::new(bin, Timeouts::default())
    }

    #[must_use]
    pub fn bin(&self) -> &str {
        &self.bin
    }

    async fn invoke(&self, args: &[String], timeout: Duration) -> CoreResult<RunOutput> {
        let _slot = self
            .slots
            .acquire()
            .await
            .map_err(|_| CoreError::new(ErrorKind::RuntimeError, "runtime client closed"))?;
        debug!(bin = %self.bin, ?args, "invoking container runtime");
        let mut command = Command::new(&self.bin);
        command.args(args).kill_on_drop(true);

        let child = command
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => CoreError::new(
                    ErrorKind::RuntimeUnavailable,
                    format!("container runtime {:?} not found", self.bin),
                )
                .with("bin", &self.bin),
                _ => CoreError::new(ErrorKind::RuntimeError, e.to_string()).with("bin", &self.bin),
            })?;

        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(result) => result
                .map_err(|e| CoreError::new(ErrorKind::RuntimeError, e.to_string()))?,
            Err(_) => {
                // kill_on_drop already reaped the child.
                return Err(CoreError::new(
                    ErrorKind::RuntimeTimeout,
                    format!("{} {} timed out", self.bin, args.join(" ")),
                )
                .with("timeout_secs", timeout.as_secs())
                .with("verb", args.first().map_or("", String::as_str)));
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if output.status.success() {
            Ok(RunOutput { stdout, stderr })
        } else {
            Err(CoreError::new(
                ErrorKind::RuntimeError,
                format!(
                    "{} {} exited with {}",
                    self.bin,
                    args.first().map_or("", String::as_str),
                    output.status
                ),
            )
            .with("stderr", &stderr)
            .with("verb", args.first().map_or("", String::as_str)))
        }
    }

    pub async fn build(
        &self,
        tag: &str,
        dockerfile: &str,
        context_dir: &str,
        no_cache: bool,
    ) -> CoreResult<RunOutput> {
        let mut args = vec!["build".to_string(), "-t".to_string(), tag.to_string()];
        if no_cache {
            args.push("--no-cache".to_string());
        }
        args.extend([
            "-f".to_string(),
            dockerfile.to_string(),
            context_dir.to_string(),
        ]);
        info!(tag, dockerfile, "building image");
        self.invoke(&args, self.timeouts.build).await
    }

    /// `run -d --name <name> [-p ...] [-v ...] [-e ...] <image>`.
    pub async fn run(&self, args: Vec<String>) -> CoreResult<RunOutput> {
        let mut full = vec!["run".to_string()];
        full.extend(args);
        self.invoke(&full, self.timeouts.start_stop).await
    }

    pub async fn stop(&self, name: &str) -> CoreResult<RunOutput> {
        info!(container = name, "stopping container");
        self.invoke(
            &["stop".to_string(), name.to_string()],
            self.timeouts.start_stop,
        )
        .await
    }

    pub async fn rm(&self, name: &str, force: bool) -> CoreResult<RunOutput> {
        let mut args = vec!["rm".to_string()];
        if force {
            args.push("-f".to_string());
        }
        args.push(name.to_string());
        self.invoke(&args, self.timeouts.start_stop).await
    }

    pub async fn rmi(&self, image: &str, force: bool) -> CoreResult<RunOutput> {
        let mut args = vec!["rmi".to_string()];
        if force {
            args.push("-f".to_string());
        }
        args.push(image.to_string());
        self.invoke(&args, self.timeouts.start_stop).await
    }

    pub async fn exec_in(&self, name: &str, command: &[String]) -> CoreResult<RunOutput> {
        let mut args = vec!["exec".to_string(), name.to_string()];
        args.extend(command.iter().cloned());
        self.invoke(&args, self.timeouts.reload).await
    }

    pub async fn logs(&self, name: &str, tail: Option<u32>) -> CoreResult<RunOutput> {
        let mut args = vec!["logs".to_string()];
        if let Some(tail) = tail {
            args.extend(["--tail".to_string(), tail.to_string()]);
        }
        args.push(name.to_string());
        self.invoke(&args, self.timeouts.start_stop).await
    }

    /// Names of containers known to the runtime.
    pub async fn ps_names(&self, all: bool) -> CoreResult<Vec<String>> {
        let mut args = vec![
            "ps".to_string(),
            "--format".to_string(),
            "{{.Names}}".to_string(),
        ];
        if all {
            args.push("-a".to_string());
        }
        let output = self.invoke(&args, self.timeouts.start_stop).await?;
        Ok(output
            .stdout
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect())
    }
}

#[async_trait]
impl GracefulExec for RuntimeClient {
    async fn exec(&self, container: &str, command: &[String]) -> CoreResult<()> {
        self.exec_in(container, command).await.map(|_| ())
    }
}
