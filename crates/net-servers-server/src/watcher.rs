//! Config-directory watcher with per-channel debouncing.
//!
//! Raw filesystem events are bridged from the notify callback into a
//! bounded tokio channel, routed to one of the fixed logical channels, and
//! debounced per channel: a burst of editor-driven writes produces a single
//! dispatch once the directory has been quiet for the coalescing window.
//! Dispatch is cooperative: the handler for a channel is awaited before
//! further events on that channel are accepted; other channels proceed in
//! parallel. Closing the watcher drains pending debounced events first.

use crate::sync::Channel;
use anyhow::{Context, Result};
use async_trait::async_trait;
use notify::{RecursiveMode, Watcher};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Default coalescing window.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(250);

/// Receives one call per debounced burst. Handlers must be idempotent.
#[async_trait]
pub trait ChannelHandler: Send + Sync + 'static {
    async fn handle(&self, channel: Channel) -> Result<()>;
}

pub struct ConfigWatcher {
    // Kept alive for the lifetime of the watch; dropping it stops event
    // delivery and starts the drain.
    _watcher: notify::RecommendedWatcher,
    router: tokio::task::JoinHandle<()>,
    channels: Vec<tokio::task::JoinHandle<()>>,
}

impl ConfigWatcher {
    /// Watch `config_dir` recursively and dispatch to `handler`.
    pub fn spawn(
        config_dir: &Path,
        debounce: Duration,
        handler: Arc<dyn ChannelHandler>,
    ) -> Result<Self> {
        let (raw_tx, raw_rx) = mpsc::channel::<notify::Event>(256);

        let mut watcher =
            notify::recommended_watcher(move |res: Result<notify::Event, notify::Error>| {
                match res {
                    Ok(event) => {
                        if event.kind.is_modify() || event.kind.is_create() || event.kind.is_remove()
                        {
                            // Bounded send gives explicit backpressure; a full
                            // queue drops the raw event, which the debounce
                            // absorbs anyway.
                            let _ = raw_tx.try_send(event);
                        }
                    }
                    Err(e) => error!("watch error: {e}"),
                }
            })?;
        watcher
            .watch(config_dir, RecursiveMode::Recursive)
            .with_context(|| format!("failed to watch {}", config_dir.display()))?;
        info!(dir = %config_dir.display(), "watching configuration directory");

        let mut channel_txs: HashMap<Channel, mpsc::Sender<()>> = HashMap::new();
        let mut channels = Vec::new();
        for channel in Channel::ALL {
            let (tx, rx) = mpsc::channel::<()>(16);
            channel_txs.insert(channel, tx);
            channels.push(tokio::spawn(debounce_loop(
                channel,
                rx,
                debounce,
                handler.clone(),
            )));
        }

        let router = tokio::spawn(route_loop(raw_rx, channel_txs));

        Ok(Self {
            _watcher: watcher,
            router,
            channels,
        })
    }

    /// Stop watching, drain pending debounced events, then return.
    pub async fn close(self) {
        drop(self._watcher);
        // Dropping the watcher closes the raw channel; the router exits and
        // drops the per-channel senders, which lets each debounce loop fire
        // its pending dispatch and finish.
        let _ = self.router.await;
        for task in self.channels {
            let _ = task.await;
        }
        info!("configuration watcher closed");
    }
}

async fn route_loop(
    mut raw_rx: mpsc::Receiver<notify::Event>,
    channel_txs: HashMap<Channel, mpsc::Sender<()>>,
) {
    while let Some(event) = raw_rx.recv().await {
        for path in &event.paths {
            if let Some(channel) = route(path) {
                if let Some(tx) = channel_txs.get(&channel) {
                    let _ = tx.try_send(());
                }
            }
        }
    }
}

/// Map a file to its logical channel. Temp files, backups and unrelated
/// files are ignored.
#[must_use]
pub fn route(path: &Path) -> Option<Channel> {
    let name = path.file_name()?.to_str()?;
    if name.ends_with(".tmp") || name.ends_with(".bak") {
        return None;
    }
    if !(name.ends_with(".yaml") || name.ends_with(".yml")) {
        return None;
    }
    let in_services_dir = path
        .parent()
        .and_then(Path::file_name)
        .is_some_and(|d| d == std::ffi::OsStr::new("services"));
    if in_services_dir {
        return Some(Channel::Services);
    }
    match name {
        "users.yaml" => Some(Channel::Users),
        "domains.yaml" => Some(Channel::Domains),
        "global.yaml" => Some(Channel::Global),
        "secrets.yaml" => Some(Channel::Secrets),
        "environments.yaml" | "environments.local.yaml" => Some(Channel::Environments),
        _ => None,
    }
}

async fn debounce_loop(
    channel: Channel,
    mut rx: mpsc::Receiver<()>,
    debounce: Duration,
    handler: Arc<dyn ChannelHandler>,
) {
    let mut pending = false;
    loop {
        if pending {
            // Quiet-period wait: another event restarts the window, silence
            // dispatches exactly once for the whole burst.
            tokio::select! {
                event = rx.recv() => match event {
                    Some(()) => {}
                    None => {
                        dispatch(channel, handler.as_ref()).await;
                        return;
                    }
                },
                () = tokio::time::sleep(debounce) => {
                    pending = false;
                    dispatch(channel, handler.as_ref()).await;
                }
            }
        } else {
            match rx.recv().await {
                Some(()) => pending = true,
                None => return,
            }
        }
    }
}

async fn dispatch(channel: Channel, handler: &dyn ChannelHandler) {
    if let Err(e) = handler.handle(channel).await {
        warn!(channel = channel.name(), "channel handler failed: {e:#}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter {
        counts: Mutex<HashMap<Channel, usize>>,
        total: AtomicUsize,
    }
    use tokio::sync::Mutex;

    impl Counter {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                counts: Mutex::new(HashMap::new()),
                total: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ChannelHandler for Counter {
        async fn handle(&self, channel: Channel) -> Result<()> {
            *self.counts.lock().await.entry(channel).or_insert(0) += 1;
            self.total.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn routes_known_files_to_channels() {
        assert_eq!(route(Path::new("/c/config/users.yaml")), Some(Channel::Users));
        assert_eq!(
            route(Path::new("/c/config/services/services.yaml")),
            Some(Channel::Services)
        );
        assert_eq!(
            route(Path::new("/c/config/environments.local.yaml")),
            Some(Channel::Environments)
        );
        assert_eq!(route(Path::new("/c/config/users.yaml.tmp")), None);
        assert_eq!(route(Path::new("/c/config/users.yaml.bak")), None);
        assert_eq!(route(Path::new("/c/config/notes.txt")), None);
    }

    #[tokio::test(start_paused = true)]
    async fn burst_of_writes_produces_one_dispatch() {
        let (tx, rx) = mpsc::channel(16);
        let counter = Counter::new();
        let task = tokio::spawn(debounce_loop(
            Channel::Users,
            rx,
            Duration::from_millis(250),
            counter.clone(),
        ));

        for _ in 0..10 {
            tx.send(()).await.unwrap();
            tokio::time::advance(Duration::from_millis(10)).await;
        }
        tokio::time::advance(Duration::from_millis(260)).await;
        tokio::task::yield_now().await;
        assert_eq!(counter.total.load(Ordering::SeqCst), 1);

        // A later write after the quiet period dispatches again.
        tx.send(()).await.unwrap();
        tokio::time::advance(Duration::from_millis(260)).await;
        tokio::task::yield_now().await;
        assert_eq!(counter.total.load(Ordering::SeqCst), 2);

        drop(tx);
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn close_drains_pending_dispatch() {
        let (tx, rx) = mpsc::channel(16);
        let counter = Counter::new();
        let task = tokio::spawn(debounce_loop(
            Channel::Domains,
            rx,
            Duration::from_millis(250),
            counter.clone(),
        ));

        tx.send(()).await.unwrap();
        tokio::task::yield_now().await;
        drop(tx); // close before the window elapses
        task.await.unwrap();
        assert_eq!(counter.total.load(Ordering::SeqCst), 1);
    }
}
