//! Wiring for the watch loop: channel dispatch → certificate lifecycle →
//! synchronizer reconciliation, with the event bus feeding
//! certificate-driven reconciles back in.

use crate::certs::CertificateManager;
use crate::sync::{Channel, Event, SyncRegistry, SyncSnapshot};
use crate::watcher::{ChannelHandler, ConfigWatcher};
use anyhow::{Context, Result};
use async_trait::async_trait;
use net_servers_core::CoreContext;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

pub struct ReconcileHandler {
    ctx: Arc<CoreContext>,
    registry: Arc<SyncRegistry>,
    certs: Arc<CertificateManager>,
}

impl ReconcileHandler {
    #[must_use]
    pub fn new(
        ctx: Arc<CoreContext>,
        registry: Arc<SyncRegistry>,
        certs: Arc<CertificateManager>,
    ) -> Self {
        Self {
            ctx,
            registry,
            certs,
        }
    }

    async fn reconcile(&self, channel: Channel) -> Result<()> {
        // The change came from outside this process; drop the cache before
        // reading.
        self.ctx.store().invalidate().await;

        if channel == Channel::Environments {
            // Environment switching is an explicit CLI operation; a registry
            // edit only warrants a validation pass here.
            if let Err(e) = self.ctx.manager().validate() {
                warn!("environment registry edit failed validation: {e}");
            }
            return Ok(());
        }

        // Certificates are applied before anything that references them.
        if matches!(channel, Channel::Domains | Channel::Global) {
            self.certs
                .ensure_all(&self.ctx, false)
                .await
                .context("certificate reconciliation failed")?;
        }

        let snap = SyncSnapshot::load(&self.ctx).await?;
        let results = self.registry.reconcile_channel(&snap, channel).await?;
        for (name, report) in &results {
            if !report.errors.is_empty() {
                error!(
                    synchronizer = %name,
                    failures = report.errors.len(),
                    "reconcile completed with failures"
                );
            } else if report.changed() {
                info!(
                    synchronizer = %name,
                    written = report.written.len(),
                    deleted = report.deleted.len(),
                    "reconcile applied changes"
                );
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ChannelHandler for ReconcileHandler {
    async fn handle(&self, channel: Channel) -> Result<()> {
        self.reconcile(channel).await
    }
}

/// One full pass: certificates first, then every synchronizer. Used by
/// `config sync` and as the initial sync of the watch loop.
pub async fn full_reconcile(
    ctx: &CoreContext,
    registry: &SyncRegistry,
    certs: &CertificateManager,
) -> Result<Vec<(String, crate::sync::ApplyReport)>> {
    certs
        .ensure_all(ctx, false)
        .await
        .context("certificate reconciliation failed")?;
    let snap = SyncSnapshot::load(ctx).await?;
    let results = registry.reconcile_all(&snap).await?;
    Ok(results)
}

/// Run the watcher until `shutdown` resolves (the CLI passes ctrl-c).
pub async fn run_watch(
    ctx: Arc<CoreContext>,
    registry: Arc<SyncRegistry>,
    certs: Arc<CertificateManager>,
    debounce: Duration,
    shutdown: impl std::future::Future<Output = ()>,
) -> Result<()> {
    // Initial sync so the projections match the store before we rely on
    // change events.
    full_reconcile(&ctx, &registry, &certs).await?;

    let handler = Arc::new(ReconcileHandler::new(
        ctx.clone(),
        registry.clone(),
        certs.clone(),
    ));
    let watcher = ConfigWatcher::spawn(&ctx.paths().config_dir, debounce, handler)?;

    // Certificate issuance feeds the dependent synchronizers through the
    // bus; neither side holds a handle to the other.
    let mut events = registry.bus().subscribe();
    let bus_ctx = ctx.clone();
    let bus_registry = registry.clone();
    let bus_task = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if let Event::CertificatesChanged { domain } = event {
                info!(domain = %domain, "certificates changed, reconciling dependents");
                match SyncSnapshot::load(&bus_ctx).await {
                    Ok(snap) => {
                        for name in ["mail", "http-auth"] {
                            if let Err(e) = bus_registry.reconcile_one(&snap, name).await {
                                warn!(synchronizer = name, "reconcile failed: {e}");
                            }
                        }
                    }
                    Err(e) => warn!("snapshot load failed: {e}"),
                }
            }
        }
    });

    info!("watching for configuration changes");
    shutdown.await;
    info!("shutting down watcher");
    watcher.close().await;
    bus_task.abort();
    Ok(())
}
