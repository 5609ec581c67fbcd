pub mod certificates;
pub mod config;
pub mod container;
pub mod environments;

use net_servers_core::error::{CoreError, CoreResult, ErrorKind};
use net_servers_core::CoreContext;
use net_servers_server::certs::CertificateManager;
use net_servers_server::reload::ReloadCoordinator;
use net_servers_server::runtime::RuntimeClient;
use net_servers_server::sync::dns::DnsSynchronizer;
use net_servers_server::sync::http_auth::HttpAuthSynchronizer;
use net_servers_server::sync::mail::MailSynchronizer;
use net_servers_server::sync::{EventBus, SyncRegistry};
use std::sync::Arc;
use tracing::warn;

/// Preserve the typed core error when unwrapping an orchestration failure.
pub(crate) fn core_err(e: anyhow::Error) -> CoreError {
    match e.downcast::<CoreError>() {
        Ok(core) => core,
        Err(e) => CoreError::new(ErrorKind::IoFatal, format!("{e:#}")),
    }
}

pub(crate) async fn open_context() -> CoreResult<CoreContext> {
    let cwd = std::env::current_dir()
        .map_err(|e| CoreError::new(ErrorKind::IoFatal, format!("cannot resolve cwd: {e}")))?;
    let ctx = CoreContext::load(&cwd).await?;
    ctx.paths().ensure_directories()?;
    Ok(ctx)
}

pub(crate) struct Stack {
    pub registry: Arc<SyncRegistry>,
    pub certs: Arc<CertificateManager>,
    pub runtime: Arc<RuntimeClient>,
    pub reload: Option<Arc<ReloadCoordinator>>,
}

/// Assemble the synchronizer stack. Reloads are dropped entirely when the
/// runtime is unreachable or the caller opted out; projections are still
/// written either way.
pub(crate) async fn build_stack(skip_reload: bool, dry_run: bool) -> Stack {
    let runtime = Arc::new(RuntimeClient::from_env());

    let reload = if skip_reload || dry_run {
        None
    } else {
        match runtime.ps_names(false).await {
            Ok(_) => Some(Arc::new(ReloadCoordinator::new(runtime.clone()))),
            Err(e) => {
                warn!("container runtime unreachable, reloads disabled: {e}");
                None
            }
        }
    };

    let bus = EventBus::new();
    let mut registry = SyncRegistry::new(bus.clone(), reload.clone());
    registry.dry_run = dry_run;
    registry.register(Arc::new(MailSynchronizer::new()));
    registry.register(Arc::new(HttpAuthSynchronizer { skip_reload }));
    registry.register(Arc::new(DnsSynchronizer::new(
        reload.is_some().then(|| runtime.clone()),
    )));
    let certs = Arc::new(CertificateManager::new(bus));

    Stack {
        registry: Arc::new(registry),
        certs,
        runtime,
        reload,
    }
}

/// Wait for any reloads requested during a one-shot command.
pub(crate) async fn quiesce_reloads(
    stack: &Stack,
    snap: &net_servers_server::sync::SyncSnapshot,
) {
    if let Some(reload) = &stack.reload {
        for (_, config) in &snap.services.services {
            reload.quiesce(&snap.container_name(&config.container_ref)).await;
        }
    }
}
