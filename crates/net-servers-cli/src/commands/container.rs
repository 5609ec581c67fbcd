use super::{build_stack, open_context};
use crate::cli::ContainerCommands;
use crate::output::Output;
use net_servers_core::error::CoreResult;
use net_servers_core::schema::EnvironmentsFile;
use net_servers_server::supervisor::{Batch, Supervisor};
use net_servers_server::sync::SyncSnapshot;
use net_servers_server::ReloadCoordinator;
use std::sync::Arc;

fn batch_result(batch: &Batch, verb: &str, out: &Output) -> CoreResult<()> {
    let json: Vec<_> = batch
        .results
        .iter()
        .map(|(name, result)| {
            serde_json::json!({
                "service": name,
                "ok": result.is_ok(),
                "error": result.as_ref().err().map(|e| e.to_string()),
            })
        })
        .collect();
    let human: Vec<String> = batch
        .results
        .iter()
        .map(|(name, result)| match result {
            Ok(()) => format!("{name}: ok"),
            Err(e) => format!("{name}: {e}"),
        })
        .collect();
    out.emit(
        &format!("{verb}:\n{}", human.join("\n")),
        serde_json::json!({ "results": json }),
    );
    match batch.first_error() {
        Some(e) => Err(e.clone()),
        None => Ok(()),
    }
}

pub async fn run(command: ContainerCommands, out: &Output) -> CoreResult<()> {
    let ctx = open_context().await?;
    let snap = SyncSnapshot::load(&ctx).await?;
    let env = ctx.environment()?.clone();
    // The registry file is reloaded raw for conflict attribution across
    // every environment, not just the current one.
    let registry_file = EnvironmentsFile {
        current_environment: env.name.clone(),
        environments: ctx.manager().list().to_vec(),
    };

    let stack = build_stack(false, false).await;
    let reload = stack
        .reload
        .clone()
        .unwrap_or_else(|| Arc::new(ReloadCoordinator::new(stack.runtime.clone())));
    let supervisor = Supervisor::new(stack.runtime.clone(), reload);

    match command {
        ContainerCommands::Build { service, rebuild } => {
            supervisor.build(&service, &env, rebuild).await?;
            out.emit(
                &format!("built {service}"),
                serde_json::json!({ "built": service }),
            );
        }
        ContainerCommands::Run {
            service,
            force_port,
        } => {
            supervisor
                .start(&snap, &registry_file, &env, &service, force_port)
                .await?;
            out.emit(
                &format!("started {service}"),
                serde_json::json!({ "started": service }),
            );
        }
        ContainerCommands::Stop { service } => {
            supervisor.stop(&snap, &service).await?;
            out.emit(
                &format!("stopped {service}"),
                serde_json::json!({ "stopped": service }),
            );
        }
        ContainerCommands::Remove { service, force } => {
            supervisor.remove(&snap, &service, force).await?;
            out.emit(
                &format!("removed {service}"),
                serde_json::json!({ "removed": service }),
            );
        }
        ContainerCommands::Logs { service, tail } => {
            let logs = supervisor.logs(&snap, &service, tail).await?;
            out.emit(&logs, serde_json::json!({ "service": service, "logs": logs }));
        }
        ContainerCommands::List => {
            let names = supervisor.list().await?;
            out.emit(&names.join("\n"), serde_json::json!({ "containers": names }));
        }
        ContainerCommands::Test { service } => {
            supervisor.test(&snap, &service).await?;
            out.emit(
                &format!("{service}: ok"),
                serde_json::json!({ "service": service, "ok": true }),
            );
        }
        ContainerCommands::BuildAll { rebuild } => {
            let batch = supervisor.build_all(&env, rebuild).await;
            batch_result(&batch, "build-all", out)?;
        }
        ContainerCommands::StartAll { force_port } => {
            let batch = supervisor
                .start_all(&snap, &registry_file, &env, force_port)
                .await;
            batch_result(&batch, "start-all", out)?;
        }
        ContainerCommands::StopAll => {
            let batch = supervisor.stop_all(&snap).await;
            batch_result(&batch, "stop-all", out)?;
        }
        ContainerCommands::RemoveAll { force } => {
            let batch = supervisor.remove_all(&snap, force).await;
            batch_result(&batch, "remove-all", out)?;
        }
        ContainerCommands::CleanAll => {
            let batch = supervisor.clean_all(&snap, &env).await;
            batch_result(&batch, "clean-all", out)?;
        }
    }
    Ok(())
}
