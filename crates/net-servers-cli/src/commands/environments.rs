use super::open_context;
use crate::cli::EnvironmentCommands;
use crate::output::Output;
use net_servers_core::environments::EnvironmentManager;
use net_servers_core::error::{CoreError, CoreResult, ErrorKind};
use net_servers_core::schema::{CertificateMode, Document, Environment, ServicesFile};
use net_servers_server::ports::generate_mappings;

fn env_json(env: &Environment, current: &str) -> serde_json::Value {
    serde_json::json!({
        "name": env.name,
        "description": env.description,
        "base_path": env.base_path,
        "domain": env.domain,
        "admin_email": env.admin_email,
        "enabled": env.enabled,
        "current": env.name == current,
        "tags": env.tags,
        "created_at": env.created_at,
        "last_used": env.last_used,
        "certificate_mode": env.certificate_mode.as_str(),
    })
}

pub async fn run(command: EnvironmentCommands, out: &Output) -> CoreResult<()> {
    let cwd = std::env::current_dir()
        .map_err(|e| CoreError::new(ErrorKind::IoFatal, format!("cannot resolve cwd: {e}")))?;

    if let EnvironmentCommands::Init { force } = command {
        let manager = EnvironmentManager::init(&cwd, force).await?;
        out.emit(
            &format!(
                "initialized environment registry at {}",
                manager.registry_path().display()
            ),
            serde_json::json!({
                "registry": manager.registry_path(),
                "current": manager.current()?.name,
            }),
        );
        return Ok(());
    }

    let mut ctx = open_context().await?;
    match command {
        EnvironmentCommands::Init { .. } => unreachable!("handled above"),
        EnvironmentCommands::List => {
            let current = ctx.environment()?.name.clone();
            let envs = ctx.manager().list();
            let mut lines = Vec::new();
            for env in envs {
                let marker = if env.name == current { "*" } else { " " };
                let state = if env.enabled { "enabled" } else { "disabled" };
                lines.push(format!("{marker} {:<16} {state:<9} {}", env.name, env.base_path));
            }
            let json: Vec<_> = envs.iter().map(|e| env_json(e, &current)).collect();
            out.emit(&lines.join("\n"), serde_json::json!({ "environments": json }));
        }
        EnvironmentCommands::Current => {
            let env = ctx.environment()?.clone();
            out.emit(&env.name, env_json(&env, &env.name));
        }
        EnvironmentCommands::Info { name } => {
            let current = ctx.environment()?.name.clone();
            let env = ctx.manager().info(&name)?.clone();
            let human = format!(
                "{}\n  description: {}\n  base_path: {}\n  domain: {}\n  enabled: {}\n  certificate_mode: {}\n  last_used: {}",
                env.name,
                env.description,
                env.base_path,
                env.domain,
                env.enabled,
                env.certificate_mode.as_str(),
                env.last_used,
            );
            out.emit(&human, env_json(&env, &current));
        }
        EnvironmentCommands::Add {
            name,
            base_path,
            description,
            domain,
            admin_email,
            certificate_mode,
            tag,
        } => {
            let certificate_mode = CertificateMode::from_str(&certificate_mode).ok_or_else(|| {
                CoreError::new(
                    ErrorKind::ConfigValidate,
                    format!("unknown certificate mode {certificate_mode:?}"),
                )
            })?;
            let now = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
            let mut env = Environment {
                name: name.clone(),
                description,
                base_path,
                domain,
                admin_email,
                enabled: true,
                tags: tag,
                created_at: now.clone(),
                last_used: now,
                certificate_mode,
                port_mappings: Vec::new(),
            };
            env.port_mappings = generate_mappings(&env, &ServicesFile::default_document());
            ctx.manager_mut().add(env).await?;
            out.emit(
                &format!("added environment {name:?}"),
                serde_json::json!({ "added": name }),
            );
        }
        EnvironmentCommands::Remove { name } => {
            ctx.manager_mut().remove(&name).await?;
            out.emit(
                &format!("removed environment {name:?}"),
                serde_json::json!({ "removed": name }),
            );
        }
        EnvironmentCommands::Enable { name } => {
            ctx.manager_mut().enable(&name).await?;
            out.emit(
                &format!("enabled environment {name:?}"),
                serde_json::json!({ "enabled": name }),
            );
        }
        EnvironmentCommands::Disable { name } => {
            ctx.manager_mut().disable(&name).await?;
            out.emit(
                &format!("disabled environment {name:?}"),
                serde_json::json!({ "disabled": name }),
            );
        }
        EnvironmentCommands::Switch { name } => {
            let env = ctx.switch(&name).await?;
            out.emit(
                &format!("switched to environment {:?} at {}", env.name, env.base_path),
                serde_json::json!({ "current": env.name, "base_path": env.base_path }),
            );
        }
        EnvironmentCommands::Validate => {
            ctx.manager().validate()?;
            out.emit("environment registry is valid", serde_json::json!({ "valid": true }));
        }
    }
    Ok(())
}
