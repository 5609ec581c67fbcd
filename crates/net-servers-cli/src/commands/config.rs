use super::{build_stack, core_err, open_context, quiesce_reloads};
use crate::cli::{ConfigCommands, DomainCommands, UserCommands};
use crate::output::Output;
use net_servers_core::error::{CoreError, CoreResult, ErrorKind};
use net_servers_core::schema::validate::validate_composite;
use net_servers_core::schema::{
    CertificateMode, Domain, DomainsFile, GlobalConfig, ServicesFile, User, UsersFile,
};
use net_servers_core::secrets::{Secret, SecretsFile};
use net_servers_core::{CoreContext, Transaction};
use net_servers_server::daemon::{full_reconcile, run_watch};
use net_servers_server::sync::{DiffAction, SyncSnapshot};
use std::time::Duration;

pub async fn run(command: ConfigCommands, out: &Output) -> CoreResult<()> {
    let ctx = open_context().await?;
    match command {
        ConfigCommands::Init => {
            let created = ctx.store().initialize_defaults().await?;
            let names: Vec<_> = created.iter().map(|k| k.name()).collect();
            out.emit(
                &if names.is_empty() {
                    "configuration already initialized".to_string()
                } else {
                    format!("created: {}", names.join(", "))
                },
                serde_json::json!({ "created": names }),
            );
        }
        ConfigCommands::Validate => validate(&ctx, out).await?,
        ConfigCommands::Sync {
            dry_run,
            skip_reload,
        } => sync(&ctx, out, dry_run, skip_reload).await?,
        ConfigCommands::Watch {
            debounce_ms,
            skip_reload,
        } => {
            let stack = build_stack(skip_reload, false).await;
            let ctx = std::sync::Arc::new(ctx);
            run_watch(
                ctx,
                stack.registry.clone(),
                stack.certs.clone(),
                Duration::from_millis(debounce_ms),
                async {
                    let _ = tokio::signal::ctrl_c().await;
                },
            )
            .await
            .map_err(core_err)?;
        }
        ConfigCommands::User { command } => user(&ctx, command, out).await?,
        ConfigCommands::Domain { command } => domain(&ctx, command, out).await?,
    }
    Ok(())
}

async fn validate(ctx: &CoreContext, out: &Output) -> CoreResult<()> {
    // Loading performs parse + per-document validation; what remains are
    // the cross-document rules and the registry.
    let users: UsersFile = ctx.store().load().await?;
    let domains: DomainsFile = ctx.store().load().await?;
    let _: GlobalConfig = ctx.store().load().await?;
    let _: ServicesFile = ctx.store().load().await?;
    let _: SecretsFile = ctx.store().load().await?;

    let issues = validate_composite(&users, &domains);
    if !issues.is_empty() {
        return Err(net_servers_core::error::validation_error("config", &issues));
    }
    ctx.manager().validate()?;
    out.emit("configuration is valid", serde_json::json!({ "valid": true }));
    Ok(())
}

async fn sync(ctx: &CoreContext, out: &Output, dry_run: bool, skip_reload: bool) -> CoreResult<()> {
    let stack = build_stack(skip_reload, dry_run).await;

    if dry_run {
        let snap = SyncSnapshot::load(ctx).await?;
        let diffs = stack.registry.diff_all(&snap).await?;
        let mut lines = Vec::new();
        let mut json = Vec::new();
        for (name, entries) in &diffs {
            for entry in entries {
                let action = match entry.action {
                    DiffAction::Create => "create",
                    DiffAction::Update => "update",
                    DiffAction::Delete => "delete",
                    DiffAction::Unchanged => continue,
                };
                lines.push(format!("{name}: {action} {}", entry.path.display()));
                json.push(serde_json::json!({
                    "synchronizer": name,
                    "action": action,
                    "path": entry.path,
                }));
            }
        }
        if lines.is_empty() {
            lines.push("nothing to do".to_string());
        }
        out.emit(&lines.join("\n"), serde_json::json!({ "diff": json }));
        return Ok(());
    }

    let results = full_reconcile(ctx, &stack.registry, &stack.certs)
        .await
        .map_err(core_err)?;
    let snap = SyncSnapshot::load(ctx).await?;
    quiesce_reloads(&stack, &snap).await;

    let mut failures = Vec::new();
    let mut json = Vec::new();
    for (name, report) in &results {
        json.push(serde_json::json!({
            "synchronizer": name,
            "written": report.written,
            "deleted": report.deleted,
            "unchanged": report.unchanged,
            "failures": report.errors.len(),
        }));
        failures.extend(report.errors.iter().cloned());
    }
    if let Some((path, first)) = failures.first() {
        return Err(first
            .clone()
            .with("path", path.display())
            .with("failures", failures.len()));
    }
    out.emit(
        &format!("synchronized {} projections", results.len()),
        serde_json::json!({ "results": json }),
    );
    Ok(())
}

async fn user(ctx: &CoreContext, command: UserCommands, out: &Output) -> CoreResult<()> {
    match command {
        UserCommands::Add {
            username,
            email,
            domain,
            role,
            quota,
            password,
        } => {
            let mut users: UsersFile = ctx.store().load().await?;
            if users.find(&username).is_some() {
                return Err(CoreError::new(
                    ErrorKind::ConfigValidate,
                    format!("user {username:?} already exists"),
                )
                .with("username", &username));
            }
            users.users.push(User {
                username: username.clone(),
                email,
                domains: domain,
                roles: if role.is_empty() {
                    vec!["user".to_string()]
                } else {
                    role
                },
                mailbox_quota: quota,
                enabled: true,
                aliases: Vec::new(),
                password_hashes: Default::default(),
            });

            let secrets = match password {
                Some(password) => {
                    let mut secrets: SecretsFile = ctx.store().load().await?;
                    secrets.set_password(&username, Secret::new(password));
                    Some(secrets)
                }
                None => None,
            };

            ctx.store()
                .commit(Transaction {
                    users: Some(users),
                    secrets,
                    ..Default::default()
                })
                .await?;
            reconcile_after_change(ctx).await?;
            out.emit(
                &format!("added user {username:?}"),
                serde_json::json!({ "added": username }),
            );
        }
        UserCommands::List => {
            let users: UsersFile = ctx.store().load().await?;
            let secrets: SecretsFile = ctx.store().load().await?;
            let mut lines = Vec::new();
            let mut json = Vec::new();
            for user in &users.users {
                let state = if user.enabled { "enabled" } else { "disabled" };
                let has_secret = secrets.user(&user.username).is_some();
                lines.push(format!(
                    "{:<16} {state:<9} {:<24} secret={} domains={}",
                    user.username,
                    user.email,
                    if has_secret { "yes" } else { "no" },
                    user.domains.join(",")
                ));
                json.push(serde_json::json!({
                    "username": user.username,
                    "email": user.email,
                    "domains": user.domains,
                    "roles": user.roles,
                    "enabled": user.enabled,
                    "has_secret": has_secret,
                }));
            }
            out.emit(&lines.join("\n"), serde_json::json!({ "users": json }));
        }
        UserCommands::Delete { username } => {
            let mut users: UsersFile = ctx.store().load().await?;
            let before = users.users.len();
            users.users.retain(|u| u.username != username);
            if users.users.len() == before {
                return Err(CoreError::new(
                    ErrorKind::ConfigValidate,
                    format!("user {username:?} is not defined"),
                )
                .with("username", &username));
            }
            let mut secrets: SecretsFile = ctx.store().load().await?;
            secrets.users.remove(&username);
            ctx.store()
                .commit(Transaction {
                    users: Some(users),
                    secrets: Some(secrets),
                    ..Default::default()
                })
                .await?;
            reconcile_after_change(ctx).await?;
            out.emit(
                &format!("deleted user {username:?}"),
                serde_json::json!({ "deleted": username }),
            );
        }
        UserCommands::SetPassword { username, password } => {
            let users: UsersFile = ctx.store().load().await?;
            if users.find(&username).is_none() {
                return Err(CoreError::new(
                    ErrorKind::ConfigValidate,
                    format!("user {username:?} is not defined"),
                )
                .with("username", &username));
            }
            let mut secrets: SecretsFile = ctx.store().load().await?;
            secrets.set_password(&username, Secret::new(password));
            ctx.store().save(&secrets).await?;
            reconcile_after_change(ctx).await?;
            out.emit(
                &format!("updated password for {username:?}"),
                serde_json::json!({ "updated": username }),
            );
        }
    }
    Ok(())
}

async fn domain(ctx: &CoreContext, command: DomainCommands, out: &Output) -> CoreResult<()> {
    match command {
        DomainCommands::Add {
            name,
            mx,
            a,
            certificate_mode,
        } => {
            let certificate_mode = CertificateMode::from_str(&certificate_mode).ok_or_else(|| {
                CoreError::new(
                    ErrorKind::ConfigValidate,
                    format!("unknown certificate mode {certificate_mode:?}"),
                )
            })?;
            let mut a_records = std::collections::BTreeMap::new();
            for pair in &a {
                let Some((short, ip)) = pair.split_once('=') else {
                    return Err(CoreError::new(
                        ErrorKind::ConfigValidate,
                        format!("A record {pair:?} must look like short=ipv4"),
                    )
                    .with("record", pair));
                };
                a_records.insert(short.to_string(), ip.to_string());
            }

            let mut domains: DomainsFile = ctx.store().load().await?;
            if domains.find(&name).is_some() {
                return Err(CoreError::new(
                    ErrorKind::ConfigValidate,
                    format!("domain {name:?} already exists"),
                )
                .with("domain", &name));
            }
            domains.domains.push(Domain {
                name: name.clone(),
                enabled: true,
                mx_records: mx,
                a_records,
                cname_records: Default::default(),
                txt_records: Default::default(),
                external_mx: Vec::new(),
                certificate_mode,
                reverse_zone: false,
            });
            ctx.store()
                .commit(Transaction {
                    domains: Some(domains),
                    ..Default::default()
                })
                .await?;
            reconcile_after_change(ctx).await?;
            out.emit(
                &format!("added domain {name:?}"),
                serde_json::json!({ "added": name }),
            );
        }
        DomainCommands::List => {
            let domains: DomainsFile = ctx.store().load().await?;
            let mut lines = Vec::new();
            let mut json = Vec::new();
            for domain in &domains.domains {
                let state = if domain.enabled { "enabled" } else { "disabled" };
                lines.push(format!(
                    "{:<24} {state:<9} certs={} mx={}",
                    domain.name,
                    domain.certificate_mode.as_str(),
                    domain.mx_records.join(",")
                ));
                json.push(serde_json::json!({
                    "name": domain.name,
                    "enabled": domain.enabled,
                    "mx_records": domain.mx_records,
                    "a_records": domain.a_records,
                    "certificate_mode": domain.certificate_mode.as_str(),
                }));
            }
            out.emit(&lines.join("\n"), serde_json::json!({ "domains": json }));
        }
    }
    Ok(())
}

/// Config mutations reconcile immediately, as the watcher would; reloads
/// stay best-effort.
async fn reconcile_after_change(ctx: &CoreContext) -> CoreResult<()> {
    let stack = build_stack(false, false).await;
    let results = full_reconcile(ctx, &stack.registry, &stack.certs)
        .await
        .map_err(core_err)?;
    let snap = SyncSnapshot::load(ctx).await?;
    quiesce_reloads(&stack, &snap).await;
    let failures: Vec<&(std::path::PathBuf, CoreError)> = results
        .iter()
        .flat_map(|(_, r)| r.errors.iter())
        .collect();
    if let Some((path, first)) = failures.first() {
        return Err(first.clone().with("path", path.display()));
    }
    Ok(())
}
