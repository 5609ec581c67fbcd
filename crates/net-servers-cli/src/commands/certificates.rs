use super::{build_stack, open_context};
use crate::cli::CertificateCommands;
use crate::output::Output;
use net_servers_core::error::{CoreError, CoreResult, ErrorKind};
use net_servers_core::schema::{CertificateMeta, DomainsFile, GlobalConfig};

fn meta_json(meta: &CertificateMeta) -> serde_json::Value {
    serde_json::json!({
        "domain": meta.domain,
        "mode": meta.mode.as_str(),
        "not_before": meta.not_before.to_rfc3339(),
        "not_after": meta.not_after.to_rfc3339(),
        "fingerprint_sha256": meta.fingerprint_sha256,
    })
}

fn meta_line(meta: &CertificateMeta) -> String {
    format!(
        "{:<24} {:<12} expires {}  sha256:{}",
        meta.domain,
        meta.mode.as_str(),
        meta.not_after.format("%Y-%m-%d"),
        &meta.fingerprint_sha256[..12.min(meta.fingerprint_sha256.len())],
    )
}

pub async fn run(command: CertificateCommands, out: &Output) -> CoreResult<()> {
    let ctx = open_context().await?;
    let stack = build_stack(true, false).await;

    match command {
        CertificateCommands::List => {
            let listed = stack.certs.list(ctx.paths()).await?;
            let lines: Vec<_> = listed.iter().map(meta_line).collect();
            let json: Vec<_> = listed.iter().map(meta_json).collect();
            out.emit(&lines.join("\n"), serde_json::json!({ "certificates": json }));
        }
        CertificateCommands::Info { domain } => {
            let meta = stack.certs.info(ctx.paths(), &domain).await?;
            out.emit(&meta_line(&meta), meta_json(&meta));
        }
        CertificateCommands::ProvisionSelfSigned { domain, force } => {
            let domains: DomainsFile = ctx.store().load().await?;
            let record = domains.find(&domain).ok_or_else(|| {
                CoreError::new(
                    ErrorKind::ConfigValidate,
                    format!("domain {domain:?} is not defined"),
                )
                .with("domain", &domain)
            })?;
            let outcome = stack
                .certs
                .ensure_self_signed(ctx.paths(), record, force)
                .await?;
            out.emit(
                &format!("{domain}: {outcome:?}"),
                serde_json::json!({ "domain": domain, "outcome": format!("{outcome:?}") }),
            );
        }
        CertificateCommands::ProvisionAcme { domain, force } => {
            let global: GlobalConfig = ctx.store().load().await?;
            let domains: DomainsFile = ctx.store().load().await?;
            let record = domains.find(&domain).ok_or_else(|| {
                CoreError::new(
                    ErrorKind::ConfigValidate,
                    format!("domain {domain:?} is not defined"),
                )
                .with("domain", &domain)
            })?;
            let outcome = stack.certs.ensure_acme(&ctx, &global, record, force).await?;
            out.emit(
                &format!("{domain}: {outcome:?}"),
                serde_json::json!({ "domain": domain, "outcome": format!("{outcome:?}") }),
            );
        }
    }
    Ok(())
}
