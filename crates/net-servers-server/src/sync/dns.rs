//! DNS zone projection: one forward zone per enabled domain, optional
//! reverse zones, monotonic date-prefixed SOA serials and a zone-check
//! gate before installation.

use super::{ApplyReport, Channel, Plan, PlanEntry, SyncSnapshot, Synchronizer};
use crate::reload::ReloadRequest;
use crate::runtime::RuntimeClient;
use async_trait::async_trait;
use chrono::{Datelike, Utc};
use net_servers_core::error::{CoreError, CoreResult, ErrorKind};
use net_servers_core::schema::Domain;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// Where the zones directory is mounted inside the dns container.
const CONTAINER_ZONES_DIR: &str = "/data/state/dns/zones";

pub struct DnsSynchronizer {
    /// Used for the zone-check gate and absent in tests; without a runtime
    /// the check is skipped with a warning.
    runtime: Option<Arc<RuntimeClient>>,
    /// Derived at plan time so `check` can exec into the right container.
    container: std::sync::Mutex<Option<String>>,
}

impl DnsSynchronizer {
    #[must_use]
    pub fn new(runtime: Option<Arc<RuntimeClient>>) -> Self {
        Self {
            runtime,
            container: std::sync::Mutex::new(None),
        }
    }
}

/// `max(previous + 1, YYYYMMDD01)`: rapid edits stay monotonic, fresh days
/// stay date-prefixed.
#[must_use]
pub fn next_serial(previous: Option<u64>, today: chrono::NaiveDate) -> u64 {
    let date_serial = u64::from(today.year() as u32) * 1_000_000
        + u64::from(today.month()) * 10_000
        + u64::from(today.day()) * 100
        + 1;
    match previous {
        Some(prev) => date_serial.max(prev + 1),
        None => date_serial,
    }
}

/// Pull the serial out of a previously installed zone file.
#[must_use]
pub fn parse_serial(content: &str) -> Option<u64> {
    content
        .lines()
        .find(|line| line.contains("; serial"))
        .and_then(|line| line.split_whitespace().next())
        .and_then(|token| token.parse().ok())
}

fn fqdn(name: &str, domain: &str) -> String {
    format!("{name}.{domain}.")
}

fn forward_zone(domain: &Domain, admin_email: &str, serial: u64) -> String {
    let origin = &domain.name;
    // RFC 1035 mailbox form of the admin address.
    let rname = admin_email.replacen('@', ".", 1);
    let ns = if domain.a_records.contains_key("dns") {
        "dns".to_string()
    } else {
        domain
            .a_records
            .keys()
            .next()
            .cloned()
            .unwrap_or_else(|| "ns1".to_string())
    };

    let mut out = String::new();
    out.push_str("$TTL 86400\n");
    out.push_str(&format!(
        "@\tIN\tSOA\t{} {}. (\n",
        fqdn(&ns, origin),
        rname.trim_end_matches('.')
    ));
    out.push_str(&format!("\t{serial} ; serial\n"));
    out.push_str("\t3600 ; refresh\n");
    out.push_str("\t1800 ; retry\n");
    out.push_str("\t604800 ; expire\n");
    out.push_str("\t86400 ) ; minimum\n");
    out.push_str(&format!("@\tIN\tNS\t{}\n", fqdn(&ns, origin)));
    if !domain.a_records.contains_key(&ns) {
        out.push_str(&format!("{ns}\tIN\tA\t127.0.0.1\n"));
    }

    for (i, mx) in domain.mx_records.iter().enumerate() {
        let priority = (i + 1) * 10;
        let target = if domain.external_mx.iter().any(|e| e == mx) {
            format!("{}.", mx.trim_end_matches('.'))
        } else if mx.contains('.') {
            format!("{}.", mx.trim_end_matches('.'))
        } else {
            fqdn(mx, origin)
        };
        out.push_str(&format!("@\tIN\tMX\t{priority}\t{target}\n"));
    }
    for (name, ip) in &domain.a_records {
        out.push_str(&format!("{name}\tIN\tA\t{ip}\n"));
    }
    for (alias, target) in &domain.cname_records {
        out.push_str(&format!("{alias}\tIN\tCNAME\t{target}\n"));
    }
    for (name, txt) in &domain.txt_records {
        out.push_str(&format!("{name}\tIN\tTXT\t\"{txt}\"\n"));
    }
    out
}

fn reverse_zone(domain: &Domain, admin_email: &str, serial: u64) -> String {
    let rname = admin_email.replacen('@', ".", 1);
    let mut out = String::new();
    out.push_str("$TTL 86400\n");
    out.push_str(&format!(
        "@\tIN\tSOA\tdns.{}. {}. (\n",
        domain.name,
        rname.trim_end_matches('.')
    ));
    out.push_str(&format!("\t{serial} ; serial\n"));
    out.push_str("\t3600 ; refresh\n");
    out.push_str("\t1800 ; retry\n");
    out.push_str("\t604800 ; expire\n");
    out.push_str("\t86400 ) ; minimum\n");
    out.push_str(&format!("@\tIN\tNS\tdns.{}.\n", domain.name));
    for (name, ip) in &domain.a_records {
        if let Some(last_octet) = ip.rsplit('.').next() {
            out.push_str(&format!(
                "{last_octet}\tIN\tPTR\t{}\n",
                fqdn(name, &domain.name)
            ));
        }
    }
    out
}

#[async_trait]
impl Synchronizer for DnsSynchronizer {
    fn name(&self) -> &'static str {
        "dns"
    }

    fn channels(&self) -> &'static [Channel] {
        &[Channel::Domains, Channel::Global]
    }

    async fn plan(&self, snap: &SyncSnapshot) -> CoreResult<Plan> {
        *self
            .container
            .lock()
            .expect("container name lock") = Some(snap.container_name("dns"));

        let zones_dir = snap.paths.dns_zones_dir();
        let mut plan = Plan {
            owned_roots: vec![zones_dir.clone()],
            ..Default::default()
        };
        let today = Utc::now().date_naive();
        let admin_email = &snap.global.system.admin_email;

        for domain in snap.domains.enabled() {
            let forward_path = zones_dir.join(format!("db.{}.zone", domain.name));
            let existing = tokio::fs::read_to_string(&forward_path).await.ok();
            let content =
                emit_zone(existing.as_deref(), today, |serial| {
                    forward_zone(domain, admin_email, serial)
                });
            plan.file(forward_path, content, 0o644);

            if domain.reverse_zone {
                let reverse_path = zones_dir.join(format!("db.{}.rev", domain.name));
                let existing = tokio::fs::read_to_string(&reverse_path).await.ok();
                let content =
                    emit_zone(existing.as_deref(), today, |serial| {
                        reverse_zone(domain, admin_email, serial)
                    });
                plan.file(reverse_path, content, 0o644);
            }
        }
        Ok(plan)
    }

    /// Validate every zone with the runtime's zone-check command before the
    /// apply installs anything. A failed check aborts with the validator's
    /// stderr; a missing runtime or stopped container only warns.
    async fn check(&self, plan: &Plan) -> CoreResult<()> {
        let Some(runtime) = &self.runtime else {
            return Ok(());
        };
        let container = self
            .container
            .lock()
            .expect("container name lock")
            .clone()
            .unwrap_or_default();

        match runtime.ps_names(false).await {
            Ok(names) if names.iter().any(|n| n == &container) => {}
            Ok(_) => {
                warn!(container, "dns container not running, skipping zone check");
                return Ok(());
            }
            Err(e) => {
                warn!("container runtime unavailable, skipping zone check: {e}");
                return Ok(());
            }
        }

        for entry in &plan.entries {
            let PlanEntry::File { path, content, .. } = entry else {
                continue;
            };
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(domain) = zone_domain(file_name) else {
                continue;
            };

            // Stage the candidate in the shared zones volume so the check
            // runs against the exact bytes about to be installed.
            let check_name = format!("{file_name}.check");
            let staged = path.with_file_name(&check_name);
            tokio::fs::write(&staged, content)
                .await
                .map_err(|e| CoreError::from_io(&e, &staged))?;
            let result = runtime
                .exec_in(
                    &container,
                    &[
                        "named-checkzone".to_string(),
                        domain.to_string(),
                        format!("{CONTAINER_ZONES_DIR}/{check_name}"),
                    ],
                )
                .await;
            let _ = tokio::fs::remove_file(&staged).await;

            if let Err(e) = result {
                let stderr = e.context.get("stderr").cloned().unwrap_or_default();
                return Err(CoreError::new(
                    ErrorKind::ZoneCheckFailed,
                    format!("zone check failed for {domain}"),
                )
                .with("domain", domain)
                .with("stderr", stderr));
            }
            info!(domain, "zone check passed");
        }
        Ok(())
    }

    fn reload(&self, _report: &ApplyReport, snap: &SyncSnapshot) -> Option<ReloadRequest> {
        Some(ReloadRequest {
            container: snap.container_name("dns"),
            command: vec!["rndc".to_string(), "reload".to_string()],
            full: true,
        })
    }
}

/// Re-render a zone, bumping the serial only when the body actually
/// changed; an unchanged zone keeps its bytes so the apply skips it.
fn emit_zone(
    existing: Option<&str>,
    today: chrono::NaiveDate,
    render: impl Fn(u64) -> String,
) -> String {
    if let (Some(existing), Some(previous)) = (existing, existing.and_then(parse_serial)) {
        if render(previous) == existing {
            return existing.to_string();
        }
        return render(next_serial(Some(previous), today));
    }
    render(next_serial(None, today))
}

/// `db.<domain>.zone` / `db.<domain>.rev` → `<domain>`.
fn zone_domain(file_name: &str) -> Option<&str> {
    file_name
        .strip_prefix("db.")?
        .strip_suffix(".zone")
        .or_else(|| file_name.strip_prefix("db.")?.strip_suffix(".rev"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::apply_plan;
    use chrono::NaiveDate;
    use net_servers_core::paths::Paths;
    use net_servers_core::schema::{
        CertificateMode, DomainsFile, GlobalConfig, ServicesFile, UsersFile,
    };
    use net_servers_core::secrets::SecretsFile;
    use std::collections::BTreeMap;
    use std::path::Path as StdPath;

    fn snapshot(base: &StdPath, reverse: bool) -> SyncSnapshot {
        SyncSnapshot {
            environment: "testing".to_string(),
            global: GlobalConfig::default(),
            users: UsersFile::default(),
            domains: DomainsFile {
                domains: vec![Domain {
                    name: "local.dev".to_string(),
                    enabled: true,
                    mx_records: vec!["mail".to_string()],
                    a_records: BTreeMap::from([
                        ("dns".to_string(), "172.20.0.30".to_string()),
                        ("mail".to_string(), "172.20.0.10".to_string()),
                        ("www".to_string(), "172.20.0.20".to_string()),
                    ]),
                    cname_records: BTreeMap::from([(
                        "webmail".to_string(),
                        "www".to_string(),
                    )]),
                    txt_records: BTreeMap::from([(
                        "@".to_string(),
                        "v=spf1 mx -all".to_string(),
                    )]),
                    external_mx: Vec::new(),
                    certificate_mode: CertificateMode::None,
                    reverse_zone: reverse,
                }],
            },
            services: ServicesFile::default(),
            secrets: SecretsFile::default(),
            paths: Paths::from_base(base.to_path_buf()),
        }
    }

    #[test]
    fn serial_is_monotonic_and_date_prefixed() {
        let today = NaiveDate::from_ymd_opt(2025, 3, 14).unwrap();
        assert_eq!(next_serial(None, today), 2025031401);
        assert_eq!(next_serial(Some(2025031401), today), 2025031402);
        // Rapid edits past the daily base stay monotonic.
        assert_eq!(next_serial(Some(2025031455), today), 2025031456);
        // An old serial jumps forward to today's base.
        assert_eq!(next_serial(Some(2024120199), today), 2025031401);
    }

    #[test]
    fn serial_round_trips_through_the_zone_text() {
        let snap_domain = Domain {
            name: "local.dev".to_string(),
            enabled: true,
            mx_records: vec!["mail".to_string()],
            a_records: BTreeMap::from([("mail".to_string(), "172.20.0.10".to_string())]),
            cname_records: BTreeMap::new(),
            txt_records: BTreeMap::new(),
            external_mx: Vec::new(),
            certificate_mode: CertificateMode::None,
            reverse_zone: false,
        };
        let text = forward_zone(&snap_domain, "admin@local.dev", 2025031407);
        assert_eq!(parse_serial(&text), Some(2025031407));
    }

    #[tokio::test]
    async fn emits_forward_zone_with_all_record_types() {
        let dir = tempfile::tempdir().unwrap();
        let snap = snapshot(dir.path(), false);
        let sync = DnsSynchronizer::new(None);

        let plan = sync.plan(&snap).await.unwrap();
        apply_plan(&plan).await;

        let zone = std::fs::read_to_string(
            snap.paths.dns_zones_dir().join("db.local.dev.zone"),
        )
        .unwrap();
        assert!(zone.contains("IN\tSOA\tdns.local.dev. admin.local.dev."));
        assert!(zone.contains("@\tIN\tMX\t10\tmail.local.dev.\n"));
        assert!(zone.contains("www\tIN\tA\t172.20.0.20\n"));
        assert!(zone.contains("webmail\tIN\tCNAME\twww\n"));
        assert!(zone.contains("@\tIN\tTXT\t\"v=spf1 mx -all\"\n"));
        assert!(!dir.path().join("state/dns/zones/db.local.dev.rev").exists());
    }

    #[tokio::test]
    async fn reapply_bumps_the_serial() {
        let dir = tempfile::tempdir().unwrap();
        let mut snap = snapshot(dir.path(), false);
        let sync = DnsSynchronizer::new(None);

        apply_plan(&sync.plan(&snap).await.unwrap()).await;
        let path = snap.paths.dns_zones_dir().join("db.local.dev.zone");
        let first = parse_serial(&std::fs::read_to_string(&path).unwrap()).unwrap();

        // Reconciling again without config changes is a no-op: same serial,
        // no write.
        let report = apply_plan(&sync.plan(&snap).await.unwrap()).await;
        assert!(!report.changed());
        assert_eq!(
            parse_serial(&std::fs::read_to_string(&path).unwrap()),
            Some(first)
        );

        // A content change re-emits with a strictly larger serial.
        snap.domains.domains[0]
            .a_records
            .insert("ftp".to_string(), "172.20.0.40".to_string());
        apply_plan(&sync.plan(&snap).await.unwrap()).await;
        let second = parse_serial(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert!(second > first, "{second} must exceed {first}");
    }

    #[tokio::test]
    async fn reverse_zone_carries_ptr_records() {
        let dir = tempfile::tempdir().unwrap();
        let snap = snapshot(dir.path(), true);
        let sync = DnsSynchronizer::new(None);

        apply_plan(&sync.plan(&snap).await.unwrap()).await;
        let rev = std::fs::read_to_string(
            snap.paths.dns_zones_dir().join("db.local.dev.rev"),
        )
        .unwrap();
        assert!(rev.contains("10\tIN\tPTR\tmail.local.dev.\n"));
        assert!(rev.contains("30\tIN\tPTR\tdns.local.dev.\n"));
    }

    #[test]
    fn zone_file_names_map_back_to_domains() {
        assert_eq!(zone_domain("db.local.dev.zone"), Some("local.dev"));
        assert_eq!(zone_domain("db.local.dev.rev"), Some("local.dev"));
        assert_eq!(zone_domain("db.local.dev.zone.check"), None);
        assert_eq!(zone_domain("notes.txt"), None);
    }
}
