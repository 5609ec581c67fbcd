//! Certificate lifecycle: self-signed issuance, ACME orders through an
//! external client, renewal tracking and downstream notification.
//!
//! Outputs land under `<state>/certificates/<domain>/` as the PEM triple
//! plus a `meta.yaml` record that drives renewal decisions. Every
//! successful issuance is published as [`Event::CertificatesChanged`] on
//! the framework bus; the mail and http synchronizers react by
//! reconciling, so neither side holds a handle to the other.

use crate::sync::{Event, EventBus};
use net_servers_core::error::{CoreError, CoreResult, ErrorKind};
use net_servers_core::fsutil::write_atomic;
use net_servers_core::paths::Paths;
use net_servers_core::schema::{CertificateMeta, CertificateMode, Domain, GlobalConfig};
use net_servers_core::secrets::Secret;
use net_servers_core::CoreContext;
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

/// Renewal window before `not_after`.
const RENEWAL_WINDOW_DAYS: i64 = 30;
const ACME_TIMEOUT: Duration = Duration::from_secs(300);
const ACME_MAX_ATTEMPTS: usize = 5;

#[derive(Debug, Clone)]
pub struct AcmeSettings {
    pub client: String,
    pub directory: Option<String>,
    pub challenge: String,
}

impl AcmeSettings {
    /// Read the `acme` section of `global.yaml`, with certbot-compatible
    /// defaults.
    #[must_use]
    pub fn from_global(global: &GlobalConfig) -> Self {
        Self {
            client: global
                .section_str("acme", "client")
                .unwrap_or("certbot")
                .to_string(),
            directory: global.section_str("acme", "directory").map(str::to_string),
            challenge: global
                .section_str("acme", "challenge")
                .unwrap_or("http-01")
                .to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueOutcome {
    Issued,
    Renewed,
    Unchanged,
    Skipped,
}

pub struct CertificateManager {
    bus: EventBus,
}

impl CertificateManager {
    #[must_use]
    pub fn new(bus: EventBus) -> Self {
        Self { bus }
    }

    /// Ensure every enabled domain has the certificate its mode demands.
    /// Runs before the synchronizers in a reconcile so downstream output
    /// only ever references material that already exists.
    pub async fn ensure_all(&self, ctx: &CoreContext, force: bool) -> CoreResult<Vec<(String, IssueOutcome)>> {
        let global: GlobalConfig = ctx.store().load().await?;
        let domains: net_servers_core::schema::DomainsFile = ctx.store().load().await?;
        let mut outcomes = Vec::new();
        for domain in domains.enabled() {
            let outcome = match domain.certificate_mode {
                CertificateMode::None => IssueOutcome::Skipped,
                CertificateMode::SelfSigned => {
                    self.ensure_self_signed(ctx.paths(), domain, force)
                        .await?
                }
                CertificateMode::Acme => self.ensure_acme(ctx, &global, domain, force).await?,
            };
            outcomes.push((domain.name.clone(), outcome));
        }
        Ok(outcomes)
    }

    /// Issue or renew a self-signed certificate for one domain.
    pub async fn ensure_self_signed(
        &self,
        paths: &Paths,
        domain: &Domain,
        force: bool,
    ) -> CoreResult<IssueOutcome> {
        let dir = paths.certificate_dir(&domain.name);
        let existing = read_meta(&dir).await;
        if !force {
            if let Some(meta) = &existing {
                if !meta.due_for_renewal(chrono::Utc::now(), RENEWAL_WINDOW_DAYS)
                    && triple_exists(&dir)
                {
                    return Ok(IssueOutcome::Unchanged);
                }
            }
        }

        let san = san_names(domain);
        let not_before = chrono::Utc::now();
        let not_after = not_before + chrono::Duration::days(365);

        let issued = tokio::task::spawn_blocking(move || -> Result<IssuedPem, rcgen::Error> {
            use chrono::Datelike;
            let mut params = CertificateParams::new(san)?;
            let mut dn = DistinguishedName::new();
            dn.push(DnType::OrganizationName, "net-servers");
            params.distinguished_name = dn;
            params.not_before =
                rcgen::date_time_ymd(not_before.year(), not_before.month() as u8, not_before.day() as u8);
            params.not_after =
                rcgen::date_time_ymd(not_after.year(), not_after.month() as u8, not_after.day() as u8);

            let key_pair = KeyPair::generate()?;
            let cert = params.self_signed(&key_pair)?;
            Ok(IssuedPem {
                cert_pem: cert.pem(),
                key_pem: key_pair.serialize_pem(),
                fingerprint: hex_sha256(cert.der()),
            })
        })
        .await
        .map_err(|e| CoreError::new(ErrorKind::CertIssueFailed, format!("issuance task panicked: {e}")))?
        .map_err(|e| {
            CoreError::new(
                ErrorKind::CertIssueFailed,
                format!("self-signed issuance failed for {}", domain.name),
            )
            .with("domain", &domain.name)
            .with("cause", e)
        })?;

        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| CoreError::from_io(&e, &dir))?;
        write_atomic(&dir.join("privkey.pem"), issued.key_pem.as_bytes(), 0o600).await?;
        write_atomic(&dir.join("cert.pem"), issued.cert_pem.as_bytes(), 0o644).await?;
        // Self-signed chains are the certificate itself.
        write_atomic(&dir.join("fullchain.pem"), issued.cert_pem.as_bytes(), 0o644).await?;

        let meta = CertificateMeta {
            domain: domain.name.clone(),
            mode: CertificateMode::SelfSigned,
            not_before,
            not_after,
            fingerprint_sha256: issued.fingerprint,
        };
        write_meta(&dir, &meta).await?;

        info!(domain = %domain.name, "issued self-signed certificate");
        self.bus.publish(Event::CertificatesChanged {
            domain: domain.name.clone(),
        });
        Ok(if existing.is_some() {
            IssueOutcome::Renewed
        } else {
            IssueOutcome::Issued
        })
    }

    /// Order an ACME certificate through the external client, retrying with
    /// exponential backoff. The account key is held in `secrets.yaml`.
    pub async fn ensure_acme(
        &self,
        ctx: &CoreContext,
        global: &GlobalConfig,
        domain: &Domain,
        force: bool,
    ) -> CoreResult<IssueOutcome> {
        let dir = ctx.paths().certificate_dir(&domain.name);
        let existing = read_meta(&dir).await;
        if !force {
            if let Some(meta) = &existing {
                if !meta.due_for_renewal(chrono::Utc::now(), RENEWAL_WINDOW_DAYS)
                    && triple_exists(&dir)
                {
                    return Ok(IssueOutcome::Unchanged);
                }
            }
        }

        self.ensure_account_key(ctx).await?;
        let settings = AcmeSettings::from_global(global);
        let args = acme_args(&settings, global, domain, &dir);

        let mut last_err = None;
        for attempt in 0..ACME_MAX_ATTEMPTS {
            match run_acme_client(&settings.client, &args).await {
                Ok(()) => {
                    last_err = None;
                    break;
                }
                Err(e) => {
                    warn!(domain = %domain.name, attempt, "acme order failed: {e}");
                    last_err = Some(e);
                    if attempt + 1 < ACME_MAX_ATTEMPTS {
                        tokio::time::sleep(backoff_delay(attempt)).await;
                    }
                }
            }
        }
        if let Some(e) = last_err {
            return Err(e);
        }

        let cert_pem = tokio::fs::read(dir.join("cert.pem"))
            .await
            .map_err(|e| CoreError::from_io(&e, &dir.join("cert.pem")))?;
        let not_before = chrono::Utc::now();
        let meta = CertificateMeta {
            domain: domain.name.clone(),
            mode: CertificateMode::Acme,
            not_before,
            // ACME certificates run 90 days; the renewal window re-orders in
            // good time either way.
            not_after: not_before + chrono::Duration::days(90),
            fingerprint_sha256: hex_sha256(&cert_pem),
        };
        write_meta(&dir, &meta).await?;

        info!(domain = %domain.name, "acme certificate ordered");
        self.bus.publish(Event::CertificatesChanged {
            domain: domain.name.clone(),
        });
        Ok(if existing.is_some() {
            IssueOutcome::Renewed
        } else {
            IssueOutcome::Issued
        })
    }

    async fn ensure_account_key(&self, ctx: &CoreContext) -> CoreResult<()> {
        let mut secrets: net_servers_core::secrets::SecretsFile = ctx.store().load().await?;
        if secrets.acme_account_key.is_some() {
            return Ok(());
        }
        let key = tokio::task::spawn_blocking(|| {
            KeyPair::generate().map(|kp| kp.serialize_pem())
        })
        .await
        .map_err(|e| CoreError::new(ErrorKind::CertIssueFailed, e.to_string()))?
        .map_err(|e| {
            CoreError::new(ErrorKind::CertIssueFailed, "account key generation failed")
                .with("cause", e)
        })?;
        secrets.acme_account_key = Some(Secret::new(key));
        ctx.store().save(&secrets).await?;
        info!("generated acme account key");
        Ok(())
    }

    /// Metadata for every certificate on disk.
    pub async fn list(&self, paths: &Paths) -> CoreResult<Vec<CertificateMeta>> {
        let root = paths.certificates_dir();
        let mut out = Vec::new();
        let Ok(mut entries) = tokio::fs::read_dir(&root).await else {
            return Ok(out);
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            if entry.path().is_dir() {
                if let Some(meta) = read_meta(&entry.path()).await {
                    out.push(meta);
                }
            }
        }
        out.sort_by(|a, b| a.domain.cmp(&b.domain));
        Ok(out)
    }

    pub async fn info(&self, paths: &Paths, domain: &str) -> CoreResult<CertificateMeta> {
        read_meta(&paths.certificate_dir(domain)).await.ok_or_else(|| {
            CoreError::new(
                ErrorKind::CertExpired,
                format!("no certificate metadata for {domain:?}"),
            )
            .with("domain", domain)
        })
    }
}

struct IssuedPem {
    cert_pem: String,
    key_pem: String,
    fingerprint: String,
}

/// The domain itself plus every `a_records` short name under it.
fn san_names(domain: &Domain) -> Vec<String> {
    let mut names = vec![domain.name.clone()];
    names.extend(
        domain
            .a_records
            .keys()
            .map(|short| format!("{short}.{}", domain.name)),
    );
    names
}

fn hex_sha256(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

fn triple_exists(dir: &PathBuf) -> bool {
    ["cert.pem", "privkey.pem", "fullchain.pem"]
        .iter()
        .all(|f| dir.join(f).exists())
}

async fn read_meta(dir: &PathBuf) -> Option<CertificateMeta> {
    let text = tokio::fs::read_to_string(dir.join("meta.yaml")).await.ok()?;
    serde_yaml::from_str(&text).ok()
}

async fn write_meta(dir: &PathBuf, meta: &CertificateMeta) -> CoreResult<()> {
    let text = serde_yaml::to_string(meta).map_err(|e| {
        CoreError::new(ErrorKind::CertIssueFailed, format!("meta serialization failed: {e}"))
    })?;
    write_atomic(&dir.join("meta.yaml"), text.as_bytes(), 0o644).await
}

/// Exponential backoff with base 5 s, cap 5 min and ±20% jitter.
#[must_use]
pub fn backoff_delay(attempt: usize) -> Duration {
    use rand::Rng;
    let base = 5f64 * 2f64.powi(attempt as i32);
    let capped = base.min(300.0);
    let jitter = rand::thread_rng().gen_range(0.8..=1.2);
    Duration::from_secs_f64(capped * jitter)
}

fn acme_args(
    settings: &AcmeSettings,
    global: &GlobalConfig,
    domain: &Domain,
    dir: &PathBuf,
) -> Vec<String> {
    let mut args = vec![
        "certonly".to_string(),
        "--non-interactive".to_string(),
        "--agree-tos".to_string(),
        "--email".to_string(),
        global.system.admin_email.clone(),
        "--preferred-challenges".to_string(),
        settings.challenge.clone(),
    ];
    if let Some(directory) = &settings.directory {
        args.extend(["--server".to_string(), directory.clone()]);
    }
    for name in san_names(domain) {
        args.extend(["-d".to_string(), name]);
    }
    args.extend([
        "--cert-path".to_string(),
        dir.join("cert.pem").display().to_string(),
        "--key-path".to_string(),
        dir.join("privkey.pem").display().to_string(),
        "--fullchain-path".to_string(),
        dir.join("fullchain.pem").display().to_string(),
        "--config-dir".to_string(),
        dir.join("acme").display().to_string(),
        "--work-dir".to_string(),
        dir.join("acme/work").display().to_string(),
        "--logs-dir".to_string(),
        dir.join("acme/logs").display().to_string(),
    ]);
    args
}

async fn run_acme_client(client: &str, args: &[String]) -> CoreResult<()> {
    let child = tokio::process::Command::new(client)
        .args(args)
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| {
            CoreError::new(
                ErrorKind::CertIssueFailed,
                format!("acme client {client:?} could not be started: {e}"),
            )
            .with("client", client)
        })?;

    let output = tokio::time::timeout(ACME_TIMEOUT, child.wait_with_output())
        .await
        .map_err(|_| {
            CoreError::new(ErrorKind::CertIssueFailed, "acme client timed out")
                .with("timeout_secs", ACME_TIMEOUT.as_secs())
        })?
        .map_err(|e| CoreError::new(ErrorKind::CertIssueFailed, e.to_string()))?;

    if output.status.success() {
        Ok(())
    } else {
        // The client prints the provider's problem document on stderr.
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        Err(
            CoreError::new(ErrorKind::CertIssueFailed, "acme order rejected")
                .with("problem", stderr),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use net_servers_core::schema::CertificateMode;
    use std::collections::BTreeMap;
    use std::os::unix::fs::PermissionsExt;

    fn domain() -> Domain {
        Domain {
            name: "local.dev".to_string(),
            enabled: true,
            mx_records: vec!["mail".to_string()],
            a_records: BTreeMap::from([
                ("mail".to_string(), "172.20.0.10".to_string()),
                ("www".to_string(), "172.20.0.20".to_string()),
            ]),
            cname_records: BTreeMap::new(),
            txt_records: BTreeMap::new(),
            external_mx: Vec::new(),
            certificate_mode: CertificateMode::SelfSigned,
            reverse_zone: false,
        }
    }

    #[tokio::test]
    async fn self_signed_issuance_writes_the_triple() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::from_base(dir.path().to_path_buf());
        let bus = EventBus::new();
        let mut events = bus.subscribe();
        let manager = CertificateManager::new(bus);

        let outcome = manager
            .ensure_self_signed(&paths, &domain(), false)
            .await
            .unwrap();
        assert_eq!(outcome, IssueOutcome::Issued);

        let cert_dir = paths.certificate_dir("local.dev");
        let cert = std::fs::read_to_string(cert_dir.join("cert.pem")).unwrap();
        let fullchain = std::fs::read_to_string(cert_dir.join("fullchain.pem")).unwrap();
        assert!(cert.starts_with("-----BEGIN CERTIFICATE-----"));
        assert_eq!(cert, fullchain);

        let key_mode = std::fs::metadata(cert_dir.join("privkey.pem"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(key_mode & 0o777, 0o600);

        let meta: CertificateMeta =
            serde_yaml::from_str(&std::fs::read_to_string(cert_dir.join("meta.yaml")).unwrap())
                .unwrap();
        assert!(meta.not_after - meta.not_before >= chrono::Duration::days(364));
        assert_eq!(meta.fingerprint_sha256.len(), 64);

        match events.try_recv() {
            Ok(Event::CertificatesChanged { domain }) => assert_eq!(domain, "local.dev"),
            other => panic!("expected CertificatesChanged, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn fresh_certificate_is_not_reissued_without_force() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::from_base(dir.path().to_path_buf());
        let manager = CertificateManager::new(EventBus::new());

        manager
            .ensure_self_signed(&paths, &domain(), false)
            .await
            .unwrap();
        let meta_before = manager.info(&paths, "local.dev").await.unwrap();

        let outcome = manager
            .ensure_self_signed(&paths, &domain(), false)
            .await
            .unwrap();
        assert_eq!(outcome, IssueOutcome::Unchanged);
        let meta_after = manager.info(&paths, "local.dev").await.unwrap();
        assert_eq!(meta_before.fingerprint_sha256, meta_after.fingerprint_sha256);

        let outcome = manager
            .ensure_self_signed(&paths, &domain(), true)
            .await
            .unwrap();
        assert_eq!(outcome, IssueOutcome::Renewed);
        let meta_forced = manager.info(&paths, "local.dev").await.unwrap();
        assert_ne!(meta_before.fingerprint_sha256, meta_forced.fingerprint_sha256);
    }

    #[tokio::test]
    async fn list_returns_every_domain_with_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::from_base(dir.path().to_path_buf());
        let manager = CertificateManager::new(EventBus::new());

        manager
            .ensure_self_signed(&paths, &domain(), false)
            .await
            .unwrap();
        let mut other = domain();
        other.name = "dev.local".to_string();
        manager
            .ensure_self_signed(&paths, &other, false)
            .await
            .unwrap();

        let listed = manager.list(&paths).await.unwrap();
        let names: Vec<_> = listed.iter().map(|m| m.domain.as_str()).collect();
        assert_eq!(names, ["dev.local", "local.dev"]);
    }

    #[test]
    fn backoff_grows_and_caps_with_jitter() {
        for attempt in 0..10 {
            let delay = backoff_delay(attempt).as_secs_f64();
            let base = (5f64 * 2f64.powi(attempt as i32)).min(300.0);
            assert!(delay >= base * 0.8 - f64::EPSILON);
            assert!(delay <= base * 1.2 + f64::EPSILON);
        }
        assert!(backoff_delay(9).as_secs_f64() <= 360.0);
    }

    #[test]
    fn san_covers_domain_and_short_names() {
        assert_eq!(
            san_names(&domain()),
            ["local.dev", "mail.local.dev", "www.local.dev"]
        );
    }
}
