//! HTTP digest-auth projection: one htdigest file per realm.

use super::{ApplyReport, Channel, Plan, SyncSnapshot, Synchronizer};
use crate::reload::ReloadRequest;
use async_trait::async_trait;
use md5::{Digest, Md5};
use net_servers_core::error::CoreResult;
use serde_yaml::Value;
use tracing::warn;

pub const DEFAULT_REALM: &str = "WebDAV Secure Area";

pub struct HttpAuthSynchronizer {
    /// Used by the test harness: files are still written atomically, the
    /// graceful reload is not requested.
    pub skip_reload: bool,
}

impl HttpAuthSynchronizer {
    #[must_use]
    pub fn new() -> Self {
        Self { skip_reload: false }
    }
}

impl Default for HttpAuthSynchronizer {
    fn default() -> Self {
        Self::new()
    }
}

fn realms(snap: &SyncSnapshot) -> Vec<String> {
    let configured = snap
        .services
        .find("apache")
        .and_then(|svc| svc.settings.get("auth_realms").cloned())
        .and_then(|v| match v {
            Value::Sequence(seq) => Some(
                seq.iter()
                    .filter_map(|s| s.as_str().map(str::to_string))
                    .collect::<Vec<_>>(),
            ),
            _ => None,
        })
        .unwrap_or_default();
    if configured.is_empty() {
        vec![DEFAULT_REALM.to_string()]
    } else {
        configured
    }
}

/// `MD5(user:realm:password)`, the htdigest HA1.
fn ha1(user: &str, realm: &str, password: &str) -> String {
    let digest = Md5::digest(format!("{user}:{realm}:{password}").as_bytes());
    format!("{digest:x}")
}

#[async_trait]
impl Synchronizer for HttpAuthSynchronizer {
    fn name(&self) -> &'static str {
        "http-auth"
    }

    fn channels(&self) -> &'static [Channel] {
        &[Channel::Users, Channel::Secrets, Channel::Services]
    }

    async fn plan(&self, snap: &SyncSnapshot) -> CoreResult<Plan> {
        let auth_dir = snap.paths.apache_auth_dir();
        let mut plan = Plan {
            owned_roots: vec![auth_dir.clone()],
            ..Default::default()
        };

        for realm in realms(snap) {
            let scheme = format!("digest-{realm}");
            let mut lines = String::new();
            for user in snap.users.enabled() {
                let Some(secret) = snap.secrets.user(&user.username) else {
                    warn!(user = %user.username, realm = %realm, "no digest secret, omitting");
                    continue;
                };
                let Some(password) = secret.for_scheme(&scheme) else {
                    warn!(user = %user.username, realm = %realm, "no digest secret, omitting");
                    continue;
                };
                lines.push_str(&format!(
                    "{}:{}:{}\n",
                    user.username,
                    realm,
                    ha1(&user.username, &realm, password.expose())
                ));
            }
            plan.file(auth_dir.join(format!("{realm}.htdigest")), lines, 0o644);
        }
        Ok(plan)
    }

    fn reload(&self, _report: &ApplyReport, snap: &SyncSnapshot) -> Option<ReloadRequest> {
        if self.skip_reload {
            return None;
        }
        Some(ReloadRequest {
            container: snap.container_name("apache"),
            command: vec!["/usr/sbin/apache2ctl".to_string(), "graceful".to_string()],
            full: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::apply_plan;
    use net_servers_core::paths::Paths;
    use net_servers_core::schema::{
        DomainsFile, GlobalConfig, ServicesFile, User, UsersFile,
    };
    use net_servers_core::secrets::{Secret, SecretsFile};
    use std::collections::BTreeMap;
    use std::path::Path;

    fn snapshot(base: &Path) -> SyncSnapshot {
        let mut secrets = SecretsFile::default();
        secrets.set_password("admin", Secret::new("s3cret"));
        SyncSnapshot {
            environment: "testing".to_string(),
            global: GlobalConfig::default(),
            users: UsersFile {
                users: vec![
                    User {
                        username: "admin".to_string(),
                        email: "admin@local.dev".to_string(),
                        domains: vec!["local.dev".to_string()],
                        roles: vec!["admin".to_string()],
                        mailbox_quota: "1G".to_string(),
                        enabled: true,
                        aliases: Vec::new(),
                        password_hashes: BTreeMap::new(),
                    },
                    User {
                        username: "nosecret".to_string(),
                        email: "nosecret@local.dev".to_string(),
                        domains: vec!["local.dev".to_string()],
                        roles: vec!["user".to_string()],
                        mailbox_quota: "500M".to_string(),
                        enabled: true,
                        aliases: Vec::new(),
                        password_hashes: BTreeMap::new(),
                    },
                ],
            },
            domains: DomainsFile::default(),
            services: ServicesFile::default(),
            secrets,
            paths: Paths::from_base(base.to_path_buf()),
        }
    }

    #[test]
    fn ha1_matches_the_htdigest_reference() {
        // md5("admin:WebDAV Secure Area:s3cret")
        assert_eq!(
            ha1("admin", "WebDAV Secure Area", "s3cret"),
            format!(
                "{:x}",
                Md5::digest(b"admin:WebDAV Secure Area:s3cret".as_slice())
            )
        );
    }

    #[tokio::test]
    async fn writes_one_entry_per_user_with_secret() {
        let dir = tempfile::tempdir().unwrap();
        let snap = snapshot(dir.path());
        let sync = HttpAuthSynchronizer::new();

        let plan = sync.plan(&snap).await.unwrap();
        let report = apply_plan(&plan).await;
        assert!(report.errors.is_empty());

        let content = std::fs::read_to_string(
            snap.paths
                .apache_auth_dir()
                .join("WebDAV Secure Area.htdigest"),
        )
        .unwrap();
        let expected = format!(
            "admin:WebDAV Secure Area:{}\n",
            ha1("admin", "WebDAV Secure Area", "s3cret")
        );
        assert_eq!(content, expected);
    }

    #[tokio::test]
    async fn realm_specific_secret_overrides_plain_password() {
        let dir = tempfile::tempdir().unwrap();
        let mut snap = snapshot(dir.path());
        snap.secrets
            .users
            .get_mut("admin")
            .unwrap()
            .schemes
            .insert(
                format!("digest-{DEFAULT_REALM}"),
                Secret::new("realm-only"),
            );
        let sync = HttpAuthSynchronizer::new();

        let plan = sync.plan(&snap).await.unwrap();
        apply_plan(&plan).await;
        let content = std::fs::read_to_string(
            snap.paths
                .apache_auth_dir()
                .join("WebDAV Secure Area.htdigest"),
        )
        .unwrap();
        assert!(content.contains(&ha1("admin", DEFAULT_REALM, "realm-only")));
        assert!(!content.contains(&ha1("admin", DEFAULT_REALM, "s3cret")));
    }

    #[test]
    fn skip_reload_suppresses_the_request() {
        let dir = tempfile::tempdir().unwrap();
        let snap = snapshot(dir.path());
        let report = ApplyReport::default();

        let sync = HttpAuthSynchronizer::new();
        assert!(sync.reload(&report, &snap).is_some());

        let sync = HttpAuthSynchronizer { skip_reload: true };
        assert!(sync.reload(&report, &snap).is_none());
    }
}
