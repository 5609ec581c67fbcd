//! Mail projections: Postfix lookup tables, the Dovecot passwd-file and the
//! vhosts mailbox tree.

use super::{ApplyReport, Channel, Plan, SyncSnapshot, Synchronizer};
use crate::reload::ReloadRequest;
use async_trait::async_trait;
use net_servers_core::error::CoreResult;
use std::collections::BTreeSet;
use tracing::warn;

const DEFAULT_VMAIL_UID: u32 = 5000;
const DEFAULT_VMAIL_GID: u32 = 5000;

pub struct MailSynchronizer {
    /// Skip chown of the mailbox tree; tests run unprivileged.
    own_mailboxes: bool,
}

impl MailSynchronizer {
    /// Mailbox ownership can only be applied when running as root; an
    /// unprivileged control plane still writes every projection.
    #[must_use]
    pub fn new() -> Self {
        Self {
            own_mailboxes: nix::unistd::Uid::effective().is_root(),
        }
    }

    #[must_use]
    pub fn without_ownership() -> Self {
        Self {
            own_mailboxes: false,
        }
    }
}

impl Default for MailSynchronizer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Synchronizer for MailSynchronizer {
    fn name(&self) -> &'static str {
        "mail"
    }

    fn channels(&self) -> &'static [Channel] {
        &[
            Channel::Users,
            Channel::Domains,
            Channel::Secrets,
            Channel::Global,
        ]
    }

    async fn plan(&self, snap: &SyncSnapshot) -> CoreResult<Plan> {
        let mail_dir = snap.paths.mail_dir();
        let vhosts = snap.paths.vhosts_dir();
        let mut plan = Plan {
            owned_roots: vec![mail_dir.clone()],
            ..Default::default()
        };

        let enabled_domains: Vec<_> = snap.domains.enabled().collect();
        let domain_names: BTreeSet<&str> =
            enabled_domains.iter().map(|d| d.name.as_str()).collect();

        // virtual_domains: one per line with an OK token for lookup tables.
        let mut virtual_domains = String::new();
        for domain in &enabled_domains {
            virtual_domains.push_str(&domain.name);
            virtual_domains.push_str(" OK\n");
        }
        plan.file(mail_dir.join("virtual_domains"), virtual_domains, 0o644);

        // virtual_mailboxes: every enabled user/domain pair.
        let mut virtual_mailboxes = String::new();
        for user in snap.users.enabled() {
            for domain in &user.domains {
                if domain_names.contains(domain.as_str()) {
                    virtual_mailboxes.push_str(&format!(
                        "{}@{} {}/{}/\n",
                        user.username, domain, domain, user.username
                    ));
                }
            }
        }
        plan.file(mail_dir.join("virtual_mailboxes"), virtual_mailboxes, 0o644);

        // virtual_aliases: explicit aliases plus a postmaster fallback per
        // domain pointing at an admin, unless one is already defined.
        let mut alias_lines: Vec<String> = Vec::new();
        let mut postmaster_defined: BTreeSet<&str> = BTreeSet::new();
        for user in snap.users.enabled() {
            for domain in &user.domains {
                if !domain_names.contains(domain.as_str()) {
                    continue;
                }
                for alias in &user.aliases {
                    if alias == "postmaster" {
                        postmaster_defined.insert(domain.as_str());
                    }
                    alias_lines.push(format!(
                        "{}@{} {}@{}\n",
                        alias, domain, user.username, domain
                    ));
                }
            }
        }
        for domain in &enabled_domains {
            if postmaster_defined.contains(domain.name.as_str()) {
                continue;
            }
            if let Some(admin) = snap
                .users
                .enabled()
                .find(|u| u.is_admin() && u.domains.contains(&domain.name))
            {
                alias_lines.push(format!(
                    "postmaster@{} {}@{}\n",
                    domain.name, admin.username, domain.name
                ));
            }
        }
        plan.file(
            mail_dir.join("virtual_aliases"),
            alias_lines.concat(),
            0o644,
        );

        // dovecot-users: passwd-file entries, one per mailbox.
        let uid = snap.global.section_u32("mail", "vmail_uid", DEFAULT_VMAIL_UID);
        let gid = snap.global.section_u32("mail", "vmail_gid", DEFAULT_VMAIL_GID);
        let mut dovecot_users = String::new();
        for user in snap.users.enabled() {
            let Some(secret) = snap.secrets.user(&user.username) else {
                warn!(user = %user.username, "no secret configured, omitting from dovecot-users");
                continue;
            };
            let credential = if let Some(hash) = secret.schemes.get("sha512-crypt") {
                format!("{{SHA512-CRYPT}}{}", hash.expose())
            } else if let Some(password) = secret.for_scheme("plain") {
                format!("{{PLAIN}}{}", password.expose())
            } else {
                warn!(user = %user.username, "no usable scheme, omitting from dovecot-users");
                continue;
            };
            for domain in &user.domains {
                if !domain_names.contains(domain.as_str()) {
                    continue;
                }
                dovecot_users.push_str(&format!(
                    "{user}@{domain}:{credential}:{uid}:{gid}::/data/state/mail/vhosts/{domain}/{user}::userdb_quota_rule=*:storage={quota}\n",
                    user = user.username,
                    domain = domain,
                    credential = credential,
                    uid = uid,
                    gid = gid,
                    quota = user.mailbox_quota,
                ));
            }
        }
        plan.file(mail_dir.join("dovecot-users"), dovecot_users, 0o640);

        // Mailbox tree: one directory per enabled user/domain pair.
        let owner = self.own_mailboxes.then_some((uid, gid));
        plan.dir(vhosts.clone(), owner);
        for domain in &enabled_domains {
            plan.dir(vhosts.join(&domain.name), owner);
        }
        for user in snap.users.enabled() {
            for domain in &user.domains {
                if domain_names.contains(domain.as_str()) {
                    plan.dir(vhosts.join(domain).join(&user.username), owner);
                }
            }
        }

        Ok(plan)
    }

    fn reload(&self, report: &ApplyReport, snap: &SyncSnapshot) -> Option<ReloadRequest> {
        let container = snap.container_name("mail");
        let mail_dir = snap.paths.mail_dir();
        let alias_file = mail_dir.join("virtual_aliases");
        let domains_file = mail_dir.join("virtual_domains");

        // Alias or domain table changes only need the lookup tables rebuilt;
        // anything touching the user list restarts the daemons' view.
        if report.only_touched(&[alias_file.as_path(), domains_file.as_path()]) {
            Some(ReloadRequest {
                container,
                command: vec![
                    "postmap".to_string(),
                    "/data/state/mail/virtual_aliases".to_string(),
                ],
                full: false,
            })
        } else {
            Some(ReloadRequest {
                container,
                command: vec![
                    "sh".to_string(),
                    "-c".to_string(),
                    "postfix reload && doveadm reload".to_string(),
                ],
                full: true,
            })
        }
    }
}
