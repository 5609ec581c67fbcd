//! Composable validation rules.
//!
//! Field-format rules are free functions pushing [`Issue`]s; cross-document
//! rules take the already-parsed records. The store composes these per
//! document and [`validate_composite`] runs the full set for transactions.

use crate::error::Issue;
use crate::schema::{DomainsFile, UsersFile};

pub fn email_format(value: &str, path: &str, issues: &mut Vec<Issue>) {
    let Some((local, domain)) = value.split_once('@') else {
        issues.push(Issue::new(
            path,
            "email_format",
            format!("{value:?} is not an email address"),
        ));
        return;
    };
    if local.is_empty() || domain.is_empty() || !domain.contains('.') || value.contains(' ') {
        issues.push(Issue::new(
            path,
            "email_format",
            format!("{value:?} is not an email address"),
        ));
    }
}

pub fn fqdn_format(value: &str, path: &str, issues: &mut Vec<Issue>) {
    let valid = !value.is_empty()
        && value.len() <= 253
        && value.contains('.')
        && !value.starts_with('.')
        && !value.ends_with('.')
        && value.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        });
    if !valid {
        issues.push(Issue::new(
            path,
            "fqdn_format",
            format!("{value:?} is not a fully-qualified domain name"),
        ));
    }
}

/// Usernames are lowercase DNS-label-safe: `[a-z][a-z0-9-]*`, max 63 chars.
pub fn username_format(value: &str, path: &str, issues: &mut Vec<Issue>) {
    let mut chars = value.chars();
    let valid = matches!(chars.next(), Some(c) if c.is_ascii_lowercase())
        && value.len() <= 63
        && !value.ends_with('-')
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    if !valid {
        issues.push(Issue::new(
            path,
            "username_format",
            format!("{value:?} must match [a-z][a-z0-9-]* and stay DNS-label-safe"),
        ));
    }
}

/// Environment names share the username charset.
pub fn env_name_format(value: &str, path: &str, issues: &mut Vec<Issue>) {
    let mut chars = value.chars();
    let valid = matches!(chars.next(), Some(c) if c.is_ascii_lowercase())
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    if !valid {
        issues.push(Issue::new(
            path,
            "env_name_format",
            format!("{value:?} must match [a-z][a-z0-9-]*"),
        ));
    }
}

pub fn ipv4_format(value: &str, path: &str, issues: &mut Vec<Issue>) {
    if value.parse::<std::net::Ipv4Addr>().is_err() {
        issues.push(Issue::new(
            path,
            "ipv4_format",
            format!("{value:?} is not an IPv4 address"),
        ));
    }
}

/// Human sizes like `500M` or `1G`.
pub fn mailbox_quota_format(value: &str, path: &str, issues: &mut Vec<Issue>) {
    if parse_size(value).is_none() {
        issues.push(Issue::new(
            path,
            "mailbox_quota_format",
            format!("{value:?} is not a size (expected e.g. 500M or 1G)"),
        ));
    }
}

/// Parse a human size into bytes. Accepts a bare byte count or a `K`/`M`/`G`
/// suffix.
#[must_use]
pub fn parse_size(value: &str) -> Option<u64> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    let (digits, factor) = match value.chars().last()? {
        'K' | 'k' => (&value[..value.len() - 1], 1024u64),
        'M' | 'm' => (&value[..value.len() - 1], 1024 * 1024),
        'G' | 'g' => (&value[..value.len() - 1], 1024 * 1024 * 1024),
        c if c.is_ascii_digit() => (value, 1),
        _ => return None,
    };
    digits.parse::<u64>().ok()?.checked_mul(factor)
}

/// Every domain a user lists must exist in the domain registry.
pub fn user_domains_exist(users: &UsersFile, domains: &DomainsFile, issues: &mut Vec<Issue>) {
    for (i, user) in users.users.iter().enumerate() {
        for domain in &user.domains {
            if domains.find(domain).is_none() {
                issues.push(Issue::new(
                    format!("users[{i}].domains"),
                    "user_domains_exist",
                    format!(
                        "user {:?} references unknown domain {:?}",
                        user.username, domain
                    ),
                ));
            }
        }
    }
}

/// Every MX target must resolve to an `a_records` short name in some domain,
/// or be explicitly marked external.
pub fn mx_targets_resolve(domains: &DomainsFile, issues: &mut Vec<Issue>) {
    for (i, domain) in domains.domains.iter().enumerate() {
        for mx in &domain.mx_records {
            if domain.external_mx.iter().any(|e| e == mx) {
                continue;
            }
            // A short name resolves against a_records of any defined domain;
            // `mail.example.dev` also matches the `mail` record of
            // `example.dev`.
            let resolves = domains.domains.iter().any(|d| {
                d.a_records.contains_key(mx)
                    || mx
                        .strip_suffix(&format!(".{}", d.name))
                        .is_some_and(|short| d.a_records.contains_key(short))
            });
            if !resolves {
                issues.push(Issue::new(
                    format!("domains[{i}].mx_records"),
                    "mx_targets_resolve",
                    format!(
                        "MX target {:?} of {:?} does not resolve to any a_record and is not marked external",
                        mx, domain.name
                    ),
                ));
            }
        }
    }
}

/// The full cross-document rule set, used by transactions and `config
/// validate`.
#[must_use]
pub fn validate_composite(users: &UsersFile, domains: &DomainsFile) -> Vec<Issue> {
    let mut issues = Vec::new();
    user_domains_exist(users, domains, &mut issues);
    mx_targets_resolve(domains, &mut issues);
    issues
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{CertificateMode, Domain, User};
    use std::collections::BTreeMap;

    fn domain(name: &str) -> Domain {
        Domain {
            name: name.to_string(),
            enabled: true,
            mx_records: vec!["mail".to_string()],
            a_records: BTreeMap::from([("mail".to_string(), "172.20.0.10".to_string())]),
            cname_records: BTreeMap::new(),
            txt_records: BTreeMap::new(),
            external_mx: Vec::new(),
            certificate_mode: CertificateMode::None,
            reverse_zone: false,
        }
    }

    fn user(name: &str, domains: &[&str]) -> User {
        User {
            username: name.to_string(),
            email: format!("{name}@local.dev"),
            domains: domains.iter().map(|s| (*s).to_string()).collect(),
            roles: vec!["user".to_string()],
            mailbox_quota: "500M".to_string(),
            enabled: true,
            aliases: Vec::new(),
            password_hashes: BTreeMap::new(),
        }
    }

    #[test]
    fn unknown_user_domain_is_reported() {
        let users = UsersFile {
            users: vec![user("alice", &["missing.dev"])],
        };
        let domains = DomainsFile {
            domains: vec![domain("local.dev")],
        };
        let issues = validate_composite(&users, &domains);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].rule, "user_domains_exist");
    }

    #[test]
    fn mx_short_name_and_fqdn_both_resolve() {
        let mut d = domain("local.dev");
        d.mx_records = vec!["mail".to_string(), "mail.local.dev".to_string()];
        let domains = DomainsFile { domains: vec![d] };
        let issues = validate_composite(&UsersFile::default(), &domains);
        assert!(issues.is_empty(), "unexpected: {issues:?}");
    }

    #[test]
    fn external_mx_requires_explicit_marker() {
        let mut d = domain("local.dev");
        d.mx_records = vec!["mx.example.com".to_string()];
        let domains = DomainsFile {
            domains: vec![d.clone()],
        };
        let issues = validate_composite(&UsersFile::default(), &domains);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].rule, "mx_targets_resolve");

        d.external_mx = vec!["mx.example.com".to_string()];
        let domains = DomainsFile { domains: vec![d] };
        assert!(validate_composite(&UsersFile::default(), &domains).is_empty());
    }

    #[test]
    fn sizes_parse_with_suffixes() {
        assert_eq!(parse_size("1G"), Some(1024 * 1024 * 1024));
        assert_eq!(parse_size("500M"), Some(500 * 1024 * 1024));
        assert_eq!(parse_size("2048"), Some(2048));
        assert_eq!(parse_size("ten"), None);
    }

    #[test]
    fn fqdn_rejects_underscores_and_bare_labels() {
        let mut issues = Vec::new();
        fqdn_format("local.dev", "p", &mut issues);
        assert!(issues.is_empty());
        fqdn_format("local_host.dev", "p", &mut issues);
        fqdn_format("localhost", "p", &mut issues);
        assert_eq!(issues.len(), 2);
    }
}
