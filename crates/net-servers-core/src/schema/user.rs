use super::yaml::{
    as_mapping, bool_or, map_of_strings, reject_unknown, req_str, seq_of_strings, str_or,
    str_value, string_list, string_map, MapBuilder,
};
use super::{DocKind, Document};
use crate::error::Issue;
use crate::schema::validate::{email_format, mailbox_quota_format, username_format};
use serde_yaml::Value;
use std::collections::BTreeMap;

const USER_FIELDS: &[&str] = &[
    "username",
    "email",
    "domains",
    "roles",
    "mailbox_quota",
    "enabled",
    "aliases",
    "password_hashes",
];

/// One account. A user implies exactly one mailbox path
/// `<mail_state>/<domain>/<username>/` per listed domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub username: String,
    pub email: String,
    pub domains: Vec<String>,
    pub roles: Vec<String>,
    pub mailbox_quota: String,
    pub enabled: bool,
    /// Mail aliases that should deliver to this user, local parts only.
    pub aliases: Vec<String>,
    /// Optional password hashes keyed by scheme (`plain`, `digest-{realm}`,
    /// `sha512-crypt`). Plaintext service secrets live in `secrets.yaml`,
    /// not here.
    pub password_hashes: BTreeMap<String, String>,
}

impl User {
    #[must_use]
    pub fn is_admin(&self) -> bool {
        self.roles.iter().any(|r| r == "admin")
    }

    fn parse_one(value: &Value, path: &str, issues: &mut Vec<Issue>) -> Option<Self> {
        let map = as_mapping(value, path, issues)?;
        reject_unknown(map, USER_FIELDS, path, issues);
        let username = req_str(map, "username", path, issues);
        let email = req_str(map, "email", path, issues);
        let domains = string_list(map, "domains", path, issues);
        if domains.is_empty() {
            issues.push(Issue::new(
                format!("{path}.domains"),
                "non_empty",
                "a user must list at least one domain",
            ));
        }
        let mut roles = string_list(map, "roles", path, issues);
        if roles.is_empty() {
            roles.push("user".to_string());
        }
        let mailbox_quota = str_or(map, "mailbox_quota", "500M", path, issues);
        let enabled = bool_or(map, "enabled", true, path, issues);
        let aliases = string_list(map, "aliases", path, issues);
        let password_hashes = string_map(map, "password_hashes", path, issues);
        // All fields have been visited and reported; only now bail on the
        // required ones.
        let (username, email) = (username?, email?);
        Some(Self {
            username,
            email,
            domains,
            roles,
            mailbox_quota,
            enabled,
            aliases,
            password_hashes,
        })
    }

    fn emit_one(&self) -> Value {
        MapBuilder::new()
            .entry("username", str_value(&self.username))
            .entry("email", str_value(&self.email))
            .entry("domains", seq_of_strings(&self.domains))
            .entry("roles", seq_of_strings(&self.roles))
            .entry("mailbox_quota", str_value(&self.mailbox_quota))
            .entry("enabled", Value::Bool(self.enabled))
            .entry_if(
                "aliases",
                seq_of_strings(&self.aliases),
                !self.aliases.is_empty(),
            )
            .entry_if(
                "password_hashes",
                map_of_strings(&self.password_hashes),
                !self.password_hashes.is_empty(),
            )
            .build()
    }
}

/// `users.yaml`: the full account list.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UsersFile {
    pub users: Vec<User>,
}

impl UsersFile {
    #[must_use]
    pub fn find(&self, username: &str) -> Option<&User> {
        self.users.iter().find(|u| u.username == username)
    }

    pub fn enabled(&self) -> impl Iterator<Item = &User> {
        self.users.iter().filter(|u| u.enabled)
    }
}

impl Document for UsersFile {
    const KIND: DocKind = DocKind::Users;

    fn parse(value: &Value) -> Result<Self, Vec<Issue>> {
        let mut issues = Vec::new();
        let Some(root) = as_mapping(value, "users", &mut issues) else {
            return if issues.is_empty() {
                Ok(Self::default())
            } else {
                Err(issues)
            };
        };
        reject_unknown(root, &["users"], "users", &mut issues);

        let mut users = Vec::new();
        match root.get("users") {
            Some(Value::Sequence(seq)) => {
                for (i, item) in seq.iter().enumerate() {
                    if let Some(user) = User::parse_one(item, &format!("users[{i}]"), &mut issues) {
                        users.push(user);
                    }
                }
            }
            Some(Value::Null) | None => {}
            Some(_) => issues.push(Issue::new(
                "users.users",
                "expected_sequence",
                "expected a sequence of users",
            )),
        }

        if issues.is_empty() {
            Ok(Self { users })
        } else {
            Err(issues)
        }
    }

    fn emit(&self) -> Value {
        let seq = Value::Sequence(self.users.iter().map(User::emit_one).collect());
        MapBuilder::new().entry("users", seq).build()
    }

    fn default_document() -> Self {
        Self::default()
    }

    fn validate(&self) -> Vec<Issue> {
        let mut issues = Vec::new();
        let mut seen = std::collections::HashSet::new();
        for (i, user) in self.users.iter().enumerate() {
            let path = format!("users[{i}]");
            username_format(&user.username, &format!("{path}.username"), &mut issues);
            email_format(&user.email, &format!("{path}.email"), &mut issues);
            mailbox_quota_format(
                &user.mailbox_quota,
                &format!("{path}.mailbox_quota"),
                &mut issues,
            );
            if !seen.insert(user.username.clone()) {
                issues.push(Issue::new(
                    format!("{path}.username"),
                    "unique_usernames",
                    format!("duplicate username {:?}", user.username),
                ));
            }
        }
        issues
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::yaml::to_canonical_string;

    fn sample() -> UsersFile {
        UsersFile {
            users: vec![User {
                username: "admin".to_string(),
                email: "admin@local.dev".to_string(),
                domains: vec!["local.dev".to_string()],
                roles: vec!["admin".to_string()],
                mailbox_quota: "1G".to_string(),
                enabled: true,
                aliases: Vec::new(),
                password_hashes: BTreeMap::new(),
            }],
        }
    }

    #[test]
    fn emit_then_parse_reproduces_record() {
        let original = sample();
        let emitted = to_canonical_string(&original.emit());
        let reparsed = UsersFile::parse(&serde_yaml::from_str(&emitted).unwrap()).unwrap();
        assert_eq!(reparsed, original);
        // And emitting the reparsed record is byte-identical.
        assert_eq!(to_canonical_string(&reparsed.emit()), emitted);
    }

    #[test]
    fn issues_are_accumulated_per_field() {
        let text = "users:\n  - username: admin\n  - email: 12\n    domains: []\n";
        let value: Value = serde_yaml::from_str(text).unwrap();
        let issues = UsersFile::parse(&value).unwrap_err();
        // First user misses email, second has a bad email type, a missing
        // username and an empty domain list.
        assert!(issues.iter().any(|i| i.path == "users[0].email"));
        assert!(issues.iter().any(|i| i.path == "users[1].email"));
        assert!(issues.iter().any(|i| i.path == "users[1].username"));
        assert!(issues.iter().any(|i| i.path == "users[1].domains"));
    }

    #[test]
    fn duplicate_usernames_are_rejected() {
        let mut file = sample();
        file.users.push(file.users[0].clone());
        let issues = file.validate();
        assert!(issues.iter().any(|i| i.rule == "unique_usernames"));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let text = "users:\n  - username: admin\n    email: a@b.dev\n    domains: [b.dev]\n    shoe_size: 42\n";
        let value: Value = serde_yaml::from_str(text).unwrap();
        let issues = UsersFile::parse(&value).unwrap_err();
        assert!(issues
            .iter()
            .any(|i| i.rule == "unknown_field" && i.path.ends_with("shoe_size")));
    }
}
