//! Sensitive material kept apart from ordinary configuration.
//!
//! `secrets.yaml` is written with mode `0600` and every value is wrapped in
//! [`Secret`], whose `Debug` and `Display` render `<redacted>` so secret
//! material cannot leak through error messages or log lines. Code that
//! genuinely needs the value calls [`Secret::expose`].

use crate::error::Issue;
use crate::schema::yaml::{as_mapping, opt_str, str_value, MapBuilder};
use crate::schema::{DocKind, Document};
use serde_yaml::{Mapping, Value};
use std::collections::BTreeMap;
use std::fmt;

/// A string that refuses to print itself.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Deliberate access to the underlying value.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<redacted>")
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<redacted>")
    }
}

/// Per-user secret material.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UserSecret {
    /// The primary plaintext password shared across services.
    pub password: Option<Secret>,
    /// Per-scheme overrides, e.g. `digest-WebDAV Secure Area`.
    pub schemes: BTreeMap<String, Secret>,
}

impl UserSecret {
    /// Resolve the secret for a scheme, falling back to the primary
    /// password.
    #[must_use]
    pub fn for_scheme(&self, scheme: &str) -> Option<&Secret> {
        self.schemes.get(scheme).or(self.password.as_ref())
    }
}

/// `secrets.yaml`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SecretsFile {
    pub users: BTreeMap<String, UserSecret>,
    pub acme_account_key: Option<Secret>,
    pub rndc_key: Option<Secret>,
}

impl SecretsFile {
    #[must_use]
    pub fn user(&self, username: &str) -> Option<&UserSecret> {
        self.users.get(username)
    }

    pub fn set_password(&mut self, username: &str, password: Secret) {
        self.users.entry(username.to_string()).or_default().password = Some(password);
    }
}

impl Document for SecretsFile {
    const KIND: DocKind = DocKind::Secrets;

    fn parse(value: &Value) -> Result<Self, Vec<Issue>> {
        let mut issues = Vec::new();
        let Some(root) = as_mapping(value, "secrets", &mut issues) else {
            return if issues.is_empty() {
                Ok(Self::default())
            } else {
                Err(issues)
            };
        };

        let mut users = BTreeMap::new();
        match root.get("users") {
            Some(Value::Mapping(m)) => {
                for (k, v) in m {
                    let Value::String(username) = k else {
                        issues.push(Issue::new(
                            "secrets.users",
                            "expected_string",
                            "usernames must be strings",
                        ));
                        continue;
                    };
                    let path = format!("secrets.users.{username}");
                    let Some(entry) = as_mapping(v, &path, &mut issues) else {
                        continue;
                    };
                    let password = opt_str(entry, "password", &path, &mut issues).map(Secret::new);
                    let mut schemes = BTreeMap::new();
                    if let Some(Value::Mapping(scheme_map)) = entry.get("schemes") {
                        for (sk, sv) in scheme_map {
                            if let (Value::String(scheme), Value::String(secret)) = (sk, sv) {
                                schemes.insert(scheme.clone(), Secret::new(secret.clone()));
                            } else {
                                issues.push(Issue::new(
                                    format!("{path}.schemes"),
                                    "expected_string_map",
                                    "schemes must map strings to strings",
                                ));
                            }
                        }
                    }
                    users.insert(username.clone(), UserSecret { password, schemes });
                }
            }
            Some(Value::Null) | None => {}
            Some(_) => issues.push(Issue::new(
                "secrets.users",
                "expected_mapping",
                "expected a mapping of usernames",
            )),
        }

        let acme_account_key =
            opt_str(root, "acme_account_key", "secrets", &mut issues).map(Secret::new);
        let rndc_key = opt_str(root, "rndc_key", "secrets", &mut issues).map(Secret::new);

        if issues.is_empty() {
            Ok(Self {
                users,
                acme_account_key,
                rndc_key,
            })
        } else {
            Err(issues)
        }
    }

    fn emit(&self) -> Value {
        let mut user_map = Mapping::new();
        for (username, secret) in &self.users {
            let mut entry = MapBuilder::new();
            if let Some(password) = &secret.password {
                entry = entry.entry("password", str_value(password.expose()));
            }
            if !secret.schemes.is_empty() {
                let mut schemes = Mapping::new();
                for (scheme, value) in &secret.schemes {
                    schemes.insert(str_value(scheme), str_value(value.expose()));
                }
                entry = entry.entry("schemes", Value::Mapping(schemes));
            }
            user_map.insert(str_value(username), entry.build());
        }
        let mut builder = MapBuilder::new().entry("users", Value::Mapping(user_map));
        if let Some(key) = &self.acme_account_key {
            builder = builder.entry("acme_account_key", str_value(key.expose()));
        }
        if let Some(key) = &self.rndc_key {
            builder = builder.entry("rndc_key", str_value(key.expose()));
        }
        builder.build()
    }

    fn default_document() -> Self {
        Self::default()
    }

    fn validate(&self) -> Vec<Issue> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::yaml::to_canonical_string;

    #[test]
    fn debug_and_display_are_redacted() {
        let secret = Secret::new("s3cret");
        assert_eq!(format!("{secret}"), "<redacted>");
        assert_eq!(format!("{secret:?}"), "<redacted>");
        let mut file = SecretsFile::default();
        file.set_password("admin", secret);
        assert!(!format!("{file:?}").contains("s3cret"));
    }

    #[test]
    fn round_trip_preserves_material() {
        let mut file = SecretsFile::default();
        file.set_password("admin", Secret::new("s3cret"));
        file.users
            .get_mut("admin")
            .unwrap()
            .schemes
            .insert("digest-WebDAV Secure Area".to_string(), Secret::new("d1g"));
        file.rndc_key = Some(Secret::new("rndc-材料"));

        let emitted = to_canonical_string(&file.emit());
        let reparsed = SecretsFile::parse(&serde_yaml::from_str(&emitted).unwrap()).unwrap();
        assert_eq!(reparsed, file);
        assert_eq!(
            reparsed.user("admin").unwrap().for_scheme("plain").unwrap(),
            &Secret::new("s3cret")
        );
        assert_eq!(
            reparsed
                .user("admin")
                .unwrap()
                .for_scheme("digest-WebDAV Secure Area")
                .unwrap(),
            &Secret::new("d1g")
        );
    }
}
