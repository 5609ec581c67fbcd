use super::yaml::{as_mapping, str_or, str_value, MapBuilder};
use super::{DocKind, Document};
use crate::error::Issue;
use crate::schema::validate::{email_format, fqdn_format};
use serde_yaml::{Mapping, Value};

/// The `system` block of `global.yaml`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemSettings {
    pub domain: String,
    pub admin_email: String,
    pub timezone: String,
}

impl Default for SystemSettings {
    fn default() -> Self {
        Self {
            domain: "local.dev".to_string(),
            admin_email: "admin@local.dev".to_string(),
            timezone: "UTC".to_string(),
        }
    }
}

/// Global configuration: typed `system` settings plus free-form sections
/// reserved for service defaults. Unknown sections are preserved verbatim
/// and round-trip untouched.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct GlobalConfig {
    pub system: SystemSettings,
    /// Free-form sections keyed by section name, e.g. `mail.vmail_uid`.
    pub sections: Vec<(String, Value)>,
}

impl GlobalConfig {
    /// Look up a scalar inside a free-form section, e.g. `("mail", "vmail_uid")`.
    #[must_use]
    pub fn section_value(&self, section: &str, key: &str) -> Option<&Value> {
        let (_, value) = self.sections.iter().find(|(name, _)| name == section)?;
        value.as_mapping()?.get(key)
    }

    #[must_use]
    pub fn section_u32(&self, section: &str, key: &str, default: u32) -> u32 {
        self.section_value(section, key)
            .and_then(Value::as_u64)
            .and_then(|v| u32::try_from(v).ok())
            .unwrap_or(default)
    }

    #[must_use]
    pub fn section_str(&self, section: &str, key: &str) -> Option<&str> {
        self.section_value(section, key).and_then(Value::as_str)
    }
}

impl Document for GlobalConfig {
    const KIND: DocKind = DocKind::Global;

    fn parse(value: &Value) -> Result<Self, Vec<Issue>> {
        let mut issues = Vec::new();
        let Some(root) = as_mapping(value, "global", &mut issues) else {
            return if issues.is_empty() {
                Ok(Self::default_document())
            } else {
                Err(issues)
            };
        };

        let defaults = SystemSettings::default();
        let system = match root.get("system") {
            Some(sys_value) => {
                let Some(sys) = as_mapping(sys_value, "global.system", &mut issues) else {
                    return Err(issues);
                };
                SystemSettings {
                    domain: str_or(sys, "domain", &defaults.domain, "global.system", &mut issues),
                    admin_email: str_or(
                        sys,
                        "admin_email",
                        &defaults.admin_email,
                        "global.system",
                        &mut issues,
                    ),
                    timezone: str_or(
                        sys,
                        "timezone",
                        &defaults.timezone,
                        "global.system",
                        &mut issues,
                    ),
                }
            }
            None => defaults,
        };

        // Everything but `system` is an opaque section, preserved in order.
        let mut sections = Vec::new();
        for (k, v) in root {
            if let Value::String(name) = k {
                if name != "system" {
                    sections.push((name.clone(), v.clone()));
                }
            }
        }

        if issues.is_empty() {
            Ok(Self { system, sections })
        } else {
            Err(issues)
        }
    }

    fn emit(&self) -> Value {
        let system = MapBuilder::new()
            .entry("domain", str_value(&self.system.domain))
            .entry("admin_email", str_value(&self.system.admin_email))
            .entry("timezone", str_value(&self.system.timezone))
            .build();
        let mut root = Mapping::new();
        root.insert(str_value("system"), system);
        for (name, value) in &self.sections {
            root.insert(str_value(name), value.clone());
        }
        Value::Mapping(root)
    }

    fn default_document() -> Self {
        Self::default()
    }

    fn validate(&self) -> Vec<Issue> {
        let mut issues = Vec::new();
        fqdn_format(&self.system.domain, "global.system.domain", &mut issues);
        email_format(
            &self.system.admin_email,
            "global.system.admin_email",
            &mut issues,
        );
        issues
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::yaml::to_canonical_string;

    #[test]
    fn round_trips_free_form_sections_verbatim() {
        let text = "system:\n  domain: local.dev\n  admin_email: admin@local.dev\n  timezone: UTC\nmail:\n  vmail_uid: 5000\n  vmail_gid: 5000\n";
        let value: Value = serde_yaml::from_str(text).unwrap();
        let config = GlobalConfig::parse(&value).unwrap();
        assert_eq!(config.section_u32("mail", "vmail_uid", 0), 5000);
        assert_eq!(to_canonical_string(&config.emit()), text);
    }

    #[test]
    fn missing_system_block_falls_back_to_defaults() {
        let value: Value = serde_yaml::from_str("{}").unwrap();
        let config = GlobalConfig::parse(&value).unwrap();
        assert_eq!(config.system.domain, "local.dev");
    }

    #[test]
    fn non_string_domain_is_reported_with_path() {
        let value: Value = serde_yaml::from_str("system:\n  domain: 42\n").unwrap();
        let issues = GlobalConfig::parse(&value).unwrap_err();
        assert!(issues.iter().any(|i| i.path == "global.system.domain"));
    }
}
