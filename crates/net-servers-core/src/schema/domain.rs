use super::certificate::CertificateMode;
use super::yaml::{
    as_mapping, bool_or, map_of_strings, reject_unknown, req_str, seq_of_strings, str_value,
    string_list, string_map, MapBuilder,
};
use super::{DocKind, Document};
use crate::error::Issue;
use crate::schema::validate::{fqdn_format, ipv4_format};
use serde_yaml::Value;
use std::collections::BTreeMap;

const DOMAIN_FIELDS: &[&str] = &[
    "name",
    "enabled",
    "mx_records",
    "a_records",
    "cname_records",
    "txt_records",
    "external_mx",
    "certificate_mode",
    "reverse_zone",
];

/// One served domain and its DNS material.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Domain {
    pub name: String,
    pub enabled: bool,
    /// Ordered MX targets, highest priority first.
    pub mx_records: Vec<String>,
    /// Short name to IPv4 address.
    pub a_records: BTreeMap<String, String>,
    pub cname_records: BTreeMap<String, String>,
    pub txt_records: BTreeMap<String, String>,
    /// MX targets that are literal external FQDNs rather than short names.
    pub external_mx: Vec<String>,
    pub certificate_mode: CertificateMode,
    /// Emit a reverse zone alongside the forward zone.
    pub reverse_zone: bool,
}

impl Domain {
    fn parse_one(value: &Value, path: &str, issues: &mut Vec<Issue>) -> Option<Self> {
        let map = as_mapping(value, path, issues)?;
        reject_unknown(map, DOMAIN_FIELDS, path, issues);
        let name = req_str(map, "name", path, issues);
        let certificate_mode = match map.get("certificate_mode") {
            Some(Value::String(s)) => match CertificateMode::from_str(s) {
                Some(mode) => mode,
                None => {
                    issues.push(Issue::new(
                        format!("{path}.certificate_mode"),
                        "certificate_mode",
                        format!("unknown mode {s:?}, expected none|self_signed|acme"),
                    ));
                    CertificateMode::None
                }
            },
            Some(Value::Null) | None => CertificateMode::None,
            Some(_) => {
                issues.push(Issue::new(
                    format!("{path}.certificate_mode"),
                    "expected_string",
                    "expected a string",
                ));
                CertificateMode::None
            }
        };
        let domain = Self {
            name: String::new(),
            enabled: bool_or(map, "enabled", true, path, issues),
            mx_records: string_list(map, "mx_records", path, issues),
            a_records: string_map(map, "a_records", path, issues),
            cname_records: string_map(map, "cname_records", path, issues),
            txt_records: string_map(map, "txt_records", path, issues),
            external_mx: string_list(map, "external_mx", path, issues),
            certificate_mode,
            reverse_zone: bool_or(map, "reverse_zone", false, path, issues),
        };
        Some(Self { name: name?, ..domain })
    }

    fn emit_one(&self) -> Value {
        MapBuilder::new()
            .entry("name", str_value(&self.name))
            .entry("enabled", Value::Bool(self.enabled))
            .entry("mx_records", seq_of_strings(&self.mx_records))
            .entry("a_records", map_of_strings(&self.a_records))
            .entry_if(
                "cname_records",
                map_of_strings(&self.cname_records),
                !self.cname_records.is_empty(),
            )
            .entry_if(
                "txt_records",
                map_of_strings(&self.txt_records),
                !self.txt_records.is_empty(),
            )
            .entry_if(
                "external_mx",
                seq_of_strings(&self.external_mx),
                !self.external_mx.is_empty(),
            )
            .entry("certificate_mode", str_value(self.certificate_mode.as_str()))
            .entry_if("reverse_zone", Value::Bool(true), self.reverse_zone)
            .build()
    }
}

/// `domains.yaml`: every domain the fleet serves.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DomainsFile {
    pub domains: Vec<Domain>,
}

impl DomainsFile {
    #[must_use]
    pub fn find(&self, name: &str) -> Option<&Domain> {
        self.domains.iter().find(|d| d.name == name)
    }

    pub fn enabled(&self) -> impl Iterator<Item = &Domain> {
        self.domains.iter().filter(|d| d.enabled)
    }
}

impl Document for DomainsFile {
    const KIND: DocKind = DocKind::Domains;

    fn parse(value: &Value) -> Result<Self, Vec<Issue>> {
        let mut issues = Vec::new();
        let Some(root) = as_mapping(value, "domains", &mut issues) else {
            return if issues.is_empty() {
                Ok(Self::default())
            } else {
                Err(issues)
            };
        };
        reject_unknown(root, &["domains"], "domains", &mut issues);

        let mut domains = Vec::new();
        match root.get("domains") {
            Some(Value::Sequence(seq)) => {
                for (i, item) in seq.iter().enumerate() {
                    if let Some(domain) =
                        Domain::parse_one(item, &format!("domains[{i}]"), &mut issues)
                    {
                        domains.push(domain);
                    }
                }
            }
            Some(Value::Null) | None => {}
            Some(_) => issues.push(Issue::new(
                "domains.domains",
                "expected_sequence",
                "expected a sequence of domains",
            )),
        }

        if issues.is_empty() {
            Ok(Self { domains })
        } else {
            Err(issues)
        }
    }

    fn emit(&self) -> Value {
        let seq = Value::Sequence(self.domains.iter().map(Domain::emit_one).collect());
        MapBuilder::new().entry("domains", seq).build()
    }

    fn default_document() -> Self {
        Self::default()
    }

    fn validate(&self) -> Vec<Issue> {
        let mut issues = Vec::new();
        let mut seen = std::collections::HashSet::new();
        for (i, domain) in self.domains.iter().enumerate() {
            let path = format!("domains[{i}]");
            fqdn_format(&domain.name, &format!("{path}.name"), &mut issues);
            if !seen.insert(domain.name.clone()) {
                issues.push(Issue::new(
                    format!("{path}.name"),
                    "unique_domains",
                    format!("duplicate domain {:?}", domain.name),
                ));
            }
            for (short, ip) in &domain.a_records {
                ipv4_format(ip, &format!("{path}.a_records.{short}"), &mut issues);
            }
        }
        issues
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::yaml::to_canonical_string;

    fn sample() -> DomainsFile {
        DomainsFile {
            domains: vec![Domain {
                name: "local.dev".to_string(),
                enabled: true,
                mx_records: vec!["mail".to_string()],
                a_records: BTreeMap::from([
                    ("mail".to_string(), "172.20.0.10".to_string()),
                    ("www".to_string(), "172.20.0.20".to_string()),
                ]),
                cname_records: BTreeMap::new(),
                txt_records: BTreeMap::from([(
                    "@".to_string(),
                    "v=spf1 mx -all".to_string(),
                )]),
                external_mx: Vec::new(),
                certificate_mode: CertificateMode::SelfSigned,
                reverse_zone: false,
            }],
        }
    }

    #[test]
    fn round_trip_is_byte_stable() {
        let original = sample();
        let emitted = to_canonical_string(&original.emit());
        let reparsed = DomainsFile::parse(&serde_yaml::from_str(&emitted).unwrap()).unwrap();
        assert_eq!(reparsed, original);
        assert_eq!(to_canonical_string(&reparsed.emit()), emitted);
    }

    #[test]
    fn bad_ipv4_is_flagged_by_validator() {
        let mut file = sample();
        file.domains[0]
            .a_records
            .insert("bad".to_string(), "999.1.2.3".to_string());
        let issues = file.validate();
        assert!(issues.iter().any(|i| i.rule == "ipv4_format"));
    }

    #[test]
    fn unknown_certificate_mode_is_a_parse_issue() {
        let text = "domains:\n  - name: local.dev\n    certificate_mode: wildcard\n";
        let value: Value = serde_yaml::from_str(text).unwrap();
        let issues = DomainsFile::parse(&value).unwrap_err();
        assert!(issues.iter().any(|i| i.rule == "certificate_mode"));
    }
}
