use super::certificate::CertificateMode;
use super::yaml::{
    as_mapping, bool_or, opt_str, opt_u16, reject_unknown, req_str, seq_of_strings, str_or,
    str_value, string_list, MapBuilder,
};
use super::{DocKind, Document};
use crate::error::Issue;
use crate::schema::validate::{email_format, env_name_format, fqdn_format};
use serde_yaml::{Mapping, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        }
    }

    #[must_use]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "tcp" => Some(Self::Tcp),
            "udp" => Some(Self::Udp),
            _ => None,
        }
    }
}

/// One explicit host binding for a container port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortMapping {
    pub container_port: u16,
    pub host_port: u16,
    pub protocol: Protocol,
}

const ENV_FIELDS: &[&str] = &[
    "name",
    "description",
    "base_path",
    "domain",
    "admin_email",
    "enabled",
    "tags",
    "created_at",
    "last_used",
    "certificate_mode",
    "port_mappings",
];

/// A named, isolated tree of configuration and state under one base path.
#[derive(Debug, Clone, PartialEq)]
pub struct Environment {
    pub name: String,
    pub description: String,
    pub base_path: String,
    pub domain: String,
    pub admin_email: String,
    pub enabled: bool,
    pub tags: Vec<String>,
    pub created_at: String,
    pub last_used: String,
    pub certificate_mode: CertificateMode,
    /// Per-container explicit host bindings; authoritative over every
    /// default table.
    pub port_mappings: Vec<(String, Vec<PortMapping>)>,
}

impl Environment {
    #[must_use]
    pub fn mappings_for(&self, container: &str) -> &[PortMapping] {
        self.port_mappings
            .iter()
            .find(|(name, _)| name == container)
            .map_or(&[], |(_, m)| m.as_slice())
    }

    fn parse_one(value: &Value, path: &str, issues: &mut Vec<Issue>) -> Option<Self> {
        let map = as_mapping(value, path, issues)?;
        reject_unknown(map, ENV_FIELDS, path, issues);
        let name = req_str(map, "name", path, issues);
        let base_path = req_str(map, "base_path", path, issues);
        let domain = req_str(map, "domain", path, issues);

        let certificate_mode = match opt_str(map, "certificate_mode", path, issues) {
            Some(s) => match CertificateMode::from_str(&s) {
                Some(mode) => mode,
                None => {
                    issues.push(Issue::new(
                        format!("{path}.certificate_mode"),
                        "certificate_mode",
                        format!("unknown mode {s:?}, expected none|self_signed|acme"),
                    ));
                    CertificateMode::SelfSigned
                }
            },
            None => CertificateMode::SelfSigned,
        };

        let mut port_mappings = Vec::new();
        match map.get("port_mappings") {
            Some(Value::Mapping(containers)) => {
                for (k, v) in containers {
                    let Value::String(container) = k else {
                        issues.push(Issue::new(
                            format!("{path}.port_mappings"),
                            "expected_string",
                            "container names must be strings",
                        ));
                        continue;
                    };
                    let mappings =
                        Self::parse_mappings(v, &format!("{path}.port_mappings.{container}"), issues);
                    port_mappings.push((container.clone(), mappings));
                }
            }
            Some(Value::Null) | None => {}
            Some(_) => issues.push(Issue::new(
                format!("{path}.port_mappings"),
                "expected_mapping",
                "expected a mapping of container name to port list",
            )),
        }

        let env = Self {
            name: String::new(),
            description: str_or(map, "description", "", path, issues),
            base_path: String::new(),
            domain: String::new(),
            admin_email: str_or(map, "admin_email", "", path, issues),
            enabled: bool_or(map, "enabled", true, path, issues),
            tags: string_list(map, "tags", path, issues),
            created_at: str_or(map, "created_at", "", path, issues),
            last_used: str_or(map, "last_used", "", path, issues),
            certificate_mode,
            port_mappings,
        };
        Some(Self {
            name: name?,
            base_path: base_path?,
            domain: domain?,
            ..env
        })
    }

    fn parse_mappings(value: &Value, path: &str, issues: &mut Vec<Issue>) -> Vec<PortMapping> {
        let Value::Sequence(seq) = value else {
            issues.push(Issue::new(
                path,
                "expected_sequence",
                "expected a sequence of port mappings",
            ));
            return Vec::new();
        };
        let mut out = Vec::new();
        for (i, item) in seq.iter().enumerate() {
            let item_path = format!("{path}[{i}]");
            let Some(map) = as_mapping(item, &item_path, issues) else {
                continue;
            };
            let container_port = opt_u16(map, "container_port", &item_path, issues);
            let host_port = opt_u16(map, "host_port", &item_path, issues);
            let protocol = str_or(map, "protocol", "tcp", &item_path, issues);
            let Some(protocol) = Protocol::from_str(&protocol) else {
                issues.push(Issue::new(
                    format!("{item_path}.protocol"),
                    "protocol",
                    "expected tcp or udp",
                ));
                continue;
            };
            match (container_port, host_port) {
                (Some(container_port), Some(host_port)) => out.push(PortMapping {
                    container_port,
                    host_port,
                    protocol,
                }),
                _ => issues.push(Issue::new(
                    item_path,
                    "required",
                    "container_port and host_port are both required",
                )),
            }
        }
        out
    }

    fn emit_one(&self) -> Value {
        let mut mappings = Mapping::new();
        for (container, ports) in &self.port_mappings {
            let seq = Value::Sequence(
                ports
                    .iter()
                    .map(|p| {
                        MapBuilder::new()
                            .entry(
                                "container_port",
                                Value::Number(u64::from(p.container_port).into()),
                            )
                            .entry("host_port", Value::Number(u64::from(p.host_port).into()))
                            .entry("protocol", str_value(p.protocol.as_str()))
                            .build()
                    })
                    .collect(),
            );
            mappings.insert(str_value(container), seq);
        }
        MapBuilder::new()
            .entry("name", str_value(&self.name))
            .entry("description", str_value(&self.description))
            .entry("base_path", str_value(&self.base_path))
            .entry("domain", str_value(&self.domain))
            .entry("admin_email", str_value(&self.admin_email))
            .entry("enabled", Value::Bool(self.enabled))
            .entry_if("tags", seq_of_strings(&self.tags), !self.tags.is_empty())
            .entry("created_at", str_value(&self.created_at))
            .entry("last_used", str_value(&self.last_used))
            .entry("certificate_mode", str_value(self.certificate_mode.as_str()))
            .entry_if(
                "port_mappings",
                Value::Mapping(mappings),
                !self.port_mappings.is_empty(),
            )
            .build()
    }
}

/// `environments.yaml`: the environment registry plus the current pointer.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EnvironmentsFile {
    pub current_environment: String,
    pub environments: Vec<Environment>,
}

impl EnvironmentsFile {
    #[must_use]
    pub fn find(&self, name: &str) -> Option<&Environment> {
        self.environments.iter().find(|e| e.name == name)
    }

    #[must_use]
    pub fn find_mut(&mut self, name: &str) -> Option<&mut Environment> {
        self.environments.iter_mut().find(|e| e.name == name)
    }

    #[must_use]
    pub fn current(&self) -> Option<&Environment> {
        self.find(&self.current_environment)
    }
}

impl Document for EnvironmentsFile {
    const KIND: DocKind = DocKind::Environments;

    fn parse(value: &Value) -> Result<Self, Vec<Issue>> {
        let mut issues = Vec::new();
        let Some(root) = as_mapping(value, "environments", &mut issues) else {
            return if issues.is_empty() {
                Ok(Self::default())
            } else {
                Err(issues)
            };
        };
        reject_unknown(
            root,
            &["current_environment", "environments"],
            "environments",
            &mut issues,
        );

        let current_environment =
            str_or(root, "current_environment", "", "environments", &mut issues);

        let mut environments = Vec::new();
        match root.get("environments") {
            Some(Value::Sequence(seq)) => {
                for (i, item) in seq.iter().enumerate() {
                    if let Some(env) =
                        Environment::parse_one(item, &format!("environments[{i}]"), &mut issues)
                    {
                        environments.push(env);
                    }
                }
            }
            Some(Value::Null) | None => {}
            Some(_) => issues.push(Issue::new(
                "environments.environments",
                "expected_sequence",
                "expected a sequence of environments",
            )),
        }

        if issues.is_empty() {
            Ok(Self {
                current_environment,
                environments,
            })
        } else {
            Err(issues)
        }
    }

    fn emit(&self) -> Value {
        let seq = Value::Sequence(self.environments.iter().map(Environment::emit_one).collect());
        MapBuilder::new()
            .entry("current_environment", str_value(&self.current_environment))
            .entry("environments", seq)
            .build()
    }

    fn default_document() -> Self {
        Self::default()
    }

    fn validate(&self) -> Vec<Issue> {
        let mut issues = Vec::new();
        let mut names = std::collections::HashSet::new();
        let mut enabled_count = 0usize;
        for (i, env) in self.environments.iter().enumerate() {
            let path = format!("environments[{i}]");
            env_name_format(&env.name, &format!("{path}.name"), &mut issues);
            fqdn_format(&env.domain, &format!("{path}.domain"), &mut issues);
            if !env.admin_email.is_empty() {
                email_format(&env.admin_email, &format!("{path}.admin_email"), &mut issues);
            }
            if !names.insert(env.name.clone()) {
                issues.push(Issue::new(
                    format!("{path}.name"),
                    "unique_environments",
                    format!("duplicate environment {:?}", env.name),
                ));
            }
            if env.enabled {
                enabled_count += 1;
            }
            for (container, mappings) in &env.port_mappings {
                for (j, m) in mappings.iter().enumerate() {
                    if m.host_port < 1024 {
                        issues.push(Issue::new(
                            format!("{path}.port_mappings.{container}[{j}].host_port"),
                            "port_ranges",
                            format!("host port {} is in the privileged range", m.host_port),
                        ));
                    }
                }
            }
        }
        if !self.environments.is_empty() {
            if enabled_count == 0 {
                issues.push(Issue::new(
                    "environments",
                    "one_enabled",
                    "at least one environment must be enabled",
                ));
            }
            match self.current() {
                None => issues.push(Issue::new(
                    "environments.current_environment",
                    "current_exists",
                    format!(
                        "current environment {:?} is not defined",
                        self.current_environment
                    ),
                )),
                Some(env) if !env.enabled => issues.push(Issue::new(
                    "environments.current_environment",
                    "current_enabled",
                    format!("current environment {:?} is disabled", env.name),
                )),
                Some(_) => {}
            }
        }
        issues
    }
}
