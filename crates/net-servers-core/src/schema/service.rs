use super::yaml::{
    as_mapping, bool_or, req_str, str_value, MapBuilder,
};
use super::{DocKind, Document};
use crate::error::Issue;
use serde_yaml::{Mapping, Value};

/// A container port a service declares, with its protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeclaredPort {
    pub container_port: u16,
    pub protocol: Protocol,
}

pub use super::environment::Protocol;

/// Per-service configuration: a container reference, whether SSL material is
/// requested, the declared ports, and opaque settings passed through to the
/// container untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceConfig {
    pub container_ref: String,
    pub ssl: bool,
    pub declared_ports: Vec<DeclaredPort>,
    /// Service-specific settings, preserved verbatim including unknown keys.
    pub settings: Mapping,
}

impl ServiceConfig {
    fn parse_one(value: &Value, path: &str, issues: &mut Vec<Issue>) -> Option<Self> {
        let map = as_mapping(value, path, issues)?;
        let container_ref = req_str(map, "container_ref", path, issues);
        let ssl = bool_or(map, "ssl", false, path, issues);

        let mut declared_ports = Vec::new();
        match map.get("ports") {
            Some(Value::Sequence(seq)) => {
                for (i, item) in seq.iter().enumerate() {
                    let item_path = format!("{path}.ports[{i}]");
                    let Some(port_map) = as_mapping(item, &item_path, issues) else {
                        continue;
                    };
                    let port = super::yaml::opt_u16(port_map, "container_port", &item_path, issues);
                    let protocol = super::yaml::str_or(port_map, "protocol", "tcp", &item_path, issues);
                    let Some(protocol) = Protocol::from_str(&protocol) else {
                        issues.push(Issue::new(
                            format!("{item_path}.protocol"),
                            "protocol",
                            "expected tcp or udp",
                        ));
                        continue;
                    };
                    if let Some(container_port) = port {
                        declared_ports.push(DeclaredPort {
                            container_port,
                            protocol,
                        });
                    } else {
                        issues.push(Issue::new(
                            format!("{item_path}.container_port"),
                            "required",
                            "missing required field",
                        ));
                    }
                }
            }
            Some(Value::Null) | None => {}
            Some(_) => issues.push(Issue::new(
                format!("{path}.ports"),
                "expected_sequence",
                "expected a sequence of port declarations",
            )),
        }

        let mut settings = Mapping::new();
        if let Some(Value::Mapping(m)) = map.get("settings") {
            settings = m.clone();
        }

        Some(Self {
            container_ref: container_ref?,
            ssl,
            declared_ports,
            settings,
        })
    }

    fn emit_one(&self) -> Value {
        let ports = Value::Sequence(
            self.declared_ports
                .iter()
                .map(|p| {
                    MapBuilder::new()
                        .entry(
                            "container_port",
                            Value::Number(u64::from(p.container_port).into()),
                        )
                        .entry("protocol", str_value(p.protocol.as_str()))
                        .build()
                })
                .collect(),
        );
        MapBuilder::new()
            .entry("container_ref", str_value(&self.container_ref))
            .entry("ssl", Value::Bool(self.ssl))
            .entry("ports", ports)
            .entry_if(
                "settings",
                Value::Mapping(self.settings.clone()),
                !self.settings.is_empty(),
            )
            .build()
    }

    /// Scalar setting lookup, e.g. `setting_str("realm")`.
    #[must_use]
    pub fn setting_str(&self, key: &str) -> Option<&str> {
        self.settings.get(key).and_then(Value::as_str)
    }

    #[must_use]
    pub fn setting_bool(&self, key: &str, default: bool) -> bool {
        self.settings
            .get(key)
            .and_then(Value::as_bool)
            .unwrap_or(default)
    }
}

/// `services/services.yaml`: the registered service set, keyed by service
/// name in document order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ServicesFile {
    pub services: Vec<(String, ServiceConfig)>,
}

impl ServicesFile {
    #[must_use]
    pub fn find(&self, name: &str) -> Option<&ServiceConfig> {
        self.services
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, c)| c)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.services.iter().map(|(n, _)| n.as_str())
    }
}

impl Document for ServicesFile {
    const KIND: DocKind = DocKind::Services;

    fn parse(value: &Value) -> Result<Self, Vec<Issue>> {
        let mut issues = Vec::new();
        let Some(root) = as_mapping(value, "services", &mut issues) else {
            return if issues.is_empty() {
                Ok(Self::default())
            } else {
                Err(issues)
            };
        };

        let mut services = Vec::new();
        match root.get("services") {
            Some(Value::Mapping(m)) => {
                for (k, v) in m {
                    let Value::String(name) = k else {
                        issues.push(Issue::new(
                            "services.services",
                            "expected_string",
                            "service names must be strings",
                        ));
                        continue;
                    };
                    if let Some(config) =
                        ServiceConfig::parse_one(v, &format!("services.{name}"), &mut issues)
                    {
                        services.push((name.clone(), config));
                    }
                }
            }
            Some(Value::Null) | None => {}
            Some(_) => issues.push(Issue::new(
                "services.services",
                "expected_mapping",
                "expected a mapping of services",
            )),
        }

        if issues.is_empty() {
            Ok(Self { services })
        } else {
            Err(issues)
        }
    }

    fn emit(&self) -> Value {
        let mut map = Mapping::new();
        for (name, config) in &self.services {
            map.insert(str_value(name), config.emit_one());
        }
        MapBuilder::new().entry("services", Value::Mapping(map)).build()
    }

    fn default_document() -> Self {
        let default_service = |container_ref: &str, ports: &[(u16, Protocol)], ssl: bool| {
            ServiceConfig {
                container_ref: container_ref.to_string(),
                ssl,
                declared_ports: ports
                    .iter()
                    .map(|&(container_port, protocol)| DeclaredPort {
                        container_port,
                        protocol,
                    })
                    .collect(),
                settings: Mapping::new(),
            }
        };
        Self {
            services: vec![
                (
                    "apache".to_string(),
                    default_service(
                        "apache",
                        &[(80, Protocol::Tcp), (443, Protocol::Tcp)],
                        true,
                    ),
                ),
                (
                    "mail".to_string(),
                    default_service(
                        "mail",
                        &[
                            (25, Protocol::Tcp),
                            (143, Protocol::Tcp),
                            (110, Protocol::Tcp),
                            (993, Protocol::Tcp),
                            (995, Protocol::Tcp),
                        ],
                        true,
                    ),
                ),
                (
                    "dns".to_string(),
                    default_service("dns", &[(53, Protocol::Udp), (53, Protocol::Tcp)], false),
                ),
            ],
        }
    }

    fn validate(&self) -> Vec<Issue> {
        let mut issues = Vec::new();
        for (name, config) in &self.services {
            if config.container_ref.is_empty() {
                issues.push(Issue::new(
                    format!("services.{name}.container_ref"),
                    "required",
                    "container_ref must not be empty",
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

    #[test]
    fn default_document_round_trips() {
        let original = ServicesFile::default_document();
        let emitted = to_canonical_string(&original.emit());
        let reparsed = ServicesFile::parse(&serde_yaml::from_str(&emitted).unwrap()).unwrap();
        assert_eq!(reparsed, original);
        assert_eq!(to_canonical_string(&reparsed.emit()), emitted);
    }

    #[test]
    fn opaque_settings_survive_round_trip() {
        let text = "services:\n  apache:\n    container_ref: apache\n    ssl: true\n    ports:\n    - container_port: 80\n      protocol: tcp\n    settings:\n      document_root: /var/www/html\n      custom_knob: 7\n";
        let value: Value = serde_yaml::from_str(text).unwrap();
        let parsed = ServicesFile::parse(&value).unwrap();
        let apache = parsed.find("apache").unwrap();
        assert_eq!(apache.setting_str("document_root"), Some("/var/www/html"));
        assert_eq!(to_canonical_string(&parsed.emit()), text);
    }
}
