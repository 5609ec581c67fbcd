//! Environment-scoped host/container port resolution and conflict
//! detection.
//!
//! Precedence: an explicit mapping in the environment record beats the
//! default table bundled with the service definition, which beats automatic
//! allocation in the environment's range. Before a start, every intended
//! host port is probed; a bound port attributable to another environment's
//! managed container is a `PORT_CONFLICT` with a hint, a bound port owned
//! by an unrelated process is fatal unless `--force-port` was passed.

use async_trait::async_trait;
use net_servers_core::error::{CoreError, CoreResult, ErrorKind};
use net_servers_core::schema::{DeclaredPort, Environment, EnvironmentsFile, Protocol};
use std::collections::BTreeSet;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedPort {
    pub container_port: u16,
    pub host_port: u16,
    pub protocol: Protocol,
}

/// Suggested host ports bundled with the service definitions. The
/// environment record always wins; these exist so a fresh environment works
/// without any explicit mapping. DNS deliberately suggests the unprivileged
/// 5353 rather than 53.
#[must_use]
pub fn default_host_port(container: &str, port: u16, protocol: Protocol) -> Option<u16> {
    match (container, port, protocol) {
        ("apache", 80, Protocol::Tcp) => Some(8080),
        ("apache", 443, Protocol::Tcp) => Some(8443),
        ("mail", 25, Protocol::Tcp) => Some(2525),
        ("mail", 110, Protocol::Tcp) => Some(2110),
        ("mail", 143, Protocol::Tcp) => Some(2143),
        ("mail", 993, Protocol::Tcp) => Some(2993),
        ("mail", 995, Protocol::Tcp) => Some(2995),
        ("dns", 53, _) => Some(5353),
        _ => None,
    }
}

/// The automatic allocation range for an environment. The well-known
/// environments get fixed ranges; anything else gets a stable range derived
/// from its name so two custom environments rarely collide.
#[must_use]
pub fn auto_range(env: &Environment) -> (u16, u16) {
    let tagged = |t: &str| env.name == t || env.tags.iter().any(|tag| tag == t);
    if tagged("development") || tagged("dev") {
        (8000, 8099)
    } else if tagged("testing") {
        (8100, 8999)
    } else if tagged("staging") {
        (9000, 9899)
    } else if tagged("production") {
        (10000, 10899)
    } else {
        let bucket = env
            .name
            .bytes()
            .fold(0u16, |acc, b| acc.wrapping_mul(31).wrapping_add(u16::from(b)))
            % 40;
        let start = 20000 + bucket * 200;
        (start, start + 199)
    }
}

/// Pin explicit host mappings for a new environment: every declared port of
/// every service allocated inside the environment's range. Recording them
/// in the registry is what makes cross-environment conflicts attributable.
#[must_use]
pub fn generate_mappings(
    env: &Environment,
    services: &net_servers_core::schema::ServicesFile,
) -> Vec<(String, Vec<net_servers_core::schema::PortMapping>)> {
    use net_servers_core::schema::PortMapping;

    let (start, end) = auto_range(env);
    let span = end - start + 1;
    let mut taken: BTreeSet<u16> = BTreeSet::new();
    let mut out = Vec::new();
    for (_, config) in &services.services {
        let mut mappings = Vec::new();
        for port in &config.declared_ports {
            let mut candidate = start + port.container_port % span;
            while !taken.insert(candidate) {
                candidate = if candidate == end { start } else { candidate + 1 };
            }
            mappings.push(PortMapping {
                container_port: port.container_port,
                host_port: candidate,
                protocol: port.protocol,
            });
        }
        out.push((config.container_ref.clone(), mappings));
    }
    out
}

/// Resolve the host port for every declared port of `container` in `env`.
#[must_use]
pub fn resolve_ports(
    env: &Environment,
    container: &str,
    declared: &[DeclaredPort],
) -> Vec<ResolvedPort> {
    let explicit = env.mappings_for(container);
    let mut taken: BTreeSet<u16> = explicit.iter().map(|m| m.host_port).collect();
    let mut out = Vec::with_capacity(declared.len());

    for port in declared {
        if let Some(mapping) = explicit
            .iter()
            .find(|m| m.container_port == port.container_port && m.protocol == port.protocol)
        {
            out.push(ResolvedPort {
                container_port: port.container_port,
                host_port: mapping.host_port,
                protocol: port.protocol,
            });
            continue;
        }
        if let Some(host_port) = default_host_port(container, port.container_port, port.protocol) {
            if taken.insert(host_port) {
                out.push(ResolvedPort {
                    container_port: port.container_port,
                    host_port,
                    protocol: port.protocol,
                });
                continue;
            }
        }
        let (start, end) = auto_range(env);
        let span = end - start + 1;
        let mut candidate = start + port.container_port % span;
        while !taken.insert(candidate) {
            candidate = if candidate == end { start } else { candidate + 1 };
        }
        out.push(ResolvedPort {
            container_port: port.container_port,
            host_port: candidate,
            protocol: port.protocol,
        });
    }
    out
}

/// Narrow view of the runtime used for conflict attribution.
#[async_trait]
pub trait ContainerLister: Send + Sync {
    async fn running(&self) -> CoreResult<Vec<String>>;
}

#[async_trait]
impl ContainerLister for crate::runtime::RuntimeClient {
    async fn running(&self) -> CoreResult<Vec<String>> {
        self.ps_names(false).await
    }
}

fn probe_free(port: u16, protocol: Protocol) -> bool {
    match protocol {
        Protocol::Tcp => std::net::TcpListener::bind(("0.0.0.0", port)).is_ok(),
        Protocol::Udp => std::net::UdpSocket::bind(("0.0.0.0", port)).is_ok(),
    }
}

/// Which other enabled environment explicitly claims `host_port`?
fn claimed_by(
    registry: &EnvironmentsFile,
    current: &str,
    host_port: u16,
) -> Option<(String, String)> {
    for env in registry.environments.iter().filter(|e| e.enabled) {
        if env.name == current {
            continue;
        }
        for (container, mappings) in &env.port_mappings {
            if mappings.iter().any(|m| m.host_port == host_port) {
                return Some((env.name.clone(), container.clone()));
            }
        }
    }
    None
}

/// Probe every intended host port before a start. Nothing beyond `ps` is
/// invoked on the runtime.
pub async fn check_start_conflicts(
    registry: &EnvironmentsFile,
    env: &Environment,
    container: &str,
    resolved: &[ResolvedPort],
    lister: &dyn ContainerLister,
    force_port: bool,
) -> CoreResult<()> {
    let mut running: Option<Vec<String>> = None;
    for port in resolved {
        if probe_free(port.host_port, port.protocol) {
            continue;
        }
        if let Some((other_env, other_container)) = claimed_by(registry, &env.name, port.host_port)
        {
            let owner = format!("net-servers-{other_container}-{other_env}");
            let names = match &running {
                Some(names) => names.clone(),
                None => {
                    let names = lister.running().await.unwrap_or_default();
                    running = Some(names.clone());
                    names
                }
            };
            if names.contains(&owner) {
                return Err(CoreError::new(
                    ErrorKind::PortConflict,
                    format!(
                        "host port {} for {container} is held by environment {other_env:?}",
                        port.host_port
                    ),
                )
                .with("port", port.host_port)
                .with("owner", owner)
                .with("hint", format!("stop environment {other_env:?} or remap its ports")));
            }
        }
        if force_port {
            warn!(port = port.host_port, "port busy, continuing due to --force-port");
            continue;
        }
        return Err(CoreError::new(
            ErrorKind::PortConflict,
            format!(
                "host port {} for {container} is bound by an unrelated process",
                port.host_port
            ),
        )
        .with("port", port.host_port)
        .with("owner", "unknown-process")
        .with("hint", "pass --force-port to override"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use net_servers_core::schema::{CertificateMode, PortMapping};

    fn env(name: &str, mappings: Vec<(String, Vec<PortMapping>)>) -> Environment {
        Environment {
            name: name.to_string(),
            description: String::new(),
            base_path: format!("/srv/{name}"),
            domain: "local.dev".to_string(),
            admin_email: "admin@local.dev".to_string(),
            enabled: true,
            tags: Vec::new(),
            created_at: String::new(),
            last_used: String::new(),
            certificate_mode: CertificateMode::None,
            port_mappings: mappings,
        }
    }

    fn declared(port: u16) -> DeclaredPort {
        DeclaredPort {
            container_port: port,
            protocol: Protocol::Tcp,
        }
    }

    struct FixedLister(Vec<String>);
    #[async_trait]
    impl ContainerLister for FixedLister {
        async fn running(&self) -> CoreResult<Vec<String>> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn explicit_mapping_beats_default_table() {
        let env = env(
            "testing",
            vec![(
                "apache".to_string(),
                vec![PortMapping {
                    container_port: 80,
                    host_port: 8180,
                    protocol: Protocol::Tcp,
                }],
            )],
        );
        let resolved = resolve_ports(&env, "apache", &[declared(80), declared(443)]);
        assert_eq!(resolved[0].host_port, 8180);
        // 443 falls back to the bundled default.
        assert_eq!(resolved[1].host_port, 8443);
    }

    #[test]
    fn unknown_ports_allocate_in_the_environment_range() {
        let testing = env("testing", Vec::new());
        let resolved = resolve_ports(&testing, "gitweb", &[declared(3000)]);
        assert!((8100..=8999).contains(&resolved[0].host_port));

        let development = env("development", Vec::new());
        let resolved = resolve_ports(&development, "gitweb", &[declared(3000)]);
        assert!((8000..=8099).contains(&resolved[0].host_port));
    }

    #[test]
    fn allocation_avoids_duplicate_host_ports() {
        let testing = env("testing", Vec::new());
        let resolved = resolve_ports(
            &testing,
            "gitweb",
            &[declared(3000), declared(3900), declared(4800)],
        );
        let hosts: BTreeSet<u16> = resolved.iter().map(|r| r.host_port).collect();
        assert_eq!(hosts.len(), 3);
    }

    #[tokio::test]
    async fn bound_port_owned_by_other_environment_is_a_conflict() {
        // Occupy a real port to make the probe fail.
        let listener = std::net::TcpListener::bind(("0.0.0.0", 0)).unwrap();
        let busy = listener.local_addr().unwrap().port();

        let testing = env(
            "testing",
            vec![(
                "apache".to_string(),
                vec![PortMapping {
                    container_port: 80,
                    host_port: busy,
                    protocol: Protocol::Tcp,
                }],
            )],
        );
        let staging = env("staging", Vec::new());
        let registry = EnvironmentsFile {
            current_environment: "staging".to_string(),
            environments: vec![testing, staging.clone()],
        };
        let resolved = [ResolvedPort {
            container_port: 80,
            host_port: busy,
            protocol: Protocol::Tcp,
        }];
        let lister = FixedLister(vec!["net-servers-apache-testing".to_string()]);

        let err = check_start_conflicts(&registry, &staging, "apache", &resolved, &lister, false)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::PortConflict);
        assert_eq!(
            err.context.get("owner").map(String::as_str),
            Some("net-servers-apache-testing")
        );
        assert!(err.context.contains_key("hint"));
    }

    #[tokio::test]
    async fn unrelated_process_is_fatal_unless_forced() {
        let listener = std::net::TcpListener::bind(("0.0.0.0", 0)).unwrap();
        let busy = listener.local_addr().unwrap().port();

        let staging = env("staging", Vec::new());
        let registry = EnvironmentsFile {
            current_environment: "staging".to_string(),
            environments: vec![staging.clone()],
        };
        let resolved = [ResolvedPort {
            container_port: 80,
            host_port: busy,
            protocol: Protocol::Tcp,
        }];
        let lister = FixedLister(Vec::new());

        let err = check_start_conflicts(&registry, &staging, "apache", &resolved, &lister, false)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::PortConflict);
        assert_eq!(
            err.context.get("owner").map(String::as_str),
            Some("unknown-process")
        );

        check_start_conflicts(&registry, &staging, "apache", &resolved, &lister, true)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn free_ports_pass_without_runtime_queries() {
        struct PanicLister;
        #[async_trait]
        impl ContainerLister for PanicLister {
            async fn running(&self) -> CoreResult<Vec<String>> {
                panic!("must not query the runtime when every port is free");
            }
        }

        // An ephemeral port that we immediately release is almost certainly
        // still free.
        let free = {
            let listener = std::net::TcpListener::bind(("0.0.0.0", 0)).unwrap();
            listener.local_addr().unwrap().port()
        };
        let staging = env("staging", Vec::new());
        let registry = EnvironmentsFile {
            current_environment: "staging".to_string(),
            environments: vec![staging.clone()],
        };
        let resolved = [ResolvedPort {
            container_port: 80,
            host_port: free,
            protocol: Protocol::Tcp,
        }];
        check_start_conflicts(&registry, &staging, "apache", &resolved, &PanicLister, false)
            .await
            .unwrap();
    }
}
