//! Container supervision: translate typed configuration into runtime
//! argument vectors and drive the external runtime with failure isolation
//! across batch operations.

use crate::ports::{check_start_conflicts, resolve_ports, ContainerLister, ResolvedPort};
use crate::reload::ReloadCoordinator;
use crate::runtime::RuntimeClient;
use crate::sync::SyncSnapshot;
use net_servers_core::error::{CoreError, CoreResult, ErrorKind};
use net_servers_core::schema::{Environment, EnvironmentsFile, Protocol};
use serde_yaml::Value;
use std::sync::Arc;
use tracing::{info, warn};

/// Built-in definitions for the shipped containers.
#[derive(Debug, Clone, Copy)]
pub struct ServiceDefinition {
    pub name: &'static str,
    pub dockerfile: &'static str,
}

pub const SERVICE_DEFINITIONS: &[ServiceDefinition] = &[
    ServiceDefinition {
        name: "apache",
        dockerfile: "docker/apache/Dockerfile",
    },
    ServiceDefinition {
        name: "mail",
        dockerfile: "docker/mail/Dockerfile",
    },
    ServiceDefinition {
        name: "dns",
        dockerfile: "docker/dns/Dockerfile",
    },
];

#[must_use]
pub fn definition(name: &str) -> Option<&'static ServiceDefinition> {
    SERVICE_DEFINITIONS.iter().find(|d| d.name == name)
}

/// Everything needed for one `run` invocation.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub image: String,
    pub name: String,
    pub ports: Vec<ResolvedPort>,
    /// `(host_path, container_path, read_only)`.
    pub volumes: Vec<(String, String, bool)>,
    /// Ordered key/value pairs; booleans are already rendered `true`/`false`.
    pub env: Vec<(String, String)>,
}

impl ContainerSpec {
    /// The argument vector after the `run` verb.
    #[must_use]
    pub fn run_args(&self) -> Vec<String> {
        let mut args = vec!["-d".to_string(), "--name".to_string(), self.name.clone()];
        for port in &self.ports {
            let mapping = match port.protocol {
                Protocol::Tcp => format!("{}:{}", port.host_port, port.container_port),
                Protocol::Udp => format!("{}:{}/udp", port.host_port, port.container_port),
            };
            args.extend(["-p".to_string(), mapping]);
        }
        for (host, container, read_only) in &self.volumes {
            let suffix = if *read_only { ":ro" } else { "" };
            args.extend(["-v".to_string(), format!("{host}:{container}{suffix}")]);
        }
        for (key, value) in &self.env {
            args.extend(["-e".to_string(), format!("{key}={value}")]);
        }
        args.push(self.image.clone());
        args
    }
}

/// Compose the full container spec for one service in one environment.
pub fn compose_spec(snap: &SyncSnapshot, env: &Environment, service: &str) -> CoreResult<ContainerSpec> {
    let config = snap.services.find(service).ok_or_else(|| {
        CoreError::new(
            ErrorKind::ConfigValidate,
            format!("service {service:?} is not configured"),
        )
        .with("service", service)
    })?;

    let ports = resolve_ports(env, &config.container_ref, &config.declared_ports);

    let development = env.name == "development" || env.tags.iter().any(|t| t == "dev");
    let paths = &snap.paths;
    let volumes = vec![
        (paths.config_dir.display().to_string(), "/data/config".to_string(), true),
        (paths.state_dir.display().to_string(), "/data/state".to_string(), false),
        (paths.logs_dir.display().to_string(), "/data/logs".to_string(), false),
        (
            paths.code_dir.display().to_string(),
            "/data/code".to_string(),
            !development,
        ),
    ];

    let domain = &snap.global.system.domain;
    let mut env_vars = vec![
        ("SERVICE_NAME".to_string(), service.to_string()),
        ("CONFIG_PATH".to_string(), "/data/config".to_string()),
        ("STATE_PATH".to_string(), "/data/state".to_string()),
        ("LOGS_PATH".to_string(), "/data/logs".to_string()),
        ("DOMAIN".to_string(), domain.clone()),
        ("ADMIN_EMAIL".to_string(), snap.global.system.admin_email.clone()),
        ("TZ".to_string(), snap.global.system.timezone.clone()),
    ];

    // SSL material is only advertised when the triple is actually on disk,
    // so a `none`-mode domain runs with SSL_ENABLED=false.
    let cert_dir = paths.certificate_dir(domain);
    let ssl_ready = config.ssl
        && ["cert.pem", "privkey.pem", "fullchain.pem"]
            .iter()
            .all(|f| cert_dir.join(f).exists());
    env_vars.push(("SSL_ENABLED".to_string(), bool_str(ssl_ready).to_string()));
    if ssl_ready {
        let base = format!("/data/state/certificates/{domain}");
        env_vars.push(("SSL_CERT_FILE".to_string(), format!("{base}/cert.pem")));
        env_vars.push(("SSL_KEY_FILE".to_string(), format!("{base}/privkey.pem")));
        env_vars.push(("SSL_CHAIN_FILE".to_string(), format!("{base}/fullchain.pem")));
    }

    // Scalar service settings pass through as SERVICE_KEY variables.
    let prefix = service.to_uppercase().replace('-', "_");
    for (key, value) in &config.settings {
        let (Value::String(key), Some(rendered)) = (key, scalar_str(value)) else {
            continue;
        };
        env_vars.push((format!("{prefix}_{}", key.to_uppercase()), rendered));
    }

    Ok(ContainerSpec {
        image: format!("net-servers-{}:{}", config.container_ref, env.name),
        name: snap.container_name(&config.container_ref),
        ports,
        volumes,
        env: env_vars,
    })
}

fn scalar_str(value: &Value) -> Option<String> {
    match value {
        Value::Bool(b) => Some(bool_str(*b).to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) => Some(s.clone()),
        _ => None,
    }
}

fn bool_str(b: bool) -> &'static str {
    if b {
        "true"
    } else {
        "false"
    }
}

/// Per-service result of a batch operation. One container's failure does
/// not short-circuit the rest; the batch exit status aggregates.
#[derive(Debug, Default)]
pub struct Batch {
    pub results: Vec<(String, CoreResult<()>)>,
}

impl Batch {
    #[must_use]
    pub fn ok(&self) -> bool {
        self.results.iter().all(|(_, r)| r.is_ok())
    }

    /// The most severe failure, for the aggregate exit status.
    #[must_use]
    pub fn first_error(&self) -> Option<&CoreError> {
        self.results.iter().find_map(|(_, r)| r.as_ref().err())
    }
}

pub struct Supervisor {
    runtime: Arc<RuntimeClient>,
    reload: Arc<ReloadCoordinator>,
}

impl Supervisor {
    #[must_use]
    pub fn new(runtime: Arc<RuntimeClient>, reload: Arc<ReloadCoordinator>) -> Self {
        Self { runtime, reload }
    }

    /// Idempotent image build; `rebuild` passes the no-cache hint.
    pub async fn build(&self, service: &str, env: &Environment, rebuild: bool) -> CoreResult<()> {
        let def = definition(service).ok_or_else(|| unknown_service(service))?;
        let tag = format!("net-servers-{}:{}", def.name, env.name);
        self.runtime.build(&tag, def.dockerfile, ".", rebuild).await?;
        Ok(())
    }

    /// Start one container: resolve ports, probe for conflicts, replace any
    /// stale container of the same name, then run.
    pub async fn start(
        &self,
        snap: &SyncSnapshot,
        registry: &EnvironmentsFile,
        env: &Environment,
        service: &str,
        force_port: bool,
    ) -> CoreResult<()> {
        let spec = compose_spec(snap, env, service)?;
        check_start_conflicts(
            registry,
            env,
            service,
            &spec.ports,
            self.runtime.as_ref() as &dyn ContainerLister,
            force_port,
        )
        .await?;

        // Replace a stale same-name container; ignore "no such container".
        if let Err(e) = self.runtime.rm(&spec.name, true).await {
            if e.kind != ErrorKind::RuntimeError {
                return Err(e);
            }
        }

        self.runtime.run(spec.run_args()).await?;
        self.reload.clear(&spec.name).await;
        info!(container = %spec.name, "started container");
        Ok(())
    }

    pub async fn stop(&self, snap: &SyncSnapshot, service: &str) -> CoreResult<()> {
        let name = snap.container_name(service);
        self.runtime.stop(&name).await?;
        self.reload.clear(&name).await;
        Ok(())
    }

    pub async fn remove(&self, snap: &SyncSnapshot, service: &str, force: bool) -> CoreResult<()> {
        let name = snap.container_name(service);
        self.runtime.rm(&name, force).await?;
        Ok(())
    }

    pub async fn logs(&self, snap: &SyncSnapshot, service: &str, tail: Option<u32>) -> CoreResult<String> {
        let name = snap.container_name(service);
        let output = self.runtime.logs(&name, tail).await?;
        Ok(output.stdout)
    }

    /// Names of managed containers known to the runtime.
    pub async fn list(&self) -> CoreResult<Vec<String>> {
        let names = self.runtime.ps_names(true).await?;
        Ok(names
            .into_iter()
            .filter(|n| n.starts_with("net-servers-"))
            .collect())
    }

    /// Smoke-test a running container: it must be listed and accept exec.
    pub async fn test(&self, snap: &SyncSnapshot, service: &str) -> CoreResult<()> {
        let name = snap.container_name(service);
        let running = self.runtime.ps_names(false).await?;
        if !running.contains(&name) {
            return Err(CoreError::new(
                ErrorKind::RuntimeError,
                format!("container {name:?} is not running"),
            )
            .with("container", name));
        }
        self.runtime
            .exec_in(&name, &["sh".to_string(), "-c".to_string(), "true".to_string()])
            .await?;
        Ok(())
    }

    pub async fn build_all(&self, env: &Environment, rebuild: bool) -> Batch {
        let mut batch = Batch::default();
        for def in SERVICE_DEFINITIONS {
            let result = self.build(def.name, env, rebuild).await;
            if let Err(e) = &result {
                warn!(service = def.name, "build failed: {e}");
            }
            batch.results.push((def.name.to_string(), result));
        }
        batch
    }

    pub async fn start_all(
        &self,
        snap: &SyncSnapshot,
        registry: &EnvironmentsFile,
        env: &Environment,
        force_port: bool,
    ) -> Batch {
        let mut batch = Batch::default();
        for (name, _) in &snap.services.services {
            let result = self.start(snap, registry, env, name, force_port).await;
            if let Err(e) = &result {
                warn!(service = %name, "start failed: {e}");
            }
            batch.results.push((name.clone(), result));
        }
        batch
    }

    pub async fn stop_all(&self, snap: &SyncSnapshot) -> Batch {
        let mut batch = Batch::default();
        for (name, _) in &snap.services.services {
            batch
                .results
                .push((name.clone(), self.stop(snap, name).await));
        }
        batch
    }

    pub async fn remove_all(&self, snap: &SyncSnapshot, force: bool) -> Batch {
        let mut batch = Batch::default();
        for (name, _) in &snap.services.services {
            batch
                .results
                .push((name.clone(), self.remove(snap, name, force).await));
        }
        batch
    }

    /// Stop and remove every container, then drop the images.
    pub async fn clean_all(&self, snap: &SyncSnapshot, env: &Environment) -> Batch {
        let mut batch = self.stop_all(snap).await;
        batch.results.extend(self.remove_all(snap, true).await.results);
        for (name, config) in &snap.services.services {
            let image = format!("net-servers-{}:{}", config.container_ref, env.name);
            batch
                .results
                .push((format!("{name}:image"), self.runtime.rmi(&image, true).await.map(|_| ())));
        }
        batch
    }
}

fn unknown_service(service: &str) -> CoreError {
    let available: Vec<_> = SERVICE_DEFINITIONS.iter().map(|d| d.name).collect();
    CoreError::new(
        ErrorKind::ConfigValidate,
        format!("unknown container {service:?}, available: {}", available.join(", ")),
    )
    .with("service", service)
}

#[cfg(test)]
mod tests {
    use super::*;
    use net_servers_core::paths::Paths;
    use net_servers_core::schema::{
        CertificateMode, DomainsFile, GlobalConfig, PortMapping, ServicesFile, UsersFile,
    };
    use net_servers_core::schema::Document;
    use net_servers_core::secrets::SecretsFile;
    use std::path::Path;

    fn snapshot(base: &Path) -> SyncSnapshot {
        SyncSnapshot {
            environment: "development".to_string(),
            global: GlobalConfig::default(),
            users: UsersFile::default(),
            domains: DomainsFile::default(),
            services: ServicesFile::default_document(),
            secrets: SecretsFile::default(),
            paths: Paths::from_base(base.to_path_buf()),
        }
    }

    fn environment() -> Environment {
        Environment {
            name: "development".to_string(),
            description: String::new(),
            base_path: "/srv/dev".to_string(),
            domain: "local.dev".to_string(),
            admin_email: "admin@local.dev".to_string(),
            enabled: true,
            tags: Vec::new(),
            created_at: String::new(),
            last_used: String::new(),
            certificate_mode: CertificateMode::SelfSigned,
            port_mappings: vec![(
                "apache".to_string(),
                vec![PortMapping {
                    container_port: 80,
                    host_port: 8080,
                    protocol: Protocol::Tcp,
                }],
            )],
        }
    }

    #[test]
    fn spec_composition_covers_image_name_ports_volumes_env() {
        let dir = tempfile::tempdir().unwrap();
        let snap = snapshot(dir.path());
        let spec = compose_spec(&snap, &environment(), "apache").unwrap();

        assert_eq!(spec.image, "net-servers-apache:development");
        assert_eq!(spec.name, "net-servers-apache-development");

        let args = spec.run_args();
        let joined = args.join(" ");
        assert!(joined.contains("-p 8080:80"));
        assert!(joined.contains(&format!(
            "-v {}:/data/config:ro",
            snap.paths.config_dir.display()
        )));
        // development mounts code read-write
        assert!(joined.contains(&format!(
            "-v {}:/data/code ",
            snap.paths.code_dir.display()
        )) || joined.ends_with(&format!("-v {}:/data/code", snap.paths.code_dir.display())));
        assert!(joined.contains("-e DOMAIN=local.dev"));
        assert!(joined.contains("-e SSL_ENABLED=false"));
        assert!(args.last().unwrap() == "net-servers-apache:development");
    }

    #[test]
    fn ssl_env_appears_once_material_exists() {
        let dir = tempfile::tempdir().unwrap();
        let snap = snapshot(dir.path());
        let cert_dir = snap.paths.certificate_dir("local.dev");
        std::fs::create_dir_all(&cert_dir).unwrap();
        for f in ["cert.pem", "privkey.pem", "fullchain.pem"] {
            std::fs::write(cert_dir.join(f), "pem").unwrap();
        }

        let spec = compose_spec(&snap, &environment(), "apache").unwrap();
        let joined = spec.run_args().join(" ");
        assert!(joined.contains("-e SSL_ENABLED=true"));
        assert!(joined
            .contains("-e SSL_CERT_FILE=/data/state/certificates/local.dev/cert.pem"));
        assert!(joined
            .contains("-e SSL_KEY_FILE=/data/state/certificates/local.dev/privkey.pem"));
    }

    #[test]
    fn udp_ports_carry_the_protocol_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let snap = snapshot(dir.path());
        let spec = compose_spec(&snap, &environment(), "dns").unwrap();
        let joined = spec.run_args().join(" ");
        assert!(joined.contains("-p 5353:53/udp"));
    }

    #[test]
    fn scalar_settings_become_prefixed_env_vars() {
        let dir = tempfile::tempdir().unwrap();
        let mut snap = snapshot(dir.path());
        let apache = snap
            .services
            .services
            .iter_mut()
            .find(|(n, _)| n == "apache")
            .map(|(_, c)| c)
            .unwrap();
        apache.settings.insert(
            Value::String("document_root".to_string()),
            Value::String("/var/www/html".to_string()),
        );
        apache
            .settings
            .insert(Value::String("keepalive".to_string()), Value::Bool(true));

        let spec = compose_spec(&snap, &environment(), "apache").unwrap();
        let joined = spec.run_args().join(" ");
        assert!(joined.contains("-e APACHE_DOCUMENT_ROOT=/var/www/html"));
        assert!(joined.contains("-e APACHE_KEEPALIVE=true"));
    }

    #[test]
    fn unknown_service_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let snap = snapshot(dir.path());
        let err = compose_spec(&snap, &environment(), "gitweb").unwrap_err();
        assert_eq!(err.kind, ErrorKind::ConfigValidate);
    }
}
