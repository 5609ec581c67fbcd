//! Canonical path layout for one environment.
//!
//! A [`Paths`] value is derived once from an [`Environment`] and then
//! frozen; every component receives paths from here instead of joining
//! strings ad hoc.

use crate::error::{CoreError, CoreResult, ErrorKind};
use crate::schema::{DocKind, Environment, EnvironmentsFile};
use std::path::{Path, PathBuf};

/// Environment variable overriding `base_path` resolution entirely.
pub const BASE_ENV_VAR: &str = "NET_SERVERS_BASE";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paths {
    pub base: PathBuf,
    pub config_dir: PathBuf,
    pub state_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub code_dir: PathBuf,
}

impl Paths {
    /// Resolve an environment's base path against `start_dir` (the process
    /// working directory at first load) and derive the full layout.
    ///
    /// `NET_SERVERS_BASE` wins over the configured `base_path`.
    pub fn resolve(env: &Environment, start_dir: &Path) -> CoreResult<Self> {
        let configured = match std::env::var(BASE_ENV_VAR) {
            Ok(v) if !v.is_empty() => PathBuf::from(v),
            _ => PathBuf::from(&env.base_path),
        };
        let base = if configured.is_absolute() {
            configured
        } else {
            start_dir.join(configured)
        };
        if !base.is_absolute() {
            return Err(CoreError::new(
                ErrorKind::PathNotAbsolute,
                format!("base path for environment {:?} did not resolve to an absolute path", env.name),
            )
            .with("environment", &env.name)
            .with("base_path", base.display()));
        }
        Ok(Self::from_base(base))
    }

    #[must_use]
    pub fn from_base(base: PathBuf) -> Self {
        Self {
            config_dir: base.join("config"),
            state_dir: base.join("state"),
            logs_dir: base.join("logs"),
            code_dir: base.join("code"),
            base,
        }
    }

    #[must_use]
    pub fn document_path(&self, kind: DocKind) -> PathBuf {
        self.config_dir.join(kind.relative_path())
    }

    #[must_use]
    pub fn certificates_dir(&self) -> PathBuf {
        self.state_dir.join("certificates")
    }

    /// `<state>/certificates/<domain>/`.
    #[must_use]
    pub fn certificate_dir(&self, domain: &str) -> PathBuf {
        self.certificates_dir().join(domain)
    }

    #[must_use]
    pub fn mail_dir(&self) -> PathBuf {
        self.state_dir.join("mail")
    }

    /// Mailbox tree root; each user implies `<vhosts>/<domain>/<user>/`.
    #[must_use]
    pub fn vhosts_dir(&self) -> PathBuf {
        self.mail_dir().join("vhosts")
    }

    #[must_use]
    pub fn apache_auth_dir(&self) -> PathBuf {
        self.state_dir.join("apache").join("auth")
    }

    #[must_use]
    pub fn dns_zones_dir(&self) -> PathBuf {
        self.state_dir.join("dns").join("zones")
    }

    /// Create the directory skeleton. Idempotent.
    pub fn ensure_directories(&self) -> CoreResult<()> {
        let dirs = [
            self.config_dir.join("services"),
            self.state_dir.clone(),
            self.logs_dir.clone(),
            self.code_dir.clone(),
            self.certificates_dir(),
            self.mail_dir(),
            self.vhosts_dir(),
            self.apache_auth_dir(),
            self.dns_zones_dir(),
        ];
        for dir in dirs {
            std::fs::create_dir_all(&dir).map_err(|e| CoreError::from_io(&e, &dir))?;
        }
        Ok(())
    }
}

/// Two enabled environments must not resolve to the same absolute base.
pub fn check_base_conflicts(file: &EnvironmentsFile, start_dir: &Path) -> CoreResult<()> {
    let mut seen: Vec<(&str, PathBuf)> = Vec::new();
    for env in file.environments.iter().filter(|e| e.enabled) {
        let paths = Paths::resolve(env, start_dir)?;
        if let Some((other, _)) = seen.iter().find(|(_, base)| *base == paths.base) {
            return Err(CoreError::new(
                ErrorKind::PathConflict,
                format!(
                    "environments {:?} and {:?} resolve to the same base path",
                    other, env.name
                ),
            )
            .with("base_path", paths.base.display())
            .with("first", *other)
            .with("second", &env.name));
        }
        seen.push((&env.name, paths.base));
    }
    Ok(())
}
