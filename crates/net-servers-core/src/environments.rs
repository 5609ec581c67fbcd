//! The environment registry: multiple isolated configuration trees
//! multiplexed by one process.

use crate::error::{parse_error, validation_error, CoreError, CoreResult, ErrorKind};
use crate::fsutil::write_atomic;
use crate::paths::{check_base_conflicts, Paths};
use crate::schema::yaml::to_canonical_string;
use crate::schema::{CertificateMode, Document, Environment, EnvironmentsFile};
use std::path::{Path, PathBuf};
use tracing::info;

/// Process-only override of the current environment.
pub const ENV_ENV_VAR: &str = "NET_SERVERS_ENV";

/// Committed registry file name and its personal overlay. When the overlay
/// exists it fully replaces the committed file for this process.
pub const REGISTRY_FILE: &str = "environments.yaml";
pub const OVERLAY_FILE: &str = "environments.local.yaml";

pub struct EnvironmentManager {
    registry_path: PathBuf,
    start_dir: PathBuf,
    file: EnvironmentsFile,
}

impl EnvironmentManager {
    /// Locate and load the registry under `dir`.
    ///
    /// Lookup order: `environments.local.yaml`, `environments.yaml`,
    /// `config/environments.yaml`. Mutations are saved back to whichever
    /// file was loaded.
    pub async fn open(dir: &Path) -> CoreResult<Self> {
        let candidates = [
            dir.join(OVERLAY_FILE),
            dir.join(REGISTRY_FILE),
            dir.join("config").join(REGISTRY_FILE),
        ];
        let registry_path = candidates
            .iter()
            .find(|p| p.exists())
            .cloned()
            .ok_or_else(|| {
                CoreError::new(
                    ErrorKind::EnvNotFound,
                    format!(
                        "no {REGISTRY_FILE} found under {}; run `environments init` first",
                        dir.display()
                    ),
                )
                .with("dir", dir.display())
            })?;
        Self::open_at(registry_path, dir.to_path_buf()).await
    }

    pub async fn open_at(registry_path: PathBuf, start_dir: PathBuf) -> CoreResult<Self> {
        let text = tokio::fs::read_to_string(&registry_path)
            .await
            .map_err(|e| CoreError::from_io(&e, &registry_path))?;
        let value: serde_yaml::Value = serde_yaml::from_str(&text).map_err(|e| {
            CoreError::new(
                ErrorKind::ConfigParse,
                format!("{}: {e}", registry_path.display()),
            )
            .with("file", registry_path.display())
        })?;
        let file_name = registry_path.display().to_string();
        let file =
            EnvironmentsFile::parse(&value).map_err(|issues| parse_error(&file_name, &issues))?;
        let manager = Self {
            registry_path,
            start_dir,
            file,
        };
        manager.validate()?;
        Ok(manager)
    }

    /// Create a fresh registry with a `development` environment rooted next
    /// to it. Refuses to overwrite unless `force`.
    pub async fn init(dir: &Path, force: bool) -> CoreResult<Self> {
        let registry_path = dir.join(REGISTRY_FILE);
        if registry_path.exists() && !force {
            return Err(CoreError::new(
                ErrorKind::ConfigValidate,
                format!("{} already exists (use force to overwrite)", registry_path.display()),
            )
            .with("file", registry_path.display()));
        }
        let now = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
        let development = Environment {
            name: "development".to_string(),
            description: "Default development environment".to_string(),
            base_path: dir.join("data").join("development").display().to_string(),
            domain: "local.dev".to_string(),
            admin_email: "admin@local.dev".to_string(),
            enabled: true,
            tags: vec!["dev".to_string()],
            created_at: now.clone(),
            last_used: now,
            certificate_mode: CertificateMode::SelfSigned,
            port_mappings: Vec::new(),
        };
        let file = EnvironmentsFile {
            current_environment: development.name.clone(),
            environments: vec![development],
        };
        let manager = Self {
            registry_path,
            start_dir: dir.to_path_buf(),
            file,
        };
        manager.persist().await?;
        manager.current_paths()?.ensure_directories()?;
        info!(path = %manager.registry_path.display(), "initialized environment registry");
        Ok(manager)
    }

    #[must_use]
    pub fn registry_path(&self) -> &Path {
        &self.registry_path
    }

    #[must_use]
    pub fn list(&self) -> &[Environment] {
        &self.file.environments
    }

    pub fn info(&self, name: &str) -> CoreResult<&Environment> {
        self.file.find(name).ok_or_else(|| not_found(name))
    }

    /// The effective current environment, honouring `NET_SERVERS_ENV` as a
    /// process-only override.
    pub fn current(&self) -> CoreResult<&Environment> {
        let name = match std::env::var(ENV_ENV_VAR) {
            Ok(v) if !v.is_empty() => v,
            _ => self.file.current_environment.clone(),
        };
        let env = self.file.find(&name).ok_or_else(|| not_found(&name))?;
        if !env.enabled {
            return Err(not_enabled(&name));
        }
        Ok(env)
    }

    /// Paths for the current environment, resolved against the directory the
    /// registry was opened from.
    pub fn current_paths(&self) -> CoreResult<Paths> {
        Paths::resolve(self.current()?, &self.start_dir)
    }

    pub fn paths_for(&self, name: &str) -> CoreResult<Paths> {
        Paths::resolve(self.info(name)?, &self.start_dir)
    }

    /// Full registry validation: schema rules plus base-path conflicts.
    pub fn validate(&self) -> CoreResult<()> {
        let issues = self.file.validate();
        if !issues.is_empty() {
            return Err(validation_error(REGISTRY_FILE, &issues));
        }
        check_base_conflicts(&self.file, &self.start_dir)
    }

    /// Switch the persisted current pointer. Stamps `last_used` and saves;
    /// the caller must invalidate the store cache, re-derive paths and emit
    /// `EnvironmentSwitched`.
    pub async fn switch(&mut self, name: &str) -> CoreResult<&Environment> {
        let env = self.file.find(name).ok_or_else(|| not_found(name))?;
        if !env.enabled {
            return Err(not_enabled(name));
        }
        self.file.current_environment = name.to_string();
        if let Some(env) = self.file.find_mut(name) {
            env.last_used = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
        }
        self.persist().await?;
        info!(environment = name, "switched current environment");
        Ok(self.file.find(name).expect("environment just switched to"))
    }

    pub async fn add(&mut self, env: Environment) -> CoreResult<()> {
        if self.file.find(&env.name).is_some() {
            return Err(CoreError::new(
                ErrorKind::ConfigValidate,
                format!("environment {:?} already exists", env.name),
            )
            .with("name", &env.name));
        }
        let name = env.name.clone();
        self.file.environments.push(env);
        if let Err(e) = self.validate() {
            self.file.environments.retain(|e| e.name != name);
            return Err(e);
        }
        let paths = self.paths_for(&name)?;
        paths.ensure_directories()?;
        self.persist().await?;
        info!(environment = %name, base = %paths.base.display(), "added environment");
        Ok(())
    }

    /// Removing the current or the last enabled environment is forbidden.
    pub async fn remove(&mut self, name: &str) -> CoreResult<()> {
        if self.file.find(name).is_none() {
            return Err(not_found(name));
        }
        if name == self.file.current_environment {
            return Err(CoreError::new(
                ErrorKind::EnvCurrentRemove,
                format!("environment {name:?} is current and cannot be removed"),
            )
            .with("name", name));
        }
        let enabled: Vec<_> = self
            .file
            .environments
            .iter()
            .filter(|e| e.enabled)
            .map(|e| e.name.clone())
            .collect();
        if enabled == [name.to_string()] {
            return Err(CoreError::new(
                ErrorKind::EnvLastRemaining,
                format!("environment {name:?} is the last one enabled"),
            )
            .with("name", name));
        }
        self.file.environments.retain(|e| e.name != name);
        self.persist().await?;
        info!(environment = name, "removed environment");
        Ok(())
    }

    pub async fn enable(&mut self, name: &str) -> CoreResult<()> {
        self.set_enabled(name, true).await
    }

    pub async fn disable(&mut self, name: &str) -> CoreResult<()> {
        if name == self.file.current_environment {
            return Err(CoreError::new(
                ErrorKind::EnvCurrentRemove,
                format!("environment {name:?} is current and cannot be disabled"),
            )
            .with("name", name));
        }
        self.set_enabled(name, false).await
    }

    async fn set_enabled(&mut self, name: &str, enabled: bool) -> CoreResult<()> {
        let env = self.file.find_mut(name).ok_or_else(|| not_found(name))?;
        env.enabled = enabled;
        self.persist().await?;
        info!(environment = name, enabled, "updated environment");
        Ok(())
    }

    async fn persist(&self) -> CoreResult<()> {
        let text = to_canonical_string(&self.file.emit());
        write_atomic(&self.registry_path, text.as_bytes(), 0o644).await
    }
}

fn not_found(name: &str) -> CoreError {
    CoreError::new(
        ErrorKind::EnvNotFound,
        format!("environment {name:?} is not defined"),
    )
    .with("name", name)
}

fn not_enabled(name: &str) -> CoreError {
    CoreError::new(
        ErrorKind::EnvNotEnabled,
        format!("environment {name:?} is disabled"),
    )
    .with("name", name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(name: &str, base: &Path) -> Environment {
        Environment {
            name: name.to_string(),
            description: String::new(),
            base_path: base.display().to_string(),
            domain: "local.dev".to_string(),
            admin_email: "admin@local.dev".to_string(),
            enabled: true,
            tags: Vec::new(),
            created_at: String::new(),
            last_used: String::new(),
            certificate_mode: CertificateMode::SelfSigned,
            port_mappings: Vec::new(),
        }
    }

    #[tokio::test]
    async fn init_creates_registry_and_development_environment() {
        let dir = tempfile::tempdir().unwrap();
        let manager = EnvironmentManager::init(dir.path(), false).await.unwrap();
        assert_eq!(manager.current().unwrap().name, "development");
        assert!(dir.path().join(REGISTRY_FILE).exists());
        assert!(dir.path().join("data/development/config").exists());

        // Re-init without force refuses.
        assert!(EnvironmentManager::init(dir.path(), false).await.is_err());
        EnvironmentManager::init(dir.path(), true).await.unwrap();
    }

    #[tokio::test]
    async fn switch_rejects_unknown_and_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = EnvironmentManager::init(dir.path(), false).await.unwrap();
        manager
            .add(env("testing", &dir.path().join("data/testing")))
            .await
            .unwrap();

        assert_eq!(
            manager.switch("staging").await.unwrap_err().kind,
            ErrorKind::EnvNotFound
        );
        manager.disable("testing").await.unwrap();
        assert_eq!(
            manager.switch("testing").await.unwrap_err().kind,
            ErrorKind::EnvNotEnabled
        );
        manager.enable("testing").await.unwrap();
        let switched = manager.switch("testing").await.unwrap();
        assert!(!switched.last_used.is_empty());

        // The pointer survives a reload from disk.
        let reloaded = EnvironmentManager::open(dir.path()).await.unwrap();
        assert_eq!(reloaded.current().unwrap().name, "testing");
    }

    #[tokio::test]
    async fn remove_guards_current_and_last_enabled() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = EnvironmentManager::init(dir.path(), false).await.unwrap();
        manager
            .add(env("testing", &dir.path().join("data/testing")))
            .await
            .unwrap();

        assert_eq!(
            manager.remove("development").await.unwrap_err().kind,
            ErrorKind::EnvCurrentRemove
        );
        manager.remove("testing").await.unwrap();
        assert_eq!(
            manager.remove("testing").await.unwrap_err().kind,
            ErrorKind::EnvNotFound
        );
    }

    #[tokio::test]
    async fn add_rolls_back_on_base_path_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = EnvironmentManager::init(dir.path(), false).await.unwrap();
        let clashing = env("clash", &dir.path().join("data/development"));
        let err = manager.add(clashing).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::PathConflict);
        assert!(manager.info("clash").is_err());
    }

    #[tokio::test]
    async fn overlay_fully_replaces_committed_registry() {
        let dir = tempfile::tempdir().unwrap();
        EnvironmentManager::init(dir.path(), false).await.unwrap();

        let overlay = EnvironmentsFile {
            current_environment: "scratch".to_string(),
            environments: vec![env("scratch", &dir.path().join("scratch"))],
        };
        tokio::fs::write(
            dir.path().join(OVERLAY_FILE),
            to_canonical_string(&overlay.emit()),
        )
        .await
        .unwrap();

        let manager = EnvironmentManager::open(dir.path()).await.unwrap();
        assert_eq!(manager.current().unwrap().name, "scratch");
        assert!(manager.info("development").is_err());
    }
}
