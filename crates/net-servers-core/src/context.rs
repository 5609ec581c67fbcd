//! The explicit context value threaded through every component.
//!
//! There is no process-global configuration state; tests build a fresh
//! context per case and the CLI builds exactly one.

use crate::environments::EnvironmentManager;
use crate::error::CoreResult;
use crate::paths::Paths;
use crate::schema::Environment;
use crate::store::ConfigStore;
use std::path::Path;

pub struct CoreContext {
    manager: EnvironmentManager,
    paths: Paths,
    store: ConfigStore,
}

impl CoreContext {
    /// Open the registry under `dir` and anchor the store to the current
    /// environment.
    pub async fn load(dir: &Path) -> CoreResult<Self> {
        let manager = EnvironmentManager::open(dir).await?;
        let paths = manager.current_paths()?;
        let store = ConfigStore::new(paths.clone());
        Ok(Self {
            manager,
            paths,
            store,
        })
    }

    #[must_use]
    pub fn from_parts(manager: EnvironmentManager, paths: Paths) -> Self {
        let store = ConfigStore::new(paths.clone());
        Self {
            manager,
            paths,
            store,
        }
    }

    #[must_use]
    pub fn manager(&self) -> &EnvironmentManager {
        &self.manager
    }

    #[must_use]
    pub fn manager_mut(&mut self) -> &mut EnvironmentManager {
        &mut self.manager
    }

    #[must_use]
    pub fn paths(&self) -> &Paths {
        &self.paths
    }

    #[must_use]
    pub fn store(&self) -> &ConfigStore {
        &self.store
    }

    pub fn environment(&self) -> CoreResult<&Environment> {
        self.manager.current()
    }

    /// Switch environments: update the registry pointer, re-derive paths and
    /// replace the store (which also drops its cache). The caller emits
    /// `EnvironmentSwitched` on the event bus.
    pub async fn switch(&mut self, name: &str) -> CoreResult<Environment> {
        let env = self.manager.switch(name).await?.clone();
        self.paths = self.manager.current_paths()?;
        self.paths.ensure_directories()?;
        self.store = ConfigStore::new(self.paths.clone());
        Ok(env)
    }
}
