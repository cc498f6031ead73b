use crate::config::CoordConfig;
use crate::lock::LockManager;
use dossier_core::CasePaths;
use std::path::PathBuf;

/// One case directory together with the settings used to coordinate on it.
#[derive(Debug, Clone)]
pub struct Case {
    paths: CasePaths,
    config: CoordConfig,
    locks: LockManager,
}

impl Case {
    pub fn open(root: impl Into<PathBuf>) -> Self {
        let paths = CasePaths::new(root);
        let config = CoordConfig::load(&paths);
        Self::with_config(paths, config)
    }

    pub fn with_config(paths: CasePaths, config: CoordConfig) -> Self {
        let locks = LockManager::new(config.lock.clone());
        Self {
            paths,
            config,
            locks,
        }
    }

    pub fn paths(&self) -> &CasePaths {
        &self.paths
    }

    pub fn config(&self) -> &CoordConfig {
        &self.config
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }
}
