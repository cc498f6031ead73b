use dossier_core::CasePaths;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

pub const LOCK_TIMEOUT_ENV: &str = "DOSSIER_LOCK_TIMEOUT_MS";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct LockConfig {
    pub timeout_ms: u64,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub stale_after_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            initial_backoff_ms: 25,
            max_backoff_ms: 500,
            stale_after_ms: 60_000,
        }
    }
}

impl LockConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms.max(1))
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms.max(self.initial_backoff_ms).max(1))
    }

    pub fn stale_after(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.stale_after_ms.min(i64::MAX as u64) as i64)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct CoordConfig {
    pub lock: LockConfig,
    pub allocation_stale_after_secs: u64,
}

impl Default for CoordConfig {
    fn default() -> Self {
        Self {
            lock: LockConfig::default(),
            allocation_stale_after_secs: 3_600,
        }
    }
}

impl CoordConfig {
    /// Per-case config, then `~/.dossier/config.json`, then defaults, with
    /// environment overrides applied last.
    pub fn load(paths: &CasePaths) -> Self {
        let mut candidates = vec![paths.config.clone()];
        if let Some(home) = dirs::home_dir() {
            candidates.push(home.join(".dossier").join("config.json"));
        }
        let mut config = Self::from_candidates(&candidates);
        config.apply_env(|key| std::env::var(key).ok());
        config
    }

    fn from_candidates(candidates: &[PathBuf]) -> Self {
        for path in candidates {
            let Ok(content) = fs::read_to_string(path) else {
                continue;
            };
            match serde_json::from_str::<CoordConfig>(&content) {
                Ok(config) => return config,
                Err(err) => {
                    warn!(
                        event = "config_parse_error",
                        path = %path.display(),
                        error = %err
                    );
                }
            }
        }
        Self::default()
    }

    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(raw) = lookup(LOCK_TIMEOUT_ENV) {
            match raw.trim().parse::<u64>() {
                Ok(timeout_ms) => self.lock.timeout_ms = timeout_ms,
                Err(err) => warn!(
                    event = "config_env_ignored",
                    key = LOCK_TIMEOUT_ENV,
                    value = %raw,
                    error = %err
                ),
            }
        }
    }

    pub fn allocation_stale_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.allocation_stale_after_secs.min(i64::MAX as u64) as i64)
    }
}
