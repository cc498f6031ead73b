use crate::config::LockConfig;
use crate::error::CoordError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, warn};
use uuid::Uuid;

const GATE_ATTEMPTS: u32 = 200;
const GATE_BACKOFF: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockPayload {
    pub pid: u32,
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
    /// Unique per acquisition; a guard only removes a marker carrying its own.
    #[serde(default)]
    pub token: String,
}

/// `<resource>.lock`, next to the resource it guards.
pub fn lock_path_for(resource: &Path) -> PathBuf {
    let mut name = resource
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_else(|| OsString::from("resource"));
    name.push(".lock");
    resource.with_file_name(name)
}

/// `<resource>.lock.reclaim`, held while a marker is judged and removed.
fn gate_path_for(lock_path: &Path) -> PathBuf {
    let mut name = lock_path.as_os_str().to_os_string();
    name.push(".reclaim");
    PathBuf::from(name)
}

/// Removes a lock marker whoever holds it. A missing marker is not an error.
pub fn release(lock_path: &Path) -> Result<(), CoordError> {
    match fs::remove_file(lock_path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(source) => Err(CoordError::LockIo {
            path: lock_path.to_path_buf(),
            source,
        }),
    }
}

fn read_payload(lock_path: &Path) -> Result<Option<LockPayload>, std::io::Error> {
    match fs::read_to_string(lock_path) {
        Ok(content) => Ok(serde_json::from_str(&content).ok()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err),
    }
}

fn mtime_age(path: &Path) -> Result<Option<chrono::Duration>, std::io::Error> {
    let modified = match fs::metadata(path).and_then(|meta| meta.modified()) {
        Ok(modified) => modified,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err),
    };
    let elapsed = SystemTime::now()
        .duration_since(modified)
        .unwrap_or_default();
    Ok(Some(
        chrono::Duration::from_std(elapsed).unwrap_or_else(|_| chrono::Duration::zero()),
    ))
}

/// Age of the marker at `lock_path`, from its payload or, failing that, its
/// modification time. `None` when the marker is gone.
pub fn lock_age(
    lock_path: &Path,
    now: DateTime<Utc>,
) -> Result<Option<chrono::Duration>, CoordError> {
    let io_err = |source| CoordError::LockIo {
        path: lock_path.to_path_buf(),
        source,
    };
    if let Some(payload) = read_payload(lock_path).map_err(io_err)? {
        return Ok(Some(now - payload.acquired_at));
    }
    mtime_age(lock_path).map_err(io_err)
}

/// Serializes the read-then-remove steps on one marker so a marker is only
/// deleted by whoever last judged it. Held for a read and an unlink at most.
struct ReclaimGate {
    path: PathBuf,
}

impl ReclaimGate {
    fn acquire(
        lock_path: &Path,
        stale_after: chrono::Duration,
    ) -> Result<Option<Self>, CoordError> {
        let path = gate_path_for(lock_path);
        let io_err = |source| CoordError::LockIo {
            path: path.clone(),
            source,
        };
        for _ in 0..GATE_ATTEMPTS {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(_) => return Ok(Some(Self { path: path.clone() })),
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    // Left behind by a process that died mid-reclaim.
                    if mtime_age(&path)
                        .map_err(io_err)?
                        .is_some_and(|age| age > stale_after)
                    {
                        warn!(event = "lock_gate_cleared", gate = %path.display());
                        let _ = fs::remove_file(&path);
                        continue;
                    }
                    thread::sleep(GATE_BACKOFF);
                }
                Err(source) => return Err(io_err(source)),
            }
        }
        Ok(None)
    }
}

impl Drop for ReclaimGate {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// Held lock marker. Dropping the guard removes the marker unless it was
/// reclaimed as stale and now belongs to someone else.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    token: String,
    stale_after: chrono::Duration,
    released: bool,
}

impl LockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn release(mut self) -> Result<(), CoordError> {
        self.released = true;
        self.remove_own_marker()
    }

    fn remove_own_marker(&self) -> Result<(), CoordError> {
        let Some(_gate) = ReclaimGate::acquire(&self.path, self.stale_after)? else {
            // The marker goes stale and is reclaimed later.
            warn!(event = "lock_release_deferred", lock = %self.path.display());
            return Ok(());
        };
        let io_err = |source| CoordError::LockIo {
            path: self.path.clone(),
            source,
        };
        match read_payload(&self.path).map_err(io_err)? {
            Some(payload) if payload.token == self.token => release(&self.path),
            Some(payload) => {
                warn!(
                    event = "lock_lost",
                    lock = %self.path.display(),
                    holder = %payload.holder
                );
                Ok(())
            }
            None => Ok(()),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if !self.released {
            let _ = self.remove_own_marker();
        }
    }
}

/// Advisory mutual exclusion through marker files created with create-new
/// semantics. Markers older than `stale_after` belong to crashed holders and
/// are cleared by the next acquirer.
#[derive(Debug, Clone)]
pub struct LockManager {
    config: LockConfig,
    holder: String,
}

impl LockManager {
    pub fn new(config: LockConfig) -> Self {
        Self {
            config,
            holder: format!("pid-{}", std::process::id()),
        }
    }

    pub fn with_holder(mut self, holder: impl Into<String>) -> Self {
        self.holder = holder.into();
        self
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    /// Single attempt, including one stale-marker reclaim.
    pub fn try_acquire(&self, resource: &Path) -> Result<Option<LockGuard>, CoordError> {
        let lock_path = lock_path_for(resource);
        if let Some(parent) = lock_path.parent() {
            fs::create_dir_all(parent).map_err(|source| CoordError::LockIo {
                path: lock_path.clone(),
                source,
            })?;
        }

        for _ in 0..2 {
            match self.create_marker(&lock_path)? {
                Some(guard) => return Ok(Some(guard)),
                None => {
                    if !self.reclaim_if_stale(&lock_path)? {
                        return Ok(None);
                    }
                }
            }
        }
        Ok(None)
    }

    /// Retries with doubling backoff until the configured timeout.
    pub fn acquire(&self, resource: &Path) -> Result<LockGuard, CoordError> {
        let started = Instant::now();
        let timeout = self.config.timeout();
        let mut backoff = self.config.initial_backoff();
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            if let Some(guard) = self.try_acquire(resource)? {
                debug!(
                    event = "lock_acquired",
                    resource = %resource.display(),
                    holder = %self.holder,
                    attempts
                );
                return Ok(guard);
            }

            let elapsed = started.elapsed();
            if elapsed >= timeout {
                let waited_ms = elapsed.as_millis().min(u64::MAX as u128) as u64;
                warn!(
                    event = "lock_timeout",
                    resource = %resource.display(),
                    holder = %self.holder,
                    attempts,
                    waited_ms
                );
                return Err(CoordError::LockTimeout {
                    resource: resource.to_path_buf(),
                    waited_ms,
                });
            }

            thread::sleep(backoff.min(timeout - elapsed));
            backoff = (backoff * 2).min(self.config.max_backoff());
        }
    }

    /// Locks `resources` in the order given. On failure every lock taken so
    /// far is released.
    pub fn acquire_all(&self, resources: &[&Path]) -> Result<Vec<LockGuard>, CoordError> {
        let mut guards = Vec::with_capacity(resources.len());
        for resource in resources {
            guards.push(self.acquire(resource)?);
        }
        Ok(guards)
    }

    fn create_marker(&self, lock_path: &Path) -> Result<Option<LockGuard>, CoordError> {
        let mut file = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(lock_path)
        {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::AlreadyExists => return Ok(None),
            Err(source) => {
                return Err(CoordError::LockIo {
                    path: lock_path.to_path_buf(),
                    source,
                })
            }
        };

        let payload = LockPayload {
            pid: std::process::id(),
            holder: self.holder.clone(),
            acquired_at: Utc::now(),
            token: Uuid::new_v4().simple().to_string(),
        };
        let guard = LockGuard {
            path: lock_path.to_path_buf(),
            token: payload.token.clone(),
            stale_after: self.config.stale_after(),
            released: false,
        };
        let body = serde_json::to_vec(&payload).unwrap_or_default();
        file.write_all(&body)
            .and_then(|_| file.sync_all())
            .map_err(|source| CoordError::LockIo {
                path: lock_path.to_path_buf(),
                source,
            })?;
        Ok(Some(guard))
    }

    /// Removes the marker when it is stale. The age is judged again under
    /// the reclaim gate, so a marker another reclaimer just replaced is left
    /// alone.
    fn reclaim_if_stale(&self, lock_path: &Path) -> Result<bool, CoordError> {
        let stale_after = self.config.stale_after();
        let Some(age) = lock_age(lock_path, Utc::now())? else {
            // Released between our attempt and the check.
            return Ok(true);
        };
        if age <= stale_after {
            return Ok(false);
        }

        let Some(_gate) = ReclaimGate::acquire(lock_path, stale_after)? else {
            return Ok(false);
        };
        let Some(age) = lock_age(lock_path, Utc::now())? else {
            return Ok(true);
        };
        if age <= stale_after {
            return Ok(false);
        }
        warn!(
            event = "lock_stale_reclaimed",
            lock = %lock_path.display(),
            age_ms = age.num_milliseconds(),
            holder = %self.holder
        );
        release(lock_path)?;
        Ok(true)
    }
}
