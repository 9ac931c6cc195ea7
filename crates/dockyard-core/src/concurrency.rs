use crate::CoreError;
use dockyard_runtime::CancelToken;
use dockyard_schema::EnvKey;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::info;

/// Exclusive advisory lock serializing mutating commands for one environment.
pub struct EnvLock {
    lock_file: File,
    path: PathBuf,
}

impl EnvLock {
    pub fn path_for(state_dir: &Path, env_key: &EnvKey) -> PathBuf {
        state_dir.join("locks").join(format!("{env_key}.lock"))
    }

    /// Take the lock for `env_key`, waiting for another invocation to finish.
    pub fn acquire(state_dir: &Path, env_key: &EnvKey) -> Result<Self, CoreError> {
        let path = Self::path_for(state_dir, env_key);
        if let Some(lock) = Self::try_acquire_at(&path)? {
            return Ok(lock);
        }
        info!("waiting for another dockyard command on this workspace to finish");
        let file = open_lock_file(&path)?;
        file.lock_exclusive()
            .map_err(|e| CoreError::Lock(format!("{}: {e}", path.display())))?;
        Ok(Self {
            lock_file: file,
            path,
        })
    }

    pub fn try_acquire(state_dir: &Path, env_key: &EnvKey) -> Result<Option<Self>, CoreError> {
        Self::try_acquire_at(&Self::path_for(state_dir, env_key))
    }

    fn try_acquire_at(path: &Path) -> Result<Option<Self>, CoreError> {
        let file = open_lock_file(path)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(Self {
                lock_file: file,
                path: path.to_path_buf(),
            })),
            Err(_) => Ok(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn open_lock_file(path: &Path) -> Result<File, CoreError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(path)?)
}

impl Drop for EnvLock {
    fn drop(&mut self) {
        let _ = self.lock_file.unlock();
    }
}

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Route Ctrl-C to `cancel`. A second Ctrl-C exits immediately.
pub fn install_signal_handler(cancel: &CancelToken) {
    let cancel = cancel.clone();
    let _ = ctrlc::set_handler(move || {
        if INTERRUPTED.swap(true, Ordering::SeqCst) {
            std::process::exit(130);
        }
        cancel.cancel();
        eprintln!("\ninterrupt received, stopping running commands...");
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> EnvKey {
        EnvKey::new("0123456789abcdef")
    }

    #[test]
    fn lock_acquire_and_release() {
        let dir = tempfile::tempdir().unwrap();
        {
            let lock = EnvLock::acquire(dir.path(), &key()).unwrap();
            assert!(lock.path().exists());
            assert!(lock.path().ends_with("locks/0123456789abcdef.lock"));
        }
    }

    #[test]
    fn try_acquire_returns_none_when_held() {
        let dir = tempfile::tempdir().unwrap();
        let _lock = EnvLock::acquire(dir.path(), &key()).unwrap();
        assert!(EnvLock::try_acquire(dir.path(), &key()).unwrap().is_none());
    }

    #[test]
    fn other_environments_are_independent() {
        let dir = tempfile::tempdir().unwrap();
        let _lock = EnvLock::acquire(dir.path(), &key()).unwrap();
        let other = EnvLock::try_acquire(dir.path(), &EnvKey::new("fedcba9876543210")).unwrap();
        assert!(other.is_some());
    }

    #[test]
    fn lock_released_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        {
            let _lock = EnvLock::acquire(dir.path(), &key()).unwrap();
        }
        assert!(EnvLock::try_acquire(dir.path(), &key()).unwrap().is_some());
    }
}
