//! JSON state file used by the `cgov` binary between invocations.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::deployment::{Deployment, DeploymentSnapshot};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("state file {0} not found; run `cgov init` first")]
    Missing(PathBuf),
    #[error("state file {0} already exists")]
    AlreadyExists(PathBuf),
    #[error("failed to access state file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode or decode state file {path}: {source}")]
    Codec {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("inconsistent state: {0}")]
    Corrupt(String),
}

pub fn load(path: &Path) -> Result<Deployment, StoreError> {
    if !path.exists() {
        return Err(StoreError::Missing(path.to_path_buf()));
    }
    let raw = fs::read(path).map_err(|source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let snapshot: DeploymentSnapshot =
        serde_json::from_slice(&raw).map_err(|source| StoreError::Codec {
            path: path.to_path_buf(),
            source,
        })?;
    debug!(path = %path.display(), projects = snapshot.registry.projects.len(), "state loaded");
    Deployment::restore(snapshot)
}

/// Write the deployment's snapshot, replacing the file atomically.
pub fn save(path: &Path, deployment: &Deployment) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec_pretty(&deployment.snapshot()).map_err(|source| {
        StoreError::Codec {
            path: path.to_path_buf(),
            source,
        }
    })?;
    let io_err = |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(io_err)?;
    }
    let tmp = path.with_extension("json.tmp");
    let mut file = fs::File::create(&tmp).map_err(io_err)?;
    file.write_all(&bytes).map_err(io_err)?;
    file.sync_all().map_err(io_err)?;
    fs::rename(&tmp, path).map_err(io_err)?;
    debug!(path = %path.display(), bytes = bytes.len(), "state saved");
    Ok(())
}

/// Sidecar file guarding read-modify-write cycles on `path`.
pub fn lock_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".lock");
    PathBuf::from(name)
}

/// Run `f` while holding an exclusive advisory lock on `<path>.lock`.
///
/// Every load, mutate and save cycle on a state file must run inside this,
/// otherwise concurrent processes overwrite each other's updates.
pub fn locked<T>(path: &Path, f: impl FnOnce() -> T) -> Result<T, StoreError> {
    let sidecar = lock_path(path);
    let io_err = |source| StoreError::Io {
        path: sidecar.clone(),
        source,
    };
    if let Some(parent) = sidecar.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(io_err)?;
    }
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(&sidecar)
        .map_err(io_err)?;
    let mut lock = fd_lock::RwLock::new(file);
    let _guard = lock.write().map_err(io_err)?;
    debug!(lock = %sidecar.display(), "state lock acquired");
    Ok(f())
}

/// Like [`save`], but refuses to overwrite an existing state file.
pub fn create(path: &Path, deployment: &Deployment) -> Result<(), StoreError> {
    if path.exists() {
        return Err(StoreError::AlreadyExists(path.to_path_buf()));
    }
    save(path, deployment)
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::auth::Identity;
    use crate::config::GovernanceConfig;

    #[test]
    fn state_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");
        let admin = Identity::generate();
        let deployment = Deployment::new(&admin.caller(), GovernanceConfig::default());
        deployment
            .submit_project(&admin.caller(), "Project 1", "Details 1")
            .unwrap();
        deployment
            .mint(&admin.caller(), &admin.account_id(), 100)
            .unwrap();

        create(&path, &deployment).unwrap();
        assert!(matches!(
            create(&path, &deployment),
            Err(StoreError::AlreadyExists(_))
        ));

        let loaded = load(&path).unwrap();
        assert_eq!(loaded.snapshot(), deployment.snapshot());
        assert_eq!(loaded.balance_of(&admin.account_id()), 100);
    }

    #[test]
    fn locked_cycles_do_not_lose_votes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let admin = Identity::generate();
        let voters: Vec<Identity> = (0..8).map(|_| Identity::generate()).collect();
        let deployment = Deployment::new(&admin.caller(), GovernanceConfig::default());
        deployment.submit_project(&admin.caller(), "Alpha", "").unwrap();
        for voter in &voters {
            deployment.mint(&admin.caller(), &voter.account_id(), 1).unwrap();
        }
        create(&path, &deployment).unwrap();

        std::thread::scope(|scope| {
            for voter in &voters {
                let path = &path;
                scope.spawn(move || {
                    locked(path, || {
                        let copy = load(path).unwrap();
                        copy.vote_for_project(&voter.caller(), 1).unwrap();
                        std::thread::sleep(std::time::Duration::from_millis(5));
                        save(path, &copy).unwrap();
                    })
                    .unwrap();
                });
            }
        });

        let merged = load(&path).unwrap();
        assert_eq!(merged.tally(1).unwrap(), voters.len() as u64);
        for voter in &voters {
            assert!(merged.has_voted(1, &voter.account_id()));
        }
        assert!(lock_path(&path).ends_with("state.json.lock"));
    }

    #[test]
    fn lock_is_released_after_each_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");
        assert_eq!(locked(&path, || 1).unwrap(), 1);
        assert_eq!(locked(&path, || 2).unwrap(), 2);
        assert!(lock_path(&path).exists());
        assert!(!path.exists());
    }

    #[test]
    fn missing_and_garbled_files_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        assert!(matches!(load(&path), Err(StoreError::Missing(_))));

        fs::write(&path, b"{ not json").unwrap();
        assert!(matches!(load(&path), Err(StoreError::Codec { .. })));
    }
}
