use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::ApiError;

/// Scratch directory for in-flight downloads. Paths are unique per process,
/// and a periodic sweep reclaims anything a crashed request left behind.
#[derive(Clone)]
pub struct TempStore {
    dir: PathBuf,
    max_age: Duration,
}

impl TempStore {
    pub async fn init(dir: PathBuf, max_age: Duration) -> Result<Self, ApiError> {
        tokio::fs::create_dir_all(&dir).await.map_err(|error| {
            ApiError::internal(format!("Could not create temp directory: {error}"))
        })?;
        Ok(Self { dir, max_age })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Millisecond timestamp plus a random suffix: no collision across
    /// concurrent requests.
    pub fn allocate(&self) -> PathBuf {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        self.dir
            .join(format!("{millis}-{}.mp3", Uuid::new_v4().simple()))
    }

    /// Best-effort removal for files the pipeline is done with. Missing files
    /// are fine; anything else is logged and left for the sweep.
    pub async fn remove(&self, path: &Path) {
        if let Err(error) = tokio::fs::remove_file(path).await
            && error.kind() != ErrorKind::NotFound
        {
            warn!("Could not remove temp file {:?}: {error}", path);
        }
    }

    pub async fn sweep(&self) {
        self.sweep_at(SystemTime::now()).await;
    }

    /// Deletes every regular file older than the age threshold. Per-entry
    /// failures are logged and the sweep moves on.
    pub async fn sweep_at(&self, now: SystemTime) {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(error) => {
                if error.kind() != ErrorKind::NotFound {
                    warn!("Could not open temp directory for sweep: {error}");
                }
                return;
            }
        };

        loop {
            let maybe_entry = match entries.next_entry().await {
                Ok(value) => value,
                Err(error) => {
                    warn!("Could not iterate temp directory: {error}");
                    break;
                }
            };

            let Some(entry) = maybe_entry else {
                break;
            };

            let path = entry.path();
            let metadata = match entry.metadata().await {
                Ok(metadata) => metadata,
                Err(error) => {
                    warn!("Could not read metadata of {:?}: {error}", path);
                    continue;
                }
            };

            if !metadata.is_file() {
                continue;
            }

            let modified_at = match metadata.modified() {
                Ok(value) => value,
                Err(error) => {
                    warn!("Could not read modification time of {:?}: {error}", path);
                    continue;
                }
            };

            let age = now
                .duration_since(modified_at)
                .unwrap_or(Duration::from_secs(0));
            if age < self.max_age {
                continue;
            }

            match tokio::fs::remove_file(&path).await {
                Ok(()) => debug!("Swept stale temp file {:?}", path),
                Err(error) if error.kind() == ErrorKind::NotFound => {}
                Err(error) => warn!("Could not delete stale temp file {:?}: {error}", path),
            }
        }
    }
}

/// Single background task owning the sweep for the process lifetime. The
/// first interval tick fires immediately, so a sweep also runs at startup.
pub fn spawn_sweeper(store: TempStore, period: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            store.sweep().await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    async fn store_with_max_age(max_age: Duration) -> TempStore {
        let dir = std::env::temp_dir().join(format!("mp3tube-test-{}", Uuid::new_v4().simple()));
        TempStore::init(dir, max_age).await.unwrap()
    }

    #[tokio::test]
    async fn allocated_paths_are_unique() {
        let store = store_with_max_age(Duration::from_secs(1800)).await;
        let paths: HashSet<_> = (0..100).map(|_| store.allocate()).collect();
        assert_eq!(paths.len(), 100);
        for path in &paths {
            assert!(path.starts_with(store.dir()));
            assert_eq!(path.extension().and_then(|e| e.to_str()), Some("mp3"));
        }
    }

    #[tokio::test]
    async fn sweep_removes_old_files_and_keeps_fresh_ones() {
        let store = store_with_max_age(Duration::from_secs(30 * 60)).await;
        let path = store.allocate();
        tokio::fs::write(&path, b"mp3 bytes").await.unwrap();

        // Younger than the threshold: survives.
        store.sweep_at(SystemTime::now() + Duration::from_secs(60)).await;
        assert!(tokio::fs::try_exists(&path).await.unwrap());

        // Older than the threshold: removed.
        store.sweep_at(SystemTime::now() + Duration::from_secs(31 * 60)).await;
        assert!(!tokio::fs::try_exists(&path).await.unwrap());
    }

    #[tokio::test]
    async fn sweep_skips_subdirectories() {
        let store = store_with_max_age(Duration::from_secs(0)).await;
        let subdir = store.dir().join("nested");
        tokio::fs::create_dir(&subdir).await.unwrap();

        store.sweep_at(SystemTime::now() + Duration::from_secs(3600)).await;
        assert!(tokio::fs::try_exists(&subdir).await.unwrap());
    }

    #[tokio::test]
    async fn sweep_of_missing_directory_is_quiet() {
        let store = TempStore {
            dir: std::env::temp_dir().join("mp3tube-test-does-not-exist"),
            max_age: Duration::from_secs(0),
        };
        store.sweep().await;
    }

    #[tokio::test]
    async fn remove_tolerates_missing_file() {
        let store = store_with_max_age(Duration::from_secs(1800)).await;
        store.remove(&store.allocate()).await;
    }
}
