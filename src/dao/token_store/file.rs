use std::{
    io::ErrorKind,
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use futures::future::BoxFuture;
use tokio::{
    fs,
    sync::{Mutex, broadcast},
    task::JoinHandle,
    time::sleep,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{StorageChange, StorageEvent, TokenStore, change_feed};
use crate::dao::storage::{StorageError, StorageResult};

/// Token store persisting the access token to a single file.
#[derive(Clone)]
pub struct FileTokenStore {
    path: Arc<PathBuf>,
    // Last state this process wrote or observed, so the watcher only reports foreign changes.
    present: Arc<AtomicBool>,
    // Held across every file write and every watcher check-and-swap of `present`.
    io_lock: Arc<Mutex<()>>,
    changes: broadcast::Sender<StorageEvent>,
}

impl FileTokenStore {
    /// Store backed by `path`. The file is created on first save.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let present = path.exists();
        Self {
            path: Arc::new(path),
            present: Arc::new(AtomicBool::new(present)),
            io_lock: Arc::new(Mutex::new(())),
            changes: change_feed(),
        }
    }

    /// Poll the file and broadcast changes made by other processes (e.g. a logout elsewhere).
    pub fn spawn_watcher(&self, interval: Duration) -> JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            loop {
                sleep(interval).await;
                let _guard = store.io_lock.lock().await;
                let exists = match fs::try_exists(store.path.as_ref()).await {
                    Ok(exists) => exists,
                    Err(err) => {
                        warn!(path = %store.path.display(), error = %err, "token file check failed");
                        continue;
                    }
                };
                let known = store.present.swap(exists, Ordering::SeqCst);
                if known == exists {
                    continue;
                }
                let change = if exists {
                    StorageChange::Saved
                } else {
                    info!(path = %store.path.display(), "token file removed externally");
                    StorageChange::Removed
                };
                let _ = store.changes.send(StorageEvent {
                    origin: Uuid::nil(),
                    change,
                });
            }
        })
    }
}

impl TokenStore for FileTokenStore {
    fn load(&self) -> BoxFuture<'static, StorageResult<Option<String>>> {
        let path = self.path.clone();
        Box::pin(async move {
            match fs::read_to_string(path.as_ref()).await {
                Ok(contents) => {
                    let token = contents.trim();
                    Ok((!token.is_empty()).then(|| token.to_owned()))
                }
                Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
                Err(source) => Err(StorageError::Read {
                    path: path.to_path_buf(),
                    source,
                }),
            }
        })
    }

    fn save(&self, token: String, origin: Uuid) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move {
            let path = store.path.as_ref();
            let _guard = store.io_lock.lock().await;
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)
                    .await
                    .map_err(|source| StorageError::Write {
                        path: path.to_path_buf(),
                        source,
                    })?;
            }
            fs::write(path, token)
                .await
                .map_err(|source| StorageError::Write {
                    path: path.to_path_buf(),
                    source,
                })?;
            store.present.store(true, Ordering::SeqCst);
            debug!(path = %path.display(), "token persisted");
            let _ = store.changes.send(StorageEvent {
                origin,
                change: StorageChange::Saved,
            });
            Ok(())
        })
    }

    fn remove(&self, origin: Uuid) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move {
            let path = store.path.as_ref();
            let _guard = store.io_lock.lock().await;
            match fs::remove_file(path).await {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::NotFound => {
                    store.present.store(false, Ordering::SeqCst);
                    return Ok(());
                }
                Err(source) => {
                    return Err(StorageError::Write {
                        path: path.to_path_buf(),
                        source,
                    });
                }
            }
            store.present.store(false, Ordering::SeqCst);
            let _ = store.changes.send(StorageEvent {
                origin,
                change: StorageChange::Removed,
            });
            Ok(())
        })
    }

    fn subscribe(&self) -> broadcast::Receiver<StorageEvent> {
        self.changes.subscribe()
    }
}
