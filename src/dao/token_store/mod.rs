//! Persistence of the access token and the typed change feed other sessions listen to.

mod file;
mod memory;

pub use file::FileTokenStore;
pub use memory::MemoryTokenStore;

use futures::future::BoxFuture;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::dao::storage::StorageResult;

/// Well-known key the access token is stored under.
pub const ACCESS_TOKEN_KEY: &str = "access_token";
/// Capacity of the change feed broadcast channel.
const CHANGE_FEED_CAPACITY: usize = 16;

/// What happened to the stored token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageChange {
    /// A token was written.
    Saved,
    /// The token was deleted.
    Removed,
}

/// Change notification delivered to every session sharing a store.
///
/// `origin` identifies the session that performed the write so it can ignore its own echo;
/// changes observed from outside the process carry [`Uuid::nil`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageEvent {
    /// Session that made the change, or nil when it came from outside the process.
    pub origin: Uuid,
    /// What changed.
    pub change: StorageChange,
}

impl StorageEvent {
    /// True when another session invalidated the token.
    pub fn is_removal_from_other(&self, me: Uuid) -> bool {
        self.change == StorageChange::Removed && self.origin != me
    }
}

/// Abstraction over where the access token is persisted.
pub trait TokenStore: Send + Sync {
    /// Read the stored token, if any.
    fn load(&self) -> BoxFuture<'static, StorageResult<Option<String>>>;
    /// Persist `token` and announce it on the change feed under `origin`.
    fn save(&self, token: String, origin: Uuid) -> BoxFuture<'static, StorageResult<()>>;
    /// Delete the token. Removing an absent token succeeds without an event.
    fn remove(&self, origin: Uuid) -> BoxFuture<'static, StorageResult<()>>;
    /// Receive every change made through any handle sharing this store.
    fn subscribe(&self) -> broadcast::Receiver<StorageEvent>;
}

fn change_feed() -> broadcast::Sender<StorageEvent> {
    let (sender, _receiver) = broadcast::channel(CHANGE_FEED_CAPACITY);
    sender
}
