//! Shared, reloadable configuration cell.
//!
//! `ConfigStore<T>` hands the same live value to every component that holds a
//! clone; the server's SIGHUP handler swaps in a re-parsed value and running
//! components observe the change through a [`ConfigWatcher`] or simply read
//! the current value on next use (the authorization policy does the latter
//! for the admin roster).

use std::sync::Arc;
use tokio::sync::{RwLock, RwLockReadGuard, watch};

/// A shared configuration value with change notification.
pub struct ConfigStore<T> {
    inner: Arc<ConfigStoreInner<T>>,
}

struct ConfigStoreInner<T> {
    data: RwLock<T>,
    version_tx: watch::Sender<u64>,
}

/// Wakes when the associated [`ConfigStore`] is updated.
pub struct ConfigWatcher {
    version_rx: watch::Receiver<u64>,
}

impl<T> ConfigStore<T> {
    pub fn new(initial: T) -> Self {
        let (version_tx, _) = watch::channel(0u64);
        Self {
            inner: Arc::new(ConfigStoreInner {
                data: RwLock::new(initial),
                version_tx,
            }),
        }
    }

    /// Replace the stored value and notify all watchers.
    pub async fn update(&self, value: T) {
        let mut guard = self.inner.data.write().await;
        *guard = value;
        // Release the write lock before waking watchers so they can read
        // immediately.
        drop(guard);
        self.inner.version_tx.send_modify(|v| *v += 1);
    }

    /// Read the current value.
    pub async fn read(&self) -> RwLockReadGuard<'_, T> {
        self.inner.data.read().await
    }

    pub fn subscribe(&self) -> ConfigWatcher {
        ConfigWatcher {
            version_rx: self.inner.version_tx.subscribe(),
        }
    }
}

impl<T> Clone for ConfigStore<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl ConfigWatcher {
    /// Wait until the store is updated. `Err` means the store was dropped.
    pub async fn changed(&mut self) -> Result<(), watch::error::RecvError> {
        self.version_rx.changed().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AdminConfig;
    use crate::entities::UserId;

    #[tokio::test]
    async fn reload_is_visible_to_existing_clones() {
        let store = ConfigStore::new(AdminConfig::new(vec![1], vec![], String::new()));
        let policy_handle = store.clone();
        let mut watcher = store.subscribe();

        assert!(policy_handle.read().await.is_admin(UserId(1), None));
        assert!(!policy_handle.read().await.is_admin(UserId(2), None));

        store
            .update(AdminConfig::new(vec![1, 2], vec![], String::new()))
            .await;

        watcher.changed().await.unwrap();
        assert!(policy_handle.read().await.is_admin(UserId(2), None));
    }
}
