//! In-process distributed mutex for the standalone/test deployment
//! profile — a single replica, so "distributed" collapses to a regular
//! per-key async mutex with the same lock/release contract as the
//! networked backends.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{DistributedMutex, LockToken, MutexError, Result};

/// A process-local map of `tokio::sync::Mutex` guards, one per saga UID.
pub struct LocalMutex {
    holder: String,
    locks: std::sync::Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    held: std::sync::Mutex<HashMap<String, OwnedMutexGuard<()>>>,
}

impl LocalMutex {
    pub fn new(holder: impl Into<String>) -> Self {
        Self {
            holder: holder.into(),
            locks: std::sync::Mutex::new(HashMap::new()),
            held: std::sync::Mutex::new(HashMap::new()),
        }
    }

    fn entry(&self, saga_uid: &str) -> Arc<AsyncMutex<()>> {
        self.locks
            .lock()
            .unwrap()
            .entry(saga_uid.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }
}

impl Default for LocalMutex {
    fn default() -> Self {
        Self::new("local")
    }
}

#[async_trait]
impl DistributedMutex for LocalMutex {
    async fn lock(
        &self,
        saga_uid: &str,
        _ttl: Duration,
        cancel: CancellationToken,
    ) -> Result<LockToken> {
        let mutex = self.entry(saga_uid);
        let guard = tokio::select! {
            guard = mutex.lock_owned() => guard,
            _ = cancel.cancelled() => return Err(MutexError::Cancelled(saga_uid.to_string())),
        };

        let token = LockToken {
            saga_uid: saga_uid.to_string(),
            holder: self.holder.clone(),
            token: Uuid::new_v4().to_string(),
        };
        self.held
            .lock()
            .unwrap()
            .insert(token.token.clone(), guard);
        Ok(token)
    }

    async fn release(&self, token: &LockToken) -> Result<()> {
        self.held.lock().unwrap().remove(&token.token);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_lock_waits_for_release() {
        let mutex = Arc::new(LocalMutex::new("test"));

        let first = mutex
            .lock("saga-1", Duration::from_secs(5), CancellationToken::new())
            .await
            .unwrap();

        let mutex2 = mutex.clone();
        let handle = tokio::spawn(async move {
            mutex2
                .lock("saga-1", Duration::from_secs(5), CancellationToken::new())
                .await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finished());

        mutex.release(&first).await.unwrap();
        let second = handle.await.unwrap().unwrap();
        assert_eq!(second.saga_uid, "saga-1");
    }

    #[tokio::test]
    async fn distinct_saga_uids_do_not_contend() {
        let mutex = LocalMutex::new("test");
        let a = mutex
            .lock("saga-a", Duration::from_secs(5), CancellationToken::new())
            .await
            .unwrap();
        let b = mutex
            .lock("saga-b", Duration::from_secs(5), CancellationToken::new())
            .await
            .unwrap();
        mutex.release(&a).await.unwrap();
        mutex.release(&b).await.unwrap();
    }

    #[tokio::test]
    async fn cancellation_unblocks_a_waiting_lock() {
        let mutex = Arc::new(LocalMutex::new("test"));
        let _first = mutex
            .lock("saga-1", Duration::from_secs(5), CancellationToken::new())
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let mutex2 = mutex.clone();
        let cancel2 = cancel.clone();
        let handle = tokio::spawn(async move { mutex2.lock("saga-1", Duration::from_secs(5), cancel2).await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();
        let result = handle.await.unwrap();
        assert!(matches!(result, Err(MutexError::Cancelled(_))));
    }
}
