//! Redis-backed distributed mutex.
//!
//! `SET key token NX PX ttl` acquires; a Lua script does the
//! compare-and-delete on release so a replica can never release a lock
//! it doesn't hold (e.g. after its own TTL expired and another replica
//! took over).

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, Script};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{DistributedMutex, LockToken, MutexError, Result};
use crate::retry::RetryPolicy;

const RELEASE_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("del", KEYS[1])
else
    return 0
end
"#;

/// Redis-backed [`DistributedMutex`].
pub struct RedisMutex {
    conn: ConnectionManager,
    holder: String,
    key_prefix: String,
    retry: RetryPolicy,
}

impl RedisMutex {
    pub async fn new(url: &str, holder: impl Into<String>) -> Result<Self> {
        let client = Client::open(url).map_err(|e| MutexError::Backend(e.to_string()))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| MutexError::Backend(e.to_string()))?;

        Ok(Self {
            conn,
            holder: holder.into(),
            key_prefix: "saga-engine:mutex".to_string(),
            retry: RetryPolicy::for_mutex(),
        })
    }

    fn key(&self, saga_uid: &str) -> String {
        format!("{}:{}", self.key_prefix, saga_uid)
    }
}

#[async_trait]
impl DistributedMutex for RedisMutex {
    async fn lock(
        &self,
        saga_uid: &str,
        ttl: Duration,
        cancel: CancellationToken,
    ) -> Result<LockToken> {
        let key = self.key(saga_uid);
        let token = Uuid::new_v4().to_string();
        let ttl_ms = ttl.as_millis() as usize;

        let attempt = {
            let mut conn = self.conn.clone();
            let key = key.clone();
            let token = token.clone();
            move || {
                let mut conn = conn.clone();
                let key = key.clone();
                let token = token.clone();
                async move {
                    let reply: Option<String> = redis::cmd("SET")
                        .arg(&key)
                        .arg(&token)
                        .arg("NX")
                        .arg("PX")
                        .arg(ttl_ms)
                        .query_async(&mut conn)
                        .await
                        .map_err(|e| MutexError::Backend(e.to_string()))?;

                    if reply.is_some() {
                        Ok(())
                    } else {
                        Err(MutexError::LockContended(key.clone()))
                    }
                }
            }
        };

        let result = tokio::select! {
            result = self.retry.retry(attempt, |e| matches!(e, MutexError::LockContended(_))) => result,
            _ = cancel.cancelled() => return Err(MutexError::Cancelled(saga_uid.to_string())),
        };

        result?;
        debug!(saga_uid, holder = %self.holder, "acquired distributed lock");
        Ok(LockToken {
            saga_uid: saga_uid.to_string(),
            holder: self.holder.clone(),
            token,
        })
    }

    async fn release(&self, token: &LockToken) -> Result<()> {
        let key = self.key(&token.saga_uid);
        let mut conn = self.conn.clone();
        let script = Script::new(RELEASE_SCRIPT);
        let deleted: i32 = script
            .key(&key)
            .arg(&token.token)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| MutexError::Backend(e.to_string()))?;

        if deleted == 0 {
            warn!(saga_uid = %token.saga_uid, "release found no matching lock (already expired or stolen)");
        }
        Ok(())
    }
}
