//! Redis-backed shared store.
//!
//! This module wraps a multiplexed Redis connection so bucket state and
//! leased locks can be shared by every process pointing at the same server.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tracing::{debug, info};

use super::SharedStore;
use crate::error::Result;

/// Compare-and-delete so a holder whose lease expired cannot free a lock
/// that has since been taken by someone else.
const UNLOCK_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("del", KEYS[1])
else
    return 0
end
"#;

/// Connection handle to a Redis (or wire-compatible) server.
///
/// The handle is cheap to share behind an `Arc`; its lifetime is independent
/// of any bucket using it. Open it once with [`RedisStore::open`] and close it
/// with [`RedisStore::close`] once every limiter using it is gone.
#[derive(Clone)]
pub struct RedisStore {
    /// Connection URL (kept for logging)
    url: String,
    connection: ConnectionManager,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore").field("url", &self.url).finish()
    }
}

impl RedisStore {
    /// Connect to the server at `url` and verify it answers.
    pub async fn open(url: &str) -> Result<Self> {
        info!(url = %url, "Connecting to shared store");

        let client = redis::Client::open(url)?;
        let connection = ConnectionManager::new(client).await?;

        let mut conn = connection.clone();
        redis::cmd("PING").query_async::<String>(&mut conn).await?;

        info!(url = %url, "Shared store connected");

        Ok(Self {
            url: url.to_string(),
            connection,
        })
    }

    /// The URL this store was opened with.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Close the connection.
    ///
    /// Clones of this handle keep their own reference to the multiplexed
    /// connection; it is torn down once the last one is dropped.
    pub async fn close(self) -> Result<()> {
        info!(url = %self.url, "Closing shared store connection");
        drop(self.connection);
        Ok(())
    }
}

#[async_trait]
impl SharedStore for RedisStore {
    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<String>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.connection.clone();
        let values = redis::cmd("MGET")
            .arg(keys)
            .query_async::<Vec<Option<String>>>(&mut conn)
            .await?;
        Ok(values)
    }

    async fn set_many(&self, entries: &[(String, String)]) -> Result<()> {
        let mut conn = self.connection.clone();
        let mut pipe = redis::pipe();
        pipe.atomic();
        for (key, value) in entries {
            pipe.set(key, value).ignore();
        }
        pipe.query_async::<()>(&mut conn).await?;
        debug!(writes = entries.len(), "Committed store batch");
        Ok(())
    }

    async fn try_lock(&self, name: &str, token: &str, lease: Duration) -> Result<bool> {
        let mut conn = self.connection.clone();
        let reply = redis::cmd("SET")
            .arg(name)
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(lease.as_millis().max(1) as u64)
            .query_async::<Option<String>>(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn unlock(&self, name: &str, token: &str) -> Result<bool> {
        let mut conn = self.connection.clone();
        let deleted = redis::cmd("EVAL")
            .arg(UNLOCK_SCRIPT)
            .arg(1)
            .arg(name)
            .arg(token)
            .query_async::<i64>(&mut conn)
            .await?;
        Ok(deleted == 1)
    }
}
