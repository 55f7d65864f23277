//! Optional external cache (redis) client.
//!
//! The daemon must run fine with the cache disabled or unreachable:
//! every operation here returns a `PoolError::Cache` that callers log
//! at warning level and otherwise ignore. A failed operation drops the
//! stored connection so the next one reconnects.

use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use sockpool_common::{PoolError, PoolResult};
use sockpool_config::RedisConfig;

pub struct CacheClient {
    url: String,
    connection: RwLock<Option<MultiplexedConnection>>,
}

impl CacheClient {
    pub fn new(config: &RedisConfig) -> Self {
        Self {
            url: config.url(),
            connection: RwLock::new(None),
        }
    }

    /// Establish the connection and verify it with a PING.
    pub async fn connect(&self) -> PoolResult<()> {
        let client = redis::Client::open(self.url.as_str()).map_err(cache_err)?;
        let mut connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(cache_err)?;
        let _: String = redis::cmd("PING")
            .query_async(&mut connection)
            .await
            .map_err(cache_err)?;
        *self.connection.write().await = Some(connection);
        info!("Connected to external cache");
        Ok(())
    }

    /// Reachability probe used by health checks.
    pub async fn ping(&self) -> PoolResult<()> {
        let mut connection = self.handle().await?;
        let result: Result<String, _> = redis::cmd("PING").query_async(&mut connection).await;
        match result {
            Ok(_) => Ok(()),
            Err(e) => {
                self.drop_connection().await;
                Err(cache_err(e))
            }
        }
    }

    /// Store a keyed snapshot with a TTL.
    pub async fn set_with_ttl(&self, key: &str, value: &str, ttl_seconds: u64) -> PoolResult<()> {
        let mut connection = self.handle().await?;
        let result: Result<(), _> = connection.set_ex(key, value, ttl_seconds).await;
        match result {
            Ok(()) => Ok(()),
            Err(e) => {
                self.drop_connection().await;
                Err(cache_err(e))
            }
        }
    }

    /// Push onto a list and trim it to the most recent `cap` entries.
    pub async fn push_trimmed(&self, key: &str, value: &str, cap: usize) -> PoolResult<()> {
        let mut connection = self.handle().await?;
        let result: Result<(), redis::RedisError> = async {
            let _: () = connection.lpush(key, value).await?;
            let _: () = connection.ltrim(key, 0, cap.saturating_sub(1) as isize).await?;
            Ok(())
        }
        .await;
        match result {
            Ok(()) => Ok(()),
            Err(e) => {
                self.drop_connection().await;
                Err(cache_err(e))
            }
        }
    }

    async fn handle(&self) -> PoolResult<MultiplexedConnection> {
        if let Some(connection) = self.connection.read().await.as_ref() {
            return Ok(connection.clone());
        }
        debug!("No cache connection, reconnecting");
        self.connect().await?;
        self.connection
            .read()
            .await
            .as_ref()
            .cloned()
            .ok_or_else(|| PoolError::Cache {
                message: "connection unavailable after reconnect".to_string(),
            })
    }

    async fn drop_connection(&self) {
        warn!("External cache operation failed, dropping connection");
        *self.connection.write().await = None;
    }
}

fn cache_err(e: redis::RedisError) -> PoolError {
    PoolError::Cache {
        message: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unreachable_cache_reports_cache_error() {
        let config = RedisConfig {
            enabled: true,
            host: "127.0.0.1".to_string(),
            // Nothing listens here.
            port: 1,
            ..RedisConfig::default()
        };
        let cache = CacheClient::new(&config);
        let err = cache.ping().await.unwrap_err();
        assert_eq!(err.wire_code(), "internal");
        assert!(matches!(err, PoolError::Cache { .. }));
    }
}
