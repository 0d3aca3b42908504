//! Redis-backed shared store.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use super::SharedStore;
use crate::error::StoreUnavailable;

/// Conditional write. ARGV: has_expected ("1"/"0"), expected, new, ttl_ms.
const CAS_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if ARGV[1] == '1' then
  if current ~= ARGV[2] then
    return 0
  end
elseif current then
  return 0
end
redis.call('SET', KEYS[1], ARGV[3], 'PX', ARGV[4])
return 1
"#;

/// A [`SharedStore`] backed by Redis.
///
/// The connection is established on first use, so an unreachable Redis at
/// startup degrades like any other store outage instead of aborting.
pub struct RedisStore {
    client: Client,
    connection: OnceCell<ConnectionManager>,
    cas: Script,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("addr", &self.client.get_connection_info().addr.to_string())
            .field("connected", &self.connection.initialized())
            .finish()
    }
}

impl RedisStore {
    /// Create a store for the given `redis://` URL without connecting.
    pub fn open(url: &str) -> Result<Self, StoreUnavailable> {
        let client = Client::open(url)?;
        info!(
            addr = %client.get_connection_info().addr,
            "Configured Redis bucket store"
        );
        Ok(Self {
            client,
            connection: OnceCell::new(),
            cas: Script::new(CAS_SCRIPT),
        })
    }

    async fn connection(&self) -> Result<ConnectionManager, StoreUnavailable> {
        let conn = self
            .connection
            .get_or_try_init(|| async {
                debug!("Connecting to Redis");
                ConnectionManager::new(self.client.clone()).await
            })
            .await?;
        Ok(conn.clone())
    }
}

/// Longest expiry written to Redis: one hundred years.
const MAX_PX_MILLIS: i64 = 100 * 365 * 24 * 60 * 60 * 1000;

/// TTL as a `PX` argument. Redis rejects expiries that overflow when added to
/// the current time, so the value is clamped well below `i64::MAX`.
fn px_millis(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_millis())
        .unwrap_or(MAX_PX_MILLIS)
        .clamp(1, MAX_PX_MILLIS)
}

#[async_trait]
impl SharedStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreUnavailable> {
        let mut conn = self.connection().await?;
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
        ttl: Duration,
    ) -> Result<bool, StoreUnavailable> {
        let mut conn = self.connection().await?;
        let ttl_ms = px_millis(ttl);

        let swapped: i64 = self
            .cas
            .key(key)
            .arg(if expected.is_some() { "1" } else { "0" })
            .arg(expected.unwrap_or(""))
            .arg(new)
            .arg(ttl_ms)
            .invoke_async(&mut conn)
            .await?;

        Ok(swapped == 1)
    }

    async fn ping(&self) -> Result<(), StoreUnavailable> {
        let mut conn = self.connection().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}
