//! Redis-backed coordination: the per-conversation exclusivity lock, the
//! cancellation flag, and small caches.
//!
//! Keys:
//! - `chat_lock:{conversation_id}` - best-effort mutex, 30 s expiry
//! - `messages:{map_id}:cancelled` - cooperative cancellation, 5 min expiry
//! - `postgis:{connection_id}:tables` - cached table listing, 1 h expiry

use anyhow::Context as _;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

pub const CHAT_LOCK_EXPIRY_SECS: u64 = 30;
pub const CANCEL_FLAG_EXPIRY_SECS: u64 = 300;
pub const TABLES_CACHE_EXPIRY_SECS: u64 = 3600;

#[derive(Clone)]
pub struct RedisHandles {
    conn: ConnectionManager,
}

impl RedisHandles {
    pub async fn from_env() -> anyhow::Result<Self> {
        let host = std::env::var("REDIS_HOST").context("REDIS_HOST is not set")?;
        let port = std::env::var("REDIS_PORT").unwrap_or_else(|_| "6379".to_string());
        let client = redis::Client::open(format!("redis://{host}:{port}"))?;
        let conn = client.get_connection_manager().await?;
        Ok(Self { conn })
    }

    /// Best-effort "SET if absent" on the conversation lock. Returns whether
    /// this caller acquired it. The expiry bounds liveness: a crashed task
    /// unblocks the conversation within 30 seconds.
    pub async fn try_lock_conversation(&self, conversation_id: i32) -> anyhow::Result<bool> {
        let mut conn = self.conn.clone();
        let acquired: Option<String> = redis::cmd("SET")
            .arg(format!("chat_lock:{conversation_id}"))
            .arg("locked")
            .arg("NX")
            .arg("EX")
            .arg(CHAT_LOCK_EXPIRY_SECS)
            .query_async(&mut conn)
            .await?;
        Ok(acquired.is_some())
    }

    pub async fn unlock_conversation(&self, conversation_id: i32) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(format!("chat_lock:{conversation_id}"))
            .await?;
        Ok(())
    }

    pub async fn set_cancelled(&self, map_id: &str) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(
            format!("messages:{map_id}:cancelled"),
            "true",
            CANCEL_FLAG_EXPIRY_SECS,
        )
        .await?;
        Ok(())
    }

    /// Consumes the cancellation flag: returns true (and deletes it) if set.
    pub async fn take_cancelled(&self, map_id: &str) -> anyhow::Result<bool> {
        let mut conn = self.conn.clone();
        let key = format!("messages:{map_id}:cancelled");
        let value: Option<String> = conn.get(&key).await?;
        if value.is_some() {
            conn.del::<_, ()>(&key).await?;
            return Ok(true);
        }
        Ok(false)
    }

    pub async fn cached_tables(&self, connection_id: &str) -> anyhow::Result<Option<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.get(format!("postgis:{connection_id}:tables")).await?)
    }

    pub async fn cache_tables(&self, connection_id: &str, listing: &str) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(
            format!("postgis:{connection_id}:tables"),
            listing,
            TABLES_CACHE_EXPIRY_SECS,
        )
        .await?;
        Ok(())
    }
}
