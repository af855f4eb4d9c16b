//! facelog-store: production adapters for the reconciliation core.
//!
//! - Redis: coordination flags, the RediSearch HNSW vector index and the
//!   reliable work queue.
//! - SQLite: enrolled face vectors and the transaction log.

pub mod redis_flags;
pub mod redis_index;
pub mod redis_queue;
pub mod sqlite;

pub use redis_flags::RedisFlagStore;
pub use redis_index::{RedisVectorIndex, DEFAULT_INDEX_NAME, KEY_PREFIX};
pub use redis_queue::{processing_list, RedisQueue, DEFAULT_QUEUE};
pub use sqlite::{DbError, FaceVectorRecord, SqliteStore};

pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379/0";

/// Open a multiplexed async connection.
pub async fn connect(url: &str) -> redis::RedisResult<redis::aio::MultiplexedConnection> {
    let client = redis::Client::open(url)?;
    client.get_multiplexed_async_connection().await
}
