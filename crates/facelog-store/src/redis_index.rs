//! RediSearch HNSW vector index over `face_vector:<id>` hashes.
//!
//! Each enrolled identity is one hash with two fields: `vector` (512 x
//! FLOAT32, little-endian) and `emp_id`. Queries use KNN with cosine
//! distance, so the reported score is already `1 - similarity`.

use async_trait::async_trait;
use facelog_core::{Embedding, IndexError, Neighbor, SimilarityIndex, EMBEDDING_DIM};
use redis::aio::MultiplexedConnection;

pub const DEFAULT_INDEX_NAME: &str = "face_vectors_idx";
pub const KEY_PREFIX: &str = "face_vector:";

const HNSW_M: u32 = 16;
const HNSW_EF_CONSTRUCTION: u32 = 200;
const HNSW_INITIAL_CAP: u32 = 2000;

fn unavailable(err: redis::RedisError) -> IndexError {
    IndexError::Unavailable(err.to_string())
}

#[derive(Clone)]
pub struct RedisVectorIndex {
    conn: MultiplexedConnection,
    index_name: String,
}

impl RedisVectorIndex {
    pub fn new(conn: MultiplexedConnection, index_name: impl Into<String>) -> Self {
        Self {
            conn,
            index_name: index_name.into(),
        }
    }

    /// Create the HNSW index unless it already exists.
    pub async fn ensure_index(&self) -> Result<(), IndexError> {
        let mut conn = self.conn.clone();
        let info: redis::RedisResult<redis::Value> = redis::cmd("FT.INFO")
            .arg(&self.index_name)
            .query_async(&mut conn)
            .await;
        if info.is_ok() {
            tracing::debug!(index = %self.index_name, "vector index present");
            return Ok(());
        }

        let created: redis::RedisResult<()> = redis::cmd("FT.CREATE")
            .arg(&self.index_name)
            .arg("ON")
            .arg("HASH")
            .arg("PREFIX")
            .arg(1)
            .arg(KEY_PREFIX)
            .arg("SCHEMA")
            .arg("emp_id")
            .arg("TAG")
            .arg("vector")
            .arg("VECTOR")
            .arg("HNSW")
            .arg(12)
            .arg("TYPE")
            .arg("FLOAT32")
            .arg("DIM")
            .arg(EMBEDDING_DIM)
            .arg("DISTANCE_METRIC")
            .arg("COSINE")
            .arg("INITIAL_CAP")
            .arg(HNSW_INITIAL_CAP)
            .arg("M")
            .arg(HNSW_M)
            .arg("EF_CONSTRUCTION")
            .arg(HNSW_EF_CONSTRUCTION)
            .query_async(&mut conn)
            .await;

        match created {
            Ok(()) => {
                tracing::info!(index = %self.index_name, "created HNSW vector index");
                Ok(())
            }
            // another process won the race
            Err(err) if err.to_string().contains("already exists") => Ok(()),
            Err(err) => Err(unavailable(err)),
        }
    }
}

#[async_trait]
impl SimilarityIndex for RedisVectorIndex {
    async fn top_k(&self, query: &Embedding, k: usize) -> Result<Vec<Neighbor>, IndexError> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let reply: Vec<redis::Value> = redis::cmd("FT.SEARCH")
            .arg(&self.index_name)
            .arg("*=>[KNN $k @vector $vec AS distance]")
            .arg("PARAMS")
            .arg(4)
            .arg("k")
            .arg(k)
            .arg("vec")
            .arg(query.to_le_bytes())
            .arg("SORTBY")
            .arg("distance")
            .arg("RETURN")
            .arg(2)
            .arg("emp_id")
            .arg("distance")
            .arg("LIMIT")
            .arg(0)
            .arg(k)
            .arg("DIALECT")
            .arg(2)
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;

        neighbors_from_rows(search_rows(&reply)?)
    }

    async fn upsert(&self, identity_id: &str, embedding: &Embedding) -> Result<(), IndexError> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("HSET")
            .arg(format!("{KEY_PREFIX}{identity_id}"))
            .arg("vector")
            .arg(embedding.to_le_bytes())
            .arg("emp_id")
            .arg(identity_id)
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn identities(&self) -> Result<Vec<String>, IndexError> {
        let mut conn = self.conn.clone();
        let pattern = format!("{KEY_PREFIX}*");
        let mut cursor: u64 = 0;
        let mut ids = Vec::new();

        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(500)
                .query_async(&mut conn)
                .await
                .map_err(unavailable)?;
            ids.extend(
                keys.iter()
                    .filter_map(|k| k.strip_prefix(KEY_PREFIX))
                    .map(str::to_string),
            );
            if next == 0 {
                break;
            }
            cursor = next;
        }

        ids.sort();
        ids.dedup();
        Ok(ids)
    }
}

/// Split an `FT.SEARCH` reply (`[total, key, [field, value, ...], ...]`)
/// into `(key, fields)` rows.
fn search_rows(reply: &[redis::Value]) -> Result<Vec<(String, Vec<String>)>, IndexError> {
    let malformed = |e: redis::RedisError| IndexError::MalformedReply(e.to_string());

    let Some((_total, rest)) = reply.split_first() else {
        return Err(IndexError::MalformedReply("empty FT.SEARCH reply".into()));
    };
    rest.chunks(2)
        .map(|pair| match pair {
            [key, fields] => Ok((
                redis::from_redis_value::<String>(key).map_err(malformed)?,
                redis::from_redis_value::<Vec<String>>(fields).map_err(malformed)?,
            )),
            _ => Err(IndexError::MalformedReply("FT.SEARCH row without fields".into())),
        })
        .collect()
}

fn neighbors_from_rows(rows: Vec<(String, Vec<String>)>) -> Result<Vec<Neighbor>, IndexError> {
    let mut neighbors = Vec::with_capacity(rows.len());
    for (key, fields) in rows {
        let mut emp_id = None;
        let mut distance = None;
        for pair in fields.chunks_exact(2) {
            match pair[0].as_str() {
                "emp_id" => emp_id = Some(pair[1].clone()),
                "distance" => distance = Some(pair[1].clone()),
                _ => {}
            }
        }

        let identity_id = emp_id
            .or_else(|| key.strip_prefix(KEY_PREFIX).map(str::to_string))
            .ok_or_else(|| IndexError::MalformedReply(format!("no identity for {key}")))?;
        let distance: f32 = distance
            .as_deref()
            .and_then(|d| d.parse().ok())
            .ok_or_else(|| IndexError::MalformedReply(format!("no distance for {key}")))?;

        neighbors.push(Neighbor {
            identity_id,
            distance,
        });
    }

    // Already sorted by the server; keep server order on ties.
    neighbors.sort_by(|a, b| {
        a.distance
            .partial_cmp(&b.distance)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    Ok(neighbors)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(key: &str, fields: &[&str]) -> (String, Vec<String>) {
        (key.to_string(), fields.iter().map(|s| s.to_string()).collect())
    }

    #[test]
    fn test_rows_to_neighbors() {
        let rows = vec![
            row("face_vector:1001", &["emp_id", "1001", "distance", "0.12"]),
            row("face_vector:2002", &["distance", "0.40", "emp_id", "2002"]),
        ];
        let n = neighbors_from_rows(rows).unwrap();
        assert_eq!(n[0].identity_id, "1001");
        assert!((n[0].distance - 0.12).abs() < 1e-6);
        assert_eq!(n[1].identity_id, "2002");
    }

    #[test]
    fn test_identity_falls_back_to_key() {
        let n = neighbors_from_rows(vec![row("face_vector:77", &["distance", "0.5"])]).unwrap();
        assert_eq!(n[0].identity_id, "77");
    }

    #[test]
    fn test_missing_distance_is_malformed() {
        let err = neighbors_from_rows(vec![row("face_vector:77", &["emp_id", "77"])]).unwrap_err();
        assert!(matches!(err, IndexError::MalformedReply(_)));
    }

    #[test]
    fn test_empty_reply_is_malformed() {
        assert!(matches!(search_rows(&[]), Err(IndexError::MalformedReply(_))));
    }
}
