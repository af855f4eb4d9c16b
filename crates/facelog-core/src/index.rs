//! Similarity store query interface.
//!
//! The production index is an HNSW vector index living in the shared store;
//! [`GalleryIndex`] is the plain cosine-scan variant kept for tests and small
//! galleries.

use crate::types::Embedding;
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("similarity store unavailable: {0}")]
    Unavailable(String),
    #[error("malformed index reply: {0}")]
    MalformedReply(String),
}

/// One row of a top-K reply.
#[derive(Debug, Clone, PartialEq)]
pub struct Neighbor {
    pub identity_id: String,
    /// Cosine distance in [0, 2].
    pub distance: f32,
}

/// Approximate nearest-neighbor search over enrolled unit vectors.
#[async_trait]
pub trait SimilarityIndex: Send + Sync {
    /// Return up to `k` neighbors, most similar first.
    async fn top_k(&self, query: &Embedding, k: usize) -> Result<Vec<Neighbor>, IndexError>;

    /// Insert or replace the reference vector for an identity.
    async fn upsert(&self, identity_id: &str, embedding: &Embedding) -> Result<(), IndexError>;

    /// All identities currently indexed.
    async fn identities(&self) -> Result<Vec<String>, IndexError>;
}

/// In-memory brute-force cosine index.
///
/// Always iterates every gallery entry; results are sorted by distance with
/// insertion order preserved between equal distances.
#[derive(Debug, Default)]
pub struct GalleryIndex {
    gallery: RwLock<Vec<(String, Embedding)>>,
    queries: AtomicUsize,
}

impl GalleryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `top_k` calls served so far.
    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::Relaxed)
    }
}

fn poisoned<T>(_: std::sync::PoisonError<T>) -> IndexError {
    IndexError::Unavailable("gallery lock poisoned".into())
}

#[async_trait]
impl SimilarityIndex for GalleryIndex {
    async fn top_k(&self, query: &Embedding, k: usize) -> Result<Vec<Neighbor>, IndexError> {
        self.queries.fetch_add(1, Ordering::Relaxed);
        let gallery = self.gallery.read().map_err(poisoned)?;

        let mut neighbors: Vec<Neighbor> = gallery
            .iter()
            .map(|(id, embedding)| Neighbor {
                identity_id: id.clone(),
                distance: query.cosine_distance(embedding),
            })
            .collect();
        drop(gallery);

        // Stable sort keeps gallery order for ties.
        neighbors.sort_by(|a, b| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        neighbors.truncate(k);
        Ok(neighbors)
    }

    async fn upsert(&self, identity_id: &str, embedding: &Embedding) -> Result<(), IndexError> {
        let mut gallery = self.gallery.write().map_err(poisoned)?;
        match gallery.iter_mut().find(|(id, _)| id == identity_id) {
            Some(entry) => entry.1 = embedding.clone(),
            None => gallery.push((identity_id.to_string(), embedding.clone())),
        }
        Ok(())
    }

    async fn identities(&self) -> Result<Vec<String>, IndexError> {
        let gallery = self.gallery.read().map_err(poisoned)?;
        Ok(gallery.iter().map(|(id, _)| id.clone()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::test_vectors::{at_similarity, axis};

    #[tokio::test]
    async fn test_top_k_sorted_by_distance() {
        let index = GalleryIndex::new();
        index.upsert("far", &axis(1)).await.unwrap();
        index.upsert("near", &at_similarity(0, 2, 0.9)).await.unwrap();
        index.upsert("mid", &at_similarity(0, 3, 0.5)).await.unwrap();

        let hits = index.top_k(&axis(0), 2).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].identity_id, "near");
        assert_eq!(hits[1].identity_id, "mid");
        assert!((hits[0].distance - 0.1).abs() < 1e-5);
        assert_eq!(index.query_count(), 1);
    }

    #[tokio::test]
    async fn test_ties_keep_insertion_order() {
        let index = GalleryIndex::new();
        index.upsert("first", &axis(0)).await.unwrap();
        index.upsert("second", &axis(0)).await.unwrap();

        let hits = index.top_k(&axis(0), 5).await.unwrap();
        assert_eq!(hits[0].identity_id, "first");
        assert_eq!(hits[1].identity_id, "second");
    }

    #[tokio::test]
    async fn test_upsert_replaces_existing() {
        let index = GalleryIndex::new();
        index.upsert("42", &axis(1)).await.unwrap();
        index.upsert("42", &axis(0)).await.unwrap();

        assert_eq!(index.identities().await.unwrap(), vec!["42".to_string()]);
        let hits = index.top_k(&axis(0), 1).await.unwrap();
        assert!(hits[0].distance.abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_empty_gallery() {
        let index = GalleryIndex::new();
        assert!(index.top_k(&axis(0), 5).await.unwrap().is_empty());
    }
}
