//! Embedding provider trait and vector utilities.
//!
//! Defines the [`EmbeddingProvider`] trait that every embedding backend
//! implements, plus pure helpers for vector serialization, normalization
//! and similarity.
//!
//! Concrete providers (local fastembed, remote HTTP, remote batch) and the
//! retry wrapper live in the `bridge-memory` app crate.

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::error::EmbeddingError;

/// A backend that turns text into vectors.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Short provider id (`"openai"`, `"ollama"`, `"local"`, ...).
    fn id(&self) -> &str;

    /// Model identifier (e.g. `"text-embedding-3-small"`).
    fn model(&self) -> &str;

    /// Vector dimensionality, when known up front.
    fn dims(&self) -> Option<usize>;

    /// Signature partitioning cached vectors and the index meta.
    ///
    /// Defaults to a hash of id and model; providers with an endpoint
    /// include it as well.
    fn provider_key(&self) -> String {
        provider_key(self.id(), self.model(), None)
    }

    /// Embed a batch of texts, one vector per input, in input order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError>;
}

/// SHA-256 signature of provider id, model and optional endpoint.
pub fn provider_key(id: &str, model: &str, endpoint: Option<&str>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(id.as_bytes());
    hasher.update([0u8]);
    hasher.update(model.as_bytes());
    hasher.update([0u8]);
    hasher.update(endpoint.unwrap_or("").as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Replace non-finite components with zero and scale to unit length.
///
/// Zero vectors are returned as zeros.
pub fn normalize_embedding(vec: Vec<f32>) -> Vec<f32> {
    let sanitized: Vec<f32> = vec
        .into_iter()
        .map(|v| if v.is_finite() { v } else { 0.0 })
        .collect();
    let magnitude = sanitized.iter().map(|v| v * v).sum::<f32>().sqrt();
    if magnitude < 1e-10 {
        return sanitized;
    }
    sanitized.into_iter().map(|v| v / magnitude).collect()
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
///
/// # Example
///
/// ```rust
/// use bridge_memory_core::embedding::{vec_to_blob, blob_to_vec};
///
/// let v = vec![1.0f32, -2.5, 3.125];
/// let blob = vec_to_blob(&v);
/// assert_eq!(blob.len(), 12); // 3 × 4 bytes
/// assert_eq!(blob_to_vec(&blob), v);
/// ```
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns a value in `[-1.0, 1.0]`, or `0.0` for empty vectors or
/// vectors of different lengths.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}
