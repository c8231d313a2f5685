//! Embedding service trait and implementations.
//!
//! - `TermHashEmbedding` hashes word and character-trigram features into a
//!   fixed number of buckets. It needs no model files and gives useful
//!   lexical similarity for attached documents.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use parley_core::error::ParleyError;

/// Default dimensionality of the built-in embedders.
pub const DEFAULT_DIMENSIONS: usize = 384;

/// Service for generating text embeddings.
///
/// Implementations convert text into fixed-dimensional vectors. Used for
/// both indexing chunks and embedding queries.
pub trait EmbeddingService: Send + Sync {
    /// Generate an embedding vector for the given text.
    fn embed(
        &self,
        text: &str,
    ) -> impl std::future::Future<Output = Result<Vec<f32>, ParleyError>> + Send;

    /// Return the dimensionality of vectors produced by this service.
    fn dimensions(&self) -> usize;
}

/// Object-safe version of [`EmbeddingService`] for dynamic dispatch.
///
/// Because `EmbeddingService::embed` returns `impl Future` it is not
/// object-safe. This trait uses a boxed future instead, so that
/// `Arc<dyn DynEmbeddingService>` can be stored without generics.
pub trait DynEmbeddingService: Send + Sync {
    /// Generate an embedding vector for the given text (boxed future).
    fn embed_boxed<'a>(
        &'a self,
        text: &'a str,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<Vec<f32>, ParleyError>> + Send + 'a>>;

    /// Return the dimensionality of vectors produced by this service.
    fn dimensions(&self) -> usize;
}

impl<T: EmbeddingService> DynEmbeddingService for T {
    fn embed_boxed<'a>(
        &'a self,
        text: &'a str,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<Vec<f32>, ParleyError>> + Send + 'a>> {
        Box::pin(self.embed(text))
    }

    fn dimensions(&self) -> usize {
        EmbeddingService::dimensions(self)
    }
}

fn bucket(feature: &str, salt: u8, dimensions: usize) -> (usize, f32) {
    let mut hasher = DefaultHasher::new();
    salt.hash(&mut hasher);
    feature.hash(&mut hasher);
    let h = hasher.finish();
    let index = (h % dimensions as u64) as usize;
    // The top bit picks a sign so that collisions tend to cancel out.
    let sign = if h >> 63 == 0 { 1.0 } else { -1.0 };
    (index, sign)
}

fn l2_normalize(values: &mut [f32]) {
    let norm: f32 = values.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for val in values.iter_mut() {
            *val /= norm;
        }
    }
}

// ---------------------------------------------------------------------------
// TermHashEmbedding - feature hashing over words and trigrams
// ---------------------------------------------------------------------------

/// Lexical embedder using the hashing trick.
///
/// Lower-cased alphanumeric words contribute weight 1.0 each and their
/// character trigrams 0.5 each, so near-spellings still overlap.
#[derive(Debug, Clone)]
pub struct TermHashEmbedding {
    dimensions: usize,
}

impl TermHashEmbedding {
    pub fn new() -> Self {
        Self::with_dimensions(DEFAULT_DIMENSIONS)
    }

    pub fn with_dimensions(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
        }
    }

    fn vectorize(&self, text: &str) -> Vec<f32> {
        let mut result = vec![0.0f32; self.dimensions];
        let lowered = text.to_lowercase();
        for word in lowered
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            let (i, sign) = bucket(word, 0, self.dimensions);
            result[i] += sign;

            let chars: Vec<char> = word.chars().collect();
            for gram in chars.windows(3) {
                let gram: String = gram.iter().collect();
                let (i, sign) = bucket(&gram, 1, self.dimensions);
                result[i] += 0.5 * sign;
            }
        }
        l2_normalize(&mut result);
        result
    }
}

impl Default for TermHashEmbedding {
    fn default() -> Self {
        Self::new()
    }
}

impl EmbeddingService for TermHashEmbedding {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ParleyError> {
        if text.trim().is_empty() {
            return Err(ParleyError::Retrieval(
                "Cannot embed empty text".to_string(),
            ));
        }
        Ok(self.vectorize(text))
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}
