//! The session's retrieval context: at most one index over the current
//! attachment set.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use parley_core::config::RetrievalConfig;
use parley_core::error::Result;

use crate::chunker::{self, ChunkPlan};
use crate::embedding::DynEmbeddingService;
use crate::index::{Passage, VectorIndex};

/// An index built from one attachment set. Never modified after build.
#[derive(Debug)]
pub struct RetrievalIndex {
    index: VectorIndex,
    files: Vec<PathBuf>,
    chunk_count: usize,
}

impl RetrievalIndex {
    /// Files that contributed at least one chunk.
    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    pub fn chunk_count(&self) -> usize {
        self.chunk_count
    }
}

/// Shared handle to the active index.
pub type IndexHandle = Arc<RetrievalIndex>;

/// A passage returned for a query.
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievedPassage {
    pub source: PathBuf,
    pub text: String,
    pub score: f64,
}

/// Owns the active retrieval index.
///
/// `rebuild` holds the write lock for its whole duration, so a query issued
/// during a rebuild waits for the new index instead of reading a stale or
/// half-built one.
pub struct RetrievalContext {
    embedder: Arc<dyn DynEmbeddingService>,
    config: RetrievalConfig,
    active: RwLock<Option<IndexHandle>>,
    rebuilds: AtomicU64,
}

impl RetrievalContext {
    pub fn new(embedder: Arc<dyn DynEmbeddingService>, config: RetrievalConfig) -> Self {
        Self {
            embedder,
            config,
            active: RwLock::new(None),
            rebuilds: AtomicU64::new(0),
        }
    }

    /// Number of `rebuild` calls made so far.
    pub fn rebuild_count(&self) -> u64 {
        self.rebuilds.load(Ordering::SeqCst)
    }

    /// The active index, if any.
    pub async fn current(&self) -> Option<IndexHandle> {
        self.active.read().await.clone()
    }

    /// Replace the active index with one built from `paths`.
    ///
    /// Returns `None` (and clears the active index) when `paths` is empty or
    /// no file yielded any indexable text. Chunks that fail to embed are
    /// skipped.
    pub async fn rebuild(&self, paths: &[PathBuf], context_size: u32) -> Result<Option<IndexHandle>> {
        let mut active = self.active.write().await;
        let generation = self.rebuilds.fetch_add(1, Ordering::SeqCst) + 1;
        *active = None;

        if paths.is_empty() {
            debug!(generation, "Retrieval index cleared");
            return Ok(None);
        }

        let plan = ChunkPlan::for_context(context_size, &self.config);
        let (chunks, files) = chunker::load_documents(paths, &self.config.allowed_extensions, plan);
        if chunks.is_empty() {
            info!(generation, requested = paths.len(), "No indexable attachments");
            return Ok(None);
        }

        let index = VectorIndex::new();
        let mut indexed_files: Vec<PathBuf> = Vec::new();
        for chunk in chunks {
            let embedding = match self.embedder.embed_boxed(&chunk.text).await {
                Ok(embedding) => embedding,
                Err(e) => {
                    warn!(source = %chunk.source.display(), error = %e, "Skipping chunk");
                    continue;
                }
            };
            if !indexed_files.contains(&chunk.source) {
                indexed_files.push(chunk.source.clone());
            }
            index.insert(
                Uuid::new_v4(),
                embedding,
                Passage {
                    source: chunk.source,
                    chunk_index: chunk.chunk_index,
                    text: chunk.text,
                },
            )?;
        }

        if index.is_empty() {
            return Ok(None);
        }
        // Keep the attachment order rather than chunk order.
        let files: Vec<PathBuf> = files
            .into_iter()
            .filter(|f| indexed_files.contains(f))
            .collect();

        let handle = Arc::new(RetrievalIndex {
            chunk_count: index.len(),
            index,
            files,
        });
        info!(
            generation,
            files = handle.files.len(),
            chunks = handle.chunk_count,
            chunk_size = plan.size,
            "Retrieval index rebuilt"
        );
        *active = Some(handle.clone());
        Ok(Some(handle))
    }

    /// The `k` passages most similar to `text`; empty when no index exists.
    pub async fn query(&self, text: &str, k: usize) -> Result<Vec<RetrievedPassage>> {
        let active = self.active.read().await;
        let Some(handle) = active.as_ref() else {
            return Ok(Vec::new());
        };
        if text.trim().is_empty() || k == 0 {
            return Ok(Vec::new());
        }

        let embedding = self.embedder.embed_boxed(text).await?;
        let hits = handle.index.search(&embedding, k)?;
        Ok(hits
            .into_iter()
            .map(|hit| RetrievedPassage {
                source: hit.passage.source,
                text: hit.passage.text,
                score: hit.score,
            })
            .collect())
    }

    /// Default number of passages per query.
    pub fn top_k(&self) -> usize {
        self.config.top_k
    }
}
