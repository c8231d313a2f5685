//! Parley Retrieval crate - document chunking, embeddings and the session index.
//!
//! Attached files are split into overlapping chunks sized from the model's
//! context window, embedded, and held in an in-memory cosine index. The
//! `RetrievalContext` owns at most one index and rebuilds it from scratch
//! whenever the attachment set changes.

pub mod chunker;
pub mod context;
pub mod embedding;
pub mod index;

pub use chunker::{ChunkPlan, DocumentChunk};
pub use context::{IndexHandle, RetrievalContext, RetrievalIndex, RetrievedPassage};
pub use embedding::{DynEmbeddingService, EmbeddingService, TermHashEmbedding};
pub use index::{Passage, SearchHit, VectorIndex};
