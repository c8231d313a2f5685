//! Benchmarks for attachment indexing and passage lookup.
//!
//! The default corpus is 2,000 chunks, roughly ten large attachments at the
//! default 8k context. Set `BENCH_FULL_SCALE=1` for 20,000 chunks.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use criterion::{criterion_group, criterion_main, Criterion};
use uuid::Uuid;

use parley_core::config::RetrievalConfig;
use parley_retrieval::chunker::{split_text, ChunkPlan};
use parley_retrieval::embedding::{EmbeddingService, TermHashEmbedding};
use parley_retrieval::index::{Passage, VectorIndex};
use parley_retrieval::RetrievalContext;

const CI_CHUNK_COUNT: usize = 2_000;
const FULL_SCALE_CHUNK_COUNT: usize = 20_000;

fn chunk_count() -> usize {
    if std::env::var("BENCH_FULL_SCALE").is_ok() {
        FULL_SCALE_CHUNK_COUNT
    } else {
        CI_CHUNK_COUNT
    }
}

fn generate_chunk_text(index: usize) -> String {
    format!(
        "The build script reads the configuration file and exports the \
         environment before invoking the compiler. Errors are written to the \
         log directory and the exit code is propagated to the caller. When the \
         cache is stale the script removes the target folder and retries once. \
         Section {}",
        index
    )
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("Failed to build tokio runtime")
}

fn build_populated_index(count: usize) -> (VectorIndex, TermHashEmbedding) {
    let index = VectorIndex::new();
    let embedder = TermHashEmbedding::new();
    let rt = runtime();

    for i in 0..count {
        let text = generate_chunk_text(i);
        let embedding = rt.block_on(embedder.embed(&text)).expect("embed failed");
        let passage = Passage {
            source: PathBuf::from(format!("doc{}.txt", i % 10)),
            chunk_index: i,
            text,
        };
        index
            .insert(Uuid::new_v4(), embedding, passage)
            .expect("insert failed");
    }
    assert_eq!(index.len(), count, "Index should contain all inserted chunks");
    (index, embedder)
}

fn bench_index_search(c: &mut Criterion) {
    let count = chunk_count();
    let (index, embedder) = build_populated_index(count);
    let rt = runtime();
    let query_vec = rt
        .block_on(embedder.embed("compiler exit code propagation"))
        .expect("query embed failed");

    let mut group = c.benchmark_group("index_search");
    group.sample_size(100);
    group.measurement_time(Duration::from_secs(10));
    group.bench_function(format!("top4_{}chunks", count), |b| {
        b.iter(|| {
            let hits = index.search(&query_vec, 4).expect("search failed");
            assert!(!hits.is_empty());
            hits
        });
    });
    group.finish();
}

fn bench_chunking(c: &mut Criterion) {
    let text: String = (0..200).map(generate_chunk_text).collect::<Vec<_>>().join("\n\n");
    let plan = ChunkPlan::for_context(8192, &RetrievalConfig::default());

    c.bench_function("split_text_8k_context", |b| {
        b.iter(|| split_text(&text, plan));
    });
}

fn bench_rebuild(c: &mut Criterion) {
    let dir = tempfile::tempdir().expect("tempdir");
    let paths: Vec<PathBuf> = (0..6)
        .map(|i| {
            let path = dir.path().join(format!("attachment{i}.txt"));
            let body: String = (0..50).map(generate_chunk_text).collect::<Vec<_>>().join("\n");
            std::fs::write(&path, body).expect("write attachment");
            path
        })
        .collect();

    let rt = runtime();
    let ctx = RetrievalContext::new(Arc::new(TermHashEmbedding::new()), RetrievalConfig::default());

    let mut group = c.benchmark_group("rebuild");
    group.sample_size(20);
    group.bench_function("six_attachments", |b| {
        b.iter(|| {
            rt.block_on(ctx.rebuild(&paths, 8192))
                .expect("rebuild failed")
                .expect("index built")
        });
    });
    group.finish();
}

criterion_group!(benches, bench_index_search, bench_chunking, bench_rebuild);
criterion_main!(benches);
