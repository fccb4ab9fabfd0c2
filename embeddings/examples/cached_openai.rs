//! Embeds a heavily duplicated document set from many concurrent tasks
//! through a cached OpenAI generator.
//!
//! Usage: OPENAI_API_KEY=... cargo run -p chroma-embeddings --example cached_openai

use std::sync::Arc;

use anyhow::{Context, bail};
use chroma_embeddings::{CacheConfig, CachedGenerator, CancellationToken, OpenAIGenerator};
use tokio::task::JoinSet;
use tracing_subscriber::EnvFilter;

const DOCUMENT_COUNT: usize = 500;
const DISTINCT_DOCUMENTS: usize = 20;
const TASKS: usize = 10;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let generator = OpenAIGenerator::from_env();
    if !generator.is_available() {
        bail!("OPENAI_API_KEY must be set");
    }

    let scope = CancellationToken::new();
    let config = CacheConfig::new().with_max_batch_size(64);
    let embeddings = Arc::new(CachedGenerator::with_config(generator, config, scope.clone()));

    let documents: Vec<String> = (0..DOCUMENT_COUNT)
        .map(|i| format!("document number {}", i % DISTINCT_DOCUMENTS))
        .collect();

    let mut tasks = JoinSet::new();
    for chunk in documents.chunks(DOCUMENT_COUNT / TASKS) {
        let embeddings = Arc::clone(&embeddings);
        let chunk = chunk.to_vec();
        tasks.spawn(async move { embeddings.resolve(&chunk).await });
    }

    let mut embedded = 0;
    while let Some(joined) = tasks.join_next().await {
        embedded += joined
            .context("embedding task panicked")?
            .context("embedding documents")?
            .len();
    }

    let stats = embeddings.stats();
    println!("Embedded {embedded} documents");
    println!("  Distinct documents: {}", stats.entries);
    println!("  Cache hits: {}", stats.hits);
    println!("  Coalesced requests: {}", stats.coalesced);
    println!("  Generator batches: {}", stats.batches_dispatched);

    scope.cancel();
    Ok(())
}
