use crate::chunking::build_chunks;
use crate::embeddings::Embedder;
use crate::error::IndexError;
use crate::loader;
use crate::models::{Chunk, Document, IndexOptions, ScoredChunk};
use crate::traits::Retriever;
use async_trait::async_trait;
use std::collections::HashSet;
use tracing::{debug, info};

/// Exact nearest-neighbour index over squared euclidean distance.
#[derive(Debug, Default)]
pub struct InMemoryIndex {
    dimensions: Option<usize>,
    vectors: Vec<Vec<f32>>,
    chunks: Vec<Chunk>,
}

impl InMemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn dimensions(&self) -> Option<usize> {
        self.dimensions
    }

    pub fn add(&mut self, chunks: Vec<Chunk>, vectors: Vec<Vec<f32>>) -> Result<(), IndexError> {
        if chunks.len() != vectors.len() {
            return Err(IndexError::CountMismatch {
                chunks: chunks.len(),
                embeddings: vectors.len(),
            });
        }

        let Some(first) = vectors.first() else {
            return Ok(());
        };
        let expected = self.dimensions.unwrap_or(first.len());

        if let Some(bad) = vectors.iter().find(|vector| vector.len() != expected) {
            return Err(IndexError::DimensionMismatch {
                expected,
                actual: bad.len(),
            });
        }

        self.dimensions = Some(expected);
        self.vectors.extend(vectors);
        self.chunks.extend(chunks);
        Ok(())
    }

    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<ScoredChunk>, IndexError> {
        let Some(expected) = self.dimensions else {
            return Ok(Vec::new());
        };
        if query.len() != expected {
            return Err(IndexError::DimensionMismatch {
                expected,
                actual: query.len(),
            });
        }

        let mut scored: Vec<(usize, f32)> = self
            .vectors
            .iter()
            .enumerate()
            .map(|(position, vector)| (position, squared_l2(query, vector)))
            .collect();

        // stable sort: equal distances keep insertion order
        scored.sort_by(|left, right| left.1.total_cmp(&right.1));

        Ok(scored
            .into_iter()
            .take(k)
            .map(|(position, distance)| ScoredChunk {
                chunk: self.chunks[position].clone(),
                distance,
            })
            .collect())
    }
}

fn squared_l2(left: &[f32], right: &[f32]) -> f32 {
    left.iter()
        .zip(right)
        .map(|(a, b)| (a - b) * (a - b))
        .sum()
}

/// Loads, chunks, embeds and indexes documents, then answers similarity queries.
pub struct DocumentIndex<E> {
    embedder: E,
    options: IndexOptions,
    index: InMemoryIndex,
    sources: HashSet<String>,
}

impl<E> DocumentIndex<E>
where
    E: Embedder + Send + Sync,
{
    pub fn new(embedder: E, options: IndexOptions) -> Result<Self, IndexError> {
        options.chunking.validate()?;
        Ok(Self {
            embedder,
            options,
            index: InMemoryIndex::new(),
            sources: HashSet::new(),
        })
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn contains_source(&self, source: &str) -> bool {
        self.sources.contains(source)
    }

    /// Indexes an uploaded document. Returns the number of new chunks; a
    /// source that was already indexed adds nothing.
    pub async fn add_document(&mut self, document: &Document) -> Result<usize, IndexError> {
        if self.contains_source(&document.name) {
            info!(source = %document.name, "document already in index");
            return Ok(0);
        }

        let text = loader::load(document)?;
        let added = self.build(&document.name, &text).await?;
        self.sources.insert(document.name.clone());
        Ok(added)
    }

    /// Chunks and embeds raw text under the given source name. Every batch
    /// is embedded before the index is touched, so a failure adds nothing.
    pub async fn build(&mut self, source: &str, text: &str) -> Result<usize, IndexError> {
        let chunks = build_chunks(source, text, &self.options.chunking, self.index.len())?;
        let total = chunks.len();
        let batch_size = self.options.batch_size.max(1);

        let mut vectors = Vec::with_capacity(total);
        for batch in chunks.chunks(batch_size) {
            let texts: Vec<String> = batch.iter().map(|chunk| chunk.text.clone()).collect();
            let embedded = self.embedder.embed_batch(&texts).await?;
            if embedded.len() != batch.len() {
                return Err(IndexError::CountMismatch {
                    chunks: batch.len(),
                    embeddings: embedded.len(),
                });
            }
            debug!(source, batch = batch.len(), "embedded chunk batch");
            vectors.extend(embedded);
        }
        self.index.add(chunks, vectors)?;

        info!(
            source,
            chunk_count = total,
            embedder = self.embedder.name(),
            "indexed document"
        );
        Ok(total)
    }

    pub async fn query(&self, question: &str, k: usize) -> Result<Vec<ScoredChunk>, IndexError> {
        if self.index.is_empty() || k == 0 {
            return Ok(Vec::new());
        }

        let vectors = self.embedder.embed_batch(&[question.to_string()]).await?;
        let query = vectors.into_iter().next().ok_or_else(|| IndexError::CountMismatch {
            chunks: 1,
            embeddings: 0,
        })?;
        self.index.search(&query, k)
    }
}

#[async_trait]
impl<E> Retriever for DocumentIndex<E>
where
    E: Embedder + Send + Sync,
{
    async fn retrieve(&self, question: &str, k: usize) -> Result<Vec<ScoredChunk>, IndexError> {
        self.query(question, k).await
    }
}
