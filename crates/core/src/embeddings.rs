use crate::chunking::clean_text;
use crate::error::ServiceError;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

const DEFAULT: usize = 128;

pub const DEFAULT_EMBEDDING_DIMENSIONS: usize = DEFAULT;
pub const OPENAI_EMBEDDING_MODEL: &str = "text-embedding-3-large";
pub const OPENAI_EMBEDDING_DIMENSIONS: usize = 1024;

#[async_trait]
pub trait Embedder {
    fn name(&self) -> &str;
    fn dimensions(&self) -> usize;
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ServiceError>;
}

/// Offline embedder hashing character trigrams into a fixed number of buckets.
#[derive(Debug, Clone, Copy)]
pub struct CharacterNgramEmbedder {
    pub dimensions: usize,
}

impl Default for CharacterNgramEmbedder {
    fn default() -> Self {
        Self {
            dimensions: DEFAULT_EMBEDDING_DIMENSIONS,
        }
    }
}

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0100_0000_01b3;

impl CharacterNgramEmbedder {
    /// Unit-length trigram histogram of the cleaned, lowercased text. The
    /// text is padded with a space on each side so one- and two-letter words
    /// still produce a gram. Blank text maps to the zero vector.
    pub fn embed(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0f32; self.dimensions.max(1)];
        let padded: Vec<char> = format!(" {} ", clean_text(&text.to_lowercase()))
            .chars()
            .collect();

        for gram in padded.windows(3) {
            let bucket = gram_bucket(gram, vector.len());
            vector[bucket] += 1.0;
        }

        let magnitude = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
        if magnitude > 0.0 {
            vector.iter_mut().for_each(|value| *value /= magnitude);
        }
        vector
    }
}

fn gram_bucket(gram: &[char], buckets: usize) -> usize {
    let mut utf8 = [0u8; 4];
    let hash = gram.iter().fold(FNV_OFFSET, |hash, ch| {
        ch.encode_utf8(&mut utf8)
            .bytes()
            .fold(hash, |hash, byte| (hash ^ u64::from(byte)).wrapping_mul(FNV_PRIME))
    });
    (hash % buckets as u64) as usize
}

#[async_trait]
impl Embedder for CharacterNgramEmbedder {
    fn name(&self) -> &str {
        "char-trigram"
    }

    fn dimensions(&self) -> usize {
        self.dimensions.max(1)
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ServiceError> {
        Ok(texts.iter().map(|text| self.embed(text)).collect())
    }
}

#[async_trait]
impl<T> Embedder for Box<T>
where
    T: Embedder + Send + Sync + ?Sized,
{
    fn name(&self) -> &str {
        (**self).name()
    }

    fn dimensions(&self) -> usize {
        (**self).dimensions()
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ServiceError> {
        (**self).embed_batch(texts).await
    }
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: Vec<String>,
    dimensions: usize,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingRow>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingRow {
    index: usize,
    embedding: Vec<f32>,
}

pub struct OpenAiEmbedder {
    endpoint: String,
    api_key: String,
    model: String,
    dimensions: usize,
    client: Client,
}

impl OpenAiEmbedder {
    pub fn new(endpoint: impl Into<String>, api_key: Option<String>) -> Result<Self, ServiceError> {
        let api_key = api_key
            .map(|key| key.trim().to_string())
            .filter(|key| !key.is_empty())
            .ok_or_else(|| ServiceError::MissingCredential("OPENAI_API_KEY".to_string()))?;

        Ok(Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            api_key,
            model: OPENAI_EMBEDDING_MODEL.to_string(),
            dimensions: OPENAI_EMBEDDING_DIMENSIONS,
            client: Client::new(),
        })
    }

    pub fn with_model(mut self, model: impl Into<String>, dimensions: usize) -> Self {
        self.model = model.into();
        self.dimensions = dimensions;
        self
    }

    fn request_body(&self, texts: &[String]) -> EmbeddingRequest<'_> {
        EmbeddingRequest {
            model: &self.model,
            input: texts.iter().map(|text| text.replace('\n', " ")).collect(),
            dimensions: self.dimensions,
        }
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    fn name(&self) -> &str {
        &self.model
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ServiceError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let response = self
            .client
            .post(format!("{}/v1/embeddings", self.endpoint))
            .bearer_auth(&self.api_key)
            .json(&self.request_body(texts))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ServiceError::BackendResponse {
                backend: "openai".to_string(),
                details: format!("{status}: {body}"),
            });
        }

        let payload: EmbeddingResponse = response.json().await?;
        vectors_in_input_order(payload, texts.len())
    }
}

fn vectors_in_input_order(
    payload: EmbeddingResponse,
    expected: usize,
) -> Result<Vec<Vec<f32>>, ServiceError> {
    if payload.data.len() != expected {
        return Err(ServiceError::Malformed {
            backend: "openai".to_string(),
            details: format!(
                "expected {expected} embeddings, received {}",
                payload.data.len()
            ),
        });
    }

    let mut rows = payload.data;
    rows.sort_by_key(|row| row.index);
    Ok(rows.into_iter().map(|row| row.embedding).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn distance(left: &[f32], right: &[f32]) -> f32 {
        left.iter().zip(right).map(|(a, b)| (a - b) * (a - b)).sum()
    }

    #[test]
    fn related_questions_land_closer_than_unrelated_text() {
        let embedder = CharacterNgramEmbedder::default();
        let question = embedder.embed("What are the staffing problems in home care?");
        let related = embedder.embed("Which staffing problems does home care have?");
        let unrelated = embedder.embed("Bake the chocolate cake for forty minutes.");

        assert!(distance(&question, &related) < distance(&question, &unrelated));
    }

    #[test]
    fn case_and_spacing_are_ignored() {
        let embedder = CharacterNgramEmbedder { dimensions: 64 };
        assert_eq!(embedder.embed("Home  Care\n"), embedder.embed("home care"));
    }

    #[test]
    fn vectors_are_unit_length_and_blank_text_is_zero() {
        let embedder = CharacterNgramEmbedder { dimensions: 32 };

        let vector = embedder.embed("a");
        assert_eq!(vector.len(), 32);
        let norm = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);

        assert!(embedder.embed(" \t ").iter().all(|value| *value == 0.0));
    }

    #[tokio::test]
    async fn batch_embedding_keeps_input_order() {
        let embedder = CharacterNgramEmbedder { dimensions: 16 };
        let texts = vec!["first text".to_string(), "second text".to_string()];
        let vectors = embedder.embed_batch(&texts).await.unwrap();

        assert_eq!(vectors.len(), 2);
        assert_eq!(vectors[0], embedder.embed("first text"));
        assert_eq!(vectors[1], embedder.embed("second text"));
    }

    #[test]
    fn openai_embedder_requires_a_key() {
        assert!(matches!(
            OpenAiEmbedder::new("https://api.openai.com", Some("  ".to_string())),
            Err(ServiceError::MissingCredential(_))
        ));
    }

    #[test]
    fn request_flattens_newlines() {
        let embedder = OpenAiEmbedder::new("https://api.openai.com/", Some("sk-test".to_string()))
            .unwrap();
        let body = embedder.request_body(&["line one\nline two".to_string()]);

        assert_eq!(body.input, vec!["line one line two"]);
        assert_eq!(body.model, OPENAI_EMBEDDING_MODEL);
        assert_eq!(body.dimensions, OPENAI_EMBEDDING_DIMENSIONS);
        assert_eq!(embedder.endpoint, "https://api.openai.com");
    }

    #[test]
    fn response_rows_are_reordered_by_index() {
        let payload: EmbeddingResponse = serde_json::from_value(serde_json::json!({
            "data": [
                { "index": 1, "embedding": [0.0, 1.0] },
                { "index": 0, "embedding": [1.0, 0.0] }
            ]
        }))
        .unwrap();

        let vectors = vectors_in_input_order(payload, 2).unwrap();
        assert_eq!(vectors, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
    }

    #[test]
    fn short_response_is_malformed() {
        let payload = EmbeddingResponse { data: Vec::new() };
        assert!(matches!(
            vectors_in_input_order(payload, 1),
            Err(ServiceError::Malformed { .. })
        ));
    }
}
