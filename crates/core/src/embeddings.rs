use crate::error::IngestError;
use crate::http;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

pub const DEFAULT_EMBEDDING_DIMENSIONS: usize = 384;

const EMBED_MAX_ATTEMPTS: u32 = 3;
const EMBED_RETRY_BASE_DELAY: Duration = Duration::from_millis(250);

/// One fixed model per index lifetime: the `model_id` is recorded in the
/// index manifest, and loading with a different embedder is refused.
pub trait Embedder: Send + Sync {
    fn model_id(&self) -> &str;

    fn dimensions(&self) -> usize;

    fn embed(&self, text: &str) -> Result<Vec<f32>, IngestError>;

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, IngestError> {
        texts.iter().map(|text| self.embed(text)).collect()
    }
}

/// Deterministic local embedder: hashed character trigram counts,
/// L2-normalized. No external service, suitable for offline builds and tests.
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

impl Embedder for CharacterNgramEmbedder {
    fn model_id(&self) -> &str {
        "hashed-char-trigram-v1"
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>, IngestError> {
        let mut vector = vec![0f32; self.dimensions.max(1)];
        let lowered = text.to_lowercase();
        let chars: Vec<char> = lowered.chars().collect();

        if chars.is_empty() {
            return Ok(vector);
        }

        for window in chars.windows(3) {
            let token = window.iter().collect::<String>();
            let mut hash = 1469598103934665603u64;
            for byte in token.bytes() {
                hash ^= byte as u64;
                hash = hash.wrapping_mul(1099511628211);
            }
            let bucket = (hash % vector.len() as u64) as usize;
            vector[bucket] += 1.0;
        }

        let magnitude = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
        if magnitude > 0.0 {
            for value in &mut vector {
                *value /= magnitude;
            }
        }

        Ok(vector)
    }
}

/// HTTP embedding service client. Sends batches as
/// `{"model": ..., "input": [...]}` and expects `{"embeddings": [[f32]]}`.
pub struct RemoteEmbedder {
    endpoint: String,
    api_key: Option<String>,
    model: String,
    dimensions: usize,
    client: reqwest::blocking::Client,
    max_attempts: u32,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    embeddings: Vec<Vec<f32>>,
}

impl RemoteEmbedder {
    pub fn new(
        endpoint: impl Into<String>,
        model: impl Into<String>,
        dimensions: usize,
        api_key: Option<String>,
    ) -> Result<Self, IngestError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(http::REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            endpoint: endpoint.into(),
            api_key,
            model: model.into(),
            dimensions,
            client,
            max_attempts: EMBED_MAX_ATTEMPTS,
        })
    }

    /// `None` when no `EMBED_ENDPOINT` is configured.
    pub fn from_env() -> Result<Option<Self>, IngestError> {
        let endpoint = match std::env::var("EMBED_ENDPOINT") {
            Ok(value) if !value.trim().is_empty() => value.trim().to_string(),
            _ => return Ok(None),
        };

        let model = std::env::var("EMBED_MODEL")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| "all-minilm-l6-v2".to_string());

        let dimensions = match std::env::var("EMBED_DIMENSIONS") {
            Ok(value) => value.trim().parse::<usize>().map_err(|_| {
                IngestError::Embedding(format!("EMBED_DIMENSIONS is not a number: {value}"))
            })?,
            Err(_) => DEFAULT_EMBEDDING_DIMENSIONS,
        };

        let api_key = std::env::var("EMBED_API_KEY")
            .ok()
            .filter(|value| !value.trim().is_empty());

        Ok(Some(Self::new(endpoint, model, dimensions, api_key)?))
    }

    fn request_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, IngestError> {
        let mut last_error = String::new();

        for attempt in 0..self.max_attempts {
            if attempt > 0 {
                std::thread::sleep(EMBED_RETRY_BASE_DELAY * 2u32.pow(attempt - 1));
            }

            match self.send_once(texts) {
                Ok(vectors) => return Ok(vectors),
                Err(error) => last_error = error.to_string(),
            }
        }

        Err(IngestError::Embedding(format!(
            "embedding service failed after {} attempts: {last_error}",
            self.max_attempts
        )))
    }

    fn send_once(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, IngestError> {
        let mut request = self
            .client
            .post(&self.endpoint)
            .json(&json!({ "model": self.model, "input": texts }));

        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request.send()?;
        if !response.status().is_success() {
            return Err(IngestError::Embedding(format!(
                "embedding service returned {}",
                response.status()
            )));
        }

        let payload: EmbeddingResponse = response.json()?;
        if payload.embeddings.len() != texts.len() {
            return Err(IngestError::Embedding(format!(
                "expected {} vectors, got {}",
                texts.len(),
                payload.embeddings.len()
            )));
        }
        for vector in &payload.embeddings {
            if vector.len() != self.dimensions {
                return Err(IngestError::Embedding(format!(
                    "vector dimension {} does not match configured {}",
                    vector.len(),
                    self.dimensions
                )));
            }
        }

        Ok(payload.embeddings)
    }
}

impl Embedder for RemoteEmbedder {
    fn model_id(&self) -> &str {
        &self.model
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>, IngestError> {
        let mut vectors = self.embed_batch(&[text.to_string()])?;
        vectors.pop().ok_or_else(|| {
            IngestError::Embedding("embedding service returned no vector".to_string())
        })
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, IngestError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        http::call_blocking(|| self.request_batch(texts))
    }
}
