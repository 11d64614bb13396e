use crate::error::IngestError;
use crate::models::{DocumentFingerprint, IngestionOptions, Passage};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Copy)]
pub struct ChunkingConfig {
    pub max_chars: usize,
    pub overlap_chars: usize,
    pub min_chars: usize,
}

impl From<&IngestionOptions> for ChunkingConfig {
    fn from(value: &IngestionOptions) -> Self {
        Self {
            max_chars: value.chunk_max_chars,
            overlap_chars: value.chunk_overlap_chars,
            min_chars: value.min_chunk_chars,
        }
    }
}

impl ChunkingConfig {
    fn validate(&self) -> Result<(), IngestError> {
        if self.max_chars == 0 {
            return Err(IngestError::InvalidChunkConfig(
                "max_chars must be positive".to_string(),
            ));
        }
        if self.overlap_chars >= self.max_chars {
            return Err(IngestError::InvalidChunkConfig(format!(
                "overlap {} must be smaller than max chunk size {}",
                self.overlap_chars, self.max_chars
            )));
        }
        Ok(())
    }
}

pub fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Fixed-size character windows with overlap. Identical input and config
/// always yield identical windows.
pub fn split_with_overlap(text: &str, config: ChunkingConfig) -> Result<Vec<String>, IngestError> {
    config.validate()?;

    let chars: Vec<char> = text.chars().collect();
    if chars.is_empty() {
        return Ok(Vec::new());
    }
    if chars.len() <= config.max_chars {
        return Ok(vec![text.to_string()]);
    }

    let stride = config.max_chars - config.overlap_chars;
    let mut windows = Vec::new();
    let mut start = 0;

    loop {
        let end = (start + config.max_chars).min(chars.len());
        windows.push(chars[start..end].iter().collect());
        if end == chars.len() {
            break;
        }
        start += stride;
    }

    Ok(windows)
}

/// Chunk one page of a document into passages. Embeddings are left empty
/// here and filled in by whoever embeds the batch.
pub fn build_passages(
    document: &DocumentFingerprint,
    page: u32,
    page_text: &str,
    options: &IngestionOptions,
    global_index: u64,
) -> Result<(Vec<Passage>, u64), IngestError> {
    let config = ChunkingConfig::from(options);
    let normalized = normalize_whitespace(page_text);

    let mut passages = Vec::new();
    let mut cursor = global_index;

    for window in split_with_overlap(&normalized, config)? {
        if window.trim().chars().count() < config.min_chars {
            continue;
        }
        passages.push(make_passage(document, page, cursor, window));
        cursor = cursor.saturating_add(1);
    }

    // A short page still deserves one passage rather than silently vanishing.
    if passages.is_empty() && !normalized.trim().is_empty() {
        passages.push(make_passage(document, page, cursor, normalized));
        cursor = cursor.saturating_add(1);
    }

    Ok((passages, cursor))
}

fn make_passage(document: &DocumentFingerprint, page: u32, index: u64, text: String) -> Passage {
    Passage {
        passage_id: make_passage_id(&document.document_id, page, index, &text),
        document_id: document.document_id.clone(),
        filename: document.filename.clone(),
        page,
        passage_index: index,
        text,
        embedding: Vec::new(),
    }
}

fn make_passage_id(document_id: &str, page: u32, index: u64, text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(document_id.as_bytes());
    hasher.update(page.to_le_bytes());
    hasher.update(index.to_le_bytes());
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}
