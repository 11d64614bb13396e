use crate::chunking::build_passages;
use crate::embeddings::Embedder;
use crate::error::ChatError;
use crate::extractor::{LopdfExtractor, PageText, PdfExtractor};
use crate::ingest::digest_bytes;
use crate::models::{DocumentFingerprint, IngestionOptions, Passage, RetrievalResult};
use crate::search;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

pub const MAX_UPLOAD_BYTES: usize = 8 * 1024 * 1024;
pub const MAX_UPLOAD_TEXT_CHARS: usize = 200_000;
pub const UPLOAD_CACHE_TTL: Duration = Duration::from_secs(3_600);

const RAW_TEXT_FILENAME: &str = "user_document";

/// Request-scoped grounding context built from a user-supplied document.
/// Structurally identical to persisted passages, but it lives only for the
/// request and is never written to the index.
pub struct TransientContext {
    passages: Vec<Passage>,
}

impl TransientContext {
    pub fn from_pdf_bytes(
        filename: &str,
        bytes: &[u8],
        embedder: &dyn Embedder,
        options: &IngestionOptions,
    ) -> Result<Self, ChatError> {
        if bytes.len() > MAX_UPLOAD_BYTES {
            return Err(ChatError::UnsupportedUpload(format!(
                "upload of {} bytes exceeds the {} byte limit",
                bytes.len(),
                MAX_UPLOAD_BYTES
            )));
        }

        let pages = LopdfExtractor
            .extract_pages_from_bytes(bytes)
            .map_err(|error| ChatError::UnsupportedUpload(error.to_string()))?;

        Self::from_pages(filename, &digest_bytes(bytes), pages, embedder, options)
    }

    pub fn from_raw_text(
        text: &str,
        embedder: &dyn Embedder,
        options: &IngestionOptions,
    ) -> Result<Self, ChatError> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(ChatError::UnsupportedUpload(
                "document text is empty".to_string(),
            ));
        }
        if trimmed.chars().count() > MAX_UPLOAD_TEXT_CHARS {
            return Err(ChatError::UnsupportedUpload(format!(
                "document text exceeds {MAX_UPLOAD_TEXT_CHARS} characters"
            )));
        }

        let pages = vec![PageText {
            number: 1,
            text: trimmed.to_string(),
        }];
        Self::from_pages(
            RAW_TEXT_FILENAME,
            &digest_bytes(trimmed.as_bytes()),
            pages,
            embedder,
            options,
        )
    }

    pub fn from_passages(passages: Vec<Passage>) -> Self {
        Self { passages }
    }

    fn from_pages(
        filename: &str,
        checksum: &str,
        pages: Vec<PageText>,
        embedder: &dyn Embedder,
        options: &IngestionOptions,
    ) -> Result<Self, ChatError> {
        let fingerprint = DocumentFingerprint {
            document_id: format!("transient-{}", &checksum[..16]),
            filename: filename.to_string(),
            source_path: filename.to_string(),
            checksum: checksum.to_string(),
            ingested_at: Utc::now(),
        };

        let mut passages = Vec::new();
        let mut cursor = 0u64;
        for page in pages {
            let (page_passages, next_cursor) =
                build_passages(&fingerprint, page.number, &page.text, options, cursor)
                    .map_err(|error| ChatError::UnsupportedUpload(error.to_string()))?;
            cursor = next_cursor;
            passages.extend(page_passages);
        }

        let texts: Vec<String> = passages.iter().map(|passage| passage.text.clone()).collect();
        let vectors = embedder
            .embed_batch(&texts)
            .map_err(|error| ChatError::Retrieval(error.to_string()))?;
        for (passage, vector) in passages.iter_mut().zip(vectors) {
            passage.embedding = vector;
        }

        Ok(Self { passages })
    }

    pub fn passages(&self) -> &[Passage] {
        &self.passages
    }

    pub fn is_empty(&self) -> bool {
        self.passages.is_empty()
    }

    pub fn query(&self, query_vector: &[f32], top_k: usize) -> Vec<RetrievalResult> {
        let top_k = top_k.clamp(1, search::MAX_TOP_K);
        search::rank_passages(query_vector, &self.passages, top_k)
    }
}

/// Build the transient context for one chat request. Rejects conflicting
/// inputs before any extraction or embedding happens.
pub fn transient_from_request(
    upload: Option<(&str, &[u8])>,
    raw_text: Option<&str>,
    cache: &UploadCache,
    embedder: &dyn Embedder,
    options: &IngestionOptions,
) -> Result<Option<TransientContext>, ChatError> {
    match (upload, raw_text) {
        (Some(_), Some(_)) => Err(ChatError::ConflictingContextInputs),
        (None, None) => Ok(None),
        (Some((filename, bytes)), None) => {
            if bytes.len() > MAX_UPLOAD_BYTES {
                return Err(ChatError::UnsupportedUpload(format!(
                    "upload of {} bytes exceeds the {} byte limit",
                    bytes.len(),
                    MAX_UPLOAD_BYTES
                )));
            }
            let checksum = digest_bytes(bytes);
            if let Some(passages) = cache.fetch(&checksum) {
                return Ok(Some(TransientContext::from_passages(passages)));
            }
            let context = TransientContext::from_pdf_bytes(filename, bytes, embedder, options)?;
            cache.store(checksum, context.passages.clone());
            Ok(Some(context))
        }
        (None, Some(text)) => {
            let checksum = digest_bytes(text.trim().as_bytes());
            if let Some(passages) = cache.fetch(&checksum) {
                return Ok(Some(TransientContext::from_passages(passages)));
            }
            let context = TransientContext::from_raw_text(text, embedder, options)?;
            cache.store(checksum, context.passages.clone());
            Ok(Some(context))
        }
    }
}

struct CacheSlot {
    stored_at: Instant,
    passages: Vec<Passage>,
}

/// TTL cache of extracted upload passages keyed by content hash, so a
/// re-sent document skips extraction and embedding. Holds passages only;
/// nothing here ever reaches the persisted index.
pub struct UploadCache {
    ttl: Duration,
    slots: Mutex<HashMap<String, CacheSlot>>,
}

impl Default for UploadCache {
    fn default() -> Self {
        Self::new(UPLOAD_CACHE_TTL)
    }
}

impl UploadCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn fetch(&self, checksum: &str) -> Option<Vec<Passage>> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let ttl = self.ttl;
        slots.retain(|_, slot| slot.stored_at.elapsed() < ttl);
        slots.get(checksum).map(|slot| slot.passages.clone())
    }

    pub fn store(&self, checksum: String, passages: Vec<Passage>) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.insert(
            checksum,
            CacheSlot {
                stored_at: Instant::now(),
                passages,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::CharacterNgramEmbedder;
    use crate::ingest::test_pdfs::pdf_bytes;

    #[test]
    fn raw_text_becomes_page_one_passages() {
        let embedder = CharacterNgramEmbedder::default();
        let context = TransientContext::from_raw_text(
            "The tenant withheld rent after the landlord ignored repair notices.",
            &embedder,
            &IngestionOptions::default(),
        )
        .unwrap();

        assert!(!context.is_empty());
        for passage in context.passages() {
            assert_eq!(passage.page, 1);
            assert_eq!(passage.filename, "user_document");
            assert_eq!(passage.embedding.len(), embedder.dimensions());
        }
    }

    #[test]
    fn uploaded_pdf_keeps_page_numbers() {
        let embedder = CharacterNgramEmbedder::default();
        let bytes = pdf_bytes(&["Page one of the upload.", "Page two of the upload."]);
        let context = TransientContext::from_pdf_bytes(
            "upload.pdf",
            &bytes,
            &embedder,
            &IngestionOptions::default(),
        )
        .unwrap();

        let pages: Vec<u32> = context.passages().iter().map(|p| p.page).collect();
        assert!(pages.contains(&1));
        assert!(pages.contains(&2));
    }

    #[test]
    fn oversized_uploads_are_unsupported() {
        let embedder = CharacterNgramEmbedder::default();
        let huge = vec![0u8; MAX_UPLOAD_BYTES + 1];
        let result = TransientContext::from_pdf_bytes(
            "huge.pdf",
            &huge,
            &embedder,
            &IngestionOptions::default(),
        );
        assert!(matches!(result, Err(ChatError::UnsupportedUpload(_))));
    }

    #[test]
    fn empty_raw_text_is_unsupported() {
        let embedder = CharacterNgramEmbedder::default();
        let result =
            TransientContext::from_raw_text("   ", &embedder, &IngestionOptions::default());
        assert!(matches!(result, Err(ChatError::UnsupportedUpload(_))));
    }

    #[test]
    fn conflicting_inputs_are_rejected_before_processing() {
        let embedder = CharacterNgramEmbedder::default();
        let cache = UploadCache::default();
        // Deliberately invalid bytes: the conflict must win before extraction.
        let result = transient_from_request(
            Some(("upload.pdf", b"not a pdf".as_slice())),
            Some("raw text too"),
            &cache,
            &embedder,
            &IngestionOptions::default(),
        );
        assert!(matches!(result, Err(ChatError::ConflictingContextInputs)));
    }

    #[test]
    fn no_inputs_means_no_context() {
        let embedder = CharacterNgramEmbedder::default();
        let cache = UploadCache::default();
        let context = transient_from_request(
            None,
            None,
            &cache,
            &embedder,
            &IngestionOptions::default(),
        )
        .unwrap();
        assert!(context.is_none());
    }

    #[test]
    fn repeated_uploads_hit_the_cache() {
        let embedder = CharacterNgramEmbedder::default();
        let cache = UploadCache::default();
        let text = "The insurer denied coverage citing a late notification clause.";

        let first = transient_from_request(
            None,
            Some(text),
            &cache,
            &embedder,
            &IngestionOptions::default(),
        )
        .unwrap()
        .unwrap();

        let checksum = digest_bytes(text.trim().as_bytes());
        assert!(cache.fetch(&checksum).is_some());

        let second = transient_from_request(
            None,
            Some(text),
            &cache,
            &embedder,
            &IngestionOptions::default(),
        )
        .unwrap()
        .unwrap();

        let first_ids: Vec<_> = first.passages().iter().map(|p| &p.passage_id).collect();
        let second_ids: Vec<_> = second.passages().iter().map(|p| &p.passage_id).collect();
        assert_eq!(first_ids, second_ids);
    }

    #[test]
    fn expired_cache_entries_are_dropped() {
        let cache = UploadCache::new(Duration::ZERO);
        cache.store("key".to_string(), Vec::new());
        assert!(cache.fetch("key").is_none());
    }

    #[test]
    fn transient_passages_score_like_persisted_ones() {
        let embedder = CharacterNgramEmbedder::default();
        let context = TransientContext::from_raw_text(
            "The parties signed an arbitration agreement covering all disputes.",
            &embedder,
            &IngestionOptions::default(),
        )
        .unwrap();

        let query = embedder.embed("arbitration agreement disputes").unwrap();
        let hits = context.query(&query, 3);
        assert!(!hits.is_empty());
        assert!(hits.len() <= 3);
        assert!(hits[0].score > 0.0);
    }
}
