pub mod agent;
pub mod builder;
pub mod chunking;
pub mod citations;
pub mod embeddings;
pub mod error;
pub mod extractor;
mod http;
pub mod index;
pub mod ingest;
pub mod llm;
pub mod models;
pub mod search;
pub mod session;
pub mod transient;

pub use agent::{AgentConfig, AgentOutcome, ReasoningAgent, DEFAULT_MAX_STEPS};
pub use builder::{build_or_rebuild, BuildReport};
pub use chunking::{build_passages, normalize_whitespace, split_with_overlap, ChunkingConfig};
pub use citations::resolve_citations;
pub use embeddings::{
    CharacterNgramEmbedder, Embedder, RemoteEmbedder, DEFAULT_EMBEDDING_DIMENSIONS,
};
pub use error::{ChatError, IndexError, IngestError};
pub use extractor::{extract_page_texts, LopdfExtractor, PageText, PdfExtractor};
pub use index::{IndexManifest, VectorIndex, INDEX_FORMAT_VERSION};
pub use ingest::{
    digest_bytes, digest_file, discover_pdf_files, ingest_corpus_best_effort, CorpusReport,
    SkippedDocument,
};
pub use llm::{ChatMessage, HttpModelClient, LanguageModel};
pub use models::{
    Citation, DocumentFingerprint, IngestionOptions, Passage, RetrievalResult,
};
pub use search::{clamp_top_k, DEFAULT_TOP_K, MAX_TOP_K, MIN_RELEVANCE};
pub use session::{ChatSession, SessionStore};
pub use transient::{
    transient_from_request, TransientContext, UploadCache, MAX_UPLOAD_BYTES,
    MAX_UPLOAD_TEXT_CHARS,
};
