use crate::chunking::build_passages;
use crate::error::IngestError;
use crate::extractor::extract_page_texts;
use crate::models::{DocumentFingerprint, IngestionOptions, Passage};
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

pub fn discover_pdf_files(corpus_dir: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();

    for entry in WalkDir::new(corpus_dir)
        .into_iter()
        .filter_map(|item| item.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }

        let is_pdf = entry
            .path()
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("pdf"));

        if is_pdf {
            files.push(entry.path().to_path_buf());
        }
    }

    // Stable ordering keeps rebuilds of an unchanged corpus deterministic.
    files.sort_unstable();
    files
}

pub fn digest_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

pub fn digest_file(path: &Path) -> Result<String, IngestError> {
    Ok(digest_bytes(&fs::read(path)?))
}

pub struct SkippedDocument {
    pub path: PathBuf,
    pub reason: String,
}

pub struct CorpusReport {
    pub passages: Vec<Passage>,
    pub documents: Vec<DocumentFingerprint>,
    pub skipped: Vec<SkippedDocument>,
}

/// Ingest every PDF under `corpus_dir`. One unreadable document never aborts
/// the run; it is recorded and the rest of the corpus proceeds. An empty
/// corpus yields an empty report, which callers may treat as a warning.
pub fn ingest_corpus_best_effort(
    corpus_dir: &Path,
    options: &IngestionOptions,
) -> Result<CorpusReport, IngestError> {
    let files = discover_pdf_files(corpus_dir);

    let mut passages = Vec::new();
    let mut documents = Vec::new();
    let mut skipped = Vec::new();
    let mut cursor = 0u64;

    for path in files {
        let outcome = (|| {
            let fingerprint = fingerprint_document(&path)?;
            let pages = extract_page_texts(&path)?;
            let mut document_passages = Vec::new();

            for page in pages {
                let (page_passages, next_cursor) =
                    build_passages(&fingerprint, page.number, &page.text, options, cursor)?;
                cursor = next_cursor;
                document_passages.extend(page_passages);
            }

            Ok::<_, IngestError>((fingerprint, document_passages))
        })();

        match outcome {
            Ok((fingerprint, document_passages)) => {
                documents.push(fingerprint);
                passages.extend(document_passages);
            }
            Err(error) => skipped.push(SkippedDocument {
                path,
                reason: error.to_string(),
            }),
        }
    }

    Ok(CorpusReport {
        passages,
        documents,
        skipped,
    })
}

fn fingerprint_document(path: &Path) -> Result<DocumentFingerprint, IngestError> {
    let checksum = digest_file(path)?;
    let filename = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| {
            IngestError::MissingFileName(format!("path missing filename: {}", path.display()))
        })?;

    Ok(DocumentFingerprint {
        document_id: digest_bytes(path.to_string_lossy().as_bytes()),
        filename: filename.to_string(),
        source_path: path.to_string_lossy().to_string(),
        checksum,
        ingested_at: Utc::now(),
    })
}
