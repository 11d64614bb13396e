use crate::embeddings::Embedder;
use crate::error::{IndexError, IngestError};
use crate::index::VectorIndex;
use crate::ingest::{ingest_corpus_best_effort, SkippedDocument};
use crate::models::{IngestionOptions, Passage};
use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const EMBED_BATCH_SIZE: usize = 32;

/// Exclusive lock over one index directory for the duration of a build.
/// Held as a sibling `.lock` file taken with `create_new`; released on drop.
struct BuildLock {
    path: PathBuf,
}

impl BuildLock {
    fn acquire(index_dir: &Path) -> Result<Self, IndexError> {
        let path = lock_path(index_dir)?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(_) => Ok(Self { path }),
            Err(error) if error.kind() == io::ErrorKind::AlreadyExists => {
                Err(IndexError::BuildInProgress(index_dir.to_path_buf()))
            }
            Err(error) => Err(error.into()),
        }
    }
}

impl Drop for BuildLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn lock_path(index_dir: &Path) -> Result<PathBuf, IndexError> {
    let name = index_dir
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| IndexError::InvalidIndexDir(index_dir.to_string_lossy().to_string()))?;
    let parent = match index_dir.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    Ok(parent.join(format!("{name}.lock")))
}

pub struct BuildReport {
    pub index: VectorIndex,
    pub document_count: usize,
    pub skipped: Vec<SkippedDocument>,
}

/// Full corpus (re)build: ingest every document, embed all passages, write a
/// fresh artifact and swap it in. A prior artifact stays valid until the
/// swap, and stays untouched if anything before it fails.
pub fn build_or_rebuild(
    corpus_dir: &Path,
    index_dir: &Path,
    embedder: &dyn Embedder,
    options: &IngestionOptions,
) -> Result<BuildReport, IndexError> {
    let _lock = BuildLock::acquire(index_dir)?;

    let report = ingest_corpus_best_effort(corpus_dir, options)?;
    for skipped in &report.skipped {
        warn!(path = %skipped.path.display(), reason = %skipped.reason, "skipped unreadable document");
    }
    if report.passages.is_empty() {
        warn!(corpus = %corpus_dir.display(), "no readable documents found; building an empty index");
    }

    let mut passages = report.passages;
    embed_passages(&mut passages, embedder)?;

    let index = VectorIndex::from_passages(passages, embedder)?;
    index.save(index_dir)?;

    info!(
        passages = index.passage_count(),
        documents = report.documents.len(),
        index = %index_dir.display(),
        "index build complete"
    );

    Ok(BuildReport {
        index,
        document_count: report.documents.len(),
        skipped: report.skipped,
    })
}

fn embed_passages(passages: &mut [Passage], embedder: &dyn Embedder) -> Result<(), IngestError> {
    for batch in passages.chunks_mut(EMBED_BATCH_SIZE) {
        let texts: Vec<String> = batch.iter().map(|passage| passage.text.clone()).collect();
        let vectors = embedder.embed_batch(&texts)?;

        if vectors.len() != batch.len() {
            return Err(IngestError::Embedding(format!(
                "embedder returned {} vectors for a batch of {}",
                vectors.len(),
                batch.len()
            )));
        }
        for (passage, vector) in batch.iter_mut().zip(vectors) {
            passage.embedding = vector;
        }
    }
    Ok(())
}
