use crate::embeddings::Embedder;
use crate::error::IndexError;
use crate::models::{Passage, RetrievalResult};
use crate::search;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

pub const INDEX_FORMAT_VERSION: u32 = 1;

const MANIFEST_FILE: &str = "manifest.json";
const PASSAGES_FILE: &str = "passages.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexManifest {
    pub format_version: u32,
    pub embedding_model: String,
    pub dimensions: usize,
    pub passage_count: usize,
    pub built_at: DateTime<Utc>,
}

/// The persisted retrieval structure: all passages with their embeddings
/// plus a manifest pinning the embedding model they were built with.
/// Immutable while serving; queries are read-only.
#[derive(Debug)]
pub struct VectorIndex {
    manifest: IndexManifest,
    passages: Vec<Passage>,
}

impl VectorIndex {
    pub fn from_passages(
        passages: Vec<Passage>,
        embedder: &dyn Embedder,
    ) -> Result<Self, IndexError> {
        validate_passages(&passages, embedder.dimensions())?;

        Ok(Self {
            manifest: IndexManifest {
                format_version: INDEX_FORMAT_VERSION,
                embedding_model: embedder.model_id().to_string(),
                dimensions: embedder.dimensions(),
                passage_count: passages.len(),
                built_at: Utc::now(),
            },
            passages,
        })
    }

    pub fn manifest(&self) -> &IndexManifest {
        &self.manifest
    }

    pub fn passages(&self) -> &[Passage] {
        &self.passages
    }

    pub fn passage_count(&self) -> usize {
        self.passages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.passages.is_empty()
    }

    pub fn query(&self, query_vector: &[f32], top_k: usize) -> Vec<RetrievalResult> {
        let top_k = top_k.clamp(1, search::MAX_TOP_K);
        search::rank_passages(query_vector, &self.passages, top_k)
    }

    /// Write the artifact next to its final location and swap it in with a
    /// rename, so a reader never observes a partially written index and a
    /// failed write leaves any prior artifact untouched.
    pub fn save(&self, index_dir: &Path) -> Result<(), IndexError> {
        let name = index_dir
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| {
                IndexError::InvalidIndexDir(index_dir.to_string_lossy().to_string())
            })?;
        let parent = match index_dir.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent)?;

        let nonce = format!("{}-{}", std::process::id(), Utc::now().timestamp_millis());
        let staging = parent.join(format!("{name}.tmp-{nonce}"));
        if staging.exists() {
            fs::remove_dir_all(&staging)?;
        }
        fs::create_dir_all(&staging)?;

        fs::write(
            staging.join(MANIFEST_FILE),
            serde_json::to_vec_pretty(&self.manifest)?,
        )?;
        fs::write(
            staging.join(PASSAGES_FILE),
            serde_json::to_vec(&self.passages)?,
        )?;

        if index_dir.exists() {
            let retired = parent.join(format!("{name}.old-{nonce}"));
            if retired.exists() {
                fs::remove_dir_all(&retired)?;
            }
            fs::rename(index_dir, &retired)?;
            if let Err(error) = fs::rename(&staging, index_dir) {
                // Put the previous artifact back before reporting.
                let _ = fs::rename(&retired, index_dir);
                let _ = fs::remove_dir_all(&staging);
                return Err(error.into());
            }
            let _ = fs::remove_dir_all(&retired);
        } else {
            fs::rename(&staging, index_dir)?;
        }

        Ok(())
    }

    /// Serving must not start without a valid artifact built by the same
    /// embedding model.
    pub fn load_or_fail(index_dir: &Path, embedder: &dyn Embedder) -> Result<Self, IndexError> {
        let manifest_path = index_dir.join(MANIFEST_FILE);
        let passages_path = index_dir.join(PASSAGES_FILE);

        if !manifest_path.is_file() || !passages_path.is_file() {
            return Err(IndexError::Missing(index_dir.to_path_buf()));
        }

        let manifest: IndexManifest = serde_json::from_str(&fs::read_to_string(&manifest_path)?)
            .map_err(|error| IndexError::Corrupt(format!("manifest: {error}")))?;

        if manifest.format_version != INDEX_FORMAT_VERSION {
            return Err(IndexError::Corrupt(format!(
                "unsupported format version {}",
                manifest.format_version
            )));
        }
        if manifest.embedding_model != embedder.model_id() {
            return Err(IndexError::Corrupt(format!(
                "index was built with embedding model {} but {} is configured",
                manifest.embedding_model,
                embedder.model_id()
            )));
        }
        if manifest.dimensions != embedder.dimensions() {
            return Err(IndexError::Corrupt(format!(
                "index dimensions {} do not match embedder dimensions {}",
                manifest.dimensions,
                embedder.dimensions()
            )));
        }

        let passages: Vec<Passage> = serde_json::from_str(&fs::read_to_string(&passages_path)?)
            .map_err(|error| IndexError::Corrupt(format!("passages: {error}")))?;

        if passages.len() != manifest.passage_count {
            return Err(IndexError::Corrupt(format!(
                "manifest lists {} passages but artifact holds {}",
                manifest.passage_count,
                passages.len()
            )));
        }
        validate_passages(&passages, manifest.dimensions)?;

        Ok(Self { manifest, passages })
    }
}

fn validate_passages(passages: &[Passage], dimensions: usize) -> Result<(), IndexError> {
    let mut seen = HashSet::new();
    for passage in passages {
        if !seen.insert(passage.passage_id.as_str()) {
            return Err(IndexError::Corrupt(format!(
                "duplicate passage id {}",
                passage.passage_id
            )));
        }
        if passage.embedding.len() != dimensions {
            return Err(IndexError::Corrupt(format!(
                "passage {} has embedding dimension {} instead of {}",
                passage.passage_id,
                passage.embedding.len(),
                dimensions
            )));
        }
    }
    Ok(())
}
