use crate::error::IngestError;
use crate::http;
use base64::{engine::general_purpose::STANDARD, Engine};
use lopdf::Document;
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone)]
pub struct PageText {
    pub number: u32,
    pub text: String,
}

pub trait PdfExtractor {
    fn extract_pages(&self, path: &Path) -> Result<Vec<PageText>, IngestError>;

    fn extract_pages_from_bytes(&self, bytes: &[u8]) -> Result<Vec<PageText>, IngestError>;
}

#[derive(Default)]
pub struct LopdfExtractor;

impl LopdfExtractor {
    fn collect_pages(document: &Document) -> Result<Vec<PageText>, IngestError> {
        let mut pages = Vec::new();

        for (page_number, _object_id) in document.get_pages() {
            let text = document
                .extract_text(&[page_number])
                .map_err(|error| IngestError::Unreadable(error.to_string()))?;

            if !text.trim().is_empty() {
                pages.push(PageText {
                    number: page_number,
                    text,
                });
            }
        }

        if pages.is_empty() {
            return Err(IngestError::Unreadable(
                "document has no readable page text".to_string(),
            ));
        }

        Ok(pages)
    }
}

impl PdfExtractor for LopdfExtractor {
    fn extract_pages(&self, path: &Path) -> Result<Vec<PageText>, IngestError> {
        let document =
            Document::load(path).map_err(|error| IngestError::Unreadable(error.to_string()))?;
        Self::collect_pages(&document)
    }

    fn extract_pages_from_bytes(&self, bytes: &[u8]) -> Result<Vec<PageText>, IngestError> {
        let document =
            Document::load_mem(bytes).map_err(|error| IngestError::Unreadable(error.to_string()))?;
        Self::collect_pages(&document)
    }
}

/// Native extraction first; when that fails and an OCR endpoint is
/// configured, try to recover scanned documents through it.
pub fn extract_page_texts(path: &Path) -> Result<Vec<PageText>, IngestError> {
    match LopdfExtractor.extract_pages(path) {
        Ok(pages) => Ok(pages),
        Err(IngestError::Unreadable(reason)) => match OcrFallback::from_env() {
            Some(ocr) => ocr.recover(path).map_err(|ocr_error| {
                IngestError::Unreadable(format!("{reason}; ocr fallback failed: {ocr_error}"))
            }),
            None => Err(IngestError::Unreadable(reason)),
        },
        Err(other) => Err(other),
    }
}

#[derive(Debug, Clone, Serialize)]
struct OcrRequest {
    pdf_base64: String,
    source_path: String,
}

#[derive(Debug, Clone, Deserialize)]
struct OcrResponse {
    pages: Option<Vec<OcrPage>>,
    text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct OcrPage {
    #[serde(default)]
    page: Option<u32>,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Clone)]
pub struct OcrFallback {
    endpoint: String,
    api_key: Option<String>,
}

impl OcrFallback {
    pub fn from_env() -> Option<Self> {
        let endpoint = std::env::var("LLM_OCR_ENDPOINT").ok()?;
        let endpoint = endpoint.trim().to_string();
        if endpoint.is_empty() {
            return None;
        }

        let api_key = std::env::var("LLM_OCR_API_KEY")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .map(|value| value.trim().to_string());

        Some(Self { endpoint, api_key })
    }

    pub fn recover(&self, path: &Path) -> Result<Vec<PageText>, IngestError> {
        http::call_blocking(|| self.recover_blocking(path))
    }

    fn recover_blocking(&self, path: &Path) -> Result<Vec<PageText>, IngestError> {
        let pdf = std::fs::read(path)?;
        let payload = OcrRequest {
            pdf_base64: STANDARD.encode(pdf),
            source_path: path.to_string_lossy().to_string(),
        };

        let mut request = Client::builder()
            .timeout(http::REQUEST_TIMEOUT)
            .build()?
            .post(&self.endpoint)
            .json(&payload);

        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request.send()?;
        if !response.status().is_success() {
            return Err(IngestError::OcrFailed(format!(
                "ocr endpoint {} returned {}",
                self.endpoint,
                response.status()
            )));
        }

        let payload: OcrResponse = response.json()?;
        ocr_payload_to_pages(&payload)
    }
}

fn ocr_payload_to_pages(payload: &OcrResponse) -> Result<Vec<PageText>, IngestError> {
    if let Some(listed) = &payload.pages {
        let pages: Vec<PageText> = listed
            .iter()
            .filter_map(|entry| {
                let text = entry.text.as_deref().map(str::trim).unwrap_or_default();
                if text.is_empty() {
                    None
                } else {
                    Some(PageText {
                        number: entry.page.unwrap_or(1),
                        text: text.to_string(),
                    })
                }
            })
            .collect();

        if !pages.is_empty() {
            return Ok(pages);
        }
    }

    // Some endpoints return one blob with form-feed page breaks.
    if let Some(raw) = &payload.text {
        let pages: Vec<PageText> = raw
            .split('\u{000c}')
            .enumerate()
            .filter_map(|(index, block)| {
                let text = block.trim();
                if text.is_empty() {
                    None
                } else {
                    Some(PageText {
                        number: (index + 1) as u32,
                        text: text.to_string(),
                    })
                }
            })
            .collect();

        if !pages.is_empty() {
            return Ok(pages);
        }
    }

    Err(IngestError::OcrFailed(
        "ocr response contained no readable text".to_string(),
    ))
}
