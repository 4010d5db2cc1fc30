use crate::error::IngestError;
use crate::traits::DocumentSource;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use lopdf::Document;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info, warn};
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageText {
    pub number: u32,
    pub text: String,
}

/// How hard to try when a PDF has no extractable text layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExtractionQuality {
    /// Text layer only.
    #[default]
    Fast,
    /// Text layer, then the multimodal OCR endpoint when configured.
    High,
}

impl FromStr for ExtractionQuality {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "fast" => Ok(Self::Fast),
            "high" | "hi_res" => Ok(Self::High),
            other => Err(format!("unknown extraction quality: {other} (expected fast or high)")),
        }
    }
}

impl fmt::Display for ExtractionQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fast => f.write_str("fast"),
            Self::High => f.write_str("high"),
        }
    }
}

/// Pages of one fetched PDF plus what is needed to fingerprint it.
#[derive(Debug, Clone)]
pub struct FetchedDocument {
    pub source_label: String,
    pub checksum: String,
    pub pages: Vec<PageText>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Locator {
    Remote(Url),
    Local(PathBuf),
}

fn parse_locator(locator: &str) -> Result<Locator, IngestError> {
    let trimmed = locator.trim();
    if trimmed.is_empty() {
        return Err(IngestError::InvalidLocator("locator is empty".to_string()));
    }

    match Url::parse(trimmed) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => Ok(Locator::Remote(url)),
        Ok(url) if url.scheme() == "file" => url
            .to_file_path()
            .map(Locator::Local)
            .map_err(|_| IngestError::InvalidLocator(trimmed.to_string())),
        _ => Ok(Locator::Local(PathBuf::from(trimmed))),
    }
}

fn source_label(locator: &Locator) -> String {
    match locator {
        Locator::Remote(url) => url
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .filter(|segment| !segment.is_empty())
            .unwrap_or_else(|| url.host_str().unwrap_or("document"))
            .to_string(),
        Locator::Local(path) => path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("document")
            .to_string(),
    }
}

pub fn digest_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Reads every non-empty page of an in-memory PDF.
pub fn extract_pages(bytes: &[u8], label: &str) -> Result<Vec<PageText>, IngestError> {
    let document =
        Document::load_mem(bytes).map_err(|error| IngestError::PdfParse(error.to_string()))?;

    let mut pages = Vec::new();
    for (page_no, _page_id) in document.get_pages() {
        match document.extract_text(&[page_no]) {
            Ok(text) if !text.trim().is_empty() => pages.push(PageText {
                number: page_no,
                text,
            }),
            Ok(_) => debug!(page = page_no, "page has no text layer"),
            Err(error) => warn!(page = page_no, %error, "could not extract page text"),
        }
    }

    if pages.is_empty() {
        return Err(IngestError::PdfParse(format!(
            "pdf had no readable page text: {label}"
        )));
    }

    Ok(pages)
}

/// `{PAGE N}` header per page, then one `[NarrativeText]` line per paragraph.
pub fn render_page_marked(pages: &[PageText]) -> String {
    pages
        .iter()
        .map(|page| {
            let mut block = format!("{{PAGE {}}}", page.number);
            for paragraph in paragraphs(&page.text) {
                block.push_str("\n[NarrativeText] ");
                block.push_str(&paragraph);
            }
            block
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn paragraphs(text: &str) -> Vec<String> {
    let mut paragraphs = Vec::new();
    let mut current: Vec<&str> = Vec::new();

    for line in text.lines().map(str::trim) {
        if line.is_empty() {
            if !current.is_empty() {
                paragraphs.push(current.join(" "));
                current.clear();
            }
        } else {
            current.push(line);
        }
    }
    if !current.is_empty() {
        paragraphs.push(current.join(" "));
    }

    paragraphs
}

#[derive(Debug, Clone)]
pub struct OcrEndpointConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
}

impl OcrEndpointConfig {
    pub fn new(endpoint: impl Into<String>, api_key: Option<String>) -> Option<Self> {
        let endpoint = endpoint.into().trim().to_string();
        if endpoint.is_empty() {
            return None;
        }

        let api_key = api_key
            .map(|key| key.trim().to_string())
            .filter(|key| !key.is_empty());

        Some(Self { endpoint, api_key })
    }
}

#[derive(Debug, Clone, Serialize)]
struct LlmOcrRequest {
    pdf_base64: String,
    source_path: String,
}

#[derive(Debug, Clone, Deserialize)]
struct LlmOcrResponse {
    pages: Option<Vec<LlmOcrPage>>,
    text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct LlmOcrPage {
    #[serde(default)]
    page: Option<u32>,
    #[serde(default)]
    text: Option<String>,
}

/// Fetches PDFs by URL or path and pulls out their page text.
pub struct PdfFetcher {
    client: Client,
    ocr: Option<OcrEndpointConfig>,
}

impl PdfFetcher {
    pub fn new(client: Client, ocr: Option<OcrEndpointConfig>) -> Self {
        Self { client, ocr }
    }

    async fn read_bytes(&self, locator: &Locator, raw: &str) -> Result<Vec<u8>, IngestError> {
        match locator {
            Locator::Remote(url) => {
                let response = self.client.get(url.clone()).send().await?;
                let status = response.status();
                if !status.is_success() {
                    return Err(IngestError::Fetch {
                        locator: raw.to_string(),
                        status: status.as_u16(),
                    });
                }
                Ok(response.bytes().await?.to_vec())
            }
            Locator::Local(path) => Ok(tokio::fs::read(path).await?),
        }
    }

    async fn extract_with_ocr(
        &self,
        config: &OcrEndpointConfig,
        bytes: &[u8],
        label: &str,
    ) -> Result<Vec<PageText>, IngestError> {
        let payload = LlmOcrRequest {
            pdf_base64: STANDARD.encode(bytes),
            source_path: label.to_string(),
        };

        let mut request = self.client.post(&config.endpoint).json(&payload);
        if let Some(api_key) = &config.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(IngestError::OcrFailed(format!(
                "multimodal OCR request to {} returned {}",
                config.endpoint,
                response.status()
            )));
        }

        let payload: LlmOcrResponse = response.json().await?;
        payload_to_pages(&payload, Path::new(label))
    }
}

#[async_trait]
impl DocumentSource for PdfFetcher {
    async fn fetch_text(
        &self,
        locator: &str,
        quality: ExtractionQuality,
    ) -> Result<FetchedDocument, IngestError> {
        let parsed = parse_locator(locator)?;
        let label = source_label(&parsed);
        let bytes = self.read_bytes(&parsed, locator).await?;
        let checksum = digest_bytes(&bytes);

        let pages = match (extract_pages(&bytes, &label), quality, &self.ocr) {
            (Ok(pages), _, _) => pages,
            (Err(IngestError::PdfParse(parse_error)), ExtractionQuality::High, Some(config)) => {
                info!(%label, %parse_error, "text layer unusable, trying multimodal OCR");
                self.extract_with_ocr(config, &bytes, &label)
                    .await
                    .map_err(|ocr_error| {
                        IngestError::PdfParse(format!(
                            "{parse_error}; multimodal OCR fallback failed: {ocr_error}"
                        ))
                    })?
            }
            (Err(error), _, _) => return Err(error),
        };

        info!(%label, pages = pages.len(), %quality, "fetched document text");
        Ok(FetchedDocument {
            source_label: label,
            checksum,
            pages,
        })
    }
}

fn payload_to_pages(payload: &LlmOcrResponse, path: &Path) -> Result<Vec<PageText>, IngestError> {
    if let Some(listed) = &payload.pages {
        let listed = listed
            .iter()
            .filter_map(|page| {
                let text = page.text.as_deref().map(str::trim).unwrap_or_default();
                (!text.is_empty()).then(|| PageText {
                    number: page.page.unwrap_or(1),
                    text: text.to_string(),
                })
            })
            .collect::<Vec<_>>();

        if !listed.is_empty() {
            return Ok(listed);
        }
    }

    if let Some(raw_text) = &payload.text {
        let pages = raw_text
            .split('\u{000c}')
            .enumerate()
            .filter_map(|(index, chunk)| {
                let text = chunk.trim();
                (!text.is_empty()).then(|| PageText {
                    number: (index + 1) as u32,
                    text: text.to_string(),
                })
            })
            .collect::<Vec<_>>();

        if !pages.is_empty() {
            return Ok(pages);
        }
    }

    Err(IngestError::OcrFailed(format!(
        "multimodal OCR response was empty for {}",
        path.display()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn ocr_payload_with_pages_converts_only_nonempty_text() {
        let response = LlmOcrResponse {
            pages: Some(vec![
                LlmOcrPage {
                    page: Some(2),
                    text: Some("  ".to_string()),
                },
                LlmOcrPage {
                    page: Some(3),
                    text: Some("Page 3".to_string()),
                },
            ]),
            text: None,
        };

        let pages = payload_to_pages(&response, Path::new("x.pdf"))
            .expect("multimodal response should be parsed");

        assert_eq!(pages, vec![PageText { number: 3, text: "Page 3".to_string() }]);
    }

    #[test]
    fn ocr_payload_fallback_text_split_by_form_feed() {
        let response = LlmOcrResponse {
            pages: None,
            text: Some("First\u{000C}Second\n".to_string()),
        };

        let pages = payload_to_pages(&response, Path::new("x.pdf"))
            .expect("multimodal response should be parsed");

        assert_eq!(pages.len(), 2);
        assert_eq!(pages[1].number, 2);
        assert_eq!(pages[1].text, "Second");
    }

    #[test]
    fn locators_are_classified() {
        assert!(matches!(
            parse_locator("https://arxiv.org/pdf/2210.03629.pdf"),
            Ok(Locator::Remote(_))
        ));
        assert_eq!(
            parse_locator("./papers/react.pdf").ok(),
            Some(Locator::Local(PathBuf::from("./papers/react.pdf")))
        );
        assert!(matches!(parse_locator("  "), Err(IngestError::InvalidLocator(_))));

        let remote = parse_locator("https://arxiv.org/pdf/2210.03629.pdf").expect("url");
        assert_eq!(source_label(&remote), "2210.03629.pdf");
    }

    #[test]
    fn pages_render_with_markers_and_paragraphs() {
        let pages = vec![
            PageText {
                number: 1,
                text: "ReAct: Synergizing\nReasoning and Acting\n\nAbstract text here.".to_string(),
            },
            PageText {
                number: 2,
                text: "  Second page.  ".to_string(),
            },
        ];

        assert_eq!(
            render_page_marked(&pages),
            "{PAGE 1}\n[NarrativeText] ReAct: Synergizing Reasoning and Acting\n[NarrativeText] Abstract text here.\n\n{PAGE 2}\n[NarrativeText] Second page."
        );
    }

    #[test]
    fn quality_parses_from_cli_strings() {
        assert_eq!("HIGH".parse::<ExtractionQuality>(), Ok(ExtractionQuality::High));
        assert_eq!("hi_res".parse::<ExtractionQuality>(), Ok(ExtractionQuality::High));
        assert_eq!("fast".parse::<ExtractionQuality>(), Ok(ExtractionQuality::Fast));
        assert!("best".parse::<ExtractionQuality>().is_err());
    }

    #[test]
    fn checksum_is_reproducible() {
        assert_eq!(digest_bytes(b"abc"), digest_bytes(b"abc"));
        assert_eq!(
            digest_bytes(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn unreadable_local_pdf_is_a_hard_failure() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("broken.pdf");
        fs::write(&path, b"%PDF-1.4\n%broken")?;

        let fetcher = PdfFetcher::new(
            Client::new(),
            OcrEndpointConfig::new("http://127.0.0.1:9/ocr", None),
        );
        let locator = path.to_string_lossy().to_string();

        let fast = fetcher.fetch_text(&locator, ExtractionQuality::Fast).await;
        assert!(matches!(fast, Err(IngestError::PdfParse(_))));

        let missing = fetcher
            .fetch_text(&dir.path().join("missing.pdf").to_string_lossy(), ExtractionQuality::Fast)
            .await;
        assert!(matches!(missing, Err(IngestError::Io(_))));
        Ok(())
    }

    #[test]
    fn blank_ocr_endpoint_disables_fallback() {
        assert!(OcrEndpointConfig::new("  ", Some("key".to_string())).is_none());
        let config = OcrEndpointConfig::new("http://ocr", Some(" ".to_string())).expect("endpoint");
        assert_eq!(config.api_key, None);
    }
}
