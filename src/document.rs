//! Input documents.
//!
//! A [`Document`] is an immutable reference to the `.docx` being processed:
//! either a path on disk or bytes already in memory (an upload, a download).
//! No stage ever mutates it; stages that need the content call
//! [`Document::read_bytes`] and work on their own copy.

use crate::error::DocQrError;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Where the document's bytes live.
#[derive(Debug, Clone)]
enum Source {
    Path(PathBuf),
    Bytes(Arc<[u8]>),
}

/// An input document.
#[derive(Debug, Clone)]
pub struct Document {
    filename: String,
    source: Source,
}

/// Check if the input string looks like a URL.
pub fn is_url(input: &str) -> bool {
    input.starts_with("http://") || input.starts_with("https://")
}

impl Document {
    /// Reference a document on disk.
    ///
    /// Existence and read permission are checked here so a bad CLI argument is
    /// reported before a run is started. Content validation (is this really a
    /// `.docx`?) is left to the Extract stage, which records it in history.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, DocQrError> {
        let path = path.as_ref().to_path_buf();
        match std::fs::File::open(&path) {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                return Err(DocQrError::PermissionDenied { path });
            }
            Err(_) => return Err(DocQrError::FileNotFound { path }),
        }
        let filename = input_filename(&path.to_string_lossy());
        debug!("Resolved local document: {}", path.display());
        Ok(Self {
            filename,
            source: Source::Path(path),
        })
    }

    /// Wrap bytes already in memory (e.g. an upload).
    pub fn from_bytes(filename: impl Into<String>, bytes: impl Into<Arc<[u8]>>) -> Self {
        Self {
            filename: filename.into(),
            source: Source::Bytes(bytes.into()),
        }
    }

    /// Download a document over HTTP(S) into memory.
    pub async fn fetch(url: &str, timeout: Duration) -> Result<Self, DocQrError> {
        if !is_url(url) {
            return Err(DocQrError::InvalidInput {
                input: url.to_string(),
            });
        }
        info!("Downloading document from: {}", url);

        let download_err = |reason: String| DocQrError::DownloadFailed {
            url: url.to_string(),
            reason,
        };

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| download_err(e.to_string()))?;

        let response = client.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                DocQrError::DownloadTimeout {
                    url: url.to_string(),
                    secs: timeout.as_secs(),
                }
            } else {
                download_err(e.to_string())
            }
        })?;

        if !response.status().is_success() {
            return Err(download_err(format!("HTTP {}", response.status())));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| download_err(e.to_string()))?;

        let filename = filename_from_url(url);
        info!("Downloaded {} ({} bytes)", filename, bytes.len());
        Ok(Self::from_bytes(filename, bytes.to_vec()))
    }

    /// Original filename, including extension.
    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// Filename without its extension; used to name outputs and e-mail subjects.
    pub fn stem(&self) -> &str {
        Path::new(&self.filename)
            .file_stem()
            .and_then(|s| s.to_str())
            .filter(|s| !s.is_empty())
            .unwrap_or("document")
    }

    /// Path on disk, when the document was opened from one.
    pub fn path(&self) -> Option<&Path> {
        match &self.source {
            Source::Path(p) => Some(p),
            Source::Bytes(_) => None,
        }
    }

    /// Read the full content.
    pub async fn read_bytes(&self) -> std::io::Result<Arc<[u8]>> {
        match &self.source {
            Source::Bytes(b) => Ok(Arc::clone(b)),
            Source::Path(p) => Ok(tokio::fs::read(p).await?.into()),
        }
    }
}

/// Filename a CLI argument refers to, without touching disk or network.
pub fn input_filename(input: &str) -> String {
    if is_url(input) {
        return filename_from_url(input);
    }
    Path::new(input)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "document.docx".to_string())
}

/// Extract a reasonable filename from the URL path.
fn filename_from_url(url: &str) -> String {
    reqwest::Url::parse(url)
        .ok()
        .and_then(|parsed| {
            parsed
                .path_segments()
                .and_then(|mut segments| segments.next_back().map(str::to_string))
        })
        .filter(|last| !last.is_empty() && last.contains('.'))
        .unwrap_or_else(|| "downloaded.docx".to_string())
}
