//! DOCX → PDF conversion.
//!
//! Two backends implement [`DocumentConverter`]:
//!
//! * [`LocalConverter`]: headless LibreOffice (`soffice`) on this machine.
//!   Deterministic and offline; the orchestrator gives it a single attempt.
//! * [`RemoteConverter`]: the CloudConvert v2 jobs API. Subject to quotas and
//!   outages, so the orchestrator retries it.
//!
//! Either way the result is checked to be a parseable PDF before it leaves
//! this module.

use crate::document::Document;
use crate::error::{ConversionError, ConversionFailure, DocQrError};
use crate::output::PdfArtifact;
use crate::pipeline::annotate::page_count;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::StatusCode;
use serde::Deserialize;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info};

/// Produces a PDF rendition of a `.docx` document.
#[async_trait]
pub trait DocumentConverter: Send + Sync {
    async fn convert(&self, doc: &Document) -> Result<PdfArtifact, ConversionError>;

    /// Whether the backend talks to an external service (and is worth retrying).
    fn is_remote(&self) -> bool;
}

/// Validate converter output and wrap it as an artefact.
fn into_artifact(bytes: Vec<u8>) -> Result<PdfArtifact, ConversionError> {
    if !bytes.starts_with(b"%PDF") {
        return Err(ConversionError::new(
            ConversionFailure::MalformedInput,
            "converter output is not a PDF",
        ));
    }
    let pages = page_count(&bytes).map_err(|e| {
        ConversionError::new(
            ConversionFailure::MalformedInput,
            format!("converter output could not be parsed: {e}"),
        )
    })?;
    Ok(PdfArtifact {
        bytes: bytes.into(),
        page_count: pages,
        has_qr_header: false,
    })
}

// ── LibreOffice ──────────────────────────────────────────────────────────

/// Converter shelling out to `soffice --headless --convert-to pdf`.
#[derive(Debug, Clone)]
pub struct LocalConverter {
    program: PathBuf,
    timeout: Duration,
}

impl Default for LocalConverter {
    fn default() -> Self {
        Self {
            program: PathBuf::from("soffice"),
            timeout: Duration::from_secs(60),
        }
    }
}

impl LocalConverter {
    pub fn new(program: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }
}

#[async_trait]
impl DocumentConverter for LocalConverter {
    async fn convert(&self, doc: &Document) -> Result<PdfArtifact, ConversionError> {
        let io_err = |e: std::io::Error| {
            ConversionError::new(ConversionFailure::ToolUnavailable, format!("scratch dir: {e}"))
        };
        let workdir = tempfile::TempDir::new().map_err(io_err)?;
        let input_path = workdir.path().join(format!("{}.docx", doc.stem()));
        let bytes = doc.read_bytes().await.map_err(|e| {
            ConversionError::new(ConversionFailure::MalformedInput, e.to_string())
        })?;
        tokio::fs::write(&input_path, &bytes[..]).await.map_err(io_err)?;
        let out_dir = workdir.path().join("out");

        let mut cmd = Command::new(&self.program);
        cmd.arg("--headless")
            .arg("--convert-to")
            .arg("pdf")
            .arg("--outdir")
            .arg(&out_dir)
            .arg(&input_path)
            // A private profile keeps concurrent runs from fighting over the
            // user's LibreOffice lock file.
            .arg(format!(
                "-env:UserInstallation=file://{}",
                workdir.path().join("profile").display()
            ))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|e| {
            let reason = if e.kind() == std::io::ErrorKind::NotFound {
                format!(
                    "'{}' not found; install LibreOffice or configure the remote converter",
                    self.program.display()
                )
            } else {
                e.to_string()
            };
            ConversionError::new(ConversionFailure::ToolUnavailable, reason)
        })?;

        let output = timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                ConversionError::new(
                    ConversionFailure::Timeout,
                    format!("LibreOffice did not finish within {}s", self.timeout.as_secs()),
                )
            })?
            .map_err(|e| ConversionError::new(ConversionFailure::ToolUnavailable, e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ConversionError::new(
                ConversionFailure::MalformedInput,
                format!("LibreOffice exited with {}: {}", output.status, stderr.trim()),
            ));
        }

        let pdf_path = out_dir.join(format!("{}.pdf", doc.stem()));
        let pdf = tokio::fs::read(&pdf_path).await.map_err(|e| {
            ConversionError::new(
                ConversionFailure::MalformedInput,
                format!("LibreOffice produced no PDF ({}): {e}", pdf_path.display()),
            )
        })?;
        debug!("LibreOffice produced {} bytes", pdf.len());
        into_artifact(pdf)
    }

    fn is_remote(&self) -> bool {
        false
    }
}

// ── CloudConvert ─────────────────────────────────────────────────────────

const CLOUDCONVERT_ENDPOINT: &str = "https://api.cloudconvert.com/v2";

/// Converter backed by the CloudConvert jobs API.
#[derive(Clone)]
pub struct RemoteConverter {
    http: reqwest::Client,
    api_key: String,
    endpoint: String,
    poll_interval: Duration,
    max_wait: Duration,
}

impl std::fmt::Debug for RemoteConverter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteConverter")
            .field("endpoint", &self.endpoint)
            .field("poll_interval", &self.poll_interval)
            .field("max_wait", &self.max_wait)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
struct JobEnvelope {
    data: Job,
}

#[derive(Debug, Deserialize)]
struct Job {
    id: String,
    status: String,
    #[serde(default)]
    tasks: Vec<Task>,
}

#[derive(Debug, Deserialize)]
struct Task {
    #[serde(default)]
    name: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    result: Option<TaskResult>,
}

#[derive(Debug, Deserialize)]
struct TaskResult {
    #[serde(default)]
    files: Vec<ExportedFile>,
}

#[derive(Debug, Deserialize)]
struct ExportedFile {
    url: String,
}

const IMPORT_TASK: &str = "import-docx";
const CONVERT_TASK: &str = "convert-pdf";
const EXPORT_TASK: &str = "export-pdf";

impl RemoteConverter {
    pub fn new(api_key: impl Into<String>, request_timeout: Duration) -> Result<Self, DocQrError> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| DocQrError::Internal(format!("HTTP client: {e}")))?;
        Ok(Self {
            http,
            api_key: api_key.into(),
            endpoint: CLOUDCONVERT_ENDPOINT.to_string(),
            poll_interval: Duration::from_secs(2),
            max_wait: Duration::from_secs(60),
        })
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_polling(mut self, interval: Duration, max_wait: Duration) -> Self {
        self.poll_interval = interval;
        self.max_wait = max_wait;
        self
    }

    async fn create_job(&self, doc: &Document) -> Result<Job, ConversionError> {
        let bytes = doc.read_bytes().await.map_err(|e| {
            ConversionError::new(ConversionFailure::MalformedInput, e.to_string())
        })?;
        let payload = serde_json::json!({
            "tasks": {
                IMPORT_TASK: {
                    "operation": "import/base64",
                    "file": STANDARD.encode(&bytes[..]),
                    "filename": format!("{}.docx", doc.stem()),
                },
                CONVERT_TASK: {
                    "operation": "convert",
                    "input": IMPORT_TASK,
                    "input_format": "docx",
                    "output_format": "pdf",
                },
                EXPORT_TASK: {
                    "operation": "export/url",
                    "input": CONVERT_TASK,
                },
            }
        });
        let response = self
            .http
            .post(format!("{}/jobs", self.endpoint))
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(network_error)?;
        parse_job(response).await
    }

    async fn get_job(&self, id: &str) -> Result<Job, ConversionError> {
        let response = self
            .http
            .get(format!("{}/jobs/{}", self.endpoint, id))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(network_error)?;
        parse_job(response).await
    }
}

fn network_error(e: reqwest::Error) -> ConversionError {
    let reason = if e.is_timeout() {
        ConversionFailure::Timeout
    } else {
        ConversionFailure::ServiceUnavailable
    };
    ConversionError::new(reason, e.to_string())
}

fn classify_status(status: StatusCode, body: &str) -> ConversionError {
    let reason = match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ConversionFailure::Auth,
        StatusCode::PAYMENT_REQUIRED | StatusCode::TOO_MANY_REQUESTS => {
            ConversionFailure::QuotaExceeded
        }
        s if s.is_server_error() => ConversionFailure::ServiceUnavailable,
        _ => ConversionFailure::MalformedInput,
    };
    let snippet: String = body.chars().take(200).collect();
    ConversionError::new(reason, format!("HTTP {status}: {snippet}"))
}

async fn parse_job(response: reqwest::Response) -> Result<Job, ConversionError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(classify_status(status, &body));
    }
    let envelope: JobEnvelope = response.json().await.map_err(|e| {
        ConversionError::new(
            ConversionFailure::ServiceUnavailable,
            format!("unexpected job payload: {e}"),
        )
    })?;
    Ok(envelope.data)
}

/// Interpret a job snapshot: `Ok(Some(url))` when done, `Ok(None)` while
/// pending, `Err` when the job failed.
fn job_outcome(job: &Job) -> Result<Option<String>, ConversionError> {
    match job.status.as_str() {
        "finished" => job
            .tasks
            .iter()
            .find(|t| t.name == EXPORT_TASK)
            .and_then(|t| t.result.as_ref())
            .and_then(|r| r.files.first())
            .map(|f| Some(f.url.clone()))
            .ok_or_else(|| {
                ConversionError::new(
                    ConversionFailure::ServiceUnavailable,
                    "finished job has no export URL",
                )
            }),
        "error" => {
            let message = job
                .tasks
                .iter()
                .find(|t| t.status == "error")
                .and_then(|t| t.message.clone())
                .unwrap_or_else(|| "conversion job failed".to_string());
            Err(ConversionError::new(
                ConversionFailure::MalformedInput,
                message,
            ))
        }
        _ => Ok(None),
    }
}

#[async_trait]
impl DocumentConverter for RemoteConverter {
    async fn convert(&self, doc: &Document) -> Result<PdfArtifact, ConversionError> {
        let mut job = self.create_job(doc).await?;
        info!("CloudConvert job {} created", job.id);

        let deadline = Instant::now() + self.max_wait;
        let url = loop {
            if let Some(url) = job_outcome(&job)? {
                break url;
            }
            if Instant::now() >= deadline {
                return Err(ConversionError::new(
                    ConversionFailure::Timeout,
                    format!(
                        "job {} still '{}' after {}s",
                        job.id,
                        job.status,
                        self.max_wait.as_secs()
                    ),
                ));
            }
            sleep(self.poll_interval).await;
            job = self.get_job(&job.id).await?;
            debug!("CloudConvert job {}: {}", job.id, job.status);
        };

        let response = self.http.get(&url).send().await.map_err(network_error)?;
        if !response.status().is_success() {
            return Err(classify_status(response.status(), ""));
        }
        let pdf = response.bytes().await.map_err(network_error)?;
        into_artifact(pdf.to_vec())
    }

    fn is_remote(&self) -> bool {
        true
    }
}
