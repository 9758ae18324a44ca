//! Configuration types.
//!
//! Two layers, deliberately kept apart:
//!
//! * [`AppConfig`]: the persisted key–value file (`config.json`): credentials,
//!   backend selection, output and history locations, SMTP relay. Loaded once
//!   and used to build a [`crate::Pipeline`].
//! * [`ProcessOptions`]: per-run knobs (recipient, summary length, label,
//!   degraded-output permission…), built via [`ProcessOptionsBuilder`].
//!
//! Both are plain values passed by reference into the pipeline, so concurrent
//! runs never share a mutable view of the configuration.

use crate::error::DocQrError;
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Default relay (Gmail, authenticated with an app password).
pub const DEFAULT_SMTP_SERVER: &str = "smtp.gmail.com";
/// STARTTLS submission port.
pub const DEFAULT_SMTP_PORT: u16 = 587;
/// Default Gemini model for summaries.
pub const DEFAULT_GEMINI_MODEL: &str = "gemini-2.0-flash";

// ── Persisted configuration ──────────────────────────────────────────────

/// Persisted application configuration.
///
/// Every field is optional in the JSON file; a missing file yields
/// [`AppConfig::default()`].
///
/// ```json
/// {
///   "gemini_api_key": "…",
///   "output_dir": "output",
///   "email": { "sender": "cartorio@example.com", "password": "app-password",
///              "smtp_server": "smtp.gmail.com", "smtp_port": 587 }
/// }
/// ```
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Gemini API key. When absent the summarizer falls back to any provider
    /// `edgequake-llm` can auto-detect from the environment.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gemini_api_key: Option<String>,

    /// Gemini model identifier. Default: [`DEFAULT_GEMINI_MODEL`].
    pub gemini_model: String,

    /// CloudConvert API key for the remote converter.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cloudconvert_api_key: Option<String>,

    /// Converter backend. `None` picks remote when a CloudConvert key is
    /// present, local LibreOffice otherwise.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub converter: Option<ConverterKind>,

    /// QR rendering backend. Default: local.
    pub qr_backend: QrBackendKind,

    /// Directory receiving final PDFs (and QR images). Default: `output`.
    pub output_dir: PathBuf,

    /// History log location. Default: `<output_dir>/history.jsonl`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub history_path: Option<PathBuf>,

    /// SMTP relay settings.
    pub email: EmailConfig,

    /// Retry schedule shared by every external-service stage.
    pub retry: RetrySettings,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            gemini_api_key: None,
            gemini_model: DEFAULT_GEMINI_MODEL.to_string(),
            cloudconvert_api_key: None,
            converter: None,
            qr_backend: QrBackendKind::default(),
            output_dir: PathBuf::from("output"),
            history_path: None,
            email: EmailConfig::default(),
            retry: RetrySettings::default(),
        }
    }
}

impl fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppConfig")
            .field("gemini_api_key", &redact(&self.gemini_api_key))
            .field("gemini_model", &self.gemini_model)
            .field("cloudconvert_api_key", &redact(&self.cloudconvert_api_key))
            .field("converter", &self.converter)
            .field("qr_backend", &self.qr_backend)
            .field("output_dir", &self.output_dir)
            .field("history_path", &self.history_path)
            .field("email", &self.email)
            .field("retry", &self.retry)
            .finish()
    }
}

impl AppConfig {
    /// Load the configuration from a JSON file. A missing file is not an
    /// error: the defaults are returned, as on a first launch.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, DocQrError> {
        let path = path.as_ref();
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No config at {}; using defaults", path.display());
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(DocQrError::ConfigRead {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        serde_json::from_str(&raw).map_err(|source| DocQrError::ConfigParse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Save the configuration as pretty JSON.
    ///
    /// Uses atomic write (temp file + rename) so a crash never leaves a
    /// half-written config behind.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), DocQrError> {
        let path = path.as_ref();
        let write_err = |source| DocQrError::WriteFailed {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(write_err)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, json).map_err(write_err)?;
        std::fs::rename(&tmp_path, path).map_err(write_err)?;
        Ok(())
    }

    /// Overlay credentials and paths from the environment.
    ///
    /// Recognised: `GEMINI_API_KEY`, `CLOUDCONVERT_API_KEY`,
    /// `DOCQR_EMAIL_SENDER`, `DOCQR_EMAIL_PASSWORD`, `DOCQR_OUTPUT_DIR`.
    pub fn with_env_overrides(mut self) -> Self {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());
        if let Some(key) = var("GEMINI_API_KEY") {
            self.gemini_api_key = Some(key);
        }
        if let Some(key) = var("CLOUDCONVERT_API_KEY") {
            self.cloudconvert_api_key = Some(key);
        }
        if let Some(sender) = var("DOCQR_EMAIL_SENDER") {
            self.email.sender = Some(sender);
        }
        if let Some(password) = var("DOCQR_EMAIL_PASSWORD") {
            self.email.password = Some(password);
        }
        if let Some(dir) = var("DOCQR_OUTPUT_DIR") {
            self.output_dir = PathBuf::from(dir);
        }
        self
    }

    /// The converter actually used once defaults are applied.
    pub fn effective_converter(&self) -> ConverterKind {
        match self.converter {
            Some(kind) => kind,
            None if self.cloudconvert_api_key.is_some() => ConverterKind::Remote,
            None => ConverterKind::Local,
        }
    }

    /// History log path once defaults are applied.
    pub fn effective_history_path(&self) -> PathBuf {
        self.history_path
            .clone()
            .unwrap_or_else(|| self.output_dir.join("history.jsonl"))
    }
}

/// SMTP relay settings.
///
/// `password` must be an app-scoped credential (e.g. a Gmail app password),
/// never the primary account password.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmailConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    pub smtp_server: String,
    pub smtp_port: u16,
    /// Per-send timeout in seconds. Default: 30.
    pub timeout_secs: u64,
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            sender: None,
            password: None,
            smtp_server: DEFAULT_SMTP_SERVER.to_string(),
            smtp_port: DEFAULT_SMTP_PORT,
            timeout_secs: 30,
        }
    }
}

impl EmailConfig {
    /// Sender and credential are both present.
    pub fn is_configured(&self) -> bool {
        self.sender.as_deref().is_some_and(|s| !s.is_empty())
            && self.password.as_deref().is_some_and(|p| !p.is_empty())
    }
}

impl fmt::Debug for EmailConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmailConfig")
            .field("sender", &self.sender)
            .field("password", &redact(&self.password))
            .field("smtp_server", &self.smtp_server)
            .field("smtp_port", &self.smtp_port)
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

/// Persisted form of a [`RetryPolicy`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Total attempts per external call, including the first. Default: 3.
    pub max_attempts: u32,
    /// First backoff delay in milliseconds; doubles per retry. Default: 500.
    pub initial_backoff_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 500,
        }
    }
}

impl RetrySettings {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.initial_backoff_ms),
        )
    }
}

fn redact(secret: &Option<String>) -> Option<&'static str> {
    secret.as_ref().map(|_| "<redacted>")
}

// ── Per-run options ──────────────────────────────────────────────────────

/// Options for a single [`crate::Pipeline::process`] call.
///
/// Built via [`ProcessOptions::builder()`] or [`ProcessOptions::default()`].
///
/// # Example
/// ```rust
/// use edgequake_docqr::{ProcessOptions, QrPlacement};
///
/// let options = ProcessOptions::builder()
///     .send_email(true)
///     .email_recipient("cliente@example.com")
///     .qr_placement(QrPlacement::EveryPage)
///     .build()
///     .unwrap();
/// ```
#[derive(Debug, Clone)]
pub struct ProcessOptions {
    /// Deliver the final PDF by e-mail. Default: false.
    pub send_email: bool,

    /// Recipient for delivery. Required when `send_email` is set, otherwise
    /// the Deliver stage fails and the run ends `partial`.
    pub email_recipient: Option<String>,

    /// Maximum summary length in characters. Range: 1–1000. Default: 500.
    ///
    /// 500 characters of Portuguese stays well inside the byte capacity of a
    /// level-Q QR code and keeps the code scannable at 80 pt.
    pub summary_max_chars: usize,

    /// Directory receiving the final PDF. Default: `output`.
    pub output_dir: PathBuf,

    /// Text printed above the QR code. Default: "Resumo".
    pub qr_label: String,

    /// Produce a PDF without QR header when summarization or QR encoding
    /// fails. Default: false (such failures fail the run).
    pub allow_degraded_output: bool,

    /// Which pages receive the QR header. Default: first page.
    pub qr_placement: QrPlacement,

    /// Also write the QR PNG next to the PDF. Default: true.
    pub persist_qr_image: bool,

    /// Hard ceiling for the whole run in seconds. Default: 600.
    pub run_timeout_secs: u64,
}

impl Default for ProcessOptions {
    fn default() -> Self {
        Self {
            send_email: false,
            email_recipient: None,
            summary_max_chars: 500,
            output_dir: PathBuf::from("output"),
            qr_label: "Resumo".to_string(),
            allow_degraded_output: false,
            qr_placement: QrPlacement::default(),
            persist_qr_image: true,
            run_timeout_secs: 600,
        }
    }
}

impl ProcessOptions {
    /// Create a new builder for `ProcessOptions`.
    pub fn builder() -> ProcessOptionsBuilder {
        ProcessOptionsBuilder {
            options: Self::default(),
        }
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }
}

/// Builder for [`ProcessOptions`].
#[derive(Debug)]
pub struct ProcessOptionsBuilder {
    options: ProcessOptions,
}

impl ProcessOptionsBuilder {
    pub fn send_email(mut self, v: bool) -> Self {
        self.options.send_email = v;
        self
    }

    pub fn email_recipient(mut self, recipient: impl Into<String>) -> Self {
        self.options.email_recipient = Some(recipient.into());
        self
    }

    pub fn summary_max_chars(mut self, n: usize) -> Self {
        self.options.summary_max_chars = n;
        self
    }

    pub fn output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.options.output_dir = dir.into();
        self
    }

    pub fn qr_label(mut self, label: impl Into<String>) -> Self {
        self.options.qr_label = label.into();
        self
    }

    pub fn allow_degraded_output(mut self, v: bool) -> Self {
        self.options.allow_degraded_output = v;
        self
    }

    pub fn qr_placement(mut self, placement: QrPlacement) -> Self {
        self.options.qr_placement = placement;
        self
    }

    pub fn persist_qr_image(mut self, v: bool) -> Self {
        self.options.persist_qr_image = v;
        self
    }

    pub fn run_timeout_secs(mut self, secs: u64) -> Self {
        self.options.run_timeout_secs = secs;
        self
    }

    /// Build the options, validating constraints.
    pub fn build(self) -> Result<ProcessOptions, DocQrError> {
        let o = &self.options;
        if o.summary_max_chars == 0 || o.summary_max_chars > 1000 {
            return Err(DocQrError::InvalidConfig(format!(
                "summary_max_chars must be 1–1000, got {}",
                o.summary_max_chars
            )));
        }
        if o.qr_label.chars().count() > 40 {
            return Err(DocQrError::InvalidConfig(
                "qr_label must be at most 40 characters".into(),
            ));
        }
        if o.run_timeout_secs == 0 {
            return Err(DocQrError::InvalidConfig(
                "run_timeout_secs must be ≥ 1".into(),
            ));
        }
        if o.send_email && o.email_recipient.as_deref().is_some_and(str::is_empty) {
            return Err(DocQrError::InvalidConfig(
                "email_recipient must not be empty".into(),
            ));
        }
        Ok(self.options)
    }
}

// ── Enums ────────────────────────────────────────────────────────────────

/// Pages that receive the QR header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QrPlacement {
    /// Only page 1 (default).
    #[default]
    FirstPage,
    /// Every page.
    EveryPage,
}

/// DOCX → PDF backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConverterKind {
    /// Headless LibreOffice (`soffice`) on this machine.
    Local,
    /// CloudConvert API.
    Remote,
}

/// QR rendering backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QrBackendKind {
    /// In-process encoder (default).
    #[default]
    Local,
    /// api.qrserver.com.
    Remote,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documentation() {
        let o = ProcessOptions::default();
        assert_eq!(o.summary_max_chars, 500);
        assert_eq!(o.qr_label, "Resumo");
        assert!(!o.send_email);
        assert!(!o.allow_degraded_output);
        assert_eq!(o.qr_placement, QrPlacement::FirstPage);
    }

    #[test]
    fn builder_rejects_out_of_range_summary() {
        assert!(ProcessOptions::builder().summary_max_chars(0).build().is_err());
        assert!(ProcessOptions::builder().summary_max_chars(5000).build().is_err());
        assert!(ProcessOptions::builder().summary_max_chars(300).build().is_ok());
    }

    #[test]
    fn builder_rejects_long_label() {
        let err = ProcessOptions::builder()
            .qr_label("x".repeat(41))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("qr_label"));
    }

    #[test]
    fn missing_config_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = AppConfig::load(dir.path().join("config.json")).unwrap();
        assert_eq!(cfg.output_dir, PathBuf::from("output"));
        assert_eq!(cfg.email.smtp_port, DEFAULT_SMTP_PORT);
        assert_eq!(cfg.effective_converter(), ConverterKind::Local);
    }

    #[test]
    fn config_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/config.json");
        let mut cfg = AppConfig::default();
        cfg.gemini_api_key = Some("key".into());
        cfg.email.sender = Some("me@example.com".into());
        cfg.save(&path).unwrap();

        let loaded = AppConfig::load(&path).unwrap();
        assert_eq!(loaded.gemini_api_key.as_deref(), Some("key"));
        assert_eq!(loaded.email.sender.as_deref(), Some("me@example.com"));
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn partial_json_fills_defaults() {
        let cfg: AppConfig =
            serde_json::from_str(r#"{"email": {"sender": "a@b.c"}, "converter": "remote"}"#)
                .unwrap();
        assert_eq!(cfg.email.smtp_server, DEFAULT_SMTP_SERVER);
        assert_eq!(cfg.effective_converter(), ConverterKind::Remote);
        assert_eq!(cfg.retry.max_attempts, 3);
    }

    #[test]
    fn cloudconvert_key_selects_remote_converter() {
        let cfg = AppConfig {
            cloudconvert_api_key: Some("cc".into()),
            ..AppConfig::default()
        };
        assert_eq!(cfg.effective_converter(), ConverterKind::Remote);
    }

    #[test]
    fn debug_redacts_secrets() {
        let mut cfg = AppConfig::default();
        cfg.gemini_api_key = Some("super-secret".into());
        cfg.email.password = Some("app-password".into());
        let dbg = format!("{cfg:?}");
        assert!(!dbg.contains("super-secret"));
        assert!(!dbg.contains("app-password"));
        assert!(dbg.contains("<redacted>"));
    }

    #[test]
    fn history_defaults_under_output_dir() {
        let cfg = AppConfig {
            output_dir: PathBuf::from("/tmp/out"),
            ..AppConfig::default()
        };
        assert_eq!(
            cfg.effective_history_path(),
            PathBuf::from("/tmp/out/history.jsonl")
        );
    }
}
