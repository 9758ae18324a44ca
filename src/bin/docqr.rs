//! CLI binary for edgequake-docqr.
//!
//! A thin shim over the library crate: `process` maps flags to
//! `ProcessOptions` and runs the pipeline per input, `history` queries the
//! run log.
//!
//! Exit codes: 0 when every run ended success/partial, 1 when any run failed,
//! 2 on usage or configuration errors.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use edgequake_docqr::document::{input_filename, is_url};
use edgequake_docqr::{
    AppConfig, ConverterKind, DocQrError, Document, FinalStatus, HistoryFilter, HistoryStore,
    Pipeline, PipelineProgressCallback, ProcessOptions, ProgressCallback, QrPlacement, RunRecord,
    StageName, StageState,
};
use futures::stream::{self, StreamExt};
use indicatif::{ProgressBar, ProgressStyle};
use std::io;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn yellow(s: &str) -> String {
    format!("\x1b[33m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

fn status_mark(status: FinalStatus) -> String {
    match status {
        FinalStatus::Success => green("✔"),
        FinalStatus::Partial => yellow("⚠"),
        FinalStatus::Failed => red("✘"),
    }
}

fn colored_status(status: FinalStatus) -> String {
    match status {
        FinalStatus::Success => green(status.as_str()),
        FinalStatus::Partial => yellow(status.as_str()),
        FinalStatus::Failed => red(status.as_str()),
    }
}

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Spinner plus one log line per finished stage. Shared by all runs when
/// inputs are processed concurrently.
struct CliProgressCallback {
    bar: ProgressBar,
    total_runs: usize,
    completed: AtomicUsize,
}

impl CliProgressCallback {
    fn new(total_runs: usize) -> Arc<Self> {
        let bar = ProgressBar::new_spinner();
        let style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}  ⏱ {elapsed}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);
        bar.set_style(style);
        bar.set_prefix(format!("0/{total_runs}"));
        bar.set_message("Starting…");
        bar.enable_steady_tick(Duration::from_millis(80));
        Arc::new(Self {
            bar,
            total_runs,
            completed: AtomicUsize::new(0),
        })
    }

    fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl PipelineProgressCallback for CliProgressCallback {
    fn on_run_start(&self, input_filename: &str) {
        self.bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!("Processing {input_filename}"))
        ));
    }

    fn on_stage_start(&self, stage: StageName) {
        self.bar.set_message(format!("{stage}…"));
    }

    fn on_stage_retry(&self, stage: StageName, attempt: u32, delay: Duration, error: &str) {
        self.bar.println(format!(
            "  {} {:<10} retry {} in {:.1}s  {}",
            yellow("↻"),
            stage.as_str(),
            attempt,
            delay.as_secs_f64(),
            dim(&truncate(error, 80)),
        ));
    }

    fn on_stage_finish(&self, stage: StageName, ok: bool, message: Option<&str>) {
        let line = if ok {
            format!("  {} {}", green("✓"), stage.as_str())
        } else {
            format!(
                "  {} {:<10} {}",
                red("✗"),
                stage.as_str(),
                red(&truncate(message.unwrap_or(""), 80))
            )
        };
        self.bar.println(line);
    }

    fn on_run_complete(&self, record: &RunRecord) {
        let done = self.completed.fetch_add(1, Ordering::SeqCst) + 1;
        self.bar.set_prefix(format!("{done}/{}", self.total_runs));
        self.bar.println(format!(
            "{} {}  {}  {}",
            status_mark(record.final_status),
            record.input_filename,
            colored_status(record.final_status),
            dim(&format!("{:.1}s", record.duration_ms() as f64 / 1000.0)),
        ));
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() > max {
        let head: String = s.chars().take(max.saturating_sub(1)).collect();
        format!("{head}\u{2026}")
    } else {
        s.to_string()
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Summarise, stamp the QR header and write the PDF to ./output
  docqr process contrato.docx

  # Several documents, two at a time, e-mailing each result
  docqr process --email cliente@example.com --concurrency 2 a.docx b.docx

  # From a URL, QR on every page, keep going if the summary fails
  docqr process --every-page --allow-degraded https://example.com/procuracao.docx

  # Last ten failed runs, then the details of one of them
  docqr history list --status failed --limit 10
  docqr history show 3f2a9c1b

CONFIGURATION (config.json):
  {
    "gemini_api_key": "...",          "gemini_model": "gemini-2.0-flash",
    "cloudconvert_api_key": "...",    "converter": "local" | "remote",
    "qr_backend": "local" | "remote", "output_dir": "output",
    "email": { "sender": "...", "password": "<app password>",
               "smtp_server": "smtp.gmail.com", "smtp_port": 587 },
    "retry": { "max_attempts": 3, "initial_backoff_ms": 500 }
  }

ENVIRONMENT VARIABLES:
  GEMINI_API_KEY          Gemini key (overrides config.json)
  CLOUDCONVERT_API_KEY    CloudConvert key; selects the remote converter
  DOCQR_EMAIL_SENDER      SMTP sender address
  DOCQR_EMAIL_PASSWORD    SMTP app password
  DOCQR_OUTPUT_DIR        Output directory
  OPENAI_API_KEY / ANTHROPIC_API_KEY
                          Used for summaries when no Gemini key is set

EXIT CODES:
  0  every run succeeded or ended partial
  1  at least one run failed
  2  usage or configuration error
"#;

/// Turn legal Word documents into PDFs with a QR-coded AI summary.
#[derive(Parser, Debug)]
#[command(
    name = "docqr",
    version,
    about = "Turn legal Word documents into PDFs with a QR-coded AI summary",
    long_about = "Extracts the text of a .docx, summarises it with an LLM, encodes the summary \
as a QR code, converts the document to PDF, stamps the QR code in the page header and \
optionally e-mails the result. Every run is recorded in a JSON-lines history log.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Path to config.json (missing file means defaults).
    #[arg(long, global = true, env = "DOCQR_CONFIG", default_value = "config.json")]
    config: PathBuf,

    /// History log path. Default: <output_dir>/history.jsonl.
    #[arg(long, global = true, env = "DOCQR_HISTORY")]
    history: Option<PathBuf>,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true, env = "DOCQR_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, global = true, env = "DOCQR_QUIET")]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the pipeline for one or more documents.
    Process(ProcessArgs),

    /// Query the run history.
    #[command(subcommand)]
    History(HistoryCommand),
}

#[derive(Args, Debug)]
struct ProcessArgs {
    /// Local .docx paths or HTTP/HTTPS URLs.
    #[arg(required = true)]
    inputs: Vec<String>,

    /// Directory for final PDFs. Overrides config.json.
    #[arg(short, long, env = "DOCQR_OUTPUT_DIR")]
    output_dir: Option<PathBuf>,

    /// E-mail the final PDF to this address.
    #[arg(long, env = "DOCQR_EMAIL_TO")]
    email: Option<String>,

    /// Maximum summary length in characters (1–1000).
    #[arg(long, env = "DOCQR_MAX_CHARS", default_value_t = 500,
          value_parser = clap::value_parser!(u16).range(1..=1000))]
    max_chars: u16,

    /// Caption printed above the QR code.
    #[arg(long, env = "DOCQR_LABEL", default_value = "Resumo")]
    label: String,

    /// Stamp the QR header on every page instead of page 1 only.
    #[arg(long)]
    every_page: bool,

    /// Still write a PDF (without QR header) when summarising or encoding fails.
    #[arg(long, env = "DOCQR_ALLOW_DEGRADED")]
    allow_degraded: bool,

    /// Converter backend. Overrides config.json.
    #[arg(long, value_enum)]
    converter: Option<ConverterArg>,

    /// Do not save the QR code as a separate PNG.
    #[arg(long)]
    no_qr_image: bool,

    /// Number of documents processed at the same time.
    #[arg(short, long, env = "DOCQR_CONCURRENCY", default_value_t = 1)]
    concurrency: usize,

    /// Whole-run time limit in seconds.
    #[arg(long, env = "DOCQR_RUN_TIMEOUT", default_value_t = 600)]
    run_timeout: u64,

    /// HTTP download timeout in seconds for URL inputs.
    #[arg(long, env = "DOCQR_DOWNLOAD_TIMEOUT", default_value_t = 120)]
    download_timeout: u64,

    /// Print the run records as JSON on stdout.
    #[arg(long)]
    json: bool,

    /// Disable the progress spinner.
    #[arg(long, env = "DOCQR_NO_PROGRESS")]
    no_progress: bool,
}

#[derive(Subcommand, Debug)]
enum HistoryCommand {
    /// List past runs, most recent first.
    List {
        /// Only runs with this final status.
        #[arg(long, value_enum)]
        status: Option<StatusArg>,

        /// Only runs whose input filename contains this text.
        #[arg(long)]
        filename: Option<String>,

        /// Show at most this many runs.
        #[arg(short = 'n', long, default_value_t = 20)]
        limit: usize,

        #[arg(long)]
        json: bool,
    },

    /// Show one run in detail (full id or unique prefix).
    Show {
        run_id: String,

        #[arg(long)]
        json: bool,
    },
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum ConverterArg {
    Local,
    Remote,
}

impl From<ConverterArg> for ConverterKind {
    fn from(v: ConverterArg) -> Self {
        match v {
            ConverterArg::Local => ConverterKind::Local,
            ConverterArg::Remote => ConverterKind::Remote,
        }
    }
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum StatusArg {
    Success,
    Partial,
    Failed,
}

impl From<StatusArg> for FinalStatus {
    fn from(v: StatusArg) -> Self {
        match v {
            StatusArg::Success => FinalStatus::Success,
            StatusArg::Partial => FinalStatus::Partial,
            StatusArg::Failed => FinalStatus::Failed,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The spinner gives all the feedback that matters, so library INFO logs
    // are muted while it is active.
    let spinner = match &cli.command {
        Command::Process(args) => !cli.quiet && !args.no_progress && !args.json,
        Command::History(_) => false,
    };
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || spinner {
        "error"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    let result = match &cli.command {
        Command::Process(args) => process(&cli, args, spinner).await,
        Command::History(cmd) => history(&cli, cmd).await,
    };
    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {:#}", red("error:"), e);
            ExitCode::from(2)
        }
    }
}

fn load_config(cli: &Cli) -> Result<AppConfig> {
    let config = AppConfig::load(&cli.config)
        .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?
        .with_env_overrides();
    Ok(config)
}

async fn open_history(cli: &Cli, config: &AppConfig) -> Result<Arc<HistoryStore>> {
    let path = cli
        .history
        .clone()
        .unwrap_or_else(|| config.effective_history_path());
    let store = HistoryStore::open(&path)
        .await
        .with_context(|| format!("Failed to open history log {}", path.display()))?;
    Ok(Arc::new(store))
}

// ── process ──────────────────────────────────────────────────────────────

async fn process(cli: &Cli, args: &ProcessArgs, spinner: bool) -> Result<ExitCode> {
    let mut config = load_config(cli)?;
    if let Some(converter) = args.converter {
        config.converter = Some(converter.into());
    }
    if let Some(dir) = &args.output_dir {
        config.output_dir = dir.clone();
    }

    let options = build_options(args, &config)?;
    let history = open_history(cli, &config).await?;

    let progress = spinner.then(|| CliProgressCallback::new(args.inputs.len()));
    let mut pipeline = Pipeline::from_config(&config, history)
        .context("Failed to set up the pipeline")?;
    if let Some(cb) = &progress {
        pipeline = pipeline.with_progress_callback(Arc::clone(cb) as ProgressCallback);
    }

    let download_timeout = Duration::from_secs(args.download_timeout);
    let pipeline = &pipeline;
    let options = &options;
    let outcomes: Vec<RunRecord> = stream::iter(args.inputs.iter())
        .map(|input| async move {
            match resolve_input(input, download_timeout).await {
                Ok(doc) => pipeline.process(&doc, options).await,
                // Still one history record per input.
                Err(error) => {
                    let detail = error.to_string();
                    let detail = detail.lines().next().unwrap_or_default();
                    pipeline
                        .record_unresolved(&input_filename(input), detail, options)
                        .await
                }
            }
        })
        .buffer_unordered(args.concurrency.max(1))
        .collect()
        .await;

    if let Some(cb) = &progress {
        cb.finish();
    }

    let mut any_failed = false;
    let mut records = Vec::new();
    for record in outcomes {
        if record.final_status == FinalStatus::Failed {
            any_failed = true;
        }
        if !cli.quiet && !args.json {
            print_run_summary(&record);
        } else if record.final_status == FinalStatus::Failed {
            print_failure(&record);
        }
        records.push(record);
    }

    if args.json {
        let json = serde_json::to_string_pretty(&records).context("Failed to serialise runs")?;
        println!("{json}");
    }

    Ok(if any_failed {
        ExitCode::from(1)
    } else {
        ExitCode::SUCCESS
    })
}

fn build_options(args: &ProcessArgs, config: &AppConfig) -> Result<ProcessOptions> {
    let mut builder = ProcessOptions::builder()
        .summary_max_chars(usize::from(args.max_chars))
        .qr_label(args.label.clone())
        .output_dir(config.output_dir.clone())
        .allow_degraded_output(args.allow_degraded)
        .persist_qr_image(!args.no_qr_image)
        .run_timeout_secs(args.run_timeout)
        .qr_placement(if args.every_page {
            QrPlacement::EveryPage
        } else {
            QrPlacement::FirstPage
        });
    if let Some(to) = &args.email {
        builder = builder.send_email(true).email_recipient(to.clone());
    }
    builder.build().context("Invalid options")
}

async fn resolve_input(input: &str, download_timeout: Duration) -> Result<Document, DocQrError> {
    if is_url(input) {
        Document::fetch(input, download_timeout).await
    } else {
        Document::from_path(input)
    }
}

fn print_run_summary(record: &RunRecord) {
    eprintln!(
        "{}  {}  {}  {}ms  {}",
        status_mark(record.final_status),
        bold(&record.input_filename),
        colored_status(record.final_status),
        record.duration_ms(),
        dim(&short_id(record)),
    );
    if let Some(pdf) = &record.output_pdf_ref {
        eprintln!("   → {}", bold(pdf));
    }
    if record.email_sent {
        eprintln!("   {} e-mail sent", green("✉"));
    }
    print_failure(record);
}

/// Failed stage and its message, on stderr.
fn print_failure(record: &RunRecord) {
    if let Some(failed) = record.first_failure() {
        eprintln!(
            "   {} {} failed after {} attempt(s): {}",
            red("✗"),
            bold(failed.stage.as_str()),
            failed.attempts,
            failed.error_message.as_deref().unwrap_or("unknown error"),
        );
    }
}

fn short_id(record: &RunRecord) -> String {
    record.run_id.to_string()[..8].to_string()
}

// ── history ──────────────────────────────────────────────────────────────

async fn history(cli: &Cli, cmd: &HistoryCommand) -> Result<ExitCode> {
    let config = load_config(cli)?;
    let store = open_history(cli, &config).await?;

    match cmd {
        HistoryCommand::List {
            status,
            filename,
            limit,
            json,
        } => {
            let filter = HistoryFilter {
                status: status.map(Into::into),
                filename_contains: filename.clone(),
                limit: Some(*limit),
            };
            let records = store.list(&filter).await.context("Failed to read history")?;
            if *json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&records).context("Failed to serialise runs")?
                );
            } else if records.is_empty() {
                eprintln!("{}", dim("No runs recorded."));
            } else {
                for r in &records {
                    println!(
                        "{}  {}  {:<8}  {}  {}",
                        dim(&short_id(r)),
                        r.started_at.format("%Y-%m-%d %H:%M:%S"),
                        colored_status(r.final_status),
                        r.input_filename,
                        dim(r.output_pdf_ref.as_deref().unwrap_or("-")),
                    );
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        HistoryCommand::Show { run_id, json } => {
            let matches = store
                .find_by_prefix(run_id)
                .await
                .context("Failed to read history")?;
            let record = match matches.as_slice() {
                [only] => only,
                [] => anyhow::bail!("No run matches '{run_id}'"),
                _ => anyhow::bail!(
                    "'{run_id}' matches {} runs; use a longer prefix",
                    matches.len()
                ),
            };
            if *json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(record).context("Failed to serialise run")?
                );
            } else {
                print_record_detail(record);
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn print_record_detail(r: &RunRecord) {
    println!("Run:          {}", r.run_id);
    println!("Input:        {}", r.input_filename);
    println!("Started:      {}", r.started_at.to_rfc3339());
    println!("Finished:     {}  ({}ms)", r.finished_at.to_rfc3339(), r.duration_ms());
    println!("Status:       {}", colored_status(r.final_status));
    if let Some(pdf) = &r.output_pdf_ref {
        println!("PDF:          {}", pdf);
    }
    if let Some(qr) = &r.qr_image_ref {
        println!("QR image:     {}", qr);
    }
    println!("E-mail sent:  {}", r.email_sent);
    println!();
    for s in &r.stage_statuses {
        let mark = match s.status {
            StageState::Success => green("✓"),
            StageState::Failed => red("✗"),
            StageState::Skipped => dim("·"),
        };
        println!(
            "  {} {:<10} {:<8} {:>2} attempt(s) {:>7}ms  {}",
            mark,
            s.stage.as_str(),
            s.status.as_str(),
            s.attempts,
            s.duration_ms,
            s.error_message.as_deref().unwrap_or(""),
        );
    }
    if let Some(summary) = &r.summary {
        println!();
        println!("Summary ({} chars):", summary.text.chars().count());
        println!("{}", summary.text);
    }
}
