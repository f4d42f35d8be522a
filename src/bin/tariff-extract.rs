//! CLI binary for tariff-extract.
//!
//! A thin shim over the library crate: maps flags onto `PipelineConfig`,
//! runs the pipeline or the HTTP server, and prints JSON.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tariff_extract::server::{self, AppState};
use tariff_extract::{
    Pipeline, PipelineConfig, ProgressCallback, RetentionPolicy, RunProgressCallback,
    TariffError, TariffStore,
};
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
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

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── CLI progress callback using indicatif ────────────────────────────────────

/// One bar over the run's documents. Documents finish out of order.
struct CliProgressCallback {
    bar: ProgressBar,
    start_times: Mutex<HashMap<String, Instant>>,
    errors: AtomicUsize,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        let spinner_style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(TICKS);
        bar.set_style(spinner_style);
        bar.set_prefix("Acquiring");
        bar.set_message("Fetching tariff documents…");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            start_times: Mutex::new(HashMap::new()),
            errors: AtomicUsize::new(0),
        })
    }

    fn elapsed(&self, document: &str) -> f64 {
        self.start_times
            .lock()
            .ok()
            .and_then(|mut m| m.remove(document))
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0)
    }
}

impl RunProgressCallback for CliProgressCallback {
    fn on_run_start(&self, country: &str, documents: usize) {
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}/{len} documents  ⏱ {elapsed_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(TICKS);

        self.bar.set_length(documents as u64);
        self.bar.set_style(style);
        self.bar.set_prefix("Extracting");
        self.bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!("{documents} tariff document(s) for {country}"))
        ));
    }

    fn on_document_start(&self, document: &str) {
        if let Ok(mut m) = self.start_times.lock() {
            m.insert(document.to_string(), Instant::now());
        }
        self.bar.set_message(document.to_string());
    }

    fn on_document_complete(&self, document: &str, records: usize) {
        let secs = self.elapsed(document);
        self.bar.println(format!(
            "  {} {:<40}  {}  {}",
            green("✓"),
            document,
            dim(&format!("{records:>4} records")),
            dim(&format!("{secs:.1}s")),
        ));
        self.bar.inc(1);
    }

    fn on_document_error(&self, document: &str, error: &str) {
        let secs = self.elapsed(document);
        self.errors.fetch_add(1, Ordering::SeqCst);
        let msg: String = if error.chars().count() > 80 {
            format!("{}…", error.chars().take(79).collect::<String>())
        } else {
            error.to_string()
        };
        self.bar.println(format!(
            "  {} {:<40}  {}  {}",
            red("✗"),
            document,
            red(&msg),
            dim(&format!("{secs:.1}s")),
        ));
        self.bar.inc(1);
    }

    fn on_run_complete(&self, documents: usize, records: usize) {
        self.bar.finish_and_clear();
        let failed = self.errors.load(Ordering::SeqCst);
        if failed == 0 {
            eprintln!(
                "{} {} documents, {} records persisted",
                green("✔"),
                bold(&documents.to_string()),
                bold(&records.to_string())
            );
        } else {
            eprintln!(
                "{} {} documents, {} records persisted  ({} documents failed)",
                cyan("⚠"),
                bold(&documents.to_string()),
                bold(&records.to_string()),
                red(&failed.to_string()),
            );
        }
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Serve the HTTP API
  tariff-extract --config tariffs.yaml serve --addr 0.0.0.0:8080

  # One run from the command line
  tariff-extract --config tariffs.yaml run --country India

  # Only the COSCO sources
  tariff-extract --config tariffs.yaml run --country India --source cosco

  # Dump stored records
  tariff-extract --db tariffs.db fetch --country India

  # Inspect regions the model could not read
  tariff-extract quarantine --limit 20

ENVIRONMENT VARIABLES:
  OPENAI_API_KEY          OpenAI API key
  ANTHROPIC_API_KEY       Anthropic API key
  GEMINI_API_KEY          Google Gemini API key
  EDGEQUAKE_LLM_PROVIDER  Override provider (openai, anthropic, gemini, ollama)
  EDGEQUAKE_MODEL         Override model ID
  PDFIUM_LIB_PATH         Path to an existing libpdfium — skips auto-download
  RUST_LOG                Log filter, e.g. tariff_extract=debug
"#;

/// Extract shipping-line demurrage & detention tariffs from PDFs.
#[derive(Parser, Debug)]
#[command(
    name = "tariff-extract",
    version,
    about = "Extract demurrage & detention tariffs from shipping-line PDFs",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// YAML configuration file (sources, thresholds, buckets …).
    #[arg(short, long, global = true, env = "TARIFF_CONFIG")]
    config: Option<PathBuf>,

    /// SQLite database path (overrides `storage_path`).
    #[arg(long, global = true, env = "TARIFF_DB")]
    db: Option<PathBuf>,

    /// Vision model ID (e.g. gpt-4o, gpt-4.1-mini).
    #[arg(long, global = true, env = "TARIFF_MODEL")]
    model: Option<String>,

    /// Vision provider: openai, anthropic, gemini, ollama, azure.
    #[arg(long, global = true, env = "TARIFF_PROVIDER")]
    provider: Option<String>,

    /// ONNX table-detector model.
    #[arg(long, global = true, env = "TARIFF_DETECTOR_MODEL")]
    detector_model: Option<PathBuf>,

    /// Keep downloaded PDFs, page images and crops under the artifact dir.
    #[arg(long, global = true, env = "TARIFF_RETAIN")]
    retain: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true, env = "TARIFF_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, global = true, env = "TARIFF_QUIET")]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the HTTP API.
    Serve {
        #[arg(long, env = "TARIFF_ADDR", default_value = "127.0.0.1:8080")]
        addr: SocketAddr,
    },
    /// Run the pipeline once for a country and print the summary as JSON.
    Run {
        #[arg(long)]
        country: String,
        /// Only sources whose name or line matches.
        #[arg(long)]
        source: Option<String>,
        /// Disable the progress bar.
        #[arg(long, env = "TARIFF_NO_PROGRESS")]
        no_progress: bool,
    },
    /// Print stored tariff records as JSON.
    Fetch {
        #[arg(long)]
        country: Option<String>,
    },
    /// Print quarantined extractions as JSON.
    Quarantine {
        #[arg(long, default_value_t = 100)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress bar replaces INFO logs for `run` unless --verbose.
    let bar_active = matches!(cli.command, Command::Run { no_progress: false, .. }) && !cli.quiet;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || bar_active {
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

    let config = build_config(&cli)?;

    match &cli.command {
        Command::Serve { addr } => {
            ensure_pdfium(cli.quiet)?;
            let pipeline = Pipeline::from_config(config)
                .await
                .context("Failed to initialise pipeline")?;
            let state = AppState::new(pipeline);
            let listener = tokio::net::TcpListener::bind(addr)
                .await
                .with_context(|| format!("Failed to bind {addr}"))?;
            server::serve(listener, Arc::clone(&state), async {
                let _ = tokio::signal::ctrl_c().await;
            })
            .await
            .context("Server error")?;
            state.pipeline().shutdown().await;
        }
        Command::Run {
            country,
            source,
            no_progress,
        } => {
            ensure_pdfium(cli.quiet)?;
            let progress: Option<ProgressCallback> = if cli.quiet || *no_progress {
                None
            } else {
                Some(CliProgressCallback::new() as Arc<dyn RunProgressCallback>)
            };
            let pipeline = Pipeline::from_config(config)
                .await
                .context("Failed to initialise pipeline")?;
            let result = pipeline.run(country, source.as_deref(), progress).await;
            pipeline.shutdown().await;

            match result {
                Ok(summary) => print_json(&summary)?,
                Err(TariffError::NoDocuments { country, summary }) => {
                    print_json(&summary)?;
                    anyhow::bail!("No tariff documents could be acquired for '{country}'");
                }
                Err(e) => return Err(e).context("Run failed"),
            }
        }
        Command::Fetch { country } => {
            let store = open_store(&config)?;
            let records = match country {
                Some(c) => store.fetch_by_country(c),
                None => store.fetch_all(),
            }
            .context("Failed to read tariff records")?;
            print_json(&records)?;
        }
        Command::Quarantine { limit } => {
            let store = open_store(&config)?;
            let items = store
                .list_quarantine(*limit)
                .context("Failed to read quarantine")?;
            print_json(&items)?;
        }
    }

    Ok(())
}

/// File config first, then flag/env overrides.
fn build_config(cli: &Cli) -> Result<PipelineConfig> {
    let mut builder = match &cli.config {
        Some(path) => PipelineConfig::builder_from_yaml_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => PipelineConfig::builder(),
    };

    if let Some(db) = &cli.db {
        builder = builder.storage_path(db);
    }
    if let Some(model) = &cli.model {
        builder = builder.model(model);
    }
    if let Some(provider) = &cli.provider {
        builder = builder.provider_name(provider);
    }
    if let Some(path) = &cli.detector_model {
        builder = builder.detector_model_path(path);
    }
    if cli.retain {
        builder = builder.retention(RetentionPolicy::Retain);
    }

    builder.build().context("Invalid configuration")
}

fn open_store(config: &PipelineConfig) -> Result<TariffStore> {
    TariffStore::open(&config.storage_path)
        .with_context(|| format!("Failed to open {}", config.storage_path.display()))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("Failed to serialise output")?;
    println!("{json}");
    Ok(())
}

/// Download the PDFium library on first use, with a byte progress bar.
fn ensure_pdfium(quiet: bool) -> Result<()> {
    if pdfium_auto::is_pdfium_cached() {
        return Ok(());
    }
    if quiet {
        tokio::task::block_in_place(|| pdfium_auto::ensure_pdfium_library(None))
            .context("Failed to download PDFium engine")?;
        return Ok(());
    }

    let dl_bar = ProgressBar::new(0);
    dl_bar.set_style(
        ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {bytes}/{total_bytes}  ETA {eta_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(TICKS),
    );
    dl_bar.set_prefix("PDF engine");
    dl_bar.enable_steady_tick(Duration::from_millis(80));

    let bar = dl_bar.clone();
    tokio::task::block_in_place(|| {
        pdfium_auto::ensure_pdfium_library(Some(&|downloaded, total| {
            if let Some(t) = total {
                if bar.length().unwrap_or(0) != t {
                    bar.set_length(t);
                }
            }
            bar.set_position(downloaded);
        }))
    })
    .context("Failed to download PDFium engine")?;

    dl_bar.finish_with_message("ready ✓");
    Ok(())
}
