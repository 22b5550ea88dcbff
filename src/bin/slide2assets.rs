//! CLI binary for edgequake-slide2assets.
//!
//! A thin shim over the library crate that maps CLI flags
//! to `PipelineConfig` and prints results.

use anyhow::{Context, Result};
use clap::Parser;
use edgequake_slide2assets::{
    decompose, decompose_with_layout, detect, DecompositionOutput, Detection, ElementId,
    ElementType, ExtractionProgressCallback, PipelineConfig, ProgressCallback,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
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

/// Terminal progress callback: one bar for the run, one log line per
/// finished element. Elements finish out of order when several workers run.
struct CliProgressCallback {
    bar: ProgressBar,
    start_times: Mutex<HashMap<ElementId, (ElementType, Instant)>>,
    failures: AtomicUsize,
}

impl CliProgressCallback {
    /// Spinner until `on_run_start` tells us how many elements there are.
    fn new_dynamic() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        let spinner_style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(TICKS);

        bar.set_style(spinner_style);
        bar.set_prefix("Preparing");
        bar.set_message("Detecting layout…");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            start_times: Mutex::new(HashMap::new()),
            failures: AtomicUsize::new(0),
        })
    }

    fn activate_bar(&self, total: usize) {
        let progress_style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}/{len} elements  \
             ⏱ {elapsed_precise}  {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(TICKS);

        self.bar.set_length(total as u64);
        self.bar.set_style(progress_style);
        self.bar.set_prefix("Extracting");
        self.bar.set_message("");
        self.bar.reset_eta();
    }

    /// Remove the element's start entry, returning its type and elapsed seconds.
    fn finish_timer(&self, id: &ElementId) -> (String, f64) {
        let entry = self
            .start_times
            .lock()
            .ok()
            .and_then(|mut times| times.remove(id));
        match entry {
            Some((t, started)) => (t.to_string(), started.elapsed().as_secs_f64()),
            None => (String::new(), 0.0),
        }
    }
}

impl ExtractionProgressCallback for CliProgressCallback {
    fn on_run_start(&self, total: usize) {
        self.activate_bar(total);
        self.bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!("Extracting {total} element(s)…"))
        ));
    }

    fn on_element_start(&self, id: &ElementId, element_type: ElementType) {
        if let Ok(mut times) = self.start_times.lock() {
            times.insert(id.clone(), (element_type, Instant::now()));
        }
        self.bar.set_message(format!("{id}"));
    }

    fn on_attempt(&self, id: &ElementId, attempt: u32, max: u32, score: u8) {
        self.bar
            .set_message(format!("{id} attempt {attempt}/{max} scored {score}"));
    }

    fn on_element_complete(&self, id: &ElementId, attempts: u32, score: u8) {
        let (element_type, secs) = self.finish_timer(id);
        self.bar.println(format!(
            "  {} {:<6} {:<6} {}  {}",
            green("✓"),
            id,
            element_type,
            dim(&format!("QA {score:>3} after {attempts} attempt(s)")),
            dim(&format!("{secs:.1}s")),
        ));
        self.bar.inc(1);
    }

    fn on_text_complete(&self, id: &ElementId) {
        let (element_type, secs) = self.finish_timer(id);
        self.bar.println(format!(
            "  {} {:<6} {:<6} {}  {}",
            green("✓"),
            id,
            element_type,
            dim("transcribed"),
            dim(&format!("{secs:.1}s")),
        ));
        self.bar.inc(1);
    }

    fn on_element_failed(&self, id: &ElementId, reason: String) {
        let (element_type, secs) = self.finish_timer(id);
        self.failures.fetch_add(1, Ordering::SeqCst);

        let msg = if reason.chars().count() > 80 {
            let cut: String = reason.chars().take(79).collect();
            format!("{cut}\u{2026}")
        } else {
            reason
        };

        self.bar.println(format!(
            "  {} {:<6} {:<6} {}  {}",
            red("✗"),
            id,
            element_type,
            red(&msg),
            dim(&format!("{secs:.1}s")),
        ));
        self.bar.inc(1);
    }

    fn on_run_complete(&self, total: usize, completed: usize) {
        let failed = total.saturating_sub(completed);
        self.bar.finish_and_clear();

        if failed == 0 {
            eprintln!(
                "{} {} element(s) extracted",
                green("✔"),
                bold(&completed.to_string())
            );
        } else {
            eprintln!(
                "{} {}/{} element(s) extracted  ({} failed)",
                if failed == total { red("✘") } else { cyan("⚠") },
                bold(&completed.to_string()),
                total,
                red(&failed.to_string()),
            );
        }
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Decompose a slide into ./assets
  slide2assets slide.png -o assets

  # Layout only, as JSON
  slide2assets --detect-only slide.png > layout.json

  # Reuse an edited layout instead of calling the detector
  slide2assets --elements layout.json slide.png -o assets

  # Decompose a slide from a URL with premium models enabled
  slide2assets --premium-access https://example.com/deck/slide-3.png -o out

  # Full manifest (element states, QA history, usage) on stdout
  slide2assets --json slide.png

MODELS (defaults):
  Stage              Model
  ─────────────────  ─────────────────────────────
  Detection, Critic  gemini-3-pro-preview
  Analyst            gemini-3-flash-preview
  Cleaner SHAPE      gemini-3-pro-image-preview   (premium)
  Cleaner ICON/IMAGE gemini-2.5-flash-image

  Premium models need --premium-access; without it those elements fail
  fast with an entitlement error and no model is called.

OUTPUT:
  <dir>/el-N.png       one transparent PNG per completed element
  <dir>/manifest.json  every element with status, attempts and QA history

ENVIRONMENT VARIABLES:
  GEMINI_API_KEY          Google Gemini API key (vision chat + image generation)
  GOOGLE_API_KEY          Fallback for GEMINI_API_KEY
  EDGEQUAKE_LLM_PROVIDER  Override the vision chat provider (gemini, openai, anthropic, ollama)
  EDGEQUAKE_MODEL         Override the vision chat model ID

SETUP:
  1. Set API key:     export GEMINI_API_KEY=...
  2. Decompose:       slide2assets slide.png -o assets
"#;

/// Decompose a slide image into clean, transparent element assets.
#[derive(Parser, Debug)]
#[command(
    name = "slide2assets",
    version,
    about = "Decompose a slide image into clean, transparent element assets",
    long_about = "Detect the visual elements of a slide image (local file or URL) and rebuild \
each shape, icon and image as an isolated PNG with a transparent background. Every element goes \
through a plan / clean / critique loop until it passes QA or runs out of attempts.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Local image path (PNG, JPEG, WebP) or HTTP/HTTPS URL.
    input: String,

    /// Write `<id>.png` assets and `manifest.json` into this directory.
    #[arg(short, long, env = "SLIDE2ASSETS_OUTPUT")]
    output: Option<PathBuf>,

    /// Use this layout JSON instead of calling the detector.
    #[arg(long, env = "SLIDE2ASSETS_ELEMENTS")]
    elements: Option<PathBuf>,

    /// Print the detected layout as JSON and stop.
    #[arg(long, conflicts_with = "elements")]
    detect_only: bool,

    /// Vision chat provider: gemini, openai, anthropic, ollama.
    #[arg(
        long,
        env = "EDGEQUAKE_PROVIDER",
        long_help = "Provider for the detection, Analyst and Critic calls. Auto-detected from \
          API key env vars if not set."
    )]
    provider: Option<String>,

    /// Model for layout detection.
    #[arg(long, env = "SLIDE2ASSETS_DETECTION_MODEL")]
    detection_model: Option<String>,

    /// Model that plans the cleaning prompt.
    #[arg(long, env = "SLIDE2ASSETS_ANALYST_MODEL")]
    analyst_model: Option<String>,

    /// Model that transcribes TEXT elements.
    #[arg(long, env = "SLIDE2ASSETS_TEXT_MODEL")]
    text_model: Option<String>,

    /// Model that grades each cleaned candidate.
    #[arg(long, env = "SLIDE2ASSETS_CRITIC_MODEL")]
    critic_model: Option<String>,

    /// Image-generation model for SHAPE elements.
    #[arg(long, env = "SLIDE2ASSETS_SHAPE_MODEL")]
    shape_model: Option<String>,

    /// Image-generation model for ICON elements.
    #[arg(long, env = "SLIDE2ASSETS_ICON_MODEL")]
    icon_model: Option<String>,

    /// Image-generation model for IMAGE elements.
    #[arg(long, env = "SLIDE2ASSETS_IMAGE_MODEL")]
    image_model: Option<String>,

    /// Allow premium image-generation models.
    #[arg(long, env = "SLIDE2ASSETS_PREMIUM")]
    premium_access: bool,

    /// Elements processed concurrently.
    #[arg(short, long, env = "SLIDE2ASSETS_CONCURRENCY", default_value_t = 3)]
    concurrency: usize,

    /// Self-correction iterations per element.
    #[arg(long, env = "SLIDE2ASSETS_MAX_ATTEMPTS", default_value_t = 4)]
    max_attempts: u32,

    /// Minimum Critic score for a PASS to count (0–100).
    #[arg(long, env = "SLIDE2ASSETS_QA_THRESHOLD", default_value_t = 85,
          value_parser = clap::value_parser!(u8).range(0..=100))]
    qa_threshold: u8,

    /// Retries per stage call on model failure.
    #[arg(long, env = "SLIDE2ASSETS_MAX_RETRIES", default_value_t = 2)]
    max_retries: u32,

    /// Cleaner call timeout in seconds [default: 120].
    #[arg(long, env = "SLIDE2ASSETS_CLEANER_TIMEOUT")]
    cleaner_timeout: Option<u64>,

    /// Analyst and Critic call timeout in seconds [default: 60 / 120].
    #[arg(long, env = "SLIDE2ASSETS_API_TIMEOUT")]
    api_timeout: Option<u64>,

    /// Layout detection timeout in seconds [default: 120].
    #[arg(long, env = "SLIDE2ASSETS_DETECTION_TIMEOUT")]
    detection_timeout: Option<u64>,

    /// HTTP download timeout in seconds.
    #[arg(long, env = "SLIDE2ASSETS_DOWNLOAD_TIMEOUT", default_value_t = 120)]
    download_timeout: u64,

    /// Print the full manifest as JSON on stdout.
    #[arg(long, env = "SLIDE2ASSETS_JSON")]
    json: bool,

    /// Disable progress bar.
    #[arg(long, env = "SLIDE2ASSETS_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "SLIDE2ASSETS_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "SLIDE2ASSETS_QUIET")]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress bar replaces INFO-level library logs unless -v is given.
    let show_progress = !cli.quiet && !cli.no_progress && !cli.json && !cli.detect_only;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
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

    // ── Detect-only mode ─────────────────────────────────────────────────
    if cli.detect_only {
        let config = build_config(&cli, None)?;
        let layout = detect(&cli.input, &config)
            .await
            .context("Layout detection failed")?;
        println!(
            "{}",
            serde_json::to_string_pretty(&layout).context("Failed to serialise layout")?
        );
        return Ok(());
    }

    // ── Build config ─────────────────────────────────────────────────────
    let progress_cb: Option<ProgressCallback> = if show_progress {
        let cb = CliProgressCallback::new_dynamic();
        Some(cb as Arc<dyn ExtractionProgressCallback>)
    } else {
        None
    };
    let config = build_config(&cli, progress_cb)?;

    // ── Run ──────────────────────────────────────────────────────────────
    let output = match &cli.elements {
        Some(path) => {
            let layout = read_layout(path).await?;
            decompose_with_layout(&cli.input, layout, &config).await
        }
        None => decompose(&cli.input, &config).await,
    }
    .context("Decomposition failed")?;

    if let Some(ref dir) = cli.output {
        output
            .write_to_dir(dir)
            .await
            .with_context(|| format!("Failed to write assets to {}", dir.display()))?;
    }

    if cli.json {
        let json = serde_json::to_string_pretty(&output).context("Failed to serialise output")?;
        println!("{json}");
    }

    if !cli.quiet && !cli.json {
        print_summary(&output, cli.output.as_ref(), show_progress);
    }

    Ok(())
}

/// Map CLI args to `PipelineConfig`.
fn build_config(cli: &Cli, progress: Option<ProgressCallback>) -> Result<PipelineConfig> {
    let mut builder = PipelineConfig::builder()
        .premium_access(cli.premium_access)
        .concurrency(cli.concurrency)
        .max_attempts(cli.max_attempts)
        .qa_threshold(cli.qa_threshold)
        .max_stage_retries(cli.max_retries)
        .download_timeout_secs(cli.download_timeout);

    if let Some(secs) = cli.cleaner_timeout {
        builder = builder.cleaner_timeout_secs(secs);
    }
    if let Some(secs) = cli.api_timeout {
        builder = builder.analyst_timeout_secs(secs).critic_timeout_secs(secs);
    }
    if let Some(secs) = cli.detection_timeout {
        builder = builder.detection_timeout_secs(secs);
    }

    if let Some(ref p) = cli.provider {
        builder = builder.provider_name(p);
    }
    if let Some(ref m) = cli.detection_model {
        builder = builder.detection_model(m);
    }
    if let Some(ref m) = cli.analyst_model {
        builder = builder.analyst_model(m);
    }
    if let Some(ref m) = cli.text_model {
        builder = builder.text_model(m);
    }
    if let Some(ref m) = cli.critic_model {
        builder = builder.critic_model(m);
    }
    if let Some(ref m) = cli.shape_model {
        builder = builder.shape_model(m);
    }
    if let Some(ref m) = cli.icon_model {
        builder = builder.icon_model(m);
    }
    if let Some(ref m) = cli.image_model {
        builder = builder.image_model(m);
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }

    builder.build().context("Invalid configuration")
}

/// Read a layout file in the detector's reply format.
async fn read_layout(path: &PathBuf) -> Result<Detection> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read layout from {}", path.display()))?;
    Detection::parse(&text)
        .into_result()
        .with_context(|| format!("Invalid layout in {}", path.display()))
}

fn print_summary(output: &DecompositionOutput, dir: Option<&PathBuf>, show_progress: bool) {
    let stats = &output.stats;
    let tokens = stats.usage.total();

    if !show_progress {
        eprintln!(
            "Extracted {}/{} element(s) in {}ms ({} visual, {} text)",
            stats.completed,
            stats.total_elements,
            stats.total_duration_ms,
            stats.visual_elements,
            stats.text_elements
        );
        for report in output.elements.iter().filter(|r| r.failure.is_some()) {
            if let Some(ref failure) = report.failure {
                eprintln!("  {} {}: {}", red("✗"), report.id, failure);
            }
        }
    }

    match dir {
        Some(dir) => eprintln!(
            "{}  {}/{} elements  →  {}",
            if stats.failed == 0 { green("✔") } else { cyan("⚠") },
            stats.completed,
            stats.total_elements,
            bold(&dir.display().to_string()),
        ),
        None => eprintln!(
            "   {}",
            dim("no output directory given; pass -o DIR to write the assets")
        ),
    }
    eprintln!(
        "   {} calls  /  {} tokens in  /  {} tokens out  —  peak {} worker(s)",
        dim(&tokens.calls.to_string()),
        dim(&tokens.input_tokens.to_string()),
        dim(&tokens.output_tokens.to_string()),
        stats.peak_concurrency,
    );
}
