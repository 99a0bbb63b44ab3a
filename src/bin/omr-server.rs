//! HTTP server binary for edgequake-omr.
//!
//! A thin shim over the library crate that maps CLI flags (with `OMR_*`
//! environment fallbacks) to `GatewayConfig` and serves the router.

use anyhow::{Context, Result};
use clap::Parser;
use edgequake_omr::server::{self, AppState};
use edgequake_omr::{GatewayConfig, JobController, PreprocessConfig};
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Extra age, beyond the job timeout, before a workspace counts as orphaned.
const STALE_WORKSPACE_MARGIN: Duration = Duration::from_secs(60);

const AFTER_HELP: &str = r#"EXAMPLES:
  # Serve on the default port with Audiveris on PATH
  omr-server

  # Two jobs at a time, 10 minute budget per job
  omr-server --max-jobs 2 --job-timeout 600

  # Run a different engine; {input} and {output_dir} are substituted per job
  omr-server --engine-program /opt/omr/run.sh --engine-arg {input} --engine-arg {output_dir}

  # Convert a score
  curl -F file=@score.pdf http://localhost:8000/convert -o score.mxl

  # Follow progress as Server-Sent Events
  curl -N -F file=@score.png http://localhost:8000/convert/stream

ENGINE CONTRACT:
  The engine is started once per job inside a private workspace. It must
  write <stem>.<ext> (or <stem>/<stem>.<ext>) into {output_dir} and exit 0.
  Anything else is reported as an engine failure with its last output lines.
"#;

/// Optical music recognition as an HTTP service.
#[derive(Parser, Debug)]
#[command(
    name = "omr-server",
    version,
    about = "Serve an optical music recognition engine over HTTP",
    long_about = "Accept score images and PDFs over HTTP, run an external OMR engine \
(Audiveris by default) on each one in an isolated workspace, and return MusicXML. \
Progress can be followed live as Server-Sent Events.",
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Address to bind.
    #[arg(long, env = "OMR_HOST", default_value = "0.0.0.0")]
    host: String,

    /// Port to listen on.
    #[arg(short, long, env = "OMR_PORT", default_value_t = 8000)]
    port: u16,

    /// Maximum number of engine processes running at once.
    #[arg(long, env = "OMR_MAX_JOBS", default_value_t = 2,
          value_parser = clap::value_parser!(u64).range(1..))]
    max_jobs: u64,

    /// Maximum upload size in bytes.
    #[arg(long, env = "OMR_MAX_UPLOAD_BYTES", default_value_t = edgequake_omr::DEFAULT_MAX_UPLOAD_BYTES)]
    max_upload_bytes: u64,

    /// Wall-clock budget per job, in seconds.
    #[arg(long, env = "OMR_JOB_TIMEOUT", default_value_t = 300)]
    job_timeout: u64,

    /// How long a job may wait for a free engine slot, in seconds (0 = forever).
    #[arg(long, env = "OMR_QUEUE_TIMEOUT", default_value_t = 120)]
    queue_timeout: u64,

    /// Directory under which per-job workspaces are created.
    #[arg(long, env = "OMR_WORKSPACE_ROOT")]
    workspace_root: Option<PathBuf>,

    /// Engine executable.
    #[arg(long, env = "OMR_ENGINE", default_value = "audiveris")]
    engine_program: String,

    /// Engine argument template (repeatable). Placeholders: {input},
    /// {output_dir}, {stem}, {workspace}.
    #[arg(long = "engine-arg", env = "OMR_ENGINE_ARGS", value_delimiter = ' ',
          allow_hyphen_values = true)]
    engine_args: Vec<String>,

    /// Extension of the file the engine exports.
    #[arg(long, env = "OMR_ARTIFACT_EXT", default_value = "mxl")]
    artifact_extension: String,

    /// Address-space ceiling for the engine process, in MiB.
    #[arg(long, env = "OMR_ENGINE_MEMORY_MB")]
    engine_memory_mb: Option<u64>,

    /// Do not rasterise PDFs before handing them to the engine.
    #[arg(long, env = "OMR_NO_PDF_PRECONVERT")]
    no_pdf_preconvert: bool,

    /// Pre-conversion executable (ImageMagick).
    #[arg(long, env = "OMR_PRECONVERT_PROGRAM", default_value = "convert")]
    preconvert_program: String,

    /// Always rasterise PDFs, even when the engine could read them itself.
    #[arg(long, env = "OMR_ALWAYS_PRECONVERT")]
    always_preconvert: bool,

    /// Publish unrecognised engine output lines as detail events.
    #[arg(long, env = "OMR_FORWARD_ENGINE_OUTPUT")]
    forward_engine_output: bool,

    /// Kill the engine when the client disconnects.
    #[arg(long, env = "OMR_CANCEL_ON_DISCONNECT")]
    cancel_on_disconnect: bool,

    /// Seconds a finished job's events remain replayable.
    #[arg(long, env = "OMR_EVENT_RETENTION", default_value_t = 60)]
    event_retention: u64,

    /// Verbose logging (debug level).
    #[arg(short, long, env = "OMR_VERBOSE")]
    verbose: bool,
}

impl Cli {
    fn to_config(&self) -> Result<GatewayConfig> {
        let mut builder = GatewayConfig::builder()
            .max_concurrent_jobs(self.max_jobs as usize)
            .max_upload_bytes(self.max_upload_bytes)
            .job_timeout(Duration::from_secs(self.job_timeout))
            .permit_wait_timeout(
                (self.queue_timeout > 0).then(|| Duration::from_secs(self.queue_timeout)),
            )
            .engine_program(&self.engine_program)
            .artifact_extension(&self.artifact_extension)
            .memory_limit_bytes(self.engine_memory_mb.map(|mb| mb * 1024 * 1024))
            .forward_engine_output(self.forward_engine_output)
            .cancel_on_disconnect(self.cancel_on_disconnect)
            .event_retention(Duration::from_secs(self.event_retention));

        if !self.engine_args.is_empty() {
            builder = builder.engine_args(self.engine_args.iter().filter(|a| !a.is_empty()));
        }
        if let Some(root) = &self.workspace_root {
            builder = builder.workspace_root(root);
        }
        builder = if self.no_pdf_preconvert {
            builder.preprocess(None)
        } else {
            let defaults = PreprocessConfig::default();
            builder.preprocess(Some(PreprocessConfig {
                program: self.preconvert_program.clone(),
                native_pdf_check: (!self.always_preconvert)
                    .then_some(defaults.native_pdf_check.clone())
                    .flatten(),
                ..defaults
            }))
        };

        builder.build().context("Invalid server configuration")
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    let filter = if cli.verbose {
        "debug"
    } else {
        "info,tower_http=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    // ── Configuration ────────────────────────────────────────────────────
    let config = cli.to_config()?;
    info!(?config, "Starting omr-server {}", env!("CARGO_PKG_VERSION"));

    let controller = JobController::new(config);
    // Anything untouched for longer than a job can live is an orphan.
    let orphaned_after = controller.config().job_timeout + STALE_WORKSPACE_MARGIN;
    let swept = controller.workspaces().sweep_stale(orphaned_after);
    if swept > 0 {
        warn!(swept, "Cleaned up workspaces from a previous run");
    }

    // ── Serve ────────────────────────────────────────────────────────────
    let addr: SocketAddr = format!("{}:{}", cli.host, cli.port)
        .parse()
        .with_context(|| format!("Invalid bind address {}:{}", cli.host, cli.port))?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    server::serve(listener, AppState::new(controller), shutdown_signal())
        .await
        .context("Server error")?;

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Could not install Ctrl-C handler");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
