//! Format pre-conversion: turn a PDF into a raster the engine reads reliably.
//!
//! The default engine's PDF support depends on optional libraries that are
//! frequently missing in containers. Rasterising with ImageMagick first
//! (`convert -density 300 in.pdf -colorspace Gray in.tiff`) sidesteps that.
//! The tool runs inside the job workspace through the same
//! [`ProcessRunner`] contract as the engine, under the same job deadline.
//!
//! When the engine's own PDF backend is installed, [`engine_reads_pdf`]
//! reports it and PDFs go to the engine untouched.

use crate::config::PreprocessConfig;
use crate::error::{EngineFailure, GatewayError};
use crate::job::JobId;
use crate::pipeline::input::DocumentKind;
use crate::pipeline::runner::{expand_args, Deadline, Invocation, ProcessRunner};
use crate::pipeline::workspace::{file_stem, Workspace};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Upper bound on the native PDF support check.
const NATIVE_PDF_CHECK_TIMEOUT: Duration = Duration::from_secs(30);

/// Whether a document of `kind` goes through pre-conversion.
pub fn needs_preprocess(kind: DocumentKind, config: Option<&PreprocessConfig>) -> bool {
    kind == DocumentKind::Pdf && config.is_some()
}

/// Whether the engine can read PDFs itself, judged by running `command`.
///
/// A zero exit means yes. Anything else (a non-zero exit, a launch failure,
/// running past [`NATIVE_PDF_CHECK_TIMEOUT`]) means the PDF is pre-converted.
pub async fn engine_reads_pdf(command: &[String]) -> bool {
    let Some((program, args)) = command.split_first() else {
        return false;
    };
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .status();
    match tokio::time::timeout(NATIVE_PDF_CHECK_TIMEOUT, output).await {
        Ok(Ok(status)) => {
            info!(%program, %status, native = status.success(), "Checked engine PDF support");
            status.success()
        }
        Ok(Err(e)) => {
            info!(%program, error = %e, "Engine PDF support check could not run");
            false
        }
        Err(_) => {
            warn!(%program, "Engine PDF support check timed out");
            false
        }
    }
}

/// Run the pre-conversion tool on `input` and return the converted file.
///
/// The result lands next to the input as `input/<stem>.<output_extension>`.
/// Tool failures come back as [`EngineFailure::Preprocess`]; a timeout or
/// cancellation keeps its own variant.
pub async fn normalise(
    runner: &ProcessRunner,
    job_id: JobId,
    workspace: &Workspace,
    input: &Path,
    config: &PreprocessConfig,
    deadline: Deadline,
    cancel: CancellationToken,
) -> Result<PathBuf, GatewayError> {
    let input_name = input
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let stem = file_stem(&input_name).to_string();
    let output = workspace
        .input_dir()
        .join(format!("{stem}.{}", config.output_extension));

    let input_str = input.to_string_lossy();
    let output_str = output.to_string_lossy();
    let workspace_str = workspace.path().to_string_lossy();
    let args = expand_args(
        &config.args,
        &[
            ("input", &*input_str),
            ("output", &*output_str),
            ("stem", stem.as_str()),
            ("workspace", &*workspace_str),
        ],
    );

    info!(job_id = %job_id, program = %config.program, "Pre-converting input");
    let invocation = Invocation::new(config.program.clone(), args);
    let mut process = runner
        .run(job_id, workspace, &invocation, deadline, cancel)
        .map_err(|e| as_preprocess(e, &config.program))?;

    while let Some(line) = process.next_line().await {
        debug!(job_id = %job_id, "preprocess: {}", line.text);
    }

    process
        .finish(std::slice::from_ref(&output))
        .await
        .map_err(|e| as_preprocess(e, &config.program))
}

fn as_preprocess(err: GatewayError, program: &str) -> GatewayError {
    let (detail, tail) = match err {
        GatewayError::Engine(EngineFailure::Spawn { reason, .. }) => {
            (format!("could not launch '{program}': {reason}"), Default::default())
        }
        GatewayError::Engine(EngineFailure::NonZeroExit { code, tail }) => {
            (format!("'{program}' exited with code {code}"), tail)
        }
        GatewayError::Engine(EngineFailure::MissingArtifact { expected, tail }) => {
            (format!("'{program}' did not produce '{expected}'"), tail)
        }
        GatewayError::Engine(EngineFailure::KilledByLimit { reason, tail }) => {
            (format!("'{program}' was killed ({reason})"), tail)
        }
        other => return other,
    };
    EngineFailure::Preprocess { detail, tail }.into()
}
