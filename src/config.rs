//! Configuration types for the conversion gateway.
//!
//! All orchestration behaviour is controlled through [`GatewayConfig`], built
//! via its [`GatewayConfigBuilder`]. Keeping every knob in one struct makes it
//! trivial to share the config across job tasks, log it at startup, and build
//! tiny deterministic configurations in tests (capacity 1, one-second
//! timeout, a shell-script engine).
//!
//! # Engine invocation templates
//!
//! The engine and the pre-conversion tool are described as a program plus an
//! argument template. Placeholders are substituted per job:
//!
//! | Placeholder    | Engine | Pre-conversion | Expands to |
//! |----------------|--------|----------------|------------|
//! | `{input}`      | ✓      | ✓              | input file inside the workspace |
//! | `{output}`     |        | ✓              | pre-conversion output file |
//! | `{output_dir}` | ✓      |                | `<workspace>/output` |
//! | `{stem}`       | ✓      |                | input file name without extension |
//! | `{workspace}`  | ✓      | ✓              | workspace root directory |

use crate::error::GatewayError;
use crate::translate::LineTranslator;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Default per-upload limit: 10 MiB.
pub const DEFAULT_MAX_UPLOAD_BYTES: u64 = 10 * 1024 * 1024;

/// Configuration for the job orchestrator.
///
/// Built via [`GatewayConfig::builder()`] or using
/// [`GatewayConfig::default()`].
///
/// # Example
/// ```rust
/// use edgequake_omr::GatewayConfig;
/// use std::time::Duration;
///
/// let config = GatewayConfig::builder()
///     .max_concurrent_jobs(4)
///     .job_timeout(Duration::from_secs(600))
///     .build()
///     .unwrap();
/// ```
#[derive(Clone)]
pub struct GatewayConfig {
    /// Maximum number of engine subprocesses running at once. Default: 2.
    ///
    /// Recognition engines are CPU- and memory-heavy (Audiveris routinely
    /// uses 1–2 GB per score). Two concurrent runs keep a 4-core, 8 GB host
    /// responsive; raise it on larger machines.
    pub max_concurrent_jobs: usize,

    /// Maximum accepted upload size in bytes. Default: 10 MiB.
    pub max_upload_bytes: u64,

    /// Wall-clock budget for one job, pre-conversion included. Default: 300 s.
    ///
    /// When exceeded the engine is killed and the job fails with `Timeout`.
    pub job_timeout: Duration,

    /// How long a job may wait for a concurrency slot. Default: 120 s.
    ///
    /// `None` waits forever. A job that times out here fails with
    /// `ServiceBusy` without ever touching the filesystem.
    pub permit_wait_timeout: Option<Duration>,

    /// Directory under which per-job workspaces are created.
    /// Default: `edgequake-omr` inside the system temp directory.
    pub workspace_root: PathBuf,

    /// Recognition engine invocation.
    pub engine: EngineConfig,

    /// Optional PDF → raster pre-conversion. Default: ImageMagick to TIFF.
    ///
    /// `None` hands PDFs to the engine unchanged.
    pub preprocess: Option<PreprocessConfig>,

    /// Number of trailing output lines kept for error reports. Default: 40.
    pub diagnostic_tail_lines: usize,

    /// Publish unrecognised engine output as low-priority detail events. Default: false.
    pub forward_engine_output: bool,

    /// Cancel a job when its streaming client disconnects. Default: false.
    ///
    /// By default the engine keeps running so a transient network drop does
    /// not throw away minutes of recognition work; a late subscriber can
    /// re-attach through `GET /jobs/{id}/events`.
    pub cancel_on_disconnect: bool,

    /// How long a finished job's event log stays available for replay. Default: 60 s.
    pub event_retention: Duration,

    /// Custom engine-output translator. If None, uses [`crate::translate::MarkerTranslator`].
    pub translator: Option<Arc<dyn LineTranslator>>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 2,
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            job_timeout: Duration::from_secs(300),
            permit_wait_timeout: Some(Duration::from_secs(120)),
            workspace_root: std::env::temp_dir().join("edgequake-omr"),
            engine: EngineConfig::default(),
            preprocess: Some(PreprocessConfig::default()),
            diagnostic_tail_lines: 40,
            forward_engine_output: false,
            cancel_on_disconnect: false,
            event_retention: Duration::from_secs(60),
            translator: None,
        }
    }
}

impl fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("max_concurrent_jobs", &self.max_concurrent_jobs)
            .field("max_upload_bytes", &self.max_upload_bytes)
            .field("job_timeout", &self.job_timeout)
            .field("permit_wait_timeout", &self.permit_wait_timeout)
            .field("workspace_root", &self.workspace_root)
            .field("engine", &self.engine)
            .field("preprocess", &self.preprocess)
            .field("diagnostic_tail_lines", &self.diagnostic_tail_lines)
            .field("forward_engine_output", &self.forward_engine_output)
            .field("cancel_on_disconnect", &self.cancel_on_disconnect)
            .field("event_retention", &self.event_retention)
            .field(
                "translator",
                &self.translator.as_ref().map(|_| "<dyn LineTranslator>"),
            )
            .finish()
    }
}

impl GatewayConfig {
    /// Create a new builder for `GatewayConfig`.
    pub fn builder() -> GatewayConfigBuilder {
        GatewayConfigBuilder {
            config: Self::default(),
        }
    }
}

/// How to launch the recognition engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Executable name or path. Default: `audiveris`.
    pub program: String,

    /// Argument template (see module docs for placeholders).
    pub args: Vec<String>,

    /// Extension of the artifact the engine writes, without the dot. Default: `mxl`.
    pub artifact_extension: String,

    /// Media type reported for the artifact. Default: `application/vnd.recordare.musicxml+xml`.
    pub artifact_media_type: String,

    /// Address-space ceiling applied to the child at launch. Default: none.
    ///
    /// Enforced with `setrlimit(RLIMIT_AS)` on Unix. Note that JVM-based
    /// engines reserve far more virtual memory than they touch; size this
    /// generously or prefer a cgroup limit on the host.
    pub memory_limit_bytes: Option<u64>,

    /// Extra environment variables for the child.
    pub env: Vec<(String, String)>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            program: "audiveris".to_string(),
            args: vec![
                "-batch".to_string(),
                "-export".to_string(),
                "-output".to_string(),
                "{output_dir}".to_string(),
                "--".to_string(),
                "{input}".to_string(),
            ],
            artifact_extension: "mxl".to_string(),
            artifact_media_type: "application/vnd.recordare.musicxml+xml".to_string(),
            memory_limit_bytes: None,
            env: Vec::new(),
        }
    }
}

/// How to normalise a PDF into something the engine reads reliably.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreprocessConfig {
    /// Executable name or path. Default: `convert` (ImageMagick).
    pub program: String,

    /// Argument template; must reference `{input}` and `{output}`.
    pub args: Vec<String>,

    /// Extension of the produced file, without the dot. Default: `tiff`.
    pub output_extension: String,

    /// Command telling whether the engine reads PDFs on its own.
    ///
    /// Run once, on the first PDF. A zero exit means the engine's PDF
    /// backend is installed and the document is handed over unconverted.
    /// `None` always pre-converts. Default: loading the JPod interpreter
    /// class from the Audiveris install.
    pub native_pdf_check: Option<Vec<String>>,
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            program: "convert".to_string(),
            args: vec![
                "-density".to_string(),
                "300".to_string(),
                "{input}".to_string(),
                "-colorspace".to_string(),
                "Gray".to_string(),
                "{output}".to_string(),
            ],
            output_extension: "tiff".to_string(),
            native_pdf_check: Some(vec![
                "java".to_string(),
                "-cp".to_string(),
                "/opt/audiveris/lib/*".to_string(),
                "de.intarsys.pdf.content.CSInterpreter".to_string(),
            ]),
        }
    }
}

/// Builder for [`GatewayConfig`].
#[derive(Debug)]
pub struct GatewayConfigBuilder {
    config: GatewayConfig,
}

impl GatewayConfigBuilder {
    pub fn max_concurrent_jobs(mut self, n: usize) -> Self {
        self.config.max_concurrent_jobs = n;
        self
    }

    pub fn max_upload_bytes(mut self, bytes: u64) -> Self {
        self.config.max_upload_bytes = bytes;
        self
    }

    pub fn job_timeout(mut self, timeout: Duration) -> Self {
        self.config.job_timeout = timeout;
        self
    }

    pub fn permit_wait_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.permit_wait_timeout = timeout;
        self
    }

    pub fn workspace_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.config.workspace_root = root.into();
        self
    }

    pub fn engine(mut self, engine: EngineConfig) -> Self {
        self.config.engine = engine;
        self
    }

    pub fn engine_program(mut self, program: impl Into<String>) -> Self {
        self.config.engine.program = program.into();
        self
    }

    pub fn engine_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.engine.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn artifact_extension(mut self, ext: impl Into<String>) -> Self {
        self.config.engine.artifact_extension = ext.into().trim_start_matches('.').to_string();
        self
    }

    pub fn artifact_media_type(mut self, media_type: impl Into<String>) -> Self {
        self.config.engine.artifact_media_type = media_type.into();
        self
    }

    pub fn memory_limit_bytes(mut self, limit: Option<u64>) -> Self {
        self.config.engine.memory_limit_bytes = limit;
        self
    }

    pub fn preprocess(mut self, preprocess: Option<PreprocessConfig>) -> Self {
        self.config.preprocess = preprocess;
        self
    }

    pub fn diagnostic_tail_lines(mut self, n: usize) -> Self {
        self.config.diagnostic_tail_lines = n;
        self
    }

    pub fn forward_engine_output(mut self, v: bool) -> Self {
        self.config.forward_engine_output = v;
        self
    }

    pub fn cancel_on_disconnect(mut self, v: bool) -> Self {
        self.config.cancel_on_disconnect = v;
        self
    }

    pub fn event_retention(mut self, retention: Duration) -> Self {
        self.config.event_retention = retention;
        self
    }

    pub fn translator(mut self, translator: Arc<dyn LineTranslator>) -> Self {
        self.config.translator = Some(translator);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<GatewayConfig, GatewayError> {
        let c = &self.config;
        if c.max_concurrent_jobs == 0 {
            return Err(GatewayError::InvalidConfig(
                "max_concurrent_jobs must be ≥ 1".into(),
            ));
        }
        if c.max_upload_bytes == 0 {
            return Err(GatewayError::InvalidConfig(
                "max_upload_bytes must be ≥ 1".into(),
            ));
        }
        if c.job_timeout.is_zero() {
            return Err(GatewayError::InvalidConfig(
                "job_timeout must be greater than zero".into(),
            ));
        }
        if c.engine.program.trim().is_empty() {
            return Err(GatewayError::InvalidConfig(
                "engine program must not be empty".into(),
            ));
        }
        if !c.engine.args.iter().any(|a| a.contains("{input}")) {
            return Err(GatewayError::InvalidConfig(
                "engine args must reference {input}".into(),
            ));
        }
        if c.engine.artifact_extension.is_empty() {
            return Err(GatewayError::InvalidConfig(
                "artifact_extension must not be empty".into(),
            ));
        }
        if let Some(pre) = &c.preprocess {
            let has = |p: &str| pre.args.iter().any(|a| a.contains(p));
            if !has("{input}") || !has("{output}") {
                return Err(GatewayError::InvalidConfig(
                    "preprocess args must reference {input} and {output}".into(),
                ));
            }
            if pre.native_pdf_check.as_ref().is_some_and(|cmd| cmd.is_empty()) {
                return Err(GatewayError::InvalidConfig(
                    "native_pdf_check must name a program".into(),
                ));
            }
        }
        Ok(self.config)
    }
}
