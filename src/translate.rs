//! Translation of raw engine output into semantic progress stages.
//!
//! ## Why translate at all?
//!
//! The engine prints hundreds of log lines per page: timings, step banners,
//! JVM noise, warnings about staff heights. Clients want to know *where* the
//! job is, not read the log. A [`LineTranslator`] looks at one line at a time
//! and, if the line marks the start of a recognisable engine step, returns
//! the [`EngineStage`] it belongs to. Anything else returns `None` and is
//! left for the diagnostic tail.
//!
//! Translators never drive the job state machine. Only process exit,
//! artifact presence, and timeout move a job between states; a translated
//! stage is purely informational.
//!
//! ## Swapping translators
//!
//! [`MarkerTranslator`] understands the step names of the default engine.
//! A different engine gets its own implementation of [`LineTranslator`],
//! installed through [`crate::config::GatewayConfigBuilder::translator`].

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::fmt;

/// Maps one line of engine output to a progress stage, if it marks one.
pub trait LineTranslator: Send + Sync {
    fn translate(&self, line: &str) -> Option<EngineStage>;
}

/// Closed set of progress stages reported while the engine runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineStage {
    Loading,
    Binarizing,
    Scaling,
    DetectingStaves,
    RecognisingSymbols,
    BuildingRhythm,
    AssemblingPage,
    Exporting,
}

impl EngineStage {
    /// Client-facing progress message.
    pub fn message(self) -> &'static str {
        match self {
            EngineStage::Loading => "Loading image",
            EngineStage::Binarizing => "Binarizing image",
            EngineStage::Scaling => "Measuring staff scale",
            EngineStage::DetectingStaves => "Detecting staves",
            EngineStage::RecognisingSymbols => "Recognising symbols",
            EngineStage::BuildingRhythm => "Building measures and rhythm",
            EngineStage::AssemblingPage => "Assembling page",
            EngineStage::Exporting => "Exporting MusicXML",
        }
    }
}

impl fmt::Display for EngineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

// ── Default engine markers ───────────────────────────────────────────────────

/// Step banners look like `INFO  [score] StepMonitor ... | GRID  ...` or
/// `... Step HEADS done`; match the step name as a standalone upper-case word.
static RE_STEP: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"\b(LOAD|BINARY|SCALE|GRID|HEADERS|STEM_SEEDS|BEAMS|LEDGERS|HEADS|STEMS|REDUCTION|CUE_BEAMS|TEXTS|MEASURES|CHORDS|CURVES|SYMBOLS|LINKS|RHYTHMS|PAGE)\b",
    )
    .unwrap()
});

/// Export notices: `Exporting score to ...` or `Score exported to ...`.
/// A bare `-export` (the engine echoing its command line) is not one.
static RE_EXPORT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:^|\s)(?:[Ee]xporting\s|[Ee]xported\s+to\b)").unwrap());

fn stage_for_step(step: &str) -> Option<EngineStage> {
    let stage = match step {
        "LOAD" => EngineStage::Loading,
        "BINARY" => EngineStage::Binarizing,
        "SCALE" => EngineStage::Scaling,
        "GRID" | "HEADERS" => EngineStage::DetectingStaves,
        "STEM_SEEDS" | "BEAMS" | "LEDGERS" | "HEADS" | "STEMS" | "REDUCTION" | "CUE_BEAMS"
        | "TEXTS" | "CURVES" | "SYMBOLS" => EngineStage::RecognisingSymbols,
        "MEASURES" | "CHORDS" | "LINKS" | "RHYTHMS" => EngineStage::BuildingRhythm,
        "PAGE" => EngineStage::AssemblingPage,
        _ => return None,
    };
    Some(stage)
}

/// Translator for the step names printed by the default engine.
#[derive(Debug, Clone, Copy, Default)]
pub struct MarkerTranslator;

impl LineTranslator for MarkerTranslator {
    fn translate(&self, line: &str) -> Option<EngineStage> {
        if let Some(stage) = RE_STEP
            .captures(line)
            .and_then(|c| c.get(1))
            .and_then(|m| stage_for_step(m.as_str()))
        {
            return Some(stage);
        }
        RE_EXPORT.is_match(line).then_some(EngineStage::Exporting)
    }
}

/// Collapses consecutive duplicate stages.
///
/// The engine reports a step once per system or per sheet, so the same
/// stage can be announced many times in a row.
#[derive(Debug, Default)]
pub struct StageTracker {
    current: Option<EngineStage>,
}

impl StageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the stage if it differs from the last one reported.
    pub fn observe(&mut self, stage: EngineStage) -> Option<EngineStage> {
        if self.current == Some(stage) {
            return None;
        }
        self.current = Some(stage);
        Some(stage)
    }
}
