use std::{fmt, sync::Arc};

use rama::utils::str::arcstr::ArcStr;

use crate::package::PackageVersion;

pub mod analyzer;
pub mod cache;
pub mod confirm;
pub mod decision;

pub use self::analyzer::{ActiveScanAnalyzer, Analyzer, DynAnalyzer, QueryAnalyzer};
pub use self::cache::AnalysisCache;
pub use self::confirm::{
    ConfirmationBroker, ConfirmationPrompt, ConfirmationRequest, ConfirmationSender,
    DynConfirmationPrompt,
};
pub use self::decision::DecisionEngine;

/// Policy decision for a single package coordinate.
///
/// `Unknown` only exists as the zero value; the analyzer mapping is total and
/// never hands `Unknown` to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Action {
    #[default]
    Unknown,
    Allow,
    Confirm,
    Block,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Unknown => "unknown",
            Action::Allow => "allow",
            Action::Confirm => "confirm",
            Action::Block => "block",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.as_str().fmt(f)
    }
}

/// Outcome of analyzing one package coordinate.
///
/// Results are immutable after creation and shared behind [`Arc`] between the
/// cache, the guard aggregation and the proxy interceptors.
#[derive(Debug, Clone)]
pub struct AnalysisResult {
    pub package: PackageVersion,
    pub analysis_id: ArcStr,
    pub action: Action,
    pub summary: ArcStr,
    pub reference_url: ArcStr,
    /// Raw analyzer report, kept opaque for forensics.
    pub raw_report: Option<Arc<serde_json::Value>>,
}

impl AnalysisResult {
    /// Synthesized allow result for bypass paths (trusted / insecure mode).
    pub fn allowed(package: PackageVersion, summary: impl AsRef<str>) -> Self {
        Self {
            package,
            analysis_id: ArcStr::default(),
            action: Action::Allow,
            summary: ArcStr::from(summary.as_ref()),
            reference_url: ArcStr::default(),
            raw_report: None,
        }
    }

    /// Same result with a different action (used for paranoid escalation).
    pub fn with_action(&self, action: Action) -> Self {
        Self {
            action,
            ..self.clone()
        }
    }
}
