use std::sync::Arc;

use rama::{error::BoxError, telemetry::tracing};

use crate::{
    events::{Event, EventLog, EventType},
    package::{PackageVersion, TrustedPackage, is_trusted_package},
};

use super::{Action, AnalysisResult, Analyzer, AnalysisCache, DynAnalyzer};

/// The decision engine: trust/insecure bypass, cache, analyzer, paranoid
/// escalation, in that order. Shared between the guard pipeline and all proxy
/// interceptors.
#[derive(Debug, Clone)]
pub struct DecisionEngine {
    analyzer: DynAnalyzer,
    cache: AnalysisCache,
    trusted: Arc<[TrustedPackage]>,
    events: EventLog,
    paranoid: bool,
    insecure_installation: bool,
}

impl DecisionEngine {
    pub fn new(analyzer: DynAnalyzer, cache: AnalysisCache, events: EventLog) -> Self {
        Self {
            analyzer,
            cache,
            trusted: Arc::from([]),
            events,
            paranoid: false,
            insecure_installation: false,
        }
    }

    pub fn with_trusted_packages(mut self, trusted: Vec<TrustedPackage>) -> Self {
        self.trusted = trusted.into();
        self
    }

    pub fn with_paranoid(mut self, paranoid: bool) -> Self {
        self.paranoid = paranoid;
        self
    }

    pub fn with_insecure_installation(mut self, insecure: bool) -> Self {
        self.insecure_installation = insecure;
        self
    }

    pub fn cache(&self) -> &AnalysisCache {
        &self.cache
    }

    pub fn is_trusted(&self, pkg: &PackageVersion) -> bool {
        is_trusted_package(&self.trusted, Some(pkg))
    }

    /// Decide the action for a package coordinate.
    ///
    /// Analyzer errors propagate; callers treat them as "skipped", never as a
    /// Block. The input coordinate is never mutated, unresolved versions must
    /// be bound by the caller beforehand.
    pub async fn decide(&self, pkg: &PackageVersion) -> Result<Arc<AnalysisResult>, BoxError> {
        if self.insecure_installation {
            self.events.record(Event::for_package(
                EventType::InstallTrustedAllowed,
                "insecure installation enabled, skipping analysis",
                pkg,
            ));
            return Ok(Arc::new(AnalysisResult::allowed(
                pkg.clone(),
                "insecure installation enabled",
            )));
        }

        if self.is_trusted(pkg) {
            self.events.record(Event::for_package(
                EventType::InstallTrustedAllowed,
                "package is on the trust list",
                pkg,
            ));
            return Ok(Arc::new(AnalysisResult::allowed(
                pkg.clone(),
                "trusted package",
            )));
        }

        if let Some(cached) = self.cache.get(pkg) {
            tracing::trace!(package = %pkg, "analysis cache hit");
            return Ok(cached);
        }

        let result = self.analyzer.analyze(pkg.clone()).await?;
        let result = Arc::new(self.escalate(result));
        self.cache.set(result.clone());
        Ok(result)
    }

    /// Paranoid mode promotes Confirm to Block. Escalation happens before the
    /// result is published to the cache so that cache hits observe the same
    /// action as the first decision.
    fn escalate(&self, result: AnalysisResult) -> AnalysisResult {
        if self.paranoid && result.action == Action::Confirm {
            tracing::debug!(
                package = %result.package,
                "paranoid mode: escalating confirm decision to block"
            );
            result.with_action(Action::Block)
        } else {
            result
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::package::{Ecosystem, trust::{TrustedPackageEntry, parse_trusted_packages}};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Scripted analyzer: returns a fixed action per package name and counts
    /// invocations.
    struct ScriptedAnalyzer {
        calls: Arc<AtomicUsize>,
    }

    impl ScriptedAnalyzer {
        fn new() -> (Self, Arc<AtomicUsize>) {
            let calls = Arc::new(AtomicUsize::new(0));
            (
                Self {
                    calls: calls.clone(),
                },
                calls,
            )
        }
    }

    impl Analyzer for ScriptedAnalyzer {
        async fn analyze(&self, pkg: PackageVersion) -> Result<AnalysisResult, BoxError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let action = match pkg.name() {
                name if name.contains("malicious") => Action::Block,
                name if name.contains("suspicious") => Action::Confirm,
                name if name.contains("broken") => {
                    return Err(BoxError::from("analyzer transport error"));
                }
                _ => Action::Allow,
            };
            Ok(AnalysisResult::allowed(pkg, "scripted").with_action(action))
        }
    }

    fn engine(paranoid: bool) -> (DecisionEngine, Arc<AtomicUsize>) {
        let (analyzer, calls) = ScriptedAnalyzer::new();
        let engine = DecisionEngine::new(
            analyzer.into_dyn(),
            AnalysisCache::new(),
            EventLog::disabled(),
        )
        .with_paranoid(paranoid);
        (engine, calls)
    }

    fn pkg(name: &str) -> PackageVersion {
        PackageVersion::new(Ecosystem::Npm, name, "1.0.0")
    }

    #[tokio::test]
    async fn test_decide_pipeline_order() {
        let (engine, calls) = engine(false);

        let result = engine.decide(&pkg("left-pad")).await.unwrap();
        assert_eq!(result.action, Action::Allow);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // second decision is a cache hit, not another analyzer call
        let cached = engine.decide(&pkg("left-pad")).await.unwrap();
        assert!(Arc::ptr_eq(&result, &cached));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_trusted_package_bypasses_analyzer() {
        let (engine, calls) = engine(false);
        let engine = engine.with_trusted_packages(parse_trusted_packages(&[
            TrustedPackageEntry {
                purl: "pkg:npm/malicious-but-trusted".to_owned(),
                reason: "internal fork".to_owned(),
            },
        ]));

        let result = engine.decide(&pkg("malicious-but-trusted")).await.unwrap();
        assert_eq!(result.action, Action::Allow);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(!engine.cache().has(&pkg("malicious-but-trusted")));
    }

    #[tokio::test]
    async fn test_insecure_installation_allows_everything() {
        let (engine, calls) = engine(false);
        let engine = engine.with_insecure_installation(true);

        let result = engine.decide(&pkg("malicious-pkg")).await.unwrap();
        assert_eq!(result.action, Action::Allow);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_paranoid_escalates_confirm_to_block() {
        let (engine, _) = engine(true);
        let result = engine.decide(&pkg("suspicious-pkg")).await.unwrap();
        assert_eq!(result.action, Action::Block);

        // the escalated action is what the cache republishes
        let cached = engine.decide(&pkg("suspicious-pkg")).await.unwrap();
        assert_eq!(cached.action, Action::Block);
    }

    #[tokio::test]
    async fn test_paranoid_never_touches_allow_or_block() {
        let (engine, _) = engine(true);
        assert_eq!(
            engine.decide(&pkg("left-pad")).await.unwrap().action,
            Action::Allow
        );
        assert_eq!(
            engine.decide(&pkg("malicious-pkg")).await.unwrap().action,
            Action::Block
        );
    }

    #[tokio::test]
    async fn test_analyzer_errors_propagate_without_caching() {
        let (engine, _) = engine(false);
        let err = engine.decide(&pkg("broken-pkg")).await.unwrap_err();
        assert!(err.to_string().contains("transport error"));
        assert!(!engine.cache().has(&pkg("broken-pkg")));
    }
}
