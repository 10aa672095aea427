use std::{
    collections::{HashMap, HashSet},
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use rama::{error::BoxError, telemetry::tracing};
use tokio::sync::mpsc;

use crate::{
    analysis::{Action, AnalysisResult, ConfirmationSender, DecisionEngine},
    events::{Event, EventLog, EventType},
    package::PackageVersion,
};

pub mod intent;
pub mod resolve;

mod exec;
mod screen;

pub use self::intent::{InstallIntent, IntentError, PackageManager, parse_install_intent};
pub use self::resolve::{
    DependencyResolver, DynDependencyResolver, ManifestExtractor, ManifestFileExtractor,
    RegistryResolver,
};
pub use self::screen::{print_block_screen, render_block_screen};

pub const DEFAULT_MAX_CONCURRENT_ANALYZES: usize = 10;
pub const DEFAULT_ANALYSIS_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, thiserror::Error)]
pub enum GuardError {
    #[error("failed to parse install intent: {0}")]
    Intent(#[from] IntentError),
    #[error("failed to resolve {package}: {source}")]
    Resolve {
        package: String,
        #[source]
        source: BoxError,
    },
    #[error("analysis timed out after {0:?}")]
    AnalysisTimeout(Duration),
    #[error("failed to execute the package manager: {0}")]
    Subprocess(std::io::Error),
}

/// How a guarded invocation ended.
#[derive(Debug)]
pub enum GuardOutcome {
    /// The real package manager ran; its exit code passes through verbatim.
    Completed { exit_code: i32 },
    /// A Block decision (or a declined confirmation) withheld the subprocess.
    Blocked {
        result: Arc<AnalysisResult>,
        /// True when the user declined a confirmation; the block screen then
        /// omits the reference section.
        user_declined: bool,
    },
    /// Dry-run mode: analysis ran, the subprocess did not.
    DryRun,
}

impl GuardOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            GuardOutcome::Completed { exit_code } => *exit_code,
            GuardOutcome::Blocked { .. } => 1,
            GuardOutcome::DryRun => 0,
        }
    }
}

#[derive(Debug, Default)]
struct Aggregation {
    blocked: Option<Arc<AnalysisResult>>,
    confirms: Vec<Arc<AnalysisResult>>,
    allowed: usize,
    skipped: usize,
}

/// The guard pipeline: resolve install targets, fan analyses out over a
/// bounded worker pool, aggregate, funnel confirmations through the broker,
/// then either abort or hand off to the real package manager.
pub struct GuardPipeline {
    engine: DecisionEngine,
    confirmations: ConfirmationSender,
    events: EventLog,
    resolver: Option<DynDependencyResolver>,
    extractor: Option<Arc<dyn ManifestExtractor>>,
    sandbox_policy: Option<pmg_sandbox::ResolvedPolicy>,
    child_env: HashMap<String, String>,
    max_concurrent_analyzes: usize,
    analysis_timeout: Duration,
    transitive: bool,
    transitive_depth: u32,
    include_dev_dependencies: bool,
    dry_run: bool,
    insecure_installation: bool,
}

impl std::fmt::Debug for GuardPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuardPipeline")
            .field("transitive", &self.transitive)
            .field("dry_run", &self.dry_run)
            .finish()
    }
}

impl GuardPipeline {
    pub fn new(
        engine: DecisionEngine,
        confirmations: ConfirmationSender,
        events: EventLog,
    ) -> Self {
        Self {
            engine,
            confirmations,
            events,
            resolver: None,
            extractor: Some(Arc::new(ManifestFileExtractor)),
            sandbox_policy: None,
            child_env: HashMap::new(),
            max_concurrent_analyzes: DEFAULT_MAX_CONCURRENT_ANALYZES,
            analysis_timeout: DEFAULT_ANALYSIS_TIMEOUT,
            transitive: true,
            transitive_depth: 3,
            include_dev_dependencies: false,
            dry_run: false,
            insecure_installation: false,
        }
    }

    pub fn with_resolver(mut self, resolver: DynDependencyResolver) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn with_extractor(mut self, extractor: Arc<dyn ManifestExtractor>) -> Self {
        self.extractor = Some(extractor);
        self
    }

    pub fn with_sandbox_policy(mut self, policy: Option<pmg_sandbox::ResolvedPolicy>) -> Self {
        self.sandbox_policy = policy;
        self
    }

    pub fn with_child_env(mut self, env: HashMap<String, String>) -> Self {
        self.child_env = env;
        self
    }

    pub fn with_max_concurrent_analyzes(mut self, max: usize) -> Self {
        self.max_concurrent_analyzes = max.max(1);
        self
    }

    pub fn with_analysis_timeout(mut self, timeout: Duration) -> Self {
        self.analysis_timeout = timeout;
        self
    }

    pub fn with_transitive(mut self, transitive: bool, depth: u32) -> Self {
        self.transitive = transitive;
        self.transitive_depth = depth;
        self
    }

    pub fn with_include_dev_dependencies(mut self, include_dev: bool) -> Self {
        self.include_dev_dependencies = include_dev;
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_insecure_installation(mut self, insecure: bool) -> Self {
        self.insecure_installation = insecure;
        self
    }

    /// Run the guarded installation end to end.
    pub async fn run(&self, intent: InstallIntent) -> Result<GuardOutcome, GuardError> {
        self.events.record(Event::new(
            EventType::InstallStarted,
            format!("guarding {} invocation", intent.package_manager),
        ));

        if self.insecure_installation {
            tracing::warn!("insecure installation enabled: forwarding without analysis");
            return self.forward(&intent).await;
        }

        let work = self.collect_work(&intent).await?;
        if !work.is_empty() {
            let aggregation = self.analyze_packages(work).await?;

            if let Some(result) = aggregation.blocked {
                self.events.record(Event::for_package(
                    EventType::MalwareBlocked,
                    "blocked malicious package installation",
                    &result.package,
                ));
                return Ok(GuardOutcome::Blocked {
                    result,
                    user_declined: false,
                });
            }

            for result in aggregation.confirms {
                let confirmed = self
                    .confirmations
                    .request_confirmation(result.clone())
                    .await
                    .unwrap_or_else(|err| {
                        tracing::warn!(
                            package = %result.package,
                            "confirmation unavailable, treating as declined: {err}"
                        );
                        false
                    });
                if !confirmed {
                    self.events.record(Event::for_package(
                        EventType::MalwareBlocked,
                        "user declined suspicious package installation",
                        &result.package,
                    ));
                    return Ok(GuardOutcome::Blocked {
                        result,
                        user_declined: true,
                    });
                }
                self.events.record(Event::for_package(
                    EventType::MalwareConfirmed,
                    "user approved suspicious package installation",
                    &result.package,
                ));
            }

            self.events.record(Event::new(
                EventType::InstallAllowed,
                format!(
                    "{} packages allowed, {} skipped after analysis errors",
                    aggregation.allowed, aggregation.skipped
                ),
            ));
        }

        self.forward(&intent).await
    }

    /// Build the analysis work list: explicit targets (manifest-extracted if
    /// none), versions bound via the resolver, transitive closure appended,
    /// trusted coordinates dropped, duplicates collapsed.
    async fn collect_work(
        &self,
        intent: &InstallIntent,
    ) -> Result<Vec<PackageVersion>, GuardError> {
        let mut targets = intent.targets.clone();

        if targets.is_empty()
            && intent.is_manifest_install
            && let Some(extractor) = &self.extractor
        {
            let workdir = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
            match extractor.extract(
                &workdir,
                intent.manifest_files.clone(),
                self.include_dev_dependencies,
            ) {
                Ok(extracted) => targets = extracted,
                Err(err) => {
                    // extractor failure is fail-open: the manifest install
                    // proceeds unanalyzed rather than broken
                    tracing::warn!("manifest extraction failed, skipping analysis: {err}");
                }
            }
        }

        let mut work = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();

        for target in targets {
            let target = self.bind_version(target).await?;

            if self.transitive
                && let Some(resolver) = &self.resolver
                && target.is_resolved()
            {
                let closure = resolver
                    .dependency_closure(
                        target.clone(),
                        self.transitive_depth,
                        self.include_dev_dependencies,
                    )
                    .await
                    .map_err(|source| GuardError::Resolve {
                        package: target.purl(),
                        source,
                    })?;
                for dep in closure {
                    push_work(&self.engine, &mut work, &mut seen, dep);
                }
            }

            push_work(&self.engine, &mut work, &mut seen, target);
        }

        Ok(work)
    }

    /// Bind an unresolved target to the latest published version. A resolver
    /// failure for a declared install target is fatal.
    async fn bind_version(&self, target: PackageVersion) -> Result<PackageVersion, GuardError> {
        if target.is_resolved() {
            return Ok(target);
        }
        let Some(resolver) = &self.resolver else {
            tracing::debug!(package = %target, "no resolver wired, analyzing unversioned");
            return Ok(target);
        };
        let version = resolver
            .latest_version(target.clone())
            .await
            .map_err(|source| GuardError::Resolve {
                package: target.purl(),
                source,
            })?;
        Ok(target.with_version(version.as_str()))
    }

    async fn analyze_packages(
        &self,
        work: Vec<PackageVersion>,
    ) -> Result<Aggregation, GuardError> {
        let timeout = self.analysis_timeout;
        tokio::time::timeout(timeout, self.analyze_packages_inner(work))
            .await
            .map_err(|_| GuardError::AnalysisTimeout(timeout))
    }

    /// Fan analyses out over a bounded worker pool: a job channel sized to
    /// the work list, `max_concurrent_analyzes` workers, a results channel
    /// drained by this task. The first Block short-circuits aggregation.
    async fn analyze_packages_inner(&self, work: Vec<PackageVersion>) -> Aggregation {
        let total = work.len();
        let (job_tx, job_rx) = mpsc::channel::<PackageVersion>(total.max(1));
        for pkg in work {
            // capacity equals the work list, this send never blocks
            if job_tx.send(pkg).await.is_err() {
                break;
            }
        }
        drop(job_tx);
        let job_rx = Arc::new(tokio::sync::Mutex::new(job_rx));

        let (result_tx, mut result_rx) = mpsc::channel(total.max(1));
        let worker_count = self.max_concurrent_analyzes.min(total).max(1);

        let mut workers = tokio::task::JoinSet::new();
        for _ in 0..worker_count {
            let job_rx = job_rx.clone();
            let result_tx = result_tx.clone();
            let engine = self.engine.clone();
            workers.spawn(async move {
                loop {
                    let job = { job_rx.lock().await.recv().await };
                    let Some(pkg) = job else { break };
                    let outcome = engine.decide(&pkg).await;
                    if result_tx.send((pkg, outcome)).await.is_err() {
                        break;
                    }
                }
            });
        }
        drop(result_tx);

        let mut aggregation = Aggregation::default();
        while let Some((pkg, outcome)) = result_rx.recv().await {
            match outcome {
                Err(err) => {
                    // per-package analysis errors fail open
                    tracing::warn!(package = %pkg, "analysis failed, skipping package: {err}");
                    self.events.record(Event::for_package(
                        EventType::Error,
                        format!("analysis failed, package skipped: {err}"),
                        &pkg,
                    ));
                    aggregation.skipped += 1;
                }
                Ok(result) => match result.action {
                    Action::Block => {
                        aggregation.blocked = Some(result);
                        break;
                    }
                    Action::Confirm => aggregation.confirms.push(result),
                    Action::Allow | Action::Unknown => aggregation.allowed += 1,
                },
            }
        }

        workers.abort_all();
        while workers.join_next().await.is_some() {}

        aggregation
    }

    async fn forward(&self, intent: &InstallIntent) -> Result<GuardOutcome, GuardError> {
        if self.dry_run {
            tracing::info!(
                program = %intent.command.program().display(),
                "dry run: not executing the package manager"
            );
            return Ok(GuardOutcome::DryRun);
        }

        let mut spec = intent.command.clone();
        let _sandbox = exec::apply_sandbox(&mut spec, self.sandbox_policy.as_ref());
        let exit_code = exec::run_package_manager(&spec, &self.child_env).await?;
        Ok(GuardOutcome::Completed { exit_code })
    }
}

fn push_work(
    engine: &DecisionEngine,
    work: &mut Vec<PackageVersion>,
    seen: &mut HashSet<String>,
    pkg: PackageVersion,
) {
    if engine.is_trusted(&pkg) {
        tracing::debug!(package = %pkg, "skipping trusted package");
        return;
    }
    if seen.insert(pkg.cache_key()) {
        work.push(pkg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{
        AnalysisCache, Analyzer, ConfirmationBroker, ConfirmationPrompt,
    };
    use crate::package::Ecosystem;
    use rama::utils::str::smol_str::SmolStr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedAnalyzer;

    impl Analyzer for ScriptedAnalyzer {
        async fn analyze(&self, pkg: PackageVersion) -> Result<AnalysisResult, BoxError> {
            let action = if pkg.name().contains("malicious") {
                Action::Block
            } else if pkg.name().contains("suspicious") {
                Action::Confirm
            } else if pkg.name().contains("broken") {
                return Err(BoxError::from("transport error"));
            } else {
                Action::Allow
            };
            Ok(AnalysisResult::allowed(pkg, "scripted").with_action(action))
        }
    }

    struct RecordingPrompt {
        answer: bool,
        calls: Arc<AtomicUsize>,
    }

    impl ConfirmationPrompt for RecordingPrompt {
        async fn confirm(&self, _result: &AnalysisResult) -> Result<bool, BoxError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.answer)
        }
    }

    /// Static closure resolver: suspicious-dep hides behind innocent-root.
    struct StaticResolver;

    impl DependencyResolver for StaticResolver {
        async fn latest_version(&self, _pkg: PackageVersion) -> Result<SmolStr, BoxError> {
            Ok(SmolStr::from("9.9.9"))
        }

        async fn dependency_closure(
            &self,
            pkg: PackageVersion,
            _max_depth: u32,
            _include_dev: bool,
        ) -> Result<Vec<PackageVersion>, BoxError> {
            if pkg.name() == "innocent-root" {
                Ok(vec![PackageVersion::new(
                    Ecosystem::Npm,
                    "malicious-dep",
                    "1.0.0",
                )])
            } else {
                Ok(Vec::new())
            }
        }
    }

    fn pipeline(paranoid: bool, answer: bool) -> (GuardPipeline, Arc<AtomicUsize>) {
        let engine = DecisionEngine::new(
            ScriptedAnalyzer.into_dyn(),
            AnalysisCache::new(),
            EventLog::disabled(),
        )
        .with_paranoid(paranoid);
        let calls = Arc::new(AtomicUsize::new(0));
        let confirmations = ConfirmationBroker::spawn(
            RecordingPrompt {
                answer,
                calls: calls.clone(),
            }
            .into_dyn(),
            8,
        );
        (
            GuardPipeline::new(engine, confirmations, EventLog::disabled()),
            calls,
        )
    }

    fn intent_for(args: &[&str]) -> InstallIntent {
        let argv: Vec<String> = args.iter().map(|s| (*s).to_owned()).collect();
        parse_install_intent(&argv).unwrap()
    }

    /// An intent whose forwarded command would create a marker file, to
    /// prove the subprocess never ran.
    fn marker_intent(dir: &std::path::Path, targets: Vec<PackageVersion>) -> InstallIntent {
        let marker = dir.join("ran");
        let mut intent = intent_for(&[
            "npm",
            "install",
        ]);
        intent.is_manifest_install = false;
        intent.manifest_files.clear();
        intent.targets = targets;
        intent.command = pmg_sandbox::CommandSpec::new(
            "sh",
            [
                "-c".to_owned(),
                format!("touch {}", marker.display()),
            ],
        );
        intent
    }

    #[tokio::test]
    async fn test_blocked_package_aborts_without_subprocess() {
        let dir = tempfile::tempdir().unwrap();
        let (pipeline, prompts) = pipeline(false, true);
        let intent = marker_intent(
            dir.path(),
            vec![PackageVersion::new(Ecosystem::Npm, "malicious-pkg", "1.0.0")],
        );

        let outcome = pipeline.run(intent).await.unwrap();
        let GuardOutcome::Blocked {
            result,
            user_declined,
        } = outcome
        else {
            panic!("expected a block");
        };
        assert_eq!(result.package.name(), "malicious-pkg");
        assert!(!user_declined);
        assert!(!dir.path().join("ran").exists(), "subprocess must not run");
        assert_eq!(prompts.load(Ordering::SeqCst), 0, "no prompt for a block");
    }

    #[tokio::test]
    async fn test_declined_confirmation_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let (pipeline, prompts) = pipeline(false, false);
        let intent = marker_intent(
            dir.path(),
            vec![PackageVersion::new(Ecosystem::Npm, "suspicious-pkg", "2.0.0")],
        );

        let outcome = pipeline.run(intent).await.unwrap();
        let GuardOutcome::Blocked { user_declined, .. } = outcome else {
            panic!("expected a block");
        };
        assert!(user_declined);
        assert_ne!(
            GuardOutcome::Blocked {
                result: Arc::new(AnalysisResult::allowed(
                    PackageVersion::new(Ecosystem::Npm, "x", "1"),
                    ""
                )),
                user_declined: true
            }
            .exit_code(),
            0
        );
        assert!(!dir.path().join("ran").exists());
        assert_eq!(prompts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_accepted_confirmation_forwards() {
        let dir = tempfile::tempdir().unwrap();
        let (pipeline, prompts) = pipeline(false, true);
        let intent = marker_intent(
            dir.path(),
            vec![PackageVersion::new(Ecosystem::Npm, "suspicious-pkg", "2.0.0")],
        );

        let outcome = pipeline.run(intent).await.unwrap();
        assert!(matches!(
            outcome,
            GuardOutcome::Completed { exit_code: 0 }
        ));
        assert!(dir.path().join("ran").exists());
        assert_eq!(prompts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_paranoid_blocks_without_prompt() {
        let dir = tempfile::tempdir().unwrap();
        let (pipeline, prompts) = pipeline(true, true);
        let intent = marker_intent(
            dir.path(),
            vec![PackageVersion::new(Ecosystem::Npm, "suspicious-pkg", "2.0.0")],
        );

        let outcome = pipeline.run(intent).await.unwrap();
        let GuardOutcome::Blocked { user_declined, .. } = outcome else {
            panic!("expected a block");
        };
        assert!(!user_declined);
        assert_eq!(prompts.load(Ordering::SeqCst), 0);
        assert!(!dir.path().join("ran").exists());
    }

    #[tokio::test]
    async fn test_allow_path_propagates_exit_code() {
        let (pipeline, _) = pipeline(false, true);
        let mut intent = intent_for(&["npm", "install", "left-pad@1.3.0"]);
        intent.command =
            pmg_sandbox::CommandSpec::new("sh", ["-c".to_owned(), "exit 17".to_owned()]);

        let outcome = pipeline.run(intent).await.unwrap();
        assert!(matches!(
            outcome,
            GuardOutcome::Completed { exit_code: 17 }
        ));
    }

    #[tracing_test::traced_test]
    #[tokio::test]
    async fn test_analysis_errors_fail_open() {
        let dir = tempfile::tempdir().unwrap();
        let (pipeline, _) = pipeline(false, true);
        let intent = marker_intent(
            dir.path(),
            vec![
                PackageVersion::new(Ecosystem::Npm, "broken-pkg", "1.0.0"),
                PackageVersion::new(Ecosystem::Npm, "left-pad", "1.3.0"),
            ],
        );

        let outcome = pipeline.run(intent).await.unwrap();
        assert!(matches!(outcome, GuardOutcome::Completed { exit_code: 0 }));
        assert!(dir.path().join("ran").exists());
        assert!(logs_contain("analysis failed, skipping package"));
    }

    #[tokio::test]
    async fn test_transitive_closure_is_analyzed() {
        let dir = tempfile::tempdir().unwrap();
        let (pipeline, _) = pipeline(false, true);
        let pipeline = pipeline.with_resolver(StaticResolver.into_dyn());
        let intent = marker_intent(
            dir.path(),
            vec![PackageVersion::new(Ecosystem::Npm, "innocent-root", "1.0.0")],
        );

        let outcome = pipeline.run(intent).await.unwrap();
        assert!(
            matches!(outcome, GuardOutcome::Blocked { .. }),
            "the malicious transitive dependency must block the install"
        );
        assert!(!dir.path().join("ran").exists());
    }

    #[tokio::test]
    async fn test_dry_run_skips_subprocess() {
        let dir = tempfile::tempdir().unwrap();
        let (pipeline, _) = pipeline(false, true);
        let pipeline = pipeline.with_dry_run(true);
        let intent = marker_intent(
            dir.path(),
            vec![PackageVersion::new(Ecosystem::Npm, "left-pad", "1.3.0")],
        );

        let outcome = pipeline.run(intent).await.unwrap();
        assert!(matches!(outcome, GuardOutcome::DryRun));
        assert_eq!(outcome.exit_code(), 0);
        assert!(!dir.path().join("ran").exists());
    }

    #[tokio::test]
    async fn test_trusted_packages_are_skipped_from_work() {
        use crate::package::trust::{TrustedPackageEntry, parse_trusted_packages};

        let engine = DecisionEngine::new(
            ScriptedAnalyzer.into_dyn(),
            AnalysisCache::new(),
            EventLog::disabled(),
        )
        .with_trusted_packages(parse_trusted_packages(&[TrustedPackageEntry {
            purl: "pkg:npm/malicious-but-vetted".to_owned(),
            reason: "internal fork".to_owned(),
        }]));
        let confirmations = ConfirmationBroker::spawn(
            RecordingPrompt {
                answer: true,
                calls: Arc::new(AtomicUsize::new(0)),
            }
            .into_dyn(),
            1,
        );
        let pipeline = GuardPipeline::new(engine, confirmations, EventLog::disabled());

        let dir = tempfile::tempdir().unwrap();
        let intent = marker_intent(
            dir.path(),
            vec![PackageVersion::new(
                Ecosystem::Npm,
                "malicious-but-vetted",
                "1.0.0",
            )],
        );
        let outcome = pipeline.run(intent).await.unwrap();
        assert!(matches!(outcome, GuardOutcome::Completed { exit_code: 0 }));
        assert!(dir.path().join("ran").exists());
    }
}
