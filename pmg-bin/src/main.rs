#![cfg_attr(
    not(test),
    warn(clippy::print_stdout, clippy::dbg_macro),
    deny(clippy::unwrap_used, clippy::expect_used)
)]

use std::{collections::HashMap, path::PathBuf, time::Duration};

use rama::{
    error::{BoxError, ErrorContext as _},
    graceful::{self, ShutdownGuard},
    http::Uri,
    net::{address::SocketAddress, socket::Interface},
    rt::Executor,
    telemetry::tracing::{self, Instrument as _},
    tls::boring::server::TlsAcceptorLayer,
};

use clap::Parser;

use pmg_lib::{
    analysis::{
        ActiveScanAnalyzer, AnalysisCache, Analyzer as _, ConfirmationBroker, ConfirmationPrompt as _,
        ConfirmationSender, DecisionEngine, DynAnalyzer, QueryAnalyzer,
    },
    config::{self, Config},
    events::EventLog,
    guard::{
        DependencyResolver as _, GuardOutcome, GuardPipeline, PackageManager, RegistryResolver,
        parse_install_intent, print_block_screen,
    },
    http::firewall::{Firewall, StatsCollector},
    package::trust::parse_trusted_packages,
    tls::{RootCa, new_tls_acceptor_layer},
    utils::{self, telemetry},
};
use pmg_sandbox::{PolicyRegistry, ResolvedPolicy};

pub mod client;
pub mod prompt;
pub mod server;

use prompt::TerminalPrompt;

/// CLI arguments for the package manager guard.
#[derive(Debug, Clone, Parser)]
#[command(name = "pmg")]
#[command(bin_name = "pmg")]
#[command(version, about, long_about = None)]
pub struct Args {
    /// run the intercepting registry proxy instead of guard mode
    #[arg(long = "proxy")]
    pub proxy_mode: bool,

    /// network interface to bind the proxy to
    #[arg(
        long,
        short = 'b',
        value_name = "INTERFACE",
        default_value = "127.0.0.1:0"
    )]
    pub bind: Interface,

    /// MITM all traffic, regardless of the registry host filters
    #[arg(long = "all", short = 'A')]
    pub mitm_all: bool,

    /// debug logging as default instead of Info; use RUST_LOG env for more options
    #[arg(long, short = 'v', default_value_t = false)]
    pub verbose: bool,

    /// enable pretty logging (format for humans)
    #[arg(long, default_value_t = false)]
    pub pretty: bool,

    /// write the tracing output to the provided (log) file instead of stderr
    #[arg(long, short = 'o')]
    pub output: Option<PathBuf>,

    /// directory in which data (event log, CA material) is stored
    #[arg(long, short = 'D')]
    pub data: Option<PathBuf>,

    /// configuration file to load instead of the discovered one
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,

    /// promote every suspicious finding to a hard block
    #[arg(long)]
    pub paranoid: bool,

    /// analyze but never launch the package manager
    #[arg(long)]
    pub dry_run: bool,

    /// skip transitive dependency analysis
    #[arg(long)]
    pub no_transitive: bool,

    /// bypass all analysis (still logged)
    #[arg(long)]
    pub insecure_installation: bool,

    #[arg(long, value_name = "SECONDS", default_value_t = 1.)]
    /// the graceful shutdown timeout (<= 0.0 = no timeout)
    pub graceful: f64,

    /// the wrapped package manager invocation, e.g. `pmg npm install left-pad`
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

impl Args {
    /// Fold CLI flags over the loaded configuration; CLI wins over env wins
    /// over file.
    fn apply_to(&self, config: &mut Config) {
        if self.paranoid {
            config.paranoid = true;
        }
        if self.dry_run {
            config.dry_run = true;
        }
        if self.no_transitive {
            config.transitive = false;
        }
        if self.insecure_installation {
            config.insecure_installation = true;
        }
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if let Err(err) = telemetry::init_tracing(telemetry::TelemetryConfig {
        verbose: args.verbose,
        pretty: args.pretty,
        output: args.output.as_deref(),
    }) {
        eprintln!("🚩 failed to initialize logging: {err}");
        std::process::exit(1);
    }

    match run(args).await {
        Ok(exit_code) => std::process::exit(exit_code),
        Err(err) => {
            eprintln!("🚩 exit with error: {err}");
            std::process::exit(1);
        }
    }
}

async fn run(args: Args) -> Result<i32, BoxError> {
    let mut config = Config::load(args.config.as_deref())?;
    args.apply_to(&mut config);
    config::install(config.clone());

    let data_dir = args
        .data
        .clone()
        .unwrap_or_else(utils::env::default_data_dir);
    tokio::fs::create_dir_all(&data_dir)
        .await
        .context("create data directory")?;

    let events = if config.skip_event_logging {
        EventLog::disabled()
    } else {
        match EventLog::new(data_dir.join("events"), config.event_log_retention_days) {
            Ok(events) => events,
            Err(err) => {
                tracing::warn!("event logging unavailable: {err}");
                EventLog::disabled()
            }
        }
    };

    if args.proxy_mode {
        run_proxy_mode(args, config, events, data_dir).await
    } else if args.command.is_empty() {
        Err(BoxError::from(
            "no package manager command given; usage: pmg <npm|yarn|pnpm|pip|poetry|uv> ... (or pmg --proxy)",
        ))
    } else {
        run_guard_mode(args, config, events).await
    }
}

fn new_analyzer(
    config: &Config,
    client: impl rama::Service<
        rama::http::Request,
        Output = rama::http::Response,
        Error: Into<BoxError>,
    > + Clone,
) -> Result<DynAnalyzer, BoxError> {
    if let (Some(scan_url), Some(token)) = (
        config.analyzer.scan_url.as_deref(),
        config.analyzer.auth_token.as_deref(),
    ) {
        let endpoint: Uri = scan_url.parse().context("parse active scan endpoint")?;
        return Ok(ActiveScanAnalyzer::new(client, endpoint, token)
            .with_deadline(Duration::from_secs(config.analyzer.scan_timeout_secs))
            .into_dyn());
    }

    let endpoint: Uri = config
        .analyzer
        .query_url
        .parse()
        .context("parse query analyzer endpoint")?;
    Ok(QueryAnalyzer::new(client, endpoint)
        .with_timeout(Duration::from_secs(config.analyzer.query_timeout_secs))
        .into_dyn())
}

fn new_decision_engine(
    config: &Config,
    events: EventLog,
    analyzer: DynAnalyzer,
    cache: AnalysisCache,
) -> DecisionEngine {
    DecisionEngine::new(analyzer, cache, events)
        .with_trusted_packages(parse_trusted_packages(&config.trusted_packages))
        .with_paranoid(config.paranoid)
        .with_insecure_installation(config.insecure_installation)
}

/// The sandbox policy bound to this package manager, if sandboxing is on.
/// Unknown profiles and broken inheritance are fatal before any launch.
fn resolve_sandbox_policy(
    config: &Config,
    package_manager: PackageManager,
) -> Result<Option<ResolvedPolicy>, BoxError> {
    if !config.sandbox.enabled {
        return Ok(None);
    }

    let registry = PolicyRegistry::new();
    match config.sandbox.policies.get(package_manager.as_str()) {
        Some(binding) if !binding.enabled => Ok(None),
        Some(binding) if !binding.profile.is_empty() => {
            registry.profile(&binding.profile).map(Some).map_err(Into::into)
        }
        _ => registry
            .profile_for_package_manager(package_manager.as_str())
            .map_err(Into::into),
    }
}

async fn run_guard_mode(args: Args, config: Config, events: EventLog) -> Result<i32, BoxError> {
    let intent = parse_install_intent(&args.command)?;

    let client = client::new_web_client(Executor::default())?;
    let analyzer = new_analyzer(&config, client.clone())?;
    let engine = new_decision_engine(&config, events.clone(), analyzer, AnalysisCache::new());
    let confirmations = ConfirmationBroker::spawn(TerminalPrompt.into_dyn(), 16);
    let resolver = RegistryResolver::new(client).into_dyn();

    let sandbox_policy = resolve_sandbox_policy(&config, intent.package_manager)?;
    if let Some(policy) = &sandbox_policy {
        tracing::debug!(policy = %policy.name, "sandbox policy selected");
    }

    let pipeline = GuardPipeline::new(engine, confirmations, events)
        .with_resolver(resolver)
        .with_sandbox_policy(sandbox_policy)
        .with_max_concurrent_analyzes(config.max_concurrent_analyzes)
        .with_analysis_timeout(Duration::from_secs(config.analysis_timeout_secs))
        .with_transitive(config.transitive, config.transitive_depth)
        .with_include_dev_dependencies(config.include_dev_dependencies)
        .with_dry_run(config.dry_run)
        .with_insecure_installation(config.insecure_installation);

    match pipeline.run(intent).await? {
        GuardOutcome::Completed { exit_code } => Ok(exit_code),
        GuardOutcome::Blocked {
            result,
            user_declined,
        } => {
            print_block_screen(&result, !user_declined);
            Ok(1)
        }
        GuardOutcome::DryRun => Ok(0),
    }
}

async fn run_proxy_mode(
    args: Args,
    config: Config,
    events: EventLog,
    data_dir: PathBuf,
) -> Result<i32, BoxError> {
    let (tls_acceptor, root_ca) =
        new_tls_acceptor_layer(&data_dir).context("prepare TLS acceptor")?;

    let client = client::new_web_client(Executor::default())?;
    let analyzer = new_analyzer(&config, client)?;
    let engine = new_decision_engine(&config, events.clone(), analyzer, AnalysisCache::new());
    let confirmations: ConfirmationSender = ConfirmationBroker::spawn(TerminalPrompt.into_dyn(), 16);
    let firewall = Firewall::new(engine, confirmations, events, StatsCollector::new());

    let graceful_timeout = (args.graceful > 0.).then(|| Duration::from_secs_f64(args.graceful));

    let wrap_child = !args.command.is_empty();
    let (child_done_tx, child_done_rx) = tokio::sync::oneshot::channel::<()>();
    let graceful = graceful::Shutdown::new(new_shutdown_signal(
        wrap_child.then_some(child_done_rx),
    ));

    // used to hand the actual bound socket address to the child wrapper
    let (proxy_addr_tx, proxy_addr_rx) = tokio::sync::oneshot::channel();

    graceful.spawn_task_fn({
        let args = args.clone();
        move |guard| run_proxy_server_task(args, guard, tls_acceptor, proxy_addr_tx, firewall)
    });

    let mut exit_code = 0;
    if wrap_child {
        let proxy_addr = proxy_addr_rx
            .await
            .context("receive proxy socket address")?;
        exit_code = run_wrapped_child(&args.command, proxy_addr, &root_ca).await?;
        let _ = child_done_tx.send(());
    }

    let delay = match graceful_timeout {
        Some(duration) => graceful.shutdown_with_limit(duration).await?,
        None => graceful.shutdown().await,
    };
    tracing::info!("gracefully shutdown with a delay of: {delay:?}");

    Ok(exit_code)
}

async fn run_proxy_server_task(
    args: Args,
    guard: ShutdownGuard,
    tls_acceptor: TlsAcceptorLayer,
    proxy_addr_tx: tokio::sync::oneshot::Sender<SocketAddress>,
    firewall: Firewall,
) {
    tracing::info!("spawning proxy server...");
    if let Err(err) =
        server::proxy::run_proxy_server(args, guard, tls_acceptor, proxy_addr_tx, firewall)
            .instrument(tracing::debug_span!(
                "proxy server lifetime",
                server.service.name = utils::env::project_name(),
                otel.kind = "server",
                network.protocol.name = "tcp",
            ))
            .await
    {
        tracing::error!("proxy server exited with an error: {err}");
    }
}

fn new_shutdown_signal(
    child_done_rx: Option<tokio::sync::oneshot::Receiver<()>>,
) -> impl Future<Output = ()> + Send + 'static {
    async move {
        let mut signal = Box::pin(graceful::default_signal());
        match child_done_rx {
            Some(child_done_rx) => {
                tokio::select! {
                    _ = signal.as_mut() => {
                        tracing::debug!("default signal triggered: init graceful shutdown");
                    }
                    _ = child_done_rx => {
                        tracing::debug!("wrapped child exited: init graceful shutdown");
                    }
                }
            }
            None => {
                signal.await;
                tracing::debug!("default signal triggered: init graceful shutdown");
            }
        }
    }
}

/// Environment for the wrapped child: route its traffic through the proxy
/// and anchor its TLS clients on the proxy's root CA.
fn proxy_child_env(proxy_addr: SocketAddress, root_ca: &RootCa) -> HashMap<String, String> {
    let proxy_url = format!("http://{proxy_addr}");
    let ca_path = root_ca.path().to_string_lossy().into_owned();

    let mut env = HashMap::new();
    for key in ["HTTP_PROXY", "HTTPS_PROXY", "http_proxy", "https_proxy"] {
        env.insert(key.to_owned(), proxy_url.clone());
    }
    // npm/node, python-requests, pip and generic openssl users respectively
    for key in [
        "NODE_EXTRA_CA_CERTS",
        "REQUESTS_CA_BUNDLE",
        "PIP_CERT",
        "SSL_CERT_FILE",
    ] {
        env.insert(key.to_owned(), ca_path.clone());
    }
    env
}

async fn run_wrapped_child(
    command: &[String],
    proxy_addr: SocketAddress,
    root_ca: &RootCa,
) -> Result<i32, BoxError> {
    let (program, rest) = command
        .split_first()
        .ok_or_else(|| BoxError::from("empty wrapped command"))?;

    tracing::info!(program = %program, "running wrapped command behind the proxy");

    let status = tokio::process::Command::new(program)
        .args(rest)
        .envs(proxy_child_env(proxy_addr, root_ca))
        .status()
        .await
        .context("spawn wrapped command")?;

    Ok(child_exit_code(status))
}

#[cfg(target_family = "unix")]
fn child_exit_code(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt as _;
    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
        .unwrap_or(1)
}

#[cfg(not(target_family = "unix"))]
fn child_exit_code(status: std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_override_config() {
        let args = Args::parse_from([
            "pmg",
            "--paranoid",
            "--no-transitive",
            "npm",
            "install",
            "left-pad",
        ]);
        assert!(!args.proxy_mode);
        assert_eq!(args.command, vec!["npm", "install", "left-pad"]);

        let mut config = Config::default();
        args.apply_to(&mut config);
        assert!(config.paranoid);
        assert!(!config.transitive);
        assert!(!config.dry_run);
    }

    #[test]
    fn test_proxy_mode_args() {
        let args = Args::parse_from(["pmg", "--proxy", "--all"]);
        assert!(args.proxy_mode);
        assert!(args.mitm_all);
        assert!(args.command.is_empty());
    }

    #[test]
    fn test_trailing_command_keeps_flags() {
        let args = Args::parse_from(["pmg", "npm", "install", "--save-dev", "left-pad"]);
        assert_eq!(args.command, vec!["npm", "install", "--save-dev", "left-pad"]);
    }

    #[test]
    fn test_resolve_sandbox_policy_disabled() {
        let config = Config::default();
        let policy = resolve_sandbox_policy(&config, PackageManager::Npm).unwrap();
        assert!(policy.is_none(), "sandbox defaults to off");
    }

    #[test]
    fn test_resolve_sandbox_policy_by_package_manager() {
        let mut config = Config::default();
        config.sandbox.enabled = true;
        let policy = resolve_sandbox_policy(&config, PackageManager::Pip)
            .unwrap()
            .unwrap();
        assert_eq!(policy.name, "python-install");
    }

    #[test]
    fn test_resolve_sandbox_policy_unknown_profile_is_fatal() {
        let mut config = Config::default();
        config.sandbox.enabled = true;
        config.sandbox.policies.insert(
            "npm".to_owned(),
            pmg_lib::config::SandboxPolicyRef {
                enabled: true,
                profile: "no-such-profile".to_owned(),
            },
        );
        assert!(resolve_sandbox_policy(&config, PackageManager::Npm).is_err());
    }

    #[test]
    fn test_proxy_child_env_shape() {
        let dir = tempfile::tempdir().unwrap();
        let (_acceptor, root_ca) = new_tls_acceptor_layer(dir.path()).unwrap();
        let addr: SocketAddress = "127.0.0.1:43128".parse().unwrap();

        let env = proxy_child_env(addr, &root_ca);
        assert_eq!(env["HTTP_PROXY"], "http://127.0.0.1:43128");
        assert_eq!(env["HTTPS_PROXY"], "http://127.0.0.1:43128");
        assert!(env["NODE_EXTRA_CA_CERTS"].ends_with("pmg-ca.pem"));
        assert_eq!(env["SSL_CERT_FILE"], env["REQUESTS_CA_BUNDLE"]);
    }
}
