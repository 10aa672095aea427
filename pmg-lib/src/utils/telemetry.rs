use std::{io::IsTerminal as _, path::Path, sync::Arc};

use rama::telemetry::tracing::{
    self,
    metadata::LevelFilter,
    subscriber::{EnvFilter, fmt, layer::SubscriberExt as _, util::SubscriberInitExt as _},
};

/// Settings for tracing setup, mapped straight from CLI flags.
#[derive(Debug, Default)]
pub struct TelemetryConfig<'a> {
    pub verbose: bool,
    pub pretty: bool,
    /// Write log output to this file instead of stderr.
    pub output: Option<&'a Path>,
}

/// Configures structured logging with runtime control via the `RUST_LOG`
/// environment variable.
///
/// Defaults to INFO; `--verbose` lowers the default to DEBUG. In guard mode
/// stderr belongs to the wrapped package manager's own output, so `--output`
/// can divert tracing to a file.
pub fn init_tracing(config: TelemetryConfig<'_>) -> std::io::Result<()> {
    let directive = if config.verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    }
    .into();

    let env_filter = EnvFilter::builder()
        .with_default_directive(directive)
        .from_env_lossy();

    if let Some(path) = config.output {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        tracing::subscriber::registry()
            .with(fmt::layer().with_ansi(false).with_writer(Arc::new(file)))
            .with(env_filter)
            .init();
    } else if config.pretty {
        tracing::subscriber::fmt()
            .pretty()
            .with_writer(std::io::stderr)
            .with_ansi(std::io::stderr().is_terminal())
            .with_env_filter(env_filter)
            .init();
    } else {
        tracing::subscriber::registry()
            .with(fmt::layer().with_writer(std::io::stderr))
            .with(env_filter)
            .init();
    }

    tracing::debug!("tracing is set up");
    Ok(())
}
