use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::{Arc, LazyLock},
};

use arc_swap::ArcSwap;
use rama::telemetry::tracing;
use serde::{Deserialize, Serialize};

use crate::package::trust::TrustedPackageEntry;

/// Prefix for environment variable overrides: `PMG_PARANOID=true`,
/// `PMG_TRANSITIVE_DEPTH=2`, ...
pub const ENV_PREFIX: &str = "PMG_";

#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {message}")]
    Io { path: PathBuf, message: String },
    #[error("failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },
}

/// Analyzer endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    pub query_url: String,
    pub scan_url: Option<String>,
    pub auth_token: Option<String>,
    pub query_timeout_secs: u64,
    pub scan_timeout_secs: u64,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            query_url: "https://community.analysis.pmg.dev/v1/query".to_owned(),
            scan_url: None,
            auth_token: None,
            query_timeout_secs: 30,
            scan_timeout_secs: 600,
        }
    }
}

/// Per-package-manager sandbox binding.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxPolicyRef {
    pub enabled: bool,
    pub profile: String,
}

impl Default for SandboxPolicyRef {
    fn default() -> Self {
        Self {
            enabled: true,
            profile: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxSettings {
    pub enabled: bool,
    pub policies: BTreeMap<String, SandboxPolicyRef>,
}

/// The process configuration snapshot, loaded once at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub transitive: bool,
    pub transitive_depth: u32,
    pub include_dev_dependencies: bool,
    pub paranoid: bool,
    pub dry_run: bool,
    pub insecure_installation: bool,
    pub skip_event_logging: bool,
    pub event_log_retention_days: u32,
    pub max_concurrent_analyzes: usize,
    pub analysis_timeout_secs: u64,
    pub trusted_packages: Vec<TrustedPackageEntry>,
    pub analyzer: AnalyzerConfig,
    pub sandbox: SandboxSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            transitive: true,
            transitive_depth: 3,
            include_dev_dependencies: false,
            paranoid: false,
            dry_run: false,
            insecure_installation: false,
            skip_event_logging: false,
            event_log_retention_days: 30,
            max_concurrent_analyzes: 10,
            analysis_timeout_secs: 300,
            trusted_packages: Vec::new(),
            analyzer: AnalyzerConfig::default(),
            sandbox: SandboxSettings::default(),
        }
    }
}

/// OS-appropriate default config location: `<config_dir>/pmg/config.yaml`.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("pmg").join("config.yaml"))
}

impl Config {
    /// Load the configuration.
    ///
    /// With an explicit `path` a missing or malformed file is fatal; the
    /// discovered default path is allowed to be absent (defaults apply).
    /// Environment overrides are applied on top in either case.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::load_file(path)?,
            None => match default_config_path() {
                Some(path) if path.exists() => Self::load_file(&path)?,
                _ => Self::default(),
            },
        };
        config.apply_env_overrides(std::env::vars());
        Ok(config)
    }

    fn load_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|err| ConfigError::Io {
            path: path.to_owned(),
            message: err.to_string(),
        })?;
        serde_yaml::from_str(&raw).map_err(|err| ConfigError::Parse {
            path: path.to_owned(),
            message: err.to_string(),
        })
    }

    /// Apply `PMG_`-prefixed environment overrides (dash→underscore in key
    /// names). Unknown keys and unparsable values are ignored with a debug
    /// log; env wins over the file, CLI flags win over env.
    pub fn apply_env_overrides(&mut self, vars: impl Iterator<Item = (String, String)>) {
        for (key, value) in vars {
            let Some(key) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            match key.to_ascii_lowercase().as_str() {
                "transitive" => set_bool(&mut self.transitive, key, &value),
                "transitive_depth" => set_num(&mut self.transitive_depth, key, &value),
                "include_dev_dependencies" => {
                    set_bool(&mut self.include_dev_dependencies, key, &value)
                }
                "paranoid" => set_bool(&mut self.paranoid, key, &value),
                "dry_run" => set_bool(&mut self.dry_run, key, &value),
                "insecure_installation" => set_bool(&mut self.insecure_installation, key, &value),
                "skip_event_logging" => set_bool(&mut self.skip_event_logging, key, &value),
                "event_log_retention_days" => {
                    set_num(&mut self.event_log_retention_days, key, &value)
                }
                "max_concurrent_analyzes" => {
                    set_num(&mut self.max_concurrent_analyzes, key, &value)
                }
                "analysis_timeout_secs" => set_num(&mut self.analysis_timeout_secs, key, &value),
                "analyzer_query_url" => self.analyzer.query_url = value,
                "analyzer_scan_url" => self.analyzer.scan_url = Some(value),
                "analyzer_auth_token" => self.analyzer.auth_token = Some(value),
                "sandbox_enabled" => set_bool(&mut self.sandbox.enabled, key, &value),
                other => {
                    tracing::debug!("ignoring unknown config override {ENV_PREFIX}{other}");
                }
            }
        }
    }
}

fn set_bool(target: &mut bool, key: &str, value: &str) {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => *target = true,
        "0" | "false" | "no" | "off" => *target = false,
        other => {
            tracing::debug!("ignoring non-boolean value {other:?} for {ENV_PREFIX}{key}");
        }
    }
}

fn set_num<T: std::str::FromStr>(target: &mut T, key: &str, value: &str) {
    match value.trim().parse() {
        Ok(parsed) => *target = parsed,
        Err(_) => {
            tracing::debug!("ignoring non-numeric value {value:?} for {ENV_PREFIX}{key}");
        }
    }
}

static CONFIG: LazyLock<ArcSwap<Config>> =
    LazyLock::new(|| ArcSwap::from_pointee(Config::default()));

/// The current process-wide config snapshot.
pub fn current() -> Arc<Config> {
    CONFIG.load_full()
}

/// Install the config snapshot. Production code calls this exactly once at
/// startup, before any analysis is in flight.
pub fn install(config: Config) {
    CONFIG.store(Arc::new(config));
}

/// Reset the snapshot back to defaults (test helper).
pub fn reset_for_tests() {
    CONFIG.store(Arc::new(Config::default()));
}
