use std::collections::HashMap;

use rama::{
    error::BoxError,
    http::Request,
    telemetry::tracing,
    utils::str::smol_str::SmolStr,
};

use crate::{
    analysis::{Action, AnalysisCache, ConfirmationSender, DecisionEngine},
    events::{Event, EventLog, EventType},
    http::response::generate_malware_blocked_response_for_req,
    package::PackageVersion,
};

use super::interceptor::{BlockedRequest, RequestAction};
use super::stats::StatsCollector;

pub mod npm;
pub mod pypi;

/// Per-hostname registry settings.
#[derive(Debug, Clone)]
pub struct RegistryHostConfig {
    pub hostname: SmolStr,
    /// Test instances pass through without any analysis.
    pub supported_for_analysis: bool,
}

impl RegistryHostConfig {
    pub fn new(hostname: &str) -> Self {
        Self {
            hostname: SmolStr::from(hostname),
            supported_for_analysis: true,
        }
    }

    pub fn unsupported(hostname: &str) -> Self {
        Self {
            hostname: SmolStr::from(hostname),
            supported_for_analysis: false,
        }
    }
}

/// Hostname to registry-config resolution.
///
/// Exact matches win; otherwise the config with the longest matching domain
/// suffix does. Longest-suffix is load-bearing: the backing map iterates in
/// arbitrary order, so "first match" would be nondeterministic.
#[derive(Debug, Clone, Default)]
pub struct RegistryConfigMap {
    hosts: HashMap<SmolStr, RegistryHostConfig>,
}

impl RegistryConfigMap {
    pub fn insert(&mut self, config: RegistryHostConfig) {
        self.hosts.insert(config.hostname.clone(), config);
    }

    pub fn resolve(&self, hostname: &str) -> Option<&RegistryHostConfig> {
        let hostname = hostname.trim_end_matches('.').to_ascii_lowercase();
        if let Some(config) = self.hosts.get(hostname.as_str()) {
            return Some(config);
        }

        self.hosts
            .iter()
            .filter(|(key, _)| {
                hostname.len() > key.len() + 1
                    && hostname.ends_with(key.as_str())
                    && hostname.as_bytes()[hostname.len() - key.len() - 1] == b'.'
            })
            .max_by_key(|(key, _)| key.len())
            .map(|(_, config)| config)
    }

    pub fn contains(&self, hostname: &str) -> bool {
        self.resolve(hostname).is_some()
    }

    pub fn hostnames(&self) -> impl Iterator<Item = &SmolStr> {
        self.hosts.keys()
    }
}

impl FromIterator<RegistryHostConfig> for RegistryConfigMap {
    fn from_iter<T: IntoIterator<Item = RegistryHostConfig>>(iter: T) -> Self {
        let mut map = Self::default();
        for config in iter {
            map.insert(config);
        }
        map
    }
}

/// Shared plumbing for every registry interceptor: the decision engine, the
/// cross-pipeline analysis cache, the stats collector, the event log, and the
/// producer side of the confirmation broker.
#[derive(Debug, Clone)]
pub struct RegistryCore {
    engine: DecisionEngine,
    stats: StatsCollector,
    events: EventLog,
    confirmations: ConfirmationSender,
}

impl RegistryCore {
    pub fn new(
        engine: DecisionEngine,
        stats: StatsCollector,
        events: EventLog,
        confirmations: ConfirmationSender,
    ) -> Self {
        Self {
            engine,
            stats,
            events,
            confirmations,
        }
    }

    pub fn cache(&self) -> &AnalysisCache {
        self.engine.cache()
    }

    /// Analyze a file-download coordinate and translate the decision into a
    /// request action. Analysis failures fail open.
    pub async fn analyze_download(
        &self,
        req: Request,
        pkg: PackageVersion,
    ) -> Result<RequestAction, BoxError> {
        let result = match self.engine.decide(&pkg).await {
            Ok(result) => result,
            Err(err) => {
                tracing::warn!(
                    package = %pkg,
                    "analysis failed, allowing download (fail-open): {err}"
                );
                self.events.record(Event::for_package(
                    EventType::Error,
                    format!("analysis failed, download allowed: {err}"),
                    &pkg,
                ));
                return Ok(RequestAction::Allow(req));
            }
        };

        match result.action {
            Action::Block => {
                tracing::warn!(package = %pkg, "blocking malicious download");
                self.events.record(Event::for_package(
                    EventType::MalwareBlocked,
                    "blocked malicious artifact download",
                    &pkg,
                ));
                self.stats.record_blocked(pkg.clone());
                Ok(RequestAction::Block(BlockedRequest {
                    response: generate_malware_blocked_response_for_req(&req, &result),
                    package: pkg,
                }))
            }
            Action::Confirm => {
                let confirmed = self
                    .confirmations
                    .request_confirmation(result.clone())
                    .await
                    .unwrap_or_else(|err| {
                        tracing::warn!(
                            package = %pkg,
                            "confirmation unavailable, treating as declined: {err}"
                        );
                        false
                    });

                if confirmed {
                    self.events.record(Event::for_package(
                        EventType::MalwareConfirmed,
                        "user approved suspicious artifact download",
                        &pkg,
                    ));
                    self.events.record(Event::for_package(
                        EventType::InstallAllowed,
                        "suspicious artifact download allowed after confirmation",
                        &pkg,
                    ));
                    self.stats.record_confirmed();
                    Ok(RequestAction::Allow(req))
                } else {
                    self.events.record(Event::for_package(
                        EventType::MalwareBlocked,
                        "user declined suspicious artifact download",
                        &pkg,
                    ));
                    self.stats.record_declined(pkg.clone());
                    Ok(RequestAction::Block(BlockedRequest {
                        response: generate_malware_blocked_response_for_req(&req, &result),
                        package: pkg,
                    }))
                }
            }
            Action::Allow | Action::Unknown => {
                self.events.record(Event::for_package(
                    EventType::InstallAllowed,
                    "artifact download allowed",
                    &pkg,
                ));
                self.stats.record_allowed();
                Ok(RequestAction::Allow(req))
            }
        }
    }
}
