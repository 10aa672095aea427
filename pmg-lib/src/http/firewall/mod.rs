use std::sync::Arc;

use rama::{
    error::BoxError,
    http::{Request, Response},
    net::address::Domain,
    telemetry::tracing,
};

use crate::{
    analysis::{ConfirmationSender, DecisionEngine},
    events::EventLog,
};

pub mod interceptor;
pub mod registry;

mod layer;
mod observer;
mod stats;

pub use self::interceptor::{BlockedRequest, DynInterceptor, Interceptor, RequestAction};
pub use self::layer::{EvaluateRequestLayer, EvaluateResponseLayer};
pub use self::observer::HostObserver;
pub use self::stats::{StatsCollector, StatsSnapshot};

use self::registry::{RegistryCore, npm::NpmInterceptor, pypi::PyPiInterceptor};

/// The registry firewall: an ordered set of interceptors plus the always-on
/// passive host observer.
///
/// The set of hostnames the firewall claims for MITM equals the union of the
/// interceptors' configured registry maps; everything else tunnels opaquely
/// and is merely observed.
#[derive(Debug, Clone)]
pub struct Firewall {
    interceptors: Arc<Vec<DynInterceptor>>,
    observer: HostObserver,
}

impl Firewall {
    pub fn new(
        engine: DecisionEngine,
        confirmations: ConfirmationSender,
        events: EventLog,
        stats: StatsCollector,
    ) -> Self {
        let core = RegistryCore::new(engine, stats, events.clone(), confirmations);

        Self {
            interceptors: Arc::new(vec![
                NpmInterceptor::new(core.clone()).into_dyn(),
                PyPiInterceptor::new(core).into_dyn(),
            ]),
            observer: HostObserver::new(events),
        }
    }

    /// Whether traffic to this domain should be TLS-intercepted.
    pub fn should_mitm(&self, domain: &Domain) -> bool {
        self.interceptors
            .iter()
            .any(|interceptor| interceptor.match_domain(domain))
    }

    /// Record a CONNECT to a host no interceptor claims.
    pub fn observe_connect(&self, domain: &Domain) {
        if !self.should_mitm(domain) {
            self.observer.observe(domain);
        }
    }

    /// Route a request through the interceptors in order; the first Block
    /// wins, otherwise the (possibly modified) request continues onward.
    pub async fn evaluate_request(&self, mut req: Request) -> Result<RequestAction, BoxError> {
        for interceptor in self.interceptors.iter() {
            match interceptor.evaluate_request(req).await? {
                RequestAction::Allow(r) => req = r,
                RequestAction::Block(blocked) => {
                    tracing::debug!(
                        product = interceptor.product_name(),
                        package = %blocked.package,
                        "firewall blocked request"
                    );
                    return Ok(RequestAction::Block(blocked));
                }
            }
        }
        Ok(RequestAction::Allow(req))
    }

    /// Route an upstream response through the interceptors in order.
    pub async fn evaluate_response(&self, mut resp: Response) -> Result<Response, BoxError> {
        for interceptor in self.interceptors.iter() {
            resp = interceptor.evaluate_response(resp).await?;
        }
        Ok(resp)
    }

    pub fn into_evaluate_request_layer(self) -> EvaluateRequestLayer {
        EvaluateRequestLayer(self)
    }

    pub fn into_evaluate_response_layer(self) -> EvaluateResponseLayer {
        EvaluateResponseLayer(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{
        Action, AnalysisCache, AnalysisResult, Analyzer, ConfirmationBroker, ConfirmationPrompt,
        confirm::confirmation_channel,
    };
    use crate::package::{Ecosystem, PackageVersion};
    use rama::http::{Body, StatusCode, body::util::BodyExt as _};

    struct ScriptedAnalyzer;

    impl Analyzer for ScriptedAnalyzer {
        async fn analyze(&self, pkg: PackageVersion) -> Result<AnalysisResult, BoxError> {
            let action = if pkg.name().contains("malicious") || pkg.name().contains("studio-core") {
                Action::Block
            } else if pkg.name().contains("suspicious") {
                Action::Confirm
            } else {
                Action::Allow
            };
            let mut result = AnalysisResult::allowed(pkg, "scripted analyzer").with_action(action);
            result.reference_url = "https://intel.example.com/an-5".into();
            result.summary = "verified malware".into();
            Ok(result)
        }
    }

    struct AlwaysDecline;

    impl ConfirmationPrompt for AlwaysDecline {
        async fn confirm(&self, _result: &AnalysisResult) -> Result<bool, BoxError> {
            Ok(false)
        }
    }

    fn firewall() -> Firewall {
        let engine = DecisionEngine::new(
            ScriptedAnalyzer.into_dyn(),
            AnalysisCache::new(),
            EventLog::disabled(),
        );
        let confirmations = ConfirmationBroker::spawn(AlwaysDecline.into_dyn(), 4);
        Firewall::new(
            engine,
            confirmations,
            EventLog::disabled(),
            StatsCollector::new(),
        )
    }

    fn request(uri: &'static str) -> Request {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_mitm_selection_is_union_of_registry_hosts() {
        let firewall = firewall();
        for (host, expected) in [
            ("registry.npmjs.org", true),
            ("registry.yarnpkg.com", true),
            ("pypi.org", true),
            ("files.pythonhosted.org", true),
            ("test.pypi.org", true),
            ("example.com", false),
            ("github.com", false),
        ] {
            let domain = Domain::from_static(host);
            assert_eq!(firewall.should_mitm(&domain), expected, "host: {host}");
        }
    }

    #[tokio::test]
    async fn test_malicious_npm_tarball_is_blocked_with_403() {
        let firewall = firewall();
        let req = request(
            "https://registry.npmjs.org/@prisma/studio-core-licensed/-/studio-core-licensed-0.0.0-dev.202601011229.tgz",
        );

        let action = firewall.evaluate_request(req).await.unwrap();
        let RequestAction::Block(blocked) = action else {
            panic!("expected a block");
        };
        assert_eq!(blocked.response.status(), StatusCode::FORBIDDEN);
        assert_eq!(blocked.package.name(), "@prisma/studio-core-licensed");
        assert_eq!(blocked.package.version(), "0.0.0-dev.202601011229");

        let (_, body) = blocked.response.into_parts();
        let body = body.collect().await.unwrap().to_bytes();
        let body = String::from_utf8_lossy(&body);
        assert!(body.contains("@prisma/studio-core-licensed"), "body: {body}");
        assert!(body.contains("0.0.0-dev.202601011229"), "body: {body}");
    }

    #[tokio::test]
    async fn test_benign_pypi_wheel_is_forwarded() {
        let firewall = firewall();
        let req = request(
            "https://files.pythonhosted.org/packages/ab/cd/ef12/requests-2.28.0-py3-none-any.whl",
        );
        let action = firewall.evaluate_request(req).await.unwrap();
        assert!(matches!(action, RequestAction::Allow(_)));
    }

    #[tokio::test]
    async fn test_metadata_requests_are_never_analyzed() {
        let firewall = firewall();
        // even a known-malicious name passes through on the metadata path
        for uri in [
            "https://registry.npmjs.org/malicious-pkg",
            "https://pypi.org/simple/malicious-pkg/",
            "https://pypi.org/pypi/malicious-pkg/json",
        ] {
            let action = firewall.evaluate_request(request(uri)).await.unwrap();
            assert!(
                matches!(action, RequestAction::Allow(_)),
                "metadata uri should pass: {uri}"
            );
        }
    }

    #[tokio::test]
    async fn test_unparsable_registry_url_fails_open() {
        let firewall = firewall();
        let action = firewall
            .evaluate_request(request(
                "https://registry.npmjs.org/a/b/c/d/not-a-real-layout",
            ))
            .await
            .unwrap();
        assert!(matches!(action, RequestAction::Allow(_)));
    }

    #[tokio::test]
    async fn test_confirm_decline_yields_403() {
        let firewall = firewall();
        let req = request("https://registry.npmjs.org/suspicious-pkg/-/suspicious-pkg-2.0.0.tgz");
        let action = firewall.evaluate_request(req).await.unwrap();
        let RequestAction::Block(blocked) = action else {
            panic!("declined confirmation must block");
        };
        assert_eq!(blocked.response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_test_instances_pass_through() {
        let firewall = firewall();
        let req = request(
            "https://test-files.pythonhosted.org/packages/ab/cd/malicious_pkg-1.0.0-py3-none-any.whl",
        );
        let action = firewall.evaluate_request(req).await.unwrap();
        assert!(matches!(action, RequestAction::Allow(_)));
    }

    #[tokio::test]
    async fn test_confirmation_is_requested_through_broker() {
        // a broker whose prompt accepts: the download must flow
        struct AlwaysAccept;
        impl ConfirmationPrompt for AlwaysAccept {
            async fn confirm(&self, _result: &AnalysisResult) -> Result<bool, BoxError> {
                Ok(true)
            }
        }

        let engine = DecisionEngine::new(
            ScriptedAnalyzer.into_dyn(),
            AnalysisCache::new(),
            EventLog::disabled(),
        );
        let (sender, rx) = confirmation_channel(4);
        tokio::spawn(ConfirmationBroker::new(rx, AlwaysAccept.into_dyn()).run());
        let firewall = Firewall::new(
            engine,
            sender,
            EventLog::disabled(),
            StatsCollector::new(),
        );

        let req = request("https://registry.npmjs.org/suspicious-pkg/-/suspicious-pkg-2.0.0.tgz");
        let action = firewall.evaluate_request(req).await.unwrap();
        assert!(matches!(action, RequestAction::Allow(_)));
    }
}
