use std::{pin::Pin, sync::Arc, time::Duration};

use rama::{
    Service,
    error::{BoxError, ErrorContext as _},
    http::{
        Body, Method, Request, Response, Uri,
        body::util::BodyExt as _,
        header::{AUTHORIZATION, CONTENT_TYPE},
        HeaderValue,
    },
    telemetry::tracing,
    utils::str::arcstr::ArcStr,
};
use serde::{Deserialize, Serialize};

use crate::package::PackageVersion;

use super::{Action, AnalysisResult};

/// Default per-call timeout for the community query endpoint.
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(30);

/// Default overall deadline for an active scan (submit + poll).
pub const DEFAULT_SCAN_DEADLINE: Duration = Duration::from_secs(600);

const DEFAULT_SCAN_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// An ecosystem-agnostic malware analyzer for package coordinates.
///
/// Implementations are network-bound; transport and decode failures are
/// returned as errors and must never be interpreted as a Block decision.
pub trait Analyzer: Send + Sync + 'static {
    /// Analyze a single package coordinate.
    fn analyze(
        &self,
        pkg: PackageVersion,
    ) -> impl Future<Output = Result<AnalysisResult, BoxError>> + Send + '_;

    /// Converts this [`Analyzer`] into a [`DynAnalyzer`] trait object.
    fn into_dyn(self) -> DynAnalyzer
    where
        Self: Sized,
    {
        DynAnalyzer {
            inner: Arc::new(self),
        }
    }
}

trait DynAnalyzerInner {
    fn dyn_analyze(
        &self,
        pkg: PackageVersion,
    ) -> Pin<Box<dyn Future<Output = Result<AnalysisResult, BoxError>> + Send + '_>>;
}

impl<A: Analyzer> DynAnalyzerInner for A {
    #[inline(always)]
    fn dyn_analyze(
        &self,
        pkg: PackageVersion,
    ) -> Pin<Box<dyn Future<Output = Result<AnalysisResult, BoxError>> + Send + '_>> {
        Box::pin(self.analyze(pkg))
    }
}

/// A dyn-patched [`Analyzer`], exclusively created using [`Analyzer::into_dyn`].
pub struct DynAnalyzer {
    inner: Arc<dyn DynAnalyzerInner + Send + Sync + 'static>,
}

impl Clone for DynAnalyzer {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl std::fmt::Debug for DynAnalyzer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynAnalyzer").finish()
    }
}

impl Analyzer for DynAnalyzer {
    #[inline(always)]
    fn analyze(
        &self,
        pkg: PackageVersion,
    ) -> impl Future<Output = Result<AnalysisResult, BoxError>> + Send + '_ {
        self.inner.dyn_analyze(pkg)
    }

    #[inline(always)]
    fn into_dyn(self) -> DynAnalyzer {
        self
    }
}

#[derive(Debug, Serialize)]
struct QueryPayload<'a> {
    ecosystem: &'a str,
    name: &'a str,
    version: &'a str,
}

#[derive(Debug, Default, Deserialize)]
struct AnalyzerVerdict {
    #[serde(default)]
    is_malware: bool,
    #[serde(default)]
    summary: String,
}

#[derive(Debug, Default, Deserialize)]
struct AnalyzerReport {
    #[serde(default)]
    analysis_id: String,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    inference: Option<AnalyzerVerdict>,
    #[serde(default)]
    verification: Option<AnalyzerVerdict>,
    #[serde(default)]
    reference_url: String,
}

impl AnalyzerReport {
    fn is_pending(&self) -> bool {
        matches!(
            self.status.as_deref(),
            Some("pending") | Some("queued") | Some("running")
        )
    }
}

/// Total mapping from an analyzer reply to a policy [`Action`].
///
/// A verified-malware verdict is a hard Block; an inference-only verdict asks
/// for confirmation; everything else is allowed. Paranoid-mode escalation is
/// applied later by the decision engine, not here.
fn action_for_report(report: &AnalyzerReport) -> Action {
    if report.verification.as_ref().is_some_and(|v| v.is_malware) {
        Action::Block
    } else if report.inference.as_ref().is_some_and(|v| v.is_malware) {
        Action::Confirm
    } else {
        Action::Allow
    }
}

fn result_from_report(
    pkg: PackageVersion,
    raw: serde_json::Value,
    report: AnalyzerReport,
) -> AnalysisResult {
    let action = action_for_report(&report);
    let summary = report
        .verification
        .as_ref()
        .filter(|v| v.is_malware && !v.summary.is_empty())
        .or(report.inference.as_ref())
        .map(|v| v.summary.as_str())
        .unwrap_or_default();

    AnalysisResult {
        package: pkg,
        analysis_id: ArcStr::from(report.analysis_id.as_str()),
        action,
        summary: ArcStr::from(summary),
        reference_url: ArcStr::from(report.reference_url.as_str()),
        raw_report: Some(Arc::new(raw)),
    }
}

async fn decode_report_response(resp: Response) -> Result<(serde_json::Value, AnalyzerReport), BoxError> {
    let status = resp.status();
    if !status.is_success() {
        return Err(BoxError::from(format!(
            "analyzer replied with unexpected status: {status}"
        )));
    }

    let (_, body) = resp.into_parts();
    let bytes = body
        .collect()
        .await
        .context("collect analyzer response body")?
        .to_bytes();

    let raw: serde_json::Value =
        serde_json::from_slice(&bytes).context("decode analyzer response as JSON")?;
    let report: AnalyzerReport =
        serde_json::from_value(raw.clone()).context("decode analyzer report")?;
    Ok((raw, report))
}

fn json_request(method: Method, uri: Uri, payload: &impl Serialize) -> Result<Request, BoxError> {
    let body = serde_json::to_vec(payload).context("serialize analyzer request payload")?;
    Request::builder()
        .method(method)
        .uri(uri)
        .header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
        .body(Body::from(body))
        .context("build analyzer request")
        .map_err(Into::into)
}

/// Read-only community query analyzer: a single cheap lookup per coordinate.
pub struct QueryAnalyzer<C> {
    client: C,
    endpoint: Uri,
    timeout: Duration,
}

impl<C> QueryAnalyzer<C> {
    pub fn new(client: C, endpoint: Uri) -> Self {
        Self {
            client,
            endpoint,
            timeout: DEFAULT_QUERY_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl<C> std::fmt::Debug for QueryAnalyzer<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryAnalyzer")
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

impl<C> Analyzer for QueryAnalyzer<C>
where
    C: Service<Request, Output = Response, Error: Into<BoxError>>,
{
    async fn analyze(&self, pkg: PackageVersion) -> Result<AnalysisResult, BoxError> {
        let payload = QueryPayload {
            ecosystem: pkg.ecosystem().as_str(),
            name: pkg.name(),
            version: pkg.version(),
        };
        let req = json_request(Method::POST, self.endpoint.clone(), &payload)?;

        let resp = tokio::time::timeout(self.timeout, self.client.serve(req))
            .await
            .context("analyzer query timed out")?
            .map_err(Into::into)?;

        let (raw, report) = decode_report_response(resp).await?;
        let result = result_from_report(pkg, raw, report);
        tracing::debug!(
            package = %result.package,
            action = %result.action,
            "analyzer query decided"
        );
        Ok(result)
    }
}

/// Submit-and-poll analyzer against the tenant-authenticated scan endpoint.
///
/// Active scans run for minutes; the overall deadline bounds submit and all
/// poll attempts together.
pub struct ActiveScanAnalyzer<C> {
    client: C,
    endpoint: Uri,
    auth_token: ArcStr,
    deadline: Duration,
    poll_interval: Duration,
}

impl<C> ActiveScanAnalyzer<C> {
    pub fn new(client: C, endpoint: Uri, auth_token: impl AsRef<str>) -> Self {
        Self {
            client,
            endpoint,
            auth_token: ArcStr::from(auth_token.as_ref()),
            deadline: DEFAULT_SCAN_DEADLINE,
            poll_interval: DEFAULT_SCAN_POLL_INTERVAL,
        }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    fn status_uri(&self, analysis_id: &str) -> Result<Uri, BoxError> {
        format!(
            "{}/{analysis_id}",
            self.endpoint.to_string().trim_end_matches('/')
        )
        .parse()
        .context("build active scan status uri")
        .map_err(Into::into)
    }
}

impl<C> std::fmt::Debug for ActiveScanAnalyzer<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveScanAnalyzer")
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

impl<C> ActiveScanAnalyzer<C>
where
    C: Service<Request, Output = Response, Error: Into<BoxError>>,
{
    fn authorized(&self, mut req: Request) -> Result<Request, BoxError> {
        let value = HeaderValue::from_str(&format!("Bearer {}", self.auth_token))
            .context("build analyzer auth header")?;
        req.headers_mut().insert(AUTHORIZATION, value);
        Ok(req)
    }

    async fn scan(&self, pkg: PackageVersion) -> Result<AnalysisResult, BoxError> {
        let payload = QueryPayload {
            ecosystem: pkg.ecosystem().as_str(),
            name: pkg.name(),
            version: pkg.version(),
        };
        let req = self.authorized(json_request(Method::POST, self.endpoint.clone(), &payload)?)?;
        let resp = self.client.serve(req).await.map_err(Into::into)?;
        let (raw, report) = decode_report_response(resp).await?;

        if !report.is_pending() {
            return Ok(result_from_report(pkg, raw, report));
        }

        let analysis_id = report.analysis_id.clone();
        if analysis_id.is_empty() {
            return Err(BoxError::from(
                "active scan submit reply is pending but carries no analysis id",
            ));
        }

        loop {
            tokio::time::sleep(self.poll_interval).await;

            let status_req = self.authorized(
                Request::builder()
                    .method(Method::GET)
                    .uri(self.status_uri(&analysis_id)?)
                    .body(Body::empty())
                    .context("build active scan status request")?,
            )?;
            let resp = self.client.serve(status_req).await.map_err(Into::into)?;
            let (raw, report) = decode_report_response(resp).await?;
            if !report.is_pending() {
                return Ok(result_from_report(pkg, raw, report));
            }
            tracing::trace!(analysis_id = %analysis_id, "active scan still running");
        }
    }
}

impl<C> Analyzer for ActiveScanAnalyzer<C>
where
    C: Service<Request, Output = Response, Error: Into<BoxError>>,
{
    async fn analyze(&self, pkg: PackageVersion) -> Result<AnalysisResult, BoxError> {
        tokio::time::timeout(self.deadline, self.scan(pkg))
            .await
            .context("active scan deadline exceeded")?
    }
}
