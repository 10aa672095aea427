use std::{pin::Pin, sync::Arc};

use rama::{
    error::BoxError,
    http::{Request, Response},
    net::address::Domain,
};

use crate::package::PackageVersion;

/// A blocked request: the synthesized response for the client plus metadata
/// about what was withheld.
pub struct BlockedRequest {
    pub response: Response,
    pub package: PackageVersion,
}

/// Action determined by an [`Interceptor`] when evaluating a [`Request`].
pub enum RequestAction {
    /// Let the (possibly modified) [`Request`] continue to the next
    /// interceptor and ultimately the egress server.
    Allow(Request),
    /// Stop here and answer the client with the blocked response.
    Block(BlockedRequest),
}

/// A registry-aware handler the firewall dispatches intercepted traffic to.
///
/// An interceptor decides two things: which domains warrant TLS interception
/// at all ([`Interceptor::match_domain`] drives the MITM-or-tunnel choice),
/// and what to do with each decrypted request or response.
///
/// Errors from the evaluate methods abort the connection; ordinary blocking
/// is expressed through [`RequestAction::Block`] instead.
pub trait Interceptor: Sized + Send + Sync + 'static {
    /// Opaque identifier used in logging.
    fn product_name(&self) -> &'static str;

    /// Whether traffic to this domain should be decrypted and inspected.
    fn match_domain(&self, domain: &Domain) -> bool;

    /// Evaluate an intercepted request before it leaves for the egress
    /// server.
    fn evaluate_request(
        &self,
        req: Request,
    ) -> impl Future<Output = Result<RequestAction, BoxError>> + Send + '_;

    /// Evaluate the upstream response before it reaches the client.
    fn evaluate_response(
        &self,
        resp: Response,
    ) -> impl Future<Output = Result<Response, BoxError>> + Send + '_;

    /// Converts this [`Interceptor`] into a [`DynInterceptor`] trait object
    /// so the firewall can hold a heterogeneous set.
    fn into_dyn(self) -> DynInterceptor {
        DynInterceptor {
            inner: Arc::new(self),
        }
    }
}

#[allow(clippy::type_complexity)]
trait DynInterceptorInner {
    fn dyn_product_name(&self) -> &'static str;

    fn dyn_match_domain(&self, domain: &Domain) -> bool;

    fn dyn_evaluate_request(
        &self,
        req: Request,
    ) -> Pin<Box<dyn Future<Output = Result<RequestAction, BoxError>> + Send + '_>>;

    fn dyn_evaluate_response(
        &self,
        resp: Response,
    ) -> Pin<Box<dyn Future<Output = Result<Response, BoxError>> + Send + '_>>;
}

impl<I: Interceptor> DynInterceptorInner for I {
    #[inline(always)]
    fn dyn_product_name(&self) -> &'static str {
        self.product_name()
    }

    #[inline(always)]
    fn dyn_match_domain(&self, domain: &Domain) -> bool {
        self.match_domain(domain)
    }

    #[inline(always)]
    fn dyn_evaluate_request(
        &self,
        req: Request,
    ) -> Pin<Box<dyn Future<Output = Result<RequestAction, BoxError>> + Send + '_>> {
        Box::pin(self.evaluate_request(req))
    }

    #[inline(always)]
    fn dyn_evaluate_response(
        &self,
        resp: Response,
    ) -> Pin<Box<dyn Future<Output = Result<Response, BoxError>> + Send + '_>> {
        Box::pin(self.evaluate_response(resp))
    }
}

/// A dyn-patched [`Interceptor`], exclusively created using
/// [`Interceptor::into_dyn`].
pub struct DynInterceptor {
    inner: Arc<dyn DynInterceptorInner + Send + Sync + 'static>,
}

impl Clone for DynInterceptor {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl std::fmt::Debug for DynInterceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynInterceptor").finish()
    }
}

impl Interceptor for DynInterceptor {
    #[inline(always)]
    fn product_name(&self) -> &'static str {
        self.inner.dyn_product_name()
    }

    #[inline(always)]
    fn match_domain(&self, domain: &Domain) -> bool {
        self.inner.dyn_match_domain(domain)
    }

    #[inline(always)]
    fn evaluate_request(
        &self,
        req: Request,
    ) -> impl Future<Output = Result<RequestAction, BoxError>> + Send + '_ {
        self.inner.dyn_evaluate_request(req)
    }

    #[inline(always)]
    fn evaluate_response(
        &self,
        resp: Response,
    ) -> impl Future<Output = Result<Response, BoxError>> + Send + '_ {
        self.inner.dyn_evaluate_response(resp)
    }

    #[inline(always)]
    fn into_dyn(self) -> Self {
        self
    }
}
