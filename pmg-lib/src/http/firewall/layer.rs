use rama::{
    Layer, Service,
    error::BoxError,
    http::{Request, Response},
    telemetry::tracing,
};

use super::{Firewall, RequestAction};

#[derive(Debug, Clone)]
pub struct EvaluateRequestService<S> {
    inner: S,
    firewall: Firewall,
}

#[derive(Debug, Clone)]
/// Created using [`Firewall::into_evaluate_request_layer`].
pub struct EvaluateRequestLayer(pub(in crate::http::firewall) Firewall);

impl<S> Service<Request> for EvaluateRequestService<S>
where
    S: Service<Request, Output = Response, Error: Into<BoxError>>,
{
    type Output = Response;
    type Error = BoxError;

    async fn serve(&self, req: Request) -> Result<Self::Output, Self::Error> {
        match self.firewall.evaluate_request(req).await? {
            RequestAction::Allow(req) => self.inner.serve(req).await.map_err(Into::into),
            RequestAction::Block(blocked) => {
                tracing::trace!(
                    "EvaluateRequestService: firewall blocked request with self-generated response"
                );
                Ok(blocked.response)
            }
        }
    }
}

impl<S> Layer<S> for EvaluateRequestLayer {
    type Service = EvaluateRequestService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        EvaluateRequestService {
            inner,
            firewall: self.0.clone(),
        }
    }

    fn into_layer(self, inner: S) -> Self::Service {
        EvaluateRequestService {
            inner,
            firewall: self.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EvaluateResponseService<S> {
    inner: S,
    firewall: Firewall,
}

#[derive(Debug, Clone)]
/// Created using [`Firewall::into_evaluate_response_layer`].
pub struct EvaluateResponseLayer(pub(in crate::http::firewall) Firewall);

impl<S> Service<Request> for EvaluateResponseService<S>
where
    S: Service<Request, Output = Response, Error: Into<BoxError>>,
{
    type Output = Response;
    type Error = BoxError;

    async fn serve(&self, req: Request) -> Result<Self::Output, Self::Error> {
        let resp = self.inner.serve(req).await.map_err(Into::into)?;

        tracing::trace!("EvaluateResponseService: evaluating response");
        self.firewall.evaluate_response(resp).await
    }
}

impl<S> Layer<S> for EvaluateResponseLayer {
    type Service = EvaluateResponseService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        EvaluateResponseService {
            inner,
            firewall: self.0.clone(),
        }
    }

    fn into_layer(self, inner: S) -> Self::Service {
        EvaluateResponseService {
            inner,
            firewall: self.0,
        }
    }
}
