use rama::{
    Layer as _, Service,
    error::BoxError,
    http::{
        Request, Response, StatusCode,
        layer::{
            decompression::DecompressionLayer,
            map_response_body::MapResponseBodyLayer,
            remove_header::{RemoveRequestHeaderLayer, RemoveResponseHeaderLayer},
        },
        service::web::response::IntoResponse,
    },
    rt::Executor,
    telemetry::tracing,
};

use pmg_lib::http::firewall::Firewall;

/// The proxy's egress client: firewall evaluation wrapped around the shared
/// web client. Upstream failures answer the client with 502 instead of
/// tearing the MITM'd connection down.
#[derive(Debug)]
pub(super) struct HttpClient<S> {
    inner: S,
}

pub(super) fn new_https_client(
    firewall: Firewall,
) -> Result<HttpClient<impl Service<Request, Output = Response, Error = BoxError>>, BoxError> {
    let inner = (
        RemoveResponseHeaderLayer::hop_by_hop(),
        firewall.clone().into_evaluate_response_layer(),
        firewall.into_evaluate_request_layer(),
        RemoveRequestHeaderLayer::hop_by_hop(),
        MapResponseBodyLayer::new_boxed_streaming_body(),
        DecompressionLayer::new(),
    )
        .into_layer(crate::client::new_web_client(Executor::default())?);

    Ok(HttpClient { inner })
}

impl<S> Service<Request> for HttpClient<S>
where
    S: Service<Request, Output = Response, Error = BoxError>,
{
    type Output = S::Output;
    type Error = S::Error;

    async fn serve(&self, req: Request) -> Result<Self::Output, Self::Error> {
        let uri = req.uri().clone();
        tracing::debug!(uri = %uri, "serving http(s) over proxy (egress) client");

        match self.inner.serve(req).await {
            Ok(resp) => Ok(resp),
            Err(err) => {
                tracing::error!(uri = %uri, "error forwarding request: {err:?}");
                Ok(StatusCode::BAD_GATEWAY.into_response())
            }
        }
    }
}
