use std::{convert::Infallible, sync::Arc};

use rama::{
    Layer as _, Service,
    error::{BoxError, OpaqueError},
    graceful::ShutdownGuard,
    http::{
        layer::{
            compression::CompressionLayer, map_response_body::MapResponseBodyLayer,
            trace::TraceLayer,
        },
        server::HttpServer,
    },
    layer::ConsumeErrLayer,
    net::proxy::ProxyTarget,
    rt::Executor,
    stream::Stream,
    telemetry::tracing,
    tls::boring::server::TlsAcceptorLayer,
};

use rama::extensions::ExtensionsMut;

use pmg_lib::http::firewall::Firewall;

use super::forwarder::TcpForwarder;

/// Per-connection MITM decision: decrypt streams whose CONNECT authority a
/// registry interceptor claims, tunnel everything else opaquely.
#[derive(Debug)]
pub(super) struct MitmServer<S> {
    inner: S,
    mitm_all: bool,
    forwarder: TcpForwarder,
    firewall: Firewall,
}

pub(super) fn new_mitm_server<S: Stream + ExtensionsMut + Unpin>(
    guard: ShutdownGuard,
    mitm_all: bool,
    tls_acceptor: TlsAcceptorLayer,
    firewall: Firewall,
) -> Result<MitmServer<impl Service<S, Output = (), Error = BoxError>>, OpaqueError> {
    let https_svc = (
        TraceLayer::new_for_http(),
        ConsumeErrLayer::trace_as_debug(),
        MapResponseBodyLayer::new_boxed_streaming_body(),
        CompressionLayer::new(),
    )
        .into_layer(super::client::new_https_client(firewall.clone())?);

    let inner = tls_acceptor
        .into_layer(HttpServer::auto(Executor::graceful(guard.clone())).service(Arc::new(https_svc)));

    Ok(MitmServer {
        inner,
        mitm_all,
        forwarder: TcpForwarder::new(Executor::graceful(guard)),
        firewall,
    })
}

impl<T, S> Service<S> for MitmServer<T>
where
    T: Service<S, Output = (), Error = BoxError>,
    S: Stream + ExtensionsMut + Unpin,
{
    type Output = T::Output;
    type Error = Infallible;

    async fn serve(&self, stream: S) -> Result<Self::Output, Self::Error> {
        let maybe_target: Option<ProxyTarget> = stream.extensions().get().cloned();

        let maybe_domain = maybe_target
            .as_ref()
            .and_then(|ProxyTarget(target)| target.host.as_domain().map(|d| d.clone()));

        let should_mitm = self.mitm_all
            || maybe_domain
                .as_ref()
                .map(|domain| self.firewall.should_mitm(domain))
                .unwrap_or_default();

        let result = if should_mitm {
            tracing::debug!(
                "MITM (all? {}) incoming stream: target = {maybe_target:?}",
                self.mitm_all,
            );
            self.inner.serve(stream).await
        } else {
            // purely observed, never blocked, never decrypted
            if let Some(domain) = &maybe_domain {
                self.firewall.observe_connect(domain);
            }
            tracing::debug!("transport-forward incoming stream: target = {maybe_target:?}");
            self.forwarder.serve(stream).await
        };

        if let Err(err) = result {
            tracing::debug!(
                "mitm server finished with error for target = {maybe_target:?}: {err}"
            );
        }

        Ok(())
    }
}
