use std::sync::Arc;

use rama::{
    Layer,
    error::{BoxError, ErrorContext as _},
    extensions::ExtensionsMut,
    graceful::ShutdownGuard,
    http::{
        Request, Response, StatusCode,
        layer::{
            compression::CompressionLayer, map_response_body::MapResponseBodyLayer,
            trace::TraceLayer, upgrade::UpgradeLayer,
        },
        matcher::MethodMatcher,
        server::HttpServer,
        service::web::response::IntoResponse,
    },
    layer::ConsumeErrLayer,
    net::{
        address::SocketAddress, http::RequestContext, proxy::ProxyTarget,
        stream::layer::http::BodyLimitLayer,
    },
    rt::Executor,
    service::service_fn,
    tcp::server::TcpListener,
    telemetry::tracing,
    tls::boring::server::TlsAcceptorLayer,
};

use pmg_lib::http::firewall::Firewall;

use crate::Args;

mod client;
mod forwarder;
mod server;

/// Maximum allowed body size for proxied requests and responses.
/// Protects against memory exhaustion from excessively large payloads.
const MAX_BODY_SIZE: usize = 500 * 1024 * 1024; // 500 MB

/// Runs the MITM HTTP(S) proxy server, including the registry firewall that
/// blocks malicious artifact downloads.
pub async fn run_proxy_server(
    args: Args,
    guard: ShutdownGuard,
    tls_acceptor: TlsAcceptorLayer,
    proxy_addr_tx: tokio::sync::oneshot::Sender<SocketAddress>,
    firewall: Firewall,
) -> Result<(), BoxError> {
    let exec = Executor::graceful(guard.clone());

    let tcp_service = TcpListener::build(exec.clone())
        .bind(args.bind)
        .await
        .context("bind TCP network interface for proxy")?;

    let proxy_addr = tcp_service
        .local_addr()
        .context("fetch local addr of bound TCP port for proxy")?;

    let https_client = self::client::new_https_client(firewall.clone())?;

    let mitm_server =
        self::server::new_mitm_server(guard.clone(), args.mitm_all, tls_acceptor, firewall)?;

    let http_inner_svc = (
        TraceLayer::new_for_http(),
        ConsumeErrLayer::trace_as_debug(),
        UpgradeLayer::new(
            exec.clone(),
            MethodMatcher::CONNECT,
            service_fn(http_connect_accept),
            Arc::new(mitm_server),
        ),
        // =============================================
        // HTTP (plain-text) (proxy) connections
        MapResponseBodyLayer::new_boxed_streaming_body(),
        CompressionLayer::new(),
        // =============================================
    )
        .into_layer(https_client);

    let http_service = HttpServer::auto(exec).service(Arc::new(http_inner_svc));

    tracing::info!(proxy.address = %proxy_addr, "local HTTP(S) proxy ready");
    if proxy_addr_tx.send(proxy_addr.into()).is_err() {
        return Err(BoxError::from(
            "failed to send proxy address to the wrapping task",
        ));
    }

    tcp_service
        .serve(BodyLimitLayer::symmetric(MAX_BODY_SIZE).into_layer(http_service))
        .await;

    Ok(())
}

async fn http_connect_accept(mut req: Request) -> Result<(Response, Request), Response> {
    match RequestContext::try_from(&req).map(|ctx| ctx.host_with_port()) {
        Ok(authority) => {
            tracing::debug!(
                server.address = %authority.host,
                server.port = authority.port,
                "accept CONNECT",
            );
            req.extensions_mut().insert(ProxyTarget(authority));
        }
        Err(err) => {
            tracing::error!(uri = %req.uri(), "error extracting authority: {err:?}");
            return Err(StatusCode::BAD_REQUEST.into_response());
        }
    }

    Ok((StatusCode::OK.into_response(), req))
}
