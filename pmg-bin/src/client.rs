//! Centralized (web) client creation.
//!
//! Every egress request of the process, whether it is the analyzer, the
//! registry resolver or the proxy's upstream leg, goes through a client
//! built here, so tests can swap the connector stack in one place.

use std::time::Duration;

use rama::{
    Service,
    error::{BoxError, ErrorContext as _},
    http::{Request, Response, Version, client::EasyHttpWebClient},
    net::client::pool::http::HttpPooledConnectorConfig,
    rt::Executor,
    tcp::client::service::TcpConnector,
};

const MAX_ACTIVE_CONNECTIONS: usize = 64;

/// Create a new web client that can be cloned and shared.
pub fn new_web_client(
    exec: Executor,
) -> Result<impl Service<Request, Output = Response, Error: Into<BoxError>> + Clone, BoxError> {
    let tcp_connector = TcpConnector::new(exec);

    Ok(EasyHttpWebClient::connector_builder()
        .with_custom_transport_connector(tcp_connector)
        .without_tls_proxy_support()
        .without_proxy_support()
        // fallback to HTTP/1.1 as default in case no ALPN happens
        .with_tls_support_using_boringssl_and_default_http_version(None, Version::HTTP_11)
        .with_default_http_connector(Executor::default())
        .try_with_connection_pool(HttpPooledConnectorConfig {
            max_total: MAX_ACTIVE_CONNECTIONS * 2,
            max_active: MAX_ACTIVE_CONNECTIONS,
            wait_for_pool_timeout: Some(Duration::from_secs(120)),
            idle_timeout: Some(Duration::from_secs(300)),
        })
        .context("create connection pool for egress web client")?
        .build_client())
}
