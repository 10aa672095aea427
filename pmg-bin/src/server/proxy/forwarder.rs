use std::fmt;

use rama::{
    Service,
    error::{BoxError, ErrorContext as _},
    extensions::ExtensionsMut,
    net::{
        client::{ConnectorService, EstablishedClientConnection},
        proxy::{ProxyRequest, ProxyTarget, StreamForwardService},
    },
    rt::Executor,
    stream::Stream,
    tcp::client::{Request as TcpRequest, service::TcpConnector},
};

/// Opaque tunnel for streams the firewall has no interest in decrypting.
pub(super) struct TcpForwarder {
    connector: TcpConnector,
}

impl fmt::Debug for TcpForwarder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpForwarder").finish()
    }
}

impl TcpForwarder {
    pub(super) fn new(exec: Executor) -> Self {
        Self {
            connector: TcpConnector::new(exec),
        }
    }
}

impl<T> Service<T> for TcpForwarder
where
    T: Stream + Unpin + ExtensionsMut,
{
    type Output = ();
    type Error = BoxError;

    async fn serve(&self, source: T) -> Result<Self::Output, Self::Error> {
        let ProxyTarget(host_with_port) = source
            .extensions()
            .get()
            .context("missing forward authority")?;

        let extensions = source.extensions().clone();
        let tcp_req = TcpRequest::new_with_extensions(host_with_port.clone(), extensions);

        let EstablishedClientConnection { conn: target, .. } = self
            .connector
            .connect(tcp_req)
            .await
            .context("establish direct tcp connection")
            .with_context_field("target", || host_with_port.clone())?;

        let proxy_req = ProxyRequest { source, target };

        StreamForwardService::default().serve(proxy_req).await
    }
}
