use rama::{
    http::Request,
    net::{address::Domain, http::RequestContext, proxy::ProxyTarget},
};

use rama::extensions::ExtensionsRef as _;

pub mod firewall;
pub mod response;

mod content_type;
pub use content_type::KnownContentType;

/// Best-effort extraction of the target domain for an (intercepted) request.
///
/// MITM'd requests carry the CONNECT authority as a [`ProxyTarget`]
/// extension; plain proxied requests fall back to the request context.
pub fn try_get_domain_for_req(req: &Request) -> Option<Domain> {
    if let Some(ProxyTarget(authority)) = req.extensions().get()
        && let Some(domain) = authority.host.as_domain()
    {
        return Some(domain.clone());
    }

    RequestContext::try_from(req)
        .ok()
        .and_then(|ctx| ctx.host_with_port().host.as_domain().map(|d| d.clone()))
}
