//! Forwarding main handler used by the binary.
//!
//! Sends plain-HTTP requests on to their origin and relays the answer.
//! Intercepted HTTPS traffic (scheme `https`) has no upstream TLS client
//! here and is answered `502`.

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::header::{HeaderMap, HeaderName, CONNECTION};
use hyper::http::uri::Scheme;
use hyper::{Response, StatusCode, Uri, Version};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;

use crate::http::handler::MainHandler;
use crate::http::request::DecodedRequest;
use crate::http::response::{self, BoxError, ProxyBody};

/// Headers that only make sense for a single hop.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

#[derive(Debug, Clone)]
pub struct ForwardHandler {
    client: Client<HttpConnector, Incoming>,
}

impl Default for ForwardHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl ForwardHandler {
    pub fn new() -> Self {
        let client = Client::builder(TokioExecutor::new()).build(HttpConnector::new());
        Self { client }
    }
}

impl MainHandler for ForwardHandler {
    fn handle(&self, request: DecodedRequest) -> BoxFuture<'static, Result<Response<ProxyBody>, BoxError>> {
        let client = self.client.clone();
        async move { forward(client, request).await }.boxed()
    }
}

async fn forward(
    client: Client<HttpConnector, Incoming>,
    request: DecodedRequest,
) -> Result<Response<ProxyBody>, BoxError> {
    if request.scheme() == &Scheme::HTTPS {
        tracing::debug!(uri = %request.uri(), "No upstream TLS client for intercepted request");
        return Ok(response::text(
            StatusCode::BAD_GATEWAY,
            "HTTPS upstreams are not supported.",
        ));
    }
    let Some(target) = request.target() else {
        return Ok(response::text(
            StatusCode::BAD_REQUEST,
            "Request carries no target host.",
        ));
    };

    let mut request = request.into_request();
    let path = request
        .uri()
        .path_and_query()
        .map(|p| p.as_str())
        .unwrap_or("/");
    let uri: Uri = format!("http://{target}{path}").parse()?;
    *request.uri_mut() = uri;
    *request.version_mut() = Version::HTTP_11;
    strip_hop_by_hop_headers(request.headers_mut());

    tracing::debug!(method = %request.method(), uri = %request.uri(), "Forwarding request");

    match client.request(request).await {
        Ok(upstream) => {
            let (mut parts, body) = upstream.into_parts();
            strip_hop_by_hop_headers(&mut parts.headers);
            Ok(Response::from_parts(parts, body.map_err(BoxError::from).boxed()))
        }
        Err(e) => {
            tracing::warn!(target = %target, error = %e, "Upstream request failed");
            Ok(response::text(StatusCode::BAD_GATEWAY, "Upstream request failed."))
        }
    }
}

/// Remove hop-by-hop headers, including the ones named by `Connection`.
fn strip_hop_by_hop_headers(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|token| HeaderName::from_bytes(token.trim().as_bytes()).ok())
        .collect();

    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }
}
