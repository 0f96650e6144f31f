//! HTTP/2 framing stage and inbound adapter.
//!
//! Installed in place of the HTTP/1.1 encoder once ALPN selects `h2`. Each
//! connection gets its own server-side HTTP/2 connection; every inbound stream
//! is adapted into the same `DecodedRequest` shape HTTP/1.1 produces, so the
//! CONNECT, recursive and main-handler stages run unchanged.

use hyper::header::{HeaderValue, HOST};
use hyper::http::uri::Scheme;
use hyper::server::conn::http2;
use hyper::{Request, Uri};
use hyper_util::rt::TokioExecutor;

use crate::http::request::{DecodedRequest, HttpProtocol};

#[derive(Debug, Clone)]
pub struct Http2Codec {
    scheme: Scheme,
}

impl Http2Codec {
    /// Codec stamping `scheme` on every adapted request.
    pub fn new(scheme: Scheme) -> Self {
        Self { scheme }
    }

    pub fn scheme(&self) -> &Scheme {
        &self.scheme
    }

    /// Fresh server-side HTTP/2 connection builder.
    pub fn builder(&self) -> http2::Builder<TokioExecutor> {
        http2::Builder::new(TokioExecutor::new())
    }

    /// Translate an inbound HTTP/2 stream into a decoded request.
    ///
    /// `:authority` becomes a `Host` header when the client sent none, and the
    /// URI carries the scheme chosen at negotiation time.
    pub fn adapt<B>(&self, request: Request<B>) -> DecodedRequest<B> {
        let (mut parts, body) = request.into_parts();

        if let Some(authority) = parts.uri.authority().cloned() {
            if !parts.headers.contains_key(HOST) {
                if let Ok(value) = HeaderValue::from_str(authority.as_str()) {
                    parts.headers.insert(HOST, value);
                }
            }

            if parts.uri.scheme() != Some(&self.scheme) && parts.uri.path_and_query().is_some() {
                let mut uri_parts = parts.uri.clone().into_parts();
                uri_parts.scheme = Some(self.scheme.clone());
                if let Ok(uri) = Uri::from_parts(uri_parts) {
                    parts.uri = uri;
                }
            }
        }

        DecodedRequest::new(
            Request::from_parts(parts, body),
            self.scheme.clone(),
            HttpProtocol::Http2,
        )
    }
}
