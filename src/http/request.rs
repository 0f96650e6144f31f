//! The decoded request shared by every downstream stage.
//!
//! # Responsibilities
//! - Give HTTP/1.1 and HTTP/2 requests one shape (method, target, headers, body, scheme)
//! - Resolve the request target (`host:port`) from the URI or the Host header
//!
//! # Design Decisions
//! - The codec-specific parsing stays in hyper; this type only adds the scheme
//!   and protocol the connection decided on
//! - Generic over the body so stages can be exercised without a live connection

use std::fmt;

use hyper::body::Incoming;
use hyper::header::HOST;
use hyper::http::uri::{Authority, Scheme};
use hyper::{HeaderMap, Method, Request, Uri};

/// Framing a request was decoded from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpProtocol {
    Http1,
    Http2,
}

impl fmt::Display for HttpProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HttpProtocol::Http1 => f.write_str("HTTP/1.1"),
            HttpProtocol::Http2 => f.write_str("HTTP/2"),
        }
    }
}

/// Destination of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    host: String,
    port: u16,
}

impl Target {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn from_authority(authority: &Authority, default_port: u16) -> Self {
        Self::new(authority.host(), authority.port_u16().unwrap_or(default_port))
    }

    /// Host name or IP literal; IPv6 literals keep their brackets.
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

pub fn default_port(scheme: &Scheme) -> u16 {
    if *scheme == Scheme::HTTPS {
        443
    } else {
        80
    }
}

/// A fully decoded request, whatever framing it arrived in.
#[derive(Debug)]
pub struct DecodedRequest<B = Incoming> {
    request: Request<B>,
    scheme: Scheme,
    protocol: HttpProtocol,
}

impl<B> DecodedRequest<B> {
    pub fn new(request: Request<B>, scheme: Scheme, protocol: HttpProtocol) -> Self {
        Self {
            request,
            scheme,
            protocol,
        }
    }

    pub fn method(&self) -> &Method {
        self.request.method()
    }

    pub fn uri(&self) -> &Uri {
        self.request.uri()
    }

    pub fn headers(&self) -> &HeaderMap {
        self.request.headers()
    }

    pub fn scheme(&self) -> &Scheme {
        &self.scheme
    }

    pub fn protocol(&self) -> HttpProtocol {
        self.protocol
    }

    pub fn request(&self) -> &Request<B> {
        &self.request
    }

    pub fn request_mut(&mut self) -> &mut Request<B> {
        &mut self.request
    }

    pub fn into_request(self) -> Request<B> {
        self.request
    }

    /// Target `host:port`: the URI authority, else the Host header.
    ///
    /// The port defaults from the URI scheme, else from the connection scheme.
    pub fn target(&self) -> Option<Target> {
        let uri = self.request.uri();
        let port = default_port(uri.scheme().unwrap_or(&self.scheme));
        if let Some(authority) = uri.authority() {
            return Some(Target::from_authority(authority, port));
        }
        let host = self.request.headers().get(HOST)?.to_str().ok()?;
        let authority: Authority = host.parse().ok()?;
        Some(Target::from_authority(&authority, port))
    }
}
