//! Shared utilities for the integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper::http::uri::Scheme;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use intercepting_proxy::http::response::{self, BoxError, ProxyBody};
use intercepting_proxy::http::server::ServerHandle;
use intercepting_proxy::http::{DecodedRequest, HttpProtocol, HttpServer, MainHandler};
use intercepting_proxy::lifecycle::Shutdown;
use intercepting_proxy::net::certificate::{CertificateService, StaticCertificateService};
use intercepting_proxy::net::context::ConnectionContext;
use intercepting_proxy::pipeline::{configure_protocol, NegotiationError, NegotiationState, Pipeline};
use intercepting_proxy::ProxyConfig;

pub const INITIAL_CHAIN: [&str; 8] = [
    "timeout",
    "tls.upgrade",
    "http.decoder",
    "http.encoder",
    "http.connect",
    "http.recursive",
    "http.main-handler",
    "exception",
];

pub const HTTP2_CHAIN: [&str; 6] = [
    "tls.upgrade",
    "http2.codec",
    "http.connect",
    "http.recursive",
    "http.main-handler",
    "exception",
];

/// Self-signed `localhost` certificate and a root store trusting it.
pub struct TestCertificate {
    pub service: Arc<dyn CertificateService>,
    pub roots: RootCertStore,
}

pub fn test_certificate() -> TestCertificate {
    let generated = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
    let cert: CertificateDer<'static> = generated.cert.der().clone();
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(generated.key_pair.serialize_der()));

    let mut roots = RootCertStore::empty();
    roots.add(cert.clone()).unwrap();

    let service = StaticCertificateService::from_der(vec![cert], key).unwrap();
    TestCertificate {
        service: Arc::new(service),
        roots,
    }
}

/// Config listening on an ephemeral loopback port.
pub fn test_config() -> ProxyConfig {
    let mut config = ProxyConfig::default();
    config.listener.bind_address = "127.0.0.1:0".into();
    config
}

/// What the main handler saw of a request.
#[derive(Debug, Clone)]
pub struct SeenRequest {
    pub method: Method,
    pub uri: String,
    pub scheme: Scheme,
    pub protocol: HttpProtocol,
    pub host: Option<String>,
    pub thread: Option<String>,
}

/// Handler answering `200 intercepted` and reporting every request it sees.
/// Requests to `/fail` make it return an error.
pub fn recording_handler() -> (impl MainHandler, mpsc::UnboundedReceiver<SeenRequest>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handler = move |request: DecodedRequest| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(SeenRequest {
                method: request.method().clone(),
                uri: request.uri().to_string(),
                scheme: request.scheme().clone(),
                protocol: request.protocol(),
                host: request
                    .headers()
                    .get(hyper::header::HOST)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string),
                thread: std::thread::current().name().map(str::to_string),
            });
            if request.uri().path() == "/fail" {
                return Err::<Response<ProxyBody>, BoxError>("handler failed on purpose".into());
            }
            Ok(Response::new(response::full("intercepted")))
        }
    };
    (handler, rx)
}

/// One call of the pipeline configurator.
#[derive(Debug, Clone)]
pub struct Negotiation {
    pub protocol: String,
    pub tls_upgraded: bool,
    pub before: Vec<&'static str>,
    pub after: Vec<&'static str>,
    pub state: Option<NegotiationState>,
}

#[derive(Debug, Clone, Default)]
pub struct NegotiationLog {
    calls: Arc<Mutex<Vec<Negotiation>>>,
}

impl NegotiationLog {
    pub fn calls(&self) -> Vec<Negotiation> {
        self.calls.lock().unwrap().clone()
    }

    /// Configurator recording each call before delegating to the default one.
    pub fn configurator(
        &self,
    ) -> impl Fn(&mut Pipeline, &ConnectionContext, &str) -> Result<NegotiationState, NegotiationError>
           + Send
           + Sync
           + 'static {
        let calls = Arc::clone(&self.calls);
        move |pipeline: &mut Pipeline, ctx: &ConnectionContext, protocol: &str| {
            let before = pipeline.names();
            let result = configure_protocol(pipeline, ctx, protocol);
            calls.lock().unwrap().push(Negotiation {
                protocol: protocol.to_string(),
                tls_upgraded: ctx.tls_upgraded(),
                before,
                after: pipeline.names(),
                state: result.as_ref().ok().copied(),
            });
            result
        }
    }
}

/// A started server and the coordinator that stops it.
pub struct TestServer {
    pub handle: ServerHandle,
    pub shutdown: Shutdown,
}

impl TestServer {
    pub fn addr(&self) -> SocketAddr {
        self.handle.local_addr()
    }
}

pub async fn start(server: HttpServer) -> TestServer {
    let shutdown = Shutdown::new();
    let handle = server.start(shutdown.subscribe()).await.unwrap();
    TestServer { handle, shutdown }
}

/// Client-side TLS handshake as `localhost`, offering `alpn`.
pub async fn tls_connect<S>(io: S, roots: &RootCertStore, alpn: &[&str]) -> std::io::Result<TlsStream<S>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    let mut config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(roots.clone())
        .with_no_client_auth();
    config.alpn_protocols = alpn.iter().map(|p| p.as_bytes().to_vec()).collect();

    let server_name = ServerName::try_from("localhost").unwrap();
    TlsConnector::from(Arc::new(config))
        .connect(server_name, io)
        .await
}

pub type Http1Sender = hyper::client::conn::http1::SendRequest<Empty<Bytes>>;
pub type Http2Sender = hyper::client::conn::http2::SendRequest<Empty<Bytes>>;

pub async fn http1_client<S>(io: S) -> Http1Sender
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(io))
        .await
        .unwrap();
    tokio::spawn(connection.with_upgrades());
    sender
}

pub async fn http2_client<S>(io: S) -> Http2Sender
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (sender, connection) =
        hyper::client::conn::http2::handshake(TokioExecutor::new(), TokioIo::new(io))
            .await
            .unwrap();
    tokio::spawn(connection);
    sender
}

pub fn get(uri: &str) -> Request<Empty<Bytes>> {
    Request::get(uri).body(Empty::new()).unwrap()
}

/// Status and body text of a response.
pub async fn read_response(response: Response<hyper::body::Incoming>) -> (StatusCode, String) {
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, String::from_utf8_lossy(&body).into_owned())
}

pub async fn connect(addr: SocketAddr) -> TcpStream {
    TcpStream::connect(addr).await.unwrap()
}
