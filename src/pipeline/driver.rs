//! Connection driver: runs one connection through its stage chain.
//!
//! # Responsibilities
//! - Apply the idle timeout guard to the raw stream
//! - Sniff for TLS, run the handshake and hand the ALPN result to the
//!   pipeline configurator before any HTTP byte is decoded
//! - Serve requests with whichever framing the chain holds
//! - Take CONNECT tunnels back from the HTTP/1.1 codec and loop them through
//!   the TLS upgrade stage again
//! - Report the error that ends the connection to the exception stage
//!
//! One driver is spawned per accepted connection, and it alone owns the
//! connection's chain.

use std::error::Error as StdError;
use std::io;
use std::sync::Arc;

use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::TokioIo;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use crate::http::connect::TunnelRequest;
use crate::http::handler::MainHandlerStage;
use crate::http::http1::HttpRequestDecoder;
use crate::http::http2::Http2Codec;
use crate::http::request::{DecodedRequest, HttpProtocol};
use crate::net::context::ConnectionContext;
use crate::net::idle::IdleTimeout;
use crate::net::rewind::Rewind;
use crate::net::tls::{self, TlsError, TlsUpgrade};
use crate::pipeline::negotiation::NegotiationError;
use crate::pipeline::stage::{self, Stage, StageError};
use crate::pipeline::{ChannelStages, Framing, Pipeline, PipelineError, RequestChain};

/// Byte stream a connection can run on.
pub trait Io: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Io for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

type BoxedIo = Box<dyn Io>;

/// Error that ends a connection.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("connection I/O failed: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Tls(#[from] TlsError),

    #[error(transparent)]
    Negotiation(#[from] NegotiationError),

    #[error("inconsistent stage chain: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("HTTP connection failed: {0}")]
    Http(#[from] hyper::Error),

    #[error(transparent)]
    Stage(#[from] StageError),
}

impl ConnectionError {
    /// Short label used as a metrics dimension.
    pub fn kind(&self) -> &'static str {
        match self {
            ConnectionError::Io(_) => "io",
            ConnectionError::Tls(_) => "tls",
            ConnectionError::Negotiation(_) => "negotiation",
            ConnectionError::Pipeline(_) => "pipeline",
            ConnectionError::Http(_) => "http",
            ConnectionError::Stage(_) => "stage",
        }
    }

    /// Whether the connection was closed by the idle timeout guard.
    pub fn is_idle_timeout(&self) -> bool {
        let mut source: Option<&(dyn StdError + 'static)> = Some(self);
        while let Some(error) = source {
            if let Some(e) = error.downcast_ref::<io::Error>() {
                if e.kind() == io::ErrorKind::TimedOut {
                    return true;
                }
            }
            source = error.source();
        }
        false
    }
}

/// Drives a single connection.
#[derive(Debug)]
pub struct ConnectionDriver {
    ctx: ConnectionContext,
    pipeline: Pipeline,
    tunnels: mpsc::UnboundedReceiver<TunnelRequest>,
    secured: bool,
}

impl ConnectionDriver {
    /// Attach the initial chain to a freshly accepted connection.
    pub fn init_channel(
        ctx: ConnectionContext,
        tls_upgrade: TlsUpgrade,
        main_handler: MainHandlerStage,
    ) -> Result<Self, PipelineError> {
        let (tunnels_tx, tunnels) = mpsc::unbounded_channel();
        let pipeline = Pipeline::initial(
            &ctx,
            ChannelStages {
                tls_upgrade,
                tunnels: tunnels_tx,
                main_handler,
            },
        )?;
        Ok(Self {
            ctx,
            pipeline,
            tunnels,
            secured: false,
        })
    }

    pub fn context(&self) -> &ConnectionContext {
        &self.ctx
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Run the connection to completion.
    pub async fn run<S: Io>(mut self, stream: S) {
        let id = self.ctx.id();
        tracing::trace!(connection_id = %id, peer = %self.ctx.peer_addr(), "Connection started");

        if let Err(error) = self.drive(Box::new(stream)).await {
            self.pipeline
                .exception_boundary()
                .unwrap_or_default()
                .caught(id, &error);
        }

        tracing::trace!(connection_id = %id, "Connection finished");
    }

    async fn drive(&mut self, stream: BoxedIo) -> Result<(), ConnectionError> {
        let mut io: BoxedIo = match self.pipeline.get(stage::TIMEOUT) {
            Some(Stage::IdleTimeout(handle)) => Box::new(IdleTimeout::new(stream, handle.clone())),
            _ => stream,
        };

        loop {
            io = match self.upgrade_tls(io).await? {
                Some(io) => io,
                None => return Ok(()),
            };
            io = match self.serve(io).await? {
                Some(tunnel) => tunnel,
                None => return Ok(()),
            };
        }
    }

    /// Run the TLS upgrade stage on `io`. `None` when the peer left before
    /// sending anything.
    async fn upgrade_tls(&mut self, mut io: BoxedIo) -> Result<Option<BoxedIo>, ConnectionError> {
        if self.secured {
            return Ok(Some(io));
        }
        let upgrade = match self.pipeline.get(stage::TLS_UPGRADE) {
            Some(Stage::TlsUpgrade(upgrade)) => upgrade.clone(),
            _ => return Ok(Some(io)),
        };

        let Some(prefix) = tls::sniff(&mut io).await? else {
            return Ok(None);
        };
        let is_tls = tls::is_tls_handshake(&prefix);
        let io = Rewind::new_buffered(io, prefix);
        if !is_tls {
            return Ok(Some(Box::new(io)));
        }

        self.secured = true;
        self.ctx.mark_tls_upgraded();
        let stream = upgrade.handshake(io).await?;
        let protocol = tls::negotiated_protocol(stream.get_ref().1);
        tracing::debug!(
            connection_id = %self.ctx.id(),
            protocol = %protocol,
            "TLS handshake complete"
        );

        let configurator = Arc::clone(self.ctx.pipeline_configurator());
        configurator(&mut self.pipeline, &self.ctx, &protocol)?;
        Ok(Some(Box::new(stream)))
    }

    /// Serve requests until the connection ends or turns into a tunnel.
    async fn serve(&mut self, io: BoxedIo) -> Result<Option<BoxedIo>, ConnectionError> {
        let chain = self.pipeline.request_chain()?;
        match self.pipeline.framing()? {
            Framing::Http1(decoder) => self.serve_http1(&decoder, chain, io).await,
            Framing::Http2(codec) => {
                self.serve_http2(&codec, chain, io).await?;
                Ok(None)
            }
        }
    }

    async fn serve_http1(
        &mut self,
        decoder: &HttpRequestDecoder,
        chain: RequestChain,
        io: BoxedIo,
    ) -> Result<Option<BoxedIo>, ConnectionError> {
        let scheme = self.ctx.scheme();
        let (failures_tx, mut failures) = mpsc::unbounded_channel();
        let service = service_fn(move |request: Request<Incoming>| {
            let chain = chain.clone();
            let failures = failures_tx.clone();
            let scheme = request.uri().scheme().cloned().unwrap_or_else(|| scheme.clone());
            let request = DecodedRequest::new(request, scheme, HttpProtocol::Http1);
            async move { guard(chain.process(request).await, &failures) }
        });

        let connection = decoder
            .builder()
            .serve_connection(TokioIo::new(io), service)
            .with_upgrades();
        await_connection(connection, &mut failures).await?;

        let Ok(tunnel) = self.tunnels.try_recv() else {
            return Ok(None);
        };
        let upgraded = tunnel.upgrade.await?;
        self.ctx.mark_tls_upgraded();
        tracing::debug!(
            connection_id = %self.ctx.id(),
            target = %tunnel.target,
            "CONNECT tunnel established"
        );
        Ok(Some(Box::new(TokioIo::new(upgraded))))
    }

    async fn serve_http2(
        &mut self,
        codec: &Http2Codec,
        chain: RequestChain,
        io: BoxedIo,
    ) -> Result<(), ConnectionError> {
        let adapter = codec.clone();
        let (failures_tx, mut failures) = mpsc::unbounded_channel();
        let service = service_fn(move |request: Request<Incoming>| {
            let chain = chain.clone();
            let failures = failures_tx.clone();
            let request = adapter.adapt(request);
            async move { guard(chain.process(request).await, &failures) }
        });

        let connection = codec.builder().serve_connection(TokioIo::new(io), service);
        await_connection(connection, &mut failures).await
    }
}

/// Error handed to the HTTP codec when a stage failed; the stage error itself
/// travels to the driver.
#[derive(Debug, Error)]
#[error("request stage failed, closing connection")]
struct StageFailed;

fn guard<T>(
    result: Result<T, StageError>,
    failures: &mpsc::UnboundedSender<StageError>,
) -> Result<T, StageFailed> {
    result.map_err(|error| {
        let _ = failures.send(error);
        StageFailed
    })
}

/// Wait for the codec to finish, closing the whole connection as soon as any
/// request stage fails.
async fn await_connection<F>(
    connection: F,
    failures: &mut mpsc::UnboundedReceiver<StageError>,
) -> Result<(), ConnectionError>
where
    F: std::future::Future<Output = Result<(), hyper::Error>>,
{
    let result = tokio::select! {
        biased;
        Some(error) = failures.recv() => return Err(error.into()),
        result = connection => result,
    };
    if let Ok(error) = failures.try_recv() {
        return Err(error.into());
    }
    result.map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use hyper::http::uri::Scheme;
    use hyper::Response;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio::task::JoinHandle;

    use crate::http::handler::{HandlerExecutor, MainHandler};
    use crate::http::response::{self, BoxError};
    use crate::pipeline::tests::test_context;

    fn spawn_driver(handler: Arc<dyn MainHandler>) -> (DuplexStream, JoinHandle<()>) {
        let ctx = test_context();
        let tls_upgrade = TlsUpgrade::from_config(
            ctx.tls_config(),
            Arc::clone(ctx.certificate_service()),
            ctx.server_config().handshake_timeout(),
        )
        .unwrap();
        let main_handler = MainHandlerStage::new(handler, HandlerExecutor::current());
        let driver = ConnectionDriver::init_channel(ctx, tls_upgrade, main_handler).unwrap();

        let (client, server) = tokio::io::duplex(16 * 1024);
        (client, tokio::spawn(driver.run(server)))
    }

    fn recording_handler() -> (Arc<dyn MainHandler>, mpsc::UnboundedReceiver<(Scheme, String)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler = move |request: DecodedRequest| {
            let tx = tx.clone();
            async move {
                let _ = tx.send((request.scheme().clone(), request.uri().to_string()));
                Ok::<_, BoxError>(Response::new(response::full("ok")))
            }
        };
        (Arc::new(handler), rx)
    }

    async fn read_head(client: &mut DuplexStream) -> String {
        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            let n = client.read(&mut byte).await.unwrap();
            assert_ne!(n, 0, "connection closed mid-response");
            head.push(byte[0]);
        }
        String::from_utf8(head).unwrap()
    }

    #[tokio::test]
    async fn plaintext_request_reaches_handler() {
        let (handler, mut seen) = recording_handler();
        let (mut client, driver) = spawn_driver(handler);

        client
            .write_all(b"GET http://example.com/a HTTP/1.1\r\nHost: example.com\r\n\r\n")
            .await
            .unwrap();
        let head = read_head(&mut client).await;
        assert!(head.starts_with("HTTP/1.1 200 OK"), "{head}");

        let (scheme, uri) = seen.recv().await.unwrap();
        assert_eq!(scheme, Scheme::HTTP);
        assert_eq!(uri, "http://example.com/a");

        drop(client);
        tokio::time::timeout(Duration::from_secs(5), driver)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn connect_tunnel_is_served_again_as_https() {
        let (handler, mut seen) = recording_handler();
        let (mut client, _driver) = spawn_driver(handler);

        client
            .write_all(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n")
            .await
            .unwrap();
        let head = read_head(&mut client).await;
        assert!(head.starts_with("HTTP/1.1 200"), "{head}");

        client
            .write_all(b"GET /inside HTTP/1.1\r\nHost: example.com\r\n\r\n")
            .await
            .unwrap();
        let head = read_head(&mut client).await;
        assert!(head.starts_with("HTTP/1.1 200 OK"), "{head}");

        let (scheme, uri) = seen.recv().await.unwrap();
        assert_eq!(scheme, Scheme::HTTPS);
        assert_eq!(uri, "/inside");
    }

    #[tokio::test]
    async fn handler_failure_closes_connection() {
        let handler = |_request: DecodedRequest| async {
            Err::<Response<response::ProxyBody>, BoxError>("upstream exploded".into())
        };
        let (mut client, driver) = spawn_driver(Arc::new(handler));

        client
            .write_all(b"GET http://example.com/ HTTP/1.1\r\nHost: example.com\r\n\r\n")
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(5), driver)
            .await
            .unwrap()
            .unwrap();

        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn idle_connection_is_closed() {
        let (handler, _seen) = recording_handler();
        let (client, driver) = spawn_driver(handler);

        tokio::time::timeout(Duration::from_secs(60), driver)
            .await
            .unwrap()
            .unwrap();
        drop(client);
    }

    #[test]
    fn idle_timeouts_are_recognised_through_hyper() {
        let error = ConnectionError::Io(io::Error::new(io::ErrorKind::TimedOut, "idle"));
        assert!(error.is_idle_timeout());
        assert_eq!(error.kind(), "io");

        let error = ConnectionError::Stage(StageError::Unanswered);
        assert!(!error.is_idle_timeout());
        assert_eq!(error.kind(), "stage");
    }
}
