//! TLS connections: ALPN-driven chain rewrites, scheme labelling, CONNECT
//! interception and negotiation failures.

use std::time::Duration;

use bytes::Bytes;
use http_body_util::Empty;
use hyper::header::HOST;
use hyper::http::uri::Scheme;
use hyper::{Request, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::io::AsyncReadExt;

use intercepting_proxy::http::{HttpProtocol, HttpServer};
use intercepting_proxy::net::certificate::UnavailableCertificateService;
use intercepting_proxy::net::tls::{TlsConfig, TLS_V1_2, TLS_V1_3};
use intercepting_proxy::pipeline::NegotiationState;

mod common;

#[tokio::test]
async fn http1_over_tls_keeps_the_initial_chain() {
    let cert = common::test_certificate();
    let (handler, mut seen) = common::recording_handler();
    let log = common::NegotiationLog::default();
    let server = HttpServer::new(common::test_config(), cert.service.clone())
        .with_main_handler(handler)
        .with_pipeline_configurator(log.configurator());
    let server = common::start(server).await;

    let tls = common::tls_connect(common::connect(server.addr()).await, &cert.roots, &["http/1.1"])
        .await
        .unwrap();
    let mut sender = common::http1_client(tls).await;
    let request = Request::get("/c")
        .header(HOST, "localhost")
        .body(Empty::<Bytes>::new())
        .unwrap();
    let (status, body) = common::read_response(sender.send_request(request).await.unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "intercepted");

    let calls = log.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].protocol, "http/1.1");
    assert_eq!(calls[0].state, Some(NegotiationState::Http1Active));
    assert_eq!(calls[0].before, common::INITIAL_CHAIN);
    assert_eq!(calls[0].after, common::INITIAL_CHAIN);

    let request = seen.recv().await.unwrap();
    assert_eq!(request.uri, "/c");
    assert_eq!(request.protocol, HttpProtocol::Http1);
    assert_eq!(request.scheme, Scheme::HTTPS);
}

#[tokio::test]
async fn h2_over_tls_swaps_in_the_http2_codec() {
    let cert = common::test_certificate();
    let (handler, mut seen) = common::recording_handler();
    let log = common::NegotiationLog::default();
    let server = HttpServer::new(common::test_config(), cert.service.clone())
        .with_main_handler(handler)
        .with_pipeline_configurator(log.configurator());
    let server = common::start(server).await;

    let tls = common::tls_connect(common::connect(server.addr()).await, &cert.roots, &["h2"])
        .await
        .unwrap();
    assert_eq!(tls.get_ref().1.alpn_protocol(), Some(&b"h2"[..]));
    let mut sender = common::http2_client(tls).await;
    let response = sender.send_request(common::get("https://localhost/d")).await.unwrap();
    let (status, body) = common::read_response(response).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "intercepted");

    let calls = log.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].protocol, "h2");
    assert!(calls[0].tls_upgraded);
    assert_eq!(calls[0].state, Some(NegotiationState::Http2Active));
    assert_eq!(calls[0].after, common::HTTP2_CHAIN);

    let request = seen.recv().await.unwrap();
    assert_eq!(request.protocol, HttpProtocol::Http2);
    assert_eq!(request.scheme, Scheme::HTTPS);
    assert_eq!(request.uri, "https://localhost/d");
    assert_eq!(request.host.as_deref(), Some("localhost"));
}

#[tokio::test]
async fn connect_then_tls_negotiates_h2_with_https_scheme() {
    let cert = common::test_certificate();
    let (handler, mut seen) = common::recording_handler();
    let log = common::NegotiationLog::default();
    let server = HttpServer::new(common::test_config(), cert.service.clone())
        .with_main_handler(handler)
        .with_pipeline_configurator(log.configurator());
    let server = common::start(server).await;

    let mut sender = common::http1_client(common::connect(server.addr()).await).await;
    let connect = Request::connect("example.com:443")
        .header(HOST, "example.com:443")
        .body(Empty::<Bytes>::new())
        .unwrap();
    let response = sender.send_request(connect).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let tunnel = hyper::upgrade::on(response).await.unwrap();

    let tls = common::tls_connect(TokioIo::new(tunnel), &cert.roots, &["h2", "http/1.1"])
        .await
        .unwrap();
    let mut inner = common::http2_client(tls).await;
    let response = inner.send_request(common::get("https://example.com/e")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let calls = log.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].protocol, "h2");
    assert!(calls[0].tls_upgraded, "flag must be set before negotiation");
    assert_eq!(calls[0].before, common::INITIAL_CHAIN);
    assert_eq!(calls[0].after, common::HTTP2_CHAIN);

    let request = seen.recv().await.unwrap();
    assert_eq!(request.scheme, Scheme::HTTPS);
    assert_eq!(request.protocol, HttpProtocol::Http2);
    assert_eq!(request.uri, "https://example.com/e");
}

#[tokio::test]
async fn recursive_h2_request_is_refused() {
    let cert = common::test_certificate();
    let (handler, mut seen) = common::recording_handler();
    let server = HttpServer::new(common::test_config(), cert.service.clone())
        .with_main_handler(handler);
    let server = common::start(server).await;
    let addr = server.addr();

    let tls = common::tls_connect(common::connect(addr).await, &cert.roots, &["h2"])
        .await
        .unwrap();
    let mut sender = common::http2_client(tls).await;
    let response = sender
        .send_request(common::get(&format!("https://{addr}/loop")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::LOOP_DETECTED);
    assert!(seen.try_recv().is_err());
}

#[tokio::test]
async fn h2_connection_outlives_the_idle_timeout() {
    let cert = common::test_certificate();
    let (handler, _seen) = common::recording_handler();
    let mut config = common::test_config();
    config.connection.idle_timeout_secs = 1;
    let server = HttpServer::new(config, cert.service.clone()).with_main_handler(handler);
    let server = common::start(server).await;

    let tls = common::tls_connect(common::connect(server.addr()).await, &cert.roots, &["h2"])
        .await
        .unwrap();
    let mut sender = common::http2_client(tls).await;
    let response = sender.send_request(common::get("https://localhost/first")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    tokio::time::sleep(Duration::from_millis(1500)).await;
    let response = sender.send_request(common::get("https://localhost/second")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn http1_over_tls_still_times_out() {
    let cert = common::test_certificate();
    let (handler, _seen) = common::recording_handler();
    let mut config = common::test_config();
    config.connection.idle_timeout_secs = 1;
    let server = HttpServer::new(config, cert.service.clone()).with_main_handler(handler);
    let server = common::start(server).await;

    let mut tls = common::tls_connect(common::connect(server.addr()).await, &cert.roots, &["http/1.1"])
        .await
        .unwrap();
    let mut buf = [0u8; 16];
    let read = tokio::time::timeout(Duration::from_secs(5), tls.read(&mut buf))
        .await
        .expect("idle connection left open");
    assert!(matches!(read, Ok(0) | Err(_)));
}

#[tokio::test]
async fn unsupported_alpn_closes_the_connection() {
    let cert = common::test_certificate();
    let (handler, mut seen) = common::recording_handler();
    let log = common::NegotiationLog::default();
    let tls_config = TlsConfig::new(
        vec![TLS_V1_2.into(), TLS_V1_3.into()],
        Vec::new(),
        true,
        vec!["x-custom".into()],
    );
    let server = HttpServer::new(common::test_config(), cert.service.clone())
        .with_main_handler(handler)
        .with_tls_config(tls_config)
        .with_pipeline_configurator(log.configurator());
    let server = common::start(server).await;

    let mut tls = common::tls_connect(common::connect(server.addr()).await, &cert.roots, &["x-custom"])
        .await
        .unwrap();
    let mut buf = [0u8; 16];
    let read = tokio::time::timeout(Duration::from_secs(5), tls.read(&mut buf))
        .await
        .expect("connection left open");
    assert!(matches!(read, Ok(0) | Err(_)));

    let calls = log.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].protocol, "x-custom");
    assert_eq!(calls[0].state, None);
    assert_eq!(calls[0].after, common::INITIAL_CHAIN);
    assert!(seen.try_recv().is_err());
}

#[tokio::test]
async fn no_alpn_falls_back_to_http1() {
    let cert = common::test_certificate();
    let (handler, mut seen) = common::recording_handler();
    let log = common::NegotiationLog::default();
    let server = HttpServer::new(common::test_config(), cert.service.clone())
        .with_main_handler(handler)
        .with_pipeline_configurator(log.configurator());
    let server = common::start(server).await;

    let tls = common::tls_connect(common::connect(server.addr()).await, &cert.roots, &[])
        .await
        .unwrap();
    let mut sender = common::http1_client(tls).await;
    let request = Request::get("/plain-tls")
        .header(HOST, "localhost")
        .body(Empty::<Bytes>::new())
        .unwrap();
    let response = sender.send_request(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    assert_eq!(log.calls()[0].protocol, "http/1.1");
    assert_eq!(seen.recv().await.unwrap().protocol, HttpProtocol::Http1);
}

#[tokio::test]
async fn handshake_fails_without_a_certificate() {
    let cert = common::test_certificate();
    let (handler, mut seen) = common::recording_handler();
    let log = common::NegotiationLog::default();
    let server = HttpServer::new(common::test_config(), std::sync::Arc::new(UnavailableCertificateService))
        .with_main_handler(handler)
        .with_pipeline_configurator(log.configurator());
    let server = common::start(server).await;

    let result = common::tls_connect(common::connect(server.addr()).await, &cert.roots, &["h2"]).await;
    assert!(result.is_err());
    assert!(log.calls().is_empty());
    assert!(seen.try_recv().is_err());
}
