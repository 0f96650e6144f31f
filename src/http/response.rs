//! Response bodies and the responses the connection core answers itself.
//!
//! # Design Decisions
//! - One boxed body type for every response leaving the pipeline
//! - Stage-generated answers are small plain-text responses

use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Response, StatusCode};

/// Boxed error used across handler and body boundaries.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Body of every response produced by the pipeline.
pub type ProxyBody = BoxBody<Bytes, BoxError>;

pub fn full<T: Into<Bytes>>(chunk: T) -> ProxyBody {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed()
}

pub fn empty() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

/// Plain-text response with the given status.
pub fn text(status: StatusCode, message: &'static str) -> Response<ProxyBody> {
    let mut response = Response::new(full(message));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

/// Answer to an accepted CONNECT request.
pub fn connection_established() -> Response<ProxyBody> {
    Response::new(empty())
}

/// Answer to a request aimed at the proxy itself.
pub fn recursive_request() -> Response<ProxyBody> {
    text(
        StatusCode::LOOP_DETECTED,
        "Recursive requests to the proxy are not allowed.",
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn text_response_carries_body_and_type() {
        let response = text(StatusCode::BAD_REQUEST, "nope");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            response.headers()[CONTENT_TYPE],
            "text/plain; charset=utf-8"
        );
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, Bytes::from_static(b"nope"));
    }

    #[test]
    fn connect_answer_is_plain_200() {
        let response = connection_established();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().is_empty());
    }
}
