//! HTTP/1.1 framing stages.
//!
//! The wire codec itself is hyper's; the decoder and encoder stages mark
//! that HTTP/1.1 framing is active on the connection and carry its settings.

use hyper::server::conn::http1;

/// Decodes HTTP/1.1 requests from the connection bytes.
#[derive(Debug, Clone, Default)]
pub struct HttpRequestDecoder {
    max_buf_size: Option<usize>,
}

impl HttpRequestDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Limit on the read buffer, bounding the size of a request head.
    pub fn with_max_buf_size(mut self, max: usize) -> Self {
        self.max_buf_size = Some(max);
        self
    }

    pub fn max_buf_size(&self) -> Option<usize> {
        self.max_buf_size
    }

    /// hyper connection builder for the decoder's settings.
    pub fn builder(&self) -> http1::Builder {
        let mut builder = http1::Builder::new();
        builder.keep_alive(true);
        if let Some(max) = self.max_buf_size {
            builder.max_buf_size(max);
        }
        builder
    }
}

/// Encodes HTTP/1.1 responses to the connection bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct HttpResponseEncoder;
