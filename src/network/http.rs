use std::time::Duration;

use crate::platform::{PlatformError, SystemControl};

pub const USER_AGENT: &str = "ESP32-Webex-Display";

// 30 second timeout for large downloads
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// A polled byte stream, shaped after a TCP/TLS client: callers ask how much is
/// buffered before reading so they never block on an empty socket.
pub trait ByteSource {
    /// Bytes that can be read right now without blocking.
    fn available(&mut self) -> usize;

    /// False once the peer closed the connection.
    fn connected(&mut self) -> bool;

    /// Read up to `buf.len()` bytes, returning how many were read.
    fn read(&mut self, buf: &mut [u8]) -> usize;
}

/// Response to a GET: status line, announced length and the body stream.
pub trait HttpResponse: ByteSource {
    fn status(&self) -> u16;

    /// `Content-Length`, if the server sent one.
    fn content_length(&self) -> Option<usize>;
}

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub tls_verify: bool,
    pub timeout: Duration,
}

impl HttpRequest {
    pub fn get(url: &str) -> Self {
        Self {
            url: url.to_string(),
            headers: vec![("User-Agent".to_string(), USER_AGENT.to_string())],
            tls_verify: true,
            timeout: DEFAULT_HTTP_TIMEOUT,
        }
    }

    #[must_use]
    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    #[must_use]
    pub fn tls_verify(mut self, verify: bool) -> Self {
        self.tls_verify = verify;
        self
    }
}

/// HTTP(S) client. Redirects are followed by the implementation (release
/// assets are served through a CDN redirect).
pub trait HttpClient {
    fn get(&mut self, request: &HttpRequest) -> Result<Box<dyn HttpResponse>, PlatformError>;
}

/// Drain a small response body (manifests, release metadata) into a string.
///
/// Stops at `limit` bytes, when the peer closes, or after `idle_timeout_ms`
/// without data.
pub fn read_body(
    response: &mut dyn HttpResponse,
    system: &dyn SystemControl,
    limit: usize,
    idle_timeout_ms: u64,
) -> Result<String, PlatformError> {
    let mut body = Vec::new();
    let mut buf = [0u8; 512];
    let mut last_data = system.millis();

    while body.len() < limit {
        if let Some(total) = response.content_length() {
            if body.len() >= total {
                break;
            }
        }

        let available = response.available();
        if available == 0 {
            if !response.connected() {
                break;
            }
            if system.millis().saturating_sub(last_data) > idle_timeout_ms {
                return Err(PlatformError::Io(format!(
                    "body read timed out after {} bytes",
                    body.len()
                )));
            }
            system.sleep_ms(10);
            continue;
        }

        let want = available.min(buf.len()).min(limit - body.len());
        let n = response.read(&mut buf[..want]);
        body.extend_from_slice(&buf[..n]);
        last_data = system.millis();
    }

    String::from_utf8(body).map_err(|e| PlatformError::Io(format!("body is not utf-8: {}", e)))
}
