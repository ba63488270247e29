use embedded_svc::http::Method;
use embedded_svc::io::Read;
use esp_idf_svc::http::client::{Configuration, EspHttpConnection, FollowRedirectsPolicy};

use crate::network::{ByteSource, HttpClient, HttpRequest, HttpResponse};
use crate::platform::PlatformError;

const RX_BUFFER_SIZE: usize = 4096;

#[derive(Debug, Default)]
pub struct EspHttp;

impl EspHttp {
    pub fn new() -> Self {
        Self
    }
}

impl HttpClient for EspHttp {
    fn get(&mut self, request: &HttpRequest) -> Result<Box<dyn HttpResponse>, PlatformError> {
        let config = Configuration {
            timeout: Some(request.timeout),
            buffer_size: Some(RX_BUFFER_SIZE),
            follow_redirects_policy: FollowRedirectsPolicy::FollowAll,
            // Without the bundle the connection is unverified (needs CONFIG_ESP_TLS_INSECURE)
            crt_bundle_attach: if request.tls_verify {
                Some(esp_idf_sys::esp_crt_bundle_attach)
            } else {
                None
            },
            ..Default::default()
        };
        let mut conn =
            EspHttpConnection::new(&config).map_err(|e| PlatformError::Esp(e.code()))?;

        let headers: Vec<(&str, &str)> = request
            .headers
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        conn.initiate_request(Method::Get, &request.url, &headers)
            .map_err(|e| PlatformError::Io(format!("request failed: {}", e)))?;
        conn.initiate_response()
            .map_err(|e| PlatformError::Io(format!("no response: {}", e)))?;

        let status = conn.status();
        let content_length = conn
            .header("Content-Length")
            .and_then(|v| v.trim().parse().ok());

        Ok(Box::new(EspResponse {
            conn,
            status,
            content_length,
            buf: vec![0u8; RX_BUFFER_SIZE],
            pos: 0,
            len: 0,
            eof: false,
        }))
    }
}

/// Adapts the blocking client to the polled `ByteSource` shape. `available`
/// blocks for at most the client timeout, which then reads as a closed peer.
struct EspResponse {
    conn: EspHttpConnection,
    status: u16,
    content_length: Option<usize>,
    buf: Vec<u8>,
    pos: usize,
    len: usize,
    eof: bool,
}

impl ByteSource for EspResponse {
    fn available(&mut self) -> usize {
        if self.pos < self.len || self.eof {
            return self.len - self.pos;
        }
        match self.conn.read(&mut self.buf) {
            Ok(0) => self.eof = true,
            Ok(n) => {
                self.pos = 0;
                self.len = n;
            }
            Err(e) => {
                log::warn!("HTTP read failed: {}", e);
                self.eof = true;
            }
        }
        self.len - self.pos
    }

    fn connected(&mut self) -> bool {
        !self.eof
    }

    fn read(&mut self, buf: &mut [u8]) -> usize {
        let n = self.available().min(buf.len());
        buf[..n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
        self.pos += n;
        n
    }
}

impl HttpResponse for EspResponse {
    fn status(&self) -> u16 {
        self.status
    }

    fn content_length(&self) -> Option<usize> {
        self.content_length
    }
}
