//! Transport of localization requests.
//!
//! The loop only depends on the [`Transport`] trait. [`HttpTransport`] is a
//! small blocking HTTP/1.1 client over `TcpStream` for plain `http://`
//! endpoints (local gateways, test servers); TLS endpoints need a
//! host-provided transport.

use crate::{Result, VpsError};
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

pub const IMAGE_FIELD: &str = "image";
pub const EMBEDDING_FIELD: &str = "embedding";
pub const EMBEDDING_FILE_NAME: &str = "data.embd";
pub const META_FIELD: &str = "json";

/// Payload of one attempt: optional image and embedding plus the JSON metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportRequest {
    /// Encoded JPEG.
    pub image: Option<Vec<u8>>,
    pub image_name: String,
    pub embedding: Option<Vec<u8>>,
    pub meta: String,
}

/// What came back from the server. Any status code is a response.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportResponse {
    pub status: u16,
    pub body: String,
    /// `x-request-id` header values, comma-joined.
    pub request_id: Option<String>,
}

/// Sends requests to the localization server.
///
/// `send` blocks; the loop runs it off its own thread. An `Err` means no
/// response was received at all (connection failure, timeout).
pub trait Transport: Send + Sync {
    fn set_endpoint(&mut self, url: &str);

    fn send(&self, request: &TransportRequest) -> Result<TransportResponse>;
}

/// Plain-HTTP multipart client.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    url: String,
    /// Zero disables the timeout.
    timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ParsedUrl {
    host: String,
    port: u16,
    path: String,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Self {
        Self {
            url: String::new(),
            timeout,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Fails with [`VpsError::InvalidUrl`] unless `url` is a plain `http://` URL.
    pub fn check_url(url: &str) -> Result<()> {
        parse_url(url).map(|_| ())
    }

    fn connect(&self, url: &ParsedUrl) -> Result<TcpStream> {
        let addrs = (url.host.as_str(), url.port)
            .to_socket_addrs()
            .map_err(|e| VpsError::Network(format!("cannot resolve {}: {}", url.host, e)))?;

        let timeout = (!self.timeout.is_zero()).then_some(self.timeout);
        let mut last_err = None;
        for addr in addrs {
            let attempt = match timeout {
                Some(t) => TcpStream::connect_timeout(&addr, t),
                None => TcpStream::connect(addr),
            };
            match attempt {
                Ok(stream) => {
                    stream.set_read_timeout(timeout)?;
                    stream.set_write_timeout(timeout)?;
                    stream.set_nodelay(true).ok();
                    return Ok(stream);
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(VpsError::Network(match last_err {
            Some(e) => format!("cannot connect to {}:{}: {}", url.host, url.port, e),
            None => format!("no address for {}", url.host),
        }))
    }
}

impl Transport for HttpTransport {
    fn set_endpoint(&mut self, url: &str) {
        self.url = url.to_string();
    }

    fn send(&self, request: &TransportRequest) -> Result<TransportResponse> {
        let url = parse_url(&self.url)?;
        let boundary = format!("vps-{}", uuid::Uuid::new_v4().simple());
        let body = build_multipart(request, &boundary);

        let mut head = format!(
            "POST {} HTTP/1.1\r\nHost: {}:{}\r\nContent-Type: multipart/form-data; boundary={}\r\n",
            url.path, url.host, url.port, boundary
        );
        head.push_str(&format!("Content-Length: {}\r\n", body.len()));
        head.push_str("Accept: application/json\r\nConnection: close\r\n\r\n");

        let mut stream = self.connect(&url)?;
        stream
            .write_all(head.as_bytes())
            .and_then(|_| stream.write_all(&body))
            .and_then(|_| stream.flush())
            .map_err(|e| VpsError::Network(format!("write failed: {}", e)))?;

        let mut raw = Vec::new();
        stream
            .read_to_end(&mut raw)
            .map_err(|e| VpsError::Network(format!("read failed: {}", e)))?;

        let response = parse_response(&raw)?;
        log::debug!(
            "Request finished with code {} (x-request-id: {})\n{}",
            response.status,
            response.request_id.as_deref().unwrap_or("-"),
            response.body
        );
        Ok(response)
    }
}

fn parse_url(url: &str) -> Result<ParsedUrl> {
    let rest = match url.strip_prefix("http://") {
        Some(rest) => rest,
        None if url.starts_with("https://") => {
            return Err(VpsError::InvalidUrl(format!(
                "{} (TLS endpoints need a host transport)",
                url
            )))
        }
        None => return Err(VpsError::InvalidUrl(url.to_string())),
    };

    let (authority, path) = match rest.find('/') {
        Some(i) => (&rest[..i], &rest[i..]),
        None => (rest, "/"),
    };
    if authority.is_empty() {
        return Err(VpsError::InvalidUrl(url.to_string()));
    }

    let (host, port) = match authority.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse::<u16>()
                .map_err(|_| VpsError::InvalidUrl(url.to_string()))?;
            (host, port)
        }
        None => (authority, 80),
    };

    Ok(ParsedUrl {
        host: host.to_string(),
        port,
        path: path.to_string(),
    })
}

fn build_multipart(request: &TransportRequest, boundary: &str) -> Vec<u8> {
    let mut body = Vec::new();

    let file_part = |body: &mut Vec<u8>, field: &str, file: &str, mime: &str, data: &[u8]| {
        body.extend_from_slice(
            format!(
                "--{}\r\nContent-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\nContent-Type: {}\r\n\r\n",
                boundary, field, file, mime
            )
            .as_bytes(),
        );
        body.extend_from_slice(data);
        body.extend_from_slice(b"\r\n");
    };

    if let Some(image) = &request.image {
        file_part(&mut body, IMAGE_FIELD, &request.image_name, "image/jpeg", image);
    }
    if let Some(embedding) = &request.embedding {
        file_part(
            &mut body,
            EMBEDDING_FIELD,
            EMBEDDING_FILE_NAME,
            "application/octet-stream",
            embedding,
        );
    }

    body.extend_from_slice(
        format!(
            "--{}\r\nContent-Disposition: form-data; name=\"{}\"\r\nContent-Type: text/plain; charset=utf-8\r\n\r\n",
            boundary, META_FIELD
        )
        .as_bytes(),
    );
    body.extend_from_slice(request.meta.as_bytes());
    body.extend_from_slice(format!("\r\n--{}--\r\n", boundary).as_bytes());
    body
}

fn parse_response(raw: &[u8]) -> Result<TransportResponse> {
    let split = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .ok_or_else(|| VpsError::MalformedResponse("missing header terminator".into()))?;
    let head = String::from_utf8_lossy(&raw[..split]);
    let payload = &raw[split + 4..];

    let mut lines = head.split("\r\n");
    let status_line = lines.next().unwrap_or("");
    let status = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or_else(|| VpsError::MalformedResponse(format!("bad status line: {}", status_line)))?;

    let mut content_length = None;
    let mut chunked = false;
    let mut request_ids = Vec::new();
    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match name.trim().to_ascii_lowercase().as_str() {
            "content-length" => content_length = value.parse::<usize>().ok(),
            "transfer-encoding" => chunked = value.eq_ignore_ascii_case("chunked"),
            "x-request-id" => request_ids.push(value.to_string()),
            _ => {}
        }
    }

    let body = if chunked {
        decode_chunked(payload)?
    } else {
        match content_length {
            Some(len) => payload[..len.min(payload.len())].to_vec(),
            None => payload.to_vec(),
        }
    };

    Ok(TransportResponse {
        status,
        body: String::from_utf8_lossy(&body).into_owned(),
        request_id: (!request_ids.is_empty()).then(|| request_ids.join(", ")),
    })
}

fn decode_chunked(mut data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    loop {
        let line_end = data
            .windows(2)
            .position(|w| w == b"\r\n")
            .ok_or_else(|| VpsError::MalformedResponse("truncated chunk header".into()))?;
        let size_field = String::from_utf8_lossy(&data[..line_end]);
        let size_hex = size_field.split(';').next().unwrap_or("").trim();
        let size = usize::from_str_radix(size_hex, 16)
            .map_err(|_| VpsError::MalformedResponse(format!("bad chunk size: {}", size_hex)))?;
        data = &data[line_end + 2..];
        if size == 0 {
            return Ok(out);
        }
        if data.len() < size {
            return Err(VpsError::MalformedResponse("truncated chunk".into()));
        }
        out.extend_from_slice(&data[..size]);
        data = data.get(size + 2..).unwrap_or(&[]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_url() {
        let url = parse_url("http://127.0.0.1:8080/vps/api/v3").unwrap();
        assert_eq!(url.host, "127.0.0.1");
        assert_eq!(url.port, 8080);
        assert_eq!(url.path, "/vps/api/v3");

        let url = parse_url("http://localhost").unwrap();
        assert_eq!(url.port, 80);
        assert_eq!(url.path, "/");

        assert!(matches!(parse_url("https://vps.naviar.io/"), Err(VpsError::InvalidUrl(_))));
        assert!(matches!(parse_url("not a url"), Err(VpsError::InvalidUrl(_))));
        assert!(matches!(parse_url("http://host:99999/"), Err(VpsError::InvalidUrl(_))));
    }

    #[test]
    fn test_check_url() {
        assert!(HttpTransport::check_url("http://127.0.0.1:8000/vps/api/v3").is_ok());
        assert!(matches!(
            HttpTransport::check_url("https://vps.naviar.io/vps/api/v3"),
            Err(VpsError::InvalidUrl(_))
        ));
    }

    #[test]
    fn test_multipart_contains_parts() {
        let request = TransportRequest {
            image: Some(vec![0xFF, 0xD8, 0xFF]),
            image_name: "1.jpg".into(),
            embedding: None,
            meta: "{\"data\":{}}".into(),
        };
        let body = build_multipart(&request, "B");
        let text = String::from_utf8_lossy(&body);
        assert!(text.starts_with("--B\r\nContent-Disposition: form-data; name=\"image\"; filename=\"1.jpg\""));
        assert!(!text.contains("name=\"embedding\""));
        assert!(text.contains("name=\"json\"\r\nContent-Type: text/plain; charset=utf-8\r\n\r\n{\"data\":{}}"));
        assert!(text.ends_with("\r\n--B--\r\n"));
    }

    #[test]
    fn test_parse_response_with_length() {
        let raw = b"HTTP/1.1 422 Unprocessable Entity\r\nContent-Length: 2\r\nX-Request-Id: abc\r\nx-request-id: def\r\n\r\n{}trailing";
        let response = parse_response(raw).unwrap();
        assert_eq!(response.status, 422);
        assert_eq!(response.body, "{}");
        assert_eq!(response.request_id.as_deref(), Some("abc, def"));
    }

    #[test]
    fn test_parse_chunked_response() {
        let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n4\r\n{\"a\"\r\n3\r\n:1}\r\n0\r\n\r\n";
        let response = parse_response(raw).unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body, "{\"a\":1}");
        assert!(response.request_id.is_none());
    }

    #[test]
    fn test_parse_garbage_response() {
        assert!(matches!(
            parse_response(b"garbage"),
            Err(VpsError::MalformedResponse(_))
        ));
    }
}
