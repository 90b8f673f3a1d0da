//! HTTP/1.x message heads as they travel over tunnel sockets
//!
//! Heads are parsed with `httparse` and kept as raw name/value pairs so the
//! original header casing and ordering survive a round trip. Upgrade requests
//! depend on this: the head is replayed byte-for-byte to the remote client.

use crate::body::BodyFraming;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::trace;

/// Maximum number of headers accepted in one head
const MAX_HEADERS: usize = 100;

/// Maximum size of a request or response head in bytes
pub const MAX_HEAD_SIZE: usize = 64 * 1024;

/// Wire-level errors
#[derive(Debug, Error)]
pub enum WireError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed HTTP head: {0}")]
    Parse(#[from] httparse::Error),

    #[error("HTTP head exceeds {MAX_HEAD_SIZE} bytes")]
    HeadTooLarge,

    #[error("Connection closed in the middle of a message")]
    UnexpectedEof,

    #[error("Invalid Content-Length header: {0}")]
    InvalidContentLength(String),

    #[error("Invalid chunk size line")]
    InvalidChunk,
}

/// A single header exactly as received
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderField {
    pub name: String,
    pub value: Vec<u8>,
}

impl HeaderField {
    pub fn new(name: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    fn from_httparse(header: &httparse::Header<'_>) -> Self {
        Self::new(header.name, header.value)
    }
}

/// Find the first header with the given name (case-insensitive)
fn find_header<'a>(headers: &'a [HeaderField], name: &str) -> Option<&'a [u8]> {
    headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .map(|h| h.value.as_slice())
}

/// Check whether any header with the given name lists `token` (comma separated)
fn has_token(headers: &[HeaderField], name: &str, token: &str) -> bool {
    headers
        .iter()
        .filter(|h| h.name.eq_ignore_ascii_case(name))
        .flat_map(|h| h.value.split(|b| *b == b','))
        .any(|part| part.trim_ascii().eq_ignore_ascii_case(token.as_bytes()))
}

/// Persistent-connection rules shared by requests and responses
fn keeps_alive(version: u8, headers: &[HeaderField]) -> bool {
    if has_token(headers, "connection", "close") {
        return false;
    }
    version >= 1 || has_token(headers, "connection", "keep-alive")
}

/// Parsed request line and header block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub path: String,
    /// Minor HTTP version (`1` for HTTP/1.1)
    pub version: u8,
    pub headers: Vec<HeaderField>,
}

impl RequestHead {
    /// Parse a request head from the start of `buf`
    ///
    /// Returns `None` when more bytes are needed, otherwise the head and the
    /// number of bytes it occupies (including the blank line).
    pub fn parse(buf: &[u8]) -> Result<Option<(Self, usize)>, WireError> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut headers);

        match req.parse(buf)? {
            httparse::Status::Complete(len) => {
                let head = Self {
                    method: req.method.unwrap_or("GET").to_string(),
                    path: req.path.unwrap_or("/").to_string(),
                    version: req.version.unwrap_or(1),
                    headers: req.headers.iter().map(HeaderField::from_httparse).collect(),
                };
                Ok(Some((head, len)))
            }
            httparse::Status::Partial => Ok(None),
        }
    }

    /// Rebuild the literal head: request line, raw header pairs in their
    /// original order and casing, and the terminating blank line
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256);
        out.extend_from_slice(self.method.as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.path.as_bytes());
        out.extend_from_slice(format!(" HTTP/1.{}\r\n", self.version).as_bytes());

        for header in &self.headers {
            out.extend_from_slice(header.name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(&header.value);
            out.extend_from_slice(b"\r\n");
        }

        out.extend_from_slice(b"\r\n");
        out
    }

    pub fn header(&self, name: &str) -> Option<&[u8]> {
        find_header(&self.headers, name)
    }

    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.header(name).and_then(|v| std::str::from_utf8(v).ok())
    }

    /// Value of the Host header
    pub fn host(&self) -> Option<&str> {
        self.header_str("host").map(str::trim)
    }

    /// True for requests asking to switch protocols (e.g. WebSocket)
    pub fn is_upgrade(&self) -> bool {
        self.header("upgrade").is_some() && has_token(&self.headers, "connection", "upgrade")
    }

    /// Whether the client expects the connection to stay open afterwards
    pub fn keep_alive(&self) -> bool {
        keeps_alive(self.version, &self.headers)
    }

    /// How the request body is delimited
    pub fn body_framing(&self) -> Result<BodyFraming, WireError> {
        if has_token(&self.headers, "transfer-encoding", "chunked") {
            return Ok(BodyFraming::Chunked);
        }
        match content_length(&self.headers)? {
            Some(0) | None => Ok(BodyFraming::Empty),
            Some(len) => Ok(BodyFraming::Length(len)),
        }
    }
}

/// Parsed status line and header block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    /// Minor HTTP version
    pub version: u8,
    pub status: u16,
    pub reason: String,
    pub headers: Vec<HeaderField>,
}

impl ResponseHead {
    pub fn parse(buf: &[u8]) -> Result<Option<(Self, usize)>, WireError> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut resp = httparse::Response::new(&mut headers);

        match resp.parse(buf)? {
            httparse::Status::Complete(len) => {
                let head = Self {
                    version: resp.version.unwrap_or(1),
                    status: resp.code.unwrap_or(0),
                    reason: resp.reason.unwrap_or("").to_string(),
                    headers: resp.headers.iter().map(HeaderField::from_httparse).collect(),
                };
                Ok(Some((head, len)))
            }
            httparse::Status::Partial => Ok(None),
        }
    }

    pub fn header(&self, name: &str) -> Option<&[u8]> {
        find_header(&self.headers, name)
    }

    /// Informational responses other than `101 Switching Protocols`
    /// precede the final response on the same exchange
    pub fn is_interim(&self) -> bool {
        (100..200).contains(&self.status) && self.status != 101
    }

    /// Whether the upstream keeps the connection open after this response
    pub fn keep_alive(&self) -> bool {
        keeps_alive(self.version, &self.headers)
    }

    /// How the response body is delimited, given the request method
    pub fn body_framing(&self, request_method: &str) -> Result<BodyFraming, WireError> {
        if request_method.eq_ignore_ascii_case("HEAD")
            || (100..200).contains(&self.status)
            || self.status == 204
            || self.status == 304
        {
            return Ok(BodyFraming::Empty);
        }
        if has_token(&self.headers, "transfer-encoding", "chunked") {
            return Ok(BodyFraming::Chunked);
        }
        match content_length(&self.headers)? {
            Some(0) => Ok(BodyFraming::Empty),
            Some(len) => Ok(BodyFraming::Length(len)),
            None => Ok(BodyFraming::UntilClose),
        }
    }
}

/// Content-Length value; repeated headers must agree
fn content_length(headers: &[HeaderField]) -> Result<Option<u64>, WireError> {
    let mut found: Option<u64> = None;

    for header in headers
        .iter()
        .filter(|h| h.name.eq_ignore_ascii_case("content-length"))
    {
        let raw = String::from_utf8_lossy(&header.value);
        let len = raw
            .trim()
            .parse::<u64>()
            .map_err(|_| WireError::InvalidContentLength(raw.to_string()))?;

        match found {
            Some(previous) if previous != len => {
                return Err(WireError::InvalidContentLength(raw.to_string()));
            }
            _ => found = Some(len),
        }
    }

    Ok(found)
}

/// Read one head from `reader`, consuming exactly the head bytes
///
/// Returns `Ok(None)` if the stream ended cleanly before any byte arrived.
async fn read_head<R, T, F>(reader: &mut R, parse: F) -> Result<Option<(T, Vec<u8>)>, WireError>
where
    R: AsyncBufRead + Unpin,
    F: Fn(&[u8]) -> Result<Option<(T, usize)>, WireError>,
{
    let mut buf = Vec::new();

    loop {
        let chunk = reader.fill_buf().await?;
        if chunk.is_empty() {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(WireError::UnexpectedEof);
        }

        let previous = buf.len();
        let chunk_len = chunk.len();
        buf.extend_from_slice(chunk);

        match parse(&buf)? {
            Some((head, len)) => {
                reader.consume(len.saturating_sub(previous));
                buf.truncate(len);
                trace!("Parsed HTTP head ({} bytes)", len);
                return Ok(Some((head, buf)));
            }
            None => {
                reader.consume(chunk_len);
                if buf.len() > MAX_HEAD_SIZE {
                    return Err(WireError::HeadTooLarge);
                }
            }
        }
    }
}

/// Read a request head from a public connection
///
/// `Ok(None)` means the peer closed the connection between requests.
pub async fn read_request_head<R>(reader: &mut R) -> Result<Option<RequestHead>, WireError>
where
    R: AsyncBufRead + Unpin,
{
    Ok(read_head(reader, RequestHead::parse)
        .await?
        .map(|(head, _)| head))
}

/// Read a response head from a tunnel socket, returning the raw bytes too
/// so they can be forwarded verbatim
pub async fn read_response_head<R>(reader: &mut R) -> Result<(ResponseHead, Vec<u8>), WireError>
where
    R: AsyncBufRead + Unpin,
{
    read_head(reader, ResponseHead::parse)
        .await?
        .ok_or(WireError::UnexpectedEof)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, BufReader};

    fn request(headers: &[(&str, &str)]) -> RequestHead {
        RequestHead {
            method: "GET".to_string(),
            path: "/chat?room=1".to_string(),
            version: 1,
            headers: headers
                .iter()
                .map(|(n, v)| HeaderField::new(*n, v.as_bytes()))
                .collect(),
        }
    }

    #[test]
    fn test_encode_preserves_case_and_order() {
        let head = request(&[
            ("Host", "foobar.example.com"),
            ("upgrade", "websocket"),
            ("Connection", "Upgrade"),
            ("X-Dup", "1"),
            ("Sec-WebSocket-Key", "dGhlIHNhbXBsZSBub25jZQ=="),
            ("x-dup", "2"),
        ]);

        let encoded = String::from_utf8(head.encode()).unwrap();
        assert_eq!(
            encoded,
            "GET /chat?room=1 HTTP/1.1\r\n\
             Host: foobar.example.com\r\n\
             upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             X-Dup: 1\r\n\
             Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
             x-dup: 2\r\n\
             \r\n"
        );
    }

    #[test]
    fn test_encode_then_parse_yields_same_headers() {
        let sequences: Vec<Vec<(&str, &str)>> = vec![
            vec![],
            vec![("Host", "a.b.c")],
            vec![("A", "1"), ("b", "2"), ("A", "3"), ("Cookie", "x=1; y=2")],
            vec![("X-Empty", ""), ("X-Spaces", "a  b")],
        ];

        for headers in sequences {
            let head = request(&headers);
            let encoded = head.encode();
            let (parsed, len) = RequestHead::parse(&encoded).unwrap().unwrap();
            assert_eq!(len, encoded.len());
            assert_eq!(parsed, head);
        }
    }

    #[test]
    fn test_encode_http_1_0() {
        let mut head = request(&[]);
        head.version = 0;
        assert_eq!(head.encode(), b"GET /chat?room=1 HTTP/1.0\r\n\r\n".to_vec());
    }

    #[test]
    fn test_parse_partial() {
        assert!(RequestHead::parse(b"GET / HTTP/1.1\r\nHost: x")
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_upgrade_detection() {
        let ws = request(&[("Connection", "keep-alive, Upgrade"), ("Upgrade", "websocket")]);
        assert!(ws.is_upgrade());

        let plain = request(&[("Connection", "keep-alive")]);
        assert!(!plain.is_upgrade());

        let upgrade_without_connection = request(&[("Upgrade", "websocket")]);
        assert!(!upgrade_without_connection.is_upgrade());
    }

    #[test]
    fn test_request_keep_alive() {
        assert!(request(&[]).keep_alive());
        assert!(!request(&[("Connection", "close")]).keep_alive());

        let mut old = request(&[]);
        old.version = 0;
        assert!(!old.keep_alive());
        old.headers.push(HeaderField::new("Connection", "Keep-Alive"));
        assert!(old.keep_alive());
    }

    #[test]
    fn test_request_body_framing() {
        assert_eq!(request(&[]).body_framing().unwrap(), BodyFraming::Empty);
        assert_eq!(
            request(&[("Content-Length", "12")]).body_framing().unwrap(),
            BodyFraming::Length(12)
        );
        assert_eq!(
            request(&[("Transfer-Encoding", "gzip, chunked"), ("Content-Length", "3")])
                .body_framing()
                .unwrap(),
            BodyFraming::Chunked
        );
        assert!(request(&[("Content-Length", "abc")]).body_framing().is_err());
        assert!(request(&[("Content-Length", "1"), ("Content-Length", "2")])
            .body_framing()
            .is_err());
    }

    #[test]
    fn test_response_body_framing() {
        let (head, _) = ResponseHead::parse(b"HTTP/1.1 200 OK\r\nContent-Length: 3\r\n\r\n")
            .unwrap()
            .unwrap();
        assert_eq!(head.body_framing("GET").unwrap(), BodyFraming::Length(3));
        assert_eq!(head.body_framing("HEAD").unwrap(), BodyFraming::Empty);

        let (head, _) = ResponseHead::parse(b"HTTP/1.1 200 OK\r\n\r\n").unwrap().unwrap();
        assert_eq!(head.body_framing("GET").unwrap(), BodyFraming::UntilClose);

        let (head, _) = ResponseHead::parse(b"HTTP/1.1 304 Not Modified\r\nX-Powered-By: dummy\r\n\r\n")
            .unwrap()
            .unwrap();
        assert_eq!(head.body_framing("GET").unwrap(), BodyFraming::Empty);
    }

    #[test]
    fn test_interim_responses() {
        let (cont, _) = ResponseHead::parse(b"HTTP/1.1 100 Continue\r\n\r\n").unwrap().unwrap();
        assert!(cont.is_interim());

        let (switching, _) = ResponseHead::parse(b"HTTP/1.1 101 Switching Protocols\r\n\r\n")
            .unwrap()
            .unwrap();
        assert!(!switching.is_interim());
    }

    #[tokio::test]
    async fn test_read_head_leaves_body_in_reader() {
        let data: &[u8] = b"POST /upload HTTP/1.1\r\nHost: x\r\nContent-Length: 5\r\n\r\nhello";
        let mut reader = BufReader::with_capacity(7, data);

        let head = read_request_head(&mut reader).await.unwrap().unwrap();
        assert_eq!(head.method, "POST");
        assert_eq!(head.path, "/upload");
        assert_eq!(head.host(), Some("x"));

        let mut rest = String::new();
        reader.read_to_string(&mut rest).await.unwrap();
        assert_eq!(rest, "hello");
    }

    #[tokio::test]
    async fn test_read_response_head_returns_raw_bytes() {
        let raw: &[u8] = b"HTTP/1.1 200 OK\r\nX-Powered-By: dummy\r\n\r\nbody";
        let mut reader = BufReader::new(raw);

        let (head, bytes) = read_response_head(&mut reader).await.unwrap();
        assert_eq!(head.status, 200);
        assert_eq!(bytes, b"HTTP/1.1 200 OK\r\nX-Powered-By: dummy\r\n\r\n".to_vec());
    }

    #[tokio::test]
    async fn test_read_head_clean_eof() {
        let mut reader = BufReader::new(&b""[..]);
        assert!(read_request_head(&mut reader).await.unwrap().is_none());

        let mut truncated = BufReader::new(&b"GET / HTTP/1.1\r\n"[..]);
        assert!(matches!(
            read_request_head(&mut truncated).await,
            Err(WireError::UnexpectedEof)
        ));
    }
}
