//! Writing HTTP/1.1 responses onto raw public connections

use axum::body::Body;
use http::{Response, StatusCode};
use http_body_util::BodyExt;

/// Short plain-text response that closes the connection
pub fn plain_response(status: StatusCode, body: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 {} {}\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status.as_u16(),
        status.canonical_reason().unwrap_or(""),
        body.len(),
        body
    )
    .into_bytes()
}

/// Serialize a buffered axum response into raw HTTP/1.1 bytes
///
/// The body is collected so an exact `Content-Length` can be sent.
pub async fn serialize_response(
    response: Response<Body>,
    keep_alive: bool,
    http10_client: bool,
) -> Result<Vec<u8>, axum::Error> {
    let (parts, body) = response.into_parts();
    let status = parts.status;

    // Collect body first so we know the length
    let body_bytes = body.collect().await?.to_bytes();

    let mut raw = Vec::with_capacity(256 + body_bytes.len());
    raw.extend_from_slice(
        format!(
            "HTTP/1.1 {} {}\r\n",
            status.as_u16(),
            status.canonical_reason().unwrap_or("")
        )
        .as_bytes(),
    );

    for (name, value) in &parts.headers {
        // Skip framing headers - we use our own content-length
        if name == http::header::TRANSFER_ENCODING
            || name == http::header::CONTENT_LENGTH
            || name == http::header::CONNECTION
        {
            continue;
        }
        raw.extend_from_slice(name.as_str().as_bytes());
        raw.extend_from_slice(b": ");
        raw.extend_from_slice(value.as_bytes());
        raw.extend_from_slice(b"\r\n");
    }

    raw.extend_from_slice(format!("content-length: {}\r\n", body_bytes.len()).as_bytes());
    if !keep_alive {
        raw.extend_from_slice(b"connection: close\r\n");
    } else if http10_client {
        raw.extend_from_slice(b"connection: keep-alive\r\n");
    }
    raw.extend_from_slice(b"\r\n");
    raw.extend_from_slice(&body_bytes);

    Ok(raw)
}
