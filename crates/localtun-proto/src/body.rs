//! Message body relaying
//!
//! Bodies are copied verbatim between peers. For chunked bodies the chunk
//! size lines, extensions and trailers are forwarded unchanged; the relay only
//! parses them to find where the message ends.

use crate::wire::WireError;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Longest chunk-size or trailer line accepted
const MAX_LINE_LEN: u64 = 8 * 1024;

/// How a message body is delimited on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    /// No body
    Empty,
    /// Exactly this many bytes
    Length(u64),
    /// `Transfer-Encoding: chunked`
    Chunked,
    /// Body runs until the sender closes the connection
    UntilClose,
}

impl BodyFraming {
    /// Whether the end of the body can be found without closing the connection
    pub fn is_self_delimited(&self) -> bool {
        !matches!(self, BodyFraming::UntilClose)
    }
}

/// Failure while relaying a body, split by which side broke
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Read side failed: {0}")]
    Read(#[source] WireError),

    #[error("Write side failed: {0}")]
    Write(#[source] std::io::Error),
}

impl RelayError {
    fn eof() -> Self {
        RelayError::Read(WireError::UnexpectedEof)
    }
}

/// Copy one body from `reader` to `writer` according to `framing`
///
/// Returns the number of bytes written, framing bytes included.
pub async fn relay_body<R, W>(
    reader: &mut R,
    writer: &mut W,
    framing: BodyFraming,
) -> Result<u64, RelayError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let written = match framing {
        BodyFraming::Empty => 0,
        BodyFraming::Length(len) => copy_exact(reader, writer, len).await?,
        BodyFraming::Chunked => copy_chunked(reader, writer).await?,
        BodyFraming::UntilClose => copy_until_close(reader, writer).await?,
    };

    writer.flush().await.map_err(RelayError::Write)?;
    Ok(written)
}

async fn copy_exact<R, W>(reader: &mut R, writer: &mut W, len: u64) -> Result<u64, RelayError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut remaining = len;

    while remaining > 0 {
        let chunk = reader
            .fill_buf()
            .await
            .map_err(|e| RelayError::Read(e.into()))?;
        if chunk.is_empty() {
            return Err(RelayError::eof());
        }

        let take = chunk.len().min(usize::try_from(remaining).unwrap_or(usize::MAX));
        writer
            .write_all(&chunk[..take])
            .await
            .map_err(RelayError::Write)?;
        reader.consume(take);
        remaining -= take as u64;
    }

    Ok(len)
}

async fn copy_until_close<R, W>(reader: &mut R, writer: &mut W) -> Result<u64, RelayError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut total = 0u64;

    loop {
        let chunk = reader
            .fill_buf()
            .await
            .map_err(|e| RelayError::Read(e.into()))?;
        if chunk.is_empty() {
            return Ok(total);
        }

        let len = chunk.len();
        writer.write_all(chunk).await.map_err(RelayError::Write)?;
        reader.consume(len);
        total += len as u64;
    }
}

/// Read one CRLF-terminated line, bounded by `MAX_LINE_LEN`
async fn read_line<R>(reader: &mut R, line: &mut Vec<u8>) -> Result<(), RelayError>
where
    R: AsyncBufRead + Unpin,
{
    line.clear();
    let read = (&mut *reader)
        .take(MAX_LINE_LEN)
        .read_until(b'\n', line)
        .await
        .map_err(|e| RelayError::Read(e.into()))?;

    if read == 0 {
        return Err(RelayError::eof());
    }
    if !line.ends_with(b"\n") {
        return Err(RelayError::Read(WireError::InvalidChunk));
    }
    Ok(())
}

fn parse_chunk_size(line: &[u8]) -> Result<u64, WireError> {
    let text = std::str::from_utf8(line).map_err(|_| WireError::InvalidChunk)?;
    let size = text
        .split(';')
        .next()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or(WireError::InvalidChunk)?;
    u64::from_str_radix(size, 16).map_err(|_| WireError::InvalidChunk)
}

async fn copy_chunked<R, W>(reader: &mut R, writer: &mut W) -> Result<u64, RelayError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut total = 0u64;
    let mut line = Vec::with_capacity(64);

    loop {
        read_line(reader, &mut line).await?;
        let size = parse_chunk_size(&line).map_err(RelayError::Read)?;
        writer.write_all(&line).await.map_err(RelayError::Write)?;
        total += line.len() as u64;

        if size == 0 {
            break;
        }

        // chunk data plus its trailing CRLF
        let framed = size
            .checked_add(2)
            .ok_or(RelayError::Read(WireError::InvalidChunk))?;
        total += copy_exact(reader, writer, framed).await?;
    }

    // trailer section ends with an empty line
    loop {
        read_line(reader, &mut line).await?;
        writer.write_all(&line).await.map_err(RelayError::Write)?;
        total += line.len() as u64;

        if line == b"\r\n" || line == b"\n" {
            return Ok(total);
        }
    }
}
