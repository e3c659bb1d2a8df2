//! Request Body Normalizer (§4.C): detects which wire framing a request body
//! uses and exposes a single decoded byte stream to the rest of the proxy.
//! Strictly streaming — at most one chunk header and one chunk body are held
//! in memory at a time, regardless of object size.

mod http_chunked;
mod sigv4_chunked;

pub use http_chunked::HttpChunkedReader;
pub use sigv4_chunked::SigV4ChunkedReader;

use axum::http::HeaderMap;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, ReadBuf};

#[derive(Debug, thiserror::Error)]
pub enum NormalizerError {
    #[error("malformed chunk framing: {0}")]
    BadChunkFraming(String),
    #[error("I/O error while reading body: {0}")]
    Io(#[from] std::io::Error),
}

/// Replays a small buffered prefix ahead of the rest of an `AsyncRead`, so a
/// lookahead probe doesn't lose the bytes it peeked at.
struct PrefixedReader<R> {
    prefix: Vec<u8>,
    pos: usize,
    inner: R,
}

impl<R: AsyncRead + Unpin> AsyncRead for PrefixedReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        if this.pos < this.prefix.len() {
            let remaining = &this.prefix[this.pos..];
            let n = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..n]);
            this.pos += n;
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

/// Reads up to `len` bytes from `body` without assuming it fills the buffer
/// in one poll; stops early on EOF.
async fn read_prefix<R: AsyncRead + Unpin>(
    body: &mut R,
    len: usize,
) -> std::io::Result<Vec<u8>> {
    use tokio::io::AsyncReadExt;
    let mut buf = vec![0u8; len];
    let mut filled = 0;
    while filled < len {
        let n = body.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buf.truncate(filled);
    Ok(buf)
}

/// Applies the full detection precedence (headers, then the first-100-byte
/// probe) and returns a single decoded reader for the request body.
pub async fn wrap_body<R>(
    headers: &HeaderMap,
    mut body: R,
) -> Result<Pin<Box<dyn AsyncRead + Send>>, NormalizerError>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let encoding = detect_from_headers(headers);
    if encoding != BodyEncoding::Passthrough {
        return Ok(wrap_with(encoding, body));
    }

    let prefix = read_prefix(&mut body, 100).await?;
    let detected = probe_chunk_framing(&prefix);
    let replayed = PrefixedReader {
        prefix,
        pos: 0,
        inner: body,
    };
    Ok(wrap_with(detected, replayed))
}

fn wrap_with<R>(encoding: BodyEncoding, body: R) -> Pin<Box<dyn AsyncRead + Send>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    match encoding {
        BodyEncoding::SigV4Chunked => Box::pin(SigV4ChunkedReader::new(body)),
        BodyEncoding::HttpChunked => Box::pin(HttpChunkedReader::new(body)),
        BodyEncoding::Passthrough => Box::pin(body),
    }
}

/// Which decoder the body should be run through, chosen by the precedence
/// rule in SPEC_FULL.md §4.C.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyEncoding {
    SigV4Chunked,
    HttpChunked,
    Passthrough,
}

/// Header-only detection (precedence rules 1 and 2). Rule 3 (first-100-byte
/// probe) only applies when this returns `Passthrough` and the caller has no
/// explicit header to go on — see [`probe_chunk_framing`].
pub fn detect_from_headers(headers: &HeaderMap) -> BodyEncoding {
    if is_sigv4_chunked(headers) {
        BodyEncoding::SigV4Chunked
    } else if is_http_chunked(headers) {
        BodyEncoding::HttpChunked
    } else {
        BodyEncoding::Passthrough
    }
}

pub fn is_sigv4_chunked(headers: &HeaderMap) -> bool {
    headers
        .get("x-amz-content-sha256")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == "STREAMING-AWS4-HMAC-SHA256-PAYLOAD")
        .unwrap_or(false)
}

pub fn is_http_chunked(headers: &HeaderMap) -> bool {
    headers
        .get("transfer-encoding")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("chunked"))
        .unwrap_or(false)
}

pub fn get_decoded_content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get("x-amz-decoded-content-length")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

/// Rule 3: probe up to the first 100 bytes of an already-buffered prefix for
/// a chunk-header shape (`<hex>;chunk-signature=` or `<hex>\r\n`). Used only
/// when neither header matched; a false positive (the hex parse fails) falls
/// back to passthrough per SPEC_FULL.md.
pub fn probe_chunk_framing(prefix: &[u8]) -> BodyEncoding {
    let probe_len = prefix.len().min(100);
    let probe = &prefix[..probe_len];
    let Some(header_end) = probe.windows(2).position(|w| w == b"\r\n") else {
        return BodyEncoding::Passthrough;
    };
    let Ok(header_str) = std::str::from_utf8(&probe[..header_end]) else {
        return BodyEncoding::Passthrough;
    };
    let size_part = header_str.split(';').next().unwrap_or(header_str);
    if usize::from_str_radix(size_part.trim(), 16).is_err() {
        return BodyEncoding::Passthrough;
    }
    if header_str.contains(";chunk-signature=") {
        BodyEncoding::SigV4Chunked
    } else {
        BodyEncoding::HttpChunked
    }
}

/// Shared chunk-header line parser: `<hex-size>` optionally followed by
/// `;key=value` extensions (SigV4 uses exactly one, `chunk-signature`).
/// Returns the parsed size and, for convenience, the raw extension string.
pub(crate) fn parse_chunk_header(line: &str) -> Result<(usize, &str), NormalizerError> {
    let mut parts = line.splitn(2, ';');
    let size_hex = parts.next().unwrap_or("").trim();
    let ext = parts.next().unwrap_or("");
    let size = usize::from_str_radix(size_hex, 16)
        .map_err(|_| NormalizerError::BadChunkFraming(format!("bad chunk size {size_hex:?}")))?;
    Ok((size, ext))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn detects_sigv4_header() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-amz-content-sha256",
            HeaderValue::from_static("STREAMING-AWS4-HMAC-SHA256-PAYLOAD"),
        );
        assert_eq!(detect_from_headers(&headers), BodyEncoding::SigV4Chunked);
    }

    #[test]
    fn detects_http_chunked_header() {
        let mut headers = HeaderMap::new();
        headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        assert_eq!(detect_from_headers(&headers), BodyEncoding::HttpChunked);
    }

    #[test]
    fn no_headers_is_passthrough() {
        assert_eq!(detect_from_headers(&HeaderMap::new()), BodyEncoding::Passthrough);
    }

    #[test]
    fn probe_detects_sigv4_shape() {
        let prefix = b"1a;chunk-signature=abc123\r\nhello".to_vec();
        assert_eq!(probe_chunk_framing(&prefix), BodyEncoding::SigV4Chunked);
    }

    #[test]
    fn probe_detects_plain_chunk_shape() {
        let prefix = b"1a\r\nhello world this is data".to_vec();
        assert_eq!(probe_chunk_framing(&prefix), BodyEncoding::HttpChunked);
    }

    #[test]
    fn probe_false_positive_falls_back() {
        let prefix = b"not a chunk header at all, just text\r\nmore".to_vec();
        assert_eq!(probe_chunk_framing(&prefix), BodyEncoding::Passthrough);
    }

    #[test]
    fn parse_chunk_header_with_signature() {
        let (size, ext) = parse_chunk_header("2a;chunk-signature=deadbeef").unwrap();
        assert_eq!(size, 0x2a);
        assert_eq!(ext, "chunk-signature=deadbeef");
    }

    #[test]
    fn parse_chunk_header_plain() {
        let (size, ext) = parse_chunk_header("ff").unwrap();
        assert_eq!(size, 0xff);
        assert_eq!(ext, "");
    }

    #[test]
    fn parse_chunk_header_rejects_garbage() {
        assert!(parse_chunk_header("not-hex").is_err());
    }
}
