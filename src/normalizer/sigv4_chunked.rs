//! Streaming decoder for the `STREAMING-AWS4-HMAC-SHA256-PAYLOAD` body
//! framing the AWS CLI/SDKs use for chunked SigV4 uploads: each chunk is
//! `<hex-size>;chunk-signature=<sig>\r\n<data>\r\n`, terminated by a
//! zero-size chunk. We verify framing shape only — chunk signatures are an
//! authentication concern handled upstream of the crypto path, if at all.
//!
//! Rewritten from a fully-buffered decode-into-`Bytes` helper into an
//! `AsyncRead` adapter that holds at most one chunk header and one
//! in-progress chunk body in flight, regardless of object size.

use super::{parse_chunk_header, NormalizerError};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, ReadBuf};

enum State {
    /// Accumulating the `<hex>;chunk-signature=...` header line byte by byte.
    Header(Vec<u8>),
    /// `remaining` ciphertext bytes of the current chunk's body left to copy.
    Body(usize),
    /// Consuming the 2-byte CRLF that follows a chunk body. `final_chunk`
    /// marks whether the chunk just finished was the terminal zero-size one.
    Crlf { seen: u8, final_chunk: bool },
    Done,
}

pub struct SigV4ChunkedReader<R> {
    inner: R,
    state: State,
}

impl<R: AsyncRead + Unpin> SigV4ChunkedReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            state: State::Header(Vec::with_capacity(96)),
        }
    }

    fn bad_framing(msg: impl Into<String>) -> io::Error {
        io::Error::new(
            io::ErrorKind::InvalidData,
            NormalizerError::BadChunkFraming(msg.into()),
        )
    }

    /// Read a single byte from `inner` into `out`, returning `Ok(true)` on
    /// success and `Ok(false)` on EOF.
    fn poll_one_byte(
        inner: Pin<&mut R>,
        cx: &mut Context<'_>,
        out: &mut u8,
    ) -> Poll<io::Result<bool>> {
        let mut byte = [0u8; 1];
        let mut rb = ReadBuf::new(&mut byte);
        match inner.poll_read(cx, &mut rb) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Ready(Ok(())) => {
                if rb.filled().is_empty() {
                    Poll::Ready(Ok(false))
                } else {
                    *out = rb.filled()[0];
                    Poll::Ready(Ok(true))
                }
            }
        }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for SigV4ChunkedReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            match &mut this.state {
                State::Done => return Poll::Ready(Ok(())),

                State::Header(acc) => {
                    let mut b = 0u8;
                    match Self::poll_one_byte(Pin::new(&mut this.inner), cx, &mut b) {
                        Poll::Pending => return Poll::Pending,
                        Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                        Poll::Ready(Ok(false)) => {
                            return Poll::Ready(Err(Self::bad_framing("EOF mid chunk header")))
                        }
                        Poll::Ready(Ok(true)) => {
                            acc.push(b);
                            if acc.len() >= 2 && acc[acc.len() - 2..] == *b"\r\n" {
                                let line = String::from_utf8_lossy(&acc[..acc.len() - 2]).into_owned();
                                let (size, _ext) = parse_chunk_header(&line).map_err(|e| {
                                    io::Error::new(io::ErrorKind::InvalidData, e.to_string())
                                })?;
                                this.state = if size == 0 {
                                    State::Crlf {
                                        seen: 0,
                                        final_chunk: true,
                                    }
                                } else {
                                    State::Body(size)
                                };
                            }
                        }
                    }
                }

                State::Body(remaining) => {
                    if *remaining == 0 {
                        this.state = State::Crlf {
                            seen: 0,
                            final_chunk: false,
                        };
                        continue;
                    }
                    if buf.remaining() == 0 {
                        return Poll::Ready(Ok(()));
                    }
                    let to_read = buf.remaining().min(*remaining);
                    let mut limited = buf.take(to_read);
                    match Pin::new(&mut this.inner).poll_read(cx, &mut limited) {
                        Poll::Pending => return Poll::Pending,
                        Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                        Poll::Ready(Ok(())) => {
                            let n = limited.filled().len();
                            if n == 0 {
                                return Poll::Ready(Err(Self::bad_framing(
                                    "EOF mid chunk body",
                                )));
                            }
                            buf.advance(n);
                            *remaining -= n;
                            return Poll::Ready(Ok(()));
                        }
                    }
                }

                State::Crlf { seen, final_chunk } => {
                    let mut b = 0u8;
                    match Self::poll_one_byte(Pin::new(&mut this.inner), cx, &mut b) {
                        Poll::Pending => return Poll::Pending,
                        Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                        Poll::Ready(Ok(false)) => {
                            return Poll::Ready(Err(Self::bad_framing(
                                "EOF mid chunk trailer CRLF",
                            )))
                        }
                        Poll::Ready(Ok(true)) => {
                            let expected = if *seen == 0 { b'\r' } else { b'\n' };
                            if b != expected {
                                return Poll::Ready(Err(Self::bad_framing(
                                    "missing CRLF after chunk body",
                                )));
                            }
                            *seen += 1;
                            if *seen == 2 {
                                this.state = if *final_chunk {
                                    State::Done
                                } else {
                                    State::Header(Vec::with_capacity(96))
                                };
                            }
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    async fn decode_all(input: &[u8]) -> Vec<u8> {
        let mut reader = SigV4ChunkedReader::new(input);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn decodes_single_chunk() {
        let input = b"5;chunk-signature=abc123\r\nhello\r\n0;chunk-signature=def456\r\n\r\n";
        let out = decode_all(input).await;
        assert_eq!(out, b"hello");
    }

    #[tokio::test]
    async fn decodes_multiple_chunks() {
        let input = b"3;chunk-signature=a\r\nfoo\r\n3;chunk-signature=b\r\nbar\r\n0;chunk-signature=c\r\n\r\n";
        let out = decode_all(input).await;
        assert_eq!(out, b"foobar");
    }

    #[tokio::test]
    async fn decodes_empty_body() {
        let input = b"0;chunk-signature=a\r\n\r\n";
        let out = decode_all(input).await;
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn rejects_truncated_body() {
        let input = b"a;chunk-signature=a\r\nshort";
        let mut reader = SigV4ChunkedReader::new(&input[..]);
        let mut out = Vec::new();
        assert!(reader.read_to_end(&mut out).await.is_err());
    }

    #[tokio::test]
    async fn rejects_bad_crlf() {
        let input = b"3;chunk-signature=a\r\nfooXX0;chunk-signature=c\r\n\r\n";
        let mut reader = SigV4ChunkedReader::new(&input[..]);
        let mut out = Vec::new();
        assert!(reader.read_to_end(&mut out).await.is_err());
    }
}
