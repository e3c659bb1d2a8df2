//! Streaming decoder for plain HTTP/1.1 `Transfer-Encoding: chunked` framing
//! (RFC 9112 §7.1). In practice axum/hyper already de-chunks request bodies
//! before a handler ever sees them, so this decoder exists for the rare path
//! where the proxy reads a chunked body directly off a raw connection. Same
//! bounded-lookahead shape as [`super::SigV4ChunkedReader`], without the
//! `chunk-signature` extension and with RFC trailer-header handling.

use super::{parse_chunk_header, NormalizerError};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, ReadBuf};

enum State {
    Header(Vec<u8>),
    Body(usize),
    /// CRLF after a non-final chunk body.
    BodyCrlf,
    /// Trailer-part: zero or more header lines followed by an empty line.
    Trailer(Vec<u8>),
    Done,
}

pub struct HttpChunkedReader<R> {
    inner: R,
    state: State,
}

impl<R: AsyncRead + Unpin> HttpChunkedReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            state: State::Header(Vec::with_capacity(32)),
        }
    }

    fn bad_framing(msg: impl Into<String>) -> io::Error {
        io::Error::new(
            io::ErrorKind::InvalidData,
            NormalizerError::BadChunkFraming(msg.into()),
        )
    }

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

impl<R: AsyncRead + Unpin> AsyncRead for HttpChunkedReader<R> {
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
                                let line =
                                    String::from_utf8_lossy(&acc[..acc.len() - 2]).into_owned();
                                let (size, _ext) = parse_chunk_header(&line).map_err(|e| {
                                    io::Error::new(io::ErrorKind::InvalidData, e.to_string())
                                })?;
                                this.state = if size == 0 {
                                    State::Trailer(Vec::with_capacity(32))
                                } else {
                                    State::Body(size)
                                };
                            }
                        }
                    }
                }

                State::Body(remaining) => {
                    if *remaining == 0 {
                        this.state = State::BodyCrlf;
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
                                return Poll::Ready(Err(Self::bad_framing("EOF mid chunk body")));
                            }
                            buf.advance(n);
                            *remaining -= n;
                            return Poll::Ready(Ok(()));
                        }
                    }
                }

                State::BodyCrlf => {
                    // Consume exactly 2 bytes; reuse a tiny local accumulator.
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
                            if b != b'\r' {
                                return Poll::Ready(Err(Self::bad_framing(
                                    "missing CR after chunk body",
                                )));
                            }
                            let mut b2 = 0u8;
                            loop {
                                match Self::poll_one_byte(Pin::new(&mut this.inner), cx, &mut b2) {
                                    Poll::Pending => return Poll::Pending,
                                    Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                                    Poll::Ready(Ok(false)) => {
                                        return Poll::Ready(Err(Self::bad_framing(
                                            "EOF mid chunk trailer CRLF",
                                        )))
                                    }
                                    Poll::Ready(Ok(true)) => break,
                                }
                            }
                            if b2 != b'\n' {
                                return Poll::Ready(Err(Self::bad_framing(
                                    "missing LF after chunk body",
                                )));
                            }
                            this.state = State::Header(Vec::with_capacity(32));
                        }
                    }
                }

                State::Trailer(acc) => {
                    let mut b = 0u8;
                    match Self::poll_one_byte(Pin::new(&mut this.inner), cx, &mut b) {
                        Poll::Pending => return Poll::Pending,
                        Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                        Poll::Ready(Ok(false)) => {
                            return Poll::Ready(Err(Self::bad_framing("EOF mid trailer")))
                        }
                        Poll::Ready(Ok(true)) => {
                            acc.push(b);
                            if acc.len() >= 2 && acc[acc.len() - 2..] == *b"\r\n" {
                                if acc.len() == 2 {
                                    // Empty line: end of trailer-part.
                                    this.state = State::Done;
                                } else {
                                    acc.clear();
                                }
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
        let mut reader = HttpChunkedReader::new(input);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn decodes_single_chunk_no_trailer() {
        let out = decode_all(b"5\r\nhello\r\n0\r\n\r\n").await;
        assert_eq!(out, b"hello");
    }

    #[tokio::test]
    async fn decodes_multiple_chunks() {
        let out = decode_all(b"3\r\nfoo\r\n3\r\nbar\r\n0\r\n\r\n").await;
        assert_eq!(out, b"foobar");
    }

    #[tokio::test]
    async fn decodes_with_trailer_headers() {
        let out = decode_all(b"3\r\nfoo\r\n0\r\nX-Checksum: abc\r\n\r\n").await;
        assert_eq!(out, b"foo");
    }

    #[tokio::test]
    async fn rejects_truncated_stream() {
        let input = b"5\r\nhel";
        let mut reader = HttpChunkedReader::new(&input[..]);
        let mut out = Vec::new();
        assert!(reader.read_to_end(&mut out).await.is_err());
    }
}
