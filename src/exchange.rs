//! Inbound HTTP exchanges and the capabilities a handler may use on them.
//!
//! A connection is read up to the end of its first request head. From there
//! the handler either answers with a framed error response, or takes the raw
//! connection over ("hijacks" it) and speaks bytes directly.

use std::{
    io,
    pin::Pin,
    task::{self, Poll},
};

use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use hyper::{Request, StatusCode, Version};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

pub const MAX_HEAD_LEN: usize = 32 * 1024;
const MAX_HEADERS: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum HeadError {
    #[error("{0}")]
    Io(#[from] io::Error),
    #[error("connection closed before a request arrived")]
    Closed,
    #[error("connection closed in the middle of a request head")]
    Truncated,
    #[error("request head exceeds {0} bytes")]
    TooLarge(usize),
    #[error("malformed request head: {0}")]
    Parse(#[from] httparse::Error),
    #[error("invalid request: {0}")]
    Invalid(#[from] hyper::http::Error),
}

impl HeadError {
    /// Status to answer with, `None` when nobody is listening any more.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            HeadError::Io(_) | HeadError::Closed | HeadError::Truncated => None,
            HeadError::TooLarge(_) | HeadError::Parse(httparse::Error::TooManyHeaders) => {
                Some(StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE)
            }
            HeadError::Parse(_) | HeadError::Invalid(_) => Some(StatusCode::BAD_REQUEST),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HijackError {
    #[error("connection already hijacked")]
    AlreadyHijacked,
    #[error("a response was already written on this connection")]
    ResponseStarted,
}

/// Writes a framed, final response on an exchange.
#[async_trait]
pub trait Respond: Send {
    async fn respond(&mut self, status: StatusCode, message: &str) -> io::Result<()>;
}

/// Hands the raw client connection over to the caller.
pub trait Hijack: Respond {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    fn hijack(&mut self) -> Result<Self::Stream, HijackError>;
}

/// The response side of an exchange, split by whether it can be hijacked.
pub enum Responder<H, R = H> {
    Hijackable(H),
    Unsupported(R),
}

pub struct Exchange<H, R = H> {
    pub request: Request<()>,
    /// Request line and headers exactly as the client sent them.
    pub head: Bytes,
    pub responder: Responder<H, R>,
}

/// A client connection speaking HTTP/1.x.
#[derive(Debug)]
pub struct ClientConn<S> {
    io: Option<S>,
    read_buf: BytesMut,
    responded: bool,
}

impl<S> ClientConn<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(io: S) -> Self {
        Self {
            io: Some(io),
            read_buf: BytesMut::with_capacity(4096),
            responded: false,
        }
    }

    /// Reads and parses one request head. Bytes past the head stay buffered
    /// and are replayed by the hijacked stream.
    pub async fn read_head(&mut self) -> Result<(Request<()>, Bytes), HeadError> {
        let io = self.io.as_mut().ok_or_else(not_connected)?;

        loop {
            if let Some(parsed) = parse_head(&mut self.read_buf)? {
                return Ok(parsed);
            }
            if self.read_buf.len() >= MAX_HEAD_LEN {
                return Err(HeadError::TooLarge(MAX_HEAD_LEN));
            }

            if io.read_buf(&mut self.read_buf).await? == 0 {
                return Err(if self.read_buf.is_empty() {
                    HeadError::Closed
                } else {
                    HeadError::Truncated
                });
            }
        }
    }
}

fn parse_head(buf: &mut BytesMut) -> Result<Option<(Request<()>, Bytes)>, HeadError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);

    let len = match req.parse(buf)? {
        httparse::Status::Complete(len) => len,
        httparse::Status::Partial => return Ok(None),
    };

    let version = match req.version {
        Some(0) => Version::HTTP_10,
        _ => Version::HTTP_11,
    };
    let mut builder = Request::builder()
        .method(req.method.unwrap_or_default())
        .uri(req.path.unwrap_or_default())
        .version(version);
    for header in req.headers.iter() {
        builder = builder.header(header.name, header.value);
    }
    let request = builder.body(())?;

    Ok(Some((request, buf.split_to(len).freeze())))
}

fn not_connected() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "connection was hijacked")
}

#[async_trait]
impl<S> Respond for ClientConn<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn respond(&mut self, status: StatusCode, message: &str) -> io::Result<()> {
        let io = self.io.as_mut().ok_or_else(not_connected)?;
        self.responded = true;

        let body = format!("{}\n", message);
        let head = format!(
            "HTTP/1.1 {} {}\r\n\
             Content-Type: text/plain; charset=utf-8\r\n\
             X-Content-Type-Options: nosniff\r\n\
             Content-Length: {}\r\n\
             Connection: close\r\n\r\n",
            status.as_str(),
            status.canonical_reason().unwrap_or(""),
            body.len()
        );

        io.write_all(head.as_bytes()).await?;
        io.write_all(body.as_bytes()).await?;
        io.flush().await
    }
}

impl<S> Hijack for ClientConn<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    type Stream = Rewind<S>;

    fn hijack(&mut self) -> Result<Rewind<S>, HijackError> {
        if self.responded {
            return Err(HijackError::ResponseStarted);
        }
        let io = self.io.take().ok_or(HijackError::AlreadyHijacked)?;
        let pre = self.read_buf.split().freeze();
        Ok(Rewind::new(io, pre))
    }
}

/// A stream that yields already-buffered bytes before reading from `inner`.
#[derive(Debug)]
pub struct Rewind<S> {
    pre: Bytes,
    inner: S,
}

impl<S> Rewind<S> {
    pub fn new(inner: S, pre: Bytes) -> Self {
        Self { pre, inner }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Rewind<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut task::Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let me = self.get_mut();
        if !me.pre.is_empty() {
            let n = me.pre.len().min(buf.remaining());
            buf.put_slice(&me.pre[..n]);
            me.pre.advance(n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut me.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Rewind<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut task::Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
