use std::{str::FromStr, time::Duration};

use bytes::Bytes;
use hyper::{header::HOST, http::uri::Authority, Method, Request, StatusCode};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::connector::{DialError, Dialer};
use crate::exchange::{Exchange, Hijack, HijackError, Respond, Responder};
use crate::relay::{self, RelayOutcome};
use crate::socks5::Address;

/// Sent to the client once a CONNECT tunnel is up.
pub const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

const DEFAULT_PORT: u16 = 80;

/// Failures that happen before the client connection is taken over, and so
/// can still be answered with an HTTP status.
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("webserver doesn't support hijacking")]
    Configuration,
    #[error("{0}")]
    BadRequest(&'static str),
    #[error(transparent)]
    Dial(#[from] DialError),
    #[error(transparent)]
    Hijack(#[from] HijackError),
}

impl TunnelError {
    pub fn status(&self) -> StatusCode {
        match self {
            TunnelError::Configuration | TunnelError::Hijack(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            TunnelError::BadRequest(_) => StatusCode::BAD_REQUEST,
            TunnelError::Dial(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

/// Determines where a request should go: the request-target authority, or
/// the `Host` header for origin-form requests. The port defaults to 80.
pub fn resolve_target(request: &Request<()>) -> Result<Address, TunnelError> {
    let authority = match request.uri().authority() {
        Some(authority) => authority.clone(),
        None => request
            .headers()
            .get(HOST)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| Authority::from_str(value).ok())
            .ok_or(TunnelError::BadRequest("request has no target host"))?,
    };

    let host = authority.host();
    if host.is_empty() {
        return Err(TunnelError::BadRequest("request has no target host"));
    }
    let port = authority.port_u16().unwrap_or(DEFAULT_PORT);

    Ok(Address::from_host(host, port))
}

/// One client request's lifetime once both streams are held. Dropping it
/// closes both.
struct Session<C, U> {
    target: Address,
    method: Method,
    client: C,
    upstream: U,
}

impl<C, U> Session<C, U>
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    async fn run(mut self, head: Bytes, idle_timeout: Option<Duration>) -> RelayOutcome {
        let handshake = if self.method == Method::CONNECT {
            self.client.write_all(CONNECT_ESTABLISHED).await
        } else {
            self.upstream.write_all(&head).await
        };
        if let Err(e) = handshake {
            debug!(dest = %self.target, "handshake write failed: {}", e);
        }

        relay::relay(&mut self.client, &mut self.upstream, idle_timeout).await
    }
}

/// Turns each inbound exchange into a tunnel through the dialer.
pub struct TunnelHandler<D> {
    dialer: D,
    idle_timeout: Option<Duration>,
}

impl<D: Dialer> TunnelHandler<D> {
    pub fn new(dialer: D, idle_timeout: Option<Duration>) -> Self {
        Self {
            dialer,
            idle_timeout,
        }
    }

    pub async fn handle<H, R>(&self, exchange: Exchange<H, R>)
    where
        H: Hijack,
        R: Respond,
    {
        let Exchange {
            request,
            head,
            responder,
        } = exchange;

        let mut conn = match responder {
            Responder::Hijackable(conn) => conn,
            Responder::Unsupported(mut responder) => {
                reject(&mut responder, &request, TunnelError::Configuration).await;
                return;
            }
        };

        let session = match self.open(&request, &mut conn).await {
            Ok(session) => session,
            Err(e) => {
                reject(&mut conn, &request, e).await;
                return;
            }
        };

        let target = session.target.clone();
        debug!(dest = %target, method = %request.method(), "tunnel established");

        let outcome = session.run(head, self.idle_timeout).await;
        log_outcome(&target, &outcome);
    }

    async fn open<H: Hijack>(
        &self,
        request: &Request<()>,
        conn: &mut H,
    ) -> Result<Session<H::Stream, D::Stream>, TunnelError> {
        let target = resolve_target(request)?;
        let upstream = self.dialer.dial(&target).await?;
        // on failure `upstream` is dropped, and with it the proxy connection
        let client = conn.hijack()?;

        Ok(Session {
            target,
            method: request.method().clone(),
            client,
            upstream,
        })
    }
}

async fn reject<R: Respond>(responder: &mut R, request: &Request<()>, err: TunnelError) {
    let status = err.status();
    warn!(
        method = %request.method(),
        uri = %request.uri(),
        status = status.as_u16(),
        "request failed: {}",
        err
    );
    if let Err(e) = responder.respond(status, &err.to_string()).await {
        debug!("failed to write error response: {}", e);
    }
}

fn log_outcome(target: &Address, outcome: &RelayOutcome) {
    let sent = outcome.a_to_b.as_ref().ok().copied().unwrap_or_default();
    let received = outcome.b_to_a.as_ref().ok().copied().unwrap_or_default();
    if let Err(e) = &outcome.a_to_b {
        debug!(dest = %target, "client to upstream ended with error: {}", e);
    }
    if let Err(e) = &outcome.b_to_a {
        debug!(dest = %target, "upstream to client ended with error: {}", e);
    }
    info!(dest = %target, sent, received, "tunnel closed");
}
