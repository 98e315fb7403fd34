use std::{io, net::SocketAddr, sync::Arc, time::Duration};

use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info_span, warn, Instrument};

use crate::config::Config;
use crate::connector::Dialer;
use crate::exchange::{ClientConn, Exchange, HeadError, Respond, Responder};
use crate::tunnel::TunnelHandler;

const ACCEPT_BACKOFF: Duration = Duration::from_secs(1);

/// Accepts plain HTTP/1.x connections and runs one tunnel session per
/// connection on its own task.
pub struct Server<D> {
    listener: TcpListener,
    handler: Arc<TunnelHandler<D>>,
}

impl<D> Server<D>
where
    D: Dialer + 'static,
{
    pub async fn bind(config: &Config, handler: TunnelHandler<D>) -> io::Result<Self> {
        let listener = TcpListener::bind(&config.listen_addr).await?;
        Ok(Self {
            listener,
            handler: Arc::new(handler),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Runs the accept loop. Accept errors are logged and retried after a
    /// short pause, they never end the loop.
    pub async fn serve(self) {
        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    let handler = self.handler.clone();
                    tokio::spawn(
                        serve_conn(handler, stream).instrument(info_span!("conn", %peer)),
                    );
                }
                Err(e) => {
                    error!("failed to accept connection: {}", e);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
    }
}

async fn serve_conn<D: Dialer>(handler: Arc<TunnelHandler<D>>, stream: TcpStream) {
    let _ = stream.set_nodelay(true);
    let mut conn = ClientConn::new(stream);

    match conn.read_head().await {
        Ok((request, head)) => {
            debug!(method = %request.method(), uri = %request.uri(), "request");
            let exchange: Exchange<ClientConn<TcpStream>> = Exchange {
                request,
                head,
                responder: Responder::Hijackable(conn),
            };
            handler.handle(exchange).await;
        }
        Err(HeadError::Closed) => debug!("client closed without a request"),
        Err(e) => {
            warn!("unreadable request: {}", e);
            if let Some(status) = e.status() {
                if let Err(e) = conn.respond(status, &e.to_string()).await {
                    debug!("failed to write error response: {}", e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Upstream;
    use crate::connector::Socks5Dialer;
    use crate::socks5::{Address, Reply};
    use crate::testutil::{self, Socks5Script};
    use crate::tunnel::CONNECT_ESTABLISHED;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn start(upstream: Upstream) -> SocketAddr {
        let config = Config {
            listen_addr: "127.0.0.1:0".into(),
            upstream: upstream.clone(),
            connect_timeout: Some(Duration::from_secs(5)),
            idle_timeout: None,
            verbose: false,
        };
        let dialer = Socks5Dialer::new(config.upstream.clone(), config.connect_timeout);
        let server = Server::bind(&config, TunnelHandler::new(dialer, config.idle_timeout))
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(server.serve());
        addr
    }

    #[tokio::test]
    async fn connect_tunnel_end_to_end() {
        let (script, mut targets) = Socks5Script::handoff();
        let proxy = testutil::spawn_socks5(script).await;
        let addr = start(proxy.upstream.clone()).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com\r\n\r\n")
            .await
            .unwrap();

        let mut banner = vec![0u8; CONNECT_ESTABLISHED.len()];
        client.read_exact(&mut banner).await.unwrap();
        assert_eq!(banner, CONNECT_ESTABLISHED);

        let mut target = targets.recv().await.unwrap();
        client.write_all(b"12345").await.unwrap();
        let mut buf = [0u8; 5];
        target.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"12345");

        target.write_all(b"pong").await.unwrap();
        target.shutdown().await.unwrap();
        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, b"pong");

        assert_eq!(
            proxy.targets(),
            vec![Address::DomainNameAddress("example.com".into(), 443)]
        );
    }

    #[tokio::test]
    async fn plain_request_end_to_end() {
        let (script, mut targets) = Socks5Script::handoff();
        let proxy = testutil::spawn_socks5(script).await;
        let addr = start(proxy.upstream.clone()).await;

        let request = b"GET http://example.com/ HTTP/1.1\r\nHost: example.com\r\n\r\n";
        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(request).await.unwrap();

        let mut target = targets.recv().await.unwrap();
        let mut seen = vec![0u8; request.len()];
        target.read_exact(&mut seen).await.unwrap();
        assert_eq!(&seen[..], &request[..]);

        let response = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello";
        target.write_all(response).await.unwrap();
        target.shutdown().await.unwrap();

        let mut got = Vec::new();
        client.read_to_end(&mut got).await.unwrap();
        assert_eq!(&got[..], &response[..]);
        assert_eq!(
            proxy.targets(),
            vec![Address::DomainNameAddress("example.com".into(), 80)]
        );
    }

    #[tokio::test]
    async fn plain_request_with_body_end_to_end() {
        let (script, mut targets) = Socks5Script::handoff();
        let proxy = testutil::spawn_socks5(script).await;
        let addr = start(proxy.upstream.clone()).await;

        let request: &[u8] =
            b"POST http://example.com/x HTTP/1.1\r\nHost: example.com\r\nContent-Length: 5\r\n\r\nhello";
        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(request).await.unwrap();

        let mut target = targets.recv().await.unwrap();
        let mut seen = vec![0u8; request.len()];
        target.read_exact(&mut seen).await.unwrap();
        assert_eq!(&seen[..], request);

        // body split across writes, part of it sent after the tunnel is up
        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(b"POST http://example.com/x HTTP/1.1\r\nHost: example.com\r\nContent-Length: 5\r\n\r\nhel")
            .await
            .unwrap();
        let mut target = targets.recv().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        client.write_all(b"lo").await.unwrap();
        client.shutdown().await.unwrap();

        let mut seen = Vec::new();
        target.read_to_end(&mut seen).await.unwrap();
        assert_eq!(&seen[..], request);
    }

    #[tokio::test]
    async fn pipelined_bytes_after_connect_are_not_lost() {
        let (script, mut targets) = Socks5Script::handoff();
        let proxy = testutil::spawn_socks5(script).await;
        let addr = start(proxy.upstream.clone()).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(b"CONNECT 10.0.0.9:22 HTTP/1.1\r\n\r\nSSH-2.0-test\r\n")
            .await
            .unwrap();

        let mut target = targets.recv().await.unwrap();
        let mut buf = vec![0u8; 14];
        target.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, b"SSH-2.0-test\r\n");
        assert_eq!(proxy.targets(), vec![Address::from_host("10.0.0.9", 22)]);
    }

    #[tokio::test]
    async fn dial_failure_returns_bad_gateway() {
        let proxy = testutil::spawn_socks5(Socks5Script::reject(Reply::HostUnreachable)).await;
        let addr = start(proxy.upstream.clone()).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com\r\n\r\n")
            .await
            .unwrap();

        let mut response = String::new();
        client.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 502 Bad Gateway\r\n"));
        assert!(!response.contains("Connection Established"));
        let body = response.split("\r\n\r\n").nth(1).unwrap();
        assert!(body.contains("host unreachable"));
    }

    #[tokio::test]
    async fn one_failed_session_does_not_affect_the_next() {
        let proxy = testutil::spawn_socks5(Socks5Script::echo()).await;
        let addr = start(proxy.upstream.clone()).await;

        // no host anywhere: rejected before dialing
        let mut bad = TcpStream::connect(addr).await.unwrap();
        bad.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
        let mut response = String::new();
        bad.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"));

        let mut good = TcpStream::connect(addr).await.unwrap();
        good.write_all(b"CONNECT echo.test:7 HTTP/1.1\r\n\r\n")
            .await
            .unwrap();
        let mut banner = vec![0u8; CONNECT_ESTABLISHED.len()];
        good.read_exact(&mut banner).await.unwrap();
        good.write_all(b"abc").await.unwrap();
        let mut buf = [0u8; 3];
        good.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"abc");
    }

    #[tokio::test]
    async fn malformed_head_is_rejected() {
        let proxy = testutil::spawn_socks5(Socks5Script::echo()).await;
        let addr = start(proxy.upstream.clone()).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"\x16\x03\x01 not http\r\n\r\n").await.unwrap();
        let mut response = String::new();
        client.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(proxy.targets().is_empty());
    }
}
