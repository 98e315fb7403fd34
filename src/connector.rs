use std::{io, time::Duration};

use async_trait::async_trait;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
    time,
};
use tracing::debug;

use crate::config::{Credentials, Upstream};
use crate::socks5::{
    self, Address, Command, HandshakeRequest, HandshakeResponse, PasswordAuthRequest,
    PasswordAuthResponse, Reply, TcpRequestHeader, TcpResponseHeader, SOCKS5_AUTH_METHOD_NONE,
    SOCKS5_AUTH_METHOD_NOT_ACCEPTABLE, SOCKS5_AUTH_METHOD_PASSWORD,
};

#[derive(Debug, thiserror::Error)]
pub enum DialError {
    #[error("target host is empty")]
    EmptyHost,
    #[error("connect to socks5 proxy {proxy}: {source}")]
    Proxy {
        proxy: String,
        #[source]
        source: io::Error,
    },
    #[error("socks5 proxy {proxy} failed to reach target: {source}")]
    Handshake {
        proxy: String,
        #[source]
        source: socks5::Error,
    },
    #[error("dial {target} timed out after {timeout:?}")]
    Timeout { target: Address, timeout: Duration },
}

/// Produces a connected byte stream to a target, or fails.
#[async_trait]
pub trait Dialer: Send + Sync {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    async fn dial(&self, target: &Address) -> Result<Self::Stream, DialError>;
}

/// Dials every target through one SOCKS5 proxy. A single attempt is made per
/// call, failures are returned as they are.
#[derive(Debug, Clone)]
pub struct Socks5Dialer {
    upstream: Upstream,
    connect_timeout: Option<Duration>,
}

impl Socks5Dialer {
    pub fn new(upstream: Upstream, connect_timeout: Option<Duration>) -> Self {
        Self {
            upstream,
            connect_timeout,
        }
    }

    async fn connect(&self, target: &Address) -> Result<TcpStream, DialError> {
        let proxy = self.upstream.authority();
        let mut stream = TcpStream::connect(&proxy)
            .await
            .map_err(|source| DialError::Proxy {
                proxy: proxy.clone(),
                source,
            })?;
        let _ = stream.set_nodelay(true);

        let bound = handshake(&mut stream, self.upstream.credentials.as_ref(), target)
            .await
            .map_err(|source| DialError::Handshake { proxy, source })?;
        debug!(dest = %target, %bound, "socks5 connect succeeded");

        Ok(stream)
    }
}

#[async_trait]
impl Dialer for Socks5Dialer {
    type Stream = TcpStream;

    async fn dial(&self, target: &Address) -> Result<TcpStream, DialError> {
        if let Address::DomainNameAddress(host, _) = target {
            if host.is_empty() {
                return Err(DialError::EmptyHost);
            }
        }

        match self.connect_timeout {
            Some(timeout) => time::timeout(timeout, self.connect(target))
                .await
                .map_err(|_| DialError::Timeout {
                    target: target.clone(),
                    timeout,
                })?,
            None => self.connect(target).await,
        }
    }
}

/// Runs the client side of a SOCKS5 CONNECT on `stream` and returns the
/// address the proxy bound for it.
pub async fn handshake<S>(
    stream: &mut S,
    credentials: Option<&Credentials>,
    target: &Address,
) -> Result<Address, socks5::Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    target.check_encodable()?;

    let methods = match credentials {
        Some(_) => vec![SOCKS5_AUTH_METHOD_NONE, SOCKS5_AUTH_METHOD_PASSWORD],
        None => vec![SOCKS5_AUTH_METHOD_NONE],
    };
    HandshakeRequest::new(methods).write_to(stream).await?;

    let chosen = HandshakeResponse::read_from(stream).await?.chosen_method;
    match (chosen, credentials) {
        (SOCKS5_AUTH_METHOD_NONE, _) => {}
        (SOCKS5_AUTH_METHOD_PASSWORD, Some(creds)) => {
            PasswordAuthRequest::new(&creds.username, &creds.password)?
                .write_to(stream)
                .await?;
            let resp = PasswordAuthResponse::read_from(stream).await?;
            if resp.status != 0 {
                return Err(socks5::Error::AuthenticationFailed(resp.status));
            }
        }
        (SOCKS5_AUTH_METHOD_NOT_ACCEPTABLE, _) => {
            return Err(socks5::Error::NoAcceptableAuthMethod)
        }
        (method, _) => return Err(socks5::Error::UnexpectedAuthMethod(method)),
    }

    TcpRequestHeader::new(Command::TcpConnect, target.clone())
        .write_to(stream)
        .await?;

    let resp = TcpResponseHeader::read_from(stream).await?;
    match resp.reply {
        Reply::Succeeded => Ok(resp.address),
        reply => Err(socks5::Error::Reply(reply)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{self, Socks5Script};
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
    };

    fn dialer_for(upstream: Upstream) -> Socks5Dialer {
        Socks5Dialer::new(upstream, Some(Duration::from_secs(5)))
    }

    #[tokio::test]
    async fn connects_through_proxy() {
        let proxy = testutil::spawn_socks5(Socks5Script::echo()).await;
        let dialer = dialer_for(proxy.upstream.clone());

        let target = Address::DomainNameAddress("example.com".into(), 443);
        let mut stream = dialer.dial(&target).await.unwrap();
        stream.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).await.unwrap();

        assert_eq!(&buf, b"hello");
        assert_eq!(proxy.targets(), vec![target]);
    }

    #[tokio::test]
    async fn authenticates_with_credentials() {
        let script = Socks5Script::echo().with_credentials("alice", "secret");
        let proxy = testutil::spawn_socks5(script).await;
        let mut upstream = proxy.upstream.clone();
        upstream.credentials = Some(Credentials {
            username: "alice".into(),
            password: "secret".into(),
        });

        let target = Address::from_host("10.0.0.7", 80);
        dialer_for(upstream).dial(&target).await.unwrap();
        assert_eq!(proxy.targets(), vec![target]);
    }

    #[tokio::test]
    async fn wrong_password_is_a_dial_error() {
        let script = Socks5Script::echo().with_credentials("alice", "secret");
        let proxy = testutil::spawn_socks5(script).await;
        let mut upstream = proxy.upstream.clone();
        upstream.credentials = Some(Credentials {
            username: "alice".into(),
            password: "guess".into(),
        });

        let err = dialer_for(upstream)
            .dial(&Address::from_host("example.com", 80))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DialError::Handshake {
                source: socks5::Error::AuthenticationFailed(_),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn proxy_rejection_carries_reply() {
        let proxy = testutil::spawn_socks5(Socks5Script::reject(Reply::HostUnreachable)).await;
        let err = dialer_for(proxy.upstream.clone())
            .dial(&Address::from_host("nowhere.invalid", 80))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            DialError::Handshake {
                source: socks5::Error::Reply(Reply::HostUnreachable),
                ..
            }
        ));
        assert!(err.to_string().contains("host unreachable"));
    }

    #[tokio::test]
    async fn unreachable_proxy() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let upstream = Upstream::parse(&format!("socks5://{}", addr)).unwrap();
        let err = dialer_for(upstream)
            .dial(&Address::from_host("example.com", 80))
            .await
            .unwrap_err();
        assert!(matches!(err, DialError::Proxy { .. }));
    }

    #[tokio::test]
    async fn empty_host_is_rejected_before_io() {
        let upstream = Upstream::parse("socks5://127.0.0.1:9").unwrap();
        let err = dialer_for(upstream)
            .dial(&Address::DomainNameAddress(String::new(), 80))
            .await
            .unwrap_err();
        assert!(matches!(err, DialError::EmptyHost));
    }

    #[tokio::test]
    async fn silent_proxy_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _hold = tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            futures::future::pending::<()>().await;
        });

        let upstream = Upstream::parse(&format!("socks5://{}", addr)).unwrap();
        let dialer = Socks5Dialer::new(upstream, Some(Duration::from_millis(100)));
        let err = dialer
            .dial(&Address::from_host("example.com", 80))
            .await
            .unwrap_err();
        assert!(matches!(err, DialError::Timeout { .. }));
    }

    #[tokio::test]
    async fn oversized_domain_never_reaches_the_wire() {
        let (mut near, _far) = tokio::io::duplex(64);
        let target = Address::DomainNameAddress("x".repeat(300), 80);
        let err = handshake(&mut near, None, &target).await.unwrap_err();
        assert!(matches!(err, socks5::Error::DomainNameTooLong(300)));
    }
}
