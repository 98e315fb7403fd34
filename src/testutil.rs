//! Scripted SOCKS5 proxy for tests.

use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
};

use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc,
};

use crate::config::Upstream;
use crate::socks5::{
    self, Address, HandshakeRequest, HandshakeResponse, PasswordAuthRequest, PasswordAuthResponse,
    Reply, TcpRequestHeader, TcpResponseHeader, SOCKS5_AUTH_METHOD_NONE,
    SOCKS5_AUTH_METHOD_NOT_ACCEPTABLE, SOCKS5_AUTH_METHOD_PASSWORD,
};

enum TargetMode {
    Echo,
    Handoff(mpsc::UnboundedSender<TcpStream>),
}

pub struct Socks5Script {
    reply: Reply,
    credentials: Option<(String, String)>,
    target: TargetMode,
}

impl Socks5Script {
    /// Accepts every CONNECT and echoes tunneled bytes back.
    pub fn echo() -> Self {
        Self {
            reply: Reply::Succeeded,
            credentials: None,
            target: TargetMode::Echo,
        }
    }

    /// Accepts every CONNECT and hands the tunneled stream to the test.
    pub fn handoff() -> (Self, mpsc::UnboundedReceiver<TcpStream>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let script = Self {
            reply: Reply::Succeeded,
            credentials: None,
            target: TargetMode::Handoff(tx),
        };
        (script, rx)
    }

    pub fn reject(reply: Reply) -> Self {
        Self {
            reply,
            credentials: None,
            target: TargetMode::Echo,
        }
    }

    pub fn with_credentials(mut self, username: &str, password: &str) -> Self {
        self.credentials = Some((username.to_owned(), password.to_owned()));
        self
    }
}

pub struct MockProxy {
    pub upstream: Upstream,
    targets: Arc<Mutex<Vec<Address>>>,
}

impl MockProxy {
    /// Targets requested so far, in arrival order.
    pub fn targets(&self) -> Vec<Address> {
        self.targets.lock().unwrap().clone()
    }
}

pub async fn spawn_socks5(script: Socks5Script) -> MockProxy {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let targets = Arc::new(Mutex::new(Vec::new()));
    let script = Arc::new(script);

    let recorded = targets.clone();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let script = script.clone();
            let recorded = recorded.clone();
            tokio::spawn(async move {
                let _ = serve_one(stream, &script, &recorded).await;
            });
        }
    });

    MockProxy {
        upstream: Upstream::parse(&format!("socks5://{}", addr)).unwrap(),
        targets,
    }
}

async fn serve_one(
    mut stream: TcpStream,
    script: &Socks5Script,
    targets: &Mutex<Vec<Address>>,
) -> Result<(), socks5::Error> {
    let req = HandshakeRequest::read_from(&mut stream).await?;
    match &script.credentials {
        None => {
            HandshakeResponse::new(SOCKS5_AUTH_METHOD_NONE)
                .write_to(&mut stream)
                .await?
        }
        Some((username, password)) => {
            if !req.methods.contains(&SOCKS5_AUTH_METHOD_PASSWORD) {
                HandshakeResponse::new(SOCKS5_AUTH_METHOD_NOT_ACCEPTABLE)
                    .write_to(&mut stream)
                    .await?;
                return Ok(());
            }
            HandshakeResponse::new(SOCKS5_AUTH_METHOD_PASSWORD)
                .write_to(&mut stream)
                .await?;
            let auth = PasswordAuthRequest::read_from(&mut stream).await?;
            let accepted =
                auth.username == username.as_bytes() && auth.password == password.as_bytes();
            PasswordAuthResponse::new(if accepted { 0 } else { 1 })
                .write_to(&mut stream)
                .await?;
            if !accepted {
                return Ok(());
            }
        }
    }

    let header = TcpRequestHeader::read_from(&mut stream).await?;
    targets.lock().unwrap().push(header.address.clone());

    let bound = Address::from(SocketAddr::from(([0, 0, 0, 0], 0)));
    TcpResponseHeader::new(script.reply, bound)
        .write_to(&mut stream)
        .await?;
    if script.reply != Reply::Succeeded {
        return Ok(());
    }

    match &script.target {
        TargetMode::Echo => {
            let (mut r, mut w) = stream.split();
            tokio::io::copy(&mut r, &mut w).await?;
        }
        TargetMode::Handoff(tx) => {
            let _ = tx.send(stream);
        }
    }
    Ok(())
}
