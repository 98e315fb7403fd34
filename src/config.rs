use std::{fmt, time::Duration};

use clap::Parser;
use url::Url;

const DEFAULT_SOCKS5_PORT: u16 = 1080;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("proxy url parse error: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("unsupported proxy scheme `{0}`, expected socks5 or socks5h")]
    UnsupportedScheme(String),
    #[error("proxy url has no host")]
    MissingHost,
}

/// Command line flags.
#[derive(Parser, Debug)]
#[command(author, version, about = "HTTP proxy that tunnels every request through a SOCKS5 upstream", long_about = None)]
pub struct Args {
    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0:8180")]
    pub laddr: String,

    /// Socks proxy address to connect to
    #[arg(long, default_value = "socks5://127.0.0.1:1080")]
    pub raddr: String,

    /// Seconds allowed for reaching the target through the proxy
    #[arg(long)]
    pub connect_timeout: Option<u64>,

    /// Seconds a tunnel may carry no traffic in either direction before it is closed
    #[arg(long)]
    pub idle_timeout: Option<u64>,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// The single SOCKS5 endpoint every dial goes through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upstream {
    pub host: String,
    pub port: u16,
    pub credentials: Option<Credentials>,
}

impl Upstream {
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let url = Url::parse(raw)?;
        match url.scheme() {
            "socks5" | "socks5h" => {}
            other => return Err(ConfigError::UnsupportedScheme(other.to_owned())),
        }

        let host = match url.host_str() {
            Some(h) if !h.is_empty() => h.to_owned(),
            _ => return Err(ConfigError::MissingHost),
        };
        let port = url.port().unwrap_or(DEFAULT_SOCKS5_PORT);

        let credentials = if url.username().is_empty() {
            None
        } else {
            let username = decode(url.username());
            let password = decode(url.password().unwrap_or_default());
            Some(Credentials { username, password })
        };

        Ok(Self {
            host,
            port,
            credentials,
        })
    }

    /// `host:port` suitable for `TcpStream::connect`.
    pub fn authority(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

fn decode(component: &str) -> String {
    // userinfo keeps '+' and '&' literal, form decoding would not
    let escaped = component.replace('+', "%2B").replace('&', "%26");
    url::form_urlencoded::parse(format!("v={}", escaped).as_bytes())
        .next()
        .map(|(_, v)| v.into_owned())
        .unwrap_or_default()
}

/// Immutable runtime configuration, resolved once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: String,
    pub upstream: Upstream,
    pub connect_timeout: Option<Duration>,
    pub idle_timeout: Option<Duration>,
    pub verbose: bool,
}

impl Config {
    pub fn from_args(args: Args) -> Result<Self, ConfigError> {
        Ok(Self {
            listen_addr: args.laddr,
            upstream: Upstream::parse(&args.raddr)?,
            connect_timeout: args.connect_timeout.map(Duration::from_secs),
            idle_timeout: args.idle_timeout.map(Duration::from_secs),
            verbose: args.verbose,
        })
    }
}
