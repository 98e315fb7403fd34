use std::{
    fmt,
    io::{self, ErrorKind},
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6},
};

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub use self::consts::{
    SOCKS5_AUTH_METHOD_NONE, SOCKS5_AUTH_METHOD_NOT_ACCEPTABLE, SOCKS5_AUTH_METHOD_PASSWORD,
};

mod consts {
    pub const SOCKS5_VERSION: u8 = 0x05;
    pub const SOCKS5_PASSWORD_AUTH_VERSION: u8 = 0x01;

    pub const SOCKS5_AUTH_METHOD_NONE: u8 = 0x00;
    pub const SOCKS5_AUTH_METHOD_PASSWORD: u8 = 0x02;
    pub const SOCKS5_AUTH_METHOD_NOT_ACCEPTABLE: u8 = 0xff;

    pub const SOCKS5_CMD_TCP_CONNECT: u8 = 0x01;
    pub const SOCKS5_CMD_TCP_BIND: u8 = 0x02;
    pub const SOCKS5_CMD_UDP_ASSOCIATE: u8 = 0x03;

    pub const SOCKS5_ADDR_TYPE_IPV4: u8 = 0x01;
    pub const SOCKS5_ADDR_TYPE_DOMAIN_NAME: u8 = 0x03;
    pub const SOCKS5_ADDR_TYPE_IPV6: u8 = 0x04;

    pub const SOCKS5_REPLY_SUCCEEDED: u8 = 0x00;
    pub const SOCKS5_REPLY_GENERAL_FAILURE: u8 = 0x01;
    pub const SOCKS5_REPLY_CONNECTION_NOT_ALLOWED: u8 = 0x02;
    pub const SOCKS5_REPLY_NETWORK_UNREACHABLE: u8 = 0x03;
    pub const SOCKS5_REPLY_HOST_UNREACHABLE: u8 = 0x04;
    pub const SOCKS5_REPLY_CONNECTION_REFUSED: u8 = 0x05;
    pub const SOCKS5_REPLY_TTL_EXPIRED: u8 = 0x06;
    pub const SOCKS5_REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;
    pub const SOCKS5_REPLY_ADDRESS_TYPE_NOT_SUPPORTED: u8 = 0x08;
}

/// Longest domain name the address encoding can carry.
pub const MAX_DOMAIN_LEN: usize = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    TcpConnect,
    TcpBind,
    UdpAssociate,
}

impl Command {
    #[inline]
    pub fn as_u8(self) -> u8 {
        match self {
            Self::TcpConnect => consts::SOCKS5_CMD_TCP_CONNECT,
            Self::TcpBind => consts::SOCKS5_CMD_TCP_BIND,
            Self::UdpAssociate => consts::SOCKS5_CMD_UDP_ASSOCIATE,
        }
    }

    #[inline]
    pub fn from_u8(val: u8) -> Option<Self> {
        match val {
            consts::SOCKS5_CMD_TCP_CONNECT => Some(Self::TcpConnect),
            consts::SOCKS5_CMD_TCP_BIND => Some(Self::TcpBind),
            consts::SOCKS5_CMD_UDP_ASSOCIATE => Some(Self::UdpAssociate),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    Succeeded,
    GeneralFailure,
    ConnectionNotAllowed,
    NetworkUnreachable,
    HostUnreachable,
    ConnectionRefused,
    TtlExpired,
    CommandNotSupported,
    AddressTypeNotSupported,

    OtherReply(u8),
}

impl Reply {
    #[inline]
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Succeeded => consts::SOCKS5_REPLY_SUCCEEDED,
            Self::GeneralFailure => consts::SOCKS5_REPLY_GENERAL_FAILURE,
            Self::ConnectionNotAllowed => consts::SOCKS5_REPLY_CONNECTION_NOT_ALLOWED,
            Self::NetworkUnreachable => consts::SOCKS5_REPLY_NETWORK_UNREACHABLE,
            Self::HostUnreachable => consts::SOCKS5_REPLY_HOST_UNREACHABLE,
            Self::ConnectionRefused => consts::SOCKS5_REPLY_CONNECTION_REFUSED,
            Self::TtlExpired => consts::SOCKS5_REPLY_TTL_EXPIRED,
            Self::CommandNotSupported => consts::SOCKS5_REPLY_COMMAND_NOT_SUPPORTED,
            Self::AddressTypeNotSupported => consts::SOCKS5_REPLY_ADDRESS_TYPE_NOT_SUPPORTED,
            Self::OtherReply(c) => c,
        }
    }

    #[inline]
    pub fn from_u8(code: u8) -> Self {
        match code {
            consts::SOCKS5_REPLY_SUCCEEDED => Self::Succeeded,
            consts::SOCKS5_REPLY_GENERAL_FAILURE => Self::GeneralFailure,
            consts::SOCKS5_REPLY_CONNECTION_NOT_ALLOWED => Self::ConnectionNotAllowed,
            consts::SOCKS5_REPLY_NETWORK_UNREACHABLE => Self::NetworkUnreachable,
            consts::SOCKS5_REPLY_HOST_UNREACHABLE => Self::HostUnreachable,
            consts::SOCKS5_REPLY_CONNECTION_REFUSED => Self::ConnectionRefused,
            consts::SOCKS5_REPLY_TTL_EXPIRED => Self::TtlExpired,
            consts::SOCKS5_REPLY_COMMAND_NOT_SUPPORTED => Self::CommandNotSupported,
            consts::SOCKS5_REPLY_ADDRESS_TYPE_NOT_SUPPORTED => Self::AddressTypeNotSupported,
            _ => Self::OtherReply(code),
        }
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::Succeeded => write!(f, "succeeded"),
            Self::GeneralFailure => write!(f, "general failure"),
            Self::ConnectionNotAllowed => write!(f, "connection not allowed by ruleset"),
            Self::NetworkUnreachable => write!(f, "network unreachable"),
            Self::HostUnreachable => write!(f, "host unreachable"),
            Self::ConnectionRefused => write!(f, "connection refused"),
            Self::TtlExpired => write!(f, "TTL expired"),
            Self::CommandNotSupported => write!(f, "command not supported"),
            Self::AddressTypeNotSupported => write!(f, "address type not supported"),
            Self::OtherReply(c) => write!(f, "unknown reply ({:#x})", c),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0}")]
    IoError(#[from] io::Error),
    #[error("address type {0:#x} not supported")]
    AddressTypeNotSupported(u8),
    #[error("address domain name must be UTF-8 encoding")]
    AddressDomainInvalidEncoding,
    #[error("domain name of {0} bytes exceeds 255")]
    DomainNameTooLong(usize),
    #[error("unsupported socks version {0:#x}")]
    UnsupportedSocksVersion(u8),
    #[error("unsupported command {0:#x}")]
    UnsupportedCommand(u8),
    #[error("proxy offered unrequested auth method {0:#x}")]
    UnexpectedAuthMethod(u8),
    #[error("no acceptable auth method")]
    NoAcceptableAuthMethod,
    #[error("unsupported password auth version {0:#x}")]
    UnsupportedAuthVersion(u8),
    #[error("username/password rejected (status {0:#x})")]
    AuthenticationFailed(u8),
    #[error("credential of {0} bytes exceeds 255")]
    CredentialTooLong(usize),
    #[error("{0}")]
    Reply(Reply),
}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::IoError(e) => e,
            e => io::Error::new(ErrorKind::Other, e),
        }
    }
}

#[derive(Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum Address {
    SocketAddress(SocketAddr),
    DomainNameAddress(String, u16),
}

impl Address {
    /// Builds an address from a URI host, which may be a bracketed IPv6
    /// literal, an IPv4 literal or a domain name.
    pub fn from_host(host: &str, port: u16) -> Address {
        let bare = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);

        match bare.parse::<IpAddr>() {
            Ok(ip) => Address::SocketAddress(SocketAddr::new(ip, port)),
            Err(_) => Address::DomainNameAddress(host.to_owned(), port),
        }
    }

    pub async fn read_from<R>(stream: &mut R) -> Result<Address, Error>
    where
        R: AsyncRead + Unpin,
    {
        let atyp = stream.read_u8().await?;
        match atyp {
            consts::SOCKS5_ADDR_TYPE_IPV4 => {
                let ip = Ipv4Addr::from(stream.read_u32().await?);
                let port = stream.read_u16().await?;
                Ok(Address::SocketAddress(SocketAddr::V4(SocketAddrV4::new(
                    ip, port,
                ))))
            }
            consts::SOCKS5_ADDR_TYPE_IPV6 => {
                let ip = Ipv6Addr::from(stream.read_u128().await?);
                let port = stream.read_u16().await?;
                Ok(Address::SocketAddress(SocketAddr::V6(SocketAddrV6::new(
                    ip, port, 0, 0,
                ))))
            }
            consts::SOCKS5_ADDR_TYPE_DOMAIN_NAME => {
                let len = stream.read_u8().await? as usize;
                let mut domain_buf = vec![0; len];

                stream.read_exact(&mut domain_buf).await?;
                let domain = match String::from_utf8(domain_buf) {
                    Ok(s) => s,
                    Err(_) => return Err(Error::AddressDomainInvalidEncoding),
                };
                let port = stream.read_u16().await?;
                Ok(Address::DomainNameAddress(domain, port))
            }
            _ => Err(Error::AddressTypeNotSupported(atyp)),
        }
    }

    #[inline]
    pub fn write_to_buf<B: BufMut>(&self, buf: &mut B) {
        write_address(self, buf);
    }

    #[inline]
    pub fn serialized_len(&self) -> usize {
        get_addr_len(self)
    }

    /// Fails when the address cannot be put on the wire.
    pub fn check_encodable(&self) -> Result<(), Error> {
        match self {
            Self::DomainNameAddress(domain, _) if domain.len() > MAX_DOMAIN_LEN => {
                Err(Error::DomainNameTooLong(domain.len()))
            }
            _ => Ok(()),
        }
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::SocketAddress(addr) => write!(f, "{}", addr),
            Address::DomainNameAddress(domain, port) => write!(f, "{}:{}", domain, port),
        }
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Self::SocketAddress(addr)
    }
}

fn write_ipv4_addr<B: BufMut>(addr: &SocketAddrV4, buf: &mut B) {
    buf.put_u8(consts::SOCKS5_ADDR_TYPE_IPV4);
    buf.put_slice(&addr.ip().octets());
    buf.put_u16(addr.port());
}

fn write_ipv6_addr<B: BufMut>(addr: &SocketAddrV6, buf: &mut B) {
    buf.put_u8(consts::SOCKS5_ADDR_TYPE_IPV6);
    buf.put_slice(&addr.ip().octets());
    buf.put_u16(addr.port());
}

fn write_domain_addr<B: BufMut>(domain: &str, port: u16, buf: &mut B) {
    assert!(
        domain.len() <= MAX_DOMAIN_LEN,
        "domain name length must be smaller than 256"
    );
    let len = domain.len() as u8;

    buf.put_u8(consts::SOCKS5_ADDR_TYPE_DOMAIN_NAME);
    buf.put_u8(len);
    buf.put_slice(domain.as_bytes());
    buf.put_u16(port);
}

fn write_address<B: BufMut>(addr: &Address, buf: &mut B) {
    match addr {
        Address::SocketAddress(SocketAddr::V4(addr)) => write_ipv4_addr(addr, buf),
        Address::SocketAddress(SocketAddr::V6(addr)) => write_ipv6_addr(addr, buf),
        Address::DomainNameAddress(domain, port) => write_domain_addr(domain, *port, buf),
    }
}

#[inline]
fn get_addr_len(atyp: &Address) -> usize {
    match atyp {
        Address::SocketAddress(SocketAddr::V4(_)) => 1 + 4 + 2,
        Address::SocketAddress(SocketAddr::V6(_)) => 1 + 16 + 2,
        Address::DomainNameAddress(domain, _) => 1 + 1 + domain.len() + 2,
    }
}

async fn write_buffered<W, F>(w: &mut W, len: usize, fill: F) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    F: FnOnce(&mut BytesMut),
{
    let mut buf = BytesMut::with_capacity(len);
    fill(&mut buf);
    w.write_all(&buf).await
}

/// `VER | CMD | RSV | ATYP | DST.ADDR | DST.PORT`
#[derive(Debug, Clone)]
pub struct TcpRequestHeader {
    pub command: Command,
    pub address: Address,
}

impl TcpRequestHeader {
    pub fn new(command: Command, address: Address) -> Self {
        Self { command, address }
    }

    pub async fn read_from<R>(r: &mut R) -> Result<Self, Error>
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = [0; 3];
        r.read_exact(&mut buf).await?;

        let ver = buf[0];
        if ver != consts::SOCKS5_VERSION {
            return Err(Error::UnsupportedSocksVersion(ver));
        }

        let cmd = buf[1];
        let command = match Command::from_u8(cmd) {
            Some(cmd) => cmd,
            None => return Err(Error::UnsupportedCommand(cmd)),
        };

        let address = Address::read_from(r).await?;
        Ok(Self { command, address })
    }

    pub async fn write_to<W>(&self, w: &mut W) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        write_buffered(w, self.serialized_len(), |buf| self.write_to_buf(buf)).await
    }

    pub fn write_to_buf<B: BufMut>(&self, buf: &mut B) {
        let Self { command, address } = self;
        buf.put_slice(&[consts::SOCKS5_VERSION, command.as_u8(), 0x00]);
        address.write_to_buf(buf);
    }

    #[inline]
    pub fn serialized_len(&self) -> usize {
        self.address.serialized_len() + 3
    }
}

/// `VER | REP | RSV | ATYP | BND.ADDR | BND.PORT`
#[derive(Debug, Clone)]
pub struct TcpResponseHeader {
    pub reply: Reply,
    pub address: Address,
}

impl TcpResponseHeader {
    pub fn new(reply: Reply, address: Address) -> Self {
        Self { reply, address }
    }

    pub async fn read_from<R>(r: &mut R) -> Result<Self, Error>
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = [0; 3];
        r.read_exact(&mut buf).await?;

        let ver = buf[0];
        if ver != consts::SOCKS5_VERSION {
            return Err(Error::UnsupportedSocksVersion(ver));
        }
        let reply_code = buf[1];
        let address = Address::read_from(r).await?;

        Ok(Self {
            reply: Reply::from_u8(reply_code),
            address,
        })
    }

    pub async fn write_to<W>(&self, w: &mut W) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        write_buffered(w, self.serialized_len(), |buf| self.write_to_buf(buf)).await
    }

    pub fn write_to_buf<B: BufMut>(&self, buf: &mut B) {
        let Self { reply, address } = self;
        buf.put_slice(&[consts::SOCKS5_VERSION, reply.as_u8(), 0x00]);
        address.write_to_buf(buf);
    }

    #[inline]
    pub fn serialized_len(&self) -> usize {
        self.address.serialized_len() + 3
    }
}

/// `VER | NMETHODS | METHODS`
#[derive(Debug, Clone)]
pub struct HandshakeRequest {
    pub methods: Vec<u8>,
}

impl HandshakeRequest {
    pub fn new(methods: Vec<u8>) -> Self {
        Self { methods }
    }

    pub async fn read_from<R>(r: &mut R) -> Result<Self, Error>
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = [0; 2];
        r.read_exact(&mut buf).await?;

        let ver = buf[0];
        if ver != consts::SOCKS5_VERSION {
            return Err(Error::UnsupportedSocksVersion(ver));
        }
        let nmet = buf[1] as usize;
        let mut methods = vec![0; nmet];
        r.read_exact(&mut methods).await?;
        Ok(Self { methods })
    }

    pub async fn write_to<W>(&self, w: &mut W) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        write_buffered(w, self.serialized_len(), |buf| self.write_to_buf(buf)).await
    }

    pub fn write_to_buf<B: BufMut>(&self, buf: &mut B) {
        let nmet = self.methods.len() as u8;
        buf.put_slice(&[consts::SOCKS5_VERSION, nmet]);
        buf.put_slice(&self.methods);
    }

    pub fn serialized_len(&self) -> usize {
        self.methods.len() + 2
    }
}

/// `VER | METHOD`
#[derive(Debug, Clone, Copy)]
pub struct HandshakeResponse {
    pub chosen_method: u8,
}

impl HandshakeResponse {
    pub fn new(chosen_method: u8) -> Self {
        Self { chosen_method }
    }

    pub async fn read_from<R>(r: &mut R) -> Result<Self, Error>
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = [0; 2];
        r.read_exact(&mut buf).await?;

        let ver = buf[0];
        if ver != consts::SOCKS5_VERSION {
            return Err(Error::UnsupportedSocksVersion(ver));
        }

        Ok(Self {
            chosen_method: buf[1],
        })
    }

    pub async fn write_to<W>(&self, w: &mut W) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        w.write_all(&[consts::SOCKS5_VERSION, self.chosen_method])
            .await
    }
}

/// RFC 1929 `VER | ULEN | UNAME | PLEN | PASSWD`
#[derive(Debug, Clone)]
pub struct PasswordAuthRequest {
    pub username: Vec<u8>,
    pub password: Vec<u8>,
}

impl PasswordAuthRequest {
    pub fn new(username: &str, password: &str) -> Result<Self, Error> {
        for field in [username, password] {
            if field.len() > 255 {
                return Err(Error::CredentialTooLong(field.len()));
            }
        }
        Ok(Self {
            username: username.as_bytes().to_vec(),
            password: password.as_bytes().to_vec(),
        })
    }

    pub async fn read_from<R>(r: &mut R) -> Result<Self, Error>
    where
        R: AsyncRead + Unpin,
    {
        let ver = r.read_u8().await?;
        if ver != consts::SOCKS5_PASSWORD_AUTH_VERSION {
            return Err(Error::UnsupportedAuthVersion(ver));
        }
        let ulen = r.read_u8().await? as usize;
        let mut username = vec![0; ulen];
        r.read_exact(&mut username).await?;
        let plen = r.read_u8().await? as usize;
        let mut password = vec![0; plen];
        r.read_exact(&mut password).await?;
        Ok(Self { username, password })
    }

    pub async fn write_to<W>(&self, w: &mut W) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        write_buffered(w, self.serialized_len(), |buf| self.write_to_buf(buf)).await
    }

    pub fn write_to_buf<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(consts::SOCKS5_PASSWORD_AUTH_VERSION);
        buf.put_u8(self.username.len() as u8);
        buf.put_slice(&self.username);
        buf.put_u8(self.password.len() as u8);
        buf.put_slice(&self.password);
    }

    pub fn serialized_len(&self) -> usize {
        3 + self.username.len() + self.password.len()
    }
}

/// RFC 1929 `VER | STATUS`, zero status means success.
#[derive(Debug, Clone, Copy)]
pub struct PasswordAuthResponse {
    pub status: u8,
}

impl PasswordAuthResponse {
    pub fn new(status: u8) -> Self {
        Self { status }
    }

    pub async fn read_from<R>(r: &mut R) -> Result<Self, Error>
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = [0; 2];
        r.read_exact(&mut buf).await?;

        if buf[0] != consts::SOCKS5_PASSWORD_AUTH_VERSION {
            return Err(Error::UnsupportedAuthVersion(buf[0]));
        }
        Ok(Self { status: buf[1] })
    }

    pub async fn write_to<W>(&self, w: &mut W) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        w.write_all(&[consts::SOCKS5_PASSWORD_AUTH_VERSION, self.status])
            .await
    }
}
