//! SOCKS4, SOCKS4a, and SOCKS5 wire framing.
//!
//! Only what this proxy needs is implemented: the client greeting/request
//! read side and the reply write side, CONNECT only. BIND and UDP ASSOCIATE
//! are not represented at all.

use crate::error::ProxyError;
use std::net::Ipv4Addr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// SOCKS5 auth method octet values (RFC 1928 §3).
pub mod auth_method {
    pub const NO_AUTHENTICATION: u8 = 0x00;
    pub const GSSAPI: u8 = 0x01;
    pub const USER_PASS: u8 = 0x02;
    pub const UNACCEPTABLE: u8 = 0xFF;
}

/// SOCKS5 REP field values (RFC 1928 §6). Every refusal path sends
/// `CONNECTION_REFUSED` regardless of cause, but the full set is kept for documentation and
/// for plugins that may want to be more precise in the future.
pub mod reply_field {
    pub const SUCCEEDED: u8 = 0x00;
    pub const SOCKS_FAILURE: u8 = 0x01;
    pub const NOT_ALLOWED: u8 = 0x02;
    pub const NETWORK_UNREACHABLE: u8 = 0x03;
    pub const HOST_UNREACHABLE: u8 = 0x04;
    pub const CONNECTION_REFUSED: u8 = 0x05;
    pub const TTL_EXPIRED: u8 = 0x06;
    pub const COMMAND_NOT_SUPPORTED: u8 = 0x07;
    pub const ADDRESS_NOT_SUPPORTED: u8 = 0x08;
}

/// SOCKS5 ATYP field values.
pub mod atyp {
    pub const IPV4: u8 = 0x01;
    pub const DOMAINNAME: u8 = 0x03;
    pub const IPV6: u8 = 0x04;
}

const CMD_CONNECT: u8 = 0x01;

/// A parsed request target, host side only — not yet resolved to an IP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddr {
    Ipv4(Ipv4Addr),
    Domain(String),
}

impl TargetAddr {
    pub fn host_string(&self) -> String {
        match self {
            TargetAddr::Ipv4(addr) => addr.to_string(),
            TargetAddr::Domain(name) => name.clone(),
        }
    }
}

/// Which SOCKS version this connection is speaking, decided by the first
/// byte the client sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocksVersion {
    V4,
    V5,
}

#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub version: SocksVersion,
    pub target: TargetAddr,
    pub port: u16,
}

/// Reads the first byte of a new connection and returns the SOCKS version,
/// or `UnsupportedVersion` for anything else.
pub async fn read_version<R: AsyncRead + Unpin>(stream: &mut R) -> Result<u8, ProxyError> {
    let mut ver = [0u8; 1];
    stream.read_exact(&mut ver).await?;
    Ok(ver[0])
}

/// Reads the remainder of a SOCKS5 greeting (NMETHODS + METHODS) after the
/// version byte has already been consumed by [`read_version`].
pub async fn read_socks5_greeting<R: AsyncRead + Unpin>(
    stream: &mut R,
) -> Result<Vec<u8>, ProxyError> {
    let mut nmethods = [0u8; 1];
    stream.read_exact(&mut nmethods).await?;
    let mut methods = vec![0u8; nmethods[0] as usize];
    stream.read_exact(&mut methods).await?;
    Ok(methods)
}

/// Replies to a SOCKS5 greeting announcing "no authentication required",
/// the only method this proxy ever offers toward the client.
pub async fn write_socks5_greeting_reply<W: AsyncWrite + Unpin>(
    stream: &mut W,
) -> Result<(), ProxyError> {
    stream
        .write_all(&[0x05, auth_method::NO_AUTHENTICATION])
        .await?;
    Ok(())
}

/// Reads a SOCKS5 CONNECT request after the greeting exchange.
pub async fn read_socks5_request<R: AsyncRead + Unpin>(
    stream: &mut R,
) -> Result<ConnectRequest, ProxyError> {
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    let (cmd, _rsv, atyp) = (header[1], header[2], header[3]);

    if cmd != CMD_CONNECT {
        return Err(ProxyError::UnsupportedCommand(cmd));
    }

    let target = match atyp {
        atyp::IPV4 => {
            let mut octets = [0u8; 4];
            stream.read_exact(&mut octets).await?;
            TargetAddr::Ipv4(Ipv4Addr::from(octets))
        }
        atyp::DOMAINNAME => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut name = vec![0u8; len[0] as usize];
            stream.read_exact(&mut name).await?;
            let name = String::from_utf8(name).map_err(|_| ProxyError::BadRequest)?;
            TargetAddr::Domain(name)
        }
        other => return Err(ProxyError::UnsupportedAddressType(other)),
    };

    let mut port_bytes = [0u8; 2];
    stream.read_exact(&mut port_bytes).await?;
    let port = u16::from_be_bytes(port_bytes);

    Ok(ConnectRequest {
        version: SocksVersion::V5,
        target,
        port,
    })
}

/// Writes a SOCKS5 reply. `bind_addr`/`bind_port` are cosmetic (typically
/// the local socket's own address); clients do not act on them for CONNECT.
pub async fn write_socks5_reply<W: AsyncWrite + Unpin>(
    stream: &mut W,
    rep: u8,
    bind_addr: Ipv4Addr,
    bind_port: u16,
) -> Result<(), ProxyError> {
    let mut buf = Vec::with_capacity(10);
    buf.push(0x05);
    buf.push(rep);
    buf.push(0x00); // RSV
    buf.push(atyp::IPV4);
    buf.extend_from_slice(&bind_addr.octets());
    buf.extend_from_slice(&bind_port.to_be_bytes());
    stream.write_all(&buf).await?;
    Ok(())
}

/// Reads a SOCKS4 or SOCKS4a request. The version byte has already been
/// consumed by [`read_version`]. SOCKS4a is detected by the classic
/// `0.0.0.x` address convention (first three octets zero, last non-zero):
/// the real destination follows the null-terminated user ID as a second
/// null-terminated string.
pub async fn read_socks4_request<R: AsyncRead + Unpin>(
    stream: &mut R,
) -> Result<ConnectRequest, ProxyError> {
    let mut header = [0u8; 7]; // CMD(1) + PORT(2) + ADDR(4)
    stream.read_exact(&mut header).await?;
    let cmd = header[0];
    if cmd != CMD_CONNECT {
        return Err(ProxyError::UnsupportedCommand(cmd));
    }
    let port = u16::from_be_bytes([header[1], header[2]]);
    let addr_octets = [header[3], header[4], header[5], header[6]];

    read_null_terminated(stream).await?; // USERID, unused

    let is_socks4a = addr_octets[0] == 0 && addr_octets[1] == 0 && addr_octets[2] == 0 && addr_octets[3] != 0;

    let target = if is_socks4a {
        let domain_bytes = read_null_terminated(stream).await?;
        let name = String::from_utf8(domain_bytes).map_err(|_| ProxyError::BadRequest)?;
        TargetAddr::Domain(name)
    } else {
        TargetAddr::Ipv4(Ipv4Addr::from(addr_octets))
    };

    Ok(ConnectRequest {
        version: SocksVersion::V4,
        target,
        port,
    })
}

async fn read_null_terminated<R: AsyncRead + Unpin>(stream: &mut R) -> Result<Vec<u8>, ProxyError> {
    let mut out = Vec::new();
    loop {
        let mut byte = [0u8; 1];
        stream.read_exact(&mut byte).await?;
        if byte[0] == 0 {
            break;
        }
        out.push(byte[0]);
    }
    Ok(out)
}

/// Writes a SOCKS4 reply. `0x5A` is success (`REQUEST GRANTED`); anything
/// else sends `0x5B` (`REQUEST REJECTED OR FAILED`), matching the reference
/// implementation which never distinguishes failure reasons on the wire.
pub async fn write_socks4_reply<W: AsyncWrite + Unpin>(
    stream: &mut W,
    success: bool,
) -> Result<(), ProxyError> {
    let rep: u8 = if success { 0x5A } else { 0x5B };
    let buf = [0x00, rep, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];
    stream.write_all(&buf).await?;
    Ok(())
}
