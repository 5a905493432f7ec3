//! SOCKS4/4A and SOCKS5 greeters: parse the client's CONNECT request off
//! the wire and encode the final reply once the destination has been
//! dialed (or has failed to dial). Byte layout follows RFC 1928 /
//! the de-facto SOCKS4 spec, matched against
//! `original_source/client.py`'s `BaseSessoin.negotiate`/`reply`.

use std::net::{Ipv4Addr, Ipv6Addr};

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

#[derive(Debug, Error)]
pub enum SocksError {
    #[error("unsupported SOCKS version")]
    UnsupportedVersion,
    #[error("no acceptable authentication method")]
    NoAcceptableAuth,
    #[error("unsupported command (only CONNECT is implemented)")]
    UnsupportedCommand,
    #[error("unsupported address type")]
    UnsupportedAddressType,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub struct TargetRequest {
    pub host: String,
    pub port: u16,
}

// ---- SOCKS5 --------------------------------------------------------------

const SOCKS5_ATYP_IPV4: u8 = 0x01;
const SOCKS5_ATYP_DOMAIN: u8 = 0x03;
const SOCKS5_ATYP_IPV6: u8 = 0x04;

/// Negotiate the no-auth method and read the CONNECT request. The
/// version byte has already been peeked by the caller but not consumed.
pub async fn negotiate_socks5(stream: &mut TcpStream) -> Result<TargetRequest, SocksError> {
    let mut head = [0u8; 2];
    stream.read_exact(&mut head).await?;
    let (ver, nmethods) = (head[0], head[1]);
    if ver != 0x05 {
        stream.write_all(&[0x05, 0xff]).await?;
        return Err(SocksError::UnsupportedVersion);
    }

    let mut methods = vec![0u8; nmethods as usize];
    stream.read_exact(&mut methods).await?;
    if !methods.contains(&0x00) {
        stream.write_all(&[0x05, 0xff]).await?;
        return Err(SocksError::NoAcceptableAuth);
    }
    stream.write_all(&[0x05, 0x00]).await?;

    let mut req_head = [0u8; 4];
    stream.read_exact(&mut req_head).await?;
    let (ver, cmd, _rsv, atyp) = (req_head[0], req_head[1], req_head[2], req_head[3]);
    if ver != 0x05 {
        stream.write_all(&[0x05, 0x01, 0x00]).await?;
        return Err(SocksError::UnsupportedVersion);
    }
    if cmd != 0x01 {
        stream.write_all(&[0x05, 0x07, 0x00]).await?;
        return Err(SocksError::UnsupportedCommand);
    }

    let host = match atyp {
        SOCKS5_ATYP_IPV4 => {
            let mut b = [0u8; 4];
            stream.read_exact(&mut b).await?;
            Ipv4Addr::from(b).to_string()
        }
        SOCKS5_ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut name = vec![0u8; len[0] as usize];
            stream.read_exact(&mut name).await?;
            String::from_utf8(name).map_err(|_| SocksError::UnsupportedAddressType)?
        }
        SOCKS5_ATYP_IPV6 => {
            let mut b = [0u8; 16];
            stream.read_exact(&mut b).await?;
            Ipv6Addr::from(b).to_string()
        }
        _ => {
            stream.write_all(&[0x05, 0x08, 0x00]).await?;
            return Err(SocksError::UnsupportedAddressType);
        }
    };

    let mut port_bytes = [0u8; 2];
    stream.read_exact(&mut port_bytes).await?;
    let port = u16::from_be_bytes(port_bytes);

    Ok(TargetRequest { host, port })
}

/// `05 00 00` followed by the echoed address, per spec §4.3 — the
/// address the client originally asked for, not necessarily the
/// resolved socket we actually dialed.
pub async fn reply_socks5_success(stream: &mut TcpStream, host: &str, port: u16) -> std::io::Result<()> {
    let mut reply = vec![0x05, 0x00, 0x00];
    if let Ok(v4) = host.parse::<std::net::Ipv4Addr>() {
        reply.push(SOCKS5_ATYP_IPV4);
        reply.extend_from_slice(&v4.octets());
    } else if let Ok(v6) = host.parse::<Ipv6Addr>() {
        reply.push(SOCKS5_ATYP_IPV6);
        reply.extend_from_slice(&v6.octets());
    } else {
        reply.push(SOCKS5_ATYP_DOMAIN);
        reply.push(host.len() as u8);
        reply.extend_from_slice(host.as_bytes());
    }
    reply.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&reply).await
}

/// General SOCKS server failure (`REP=0x01`), echoing a zero address
/// since no real bind address exists on a failed dial.
pub async fn reply_socks5_failure(stream: &mut TcpStream, rep: u8) -> std::io::Result<()> {
    let reply = [0x05, rep, 0x00, SOCKS5_ATYP_IPV4, 0, 0, 0, 0, 0, 0];
    stream.write_all(&reply).await
}

pub const SOCKS5_GENERAL_FAILURE: u8 = 0x01;

// ---- SOCKS4 / SOCKS4A -----------------------------------------------------

/// Negotiate a SOCKS4/4A CONNECT request. SOCKS4A is detected when the
/// IP field is `0.0.0.x` (x != 0): the hostname follows the NUL-terminated
/// USERID, itself NUL-terminated.
pub async fn negotiate_socks4(stream: &mut TcpStream) -> Result<TargetRequest, SocksError> {
    let mut head = [0u8; 8];
    stream.read_exact(&mut head).await?;
    let (ver, cmd) = (head[0], head[1]);
    if ver != 0x04 {
        reply_socks4(stream, false, 0, [0, 0, 0, 0]).await?;
        return Err(SocksError::UnsupportedVersion);
    }
    if cmd != 0x01 {
        reply_socks4(stream, false, 0, [0, 0, 0, 0]).await?;
        return Err(SocksError::UnsupportedCommand);
    }
    let port = u16::from_be_bytes([head[2], head[3]]);
    let ip_octets = [head[4], head[5], head[6], head[7]];

    read_nul_terminated(stream).await?; // USERID, unused

    let is_socks4a = ip_octets[0] == 0 && ip_octets[1] == 0 && ip_octets[2] == 0 && ip_octets[3] != 0;
    let host = if is_socks4a {
        let name = read_nul_terminated(stream).await?;
        String::from_utf8(name).map_err(|_| SocksError::UnsupportedAddressType)?
    } else {
        Ipv4Addr::from(ip_octets).to_string()
    };

    Ok(TargetRequest { host, port })
}

async fn read_nul_terminated(stream: &mut TcpStream) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        stream.read_exact(&mut byte).await?;
        if byte[0] == 0 {
            break;
        }
        out.push(byte[0]);
    }
    Ok(out)
}

/// `\x00\x90` on success, `\x00\x91` on failure, echoing the address
/// block (port + IPv4 octets) from the original request.
pub async fn reply_socks4(
    stream: &mut TcpStream,
    success: bool,
    port: u16,
    ip_octets: [u8; 4],
) -> std::io::Result<()> {
    let cd = if success { 0x5a } else { 0x5b };
    let mut reply = vec![0x00, cd];
    reply.extend_from_slice(&port.to_be_bytes());
    reply.extend_from_slice(&ip_octets);
    stream.write_all(&reply).await
}

/// Encode a resolved-or-echoed host as the IPv4 octets a SOCKS4 reply
/// needs. SOCKS4 has no domain-name reply encoding, so a non-IPv4 host
/// (SOCKS4A) falls back to the all-zero sentinel.
pub fn socks4_reply_octets(host: &str) -> [u8; 4] {
    host.parse::<Ipv4Addr>().map(|v4| v4.octets()).unwrap_or([0, 0, 0, 0])
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn loopback_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn socks5_rejects_non_noauth_methods() {
        let (mut client, mut server) = loopback_pair().await;
        client.write_all(&[0x05, 0x01, 0x02]).await.unwrap();
        let err = negotiate_socks5(&mut server).await.unwrap_err();
        assert!(matches!(err, SocksError::NoAcceptableAuth));
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0xff]);
    }

    #[tokio::test]
    async fn socks4a_extracts_trailing_hostname() {
        let (mut client, mut server) = loopback_pair().await;
        let mut req = vec![0x04, 0x01, 0x00, 0x50, 0, 0, 0, 1];
        req.extend_from_slice(b"user\0");
        req.extend_from_slice(b"example.com\0");
        client.write_all(&req).await.unwrap();
        let parsed = negotiate_socks4(&mut server).await.unwrap();
        assert_eq!(parsed.host, "example.com");
        assert_eq!(parsed.port, 80);
    }
}
