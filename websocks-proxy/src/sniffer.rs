//! First-byte protocol detection for the single shared listener port.
//!
//! `TcpStream::peek` reads from the kernel's receive buffer without
//! consuming it, so the greeter that runs next sees the byte stream
//! exactly as the client sent it — no internal buffer needs to be
//! spliced back in front of the reader.

use std::io;

use tokio::net::TcpStream;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolKind {
    Socks4,
    Socks5,
    Http,
}

pub async fn sniff(stream: &TcpStream) -> io::Result<ProtocolKind> {
    let mut buf = [0u8; 1];
    let n = stream.peek(&mut buf).await?;
    if n == 0 {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "peer closed before sending"));
    }
    match buf[0] {
        0x04 => Ok(ProtocolKind::Socks4),
        0x05 => Ok(ProtocolKind::Socks5),
        b if b.is_ascii_uppercase() => Ok(ProtocolKind::Http),
        other => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unrecognized protocol byte 0x{other:02x}"),
        )),
    }
}
