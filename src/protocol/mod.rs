mod shadowsocks;
mod trojan;
mod vless;

use std::fmt;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr};

use bytes::Bytes;
use thiserror::Error;

use crate::ext::ByteReader;

/// Which tunneling protocol the opening frame speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolKind {
    Trojan,
    Vless,
    Shadowsocks,
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Trojan => write!(f, "trojan"),
            Self::Vless => write!(f, "vless"),
            Self::Shadowsocks => write!(f, "shadowsocks"),
        }
    }
}

/// Requested transport. UDP is only ever honored for DNS (port 53).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Tcp,
    Udp,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// Reserved: the sniffer currently treats Shadowsocks as a catch-all.
    #[error("no protocol matched the opening frame")]
    UnknownProtocol,
    #[error("invalid address type {0:#04x}")]
    InvalidAddressType(u8),
    #[error("empty address (type {0:#04x})")]
    EmptyAddress(u8),
    #[error("unsupported command {0:#04x}")]
    UnsupportedCommand(u8),
    #[error("request header truncated")]
    Truncated,
    #[error("udp tunneling is limited to dns, got port {0}")]
    UdpNotAllowed(u16),
}

impl From<ProtocolError> for io::Error {
    fn from(err: ProtocolError) -> Self {
        let kind = match err {
            ProtocolError::UdpNotAllowed(_) => io::ErrorKind::InvalidInput,
            _ => io::ErrorKind::InvalidData,
        };
        io::Error::new(kind, err.to_string())
    }
}

/// Destination carried by the request header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteAddr {
    Ipv4(Ipv4Addr),
    Ipv6(Ipv6Addr),
    Domain(String),
}

/// Routing decision decoded from the first client frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteInfo {
    pub protocol: ProtocolKind,
    pub addr: RemoteAddr,
    pub port: u16,
    pub network: Network,
    /// Payload bytes after the header; the first thing the remote must see.
    pub residual: Bytes,
    /// Sent back to the client as a prefix of the first remote frame.
    pub prelude: Option<[u8; 2]>,
}

impl RouteInfo {
    /// Connect string handed to the socket layer. IPv6 keeps the full
    /// eight-group form; VLESS and Trojan bracket it, Shadowsocks does not.
    pub fn host(&self) -> String {
        match &self.addr {
            RemoteAddr::Ipv4(ip) => ip.to_string(),
            RemoteAddr::Domain(name) => name.clone(),
            RemoteAddr::Ipv6(ip) => {
                let groups = render_ipv6(ip);
                match self.protocol {
                    ProtocolKind::Shadowsocks => groups,
                    _ => format!("[{groups}]"),
                }
            }
        }
    }
}

// `Ipv6Addr`'s Display zero-compresses ("::"); clients expect the
// uncompressed group form here.
fn render_ipv6(ip: &Ipv6Addr) -> String {
    let g = ip.segments();
    format!(
        "{:x}:{:x}:{:x}:{:x}:{:x}:{:x}:{:x}:{:x}",
        g[0], g[1], g[2], g[3], g[4], g[5], g[6], g[7]
    )
}

/// Classifies the opening frame. Trojan frames carry `CR LF cmd atyp` right
/// after the fixed-width password hash; VLESS frames carry a UUIDv4 at
/// offset 1; Shadowsocks has no magic and is the fallback.
pub fn sniff(frame: &[u8]) -> ProtocolKind {
    if frame.len() >= 62
        && frame[56] == 0x0d
        && frame[57] == 0x0a
        && matches!(frame[58], 0x01 | 0x03 | 0x7f)
        && matches!(frame[59], 0x01 | 0x03 | 0x04)
    {
        return ProtocolKind::Trojan;
    }
    if frame.len() >= 17 && is_uuid_v4(&frame[1..17]) {
        return ProtocolKind::Vless;
    }
    ProtocolKind::Shadowsocks
}

// Version nibble 4 and RFC 4122 variant, the same shape the textual
// xxxxxxxx-xxxx-4xxx-[89ab]xxx-xxxxxxxxxxxx form encodes.
fn is_uuid_v4(id: &[u8]) -> bool {
    id[6] >> 4 == 0x4 && matches!(id[8] >> 4, 0x8..=0xb)
}

/// Sniffs the frame and decodes the matching request header.
pub fn parse(frame: Bytes) -> Result<RouteInfo, ProtocolError> {
    match sniff(&frame) {
        ProtocolKind::Trojan => trojan::decode(frame),
        ProtocolKind::Vless => vless::decode(frame),
        ProtocolKind::Shadowsocks => shadowsocks::decode(frame),
    }
}

/// Per-protocol address-type tag values.
pub(crate) struct AddrTags {
    pub ipv4: u8,
    pub domain: u8,
    pub ipv6: u8,
}

/// Shared address sub-parser: one tag byte, then the tag-specific body.
/// A zero-length domain is rejected even though its tag was valid.
pub(crate) fn read_addr(
    r: &mut ByteReader<'_>,
    tags: &AddrTags,
) -> Result<RemoteAddr, ProtocolError> {
    let atyp = r.read_u8()?;
    if atyp == tags.ipv4 {
        Ok(RemoteAddr::Ipv4(Ipv4Addr::from(r.read_array::<4>()?)))
    } else if atyp == tags.domain {
        let len = r.read_u8()? as usize;
        let name = r.read_string(len)?;
        if name.is_empty() {
            return Err(ProtocolError::EmptyAddress(atyp));
        }
        Ok(RemoteAddr::Domain(name))
    } else if atyp == tags.ipv6 {
        Ok(RemoteAddr::Ipv6(Ipv6Addr::from(r.read_array::<16>()?)))
    } else {
        Err(ProtocolError::InvalidAddressType(atyp))
    }
}
