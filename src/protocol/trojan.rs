//! Trojan request header: a 56-byte password hash and CRLF, then
//! `cmd(1) | atyp(1) | addr | port(2) | CRLF | payload`. The hash is not
//! checked against any credential; the sniffer's marker test already
//! validated the CRLF and the cmd/atyp bytes.

use bytes::Bytes;

use super::{read_addr, AddrTags, Network, ProtocolError, ProtocolKind, RouteInfo};
use crate::ext::ByteReader;

/// Password hash plus its CRLF terminator.
const PREAMBLE_LEN: usize = 58;

const CMD_TCP: u8 = 0x01;
const CMD_UDP: u8 = 0x03;

const ADDR_TAGS: AddrTags = AddrTags {
    ipv4: 0x01,
    domain: 0x03,
    ipv6: 0x04,
};

pub(super) fn decode(frame: Bytes) -> Result<RouteInfo, ProtocolError> {
    // cmd + atyp + port + trailing CRLF is the shortest possible tail
    if frame.len() < PREAMBLE_LEN + 6 {
        return Err(ProtocolError::Truncated);
    }
    let mut r = ByteReader::new(&frame[PREAMBLE_LEN..]);

    let network = match r.read_u8()? {
        CMD_TCP => Network::Tcp,
        CMD_UDP => Network::Udp,
        other => return Err(ProtocolError::UnsupportedCommand(other)),
    };
    let addr = read_addr(&mut r, &ADDR_TAGS)?;
    let port = r.read_u16()?;

    // skip the CRLF before the payload; tolerate a frame ending inside it
    let start = (PREAMBLE_LEN + r.position() + 2).min(frame.len());
    let residual = frame.slice(start..);
    Ok(RouteInfo {
        protocol: ProtocolKind::Trojan,
        addr,
        port,
        network,
        residual,
        prelude: None,
    })
}
