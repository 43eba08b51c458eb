//! VLESS request header:
//! `version(1) | uuid(16) | opt_len(1) | opts | cmd(1) | port(2) | atyp(1) | addr`.
//! The response prelude `{version, 0}` is echoed on the first remote frame.

use bytes::Bytes;

use super::{read_addr, AddrTags, Network, ProtocolError, ProtocolKind, RouteInfo};
use crate::ext::ByteReader;

const CMD_TCP: u8 = 0x01;
const CMD_UDP: u8 = 0x02;

const ADDR_TAGS: AddrTags = AddrTags {
    ipv4: 0x01,
    domain: 0x02,
    ipv6: 0x03,
};

pub(super) fn decode(frame: Bytes) -> Result<RouteInfo, ProtocolError> {
    let mut r = ByteReader::new(&frame);

    let version = r.read_u8()?;
    // the uuid is the tunneling credential; not validated here
    r.skip(16)?;
    let opt_len = r.read_u8()? as usize;
    r.skip(opt_len)?;

    let network = match r.read_u8()? {
        CMD_TCP => Network::Tcp,
        CMD_UDP => Network::Udp,
        other => return Err(ProtocolError::UnsupportedCommand(other)),
    };
    let port = r.read_u16()?;
    let addr = read_addr(&mut r, &ADDR_TAGS)?;

    let residual = frame.slice(r.position()..);
    Ok(RouteInfo {
        protocol: ProtocolKind::Vless,
        addr,
        port,
        network,
        residual,
        prelude: Some([version, 0]),
    })
}
