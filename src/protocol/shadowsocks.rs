//! Shadowsocks request header: `atyp(1) | addr | port(2) | payload`.
//! The wire format carries no command byte, so DNS is inferred from the
//! port alone; IPv6 connect strings stay unbracketed.

use bytes::Bytes;

use super::{read_addr, AddrTags, Network, ProtocolError, ProtocolKind, RouteInfo};
use crate::ext::ByteReader;

const DNS_PORT: u16 = 53;

const ADDR_TAGS: AddrTags = AddrTags {
    ipv4: 0x01,
    domain: 0x03,
    ipv6: 0x04,
};

pub(super) fn decode(frame: Bytes) -> Result<RouteInfo, ProtocolError> {
    let mut r = ByteReader::new(&frame);

    let addr = read_addr(&mut r, &ADDR_TAGS)?;
    let port = r.read_u16()?;
    let network = if port == DNS_PORT {
        Network::Udp
    } else {
        Network::Tcp
    };

    let residual = frame.slice(r.position()..);
    Ok(RouteInfo {
        protocol: ProtocolKind::Shadowsocks,
        addr,
        port,
        network,
        residual,
        prelude: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::RemoteAddr;

    #[test]
    fn decodes_ipv4_with_payload() {
        let route =
            decode(Bytes::from_static(&[0x01, 10, 0, 0, 1, 0x00, 0x50, b'H', b'I'])).unwrap();
        assert_eq!(route.protocol, ProtocolKind::Shadowsocks);
        assert_eq!(route.host(), "10.0.0.1");
        assert_eq!(route.port, 80);
        assert_eq!(route.network, Network::Tcp);
        assert_eq!(route.residual.as_ref(), b"HI");
        assert_eq!(route.prelude, None);
    }

    #[test]
    fn port_53_is_treated_as_dns() {
        let route =
            decode(Bytes::from_static(&[0x01, 8, 8, 8, 8, 0x00, 0x35, 0xde, 0xad])).unwrap();
        assert_eq!(route.network, Network::Udp);
        assert_eq!(route.port, 53);
        assert_eq!(route.residual.as_ref(), &[0xde, 0xad]);
    }

    #[test]
    fn decodes_domain() {
        let route = decode(Bytes::from_static(&[
            0x03, 0x03, b'f', b'o', b'o', 0x01, 0xbb,
        ]))
        .unwrap();
        assert_eq!(route.addr, RemoteAddr::Domain("foo".into()));
        assert_eq!(route.port, 443);
        assert!(route.residual.is_empty());
    }

    #[test]
    fn ipv6_is_not_bracketed() {
        let mut buf = vec![0x04];
        buf.extend_from_slice(&[0u8; 16]);
        buf.extend_from_slice(&[0x01, 0xbb]);
        let route = decode(Bytes::from(buf)).unwrap();
        assert_eq!(route.host(), "0:0:0:0:0:0:0:0");
    }

    #[test]
    fn rejects_unknown_address_type() {
        let err = decode(Bytes::from_static(&[0x02, 10, 0, 0, 1, 0x00, 0x50])).unwrap_err();
        assert_eq!(err, ProtocolError::InvalidAddressType(2));
    }

    #[test]
    fn rejects_empty_domain() {
        let err = decode(Bytes::from_static(&[0x03, 0x00, 0x01, 0xbb])).unwrap_err();
        assert_eq!(err, ProtocolError::EmptyAddress(3));
    }

    #[test]
    fn truncated_header() {
        let err = decode(Bytes::from_static(&[0x01, 10, 0])).unwrap_err();
        assert_eq!(err, ProtocolError::Truncated);
    }

    #[test]
    fn header_and_residual_reassemble_the_frame() {
        let input = Bytes::from_static(&[0x01, 10, 0, 0, 1, 0x00, 0x50, b'H', b'I']);
        let route = decode(input.clone()).unwrap();
        let header_len = input.len() - route.residual.len();
        let mut rebuilt = input.slice(..header_len).to_vec();
        rebuilt.extend_from_slice(&route.residual);
        assert_eq!(rebuilt, input);
    }
}
