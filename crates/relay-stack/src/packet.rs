//! Packet buffer: an immutable view over one IP datagram.
//!
//! Parsing is strict: truncated headers, bad version nibbles and length
//! fields that disagree with the buffer are all rejected up front, so the
//! rest of the stack never re-validates. Protocol variants are a tagged
//! union, one arm per transport.

use bytes::Bytes;
use relay_common::{FlowKey, RelayError, RelayResult};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// IP protocol numbers the stack understands natively.
pub const PROTO_ICMP: u8 = 1;
/// TCP.
pub const PROTO_TCP: u8 = 6;
/// UDP.
pub const PROTO_UDP: u8 = 17;
/// ICMPv6.
pub const PROTO_ICMPV6: u8 = 58;

const TCP_FIN: u8 = 0x01;
const TCP_RST: u8 = 0x04;

/// Parsed transport header, one variant per protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    /// TCP segment.
    Tcp {
        /// Source port.
        src_port: u16,
        /// Destination port.
        dst_port: u16,
        /// Raw flag byte (FIN/SYN/RST/PSH/ACK/URG).
        flags: u8,
    },
    /// UDP datagram.
    Udp {
        /// Source port.
        src_port: u16,
        /// Destination port.
        dst_port: u16,
    },
    /// ICMP or ICMPv6 message.
    Icmp {
        /// ICMP type byte.
        kind: u8,
        /// Echo identifier (0 for non-echo messages).
        ident: u16,
    },
    /// Any other IP protocol, carried opaquely.
    Other(u8),
}

/// One parsed, immutable IP datagram.
///
/// The raw bytes and the parsed metadata are fixed at construction; there
/// are no mutating accessors.
#[derive(Debug, Clone)]
pub struct Packet {
    bytes: Bytes,
    version: u8,
    src: IpAddr,
    dst: IpAddr,
    protocol: u8,
    transport: Transport,
}

impl Packet {
    /// Parse a raw IP datagram.
    ///
    /// Fails with [`RelayError::MalformedPacket`] on truncation, an
    /// unsupported IP version, or header fields inconsistent with the
    /// buffer. No state is retained on failure.
    pub fn parse(bytes: Bytes) -> RelayResult<Self> {
        if bytes.is_empty() {
            return Err(RelayError::MalformedPacket("empty buffer"));
        }
        match bytes[0] >> 4 {
            4 => Self::parse_v4(bytes),
            6 => Self::parse_v6(bytes),
            _ => Err(RelayError::MalformedPacket("unsupported IP version")),
        }
    }

    fn parse_v4(bytes: Bytes) -> RelayResult<Self> {
        let data = &bytes[..];
        if data.len() < 20 {
            return Err(RelayError::MalformedPacket("truncated IPv4 header"));
        }
        let ihl = ((data[0] & 0x0F) as usize) * 4;
        if ihl < 20 || ihl > data.len() {
            return Err(RelayError::MalformedPacket("bad IPv4 IHL"));
        }
        let total_len = u16::from_be_bytes([data[2], data[3]]) as usize;
        if total_len < ihl || total_len > data.len() {
            return Err(RelayError::MalformedPacket("IPv4 total length mismatch"));
        }

        let protocol = data[9];
        let src = Ipv4Addr::new(data[12], data[13], data[14], data[15]);
        let dst = Ipv4Addr::new(data[16], data[17], data[18], data[19]);
        let transport = parse_transport(protocol, &data[ihl..total_len])?;

        Ok(Self {
            bytes,
            version: 4,
            src: IpAddr::V4(src),
            dst: IpAddr::V4(dst),
            protocol,
            transport,
        })
    }

    fn parse_v6(bytes: Bytes) -> RelayResult<Self> {
        let data = &bytes[..];
        if data.len() < 40 {
            return Err(RelayError::MalformedPacket("truncated IPv6 header"));
        }
        let payload_len = u16::from_be_bytes([data[4], data[5]]) as usize;
        if 40 + payload_len > data.len() {
            return Err(RelayError::MalformedPacket("IPv6 payload length mismatch"));
        }

        // Extension header chains are not walked; the next-header byte is
        // taken as the transport protocol.
        let protocol = data[6];
        let mut src = [0u8; 16];
        let mut dst = [0u8; 16];
        src.copy_from_slice(&data[8..24]);
        dst.copy_from_slice(&data[24..40]);
        let transport = parse_transport(protocol, &data[40..40 + payload_len])?;

        Ok(Self {
            bytes,
            version: 6,
            src: IpAddr::V6(Ipv6Addr::from(src)),
            dst: IpAddr::V6(Ipv6Addr::from(dst)),
            protocol,
            transport,
        })
    }

    /// IP version, 4 or 6.
    #[inline(always)]
    pub fn version(&self) -> u8 {
        self.version
    }

    /// Source address.
    #[inline(always)]
    pub fn src(&self) -> IpAddr {
        self.src
    }

    /// Destination address.
    #[inline(always)]
    pub fn dst(&self) -> IpAddr {
        self.dst
    }

    /// IP protocol number.
    #[inline(always)]
    pub fn protocol(&self) -> u8 {
        self.protocol
    }

    /// Parsed transport header.
    #[inline(always)]
    pub fn transport(&self) -> Transport {
        self.transport
    }

    /// Full datagram bytes.
    #[inline(always)]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Datagram length in bytes.
    #[inline(always)]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// True for a zero-length buffer (cannot occur after a successful
    /// parse).
    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Derive the 5-tuple flow key.
    pub fn flow_key(&self) -> FlowKey {
        let (src_port, dst_port) = match self.transport {
            Transport::Tcp {
                src_port, dst_port, ..
            }
            | Transport::Udp { src_port, dst_port } => (src_port, dst_port),
            Transport::Icmp { ident, .. } => (ident, 0),
            Transport::Other(_) => (0, 0),
        };
        match (self.src, self.dst) {
            (IpAddr::V4(s), IpAddr::V4(d)) => {
                FlowKey::from_v4(s, d, src_port, dst_port, self.protocol)
            }
            (IpAddr::V6(s), IpAddr::V6(d)) => {
                FlowKey::from_v6(s, d, src_port, dst_port, self.protocol)
            }
            // Mixed families cannot come out of a single header.
            _ => unreachable!("mixed address families in one datagram"),
        }
    }

    /// True when the segment signals protocol-level termination
    /// (TCP FIN or RST).
    pub fn is_termination(&self) -> bool {
        matches!(self.transport, Transport::Tcp { flags, .. } if flags & (TCP_FIN | TCP_RST) != 0)
    }
}

fn parse_transport(protocol: u8, payload: &[u8]) -> RelayResult<Transport> {
    match protocol {
        PROTO_TCP => {
            if payload.len() < 20 {
                return Err(RelayError::MalformedPacket("truncated TCP header"));
            }
            Ok(Transport::Tcp {
                src_port: u16::from_be_bytes([payload[0], payload[1]]),
                dst_port: u16::from_be_bytes([payload[2], payload[3]]),
                flags: payload[13],
            })
        }
        PROTO_UDP => {
            if payload.len() < 8 {
                return Err(RelayError::MalformedPacket("truncated UDP header"));
            }
            Ok(Transport::Udp {
                src_port: u16::from_be_bytes([payload[0], payload[1]]),
                dst_port: u16::from_be_bytes([payload[2], payload[3]]),
            })
        }
        PROTO_ICMP | PROTO_ICMPV6 => {
            if payload.len() < 8 {
                return Err(RelayError::MalformedPacket("truncated ICMP header"));
            }
            let kind = payload[0];
            // Echo request/reply carry an identifier; everything else keys
            // on zero.
            let ident = match (protocol, kind) {
                (PROTO_ICMP, 0 | 8) | (PROTO_ICMPV6, 128 | 129) => {
                    u16::from_be_bytes([payload[4], payload[5]])
                }
                _ => 0,
            };
            Ok(Transport::Icmp { kind, ident })
        }
        other => Ok(Transport::Other(other)),
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn parse_udp_v4() {
        let raw = testutil::udp_v4([192, 168, 1, 10], [8, 8, 8, 8], 40000, 53, b"hello");
        let pkt = Packet::parse(raw).unwrap();
        assert_eq!(pkt.version(), 4);
        assert_eq!(pkt.src(), IpAddr::V4(Ipv4Addr::new(192, 168, 1, 10)));
        assert_eq!(
            pkt.transport(),
            Transport::Udp {
                src_port: 40000,
                dst_port: 53
            }
        );
        assert!(!pkt.is_termination());
        let key = pkt.flow_key();
        assert_eq!(key.src_port, 40000);
        assert_eq!(key.protocol, PROTO_UDP);
    }

    #[test]
    fn parse_tcp_fin() {
        let raw = testutil::tcp_v4([10, 0, 0, 1], [1, 1, 1, 1], 55000, 443, 0x11); // FIN|ACK
        let pkt = Packet::parse(raw).unwrap();
        assert!(pkt.is_termination());
    }

    #[test]
    fn parse_tcp_rst() {
        let raw = testutil::tcp_v4([10, 0, 0, 1], [1, 1, 1, 1], 55000, 443, 0x04);
        assert!(Packet::parse(raw).unwrap().is_termination());
    }

    #[test]
    fn truncated_rejected() {
        let raw = testutil::udp_v4([10, 0, 0, 1], [1, 1, 1, 1], 1, 2, b"x");
        let truncated = raw.slice(..24);
        // IPv4 total length now exceeds the buffer.
        assert!(matches!(
            Packet::parse(truncated),
            Err(RelayError::MalformedPacket(_))
        ));
    }

    #[test]
    fn version_nibble_rejected() {
        let raw = Bytes::from_static(&[0x95; 40]);
        assert!(matches!(
            Packet::parse(raw),
            Err(RelayError::MalformedPacket(_))
        ));
    }

    #[test]
    fn other_protocol_passthrough() {
        // GRE (47) inside IPv4.
        let mut b = vec![0u8; 24];
        b[0] = 0x45;
        b[2..4].copy_from_slice(&24u16.to_be_bytes());
        b[9] = 47;
        b[12..16].copy_from_slice(&[10, 0, 0, 1]);
        b[16..20].copy_from_slice(&[10, 0, 0, 2]);
        let pkt = Packet::parse(Bytes::from(b)).unwrap();
        assert_eq!(pkt.transport(), Transport::Other(47));
        let key = pkt.flow_key();
        assert_eq!((key.src_port, key.dst_port), (0, 0));
    }

    #[test]
    fn parse_icmp_echo() {
        let mut b = vec![0u8; 28];
        b[0] = 0x45;
        b[2..4].copy_from_slice(&28u16.to_be_bytes());
        b[9] = PROTO_ICMP;
        b[12..16].copy_from_slice(&[10, 0, 0, 1]);
        b[16..20].copy_from_slice(&[8, 8, 4, 4]);
        b[20] = 8; // echo request
        b[24..26].copy_from_slice(&0xBEEFu16.to_be_bytes());
        let pkt = Packet::parse(Bytes::from(b)).unwrap();
        assert_eq!(
            pkt.transport(),
            Transport::Icmp {
                kind: 8,
                ident: 0xBEEF
            }
        );
        assert_eq!(pkt.flow_key().src_port, 0xBEEF);
    }

    #[test]
    fn parse_udp_v6() {
        let mut b = vec![0u8; 48];
        b[0] = 0x60;
        b[4..6].copy_from_slice(&8u16.to_be_bytes());
        b[6] = PROTO_UDP;
        b[8] = 0xfe;
        b[23] = 1; // src fe00::1-ish
        b[24] = 0xfe;
        b[39] = 2;
        b[40..42].copy_from_slice(&1234u16.to_be_bytes());
        b[42..44].copy_from_slice(&53u16.to_be_bytes());
        let pkt = Packet::parse(Bytes::from(b)).unwrap();
        assert_eq!(pkt.version(), 6);
        assert_eq!(
            pkt.transport(),
            Transport::Udp {
                src_port: 1234,
                dst_port: 53
            }
        );
    }

    proptest! {
        // Arbitrary input either parses cleanly or fails with
        // MalformedPacket; it never panics.
        #[test]
        fn parse_never_panics(data in proptest::collection::vec(any::<u8>(), 0..256)) {
            match Packet::parse(Bytes::from(data)) {
                Ok(pkt) => {
                    let _ = pkt.flow_key();
                    let _ = pkt.is_termination();
                }
                Err(RelayError::MalformedPacket(_)) => {}
                Err(other) => prop_assert!(false, "unexpected error: {other}"),
            }
        }
    }
}
