//! Flow identity and lifecycle types.

use serde::Serialize;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// 5-tuple flow key.
///
/// Addresses are stored as `u128` so one key type covers IPv4 (low 32
/// bits) and IPv6.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(C, align(32))]
pub struct FlowKey {
    /// Source IP (v4 stored in low bits).
    pub src_ip: u128,
    /// Destination IP.
    pub dst_ip: u128,
    /// Source port (ICMP echo identifier for ICMP flows).
    pub src_port: u16,
    /// Destination port (0 for ICMP flows).
    pub dst_port: u16,
    /// IP protocol number.
    pub protocol: u8,
    /// True when the addresses are IPv6.
    pub is_v6: bool,
    _pad: [u8; 2],
}

impl FlowKey {
    /// Create from an IPv4 tuple.
    #[inline(always)]
    pub const fn from_v4(
        src: Ipv4Addr,
        dst: Ipv4Addr,
        src_port: u16,
        dst_port: u16,
        protocol: u8,
    ) -> Self {
        Self {
            src_ip: u32::from_be_bytes(src.octets()) as u128,
            dst_ip: u32::from_be_bytes(dst.octets()) as u128,
            src_port,
            dst_port,
            protocol,
            is_v6: false,
            _pad: [0; 2],
        }
    }

    /// Create from an IPv6 tuple.
    #[inline(always)]
    pub const fn from_v6(
        src: Ipv6Addr,
        dst: Ipv6Addr,
        src_port: u16,
        dst_port: u16,
        protocol: u8,
    ) -> Self {
        Self {
            src_ip: u128::from_be_bytes(src.octets()),
            dst_ip: u128::from_be_bytes(dst.octets()),
            src_port,
            dst_port,
            protocol,
            is_v6: true,
            _pad: [0; 2],
        }
    }

    /// Reverse (reply-direction) key.
    #[inline(always)]
    pub const fn reverse(&self) -> Self {
        Self {
            src_ip: self.dst_ip,
            dst_ip: self.src_ip,
            src_port: self.dst_port,
            dst_port: self.src_port,
            protocol: self.protocol,
            is_v6: self.is_v6,
            _pad: [0; 2],
        }
    }

    /// Source address as `IpAddr`.
    pub fn src_addr(&self) -> IpAddr {
        addr_from_bits(self.src_ip, self.is_v6)
    }

    /// Destination address as `IpAddr`.
    pub fn dst_addr(&self) -> IpAddr {
        addr_from_bits(self.dst_ip, self.is_v6)
    }

    /// FNV-1a hash over the tuple. Fast, good distribution, stable.
    #[inline(always)]
    pub fn hash64(&self) -> u64 {
        const FNV_OFFSET: u64 = 0xcbf29ce484222325;
        const FNV_PRIME: u64 = 0x100000001b3;

        let mut h = FNV_OFFSET;
        for byte in self.src_ip.to_ne_bytes() {
            h ^= byte as u64;
            h = h.wrapping_mul(FNV_PRIME);
        }
        for byte in self.dst_ip.to_ne_bytes() {
            h ^= byte as u64;
            h = h.wrapping_mul(FNV_PRIME);
        }
        for byte in self.src_port.to_ne_bytes() {
            h ^= byte as u64;
            h = h.wrapping_mul(FNV_PRIME);
        }
        for byte in self.dst_port.to_ne_bytes() {
            h ^= byte as u64;
            h = h.wrapping_mul(FNV_PRIME);
        }
        h ^= self.protocol as u64;
        h.wrapping_mul(FNV_PRIME)
    }
}

fn addr_from_bits(bits: u128, is_v6: bool) -> IpAddr {
    if is_v6 {
        IpAddr::V6(Ipv6Addr::from(bits.to_be_bytes()))
    } else {
        IpAddr::V4(Ipv4Addr::from((bits as u32).to_be_bytes()))
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}:{}->{}:{}",
            self.protocol,
            self.src_addr(),
            self.src_port,
            self.dst_addr(),
            self.dst_port
        )
    }
}

/// Lifecycle phase of a tracked flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum FlowPhase {
    /// Created, no response round trip observed yet.
    Establishing = 0,
    /// At least one response round trip completed.
    Active = 1,
    /// Protocol-level termination seen (TCP FIN/RST).
    Closing = 2,
    /// Marked for removal by the poll driver.
    Expired = 3,
}
