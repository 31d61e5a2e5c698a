use std::net::Ipv4Addr;

use crate::checksum::{tcp_udp_checksum, IP_PROTO_UDP};
use crate::error::DtcError;

pub const UDP_HEADER_LEN: usize = 8;

#[derive(Debug, Clone, Copy)]
pub struct UdpHeader {
    pub src_port: u16,
    pub dst_port: u16,
}

/// Parses a UDP datagram (header + payload) out of an IPv4 packet's L4
/// payload.
pub fn parse_udp(l4: &[u8]) -> Result<(UdpHeader, &[u8]), DtcError> {
    if l4.len() < UDP_HEADER_LEN {
        return Err(DtcError::MalformedPacket);
    }
    let src_port = u16::from_be_bytes([l4[0], l4[1]]);
    let dst_port = u16::from_be_bytes([l4[2], l4[3]]);
    let len = u16::from_be_bytes([l4[4], l4[5]]) as usize;
    if len < UDP_HEADER_LEN || len > l4.len() {
        return Err(DtcError::MalformedPacket);
    }
    Ok((UdpHeader { src_port, dst_port }, &l4[UDP_HEADER_LEN..len]))
}

/// Builds a complete 28-byte-header IPv4+UDP datagram for `payload`.
pub fn build_ipv4_udp_packet(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    payload: &[u8],
    id_gen: &super::IpIdGenerator,
) -> Vec<u8> {
    let udp_len = UDP_HEADER_LEN + payload.len();
    let mut udp = vec![0u8; udp_len];
    udp[0..2].copy_from_slice(&src_port.to_be_bytes());
    udp[2..4].copy_from_slice(&dst_port.to_be_bytes());
    udp[4..6].copy_from_slice(&(udp_len as u16).to_be_bytes());
    udp[8..].copy_from_slice(payload);
    let checksum = tcp_udp_checksum(IP_PROTO_UDP, src, dst, &udp);
    udp[6..8].copy_from_slice(&checksum.to_be_bytes());

    let mut frame = super::ipv4::build_ipv4_header(src, dst, IP_PROTO_UDP, udp.len(), id_gen);
    frame.extend_from_slice(&udp);
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_and_reparses_a_udp_packet() {
        let id_gen = super::super::IpIdGenerator::new();
        let src = Ipv4Addr::new(10, 0, 0, 2);
        let dst = Ipv4Addr::new(8, 8, 8, 8);
        let frame = build_ipv4_udp_packet(src, dst, 5353, 53, b"hello", &id_gen);
        let (ip, l4) = crate::packet::ipv4::parse_ipv4(&frame).unwrap();
        let (udp, payload) = parse_udp(l4).unwrap();
        assert_eq!(ip.protocol, IP_PROTO_UDP);
        assert_eq!(udp.src_port, 5353);
        assert_eq!(udp.dst_port, 53);
        assert_eq!(payload, b"hello");
    }
}
