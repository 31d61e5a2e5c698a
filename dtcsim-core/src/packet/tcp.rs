use std::net::Ipv4Addr;

use crate::checksum::{tcp_udp_checksum, IP_PROTO_TCP};
use crate::error::DtcError;

pub const TCP_MIN_HEADER_LEN: usize = 20;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpFlags {
    pub fin: bool,
    pub syn: bool,
    pub rst: bool,
    pub psh: bool,
    pub ack: bool,
    pub urg: bool,
}

impl TcpFlags {
    fn from_byte(b: u8) -> Self {
        Self {
            fin: b & 0x01 != 0,
            syn: b & 0x02 != 0,
            rst: b & 0x04 != 0,
            psh: b & 0x08 != 0,
            ack: b & 0x10 != 0,
            urg: b & 0x20 != 0,
        }
    }

    fn to_byte(self) -> u8 {
        (self.fin as u8)
            | (self.syn as u8) << 1
            | (self.rst as u8) << 2
            | (self.psh as u8) << 3
            | (self.ack as u8) << 4
            | (self.urg as u8) << 5
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TcpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub data_offset: u8,
    pub flags: TcpFlags,
    pub window: u16,
}

impl TcpHeader {
    pub fn header_len(&self) -> usize {
        self.data_offset as usize * 4
    }
}

/// Parses a TCP segment (header, options ignored, + payload) out of an
/// IPv4 packet's L4 payload.
pub fn parse_tcp(l4: &[u8]) -> Result<(TcpHeader, &[u8]), DtcError> {
    if l4.len() < TCP_MIN_HEADER_LEN {
        return Err(DtcError::MalformedPacket);
    }
    let src_port = u16::from_be_bytes([l4[0], l4[1]]);
    let dst_port = u16::from_be_bytes([l4[2], l4[3]]);
    let seq = u32::from_be_bytes([l4[4], l4[5], l4[6], l4[7]]);
    let ack = u32::from_be_bytes([l4[8], l4[9], l4[10], l4[11]]);
    let data_offset = l4[12] >> 4;
    let header_len = data_offset as usize * 4;
    if header_len < TCP_MIN_HEADER_LEN || header_len > l4.len() {
        return Err(DtcError::MalformedPacket);
    }
    let flags = TcpFlags::from_byte(l4[13]);
    let window = u16::from_be_bytes([l4[14], l4[15]]);
    let header = TcpHeader {
        src_port,
        dst_port,
        seq,
        ack,
        data_offset,
        flags,
        window,
    };
    Ok((header, &l4[header_len..]))
}

/// Builds a complete IPv4+TCP segment (no TCP options) carrying `payload`.
#[allow(clippy::too_many_arguments)]
pub fn build_ipv4_tcp_segment(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    seq: u32,
    ack: u32,
    flags: TcpFlags,
    window: u16,
    payload: &[u8],
    id_gen: &super::IpIdGenerator,
) -> Vec<u8> {
    let mut tcp = vec![0u8; TCP_MIN_HEADER_LEN + payload.len()];
    tcp[0..2].copy_from_slice(&src_port.to_be_bytes());
    tcp[2..4].copy_from_slice(&dst_port.to_be_bytes());
    tcp[4..8].copy_from_slice(&seq.to_be_bytes());
    tcp[8..12].copy_from_slice(&ack.to_be_bytes());
    tcp[12] = 5 << 4; // data offset = 5 (no options)
    tcp[13] = flags.to_byte();
    tcp[14..16].copy_from_slice(&window.to_be_bytes());
    tcp[TCP_MIN_HEADER_LEN..].copy_from_slice(payload);
    let checksum = tcp_udp_checksum(IP_PROTO_TCP, src, dst, &tcp);
    tcp[16..18].copy_from_slice(&checksum.to_be_bytes());

    let mut frame = super::ipv4::build_ipv4_header(src, dst, IP_PROTO_TCP, tcp.len(), id_gen);
    frame.extend_from_slice(&tcp);
    frame
}

/// Signed difference `a - b` for modulo-2^32 TCP sequence numbers, per the
/// RFC 793 convention: positive means `a` is "ahead of" `b`. Uses an
/// explicit `i32` wraparound so the comparison is correct across a
/// sequence-number rollover.
pub fn seq_diff(a: u32, b: u32) -> i32 {
    a.wrapping_sub(b) as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_and_reparses_a_tcp_segment() {
        let id_gen = super::super::IpIdGenerator::new();
        let src = Ipv4Addr::new(10, 0, 0, 2);
        let dst = Ipv4Addr::new(8, 8, 8, 8);
        let flags = TcpFlags { syn: true, ack: true, ..Default::default() };
        let frame = build_ipv4_tcp_segment(src, dst, 1234, 80, 100, 200, flags, 65535, b"hi", &id_gen);
        let (ip, l4) = crate::packet::ipv4::parse_ipv4(&frame).unwrap();
        let (tcp, payload) = parse_tcp(l4).unwrap();
        assert_eq!(ip.protocol, IP_PROTO_TCP);
        assert_eq!(tcp.seq, 100);
        assert_eq!(tcp.ack, 200);
        assert!(tcp.flags.syn && tcp.flags.ack);
        assert_eq!(payload, b"hi");
    }

    #[test]
    fn seq_diff_handles_wraparound() {
        assert_eq!(seq_diff(5, 3), 2);
        assert_eq!(seq_diff(3, 5), -2);
        assert_eq!(seq_diff(1, u32::MAX), 2);
        assert_eq!(seq_diff(u32::MAX, 1), -2);
    }
}
