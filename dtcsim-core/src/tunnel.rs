//! Wire-format for the encrypted control/data tunnel the source system
//! runs this emulator's router underneath. The transport itself
//! (handshake, encryption, retransmission) is out of scope here; this
//! module only fixes the framing so a future transport implementation has
//! something concrete to target.
//!
//! There is no explicit frame kind byte or length prefix: a control frame
//! is recognised by starting with `0x00`, a byte no IPv4 packet can start
//! with (the version nibble is always `4`). Everything else is a raw IPv4
//! packet, passed through as-is and self-delimited by its own header's
//! total-length field.

/// First byte of every control frame.
pub const CONTROL_PREFIX: u8 = 0x00;
/// Second byte of a disconnect frame.
pub const DISCONNECT_SUFFIX: u8 = 0xFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlFrame {
    /// A bare `0x00` byte.
    Keepalive,
    /// `0x00 0xFF`.
    Disconnect,
}

/// A single frame read off (or written to) the tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frame<'a> {
    Control(ControlFrame),
    Data(&'a [u8]),
}

pub fn keepalive_frame() -> Vec<u8> {
    vec![CONTROL_PREFIX]
}

pub fn disconnect_frame() -> Vec<u8> {
    vec![CONTROL_PREFIX, DISCONNECT_SUFFIX]
}

/// Splits one frame off the front of `buf`, returning it plus the number
/// of bytes consumed. Returns `None` if `buf` does not yet hold a
/// complete frame (a data frame whose declared IPv4 length runs past the
/// end of `buf`).
pub fn parse_frame(buf: &[u8]) -> Option<(Frame<'_>, usize)> {
    let first = *buf.first()?;
    if first == CONTROL_PREFIX {
        return if buf.get(1) == Some(&DISCONNECT_SUFFIX) {
            Some((Frame::Control(ControlFrame::Disconnect), 2))
        } else {
            Some((Frame::Control(ControlFrame::Keepalive), 1))
        };
    }

    if buf.len() < 4 {
        return None;
    }
    let total_len = u16::from_be_bytes([buf[2], buf[3]]) as usize;
    if buf.len() < total_len {
        return None;
    }
    Some((Frame::Data(&buf[..total_len]), total_len))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keepalive_is_a_bare_null_byte() {
        let encoded = keepalive_frame();
        assert_eq!(encoded, vec![0x00]);
        let (frame, consumed) = parse_frame(&encoded).unwrap();
        assert_eq!(frame, Frame::Control(ControlFrame::Keepalive));
        assert_eq!(consumed, 1);
    }

    #[test]
    fn disconnect_is_00_ff() {
        let encoded = disconnect_frame();
        assert_eq!(encoded, vec![0x00, 0xFF]);
        let (frame, consumed) = parse_frame(&encoded).unwrap();
        assert_eq!(frame, Frame::Control(ControlFrame::Disconnect));
        assert_eq!(consumed, 2);
    }

    #[test]
    fn data_frames_pass_through_raw_ipv4_self_delimited() {
        let id_gen = crate::packet::IpIdGenerator::new();
        let mut ipv4 = crate::packet::ipv4::build_ipv4_header(
            std::net::Ipv4Addr::new(10, 0, 0, 2),
            std::net::Ipv4Addr::new(8, 8, 8, 8),
            crate::checksum::IP_PROTO_UDP,
            4,
            &id_gen,
        );
        ipv4.extend_from_slice(b"ping");

        let (frame, consumed) = parse_frame(&ipv4).unwrap();
        assert_eq!(frame, Frame::Data(&ipv4[..]));
        assert_eq!(consumed, ipv4.len());
    }

    #[test]
    fn parse_frame_reports_incomplete_data_frames() {
        let id_gen = crate::packet::IpIdGenerator::new();
        let mut ipv4 = crate::packet::ipv4::build_ipv4_header(
            std::net::Ipv4Addr::new(10, 0, 0, 2),
            std::net::Ipv4Addr::new(8, 8, 8, 8),
            crate::checksum::IP_PROTO_UDP,
            4,
            &id_gen,
        );
        ipv4.extend_from_slice(b"ping");

        assert!(parse_frame(&ipv4[..ipv4.len() - 1]).is_none());
        assert!(parse_frame(&[]).is_none());
    }

    #[test]
    fn consecutive_frames_parse_independently() {
        let id_gen = crate::packet::IpIdGenerator::new();
        let mut ipv4 = crate::packet::ipv4::build_ipv4_header(
            std::net::Ipv4Addr::new(10, 0, 0, 2),
            std::net::Ipv4Addr::new(8, 8, 8, 8),
            crate::checksum::IP_PROTO_UDP,
            4,
            &id_gen,
        );
        ipv4.extend_from_slice(b"ping");

        let mut buf = disconnect_frame();
        buf.extend_from_slice(&ipv4);

        let (first, used1) = parse_frame(&buf).unwrap();
        assert_eq!(first, Frame::Control(ControlFrame::Disconnect));
        let (second, _) = parse_frame(&buf[used1..]).unwrap();
        assert_eq!(second, Frame::Data(&ipv4[..]));
    }
}
