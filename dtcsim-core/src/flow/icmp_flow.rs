//! ICMP handling is deliberately shallow: an echo request gets a locally
//! synthesised echo reply (shaped through the same delay/loss pipeline as
//! everything else) without ever reaching the real destination. Every
//! other ICMP type is logged and dropped. This means a `ping` through the
//! emulator reports the configured link characteristics accurately but
//! cannot detect that the destination host is actually unreachable. This
//! is an accepted, deliberate tradeoff rather than a bug: a real
//! destination-reachability probe would have to leave the emulated link
//! entirely, defeating the point of shaping it.

use std::net::Ipv4Addr;
use std::sync::Arc;

use crate::checksum::IP_PROTO_ICMP;
use crate::context::RouterContext;
use crate::packet::icmp::{self, IcmpHeader, ICMP_ECHO_REPLY, ICMP_ECHO_REQUEST};
use crate::packet::ipv4::{self, Ipv4Header};

pub async fn handle_outbound(
    ctx: Arc<RouterContext>,
    header: Ipv4Header,
    icmp_header: IcmpHeader,
    rest: Vec<u8>,
    now_ms: i64,
) {
    if icmp_header.icmp_type != ICMP_ECHO_REQUEST {
        log::debug!(
            "icmp: dropping unsupported type {} code {} from {}",
            icmp_header.icmp_type,
            icmp_header.code,
            header.src
        );
        return;
    }

    let frame = build_echo_reply(
        header.dst,
        header.src,
        icmp_header.identifier,
        icmp_header.sequence,
        &rest,
        &ctx.id_gen,
    );
    ctx.inbound.submit(frame, now_ms).await;
}

fn build_echo_reply(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    identifier: u16,
    sequence: u16,
    payload: &[u8],
    id_gen: &crate::packet::IpIdGenerator,
) -> Vec<u8> {
    let mut message = vec![0u8; icmp::ICMP_HEADER_LEN + payload.len()];
    message[0] = ICMP_ECHO_REPLY;
    message[1] = 0;
    message[4..6].copy_from_slice(&identifier.to_be_bytes());
    message[6..8].copy_from_slice(&sequence.to_be_bytes());
    message[8..].copy_from_slice(payload);
    let checksum = icmp::icmp_checksum(&message);
    message[2..4].copy_from_slice(&checksum.to_be_bytes());

    let mut frame = ipv4::build_ipv4_header(src, dst, IP_PROTO_ICMP, message.len(), id_gen);
    frame.extend_from_slice(&message);
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn echo_reply_carries_request_identifier_and_sequence_back() {
        let id_gen = crate::packet::IpIdGenerator::new();
        let frame = build_echo_reply(
            Ipv4Addr::new(8, 8, 8, 8),
            Ipv4Addr::new(10, 0, 0, 2),
            0x1234,
            0x0001,
            b"ping",
            &id_gen,
        );
        let (ip, l4) = ipv4::parse_ipv4(&frame).unwrap();
        assert_eq!(ip.protocol, IP_PROTO_ICMP);
        let (reply, payload) = icmp::parse_icmp(l4).unwrap();
        assert_eq!(reply.icmp_type, ICMP_ECHO_REPLY);
        assert_eq!(reply.identifier, 0x1234);
        assert_eq!(reply.sequence, 0x0001);
        assert_eq!(payload, b"ping");
    }
}
