//! Wires a [`crate::tun::Tun`] to the shaping/flow pipeline: five
//! concurrent loops (tun reader, outbound dispatcher, inbound writer,
//! idle-session sweeper, periodic stats logger) sharing one
//! [`RouterContext`].

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Notify};

use crate::clock::{Clock, SystemClock};
use crate::context::{RouterContext, RouterEvent, SocketProtector};
use crate::error::DtcError;
use crate::flow::{icmp_flow, tcp_flow, udp_flow};
use crate::packet::{icmp, ipv4, tcp, udp, IpIdGenerator};
use crate::checksum::{IP_PROTO_ICMP, IP_PROTO_TCP, IP_PROTO_UDP};
use crate::profile::{Direction, EffectiveProfile, NetworkProfile};
use crate::session::SessionTable;
use crate::shaper::Shaper;
use crate::stats::{StatsSnapshot, Statistics};
use crate::tun::Tun;

/// How long a [`crate::delay_queue::DelayQueue::pop_ready_blocking`] call
/// is allowed to wait before looping back around to re-check shutdown.
const DRAIN_POLL_MS: u64 = 250;
/// How often the session tables are swept for idle entries.
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);
/// How often the router logs a target-vs-observed loss summary.
const STATS_LOG_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Clone)]
struct Shutdown(Arc<AtomicBool>, Arc<Notify>);

impl Shutdown {
    fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)), Arc::new(Notify::new()))
    }
    fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
        self.1.notify_waiters();
    }
    fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
    async fn cancelled(&self) {
        if !self.is_cancelled() {
            self.1.notified().await;
        }
    }
}

/// A running router's control-plane surface. Every method is non-blocking
/// with respect to packet I/O: profile/reject-list updates apply to the
/// next packet processed, never to packets already in flight.
#[derive(Clone)]
pub struct RouterHandle {
    ctx: Arc<RouterContext>,
    shutdown: Shutdown,
}

impl RouterHandle {
    pub fn update_profile(&self, profile: &NetworkProfile) {
        let effective = EffectiveProfile::from(profile);
        self.ctx.outbound.set_profile(&effective);
        self.ctx.inbound.set_profile(&effective);
    }

    pub fn update_reject_list(&self, ports: HashSet<u16>) {
        self.ctx.reject_list.replace(ports);
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.ctx.stats.snapshot(
            self.ctx.outbound.queue_len(),
            self.ctx.inbound.queue_len(),
            self.ctx.outbound.loss_stats(),
            self.ctx.inbound.loss_stats(),
            self.ctx.outbound.configured_bandwidth_kbps(),
            self.ctx.inbound.configured_bandwidth_kbps(),
        )
    }

    pub fn stop(&self) {
        self.shutdown.cancel();
    }
}

/// Starts the background tasks that make up a running router and returns
/// a handle plus the event receiver. Dropping the handle does not stop
/// the router; call [`RouterHandle::stop`] explicitly.
pub fn spawn(
    tun: Arc<dyn Tun>,
    protector: Arc<dyn SocketProtector>,
    config: crate::config::RouterConfig,
) -> (RouterHandle, mpsc::Receiver<RouterEvent>) {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
    let (events_tx, events_rx) = mpsc::channel(256);
    let effective = EffectiveProfile::from(&config.profile);
    let outbound = Arc::new(Shaper::new(Direction::Up, clock.clone()));
    let inbound = Arc::new(Shaper::new(Direction::Down, clock.clone()));
    outbound.set_profile(&effective);
    inbound.set_profile(&effective);

    let ctx = Arc::new(RouterContext {
        tun_addr: config.tun_addr,
        clock: clock.clone(),
        id_gen: IpIdGenerator::new(),
        protector,
        outbound,
        inbound,
        tcp_sessions: Arc::new(SessionTable::new()),
        udp_sessions: Arc::new(SessionTable::new()),
        reject_list: crate::context::RejectList::new(config.reject_ports),
        stats: Arc::new(Statistics::new()),
        events: events_tx,
    });

    let shutdown = Shutdown::new();
    let handle = RouterHandle { ctx: ctx.clone(), shutdown: shutdown.clone() };

    tokio::task::spawn_blocking({
        let tun = tun.clone();
        let ctx = ctx.clone();
        let shutdown = shutdown.clone();
        move || tun_reader_loop(tun, ctx, shutdown)
    });
    tokio::spawn(outbound_dispatch_loop(ctx.clone(), shutdown.clone()));
    tokio::spawn(inbound_writer_loop(tun, ctx.clone(), shutdown.clone()));
    tokio::spawn(sweeper_loop(ctx.clone(), config.idle_timeout_ms, shutdown.clone()));
    tokio::spawn(stats_log_loop(ctx, shutdown));

    (handle, events_rx)
}

/// Logs a running summary of observed vs. configured loss every
/// [`STATS_LOG_INTERVAL`], independent of whatever an embedder's UI does
/// with [`RouterHandle::stats`].
async fn stats_log_loop(ctx: Arc<RouterContext>, shutdown: Shutdown) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(STATS_LOG_INTERVAL) => {
                let up = ctx.outbound.loss_stats();
                let down = ctx.inbound.loss_stats();
                log::info!(
                    "router: up {}/{} dropped ({:.2}%), down {}/{} dropped ({:.2}%), queues {}/{}",
                    up.dropped,
                    up.total,
                    loss_pct(up.dropped, up.total),
                    down.dropped,
                    down.total,
                    loss_pct(down.dropped, down.total),
                    ctx.outbound.queue_len(),
                    ctx.inbound.queue_len(),
                );
            }
        }
    }
}

fn loss_pct(dropped: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        dropped as f64 / total as f64 * 100.0
    }
}

fn tun_reader_loop(tun: Arc<dyn Tun>, ctx: Arc<RouterContext>, shutdown: Shutdown) {
    let rt = tokio::runtime::Handle::current();
    while !shutdown.is_cancelled() {
        match tun.recv() {
            Some(frame) => {
                let ctx = ctx.clone();
                let now_ms = ctx.clock.now_ms();
                rt.spawn(async move { admit_outbound_frame(ctx, frame, now_ms).await });
            }
            None => {
                let err = DtcError::TunIoClosed;
                log::warn!("router: {err}");
                ctx.stats.record_error(&err);
                ctx.emit_event(RouterEvent::Fatal(err.to_string()));
                break;
            }
        }
    }
}

/// Validates the frame's source address against the tun's assigned
/// address before shaping it: a frame claiming to come from anywhere
/// else is dropped, not forwarded.
async fn admit_outbound_frame(ctx: Arc<RouterContext>, frame: Vec<u8>, now_ms: i64) {
    let header = match ipv4::parse_ipv4(&frame) {
        Ok((header, _)) => header,
        Err(e) => {
            log::debug!("router: dropping malformed outbound frame: {e}");
            return;
        }
    };
    if header.src != ctx.tun_addr {
        log::warn!("router: dropping outbound frame with spoofed source {}", header.src);
        return;
    }
    ctx.outbound.submit(frame, now_ms).await;
}

async fn outbound_dispatch_loop(ctx: Arc<RouterContext>, shutdown: Shutdown) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            drained = ctx.outbound.drain(DRAIN_POLL_MS) => {
                if let Some(frame) = drained {
                    let ctx = ctx.clone();
                    tokio::spawn(dispatch_frame(ctx, frame));
                }
            }
        }
    }
}

async fn dispatch_frame(ctx: Arc<RouterContext>, frame: Vec<u8>) {
    let now_ms = ctx.clock.now_ms();
    let (header, l4) = match ipv4::parse_ipv4(&frame) {
        Ok(v) => v,
        Err(e) => {
            log::debug!("router: dropping malformed shaped frame: {e}");
            return;
        }
    };
    match header.protocol {
        IP_PROTO_TCP => match tcp::parse_tcp(l4) {
            Ok((segment, payload)) => {
                tcp_flow::handle_outbound_segment(ctx, header, segment, payload.to_vec(), now_ms)
                    .await
            }
            Err(e) => log::debug!("router: dropping malformed TCP segment: {e}"),
        },
        IP_PROTO_UDP => match udp::parse_udp(l4) {
            Ok((datagram, payload)) => {
                udp_flow::handle_outbound_datagram(ctx, header, datagram, payload.to_vec(), now_ms)
                    .await
            }
            Err(e) => log::debug!("router: dropping malformed UDP datagram: {e}"),
        },
        IP_PROTO_ICMP => match icmp::parse_icmp(l4) {
            Ok((message, rest)) => {
                icmp_flow::handle_outbound(ctx, header, message, rest.to_vec(), now_ms).await
            }
            Err(e) => log::debug!("router: dropping malformed ICMP message: {e}"),
        },
        other => log::debug!("router: dropping unsupported IP protocol {other}"),
    }
}

async fn inbound_writer_loop(tun: Arc<dyn Tun>, ctx: Arc<RouterContext>, shutdown: Shutdown) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            drained = ctx.inbound.drain(DRAIN_POLL_MS) => {
                if let Some(frame) = drained {
                    let len = frame.len();
                    let tun = tun.clone();
                    let write_result = tokio::task::spawn_blocking(move || tun.send(&frame)).await;
                    match write_result {
                        Ok(Ok(())) => ctx.stats.record_sent(len),
                        Ok(Err(e)) => log::debug!("router: tun write failed: {e}"),
                        Err(e) => log::debug!("router: tun write task panicked: {e}"),
                    }
                }
            }
        }
    }
}

async fn sweeper_loop(ctx: Arc<RouterContext>, idle_timeout_ms: i64, shutdown: Shutdown) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(SWEEP_INTERVAL) => {
                let now_ms = ctx.clock.now_ms();
                for session in ctx.tcp_sessions.sweep_idle(now_ms, idle_timeout_ms) {
                    drop(session); // dropping the last Arc closes its channel, ending its flow task
                }
                for session in ctx.udp_sessions.sweep_idle(now_ms, idle_timeout_ms) {
                    session.close();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, SocketAddrV4, TcpListener, UdpSocket};
    use std::time::Duration;

    use crate::checksum::IP_PROTO_ICMP;
    use crate::config::RouterConfig;
    use crate::context::NoopProtector;
    use crate::packet::icmp::{ICMP_ECHO_REQUEST, ICMP_HEADER_LEN};
    use crate::packet::ipv4;
    use crate::packet::tcp::{self, TcpFlags};
    use crate::packet::udp;
    use crate::packet::IpIdGenerator;
    use crate::tun::ChannelTun;

    use super::*;

    fn test_config(tun_addr: Ipv4Addr) -> RouterConfig {
        RouterConfig {
            tun_addr,
            idle_timeout_ms: 300_000,
            profile: crate::profile::NetworkProfile::default(),
            reject_ports: crate::context::RejectList::default_ports(),
        }
    }

    fn recv_frame(
        rx: &mut std::sync::mpsc::Receiver<Vec<u8>>,
        timeout: Duration,
    ) -> Option<Vec<u8>> {
        rx.recv_timeout(timeout).ok()
    }

    fn echo_request_frame(src: Ipv4Addr, dst: Ipv4Addr, id: u16, seq: u16) -> Vec<u8> {
        let mut message = vec![0u8; ICMP_HEADER_LEN + 4];
        message[0] = ICMP_ECHO_REQUEST;
        message[4..6].copy_from_slice(&id.to_be_bytes());
        message[6..8].copy_from_slice(&seq.to_be_bytes());
        let checksum = crate::packet::icmp::icmp_checksum(&message);
        message[2..4].copy_from_slice(&checksum.to_be_bytes());

        let id_gen = IpIdGenerator::new();
        let mut frame = ipv4::build_ipv4_header(src, dst, IP_PROTO_ICMP, message.len(), &id_gen);
        frame.extend_from_slice(&message);
        frame
    }

    #[tokio::test]
    async fn router_relays_an_icmp_echo_request_to_a_synthesised_reply() {
        let (tun, outbound_tx, mut inbound_rx) = ChannelTun::new();
        let tun_addr = Ipv4Addr::new(10, 0, 0, 2);
        let config = RouterConfig {
            tun_addr,
            idle_timeout_ms: 300_000,
            profile: crate::profile::NetworkProfile::default(),
            reject_ports: crate::context::RejectList::default_ports(),
        };

        let (handle, _events) = spawn(Arc::new(tun), Arc::new(NoopProtector), config);

        let request = echo_request_frame(tun_addr, Ipv4Addr::new(8, 8, 8, 8), 0x1234, 1);
        outbound_tx.send(request).unwrap();

        let reply = tokio::time::timeout(
            Duration::from_secs(2),
            tokio::task::spawn_blocking(move || inbound_rx.recv().ok()),
        )
        .await
        .expect("router did not reply in time")
        .unwrap()
        .expect("tun closed without a reply");

        let (ip, l4) = ipv4::parse_ipv4(&reply).unwrap();
        assert_eq!(ip.src, Ipv4Addr::new(8, 8, 8, 8));
        assert_eq!(ip.dst, tun_addr);
        let (icmp, _payload) = crate::packet::icmp::parse_icmp(l4).unwrap();
        assert_eq!(icmp.icmp_type, crate::packet::icmp::ICMP_ECHO_REPLY);
        assert_eq!(icmp.identifier, 0x1234);
        assert_eq!(icmp.sequence, 1);

        handle.stop();
    }

    #[tokio::test]
    async fn router_drops_outbound_frames_with_a_spoofed_source_address() {
        let (tun, outbound_tx, mut inbound_rx) = ChannelTun::new();
        let tun_addr = Ipv4Addr::new(10, 0, 0, 2);
        let config = RouterConfig {
            tun_addr,
            idle_timeout_ms: 300_000,
            profile: crate::profile::NetworkProfile::default(),
            reject_ports: crate::context::RejectList::default_ports(),
        };
        let (handle, _events) = spawn(Arc::new(tun), Arc::new(NoopProtector), config);

        let spoofed = echo_request_frame(
            Ipv4Addr::new(10, 0, 0, 99),
            Ipv4Addr::new(8, 8, 8, 8),
            1,
            1,
        );
        outbound_tx.send(spoofed).unwrap();

        let result = tokio::time::timeout(
            Duration::from_millis(300),
            tokio::task::spawn_blocking(move || inbound_rx.recv().ok()),
        )
        .await;
        assert!(result.is_err(), "spoofed frame should not have produced a reply");

        handle.stop();
    }

    #[tokio::test]
    async fn router_relays_a_tcp_byte_stream_to_a_real_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let dest = match listener.local_addr().unwrap() {
            std::net::SocketAddr::V4(addr) => addr,
            _ => unreachable!(),
        };
        let accepted = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 64];
            let n = std::io::Read::read(&mut stream, &mut buf).unwrap();
            assert_eq!(&buf[..n], b"hello");
            std::io::Write::write_all(&mut stream, b"world").unwrap();
            stream
        });

        let (tun, outbound_tx, mut inbound_rx) = ChannelTun::new();
        let tun_addr = Ipv4Addr::new(10, 0, 0, 2);
        let client = SocketAddrV4::new(tun_addr, 40000);
        let config = test_config(tun_addr);
        let (handle, _events) = spawn(Arc::new(tun), Arc::new(NoopProtector), config);

        let id_gen = IpIdGenerator::new();
        let client_isn = 1000u32;
        let syn = tcp::build_ipv4_tcp_segment(
            *client.ip(),
            *dest.ip(),
            client.port(),
            dest.port(),
            client_isn,
            0,
            TcpFlags { syn: true, ..Default::default() },
            65535,
            &[],
            &id_gen,
        );
        outbound_tx.send(syn).unwrap();

        let syn_ack = recv_frame(&mut inbound_rx, Duration::from_secs(2))
            .expect("router did not send a SYN-ACK");
        let (_, l4) = ipv4::parse_ipv4(&syn_ack).unwrap();
        let (seg, _) = tcp::parse_tcp(l4).unwrap();
        assert!(seg.flags.syn && seg.flags.ack);
        assert_eq!(seg.ack, client_isn + 1);
        let server_isn = seg.seq;

        let data = tcp::build_ipv4_tcp_segment(
            *client.ip(),
            *dest.ip(),
            client.port(),
            dest.port(),
            client_isn + 1,
            server_isn + 1,
            TcpFlags { ack: true, ..Default::default() },
            65535,
            b"hello",
            &id_gen,
        );
        outbound_tx.send(data).unwrap();

        accepted.join().unwrap();

        let mut saw_reply = false;
        for _ in 0..10 {
            let Some(frame) = recv_frame(&mut inbound_rx, Duration::from_secs(2)) else { break };
            let (_, l4) = ipv4::parse_ipv4(&frame).unwrap();
            let (_, payload) = tcp::parse_tcp(l4).unwrap();
            if payload == b"world" {
                saw_reply = true;
                break;
            }
        }
        assert!(saw_reply, "router never relayed the server's reply back to the tun side");

        handle.stop();
    }

    #[tokio::test]
    async fn router_relays_a_udp_round_trip_to_a_real_socket() {
        let server = UdpSocket::bind("127.0.0.1:0").unwrap();
        let dest = match server.local_addr().unwrap() {
            std::net::SocketAddr::V4(addr) => addr,
            _ => unreachable!(),
        };
        let responder = std::thread::spawn(move || {
            let mut buf = [0u8; 64];
            let (n, peer) = server.recv_from(&mut buf).unwrap();
            assert_eq!(&buf[..n], b"ping");
            server.send_to(b"pong", peer).unwrap();
        });

        let (tun, outbound_tx, mut inbound_rx) = ChannelTun::new();
        let tun_addr = Ipv4Addr::new(10, 0, 0, 2);
        let client = SocketAddrV4::new(tun_addr, 41000);
        let config = test_config(tun_addr);
        let (handle, _events) = spawn(Arc::new(tun), Arc::new(NoopProtector), config);

        let id_gen = IpIdGenerator::new();
        let datagram = udp::build_ipv4_udp_packet(
            *client.ip(),
            *dest.ip(),
            client.port(),
            dest.port(),
            b"ping",
            &id_gen,
        );
        outbound_tx.send(datagram).unwrap();

        responder.join().unwrap();

        let reply = recv_frame(&mut inbound_rx, Duration::from_secs(2))
            .expect("router did not relay the server's datagram back");
        let (ip, l4) = ipv4::parse_ipv4(&reply).unwrap();
        assert_eq!(ip.src, *dest.ip());
        assert_eq!(ip.dst, tun_addr);
        let (hdr, payload) = udp::parse_udp(l4).unwrap();
        assert_eq!(hdr.src_port, dest.port());
        assert_eq!(hdr.dst_port, client.port());
        assert_eq!(payload, b"pong");

        handle.stop();
    }
}
