//! Bidirectional UDP relay: each client `(src, dst)` pair gets one
//! connected native socket for the session's lifetime. Opens a `socket2`
//! datagram socket, protects its fd, then hands it to tokio.

use std::net::SocketAddrV4;
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::Notify;

use crate::context::{RouterContext, RouterEvent};
use crate::error::DtcError;
use crate::packet::ipv4::Ipv4Header;
use crate::packet::udp::{self, UdpHeader};
use crate::session::{FlowKey, FlowSession, LastActive, Proto};

pub struct UdpSessionState {
    key: FlowKey,
    socket: UdpSocket,
    last_active: LastActive,
    closed: AtomicBool,
    close_notify: Notify,
}

impl FlowSession for UdpSessionState {
    fn last_active_ms(&self) -> i64 {
        self.last_active.get()
    }
}

impl UdpSessionState {
    /// Called by the sweeper when a session is evicted for inactivity, so
    /// its reader task stops promptly instead of leaking until the native
    /// peer happens to send something.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
        self.close_notify.notify_waiters();
    }
}

fn connect_new_socket(ctx: &RouterContext, dest: SocketAddrV4) -> Result<UdpSocket, DtcError> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_nonblocking(true)?;
    socket.bind(&"0.0.0.0:0".parse::<std::net::SocketAddrV4>().unwrap().into())?;
    if !ctx.protector.protect(socket.as_raw_fd()) {
        return Err(DtcError::SocketProtectFailed);
    }
    socket.connect(&std::net::SocketAddr::V4(dest).into())?;
    let std_socket: std::net::UdpSocket = socket.into();
    Ok(UdpSocket::from_std(std_socket)?)
}

/// Entry point for an outbound IPv4 frame whose L4 payload parsed as UDP.
pub async fn handle_outbound_datagram(
    ctx: Arc<RouterContext>,
    header: Ipv4Header,
    incoming: UdpHeader,
    payload: Vec<u8>,
    now_ms: i64,
) {
    let client = SocketAddrV4::new(header.src, incoming.src_port);
    let dest = SocketAddrV4::new(header.dst, incoming.dst_port);
    let key = FlowKey { proto: Proto::Udp, src: client, dst: dest };

    let session = match ctx.udp_sessions.get(&key) {
        Some(session) => session,
        None => match connect_new_socket(&ctx, dest) {
            Ok(socket) => {
                let fresh = Arc::new(UdpSessionState {
                    key,
                    socket,
                    last_active: LastActive::new(now_ms),
                    closed: AtomicBool::new(false),
                    close_notify: Notify::new(),
                });
                let (session, created) = ctx.udp_sessions.get_or_insert_with(key, || fresh.clone());
                if created {
                    tokio::spawn(run_reader(ctx.clone(), key, session.clone()));
                    ctx.emit_event(RouterEvent::SessionEstablished(key));
                }
                session
            }
            Err(err) => {
                match err {
                    DtcError::SocketProtectFailed => {
                        log::warn!("udp: failed to open relay socket to {dest}: {err}")
                    }
                    _ => log::debug!("udp: failed to open relay socket to {dest}: {err}"),
                }
                ctx.stats.record_error(&err);
                return;
            }
        },
    };

    session.last_active.touch(now_ms);
    match session.socket.send(&payload).await {
        Ok(n) => ctx.stats.record_sent(n),
        Err(e) => {
            let err = DtcError::from(e);
            log::debug!("udp: send to {dest} failed: {err}");
            ctx.stats.record_error(&err);
            session.close();
            ctx.udp_sessions.remove(&key);
        }
    }
}

/// Reads replies from the native socket for as long as the session lives,
/// synthesising each one as an inbound IPv4+UDP datagram back to the
/// originating client port.
async fn run_reader(ctx: Arc<RouterContext>, key: FlowKey, session: Arc<UdpSessionState>) {
    let mut buf = vec![0u8; 65536];
    loop {
        tokio::select! {
            biased;
            _ = session.close_notify.notified() => break,
            result = session.socket.recv(&mut buf) => match result {
                Ok(n) => {
                    let now_ms = ctx.clock.now_ms();
                    session.last_active.touch(now_ms);
                    let frame = udp::build_ipv4_udp_packet(
                        *key.dst.ip(),
                        *key.src.ip(),
                        key.dst.port(),
                        key.src.port(),
                        &buf[..n],
                        &ctx.id_gen,
                    );
                    ctx.stats.record_received(n);
                    ctx.inbound.submit(frame, now_ms).await;
                }
                Err(e) => {
                    let err = DtcError::from(e);
                    log::debug!("udp: recv for {key:?} failed: {err}");
                    ctx.stats.record_error(&err);
                    break;
                }
            }
        }
    }
    ctx.udp_sessions.remove(&key);
    ctx.emit_event(RouterEvent::SessionClosed(key));
}
