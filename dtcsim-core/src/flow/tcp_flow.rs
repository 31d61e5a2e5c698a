//! The user-space TCP pseudo-state-machine: enough of RFC 793 to proxy a
//! single end-to-end byte stream onto a real `tokio::net::TcpStream`,
//! without reimplementing congestion control, retransmission, or options.
//! Non-blocking `TcpStream` read/write follows the usual tokio socket
//! wrapper shape; the sequence/ack state machine itself is hand-rolled
//! rather than delegated to a full user-space network stack, since only
//! enough of RFC 793 to proxy one byte stream is needed here.

use std::collections::BTreeMap;
use std::net::SocketAddrV4;
use std::os::fd::AsRawFd;
use std::sync::Arc;

use rand::Rng;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpSocket;
use tokio::sync::{mpsc, Mutex};

use crate::context::{RouterContext, RouterEvent};
use crate::error::DtcError;
use crate::packet::ipv4::Ipv4Header;
use crate::packet::tcp::{self, seq_diff, TcpFlags, TcpHeader};
use crate::session::{FlowKey, FlowSession, LastActive, Proto};

/// One MSS worth of payload read from the native socket per iteration.
const READ_CHUNK: usize = 1400;
/// Total bytes an out-of-order reassembly buffer may hold before further
/// out-of-order segments for the session are simply dropped.
const REORDER_BUFFER_CAP: usize = 64 * 1024;
/// A gap between an incoming segment's sequence number and the session's
/// expected sequence number larger than this is treated as a malformed or
/// spoofed segment rather than legitimate loss-induced reordering.
const MAX_FORWARD_GAP: u32 = 65_535;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    SynReceived,
    Established,
    Closed,
}

struct SeqState {
    conn: ConnState,
    /// Next sequence number this side will send.
    ours: u32,
    /// Next sequence number expected from the peer.
    theirs: u32,
    reorder: BTreeMap<u32, Vec<u8>>,
    reorder_bytes: usize,
}

enum ToSocket {
    Data(Vec<u8>),
    Shutdown,
}

pub struct TcpSessionState {
    key: FlowKey,
    seq: Mutex<SeqState>,
    to_socket: mpsc::Sender<ToSocket>,
    last_active: LastActive,
}

impl FlowSession for TcpSessionState {
    fn last_active_ms(&self) -> i64 {
        self.last_active.get()
    }
}

/// Computes the RFC 793 §3.4-correct reset fields for an unexpected or
/// rejected segment: if the offending segment carries an ACK, the reset's
/// sequence number is that ACK value and it carries no ACK of its own;
/// otherwise the reset has sequence zero and acknowledges the sum of the
/// segment's sequence number and its length (SYN/FIN each count as one
/// octet). Always echoing `SEQ = incoming.seq, ACK = incoming.seq + 1`
/// would be wrong whenever the offending segment is not a bare `SYN`.
fn synth_rst(incoming: &TcpHeader, payload_len: usize) -> (TcpFlags, u32, u32) {
    if incoming.flags.ack {
        (TcpFlags { rst: true, ..Default::default() }, incoming.ack, 0)
    } else {
        let seg_len =
            payload_len as u32 + incoming.flags.syn as u32 + incoming.flags.fin as u32;
        (
            TcpFlags { rst: true, ack: true, ..Default::default() },
            0,
            incoming.seq.wrapping_add(seg_len),
        )
    }
}

/// Builds and shapes a segment travelling from `key.dst` (the real server)
/// back to `key.src` (the tun-side client).
async fn send_inbound(
    ctx: &RouterContext,
    key: FlowKey,
    seq: u32,
    ack: u32,
    flags: TcpFlags,
    payload: &[u8],
    now_ms: i64,
) {
    let frame = tcp::build_ipv4_tcp_segment(
        *key.dst.ip(),
        *key.src.ip(),
        key.dst.port(),
        key.src.port(),
        seq,
        ack,
        flags,
        65535,
        payload,
        &ctx.id_gen,
    );
    ctx.inbound.submit(frame, now_ms).await;
}

/// Entry point for an outbound IPv4 frame whose L4 payload parsed as TCP.
pub async fn handle_outbound_segment(
    ctx: Arc<RouterContext>,
    header: Ipv4Header,
    incoming: TcpHeader,
    payload: Vec<u8>,
    now_ms: i64,
) {
    let client = SocketAddrV4::new(header.src, incoming.src_port);
    let dest = SocketAddrV4::new(header.dst, incoming.dst_port);
    let key = FlowKey { proto: Proto::Tcp, src: client, dst: dest };

    if let Some(session) = ctx.tcp_sessions.get(&key) {
        handle_existing(&ctx, &session, incoming, payload, now_ms).await;
        return;
    }

    if !incoming.flags.syn || incoming.flags.ack {
        // No session and not a fresh connection attempt: reset it, per the
        // corrected RFC 793 §3.4 rule.
        let (flags, seq, ack) = synth_rst(&incoming, payload.len());
        send_inbound(&ctx, key, seq, ack, flags, &[], now_ms).await;
        return;
    }

    if ctx.reject_list.contains(dest.port()) {
        log::debug!("tcp: rejecting connection to blocked port {}", dest.port());
        let (flags, seq, ack) = synth_rst(&incoming, payload.len());
        send_inbound(&ctx, key, seq, ack, flags, &[], now_ms).await;
        return;
    }

    let socket = match TcpSocket::new_v4() {
        Ok(s) => s,
        Err(e) => {
            let err = DtcError::from(e);
            log::warn!("tcp: failed to allocate native socket: {err}");
            ctx.stats.record_error(&err);
            return;
        }
    };
    if !ctx.protector.protect(socket.as_raw_fd()) {
        let err = DtcError::SocketProtectFailed;
        log::warn!("tcp: protect() refused a new socket for {dest}: {err}");
        ctx.stats.record_error(&err);
        return;
    }

    let ours: u32 = rand::thread_rng().gen();
    let theirs = incoming.seq.wrapping_add(1);
    let (to_socket_tx, to_socket_rx) = mpsc::channel(64);
    let session = Arc::new(TcpSessionState {
        key,
        seq: Mutex::new(SeqState {
            conn: ConnState::SynReceived,
            ours: ours.wrapping_add(1),
            theirs,
            reorder: BTreeMap::new(),
            reorder_bytes: 0,
        }),
        to_socket: to_socket_tx,
        last_active: LastActive::new(now_ms),
    });
    let (_, created) = ctx.tcp_sessions.get_or_insert_with(key, || session.clone());
    if !created {
        // Another outbound SYN for the same flow raced this one into the
        // table first; drop the socket we just opened and let the winner's
        // reply stand rather than sending a duplicate SYN-ACK.
        return;
    }
    ctx.emit_event(RouterEvent::SessionEstablished(key));

    tokio::spawn(run_flow_task(ctx.clone(), key, socket, dest, to_socket_rx));

    send_inbound(
        &ctx,
        key,
        ours,
        theirs,
        TcpFlags { syn: true, ack: true, ..Default::default() },
        &[],
        now_ms,
    )
    .await;
}

async fn handle_existing(
    ctx: &Arc<RouterContext>,
    session: &Arc<TcpSessionState>,
    incoming: TcpHeader,
    payload: Vec<u8>,
    now_ms: i64,
) {
    session.last_active.touch(now_ms);
    let key = session.key;

    if incoming.flags.rst {
        ctx.tcp_sessions.remove(&key);
        ctx.emit_event(RouterEvent::SessionClosed(key));
        return;
    }

    if incoming.flags.syn {
        // Retransmitted SYN-ACK request: re-send ours with the original seq.
        let state = session.seq.lock().await;
        let seq = state.ours.wrapping_sub(1);
        let ack = state.theirs;
        drop(state);
        send_inbound(
            ctx,
            key,
            seq,
            ack,
            TcpFlags { syn: true, ack: true, ..Default::default() },
            &[],
            now_ms,
        )
        .await;
        return;
    }

    let mut forwardable: Vec<u8> = Vec::new();
    let (reply_seq, reply_ack, should_close) = {
        let mut state = session.seq.lock().await;

        if state.conn == ConnState::SynReceived && incoming.flags.ack {
            state.conn = ConnState::Established;
        }

        if !payload.is_empty() {
            match seq_diff(incoming.seq, state.theirs) {
                diff if diff < 0 => {
                    // Fully-old retransmission: just re-ack below.
                }
                0 => {
                    state.theirs = state.theirs.wrapping_add(payload.len() as u32);
                    forwardable.extend_from_slice(&payload);
                    drain_reorder_buffer(&mut state, &mut forwardable);
                }
                diff if (diff as u32) <= MAX_FORWARD_GAP => {
                    if state.reorder_bytes + payload.len() <= REORDER_BUFFER_CAP {
                        state.reorder_bytes += payload.len();
                        state.reorder.insert(incoming.seq, payload.clone());
                    } else {
                        let err = DtcError::BufferFull;
                        log::debug!("tcp: reorder buffer full for {:?}: {err}", key);
                        ctx.stats.record_error(&err);
                    }
                }
                _ => {
                    let err = DtcError::SequenceGapTooLarge;
                    log::debug!("tcp: dropping segment for {:?}: {err}", key);
                    ctx.stats.record_error(&err);
                }
            }
        }

        let mut close = false;
        if incoming.flags.fin {
            state.theirs = state
                .theirs
                .wrapping_add(payload.len() as u32)
                .wrapping_add(1);
            state.ours = state.ours.wrapping_add(1);
            state.conn = ConnState::Closed;
            close = true;
        }
        (state.ours, state.theirs, close)
    };

    if !forwardable.is_empty() {
        let _ = session.to_socket.send(ToSocket::Data(forwardable)).await;
    }

    let flags = if should_close {
        TcpFlags { fin: true, ack: true, ..Default::default() }
    } else {
        TcpFlags { ack: true, ..Default::default() }
    };
    send_inbound(ctx, key, reply_seq, reply_ack, flags, &[], now_ms).await;

    if should_close {
        let _ = session.to_socket.send(ToSocket::Shutdown).await;
        ctx.tcp_sessions.remove(&key);
        ctx.emit_event(RouterEvent::SessionClosed(key));
    }
}

fn drain_reorder_buffer(state: &mut SeqState, forwardable: &mut Vec<u8>) {
    loop {
        let next_key = match state.reorder.keys().next().copied() {
            Some(k) => k,
            None => return,
        };
        if seq_diff(next_key, state.theirs) > 0 {
            return;
        }
        let chunk = state.reorder.remove(&next_key).unwrap();
        state.reorder_bytes -= chunk.len();
        let overlap = seq_diff(state.theirs, next_key).max(0) as usize;
        if overlap < chunk.len() {
            forwardable.extend_from_slice(&chunk[overlap..]);
            state.theirs = state.theirs.wrapping_add((chunk.len() - overlap) as u32);
        }
    }
}

/// Owns the native `TcpStream` for one session's lifetime: connects, then
/// shuttles bytes between the socket and the session's channel until
/// either side closes or errors.
async fn run_flow_task(
    ctx: Arc<RouterContext>,
    key: FlowKey,
    socket: TcpSocket,
    dest: SocketAddrV4,
    mut to_socket_rx: mpsc::Receiver<ToSocket>,
) {
    let mut stream = match socket.connect(dest.into()).await {
        Ok(s) => s,
        Err(e) => {
            let err = DtcError::from(e);
            log::debug!("tcp: connect to {dest} failed: {err}");
            ctx.stats.record_error(&err);
            ctx.tcp_sessions.remove(&key);
            return;
        }
    };

    let mut read_buf = vec![0u8; READ_CHUNK];
    loop {
        tokio::select! {
            msg = to_socket_rx.recv() => match msg {
                Some(ToSocket::Data(bytes)) => {
                    if let Err(e) = stream.write_all(&bytes).await {
                        let err = DtcError::from(e);
                        log::debug!("tcp: write to {dest} failed: {err}");
                        ctx.stats.record_error(&err);
                        break;
                    }
                }
                Some(ToSocket::Shutdown) => {
                    let _ = stream.shutdown().await;
                }
                None => break,
            },
            result = stream.read(&mut read_buf) => {
                match result {
                    Ok(0) => {
                        emit_remote_close(&ctx, key).await;
                        break;
                    }
                    Ok(n) => {
                        emit_data(&ctx, key, &read_buf[..n]).await;
                    }
                    Err(e) => {
                        let err = DtcError::from(e);
                        log::debug!("tcp: read from {dest} failed: {err}");
                        ctx.stats.record_error(&err);
                        break;
                    }
                }
            }
        }
    }
    ctx.tcp_sessions.remove(&key);
}

async fn emit_data(ctx: &Arc<RouterContext>, key: FlowKey, data: &[u8]) {
    let Some(session) = ctx.tcp_sessions.get(&key) else { return };
    for chunk in data.chunks(READ_CHUNK) {
        let (seq, ack) = {
            let mut state = session.seq.lock().await;
            let seq = state.ours;
            state.ours = state.ours.wrapping_add(chunk.len() as u32);
            (seq, state.theirs)
        };
        let now_ms = ctx.clock.now_ms();
        send_inbound(
            ctx,
            key,
            seq,
            ack,
            TcpFlags { ack: true, psh: true, ..Default::default() },
            chunk,
            now_ms,
        )
        .await;
        ctx.stats.record_received(chunk.len());
    }
}

async fn emit_remote_close(ctx: &Arc<RouterContext>, key: FlowKey) {
    let Some(session) = ctx.tcp_sessions.get(&key) else { return };
    let (seq, ack) = {
        let mut state = session.seq.lock().await;
        let seq = state.ours;
        state.ours = state.ours.wrapping_add(1);
        (seq, state.theirs)
    };
    let now_ms = ctx.clock.now_ms();
    send_inbound(
        ctx,
        key,
        seq,
        ack,
        TcpFlags { fin: true, ack: true, ..Default::default() },
        &[],
        now_ms,
    )
    .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(seq: u32, ack: u32, flags: TcpFlags) -> TcpHeader {
        TcpHeader {
            src_port: 1234,
            dst_port: 80,
            seq,
            ack,
            data_offset: 5,
            flags,
            window: 65535,
        }
    }

    #[test]
    fn rst_from_ack_bearing_segment_echoes_its_ack_as_seq() {
        let incoming = header(100, 55, TcpFlags { ack: true, ..Default::default() });
        let (flags, seq, ack) = synth_rst(&incoming, 0);
        assert!(flags.rst && !flags.ack);
        assert_eq!(seq, 55);
        assert_eq!(ack, 0);
    }

    #[test]
    fn rst_from_bare_syn_acknowledges_one_octet() {
        let incoming = header(100, 0, TcpFlags { syn: true, ..Default::default() });
        let (flags, seq, ack) = synth_rst(&incoming, 0);
        assert!(flags.rst && flags.ack);
        assert_eq!(seq, 0);
        assert_eq!(ack, 101);
    }

    #[test]
    fn rst_accounts_for_payload_length() {
        let incoming = header(100, 0, TcpFlags::default());
        let (_, _, ack) = synth_rst(&incoming, 50);
        assert_eq!(ack, 150);
    }

    #[test]
    fn reorder_buffer_drains_contiguous_runs_in_order() {
        let mut state = SeqState {
            conn: ConnState::Established,
            ours: 1,
            theirs: 105, // "hello" (100..105) already applied by the caller
            reorder: BTreeMap::new(),
            reorder_bytes: 5,
        };
        state.reorder.insert(110, b"world".to_vec());
        let mut forwardable = b"hello".to_vec();
        drain_reorder_buffer(&mut state, &mut forwardable);
        assert_eq!(forwardable, b"helloworld");
        assert_eq!(state.theirs, 115);
        assert!(state.reorder.is_empty());
    }
}
