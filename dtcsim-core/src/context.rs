//! Collaborators shared by every flow handler, bundled into one struct so
//! individual flow modules stay free of wiring code.

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::os::fd::RawFd;
use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::clock::Clock;
use crate::packet::IpIdGenerator;
use crate::session::{FlowKey, SessionTable};
use crate::shaper::Shaper;
use crate::stats::Statistics;

/// Hands a freshly-created native socket's raw fd to the embedder before it
/// connects, e.g. to bind it to a particular network so it bypasses the tun
/// device it is itself relaying for. Returns `false` to refuse the socket.
pub trait SocketProtector: Send + Sync {
    fn protect(&self, fd: RawFd) -> bool;
}

/// The default protector for platforms/tests with nothing to bypass.
pub struct NoopProtector;

impl SocketProtector for NoopProtector {
    fn protect(&self, _fd: RawFd) -> bool {
        true
    }
}

/// Notable lifecycle events a [`crate::router::Router`] reports to its
/// embedder over a bounded channel, replacing the source's pair of
/// `OnEstablishListener`/`OnDisconnectListener` callback interfaces with a
/// single event enum.
#[derive(Debug, Clone)]
pub enum RouterEvent {
    SessionEstablished(FlowKey),
    SessionClosed(FlowKey),
    Fatal(String),
}

/// TCP destination ports outbound `SYN`s are rejected for, synthesising an
/// RST instead of opening a native connection. Defaults to port 853
/// (DNS-over-TLS).
pub struct RejectList(ArcSwap<HashSet<u16>>);

impl RejectList {
    pub fn new(ports: HashSet<u16>) -> Self {
        Self(ArcSwap::from_pointee(ports))
    }

    pub fn default_ports() -> HashSet<u16> {
        let mut set = HashSet::new();
        set.insert(853);
        set
    }

    pub fn contains(&self, port: u16) -> bool {
        self.0.load().contains(&port)
    }

    pub fn replace(&self, ports: HashSet<u16>) {
        self.0.store(Arc::new(ports));
    }
}

impl Default for RejectList {
    fn default() -> Self {
        Self::new(Self::default_ports())
    }
}

use crate::flow::tcp_flow::TcpSessionState;
use crate::flow::udp_flow::UdpSessionState;

/// Everything a flow handler needs that isn't specific to one packet:
/// shared tables, shapers, id allocation, and the knobs an embedder can
/// turn at runtime. One instance is built per [`crate::router::Router`] and
/// handed to every spawned flow task as an `Arc`.
pub struct RouterContext {
    pub tun_addr: Ipv4Addr,
    pub clock: Arc<dyn Clock>,
    pub id_gen: IpIdGenerator,
    pub protector: Arc<dyn SocketProtector>,
    pub outbound: Arc<Shaper>,
    pub inbound: Arc<Shaper>,
    pub tcp_sessions: Arc<SessionTable<TcpSessionState>>,
    pub udp_sessions: Arc<SessionTable<UdpSessionState>>,
    pub reject_list: RejectList,
    pub stats: Arc<Statistics>,
    pub events: tokio::sync::mpsc::Sender<RouterEvent>,
}

impl RouterContext {
    pub fn emit_event(&self, event: RouterEvent) {
        // A full event channel must never block or panic packet processing;
        // if the embedder isn't draining it, drop the event.
        let _ = self.events.try_send(event);
    }
}
