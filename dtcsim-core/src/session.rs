use std::collections::HashMap;
use std::net::SocketAddrV4;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

/// UDP or TCP, the only two protocols that keep flow state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Proto {
    Udp,
    Tcp,
}

/// `(proto, src_addr, src_port, dst_addr, dst_port)`, the primary key of a
/// [`SessionTable`]. ICMP keeps no key: replies are synthesised immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub proto: Proto,
    pub src: SocketAddrV4,
    pub dst: SocketAddrV4,
}

/// Anything kept in a [`SessionTable`] must expose when it was last active
/// so the sweeper can evict it.
pub trait FlowSession: Send + Sync {
    fn last_active_ms(&self) -> i64;
}

/// A last-active timestamp any session can embed and update via
/// `touch`, shared by [`crate::flow::tcp_flow::TcpSessionState`] and
/// [`crate::flow::udp_flow::UdpSessionState`].
pub struct LastActive(AtomicI64);

impl LastActive {
    pub fn new(now_ms: i64) -> Self {
        Self(AtomicI64::new(now_ms))
    }
    pub fn touch(&self, now_ms: i64) {
        self.0.store(now_ms, Ordering::Relaxed);
    }
    pub fn get(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// A keyed map of flows to session state, one instance each for UDP and
/// TCP. Thread-safe: the map itself is guarded by a single lock; per-session
/// mutation is the session type's own responsibility (typically a
/// `tokio::sync::Mutex` around its mutable fields).
pub struct SessionTable<S: FlowSession> {
    sessions: Mutex<HashMap<FlowKey, Arc<S>>>,
}

impl<S: FlowSession> SessionTable<S> {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &FlowKey) -> Option<Arc<S>> {
        self.sessions.lock().unwrap().get(key).cloned()
    }

    /// Returns the existing session for `key`, or inserts the value
    /// produced by `make` and returns that. `make` is only invoked when no
    /// session exists.
    pub fn get_or_insert_with(&self, key: FlowKey, make: impl FnOnce() -> Arc<S>) -> (Arc<S>, bool) {
        let mut guard = self.sessions.lock().unwrap();
        match guard.get(&key) {
            Some(existing) => (existing.clone(), false),
            None => {
                let session = make();
                guard.insert(key, session.clone());
                (session, true)
            }
        }
    }

    pub fn remove(&self, key: &FlowKey) -> Option<Arc<S>> {
        self.sessions.lock().unwrap().remove(key)
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes and returns every session idle for longer than `timeout_ms`.
    /// The caller is responsible for closing whatever native resources the
    /// returned sessions own.
    pub fn sweep_idle(&self, now_ms: i64, timeout_ms: i64) -> Vec<Arc<S>> {
        let mut guard = self.sessions.lock().unwrap();
        let expired: Vec<FlowKey> = guard
            .iter()
            .filter(|(_, session)| now_ms - session.last_active_ms() > timeout_ms)
            .map(|(key, _)| *key)
            .collect();
        expired
            .into_iter()
            .filter_map(|key| guard.remove(&key))
            .collect()
    }
}

impl<S: FlowSession> Default for SessionTable<S> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    struct Fake(LastActive);
    impl FlowSession for Fake {
        fn last_active_ms(&self) -> i64 {
            self.0.get()
        }
    }

    fn key(port: u16) -> FlowKey {
        FlowKey {
            proto: Proto::Udp,
            src: SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), port),
            dst: SocketAddrV4::new(Ipv4Addr::new(8, 8, 8, 8), 53),
        }
    }

    #[test]
    fn get_or_insert_only_constructs_once() {
        let table: SessionTable<Fake> = SessionTable::new();
        let mut constructed = 0;
        for _ in 0..3 {
            table.get_or_insert_with(key(1), || {
                constructed += 1;
                Arc::new(Fake(LastActive::new(0)))
            });
        }
        assert_eq!(constructed, 1);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn sweep_idle_evicts_past_timeout_only() {
        let table: SessionTable<Fake> = SessionTable::new();
        table.get_or_insert_with(key(1), || Arc::new(Fake(LastActive::new(0))));
        table.get_or_insert_with(key(2), || Arc::new(Fake(LastActive::new(290_000))));
        let evicted = table.sweep_idle(310_000, 300_000);
        assert_eq!(evicted.len(), 1);
        assert_eq!(table.len(), 1);
    }
}
