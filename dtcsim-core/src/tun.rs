use crate::Buffer;

/// The tun device abstraction a [`crate::router::Router`] reads frames from
/// and writes frames to. Both methods are blocking; the router runs them on
/// blocking-capable tasks rather than the async executor.
pub trait Tun: Send + Sync {
    /// Blocks until a frame is available, or returns `None` once the device
    /// is closed.
    fn recv(&self) -> Option<Buffer>;
    fn send(&self, frame: &[u8]) -> std::io::Result<()>;
}

/// An in-memory [`Tun`] backed by a pair of std channels, standing in for a
/// real `/dev/net/tun` fd in tests: "outbound" is what a process on the
/// device would have written (fed to the router as input), "inbound" is
/// what the router wrote back to the device (observed by the test).
pub struct ChannelTun {
    outbound_rx: std::sync::Mutex<std::sync::mpsc::Receiver<Buffer>>,
    inbound_tx: std::sync::mpsc::Sender<Buffer>,
}

impl ChannelTun {
    pub fn new() -> (Self, std::sync::mpsc::Sender<Buffer>, std::sync::mpsc::Receiver<Buffer>) {
        let (outbound_tx, outbound_rx) = std::sync::mpsc::channel();
        let (inbound_tx, inbound_rx) = std::sync::mpsc::channel();
        (
            Self {
                outbound_rx: std::sync::Mutex::new(outbound_rx),
                inbound_tx,
            },
            outbound_tx,
            inbound_rx,
        )
    }
}

impl Tun for ChannelTun {
    fn recv(&self) -> Option<Buffer> {
        self.outbound_rx.lock().unwrap().recv().ok()
    }

    fn send(&self, frame: &[u8]) -> std::io::Result<()> {
        self.inbound_tx
            .send(frame.to_vec())
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "tun closed"))
    }
}
