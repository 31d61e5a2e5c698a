use thiserror::Error;

/// The error taxonomy of the router's packet-processing pipeline. None of
/// these ever propagate to the caller of a flow handler: per-packet and
/// per-session failures are absorbed locally, logged, and folded into
/// [`crate::stats::Statistics::record_error`]. Only [`DtcError::TunIoClosed`]
/// additionally raises a [`crate::context::RouterEvent::Fatal`].
#[derive(Debug, Error)]
pub enum DtcError {
    #[error("malformed packet")]
    MalformedPacket,
    #[error("unsupported protocol")]
    UnsupportedProtocol,
    #[error("failed to protect native socket")]
    SocketProtectFailed,
    #[error("native socket I/O error: {0}")]
    NativeSocketIo(#[from] std::io::Error),
    #[error("sequence gap too large")]
    SequenceGapTooLarge,
    #[error("delay queue or reorder buffer full")]
    BufferFull,
    #[error("tun device closed")]
    TunIoClosed,
}

pub type DtcResult<T> = Result<T, DtcError>;
