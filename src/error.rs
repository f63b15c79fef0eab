use crate::protocol::ProtocolError;
use crate::queue::QueueFull;

/// Why a parameter read produced no value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ReadError {
    #[error("message queue full")]
    QueueFull,
    #[error("all read slots are in use")]
    NoFreeSlot,
    #[error("request never reached the bus")]
    SendTimeout,
    #[error("no response from the addressed controller")]
    AckTimeout,
    #[error("controller firmware does not support parameter reads")]
    CapabilityDenied,
    #[error("controller acknowledged the request without returning data")]
    NoData,
    #[error("read ticket already consumed")]
    Stale,
}

impl From<QueueFull> for ReadError {
    fn from(_: QueueFull) -> Self {
        ReadError::QueueFull
    }
}

/// Errors surfaced by the foreground bus API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum BusError {
    #[error(transparent)]
    QueueFull(#[from] QueueFull),
    #[error("parameter read failed: {0}")]
    Read(#[from] ReadError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("device number {0} is not addressable (expected 1..=63)")]
    InvalidAddress(u8),
    #[error("dispatcher stopped")]
    Disconnected,
}
