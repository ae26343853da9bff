use std::io;
use std::time::Duration;

use crate::codec::CodecError;

/// Startup-time failures while loading or attaching the packet filter.
///
/// None of these are retryable: they mean the host cannot run the agent.
#[derive(Debug, thiserror::Error)]
pub enum FilterError {
    #[error("network interface {0} does not exist")]
    InterfaceNotFound(String),
    #[error("cannot lift the locked-memory limit: {0}")]
    ResourceLimit(#[source] io::Error),
    #[error("failed to load eBPF object: {0}")]
    Load(String),
    #[error("failed to attach XDP program to {ifname}: {reason}")]
    Attach { ifname: String, reason: String },
    #[error("capture stream read failed: {0}")]
    EventRead(String),
    #[error("packet filter is already attached")]
    AlreadyAttached,
}

/// Failures mutating or reading the in-kernel target table.
#[derive(Debug, thiserror::Error)]
pub enum TableError {
    #[error("target table is not available (filter not attached)")]
    Unavailable,
    #[error("target not present in table")]
    NotFound,
    #[error("target table operation failed: {0}")]
    Map(String),
}

/// Anything that ends a control-channel session.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("coordinator socket error: {0}")]
    Io(#[from] io::Error),
    #[error("no datagram from coordinator within {0:?}")]
    ReadTimeout(Duration),
    #[error("malformed datagram from coordinator: {0}")]
    Malformed(#[source] CodecError),
    #[error("hello count mismatch persisted for {0} rounds")]
    LoopGuard(u32),
    #[error("not connected to coordinator")]
    NotConnected,
    #[error("session reader stopped unexpectedly")]
    ReaderStopped,
}
