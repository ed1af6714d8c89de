use nix::errno::Errno;
use snafu::Snafu;

use crate::pages::Status;

/// Errors surfaced by the controller engine. Recoverable failures are always
/// values; the only panics in this crate are invariant assertions.
#[derive(Debug, Snafu, Clone, PartialEq)]
#[snafu(visibility(pub(crate)))]
pub enum NvmeError {
    #[snafu(display("register access failed: {}", source))]
    RegisterAccess { source: Errno },

    #[snafu(display("admin command failed: {}", status))]
    AdminCommand { status: Status },

    #[snafu(display("admin command timed out after {} ms", timeout_ms))]
    AdminTimeout { timeout_ms: u32 },

    #[snafu(display("initialization timed out in state '{}'", state))]
    InitTimeout { state: &'static str },

    #[snafu(display("controller is in '{}' state, operation not possible", state))]
    InvalidState { state: &'static str },

    #[snafu(display("reset dispatch failed: {}", source))]
    ResetDispatch { source: Errno },

    #[snafu(display("controller reinitialization is in progress"))]
    ReconnectInProgress,

    #[snafu(display("qpair allocation failed: {}", source))]
    QpairAlloc { source: Errno },

    #[snafu(display("qpair connect failed: {}", source))]
    QpairConnect { source: Errno },

    #[snafu(display("unknown I/O qpair {}", qid))]
    UnknownQpair { qid: u16 },

    #[snafu(display("no free I/O queue IDs"))]
    NoFreeQid,

    #[snafu(display("invalid queue priority {}", qprio))]
    InvalidQprio { qprio: u8 },

    #[snafu(display("device was removed"))]
    DeviceRemoved,

    #[snafu(display("controller is in failed state"))]
    ControllerFailed,

    #[snafu(display("operation not supported: {}", source))]
    NotSupported { source: Errno },

    #[snafu(display("invalid argument: {}", source))]
    InvalidParam { source: Errno },

    #[snafu(display("transport error: {}", source))]
    Transport { source: Errno },

    #[snafu(display("operation already in progress"))]
    AlreadyInProgress,

    #[snafu(display("boot partition I/O failed: {}", source))]
    BootPartition { source: Errno },
}

impl NvmeError {
    /// Errno equivalent for callers that speak POSIX codes.
    pub fn errno(&self) -> Errno {
        match self {
            NvmeError::RegisterAccess { source } => *source,
            NvmeError::AdminCommand { .. } => Errno::EIO,
            NvmeError::AdminTimeout { .. } => Errno::ETIMEDOUT,
            NvmeError::InitTimeout { .. } => Errno::ETIMEDOUT,
            NvmeError::InvalidState { .. } => Errno::EBUSY,
            NvmeError::ResetDispatch { source } => *source,
            NvmeError::ReconnectInProgress => Errno::EAGAIN,
            NvmeError::QpairAlloc { source } => *source,
            NvmeError::QpairConnect { source } => *source,
            NvmeError::UnknownQpair { .. } => Errno::ENOENT,
            NvmeError::NoFreeQid => Errno::ENOSPC,
            NvmeError::InvalidQprio { .. } => Errno::EINVAL,
            NvmeError::DeviceRemoved => Errno::ENODEV,
            NvmeError::ControllerFailed => Errno::ENXIO,
            NvmeError::NotSupported { source } => *source,
            NvmeError::InvalidParam { source } => *source,
            NvmeError::Transport { source } => *source,
            NvmeError::AlreadyInProgress => Errno::EALREADY,
            NvmeError::BootPartition { source } => *source,
        }
    }
}
