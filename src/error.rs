//! Error codes returned across the capability/IPC surface.
//!
//! Spells the codes out as a closed enum instead of bare `usize` errno
//! constants, since nothing here crosses a raw syscall ABI boundary.

use core::fmt;

/// Every recognized error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HelError {
    None,
    IllegalArgs,
    IllegalState,
    UnsupportedOperation,
    BadDescriptor,
    NoDescriptor,
    NoMemory,
    NoHardwareSupport,
    BufferTooSmall,
    QueueTooSmall,
    AlreadyExists,
    OutOfBounds,
    Fault,
    RemoteFault,
    LaneShutdown,
    EndOfLane,
    TransmissionMismatch,
    Dismissed,
    ThreadTerminated,
    Cancelled,
}

impl HelError {
    /// Argument errors are always surfaced synchronously.
    pub fn is_argument_error(self) -> bool {
        matches!(
            self,
            HelError::IllegalArgs
                | HelError::BadDescriptor
                | HelError::NoDescriptor
                | HelError::OutOfBounds
                | HelError::BufferTooSmall
                | HelError::QueueTooSmall
        )
    }

    /// Asynchronous I/O errors are reported through the completion queue.
    pub fn is_async_io_error(self) -> bool {
        matches!(
            self,
            HelError::Fault
                | HelError::RemoteFault
                | HelError::LaneShutdown
                | HelError::EndOfLane
                | HelError::TransmissionMismatch
                | HelError::Dismissed
                | HelError::Cancelled
        )
    }
}

impl fmt::Display for HelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

pub type HelResult<T> = Result<T, HelError>;

/// Kept as a free function so call sites read `err(HelError::Fault)`.
#[inline]
pub fn err<T>(code: HelError) -> HelResult<T> {
    Err(code)
}
