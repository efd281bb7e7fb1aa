//! The flat error taxonomy shared by all runtime operations.

use snafu::Snafu;

/// Result of a fallible runtime operation.
///
/// Transient I/O conditions (EAGAIN, EINTR) are always recovered locally and
/// never surface here; `TxBusy` is the one deliberate exception, telling the
/// caller that a frame was queued for the deferred re-send path.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum CoError {
    /// An argument was out of range or an object was used before init.
    #[snafu(display("illegal argument"))]
    IllegalArgument,

    /// An allocation failed.
    #[snafu(display("out of memory"))]
    OutOfMemory,

    /// A system call failed; the underlying errno is preserved.
    #[snafu(display("syscall failed during {context}: {source}"))]
    Syscall {
        /// Which operation failed.
        context: &'static str,
        /// The OS error.
        source: std::io::Error,
    },

    /// Operation attempted in the wrong lifecycle phase (e.g. adding an
    /// interface while the module is in normal mode).
    #[snafu(display("invalid state for operation"))]
    InvalidState,

    /// TX could not complete now; the frame is pending deferred re-send.
    #[snafu(display("CAN TX busy"))]
    TxBusy,

    /// A TX buffer was overwritten before its frame went out.
    #[snafu(display("CAN TX overflow"))]
    TxOverflow,

    /// Stored data is missing or failed CRC verification.
    #[snafu(display("stored data corrupt"))]
    DataCorrupt,

    /// The protocol stack rejected object-dictionary parameters.
    #[snafu(display("object dictionary parameters inconsistent (info {info:#x})"))]
    OdParameters {
        /// Stack-specific detail code for the offending entry.
        info: u32,
    },

    /// No node-id is configured and LSS assignment is pending.
    #[snafu(display("node-id unconfigured, waiting for LSS"))]
    NodeIdUnconfiguredLss,
}

impl CoError {
    /// Wrap the current `errno` with an operation label.
    pub fn last_os_error(context: &'static str) -> Self {
        CoError::Syscall {
            context,
            source: std::io::Error::last_os_error(),
        }
    }

    /// Wrap an [`std::io::Error`] with an operation label.
    pub fn syscall(context: &'static str, source: std::io::Error) -> Self {
        CoError::Syscall { context, source }
    }
}
