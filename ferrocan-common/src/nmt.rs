//! NMT state and reset-command types.
//!
//! The NMT state machine itself lives in the protocol stack; the runtime only
//! transports its states and obeys the reset command returned by each
//! mainline step.

/// NMT states of a CANopen node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NmtState {
    /// Transient state entered at boot; left automatically.
    Initializing = 0,
    /// Node is stopped; only NMT and heartbeat are serviced.
    Stopped = 4,
    /// Normal operation, PDO traffic enabled.
    Operational = 5,
    /// Waiting for the start command.
    PreOperational = 127,
}

impl core::fmt::Display for NmtState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            NmtState::Initializing => "initializing",
            NmtState::Stopped => "stopped",
            NmtState::Operational => "operational",
            NmtState::PreOperational => "pre-operational",
        };
        write!(f, "{s}")
    }
}

/// Reset command returned by the mainline protocol step.
///
/// Drives the orchestrator's outer reset loop: `Communication` re-runs the
/// communication-reset cycle, `Application` and `Quit` leave it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NmtResetCommand {
    /// Keep running.
    #[default]
    None,
    /// NMT reset-communication was requested.
    Communication,
    /// NMT reset-application (reset node) was requested.
    Application,
    /// Orderly program termination was requested (e.g. by the gateway).
    Quit,
}

impl NmtResetCommand {
    /// True if the inner run loop should be left.
    pub fn leaves_run_loop(&self) -> bool {
        !matches!(self, NmtResetCommand::None)
    }

    /// True if the whole reset loop should be left.
    pub fn leaves_reset_loop(&self) -> bool {
        matches!(self, NmtResetCommand::Application | NmtResetCommand::Quit)
    }
}
