//! Interfaces to the external protocol stack.
//!
//! The CANopen state machines (NMT, SDO, PDO, heartbeat, emergency, LSS,
//! SYNC, TIME) and the ASCII gateway command parser live outside this crate.
//! The orchestrator drives them through these traits; implementations keep
//! their own object dictionary and internal locking (see
//! [`SharedRegion`](crate::storage::SharedRegion) for the data regions that
//! PDO processing and the storage engine share).

use ferrocan_common::{CoError, NmtResetCommand, TimeOfDay};

use crate::can::CanModule;
use crate::event_loop::WakeupHandle;
use crate::storage::{SharedRegion, Storage};

/// Emergency conditions the runtime reports into the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmergencyKind {
    /// Storage init found a missing or corrupt file.
    NonVolatileMemory,
    /// An auto-save pass failed (edge-debounced by the orchestrator).
    NonVolatileAutoSave,
    /// Protocol init rejected object-dictionary parameters.
    InconsistentObjectDict,
}

/// Pending bitrate and node-id, persisted across boots and mutable by an
/// LSS master. The values take effect at the next communication reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodePersist {
    /// Pending CAN bitrate in kbit/s (informational under SocketCAN; the
    /// operator configures the actual bitrate via `ip link`).
    pub pending_bitrate: u16,
    /// Pending node-id, 1..=127 or 0xFF for unconfigured.
    pub pending_node_id: u8,
}

impl NodePersist {
    /// Byte length of the persisted image.
    pub const LEN: usize = 3;

    /// Decode from a storage region (little-endian bitrate, then node-id).
    pub fn load(region: &SharedRegion) -> Self {
        let bytes = region.lock().unwrap();
        Self {
            pending_bitrate: u16::from_le_bytes([bytes[0], bytes[1]]),
            pending_node_id: bytes[2],
        }
    }

    /// Encode into a storage region.
    pub fn store(&self, region: &SharedRegion) {
        let mut bytes = region.lock().unwrap();
        bytes[0..2].copy_from_slice(&self.pending_bitrate.to_le_bytes());
        bytes[2] = self.pending_node_id;
    }
}

/// Context handed to [`MainlineStack::process`] once per mainline iteration.
pub struct MainlineCtx<'a> {
    /// Time since the previous iteration, µs.
    pub time_difference_us: u32,
    /// The stack may lower this to request an earlier next wake-up.
    pub timer_next_us: &'a mut u32,
    /// Storage engine, for explicit 0x1010/0x1011 command handling.
    pub storage: &'a mut Storage,
    /// Whether gateway command processing is enabled this iteration.
    pub gateway_enabled: bool,
}

/// The mainline half of the protocol stack: everything that is not
/// timing-critical (NMT, SDO server/client, heartbeat, emergency, LSS,
/// gateway commands).
pub trait MainlineStack: Send {
    /// Communication reset: (re-)initialize the protocol modules against the
    /// freshly configured CAN module and register RX/TX buffers. Called with
    /// the module in configuration mode.
    ///
    /// `wakeup` must be registered on every module that can produce
    /// mainline-visible events from the RT context; triggering it is how an
    /// RT-side callback gets the mainline to run before its next timer tick.
    ///
    /// A non-fatal object-dictionary inconsistency is reported by returning
    /// its nonzero info code; the orchestrator turns it into an
    /// [`EmergencyKind::InconsistentObjectDict`] emergency and keeps going.
    /// Returning an error aborts startup.
    fn communication_reset(
        &mut self,
        can: &mut CanModule,
        wakeup: WakeupHandle,
    ) -> Result<u32, CoError>;

    /// Initialize PDOs, after the first part of the reset cycle. Errors
    /// other than [`CoError::NodeIdUnconfiguredLss`] abort startup.
    fn init_pdo(&mut self, can: &mut CanModule) -> Result<(), CoError>;

    /// One mainline protocol step. Returns the NMT reset command that
    /// drives the orchestrator's reset loop.
    fn process(&mut self, ctx: &mut MainlineCtx<'_>) -> NmtResetCommand;

    /// True while no node-id is configured (LSS assignment pending); most
    /// protocol processing is suspended then.
    fn node_id_unconfigured(&self) -> bool;

    /// Seed the TIME producer with the startup wall-clock reading.
    /// Called once, on the first reset cycle.
    fn set_time(&mut self, time: TimeOfDay, interval_ms: u32);

    /// Report an emergency condition.
    fn report_emergency(&mut self, kind: EmergencyKind, info: u32);

    /// Clear a previously reported emergency condition.
    fn clear_emergency(&mut self, kind: EmergencyKind);
}

/// The timing-critical half of the protocol stack: SYNC, then RPDO, then
/// TPDO, executed under the object-dictionary locking discipline of the
/// implementation.
pub trait RtStack: Send {
    /// One RT step. `timer_next_us` is Some in single-thread composition,
    /// where SYNC/PDO deadlines may shorten the next mainline wake-up; in
    /// the dedicated RT thread it is None.
    ///
    /// Only called while the CAN module is in normal mode; implementations
    /// must still tolerate a concurrent flip to configuration mode and must
    /// not act on OD data past it.
    fn process(&mut self, time_difference_us: u32, timer_next_us: Option<&mut u32>);
}

/// Byte transport interface of the ASCII gateway command parser.
///
/// The runtime only routes bytes: input chunks from the connection are fed
/// in, response bytes are pulled out through a non-blocking writer.
pub trait GatewayParser: Send {
    /// Free space in the parser's input buffer; the gateway never reads more
    /// than this from the connection.
    fn free_space(&self) -> usize;

    /// Feed input bytes (at most the last reported free space).
    fn feed(&mut self, data: &[u8]);

    /// Drain pending response bytes through `write`. The writer returns the
    /// number of bytes taken; 0 means back-pressure (retry on a later
    /// iteration). When the connection is gone the writer swallows the
    /// bytes, reporting them as written.
    fn poll_response(&mut self, write: &mut dyn FnMut(&[u8]) -> usize);
}
