//! Per-interface bus-state machine driven by SocketCAN error frames.
//!
//! SocketCAN has no microcontroller-style error counters; the kernel driver
//! synthesizes error frames instead, delivered on the same socket as data
//! frames. This module turns those into a small state machine whose main job
//! is the "only node on the bus" situation: every transmission then fails
//! ACK-gating, and without the listen-only fallback a single node would
//! transmit continuously and flood the driver with errors.

use std::process::Command;

use log::{debug, info};

// syslog's NOTICE level has no `log` counterpart; bus-state transitions
// land on info.
macro_rules! notice {
    ($($arg:tt)*) => { log::info!($($arg)*) };
}

/// Number of consecutive ACK errors tolerated before falling back to
/// listen-only.
pub const NOACK_MAX: u32 = 16;

/// Seconds spent in listen-only before a probe transmission is allowed.
pub const LISTEN_ONLY_SECS: u64 = 10;

/// Error-frame class bits carried in `can_id` (linux/can/error.h).
pub mod err_class {
    /// TX timeout (by netdevice driver)
    pub const TX_TIMEOUT: u32 = 0x0000_0001;
    /// Lost arbitration
    pub const LOSTARB: u32 = 0x0000_0002;
    /// Controller problems; details in data\[1\]
    pub const CRTL: u32 = 0x0000_0004;
    /// Protocol violations
    pub const PROT: u32 = 0x0000_0008;
    /// Transceiver status
    pub const TRX: u32 = 0x0000_0010;
    /// Received no ACK on transmission
    pub const ACK: u32 = 0x0000_0020;
    /// Bus off
    pub const BUSOFF: u32 = 0x0000_0040;
    /// Bus error (may flood!)
    pub const BUSERROR: u32 = 0x0000_0080;
    /// Controller restarted
    pub const RESTARTED: u32 = 0x0000_0100;
}

/// Controller-status detail bits carried in data\[1\] of a CRTL error frame.
pub mod err_crtl {
    /// RX buffer overflow
    pub const RX_OVERFLOW: u8 = 0x01;
    /// TX buffer overflow
    pub const TX_OVERFLOW: u8 = 0x02;
    /// reached warning level for RX errors
    pub const RX_WARNING: u8 = 0x04;
    /// reached warning level for TX errors
    pub const TX_WARNING: u8 = 0x08;
    /// reached error passive status RX
    pub const RX_PASSIVE: u8 = 0x10;
    /// reached error passive status TX
    pub const TX_PASSIVE: u8 = 0x20;
    /// recovered to error active state
    pub const ACTIVE: u8 = 0x40;
}

/// Cumulative bus-error status bits, sampled by the protocol layer.
pub mod status {
    /// TX warning limit reached
    pub const TX_WARNING: u16 = 0x0001;
    /// TX error passive
    pub const TX_PASSIVE: u16 = 0x0002;
    /// TX bus off
    pub const TX_BUS_OFF: u16 = 0x0004;
    /// TX overflow (socket queue or controller)
    pub const TX_OVERFLOW: u16 = 0x0008;
    /// RX warning limit reached
    pub const RX_WARNING: u16 = 0x0100;
    /// RX error passive
    pub const RX_PASSIVE: u16 = 0x0200;
    /// RX overflow (socket queue or controller)
    pub const RX_OVERFLOW: u16 = 0x0800;
}

/// A received CAN error frame, already stripped of the ERR flag.
#[derive(Debug, Clone, Copy)]
pub struct ErrorFrame {
    /// Error class bits (the identifier field of the error frame).
    pub class: u32,
    /// The eight detail bytes.
    pub data: [u8; 8],
}

/// Bus state of one interface as seen by the TX path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterfaceState {
    /// Normal operation.
    Active,
    /// No observed bus partner; TX suppressed.
    ListenOnly,
    /// Hardware-reported bus-off.
    BusOff,
}

/// Error monitor for a single CAN interface.
///
/// All time-dependent entry points take `now_us` from the caller so the
/// transition timing is testable without a live bus.
pub struct ErrorMonitor {
    ifname: String,
    noack_counter: u32,
    listen_only: bool,
    listen_only_since_us: u64,
    status: u16,
}

impl ErrorMonitor {
    /// Create a monitor for the named interface, in the Active state.
    pub fn new(ifname: &str) -> Self {
        Self {
            ifname: ifname.to_owned(),
            noack_counter: 0,
            listen_only: false,
            listen_only_since_us: 0,
            status: 0,
        }
    }

    /// The cumulative status bitfield (see [`status`]).
    pub fn status(&self) -> u16 {
        self.status
    }

    /// Set a status bit directly (used by the driver for socket-level
    /// overflow conditions).
    pub fn set_status(&mut self, bit: u16) {
        self.status |= bit;
    }

    /// True while TX is suppressed.
    pub fn is_listen_only(&self) -> bool {
        self.listen_only
    }

    fn enter_listen_only(&mut self, now_us: u64, reset_interface: bool) -> InterfaceState {
        debug!("CAN {}: entering listen-only", self.ifname);
        self.listen_only = true;
        self.listen_only_since_us = now_us;
        if reset_interface {
            self.request_interface_reset();
        }
        InterfaceState::ListenOnly
    }

    fn leave_listen_only(&mut self) {
        debug!("CAN {}: leaving listen-only", self.ifname);
        self.listen_only = false;
        self.listen_only_since_us = 0;
    }

    /// Bounce the physical interface. Restarting it is the only way to flush
    /// the kernel and hardware TX queues after bus-off. Best-effort; runs
    /// detached so no loop ever blocks on it.
    fn request_interface_reset(&self) {
        let cmd = format!(
            "ip link set {ifname} down && ip link set {ifname} up",
            ifname = self.ifname
        );
        match Command::new("sh").arg("-c").arg(&cmd).spawn() {
            Ok(_) => {}
            Err(e) => debug!("interface reset spawn failed: {e}"),
        }
    }

    /// A data frame arrived: someone is talking on the bus, so listen-only
    /// can be left immediately and the no-ack counter starts over.
    pub fn on_data_frame(&mut self) {
        if self.listen_only {
            self.leave_listen_only();
        }
        self.noack_counter = 0;
    }

    /// Gate a transmission attempt.
    ///
    /// In listen-only, a single probe is allowed once [`LISTEN_ONLY_SECS`]
    /// have elapsed; LSS traffic in particular will draw an ACK from a
    /// master. Below the threshold the caller must drop the message.
    pub fn tx_check(&mut self, now_us: u64) -> InterfaceState {
        if self.listen_only {
            if now_us.saturating_sub(self.listen_only_since_us) > LISTEN_ONLY_SECS * 1_000_000 {
                self.leave_listen_only();
                return InterfaceState::Active;
            }
            return InterfaceState::ListenOnly;
        }
        InterfaceState::Active
    }

    /// Feed one received error frame through the state machine.
    pub fn on_error_frame(&mut self, frame: &ErrorFrame, now_us: u64) -> InterfaceState {
        debug!(
            "CAN {}: error frame class={:#x} data={:02x?}",
            self.ifname, frame.class, frame.data
        );

        // most unambiguous error first
        let state = self.handle_busoff(frame, now_us);
        if state != InterfaceState::Active {
            return state;
        }
        self.handle_controller(frame);
        self.handle_noack(frame, now_us)
    }

    fn handle_busoff(&mut self, frame: &ErrorFrame, now_us: u64) -> InterfaceState {
        if frame.class & err_class::BUSOFF == 0 {
            return InterfaceState::Active;
        }
        notice!("CAN {}: bus-off", self.ifname);
        self.status |= status::TX_BUS_OFF;
        self.enter_listen_only(now_us, true)
    }

    fn handle_controller(&mut self, frame: &ErrorFrame) {
        if frame.class & err_class::CRTL == 0 {
            return;
        }
        // a controller-status report supersedes a previous bus-off
        self.status &= !status::TX_BUS_OFF;

        let detail = frame.data[1];
        if detail & err_crtl::RX_PASSIVE != 0 {
            notice!("CAN {}: rx error passive", self.ifname);
            self.status |= status::RX_PASSIVE;
        } else if detail & err_crtl::TX_PASSIVE != 0 {
            notice!("CAN {}: tx error passive", self.ifname);
            self.status |= status::TX_PASSIVE;
        } else if detail & err_crtl::RX_OVERFLOW != 0 {
            notice!("CAN {}: rx buffer overflow", self.ifname);
            self.status |= status::RX_OVERFLOW;
        } else if detail & err_crtl::TX_OVERFLOW != 0 {
            notice!("CAN {}: tx buffer overflow", self.ifname);
            self.status |= status::TX_OVERFLOW;
        } else if detail & err_crtl::RX_WARNING != 0 {
            info!("CAN {}: rx warning level", self.ifname);
            self.status &= !status::RX_PASSIVE;
        } else if detail & err_crtl::TX_WARNING != 0 {
            info!("CAN {}: tx warning level", self.ifname);
            self.status &= !status::TX_PASSIVE;
        } else if detail & err_crtl::ACTIVE != 0 {
            notice!("CAN {}: error active", self.ifname);
        }
    }

    fn handle_noack(&mut self, frame: &ErrorFrame, now_us: u64) -> InterfaceState {
        if self.listen_only {
            return InterfaceState::ListenOnly;
        }
        if frame.class & err_class::ACK != 0 {
            self.noack_counter += 1;
            if self.noack_counter > NOACK_MAX {
                // continuous NO-ACK means no other node is active on the bus
                // (error counting exception 1 in the CAN spec); the frame
                // causing it has to be flushed from the hardware queue
                info!("CAN {}: no ACK on transmission", self.ifname);
                return self.enter_listen_only(now_us, true);
            }
        } else {
            self.noack_counter = 0;
        }
        InterfaceState::Active
    }

    /// Reset the monitor to its inert state.
    pub fn disable(&mut self) {
        self.noack_counter = 0;
        self.listen_only = false;
        self.listen_only_since_us = 0;
        self.status = 0;
    }
}
