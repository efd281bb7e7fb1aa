//! SocketCAN driver: socket ownership, RX/TX buffers, kernel filters, frame
//! dispatch and deferred re-transmit.
//!
//! The module starts in configuration mode with RX muted; protocol modules
//! register their receive slots and transmit buffers, then the orchestrator
//! calls [`CanModule::set_normal_mode`] which installs the accumulated kernel
//! filter vector and opens the gates.

pub mod error_monitor;

use std::mem;
use std::os::fd::{AsRawFd, BorrowedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, error, info};
use nix::net::if_::if_nametoindex;
use nix::sys::epoll::EpollFlags;
use socketcan::{CanSocket, Socket};

use ferrocan_common::{CanId, CanMessage, CoError};

use crate::clock;
use crate::event_loop::{EventLoop, FdRegistry};
use error_monitor::{status, ErrorFrame, ErrorMonitor, InterfaceState};

/// One kernel CAN frame on the wire (16 bytes).
const CAN_MTU: usize = mem::size_of::<libc::can_frame>();

/// Sentinel for "no buffer uses this COB-ID" in the lookup tables.
const INVALID_INDEX: u32 = u32::MAX;

/// Number of 11-bit COB-IDs.
const SFF_ID_COUNT: usize = 0x800;

// Raw option constants the libc crate does not cover uniformly
// (asm-generic/socket.h, linux/net_tstamp.h, linux/can/raw.h).
const SO_TIMESTAMPING: libc::c_int = 37;
const SO_RXQ_OVFL: libc::c_int = 40;
const SCM_TIMESTAMPING: libc::c_int = SO_TIMESTAMPING;
const SOF_TIMESTAMPING_RX_SOFTWARE: libc::c_int = 1 << 3;
const SOF_TIMESTAMPING_SOFTWARE: libc::c_int = 1 << 4;
const SOL_CAN_RAW: libc::c_int = 101;
const CAN_RAW_FILTER: libc::c_int = 1;
const CAN_RAW_ERR_FILTER: libc::c_int = 2;

/// A kernel `struct can_filter` entry.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct KernelFilter {
    can_id: u32,
    can_mask: u32,
}

/// Callback invoked for a matched receive frame.
pub type RxCallback = dyn FnMut(&CanMessage) + Send;

struct RxSlot {
    /// Raw COB-ID as registered (for lookup-table upkeep).
    cob: u16,
    /// Effective identifier: SFF bits plus the RTR flag when requested.
    ident: u32,
    /// Effective mask: requested SFF mask with the EFF and RTR bits forced,
    /// so frame format and RTR-ness are always compared strictly.
    mask: u32,
    callback: Option<Box<RxCallback>>,
    /// Interface the last matching frame arrived on.
    ifindex: u32,
    /// Kernel software timestamp of the last matching frame (system clock).
    timestamp_us: u64,
}

impl RxSlot {
    fn unconfigured() -> Self {
        Self {
            cob: 0,
            ident: 0,
            mask: 0xFFFF_FFFF,
            callback: None,
            ifindex: 0,
            timestamp_us: 0,
        }
    }
}

/// A transmit buffer. The protocol layer fills `data`/`dlc` directly and
/// then asks the module to send it.
pub struct TxSlot {
    cob: u16,
    ident: u32,
    /// Data length code.
    pub dlc: u8,
    /// Payload bytes.
    pub data: [u8; 8],
    /// Last send returned back-pressure; retry pending.
    buffer_full: bool,
    sync_flag: bool,
    /// Interface selector for multi-interface send; 0 = all.
    ifindex: u32,
}

impl TxSlot {
    fn unconfigured() -> Self {
        Self {
            cob: 0,
            ident: 0,
            dlc: 0,
            data: [0; 8],
            buffer_full: false,
            sync_flag: false,
            ifindex: 0,
        }
    }

    /// The registered COB-ID.
    pub fn cob_id(&self) -> u16 {
        self.cob
    }

    /// The synchronous-window flag the protocol layer registered.
    pub fn sync_flag(&self) -> bool {
        self.sync_flag
    }

    /// True while a deferred re-send of this buffer is pending.
    pub fn is_pending(&self) -> bool {
        self.buffer_full
    }
}

struct CanInterface {
    socket: CanSocket,
    ifindex: u32,
    name: String,
    monitor: ErrorMonitor,
}

impl CanInterface {
    fn fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }
}

struct RecvdFrame {
    frame: libc::can_frame,
    /// Kernel software RX timestamp, µs since the Unix epoch (system clock,
    /// not monotonic).
    timestamp_us: Option<u64>,
    /// Cumulative kernel drop counter from SO_RXQ_OVFL.
    dropped: Option<u32>,
}

/// The CAN module: sockets, receive dispatch and transmit buffers.
pub struct CanModule {
    registry: Option<FdRegistry>,
    interfaces: Vec<CanInterface>,
    rx: Vec<RxSlot>,
    tx: Vec<TxSlot>,
    /// Kernel filter staged per RX slot; (0,0) entries are unconfigured and
    /// elided at installation time, as they would act as pass-all filters.
    filters: Vec<KernelFilter>,
    rx_ident_to_index: Vec<u32>,
    tx_ident_to_index: Vec<u32>,
    normal: Arc<AtomicBool>,
    tx_pending: u16,
    error_status: u16,
    rx_drop_count: u32,
}

impl CanModule {
    /// Create a module with fixed RX/TX array sizes, in configuration mode
    /// and with no interfaces attached.
    pub fn new(rx_size: usize, tx_size: usize) -> Self {
        Self {
            registry: None,
            interfaces: Vec::new(),
            rx: (0..rx_size).map(|_| RxSlot::unconfigured()).collect(),
            tx: (0..tx_size).map(|_| TxSlot::unconfigured()).collect(),
            filters: vec![KernelFilter::default(); rx_size],
            rx_ident_to_index: vec![INVALID_INDEX; SFF_ID_COUNT],
            tx_ident_to_index: vec![INVALID_INDEX; SFF_ID_COUNT],
            normal: Arc::new(AtomicBool::new(false)),
            tx_pending: 0,
            error_status: 0,
            rx_drop_count: 0,
        }
    }

    /// Shared view of the normal-mode flag, for RT-side gating.
    pub fn normal_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.normal)
    }

    /// True once [`set_normal_mode`](Self::set_normal_mode) succeeded.
    pub fn is_normal(&self) -> bool {
        self.normal.load(Ordering::Acquire)
    }

    /// Number of TX buffers awaiting the deferred re-send.
    pub fn tx_pending(&self) -> u16 {
        self.tx_pending
    }

    /// Bus-level status bitfield (see [`error_monitor::status`]), refreshed
    /// by [`process`](Self::process).
    pub fn error_status(&self) -> u16 {
        self.error_status
    }

    /// Number of attached interfaces.
    pub fn interface_count(&self) -> usize {
        self.interfaces.len()
    }

    /// Open a raw socket on `ifname`, configure it and attach it to the
    /// module. Refused once the module is in normal mode.
    pub fn add_interface(&mut self, registry: &FdRegistry, ifname: &str) -> Result<(), CoError> {
        if self.is_normal() {
            return Err(CoError::InvalidState);
        }

        let ifindex = if_nametoindex(ifname).map_err(|e| {
            error!("CAN {ifname}: no such interface: {e}");
            CoError::IllegalArgument
        })?;

        let socket =
            CanSocket::open(ifname).map_err(|e| CoError::syscall("socket(can)", e))?;
        let fd = socket.as_raw_fd();

        // rx queue overflow accounting and software rx timestamps; hardware
        // timestamps do not work properly on all devices
        setsockopt_int(fd, libc::SOL_SOCKET, SO_RXQ_OVFL, 1)
            .map_err(|e| CoError::syscall("setsockopt(ovfl)", e))?;
        setsockopt_int(
            fd,
            libc::SOL_SOCKET,
            SO_TIMESTAMPING,
            SOF_TIMESTAMPING_SOFTWARE | SOF_TIMESTAMPING_RX_SOFTWARE,
        )
        .map_err(|e| CoError::syscall("setsockopt(timestamping)", e))?;

        // the kernel reserves around 450 bytes per queued CAN message
        if let Ok(bytes) = getsockopt_int(fd, libc::SOL_SOCKET, libc::SO_RCVBUF) {
            info!(
                "CAN {ifname}: socket rx buffer holds ~{} messages ({bytes} bytes)",
                bytes / 446
            );
        }

        let err_mask = error_monitor::err_class::ACK
            | error_monitor::err_class::CRTL
            | error_monitor::err_class::BUSOFF
            | error_monitor::err_class::BUSERROR;
        setsockopt_int(fd, SOL_CAN_RAW, CAN_RAW_ERR_FILTER, err_mask as libc::c_int).map_err(
            |e| {
                error!("CAN {ifname}: error filter installation failed");
                CoError::syscall("setsockopt(can err)", e)
            },
        )?;

        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        registry.add(borrowed)?;

        self.registry = Some(registry.clone());
        self.interfaces.push(CanInterface {
            socket,
            ifindex,
            name: ifname.to_owned(),
            monitor: ErrorMonitor::new(ifname),
        });

        // rx stays muted until set_normal_mode()
        if let Err(e) = set_raw_filters(fd, &[]) {
            error!("CAN {ifname}: rx filter installation failed");
            return Err(CoError::syscall("setsockopt(filter)", e));
        }
        Ok(())
    }

    /// The filter entries that would be installed right now (unconfigured
    /// slots elided).
    fn active_filters(&self) -> Vec<KernelFilter> {
        self.filters
            .iter()
            .filter(|f| f.can_id != 0 || f.can_mask != 0)
            .copied()
            .collect()
    }

    /// Install the staged filter list on every interface. An empty list
    /// installs a match-nothing filter, muting RX.
    fn apply_rx_filters(&mut self) -> Result<(), CoError> {
        let active = self.active_filters();
        let mut result = Ok(());
        for iface in &self.interfaces {
            if let Err(e) = set_raw_filters(iface.fd(), &active) {
                error!("CAN {}: rx filter installation failed", iface.name);
                debug!("setsockopt(): {e}");
                result = Err(CoError::syscall("setsockopt(filter)", e));
            }
        }
        result
    }

    /// Apply the RX filters and, iff that succeeded, enter normal mode.
    pub fn set_normal_mode(&mut self) {
        self.normal.store(false, Ordering::Release);
        if self.apply_rx_filters().is_ok() {
            self.normal.store(true, Ordering::Release);
        }
    }

    /// Configure receive slot `index`: store the callback and compose the
    /// effective identifier/mask. Reapplies kernel filters immediately when
    /// already in normal mode.
    pub fn rx_buffer_init(
        &mut self,
        index: usize,
        cob_id: u16,
        mask: u16,
        rtr: bool,
        callback: Box<RxCallback>,
    ) -> Result<(), CoError> {
        let Some(slot) = self.rx.get_mut(index) else {
            debug!("rx_buffer_init: illegal argument (index {index})");
            return Err(CoError::IllegalArgument);
        };

        set_ident_to_index(
            &mut self.rx_ident_to_index,
            index as u32,
            cob_id as u32,
            slot.cob as u32,
        );

        slot.cob = cob_id & libc::CAN_SFF_MASK as u16;
        slot.callback = Some(callback);
        slot.ifindex = 0;
        slot.timestamp_us = 0;

        slot.ident = (cob_id as u32 & libc::CAN_SFF_MASK)
            | if rtr { libc::CAN_RTR_FLAG } else { 0 };
        slot.mask =
            (mask as u32 & libc::CAN_SFF_MASK) | libc::CAN_EFF_FLAG | libc::CAN_RTR_FLAG;

        self.filters[index] = KernelFilter {
            can_id: self.rx[index].ident,
            can_mask: self.rx[index].mask,
        };

        if self.is_normal() {
            self.apply_rx_filters()?;
        }
        Ok(())
    }

    /// Configure transmit buffer `index` and clear its pending flag.
    pub fn tx_buffer_init(
        &mut self,
        index: usize,
        cob_id: u16,
        rtr: bool,
        dlc: u8,
        sync_flag: bool,
    ) -> Result<(), CoError> {
        let Some(slot) = self.tx.get_mut(index) else {
            return Err(CoError::IllegalArgument);
        };

        set_ident_to_index(
            &mut self.tx_ident_to_index,
            index as u32,
            cob_id as u32,
            slot.cob as u32,
        );

        slot.cob = cob_id & libc::CAN_SFF_MASK as u16;
        slot.ident = (cob_id as u32 & libc::CAN_SFF_MASK)
            | if rtr { libc::CAN_RTR_FLAG } else { 0 };
        slot.dlc = dlc.min(8);
        slot.buffer_full = false;
        slot.sync_flag = sync_flag;
        slot.ifindex = 0;
        Ok(())
    }

    /// Mutable access to a transmit buffer, for the protocol layer to fill
    /// payload bytes before [`send`](Self::send).
    pub fn tx_buffer_mut(&mut self, index: usize) -> Option<&mut TxSlot> {
        self.tx.get_mut(index)
    }

    /// Interface and timestamp of the last frame received on the slot
    /// registered for `cob_id`, or None if nothing arrived yet.
    pub fn rx_buffer_interface(&self, cob_id: u16) -> Option<(u32, u64)> {
        let index = *self.rx_ident_to_index.get(cob_id as usize)?;
        if index == INVALID_INDEX {
            return None;
        }
        let slot = self.rx.get(index as usize)?;
        (slot.ifindex != 0).then_some((slot.ifindex, slot.timestamp_us))
    }

    /// Pin the transmit buffer registered for `cob_id` to one interface
    /// (0 restores "all interfaces").
    pub fn tx_buffer_set_interface(&mut self, cob_id: u16, ifindex: u32) -> Result<(), CoError> {
        let index = *self
            .tx_ident_to_index
            .get(cob_id as usize)
            .ok_or(CoError::IllegalArgument)?;
        if index == INVALID_INDEX {
            return Err(CoError::IllegalArgument);
        }
        self.tx[index as usize].ifindex = ifindex;
        Ok(())
    }

    /// Send transmit buffer `index`.
    ///
    /// On back-pressure (EINTR/EAGAIN/ENOBUFS) the buffer is marked pending
    /// and `TxBusy` is returned; the next [`process`](Self::process) tick
    /// re-drives it. A listen-only interface silently drops the frame.
    pub fn send(&mut self, index: usize) -> Result<(), CoError> {
        if index >= self.tx.len() || self.interfaces.is_empty() {
            return Err(CoError::IllegalArgument);
        }
        if self.interfaces.len() == 1 {
            self.send_single(index)
        } else {
            self.send_multi(index)
        }
    }

    fn send_single(&mut self, index: usize) -> Result<(), CoError> {
        let iface = &mut self.interfaces[0];
        let slot = &mut self.tx[index];

        match iface.monitor.tx_check(clock::now_us()) {
            InterfaceState::Active => {}
            InterfaceState::ListenOnly => return Ok(()),
            InterfaceState::BusOff => return Err(CoError::InvalidState),
        }

        let mut result = Ok(());
        if slot.buffer_full {
            iface.monitor.set_status(status::TX_OVERFLOW);
            error!(
                "CAN {}: tx overflow for COB {:03x}",
                iface.name, slot.cob
            );
            result = Err(CoError::TxOverflow);
        }

        match send_frame(iface.fd(), slot) {
            Ok(()) => {
                if slot.buffer_full {
                    slot.buffer_full = false;
                    self.tx_pending = self.tx_pending.saturating_sub(1);
                }
                result
            }
            Err(e) if is_backpressure(&e) => {
                // re-sent by the next process() tick
                if !slot.buffer_full {
                    slot.buffer_full = true;
                    self.tx_pending += 1;
                }
                Err(CoError::TxBusy)
            }
            Err(e) => {
                debug!("send(): {e}");
                iface.monitor.set_status(status::TX_OVERFLOW);
                Err(CoError::syscall("send", e))
            }
        }
    }

    fn send_multi(&mut self, index: usize) -> Result<(), CoError> {
        let slot_ifindex = self.tx[index].ifindex;
        let mut result = Ok(());
        let now = clock::now_us();

        for i in 0..self.interfaces.len() {
            let ifindex = self.interfaces[i].ifindex;
            if slot_ifindex != 0 && slot_ifindex != ifindex {
                continue;
            }
            let iface = &mut self.interfaces[i];
            match iface.monitor.tx_check(now) {
                InterfaceState::Active => {}
                InterfaceState::ListenOnly => continue,
                InterfaceState::BusOff => {
                    result = Err(CoError::InvalidState);
                    continue;
                }
            }
            let slot = &self.tx[index];
            match send_frame_retry_eintr(iface.fd(), slot) {
                Ok(()) => {}
                Err(e) if e.raw_os_error() == Some(libc::ENOBUFS) => {
                    iface.monitor.set_status(status::TX_OVERFLOW);
                    result = Err(CoError::TxBusy);
                }
                Err(e) => {
                    iface.monitor.set_status(status::TX_OVERFLOW);
                    error!(
                        "CAN {}: tx failed for COB {:03x}: {e}",
                        iface.name, slot.cob
                    );
                    result = Err(CoError::TxOverflow);
                }
            }
        }
        result
    }

    /// Mainline housekeeping: refresh the status bitfield and re-drive at
    /// most one deferred TX buffer. An inconsistent pending counter with no
    /// marked buffer is reset.
    pub fn process(&mut self) {
        if self.interfaces.is_empty() {
            return;
        }

        // socketCAN has no controller error counters; the monitor evaluates
        // kernel error frames in the rx path and we sample it here
        self.error_status = self.interfaces[0].monitor.status();

        self.redrive_pending();
    }

    /// Re-send at most one pending TX buffer; a pending counter with no
    /// marked buffer is accounting drift and gets reset.
    fn redrive_pending(&mut self) {
        if self.tx_pending == 0 {
            return;
        }
        match self.tx.iter().position(|slot| slot.buffer_full) {
            Some(i) => {
                self.tx[i].buffer_full = false;
                self.tx_pending -= 1;
                let _ = self.send(i);
            }
            None => self.tx_pending = 0,
        }
    }

    #[cfg(test)]
    fn force_tx_state(&mut self, pending: u16, mark_slot: Option<usize>) {
        self.tx_pending = pending;
        if let Some(i) = mark_slot {
            self.tx[i].buffer_full = true;
        }
    }

    /// Handle the event loop's pending event if it belongs to one of our
    /// sockets. Returns true iff the event was consumed.
    pub fn poll_event(&mut self, ep: &mut EventLoop) -> bool {
        let Some(ev) = ep.pending_event() else {
            return false;
        };
        let (fd, flags) = (ev.data() as RawFd, ev.events());

        let Some(idx) = self.interfaces.iter().position(|i| i.fd() == fd) else {
            return false;
        };

        if flags.intersects(EpollFlags::EPOLLERR | EpollFlags::EPOLLHUP) {
            // socket closed or failed under us; try to pull the event out
            let mut frame: libc::can_frame = unsafe { mem::zeroed() };
            let n = unsafe {
                libc::recv(
                    fd,
                    (&mut frame as *mut libc::can_frame).cast(),
                    CAN_MTU,
                    libc::MSG_DONTWAIT,
                )
            };
            debug!(
                "CAN {}: socket error/hangup, events={flags:?} recv={n} ({})",
                self.interfaces[idx].name,
                std::io::Error::last_os_error()
            );
        } else if flags.contains(EpollFlags::EPOLLIN) {
            match recv_frame(fd) {
                Ok(recvd) => self.handle_frame(idx, recvd),
                Err(e) => {
                    self.interfaces[idx].monitor.set_status(status::RX_OVERFLOW);
                    debug!(
                        "CAN {}: frame receive failed: {e}",
                        self.interfaces[idx].name
                    );
                }
            }
        } else {
            debug!("CAN: unexpected epoll events {flags:?} on fd {fd}");
        }

        ep.consume_event();
        true
    }

    fn handle_frame(&mut self, idx: usize, recvd: RecvdFrame) {
        if let Some(dropped) = recvd.dropped {
            if dropped > self.rx_drop_count {
                self.interfaces[idx].monitor.set_status(status::RX_OVERFLOW);
                error!(
                    "CAN {}: kernel rx queue overflow, {dropped} frames dropped in total",
                    self.interfaces[idx].name
                );
            }
            self.rx_drop_count = dropped;
        }

        if !self.is_normal() {
            return;
        }

        let can_id = recvd.frame.can_id;
        if can_id & libc::CAN_ERR_FLAG != 0 {
            let ef = ErrorFrame {
                class: can_id & !libc::CAN_ERR_FLAG,
                data: recvd.frame.data,
            };
            self.interfaces[idx]
                .monitor
                .on_error_frame(&ef, clock::now_us());
            return;
        }

        // someone is talking: the monitor may leave listen-only
        self.interfaces[idx].monitor.on_data_frame();

        let ifindex = self.interfaces[idx].ifindex;
        let msg = frame_to_message(&recvd.frame);
        if let Some(slot_idx) = self.find_rx_slot(can_id) {
            let slot = &mut self.rx[slot_idx];
            if let Some(cb) = slot.callback.as_mut() {
                cb(&msg);
            }
            slot.ifindex = ifindex;
            slot.timestamp_us = recvd.timestamp_us.unwrap_or(0);
        }
    }

    /// First slot whose (ident, mask) pair admits `rx_ident` (the raw
    /// `can_id` including EFF/RTR flags).
    fn find_rx_slot(&self, rx_ident: u32) -> Option<usize> {
        self.rx
            .iter()
            .position(|slot| (rx_ident ^ slot.ident) & slot.mask == 0)
    }

    /// Leave normal mode, deregister and close all sockets.
    pub fn disable(&mut self) {
        self.normal.store(false, Ordering::Release);
        for mut iface in self.interfaces.drain(..) {
            iface.monitor.disable();
            if let Some(reg) = &self.registry {
                let borrowed = unsafe { BorrowedFd::borrow_raw(iface.fd()) };
                let _ = reg.delete(borrowed);
            }
            // socket closed on drop
        }
    }

    /// Reset buffers, filters and counters to their construction state.
    /// Used between communication resets, after [`disable`](Self::disable).
    pub fn reset_config(&mut self) {
        for slot in &mut self.rx {
            *slot = RxSlot::unconfigured();
        }
        for slot in &mut self.tx {
            *slot = TxSlot::unconfigured();
        }
        self.filters.fill(KernelFilter::default());
        self.rx_ident_to_index.fill(INVALID_INDEX);
        self.tx_ident_to_index.fill(INVALID_INDEX);
        self.tx_pending = 0;
        self.error_status = 0;
        self.rx_drop_count = 0;
    }
}

impl Drop for CanModule {
    fn drop(&mut self) {
        self.disable();
    }
}

/// Maintain a COB-ID → buffer-index table entry.
///
/// COB-ID 0 is a valid value for buffer 0 only (NMT); everywhere else it
/// doubles as "entry unconfigured", so a current ident of 0 must not wipe
/// the NMT mapping when some other buffer gets configured.
fn set_ident_to_index(table: &mut [u32], index: u32, new_ident: u32, current_ident: u32) {
    if current_ident != 0 && (current_ident as usize) < table.len() && new_ident != current_ident {
        table[current_ident as usize] = INVALID_INDEX;
    }
    if new_ident as usize >= table.len() {
        return;
    }
    if new_ident == 0 {
        if index == 0 {
            table[0] = 0;
        }
    } else {
        table[new_ident as usize] = index;
    }
}

fn is_backpressure(e: &std::io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(libc::EINTR) | Some(libc::EAGAIN) | Some(libc::ENOBUFS)
    )
}

pub(crate) fn setsockopt_int(
    fd: RawFd,
    level: libc::c_int,
    option: libc::c_int,
    value: libc::c_int,
) -> std::io::Result<()> {
    let ret = unsafe {
        libc::setsockopt(
            fd,
            level,
            option,
            (&value as *const libc::c_int).cast(),
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

fn getsockopt_int(fd: RawFd, level: libc::c_int, option: libc::c_int) -> std::io::Result<libc::c_int> {
    let mut value: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockopt(
            fd,
            level,
            option,
            (&mut value as *mut libc::c_int).cast(),
            &mut len,
        )
    };
    if ret < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(value)
}

/// Install a raw CAN filter list; an empty list mutes reception entirely.
fn set_raw_filters(fd: RawFd, filters: &[KernelFilter]) -> std::io::Result<()> {
    let (ptr, len) = if filters.is_empty() {
        (std::ptr::null(), 0)
    } else {
        (
            filters.as_ptr() as *const libc::c_void,
            mem::size_of_val(filters),
        )
    };
    let ret = unsafe { libc::setsockopt(fd, SOL_CAN_RAW, CAN_RAW_FILTER, ptr, len as libc::socklen_t) };
    if ret < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

fn send_frame(fd: RawFd, slot: &TxSlot) -> std::io::Result<()> {
    let mut frame: libc::can_frame = unsafe { mem::zeroed() };
    frame.can_id = slot.ident;
    frame.can_dlc = slot.dlc;
    frame.data = slot.data;

    let n = unsafe {
        libc::send(
            fd,
            (&frame as *const libc::can_frame).cast(),
            CAN_MTU,
            libc::MSG_DONTWAIT,
        )
    };
    if n == CAN_MTU as isize {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

/// Multi-interface send path: retry on EINTR, surface everything else.
fn send_frame_retry_eintr(fd: RawFd, slot: &TxSlot) -> std::io::Result<()> {
    loop {
        match send_frame(fd, slot) {
            Err(e) if e.raw_os_error() == Some(libc::EINTR) => continue,
            other => return other,
        }
    }
}

/// Read exactly one frame via recvmsg, capturing the kernel drop counter and
/// the software timestamp from the control messages.
fn recv_frame(fd: RawFd) -> std::io::Result<RecvdFrame> {
    let mut frame: libc::can_frame = unsafe { mem::zeroed() };
    let mut iov = libc::iovec {
        iov_base: (&mut frame as *mut libc::can_frame).cast(),
        iov_len: CAN_MTU,
    };
    // room for SCM_TIMESTAMPING (3 timespecs) and SO_RXQ_OVFL (u32)
    let mut ctrl = [0u8; 256];
    let mut msghdr: libc::msghdr = unsafe { mem::zeroed() };
    msghdr.msg_iov = &mut iov;
    msghdr.msg_iovlen = 1;
    msghdr.msg_control = ctrl.as_mut_ptr().cast();
    msghdr.msg_controllen = ctrl.len();

    let n = unsafe { libc::recvmsg(fd, &mut msghdr, 0) };
    if n != CAN_MTU as isize {
        if n < 0 {
            return Err(std::io::Error::last_os_error());
        }
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("short CAN frame read: {n} bytes"),
        ));
    }

    let mut timestamp_us = None;
    let mut dropped = None;
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msghdr);
        while !cmsg.is_null() {
            let hdr = &*cmsg;
            if hdr.cmsg_level == libc::SOL_SOCKET {
                if hdr.cmsg_type == SCM_TIMESTAMPING {
                    // index 0 of the timespec triple is the software stamp;
                    // system time, not monotonic
                    let ts = &*(libc::CMSG_DATA(cmsg) as *const libc::timespec);
                    timestamp_us =
                        Some(ts.tv_sec as u64 * 1_000_000 + ts.tv_nsec as u64 / 1000);
                } else if hdr.cmsg_type == SO_RXQ_OVFL {
                    dropped = Some(*(libc::CMSG_DATA(cmsg) as *const u32));
                }
            }
            cmsg = libc::CMSG_NXTHDR(&msghdr, cmsg);
        }
    }

    Ok(RecvdFrame {
        frame,
        timestamp_us,
        dropped,
    })
}

fn frame_to_message(frame: &libc::can_frame) -> CanMessage {
    let id = if frame.can_id & libc::CAN_EFF_FLAG != 0 {
        CanId::extended(frame.can_id & libc::CAN_EFF_MASK)
    } else {
        CanId::std((frame.can_id & libc::CAN_SFF_MASK) as u16)
    };
    let dlc = frame.can_dlc.min(8);
    if frame.can_id & libc::CAN_RTR_FLAG != 0 {
        CanMessage::new_rtr(id, dlc)
    } else {
        CanMessage::new(id, &frame.data[..dlc as usize])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn module() -> CanModule {
        CanModule::new(8, 8)
    }

    fn noop_callback() -> Box<RxCallback> {
        Box::new(|_msg: &CanMessage| {})
    }

    #[test]
    fn unconfigured_slots_yield_no_filters() {
        let m = module();
        assert!(m.active_filters().is_empty());
    }

    #[test]
    fn configured_slot_produces_strict_filter() {
        let mut m = module();
        m.rx_buffer_init(1, 0x181, 0x7FF, false, noop_callback())
            .unwrap();
        let filters = m.active_filters();
        assert_eq!(filters.len(), 1);
        assert_eq!(filters[0].can_id, 0x181);
        assert_eq!(
            filters[0].can_mask,
            0x7FF | libc::CAN_EFF_FLAG | libc::CAN_RTR_FLAG
        );
    }

    #[test]
    fn rx_match_respects_mask_and_flags() {
        let mut m = module();
        m.rx_buffer_init(2, 0x181, 0x7FF, false, noop_callback())
            .unwrap();
        assert_eq!(m.find_rx_slot(0x181), Some(2));
        // wrong id
        assert_eq!(m.find_rx_slot(0x182), None);
        // same id as extended frame must not match a standard slot
        assert_eq!(m.find_rx_slot(0x181 | libc::CAN_EFF_FLAG), None);
        // RTR-ness is compared strictly
        assert_eq!(m.find_rx_slot(0x181 | libc::CAN_RTR_FLAG), None);
    }

    #[test]
    fn rtr_slot_matches_only_rtr() {
        let mut m = module();
        m.rx_buffer_init(0, 0x601, 0x7FF, true, noop_callback())
            .unwrap();
        assert_eq!(m.find_rx_slot(0x601 | libc::CAN_RTR_FLAG), Some(0));
        assert_eq!(m.find_rx_slot(0x601), None);
    }

    #[test]
    fn masked_group_matches_range() {
        let mut m = module();
        // heartbeat consumer: any node id in 0x701..=0x77F
        m.rx_buffer_init(3, 0x700, 0x780, false, noop_callback())
            .unwrap();
        assert_eq!(m.find_rx_slot(0x701), Some(3));
        assert_eq!(m.find_rx_slot(0x77F), Some(3));
        assert_eq!(m.find_rx_slot(0x781), None);
    }

    #[test]
    fn first_match_wins() {
        let mut m = module();
        m.rx_buffer_init(1, 0x200, 0x700, false, noop_callback())
            .unwrap();
        m.rx_buffer_init(2, 0x201, 0x7FF, false, noop_callback())
            .unwrap();
        // 0x201 satisfies both slots; the scan is linear and first wins
        assert_eq!(m.find_rx_slot(0x201), Some(1));
    }

    #[test]
    fn ident_index_table_handles_cob_zero() {
        let mut table = vec![INVALID_INDEX; SFF_ID_COUNT];
        // COB 0 for slot 0 is NMT and valid
        set_ident_to_index(&mut table, 0, 0, 0);
        assert_eq!(table[0], 0);
        // COB 0 for any other slot means unconfigured
        set_ident_to_index(&mut table, 5, 0, 0);
        assert_ne!(table[0], 5);
        // configuring other buffers leaves the NMT mapping alone
        set_ident_to_index(&mut table, 1, 0x181, 0);
        assert_eq!(table[0], 0);
        assert_eq!(table[0x181], 1);
    }

    #[test]
    fn ident_index_table_drops_stale_mapping() {
        let mut table = vec![INVALID_INDEX; SFF_ID_COUNT];
        set_ident_to_index(&mut table, 4, 0x201, 0);
        assert_eq!(table[0x201], 4);
        set_ident_to_index(&mut table, 4, 0x301, 0x201);
        assert_eq!(table[0x201], INVALID_INDEX);
        assert_eq!(table[0x301], 4);
    }

    #[test]
    fn tx_buffer_init_clears_pending_flag() {
        let mut m = module();
        m.tx_buffer_init(0, 0x181, false, 8, false).unwrap();
        let slot = m.tx_buffer_mut(0).unwrap();
        assert!(!slot.is_pending());
        assert_eq!(slot.cob_id(), 0x181);
        assert_eq!(slot.dlc, 8);
    }

    #[test]
    fn stale_tx_counter_resets_in_one_tick() {
        let mut m = module();
        m.tx_buffer_init(0, 0x181, false, 1, false).unwrap();
        // counter claims pending frames but no buffer is marked
        m.force_tx_state(3, None);
        m.redrive_pending();
        assert_eq!(m.tx_pending(), 0);
    }

    #[test]
    fn marked_buffer_is_consumed_by_one_redrive() {
        let mut m = module();
        m.tx_buffer_init(0, 0x181, false, 1, false).unwrap();
        m.force_tx_state(1, Some(0));
        m.redrive_pending();
        assert_eq!(m.tx_pending(), 0);
        assert!(!m.tx_buffer_mut(0).unwrap().is_pending());
    }

    #[test]
    fn send_without_interface_is_illegal() {
        let mut m = module();
        m.tx_buffer_init(0, 0x181, false, 2, false).unwrap();
        assert!(matches!(m.send(0), Err(CoError::IllegalArgument)));
    }

    #[test]
    fn add_interface_refused_in_normal_mode() {
        let mut m = module();
        // no interfaces and nothing to apply: normal mode turns on trivially
        m.set_normal_mode();
        assert!(m.is_normal());
        let ep = EventLoop::new(100_000).unwrap();
        assert!(matches!(
            m.add_interface(&ep.registry(), "vcan-missing"),
            Err(CoError::InvalidState)
        ));
    }
}
