//! The runtime orchestrator: thread composition, the communication-reset
//! cycle and the inner run loop.
//!
//! Two compositions exist. In [`ThreadingMode::Dual`] a dedicated RT thread
//! (optionally SCHED_FIFO) runs the 1 ms CAN/SYNC/PDO loop while the
//! mainline thread handles everything else at 100 ms granularity. In
//! [`ThreadingMode::Single`] one thread does both, with the RT step run on
//! every mainline iteration so SYNC/PDO deadlines can shorten the next
//! wake-up.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use log::{error, info};

use ferrocan_common::{CoError, NmtResetCommand, TimeOfDay};

use crate::can::CanModule;
use crate::event_loop::EventLoop;
use crate::gateway::{Gateway, GatewayConfig};
use crate::stack::{EmergencyKind, GatewayParser, MainlineCtx, MainlineStack, RtStack};
use crate::storage::Storage;

/// Delay before re-driving a deferred CAN transmission, µs.
pub const CANSEND_DELAY_US: u32 = 100;

/// Default mainline iteration interval, µs.
pub const MAIN_INTERVAL_US: u32 = 100_000;

/// Default RT iteration interval, µs.
pub const RT_INTERVAL_US: u32 = 1_000;

/// Default interval between auto-save passes, µs.
pub const STORAGE_AUTO_INTERVAL_US: u32 = 60_000_000;

/// Interval announced to the TIME producer, ms.
const TIME_STAMP_INTERVAL_MS: u32 = 10_000;

/// Thread composition of the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadingMode {
    /// One thread runs both the RT step and the mainline.
    Single,
    /// A dedicated RT thread runs CAN reception and SYNC/PDO processing.
    Dual,
}

/// Orchestrator configuration.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// CAN interface name, e.g. `can0`.
    pub ifname: String,
    /// SCHED_FIFO priority for the RT thread; -1 keeps the normal scheduler.
    pub rt_priority: i32,
    /// Sync the filesystem and reboot after an NMT reset-application.
    pub reboot_on_reset_app: bool,
    /// Gateway interface.
    pub gateway: GatewayConfig,
    /// Gateway idle timeout in ms; 0 disables the timeout.
    pub gateway_timeout_ms: u32,
    /// Thread composition.
    pub threading: ThreadingMode,
    /// Mainline iteration interval, µs.
    pub main_interval_us: u32,
    /// RT iteration interval, µs.
    pub rt_interval_us: u32,
    /// Auto-save pass interval, µs.
    pub storage_auto_interval_us: u32,
}

impl RuntimeConfig {
    /// Defaults for the named interface: dual-threaded, normal scheduler,
    /// no gateway, standard intervals.
    pub fn new(ifname: &str) -> Self {
        Self {
            ifname: ifname.to_owned(),
            rt_priority: -1,
            reboot_on_reset_app: false,
            gateway: GatewayConfig::Disabled,
            gateway_timeout_ms: 0,
            threading: ThreadingMode::Dual,
            main_interval_us: MAIN_INTERVAL_US,
            rt_interval_us: RT_INTERVAL_US,
            storage_auto_interval_us: STORAGE_AUTO_INTERVAL_US,
        }
    }
}

/// The composed node runtime.
pub struct Runtime<M, R, P> {
    cfg: RuntimeConfig,
    can: Arc<Mutex<CanModule>>,
    storage: Storage,
    storage_init_error: u32,
    mainline: M,
    rt: Option<R>,
    parser: P,
    stop: Arc<AtomicBool>,
}

impl<M, R, P> Runtime<M, R, P>
where
    M: MainlineStack,
    R: RtStack + 'static,
    P: GatewayParser,
{
    /// Compose a runtime. `storage_init_error` is the init-error mask from
    /// [`Storage::init`], reported as a NON_VOLATILE_MEMORY emergency once a
    /// node-id is configured.
    ///
    /// The CAN module is shared: stack implementations keep a clone of the
    /// `Arc` for transmitting, locking it briefly per send. During
    /// [`MainlineStack::communication_reset`] the runtime already holds the
    /// lock and passes the module in by reference.
    pub fn new(
        cfg: RuntimeConfig,
        can: Arc<Mutex<CanModule>>,
        storage: Storage,
        storage_init_error: u32,
        mainline: M,
        rt: R,
        parser: P,
    ) -> Self {
        Self {
            cfg,
            can,
            storage,
            storage_init_error,
            mainline,
            rt: Some(rt),
            parser,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The stop flag polled at the top of every iteration; wire it to the
    /// SIGINT/SIGTERM handler.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Run the reset loop until an application reset, a quit command, or the
    /// stop flag. Returns the final reset command.
    pub fn run(mut self) -> Result<NmtResetCommand, CoError> {
        let mut ep_main = EventLoop::new(self.cfg.main_interval_us)?;

        // in dual mode the CAN sockets belong to the RT loop's multiplexer
        let (mut ep_rt, can_registry) = match self.cfg.threading {
            ThreadingMode::Dual => {
                let ep = EventLoop::new(self.cfg.rt_interval_us)?;
                let reg = ep.registry();
                (Some(ep), reg)
            }
            ThreadingMode::Single => (None, ep_main.registry()),
        };

        let mut gateway = Gateway::new(
            ep_main.registry(),
            self.cfg.gateway.clone(),
            self.cfg.gateway_timeout_ms,
        )?;

        let can_normal = self.can.lock().unwrap().normal_flag();
        let startup_time = TimeOfDay::from_wall_clock();

        let mut rt_thread: Option<thread::JoinHandle<()>> = None;
        let mut reset = NmtResetCommand::None;
        let mut first_run = true;
        let mut fatal: Option<CoError> = None;
        let mut storage_error_prev = 0u32;
        let mut storage_timer_us = 0u32;

        while !reset.leaves_reset_loop() && !self.stop.load(Ordering::Acquire) {
            // communication reset: reconfigure CAN and the protocol stack
            let od_err_info;
            {
                let mut can = self.can.lock().unwrap();
                can.disable();
                can.reset_config();
                if let Err(e) = can.add_interface(&can_registry, &self.cfg.ifname) {
                    error!("CAN interface init failed: {e}");
                    fatal = Some(e);
                    break;
                }
                match self
                    .mainline
                    .communication_reset(&mut can, ep_main.wakeup_handle())
                {
                    Ok(info) => od_err_info = info,
                    Err(e) => {
                        error!("communication reset failed: {e}");
                        fatal = Some(e);
                        break;
                    }
                }
            }

            if !self.mainline.node_id_unconfigured() {
                if od_err_info != 0 {
                    self.mainline
                        .report_emergency(EmergencyKind::InconsistentObjectDict, od_err_info);
                }
                if self.storage_init_error != 0 {
                    self.mainline.report_emergency(
                        EmergencyKind::NonVolatileMemory,
                        self.storage_init_error,
                    );
                }
                info!("CANopen: communication reset done");
            } else {
                info!("CANopen: node-id not initialized, waiting for LSS");
            }

            if first_run {
                first_run = false;
                self.mainline.set_time(startup_time, TIME_STAMP_INTERVAL_MS);

                if let Some(ep) = ep_rt.take() {
                    let can = Arc::clone(&self.can);
                    let stop = Arc::clone(&self.stop);
                    let normal = Arc::clone(&can_normal);
                    let rt = self.rt.take().expect("rt stack present before spawn");
                    let handle = thread::Builder::new()
                        .name("ferrocan-rt".into())
                        .spawn(move || rt_thread_loop(ep, can, rt, stop, normal))
                        .map_err(|e| CoError::syscall("spawn(rt)", e));
                    match handle {
                        Ok(handle) => {
                            if self.cfg.rt_priority > 0 {
                                if let Err(e) =
                                    set_fifo_priority(&handle, self.cfg.rt_priority)
                                {
                                    error!("RT priority setup failed: {e}");
                                    fatal = Some(e);
                                    rt_thread = Some(handle);
                                    break;
                                }
                            }
                            rt_thread = Some(handle);
                        }
                        Err(e) => {
                            fatal = Some(e);
                            break;
                        }
                    }
                }
            }

            {
                let mut can = self.can.lock().unwrap();
                match self.mainline.init_pdo(&mut can) {
                    Ok(()) | Err(CoError::NodeIdUnconfiguredLss) => {}
                    Err(e) => {
                        error!("PDO init failed: {e}");
                        fatal = Some(e);
                        break;
                    }
                }
                can.set_normal_mode();
            }

            reset = NmtResetCommand::None;
            info!("CANopen: running on {}", self.cfg.ifname);

            while !reset.leaves_run_loop() && !self.stop.load(Ordering::Acquire) {
                ep_main.wait();

                if self.cfg.threading == ThreadingMode::Single {
                    self.can.lock().unwrap().poll_event(&mut ep_main);
                    if can_normal.load(Ordering::Acquire) {
                        let mut timer_next = ep_main.timer_next_us();
                        if let Some(rt) = self.rt.as_mut() {
                            rt.process(ep_main.time_difference_us(), Some(&mut timer_next));
                        }
                        ep_main.lower_timer_next(timer_next);
                    }
                }

                gateway.process(&mut ep_main, &mut self.parser);

                let mut timer_next = ep_main.timer_next_us();
                let mut ctx = MainlineCtx {
                    time_difference_us: ep_main.time_difference_us(),
                    timer_next_us: &mut timer_next,
                    storage: &mut self.storage,
                    gateway_enabled: gateway.is_enabled(),
                };
                reset = self.mainline.process(&mut ctx);
                ep_main.lower_timer_next(timer_next);

                self.parser
                    .poll_response(&mut |buf| gateway.write_response(buf));

                {
                    let mut can = self.can.lock().unwrap();
                    can.process();
                    // unsent frames pending: re-drive promptly
                    if can.tx_pending() > 0 && ep_main.timer_next_us() > CANSEND_DELAY_US {
                        ep_main.lower_timer_next(CANSEND_DELAY_US);
                    }
                }

                if storage_timer_us < self.cfg.storage_auto_interval_us {
                    storage_timer_us =
                        storage_timer_us.saturating_add(ep_main.time_difference_us());
                } else {
                    let mask = self.storage.auto_process(false);
                    if mask != storage_error_prev && !self.mainline.node_id_unconfigured() {
                        // only edges are reported
                        if mask != 0 {
                            self.mainline
                                .report_emergency(EmergencyKind::NonVolatileAutoSave, mask);
                        } else {
                            self.mainline
                                .clear_emergency(EmergencyKind::NonVolatileAutoSave);
                        }
                    }
                    storage_error_prev = mask;
                    storage_timer_us = 0;
                }

                ep_main.finish_iteration();
            }
        }

        // orderly shutdown, also on the fatal path
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = rt_thread.take() {
            if handle.join().is_err() {
                error!("RT thread panicked");
            }
        }
        self.storage.auto_process(true);
        gateway.close();
        self.can.lock().unwrap().disable();

        if let Some(e) = fatal {
            return Err(e);
        }

        info!("CANopen: finished ({reset:?})");

        if reset == NmtResetCommand::Application && self.cfg.reboot_on_reset_app {
            unsafe { libc::sync() };
            if unsafe { libc::reboot(libc::RB_AUTOBOOT) } != 0 {
                return Err(CoError::last_os_error("reboot"));
            }
        }

        Ok(reset)
    }
}

fn rt_thread_loop<R: RtStack>(
    mut ep: EventLoop,
    can: Arc<Mutex<CanModule>>,
    mut rt: R,
    stop: Arc<AtomicBool>,
    normal: Arc<AtomicBool>,
) {
    while !stop.load(Ordering::Acquire) {
        ep.wait();

        can.lock().unwrap().poll_event(&mut ep);

        // SYNC → RPDO → TPDO, only on the periodic tick and only while the
        // module is in normal mode
        if ep.timer_event() && normal.load(Ordering::Acquire) {
            rt.process(ep.time_difference_us(), None);
        }

        ep.finish_iteration();
    }
}

fn set_fifo_priority(handle: &thread::JoinHandle<()>, priority: i32) -> Result<(), CoError> {
    use std::os::unix::thread::JoinHandleExt;

    let param = libc::sched_param {
        sched_priority: priority,
    };
    let ret =
        unsafe { libc::pthread_setschedparam(handle.as_pthread_t(), libc::SCHED_FIFO, &param) };
    if ret != 0 {
        return Err(CoError::syscall(
            "pthread_setschedparam",
            std::io::Error::from_raw_os_error(ret),
        ));
    }
    Ok(())
}
