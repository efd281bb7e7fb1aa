//! Whole-runtime composition tests: reset cycle, both threading modes, and
//! orderly shutdown. Like the driver tests these need a CAN interface
//! (`FERROCAN_TEST_CAN_IFACE=vcan0`); without one they skip.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use ferrocan_linux::can::CanModule;
use ferrocan_linux::common::{CanMessage, CoError, NmtResetCommand, TimeOfDay};
use ferrocan_linux::event_loop::WakeupHandle;
use ferrocan_linux::runtime::{Runtime, RuntimeConfig, ThreadingMode};
use ferrocan_linux::stack::{EmergencyKind, MainlineCtx, MainlineStack, RtStack};
use ferrocan_linux::storage::{new_region, Storage, StorageAttrs, StorageEntryConfig};
use ferrocan_linux::GatewayConfig;
use integration_tests::{test_can_iface, RecordingParser};
use tempfile::TempDir;

struct StubMainline {
    iterations: Arc<AtomicU32>,
    resets: Arc<AtomicU32>,
    quit_after: u32,
}

impl MainlineStack for StubMainline {
    fn communication_reset(
        &mut self,
        can: &mut CanModule,
        _wakeup: WakeupHandle,
    ) -> Result<u32, CoError> {
        self.resets.fetch_add(1, Ordering::SeqCst);
        can.rx_buffer_init(0, 0x000, 0x7FF, false, Box::new(|_msg: &CanMessage| {}))?;
        Ok(0)
    }

    fn init_pdo(&mut self, _can: &mut CanModule) -> Result<(), CoError> {
        Ok(())
    }

    fn process(&mut self, _ctx: &mut MainlineCtx<'_>) -> NmtResetCommand {
        let n = self.iterations.fetch_add(1, Ordering::SeqCst) + 1;
        if n == self.quit_after {
            NmtResetCommand::Quit
        } else {
            NmtResetCommand::None
        }
    }

    fn node_id_unconfigured(&self) -> bool {
        false
    }

    fn set_time(&mut self, _time: TimeOfDay, _interval_ms: u32) {}

    fn report_emergency(&mut self, _kind: EmergencyKind, _info: u32) {}

    fn clear_emergency(&mut self, _kind: EmergencyKind) {}
}

struct StubRt(Arc<AtomicU32>);

impl RtStack for StubRt {
    fn process(&mut self, _time_difference_us: u32, _timer_next_us: Option<&mut u32>) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

fn build_runtime(
    iface: &str,
    threading: ThreadingMode,
    quit_after: u32,
    dir: &TempDir,
) -> (
    Runtime<StubMainline, StubRt, RecordingParser>,
    Arc<AtomicU32>,
    Arc<AtomicU32>,
    Arc<AtomicU32>,
) {
    let iterations = Arc::new(AtomicU32::new(0));
    let resets = Arc::new(AtomicU32::new(0));
    let rt_calls = Arc::new(AtomicU32::new(0));

    let region = new_region(8);
    let entries = vec![StorageEntryConfig {
        region,
        sub_index: 2,
        attrs: StorageAttrs::AUTO_SAVE | StorageAttrs::RESTORE,
        filename: "stub.persist".into(),
    }];
    let (storage, storage_err) =
        Storage::init(entries, &format!("{}/", dir.path().display())).unwrap();

    let mut cfg = RuntimeConfig::new(iface);
    cfg.threading = threading;
    cfg.main_interval_us = 5_000;
    cfg.rt_interval_us = 1_000;
    cfg.gateway = GatewayConfig::Disabled;

    let runtime = Runtime::new(
        cfg,
        Arc::new(Mutex::new(CanModule::new(4, 4))),
        storage,
        storage_err,
        StubMainline {
            iterations: Arc::clone(&iterations),
            resets: Arc::clone(&resets),
            quit_after,
        },
        StubRt(Arc::clone(&rt_calls)),
        RecordingParser::new(),
    );
    (runtime, iterations, resets, rt_calls)
}

#[test]
fn dual_mode_runs_and_quits_cleanly() {
    let Some(iface) = test_can_iface() else {
        eprintln!("skipping: set FERROCAN_TEST_CAN_IFACE");
        return;
    };
    let dir = TempDir::new().unwrap();
    let (runtime, iterations, resets, rt_calls) =
        build_runtime(&iface, ThreadingMode::Dual, 20, &dir);

    let reset = runtime.run().unwrap();
    assert_eq!(reset, NmtResetCommand::Quit);
    assert_eq!(resets.load(Ordering::SeqCst), 1);
    assert!(iterations.load(Ordering::SeqCst) >= 20);
    // the 1 ms RT loop ran while the mainline iterated for ~100 ms
    assert!(rt_calls.load(Ordering::SeqCst) > 0);
}

#[test]
fn single_mode_runs_rt_step_inline() {
    let Some(iface) = test_can_iface() else {
        eprintln!("skipping: set FERROCAN_TEST_CAN_IFACE");
        return;
    };
    let dir = TempDir::new().unwrap();
    let (runtime, iterations, _resets, rt_calls) =
        build_runtime(&iface, ThreadingMode::Single, 10, &dir);

    let reset = runtime.run().unwrap();
    assert_eq!(reset, NmtResetCommand::Quit);
    assert!(iterations.load(Ordering::SeqCst) >= 10);
    assert!(rt_calls.load(Ordering::SeqCst) > 0);
}

#[test]
fn stop_flag_ends_the_run_loop() {
    let Some(iface) = test_can_iface() else {
        eprintln!("skipping: set FERROCAN_TEST_CAN_IFACE");
        return;
    };
    let dir = TempDir::new().unwrap();
    // never quits by itself
    let (runtime, _iterations, _resets, _rt) =
        build_runtime(&iface, ThreadingMode::Dual, u32::MAX, &dir);

    let stop = runtime.stop_flag();
    let stopper = std::thread::spawn(move || {
        std::thread::sleep(std::time::Duration::from_millis(100));
        stop.store(true, Ordering::Release);
    });

    let reset = runtime.run().unwrap();
    stopper.join().unwrap();
    // ended by the flag, not by a reset command
    assert_eq!(reset, NmtResetCommand::None);
}

#[test]
fn missing_interface_is_a_fatal_startup_error() {
    let dir = TempDir::new().unwrap();
    let (runtime, _i, _r, _rt) =
        build_runtime("ferrocan-does-not-exist", ThreadingMode::Dual, 1, &dir);
    assert!(runtime.run().is_err());
}
