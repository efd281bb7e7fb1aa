//! A minimal reference protocol stack for the daemon.
//!
//! This is deliberately small: a heartbeat producer, an NMT command
//! consumer, persistence of the pending node-id, and a line-based gateway
//! command set. A full CiA 301 stack plugs into the same traits.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use log::{debug, info, warn};

use ferrocan_common::node_id::UNCONFIGURED_RAW;
use ferrocan_common::{CanMessage, CoError, NmtResetCommand, NmtState, NodeId, TimeOfDay};
use ferrocan_linux::can::CanModule;
use ferrocan_linux::event_loop::WakeupHandle;
use ferrocan_linux::stack::{
    EmergencyKind, GatewayParser, MainlineCtx, MainlineStack, NodePersist, RtStack,
};
use ferrocan_linux::storage::SharedRegion;

use crate::gateway_log::GatewayLogBuffer;

const NMT_CMD_START: u8 = 0x01;
const NMT_CMD_STOP: u8 = 0x02;
const NMT_CMD_PRE_OPERATIONAL: u8 = 0x80;
const NMT_CMD_RESET_NODE: u8 = 0x81;
const NMT_CMD_RESET_COMM: u8 = 0x82;

const HEARTBEAT_BASE_COB: u16 = 0x700;
const HEARTBEAT_PERIOD_US: u32 = 1_000_000;

const NMT_RX_SLOT: usize = 0;
const HB_TX_SLOT: usize = 0;

/// Commands the gateway parser hands to the mainline step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GwCommand {
    /// NMT reset-node.
    ResetNode,
    /// NMT reset-communication.
    ResetComm,
    /// Leave the program.
    Quit,
    /// Store all parameters (object 0x1010 semantics).
    Save,
    /// Restore default parameters at next boot (object 0x1011 semantics).
    RestoreDefaults,
}

/// State shared between the RT-side RX callback, the gateway parser and the
/// mainline step.
#[derive(Default)]
pub struct NodeShared {
    nmt_request: Mutex<Option<u8>>,
    commands: Mutex<VecDeque<GwCommand>>,
}

impl NodeShared {
    /// Queue a gateway command for the next mainline step.
    pub fn push_command(&self, cmd: GwCommand) {
        self.commands.lock().unwrap().push_back(cmd);
    }
}

/// The mainline half of the minimal stack.
pub struct MinimalNode {
    can: Arc<Mutex<CanModule>>,
    persist_region: SharedRegion,
    node_id_override: Option<NodeId>,
    active_node_id: Option<u8>,
    state: NmtState,
    bootup_pending: bool,
    hb_timer_us: u32,
    shared: Arc<NodeShared>,
}

impl MinimalNode {
    /// Create the node. `node_id_override` (from the command line) takes
    /// precedence over the persisted pending node-id.
    pub fn new(
        can: Arc<Mutex<CanModule>>,
        persist_region: SharedRegion,
        node_id_override: Option<NodeId>,
        shared: Arc<NodeShared>,
    ) -> Self {
        Self {
            can,
            persist_region,
            node_id_override,
            active_node_id: None,
            state: NmtState::Initializing,
            bootup_pending: false,
            hb_timer_us: 0,
            shared,
        }
    }

    fn send_heartbeat(&self, value: u8) {
        let mut can = self.can.lock().unwrap();
        if !can.is_normal() {
            return;
        }
        if let Some(slot) = can.tx_buffer_mut(HB_TX_SLOT) {
            slot.data[0] = value;
            slot.dlc = 1;
        }
        match can.send(HB_TX_SLOT) {
            Ok(()) | Err(CoError::TxBusy) => {}
            Err(e) => debug!("heartbeat send: {e}"),
        }
    }
}

impl MainlineStack for MinimalNode {
    fn communication_reset(
        &mut self,
        can: &mut CanModule,
        wakeup: WakeupHandle,
    ) -> Result<u32, CoError> {
        let mut persist = NodePersist::load(&self.persist_region);
        if let Some(id) = self.node_id_override {
            persist.pending_node_id = id.raw();
        }
        if !(1..=127).contains(&persist.pending_node_id) {
            persist.pending_node_id = UNCONFIGURED_RAW;
        }
        persist.store(&self.persist_region);

        self.state = NmtState::Initializing;
        self.hb_timer_us = 0;

        if persist.pending_node_id == UNCONFIGURED_RAW {
            self.active_node_id = None;
            self.bootup_pending = false;
            return Ok(0);
        }
        let id = persist.pending_node_id;
        self.active_node_id = Some(id);
        self.bootup_pending = true;

        let shared = Arc::clone(&self.shared);
        can.rx_buffer_init(
            NMT_RX_SLOT,
            0x000,
            0x7FF,
            false,
            Box::new(move |msg: &CanMessage| {
                let data = msg.data();
                if data.len() == 2 && (data[1] == 0 || data[1] == id) {
                    *shared.nmt_request.lock().unwrap() = Some(data[0]);
                    // runs in RT context: the mainline applies the command
                    wakeup.trigger();
                }
            }),
        )?;
        can.tx_buffer_init(HB_TX_SLOT, HEARTBEAT_BASE_COB + id as u16, false, 1, false)?;
        Ok(0)
    }

    fn init_pdo(&mut self, _can: &mut CanModule) -> Result<(), CoError> {
        if self.active_node_id.is_none() {
            return Err(CoError::NodeIdUnconfiguredLss);
        }
        Ok(())
    }

    fn process(&mut self, ctx: &mut MainlineCtx<'_>) -> NmtResetCommand {
        let mut reset = NmtResetCommand::None;

        if ctx.gateway_enabled {
            while let Some(cmd) = self.shared.commands.lock().unwrap().pop_front() {
                match cmd {
                    GwCommand::Quit => reset = NmtResetCommand::Quit,
                    GwCommand::ResetNode => reset = NmtResetCommand::Application,
                    GwCommand::ResetComm => reset = NmtResetCommand::Communication,
                    GwCommand::Save => {
                        for i in 0..ctx.storage.entry_count() {
                            if let Err(e) = ctx.storage.store(i) {
                                warn!("store parameters: {e}");
                            }
                        }
                    }
                    GwCommand::RestoreDefaults => {
                        for i in 0..ctx.storage.entry_count() {
                            if let Err(e) = ctx.storage.restore_defaults(i) {
                                warn!("restore defaults: {e}");
                            }
                        }
                    }
                }
            }
        }

        if let Some(cmd) = self.shared.nmt_request.lock().unwrap().take() {
            match cmd {
                NMT_CMD_START => self.state = NmtState::Operational,
                NMT_CMD_STOP => self.state = NmtState::Stopped,
                NMT_CMD_PRE_OPERATIONAL => self.state = NmtState::PreOperational,
                NMT_CMD_RESET_NODE => reset = NmtResetCommand::Application,
                NMT_CMD_RESET_COMM => reset = NmtResetCommand::Communication,
                other => debug!("unhandled NMT command {other:#x}"),
            }
            if matches!(
                cmd,
                NMT_CMD_START | NMT_CMD_STOP | NMT_CMD_PRE_OPERATIONAL
            ) {
                info!("NMT state: {}", self.state);
            }
        }

        if self.active_node_id.is_some() {
            if self.bootup_pending {
                self.bootup_pending = false;
                self.send_heartbeat(NmtState::Initializing as u8);
                self.state = NmtState::PreOperational;
            } else {
                self.hb_timer_us = self.hb_timer_us.saturating_add(ctx.time_difference_us);
                if self.hb_timer_us >= HEARTBEAT_PERIOD_US {
                    self.hb_timer_us -= HEARTBEAT_PERIOD_US;
                    self.send_heartbeat(self.state as u8);
                }
                let until_next = HEARTBEAT_PERIOD_US - self.hb_timer_us;
                if until_next < *ctx.timer_next_us {
                    *ctx.timer_next_us = until_next;
                }
            }
        }

        reset
    }

    fn node_id_unconfigured(&self) -> bool {
        self.active_node_id.is_none()
    }

    fn set_time(&mut self, time: TimeOfDay, interval_ms: u32) {
        let (y, m, d) = time.date_ymd();
        info!(
            "TIME set to {y:04}-{m:02}-{d:02} +{}ms, producer interval {interval_ms}ms",
            time.millis()
        );
    }

    fn report_emergency(&mut self, kind: EmergencyKind, info: u32) {
        warn!("emergency: {kind:?} (info {info:#010x})");
    }

    fn clear_emergency(&mut self, kind: EmergencyKind) {
        info!("emergency cleared: {kind:?}");
    }
}

/// The RT half of the minimal stack: no SYNC or PDOs.
pub struct MinimalRt;

impl RtStack for MinimalRt {
    fn process(&mut self, _time_difference_us: u32, _timer_next_us: Option<&mut u32>) {}
}

/// Input-buffer capacity of the line parser.
const PARSER_INPUT_CAP: usize = 1000;

/// A line-based gateway command parser.
///
/// Commands follow the `"[sequence] command"` shape of the ASCII gateway;
/// the recognized set is the minimum to drive the node remotely: `reset
/// node`, `reset communication`, `save`, `restore`, `quit`. Comment lines
/// (`#`) are ignored.
pub struct MinimalParser {
    input: Vec<u8>,
    responses: VecDeque<Vec<u8>>,
    shared: Arc<NodeShared>,
    gw_log: GatewayLogBuffer,
}

impl MinimalParser {
    /// Create the parser, wired to the shared command queue and the log tee.
    pub fn new(shared: Arc<NodeShared>, gw_log: GatewayLogBuffer) -> Self {
        Self {
            input: Vec::new(),
            responses: VecDeque::new(),
            shared,
            gw_log,
        }
    }

    fn handle_line(&mut self, line: &[u8]) {
        let line = String::from_utf8_lossy(line);
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return;
        }

        // optional "[sequence]" address prefix
        let (seq, command) = match line.strip_prefix('[') {
            Some(rest) => match rest.split_once(']') {
                Some((seq, cmd)) => (seq.trim(), cmd.trim()),
                None => ("0", line),
            },
            None => ("0", line),
        };

        let response = match command {
            "reset node" => {
                self.shared.push_command(GwCommand::ResetNode);
                format!("[{seq}] OK\r\n")
            }
            "reset communication" => {
                self.shared.push_command(GwCommand::ResetComm);
                format!("[{seq}] OK\r\n")
            }
            "save" => {
                self.shared.push_command(GwCommand::Save);
                format!("[{seq}] OK\r\n")
            }
            "restore" => {
                self.shared.push_command(GwCommand::RestoreDefaults);
                format!("[{seq}] OK\r\n")
            }
            "quit" => {
                self.shared.push_command(GwCommand::Quit);
                format!("[{seq}] OK\r\n")
            }
            _ => format!("[{seq}] ERROR: 100\r\n"),
        };
        self.responses.push_back(response.into_bytes());
    }
}

impl GatewayParser for MinimalParser {
    fn free_space(&self) -> usize {
        PARSER_INPUT_CAP - self.input.len()
    }

    fn feed(&mut self, data: &[u8]) {
        let take = data.len().min(self.free_space());
        self.input.extend_from_slice(&data[..take]);

        while let Some(pos) = self.input.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.input.drain(..=pos).collect();
            self.handle_line(&line[..line.len() - 1]);
        }
    }

    fn poll_response(&mut self, write: &mut dyn FnMut(&[u8]) -> usize) {
        {
            let mut log = self.gw_log.lock().unwrap();
            while let Some(line) = log.pop_front() {
                self.responses.push_back(line.into_bytes());
            }
        }

        while let Some(front) = self.responses.front_mut() {
            let n = write(front);
            if n == 0 {
                // back-pressure; retried next iteration
                return;
            }
            if n < front.len() {
                front.drain(..n);
                return;
            }
            self.responses.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway_log;

    fn parser_with_shared() -> (MinimalParser, Arc<NodeShared>) {
        let shared = Arc::new(NodeShared::default());
        let parser = MinimalParser::new(Arc::clone(&shared), gateway_log::new_buffer());
        (parser, shared)
    }

    fn drain(parser: &mut MinimalParser) -> String {
        let mut out = Vec::new();
        parser.poll_response(&mut |buf| {
            out.extend_from_slice(buf);
            buf.len()
        });
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn known_command_queues_and_acknowledges() {
        let (mut parser, shared) = parser_with_shared();
        parser.feed(b"[3] quit\n");
        assert_eq!(
            shared.commands.lock().unwrap().pop_front(),
            Some(GwCommand::Quit)
        );
        assert_eq!(drain(&mut parser), "[3] OK\r\n");
    }

    #[test]
    fn unknown_command_reports_error() {
        let (mut parser, _shared) = parser_with_shared();
        parser.feed(b"[1] frobnicate\n");
        assert_eq!(drain(&mut parser), "[1] ERROR: 100\r\n");
    }

    #[test]
    fn command_split_over_reads_is_assembled() {
        let (mut parser, shared) = parser_with_shared();
        parser.feed(b"[0] res");
        assert!(shared.commands.lock().unwrap().is_empty());
        parser.feed(b"et node\n");
        assert_eq!(
            shared.commands.lock().unwrap().pop_front(),
            Some(GwCommand::ResetNode)
        );
    }

    #[test]
    fn comments_and_blank_lines_ignored() {
        let (mut parser, _shared) = parser_with_shared();
        parser.feed(b"# a comment\n\n");
        assert_eq!(drain(&mut parser), "");
    }

    #[test]
    fn partial_write_resumes() {
        let (mut parser, _shared) = parser_with_shared();
        parser.feed(b"[2] save\n");
        let mut out = Vec::new();
        // writer takes two bytes per call
        parser.poll_response(&mut |buf| {
            let n = buf.len().min(2);
            out.extend_from_slice(&buf[..n]);
            n
        });
        parser.poll_response(&mut |buf| {
            let n = buf.len().min(2);
            out.extend_from_slice(&buf[..n]);
            n
        });
        assert!(String::from_utf8(out).unwrap().starts_with("[2]"));
    }
}
