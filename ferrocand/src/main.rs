//! ferrocand: CANopen node daemon on Linux SocketCAN.

mod gateway_log;
mod minimal_node;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use clap::error::ErrorKind;
use clap::{CommandFactory, Parser};
use log::{error, info};

use ferrocan_common::NodeId;
use ferrocan_linux::can::CanModule;
use ferrocan_linux::runtime::{Runtime, RuntimeConfig, ThreadingMode};
use ferrocan_linux::stack::NodePersist;
use ferrocan_linux::storage::{new_region, Storage, StorageAttrs, StorageEntryConfig};
use ferrocan_linux::GatewayConfig;

use minimal_node::{MinimalNode, MinimalParser, MinimalRt, NodeShared};

/// Receive and transmit buffer counts of the CAN module.
const RX_BUFFER_COUNT: usize = 16;
const TX_BUFFER_COUNT: usize = 16;

/// Length of the persisted communication-parameter block.
const OD_COMM_LEN: usize = 64;

#[derive(Parser, Debug)]
#[command(
    name = "ferrocand",
    version,
    about = "CANopen node on Linux SocketCAN",
    after_help = "The CAN bitrate is configured on the interface itself, e.g.\n\
                  ip link set can0 up type can bitrate 250000"
)]
struct Args {
    /// CAN device name, e.g. can0
    device: String,

    /// CANopen node-id (1..127) or 0xFF (LSS unconfigured)
    #[arg(short = 'i', value_name = "NODE_ID", value_parser = parse_u8_auto)]
    node_id: Option<u8>,

    /// Real-time priority of the RT thread (1..99); -1 uses the normal
    /// scheduler
    #[arg(
        short = 'p',
        value_name = "RT_PRIORITY",
        default_value_t = -1,
        allow_negative_numbers = true
    )]
    rt_priority: i32,

    /// Enable reboot on CANopen NMT reset-node command
    #[arg(short = 'r')]
    reboot: bool,

    /// Path and filename prefix for the data storage files; by default files
    /// are stored in the current directory
    #[arg(short = 's', value_name = "STORAGE_PREFIX", default_value = "")]
    storage_prefix: String,

    /// Enable the command interface: "stdio", "local-<file path>" or
    /// "tcp-<port>"
    #[arg(short = 'c', value_name = "INTERFACE")]
    command_interface: Option<String>,

    /// Socket timeout for the command interface in ms (0 = no timeout)
    #[arg(short = 'T', value_name = "TIMEOUT_MS", default_value_t = 0)]
    socket_timeout_ms: u32,

    /// Run the RT step on the mainline thread instead of a dedicated thread
    #[arg(long)]
    single_thread: bool,
}

/// Accept decimal or 0x-prefixed values, like strtol with base 0.
fn parse_u8_auto(s: &str) -> Result<u8, String> {
    let parsed = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u8::from_str_radix(hex, 16)
    } else {
        s.parse::<u8>()
    };
    parsed.map_err(|e| e.to_string())
}

fn parse_gateway(arg: Option<&str>) -> Result<GatewayConfig, String> {
    match arg {
        None => Ok(GatewayConfig::Disabled),
        Some("stdio") => Ok(GatewayConfig::Stdio),
        Some(s) => {
            if let Some(path) = s.strip_prefix("local-") {
                Ok(GatewayConfig::Local(PathBuf::from(path)))
            } else if let Some(port) = s.strip_prefix("tcp-") {
                port.parse::<u16>()
                    .map(GatewayConfig::Tcp)
                    .map_err(|_| format!("'{port}' is not a tcp port"))
            } else {
                Err(format!("unknown command interface '{s}'"))
            }
        }
    }
}

fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => match e.kind() {
            ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
                let _ = e.print();
                return ExitCode::SUCCESS;
            }
            ErrorKind::MissingRequiredArgument => {
                let _ = Args::command().print_help();
                return ExitCode::SUCCESS;
            }
            _ => {
                let _ = e.print();
                return ExitCode::FAILURE;
            }
        },
    };

    let gw_log = gateway_log::init();

    let node_id = match args.node_id.map(NodeId::new).transpose() {
        Ok(id) => id,
        Err(e) => {
            error!("{e}");
            let _ = Args::command().print_help();
            return ExitCode::FAILURE;
        }
    };

    let (prio_min, prio_max) = unsafe {
        (
            libc::sched_get_priority_min(libc::SCHED_FIFO),
            libc::sched_get_priority_max(libc::SCHED_FIFO),
        )
    };
    if args.rt_priority != -1 && !(prio_min..=prio_max).contains(&args.rt_priority) {
        error!("rt priority {} out of range", args.rt_priority);
        let _ = Args::command().print_help();
        return ExitCode::FAILURE;
    }

    let gateway = match parse_gateway(args.command_interface.as_deref()) {
        Ok(g) => g,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    // persistent regions: communication parameters plus the pending
    // node-id/bitrate block
    let od_comm_region = new_region(OD_COMM_LEN);
    let persist_region = new_region(NodePersist::LEN);
    let entries = vec![
        StorageEntryConfig {
            region: Arc::clone(&od_comm_region),
            sub_index: 2,
            attrs: StorageAttrs::CMD_SAVE | StorageAttrs::RESTORE,
            filename: "od_comm.persist".into(),
        },
        StorageEntryConfig {
            region: Arc::clone(&persist_region),
            sub_index: 4,
            attrs: StorageAttrs::CMD_SAVE | StorageAttrs::AUTO_SAVE | StorageAttrs::RESTORE,
            filename: "mainline.persist".into(),
        },
    ];
    let (storage, storage_init_error) = match Storage::init(entries, &args.storage_prefix) {
        Ok(pair) => pair,
        Err(e) => {
            error!("storage init failed: {e}");
            return ExitCode::FAILURE;
        }
    };

    let mut cfg = RuntimeConfig::new(&args.device);
    cfg.rt_priority = args.rt_priority;
    cfg.reboot_on_reset_app = args.reboot;
    cfg.gateway = gateway;
    cfg.gateway_timeout_ms = args.socket_timeout_ms;
    cfg.threading = if args.single_thread {
        ThreadingMode::Single
    } else {
        ThreadingMode::Dual
    };

    let can = Arc::new(Mutex::new(CanModule::new(RX_BUFFER_COUNT, TX_BUFFER_COUNT)));
    let shared = Arc::new(NodeShared::default());
    let node = MinimalNode::new(
        Arc::clone(&can),
        Arc::clone(&persist_region),
        node_id,
        Arc::clone(&shared),
    );
    let parser = MinimalParser::new(shared, gw_log);

    let runtime = Runtime::new(cfg, can, storage, storage_init_error, node, MinimalRt, parser);

    let stop = runtime.stop_flag();
    if let Err(e) = ctrlc::set_handler(move || stop.store(true, Ordering::Release)) {
        error!("signal handler setup failed: {e}");
        return ExitCode::FAILURE;
    }

    info!("ferrocand starting on {}", args.device);
    match runtime.run() {
        Ok(reset) => {
            info!("ferrocand finished ({reset:?})");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
