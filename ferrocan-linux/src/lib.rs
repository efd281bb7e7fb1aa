//! Linux platform runtime for a CANopen (CiA 301) node.
//!
//! This crate glues three asynchronous worlds together with deterministic
//! timing: the kernel's SocketCAN descriptors delivering frames and bus-error
//! events, a periodic timerfd used as the stack's time base, and eventfd
//! wake-ups from the real-time thread to the mainline thread.
//!
//! The CANopen protocol state machines themselves (NMT, SDO, PDO, heartbeat,
//! emergency, LSS, SYNC, TIME) are external collaborators driven through the
//! traits in [`stack`]; this crate owns the sockets, the event loops, the
//! crash-safe parameter storage and the ASCII-gateway transport.

pub mod can;
pub mod clock;
pub mod event_loop;
pub mod gateway;
pub mod runtime;
pub mod stack;
pub mod storage;

pub use ferrocan_common as common;

pub use can::CanModule;
pub use event_loop::{EventLoop, WakeupHandle};
pub use gateway::{Gateway, GatewayConfig};
pub use runtime::{Runtime, RuntimeConfig, ThreadingMode};
pub use storage::{Storage, StorageAttrs, StorageEntryConfig};
