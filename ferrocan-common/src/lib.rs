//! Common data model shared among the ferrocan crates.
//!
//! Most users will depend on `ferrocan-linux`, which re-exports this crate.
#![warn(missing_docs)]

pub mod crc;
pub mod error;
pub mod messages;
pub mod nmt;
pub mod node_id;
pub mod time_types;

pub use error::CoError;
pub use messages::{CanId, CanMessage};
pub use nmt::{NmtResetCommand, NmtState};
pub use node_id::NodeId;
pub use time_types::TimeOfDay;
