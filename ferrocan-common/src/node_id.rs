//! CANopen node-id handling.

use snafu::Snafu;

/// The raw value an LSS master assigns to mean "no node-id configured".
pub const UNCONFIGURED_RAW: u8 = 0xFF;

/// A CANopen node-id.
///
/// Valid assigned ids are 1..=127. The special value 0xFF means the node is
/// unconfigured and waits for an LSS master to assign an id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeId {
    /// No id assigned yet; only LSS traffic is serviced.
    Unconfigured,
    /// An assigned id in 1..=127.
    Assigned(u8),
}

/// Error for rejecting out-of-range node-id values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Snafu)]
#[snafu(display("node-id must be 1..127 or 0xFF, got {value}"))]
pub struct InvalidNodeId {
    /// The rejected raw value.
    pub value: u8,
}

impl NodeId {
    /// Validate a raw id byte.
    pub const fn new(raw: u8) -> Result<Self, InvalidNodeId> {
        match raw {
            UNCONFIGURED_RAW => Ok(NodeId::Unconfigured),
            1..=127 => Ok(NodeId::Assigned(raw)),
            _ => Err(InvalidNodeId { value: raw }),
        }
    }

    /// The raw byte representation (0xFF when unconfigured).
    pub const fn raw(&self) -> u8 {
        match self {
            NodeId::Unconfigured => UNCONFIGURED_RAW,
            NodeId::Assigned(id) => *id,
        }
    }

    /// True when an id has been assigned.
    pub const fn is_configured(&self) -> bool {
        matches!(self, NodeId::Assigned(_))
    }
}

impl core::fmt::Display for NodeId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            NodeId::Unconfigured => write!(f, "unconfigured"),
            NodeId::Assigned(id) => write!(f, "{}", id),
        }
    }
}

impl TryFrom<u8> for NodeId {
    type Error = InvalidNodeId;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        NodeId::new(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_valid_range() {
        assert_eq!(NodeId::new(1), Ok(NodeId::Assigned(1)));
        assert_eq!(NodeId::new(127), Ok(NodeId::Assigned(127)));
        assert_eq!(NodeId::new(0xFF), Ok(NodeId::Unconfigured));
    }

    #[test]
    fn rejects_zero_and_128_plus() {
        assert!(NodeId::new(0).is_err());
        assert!(NodeId::new(128).is_err());
        assert!(NodeId::new(200).is_err());
    }
}
