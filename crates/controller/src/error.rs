//! Error types shared by the controller core and its collaborators.
//!
//! Only [`ControllerError`] is ever returned to a caller of the control
//! surface (HTTP routes, inbound MQTT commands). [`LinkError`] stays inside
//! the connectivity code and is turned into mode transitions there.

use std::time::Duration;

use thiserror::Error;

/// Caller-input errors surfaced by the control surface.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ControllerError {
    #[error("zone {zone} is out of range (controller has {zone_count} zones)")]
    InvalidZone { zone: usize, zone_count: usize },

    #[error("invalid schedule field `{field}`: {reason}")]
    InvalidScheduleField { field: &'static str, reason: String },

    #[error("invalid command: {0}")]
    InvalidCommand(String),
}

impl ControllerError {
    pub fn field(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidScheduleField {
            field,
            reason: reason.into(),
        }
    }
}

/// Network or messaging I/O failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    #[error("network unavailable: {0}")]
    Network(String),

    #[error("messaging link error: {0}")]
    Messaging(String),

    #[error("{what} attempt timed out after {after:?}")]
    Timeout { what: &'static str, after: Duration },
}
