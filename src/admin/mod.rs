#![forbid(unsafe_code)]

//! Offline inspection and consistency checks of vacuum state.

mod error;
mod inspect;
mod verify;

/// Error types for administrative operations.
pub use error::{AdminError, Result};

/// Read-only dump of vacuum data and dropped files stores.
pub use inspect::{inspect, DroppedFileRow, InspectReport};

/// Check that every record vacuum claims to have processed was processed.
pub use verify::{
    check_vacuumed, verify_vacuumed, VerifyCounts, VerifyFinding, VerifyReport, VerifySeverity,
};
