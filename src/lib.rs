//! MVCC visibility tracking and vacuum for a transactional storage engine.
//!
//! [`mvcc::MvccTable`] hands out transaction ids and answers which record
//! versions a snapshot sees. [`vacuum::Vacuum`] replays sealed log blocks in
//! the background and removes versions no snapshot can see any more,
//! keeping its own bookkeeping durable through redo records.

#![warn(missing_docs)]

pub mod admin;
pub mod log;
pub mod logging;
pub mod mvcc;
pub mod options;
pub mod primitives;
pub mod storage;
pub mod types;
pub mod vacuum;

pub use options::{MvccOptions, ReclaimOptions, VacuumOptions};
pub use types::{ReclaimError, Result};
