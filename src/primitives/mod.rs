//! Low-level primitives the MVCC table and vacuum are built on.
//!
//! Includes lock-light concurrency helpers, positional file I/O and the page
//! stores that hold durable vacuum bookkeeping.

/// Big-endian field cursors for record codecs.
pub mod bytes;

/// Concurrency primitives and synchronization.
///
/// Versioned seqlock ring and bounded lock-free queues.
pub mod concurrency;

/// I/O abstractions and utilities.
///
/// Interfaces for reading/writing data and file operations.
pub mod io;

/// Page stores with pinned pages and per-access latches.
pub mod pager;
