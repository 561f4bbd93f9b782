//! Tunables for the MVCC table and the vacuum subsystem.
//!
//! Both option structs deserialize from TOML with every field optional, so a
//! file only needs to name what it overrides:
//!
//! ```toml
//! [mvcc]
//! max_transactions = 256
//!
//! [vacuum]
//! workers = 2
//! log_tail_margin_pages = 4
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::primitives::pager::PageStoreOptions;
use crate::types::{ReclaimError, Result};

/// Configuration of the transaction table.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MvccOptions {
    /// Number of 64-bit units the bitmap window may grow to before still
    /// active ids at its front are moved to the long-transaction array.
    pub bitmap_high_water_units: usize,
    /// Length of the snapshot history ring. Rounded up to a power of two.
    pub history_len: usize,
    /// Number of transactions that may be registered at the same time.
    pub max_transactions: usize,
}

impl Default for MvccOptions {
    fn default() -> Self {
        Self {
            bitmap_high_water_units: 16,
            history_len: 8,
            max_transactions: 128,
        }
    }
}

impl MvccOptions {
    /// Sets the bitmap high-water mark in 64-bit units.
    pub fn bitmap_high_water_units(mut self, units: usize) -> Self {
        self.bitmap_high_water_units = units;
        self
    }

    /// Sets the snapshot history ring length.
    pub fn history_len(mut self, len: usize) -> Self {
        self.history_len = len;
        self
    }

    /// Sets how many transactions may be live at once.
    pub fn max_transactions(mut self, n: usize) -> Self {
        self.max_transactions = n;
        self
    }

    /// Clamps values the table cannot work with.
    pub fn normalize(mut self) -> Self {
        if self.bitmap_high_water_units < 2 {
            self.bitmap_high_water_units = 2;
        }
        self.history_len = self.history_len.max(2).next_power_of_two();
        if self.max_transactions == 0 {
            self.max_transactions = 1;
        }
        self
    }
}

/// Configuration of the vacuum master, its workers and its durable files.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VacuumOptions {
    /// Runs the master thread at all. Disabled vacuum still accepts block
    /// summaries and dropped files.
    pub enabled: bool,
    /// Worker threads executing block jobs.
    pub workers: usize,
    /// Pause between master iterations, in milliseconds.
    pub master_interval_ms: u64,
    /// Capacity of the block summary queue fed by the log.
    pub production_queue_capacity: usize,
    /// Capacity of the queue workers report finished blocks through.
    pub finished_queue_capacity: usize,
    /// A block whose start position is within this many pages of the log
    /// append position is not dispatched yet.
    pub log_tail_margin_pages: u64,
    /// Log pages per vacuum block.
    pub log_pages_per_block: u64,
    /// Page size of the vacuum data and dropped files stores.
    pub page_size: u32,
    /// Page limit of the vacuum data store. `None` is unbounded.
    pub data_max_pages: Option<u64>,
    /// Snooze rounds a dropper spins before parking on the condition variable.
    pub drop_wait_spins: u32,
}

impl Default for VacuumOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            workers: 2,
            master_interval_ms: 10,
            production_queue_capacity: 1024,
            finished_queue_capacity: 256,
            log_tail_margin_pages: 2,
            log_pages_per_block: 4,
            page_size: crate::types::page::DEFAULT_PAGE_SIZE,
            data_max_pages: None,
            drop_wait_spins: 16,
        }
    }
}

impl VacuumOptions {
    /// Enables or disables the master thread.
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Sets the number of worker threads.
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Sets the master pause between iterations.
    pub fn master_interval(mut self, interval: Duration) -> Self {
        self.master_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Sets the production queue capacity.
    pub fn production_queue_capacity(mut self, cap: usize) -> Self {
        self.production_queue_capacity = cap;
        self
    }

    /// Sets the finished-job queue capacity.
    pub fn finished_queue_capacity(mut self, cap: usize) -> Self {
        self.finished_queue_capacity = cap;
        self
    }

    /// Sets the margin, in log pages, kept between dispatched blocks and the log tail.
    pub fn log_tail_margin_pages(mut self, pages: u64) -> Self {
        self.log_tail_margin_pages = pages;
        self
    }

    /// Sets the number of log pages per block.
    pub fn log_pages_per_block(mut self, pages: u64) -> Self {
        self.log_pages_per_block = pages;
        self
    }

    /// Sets the page size of the durable vacuum files.
    pub fn page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }

    /// Caps the vacuum data store.
    pub fn data_max_pages(mut self, max: Option<u64>) -> Self {
        self.data_max_pages = max;
        self
    }

    /// Sets the spin rounds before a dropper parks.
    pub fn drop_wait_spins(mut self, spins: u32) -> Self {
        self.drop_wait_spins = spins;
        self
    }

    /// Master pause as a [`Duration`].
    pub fn master_interval_duration(&self) -> Duration {
        Duration::from_millis(self.master_interval_ms)
    }

    /// Options for the store holding vacuum data.
    pub fn data_store_options(&self) -> PageStoreOptions {
        PageStoreOptions::default()
            .page_size(self.page_size)
            .max_pages(self.data_max_pages)
    }

    /// Options for the store holding dropped files.
    pub fn dropped_store_options(&self) -> PageStoreOptions {
        PageStoreOptions::default().page_size(self.page_size)
    }

    /// Clamps values the subsystem cannot work with.
    pub fn normalize(mut self) -> Self {
        if self.workers == 0 {
            self.workers = 1;
        }
        if self.master_interval_ms == 0 {
            self.master_interval_ms = 1;
        }
        if self.production_queue_capacity < 2 {
            self.production_queue_capacity = 2;
        }
        if self.finished_queue_capacity < 2 {
            self.finished_queue_capacity = 2;
        }
        if self.log_pages_per_block == 0 {
            self.log_pages_per_block = 1;
        }
        self
    }

    /// Parses options from a TOML document holding the vacuum fields at top level.
    pub fn from_toml_str(src: &str) -> Result<Self> {
        toml::from_str::<Self>(src)
            .map(Self::normalize)
            .map_err(|err| ReclaimError::Config(err.to_string()))
    }
}

/// Every tunable of the crate, as loaded from an options file.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReclaimOptions {
    /// Transaction table settings.
    pub mvcc: MvccOptions,
    /// Vacuum settings.
    pub vacuum: VacuumOptions,
}

impl ReclaimOptions {
    /// Parses a TOML document with `[mvcc]` and `[vacuum]` tables.
    pub fn from_toml_str(src: &str) -> Result<Self> {
        let opts: Self =
            toml::from_str(src).map_err(|err| ReclaimError::Config(err.to_string()))?;
        Ok(Self {
            mvcc: opts.mvcc.normalize(),
            vacuum: opts.vacuum.normalize(),
        })
    }

    /// Reads and parses an options file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let src = std::fs::read_to_string(path)?;
        Self::from_toml_str(&src)
    }
}
