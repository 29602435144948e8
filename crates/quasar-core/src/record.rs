//! Record Data Structure
//!
//! This module defines `Record` - the fundamental unit of ingested data.
//!
//! ## What is a Record?
//!
//! A record is one point in a time series: a nanosecond timestamp and a
//! double-precision value. Batches of records flow from the ingest
//! coalescer into the tree engine, which encodes them into node blobs
//! and hands those to the block storage layer.
//!
//! ## Time Bounds
//!
//! The tree engine addresses a fixed time domain. Timestamps outside
//! `[MIN_TIME, MAX_TIME)` cannot be represented by the tree and are
//! rejected before they reach storage.

use serde::{Deserialize, Serialize};

/// Smallest representable timestamp (inclusive).
pub const MIN_TIME: i64 = -(16 << 56);

/// Largest representable timestamp (exclusive).
pub const MAX_TIME: i64 = 48 << 56;

/// A single time-series point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Timestamp in nanoseconds since the epoch.
    pub time: i64,

    /// Measured value.
    pub value: f64,
}

impl Record {
    pub fn new(time: i64, value: f64) -> Self {
        Self { time, value }
    }

    /// Whether this record's timestamp lies inside the representable
    /// time domain.
    pub fn time_in_bounds(&self) -> bool {
        self.time >= MIN_TIME && self.time < MAX_TIME
    }
}
