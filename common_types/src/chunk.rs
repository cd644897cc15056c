// Copyright 2022 CeresDB Project Authors. Licensed under Apache-2.0.

//! Encoded sample chunks.

use crate::{bytes::Bytes, time::Timestamp};

/// A blob of encoded samples covering the closed time interval
/// `[min_time, max_time]`.
///
/// The payload encoding is owned by the backends; this layer only orders
/// and groups chunks by their time interval.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub min_time: Timestamp,
    pub max_time: Timestamp,
    pub payload: Bytes,
}

impl Chunk {
    /// Panics if `min_time > max_time`.
    pub fn new(min_time: Timestamp, max_time: Timestamp, payload: Bytes) -> Self {
        assert!(min_time <= max_time);

        Self {
            min_time,
            max_time,
            payload,
        }
    }

    /// Whether the time intervals of the two chunks intersect.
    #[inline]
    pub fn overlaps(&self, other: &Chunk) -> bool {
        self.min_time <= other.max_time && other.min_time <= self.max_time
    }
}
