// Copyright 2022 CeresDB Project Authors. Licensed under Apache-2.0.

//! Sample type

use std::fmt;

use crate::time::Timestamp;

/// A single timestamped value of a series.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Sample {
    pub timestamp: Timestamp,
    pub value: f64,
}

impl Sample {
    pub fn new(timestamp: Timestamp, value: f64) -> Self {
        Self { timestamp, value }
    }
}

impl From<(i64, f64)> for Sample {
    fn from((ts, value): (i64, f64)) -> Self {
        Self::new(Timestamp::new(ts), value)
    }
}

impl fmt::Display for Sample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.timestamp, self.value)
    }
}
