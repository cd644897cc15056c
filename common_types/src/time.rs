// Copyright 2022 CeresDB Project Authors. Licensed under Apache-2.0.

//! Time types

use std::{
    convert::TryInto,
    fmt,
    time::{self, SystemTime},
};

/// Unix timestamp type in millis
// Use i64 so we can store timestamp before 1970-01-01
#[derive(Clone, Copy, Debug, Default, Eq, Ord, PartialEq, PartialOrd, Hash)]
pub struct Timestamp(i64);

impl Timestamp {
    pub const MAX: Timestamp = Timestamp(i64::MAX);
    pub const MIN: Timestamp = Timestamp(i64::MIN);
    pub const ZERO: Timestamp = Timestamp(0);

    pub const fn new(ts: i64) -> Self {
        Self(ts)
    }

    /// Return current (non-negative) unix timestamp in millis.
    pub fn now() -> Self {
        SystemTime::now()
            .duration_since(time::UNIX_EPOCH)
            .map(|duration| {
                duration
                    .as_millis()
                    .try_into()
                    .map(Timestamp)
                    .unwrap_or(Timestamp::MAX)
            })
            .unwrap_or(Timestamp::ZERO)
    }

    #[inline]
    pub fn as_i64(&self) -> i64 {
        self.0
    }

    /// Returns the result of this `timestamp + offset_ms`, or None if overflow
    /// occurred.
    ///
    /// The `offset_ms` is in millis resolution
    pub fn checked_add_i64(&self, offset_ms: i64) -> Option<Self> {
        self.0.checked_add(offset_ms).map(Timestamp)
    }
}

impl From<i64> for Timestamp {
    fn from(ts: i64) -> Self {
        Self(ts)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
