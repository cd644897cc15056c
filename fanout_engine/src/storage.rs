// Copyright 2022 CeresDB Project Authors. Licensed under Apache-2.0.

//! Storage abstraction
//!
//! The contracts between the fan-out core and the concrete backends: a
//! [Storage] opens scoped [Querier]s for reads and [Appender]s for writes.
//! Backend implementations cast their own errors into [GenericError] and
//! wrap them in a variant of [Error].

use std::{fmt, marker::PhantomData, sync::Arc, time::Instant};

use async_trait::async_trait;
use common_types::{
    labels::{Labels, Matcher},
    request_id::RequestId,
    time::Timestamp,
};
use common_util::{define_result, error::GenericError};
use snafu::{Backtrace, Snafu};

use crate::series::{ChunkSeriesRef, EmptySeriesSet, Labeled, SeriesRef, SeriesSet};

/// Contains common error variant, implementation specific error should
/// be cast into Box<dyn Error>
#[derive(Debug, Snafu)]
#[snafu(visibility = "pub")]
pub enum Error {
    #[snafu(display("Failed to fetch start time from backend, err:{}", source))]
    StartTime { source: GenericError },

    #[snafu(display("Failed to open querier on backend, err:{}", source))]
    OpenQuerier { source: GenericError },

    #[snafu(display("Failed to open fanout querier, err:{}", source))]
    OpenFanoutQuerier { source: GenericError },

    #[snafu(display("Failed to fetch label values, label:{}, err:{}", name, source))]
    LabelValues { name: String, source: GenericError },

    #[snafu(display("Failed to fetch label names, err:{}", source))]
    LabelNames { source: GenericError },

    #[snafu(display("Failed to close queriers, err:{}", source))]
    CloseQueriers { source: GenericError },

    #[snafu(display("Failed to close storage, err:{}", source))]
    CloseStorage { source: GenericError },

    #[snafu(display("Failed to append sample, series:{}, err:{}", series, source))]
    Append { series: String, source: GenericError },

    #[snafu(display(
        "Failed to append sample by reference, reference:{}, err:{}",
        reference,
        source
    ))]
    AppendFast {
        reference: AppendRef,
        source: GenericError,
    },

    #[snafu(display("Failed to commit appended samples, err:{}", source))]
    Commit { source: GenericError },

    #[snafu(display("Failed to rollback appended samples, err:{}", source))]
    Rollback { source: GenericError },

    #[snafu(display("Unexpected error, err:{}", source))]
    Unexpected { source: GenericError },

    #[snafu(display("Unexpected error, msg:{}.\nBacktrace:\n{}", msg, backtrace))]
    UnexpectedWithMsg { msg: String, backtrace: Backtrace },
}

define_result!(Error);

/// A non-fatal diagnostic accompanying an otherwise successful response.
pub type Warning = Arc<dyn std::error::Error + Send + Sync>;
pub type Warnings = Vec<Warning>;

/// Reference to an appended series, valid for [Appender::add_fast] on the
/// appender's storage.
pub type AppendRef = u64;

/// Query options recognized by backends, passed through untouched.
#[derive(Debug, Clone, Default)]
pub struct SelectHints {
    pub start: Timestamp,
    pub end: Timestamp,
    /// Evaluation step in millis, 0 for instant queries.
    pub step_ms: i64,
    /// Range selector width in millis, 0 when absent.
    pub range_ms: i64,
    /// Function or aggregation pushed down, e.g. "sum" or "rate".
    pub func: Option<String>,
    pub grouping: Vec<String>,
    pub by: bool,
    pub shard_index: u64,
    pub shard_count: u64,
}

/// Cancellation and tracing scope of one read request.
///
/// The context is handed to every backend querier opened for the request;
/// backends are expected to observe `deadline` in their blocking
/// operations.
#[derive(Debug, Clone)]
pub struct QueryContext {
    pub request_id: RequestId,
    /// None for requests without timeout.
    pub deadline: Option<Instant>,
}

impl QueryContext {
    pub fn new() -> Self {
        Self {
            request_id: RequestId::next_id(),
            deadline: None,
        }
    }

    #[must_use]
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

impl Default for QueryContext {
    fn default() -> Self {
        Self::new()
    }
}

/// A scoped read handle of one backend, bound to a time range.
///
/// Generic over the granularity it serves: `Item` is [SeriesRef] for
/// sample queriers and [ChunkSeriesRef] for chunk queriers.
#[async_trait]
pub trait Querier: Send + Sync {
    type Item: Labeled + Clone + Send + 'static;

    /// Produce the set of series matching `matchers` within the querier's
    /// time range. Errors are reported through the returned set.
    async fn select(
        &self,
        sort_series: bool,
        hints: Option<SelectHints>,
        matchers: Vec<Matcher>,
    ) -> Box<dyn SeriesSet<Item = Self::Item>>;

    /// All potential values of the label called `name`, sorted ascending.
    async fn label_values(&self, name: &str) -> Result<(Vec<String>, Warnings)>;

    /// All label names within the querier's time range, sorted ascending.
    async fn label_names(&self) -> Result<(Vec<String>, Warnings)>;

    /// Release the resources of the querier. Invalidates every set and
    /// iterator it produced.
    async fn close(&self) -> Result<()>;

    /// Designated do-nothing queriers are skipped when merging.
    fn is_noop(&self) -> bool {
        false
    }
}

pub type QuerierRef = Arc<dyn Querier<Item = SeriesRef>>;
pub type ChunkQuerierRef = Arc<dyn Querier<Item = ChunkSeriesRef>>;

/// A write handle, single-threaded by contract: the caller never invokes
/// two operations concurrently. After [Appender::commit] or
/// [Appender::rollback] no further operation is valid.
#[async_trait]
pub trait Appender: Send {
    async fn add(&mut self, labels: Labels, timestamp: Timestamp, value: f64)
        -> Result<AppendRef>;

    async fn add_fast(
        &mut self,
        reference: AppendRef,
        timestamp: Timestamp,
        value: f64,
    ) -> Result<()>;

    async fn commit(&mut self) -> Result<()>;

    async fn rollback(&mut self) -> Result<()>;
}

pub type AppenderRef = Box<dyn Appender>;

/// A concrete time-series backend.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Earliest timestamp the backend can answer queries for.
    async fn start_time(&self) -> Result<Timestamp>;

    /// Open a querier over `[mint, maxt]`. The context establishes the
    /// cancellation scope for the querier and everything it produces.
    async fn querier(
        &self,
        ctx: &QueryContext,
        mint: Timestamp,
        maxt: Timestamp,
    ) -> Result<QuerierRef>;

    fn appender(&self) -> AppenderRef;

    async fn close(&self) -> Result<()>;
}

pub type StorageRef = Arc<dyn Storage>;

/// A querier yielding nothing. The merge querier skips it, so backends can
/// return one when they have no data for the requested range.
pub struct NoopQuerier<T> {
    _phantom: PhantomData<fn() -> T>,
}

impl<T> NoopQuerier<T> {
    pub fn new() -> Self {
        Self {
            _phantom: PhantomData,
        }
    }
}

impl<T> Default for NoopQuerier<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for NoopQuerier<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NoopQuerier").finish()
    }
}

#[async_trait]
impl<T: Labeled + Clone + Send + Sync + 'static> Querier for NoopQuerier<T> {
    type Item = T;

    async fn select(
        &self,
        _sort_series: bool,
        _hints: Option<SelectHints>,
        _matchers: Vec<Matcher>,
    ) -> Box<dyn SeriesSet<Item = T>> {
        Box::new(EmptySeriesSet::new())
    }

    async fn label_values(&self, _name: &str) -> Result<(Vec<String>, Warnings)> {
        Ok((Vec::new(), Warnings::new()))
    }

    async fn label_names(&self) -> Result<(Vec<String>, Warnings)> {
        Ok((Vec::new(), Warnings::new()))
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    fn is_noop(&self) -> bool {
        true
    }
}

/// Sample-granularity no-op querier.
pub fn noop_querier() -> QuerierRef {
    Arc::new(NoopQuerier::<SeriesRef>::new())
}
