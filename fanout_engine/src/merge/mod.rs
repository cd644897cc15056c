// Copyright 2022 CeresDB Project Authors. Licensed under Apache-2.0.

//! Vertical merge engine.
//!
//! Combines series that share label identity but may overlap in time, at
//! two granularities: sample level ([chain]) and chunk level ([chunk]).
//! [set] merges whole label-ordered series sets across backends, handing
//! each same-label group to one of the mergers below.
//!
//! All three layers run the same k-way algorithm: a min-heap of
//! pre-advanced cursors, keyed by label set, sample timestamp or chunk
//! time interval respectively. Every cursor entering a heap exposes a
//! valid current item; exhausted sources never enter.

pub mod chain;
pub mod chunk;
pub mod set;

use std::sync::Arc;

pub use chain::{chained_series_merge, ChainSampleIterator, ChainSeries};
pub use chunk::{vertical_chunk_series_merge_fn, ChainChunkIterator, VerticalChunksMergeFn};
pub use set::{merge_chunk_series_sets, merge_series_sets, MergeSeriesSet};

use crate::series::{ChunkSeriesRef, SeriesRef};

/// Merges a group of same-label entries into one.
pub type MergeFn<T> = Arc<dyn Fn(Vec<T>) -> T + Send + Sync>;

/// Merges same-label series, sample granularity.
pub type VerticalSeriesMergeFn = MergeFn<SeriesRef>;

/// Merges same-label series, chunk granularity.
pub type VerticalChunkSeriesMergeFn = MergeFn<ChunkSeriesRef>;

/// The default sample-level merger, see [chained_series_merge].
pub fn chained_series_merge_fn() -> VerticalSeriesMergeFn {
    Arc::new(chained_series_merge)
}
