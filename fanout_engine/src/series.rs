// Copyright 2022 CeresDB Project Authors. Licensed under Apache-2.0.

//! Series, chunk series and their lazy sets.
//!
//! Iterators follow a pre-advanced cursor model: `at()` returns the item
//! exposed by the last successful `next()` (or `seek()`) and stays stable
//! until the following `next()`. Errors are reported, not thrown: inspect
//! `err()` once `next()` returned false.

use std::{marker::PhantomData, sync::Arc};

use common_types::{chunk::Chunk, labels::Labels, sample::Sample, time::Timestamp};
use common_util::error::GenericError;

use crate::storage::Warnings;

/// Anything identified by a label set.
pub trait Labeled {
    fn labels(&self) -> &Labels;
}

/// A lazy stream of samples in strictly ascending timestamp order.
pub trait SampleIterator: Send {
    /// Advance to the first sample with timestamp >= `ts`. Forward-only:
    /// seeking before the exposed position is a no-op.
    fn seek(&mut self, ts: Timestamp) -> bool;

    /// Advance past the exposed sample. Once false, stays false.
    fn next(&mut self) -> bool;

    /// The exposed sample. Panics when none is exposed.
    fn at(&self) -> Sample;

    fn err(&self) -> Option<&GenericError>;
}

/// A lazy stream of chunks in ascending `(min_time, max_time)` order.
pub trait ChunkIterator: Send {
    /// Advance past the exposed chunk. Once false, stays false.
    fn next(&mut self) -> bool;

    /// The exposed chunk. Panics when none is exposed.
    fn at(&self) -> Chunk;

    fn err(&self) -> Option<&GenericError>;
}

/// A label-identified stream of samples.
pub trait Series: Labeled + Send + Sync {
    /// A fresh iterator over the series' samples.
    fn iterator(&self) -> Box<dyn SampleIterator>;
}

/// A label-identified stream of encoded chunks.
pub trait ChunkSeries: Labeled + Send + Sync {
    /// A fresh iterator over the series' chunks.
    fn iterator(&self) -> Box<dyn ChunkIterator>;
}

pub type SeriesRef = Arc<dyn Series>;
pub type ChunkSeriesRef = Arc<dyn ChunkSeries>;

impl Labeled for SeriesRef {
    fn labels(&self) -> &Labels {
        (**self).labels()
    }
}

impl Labeled for ChunkSeriesRef {
    fn labels(&self) -> &Labels {
        (**self).labels()
    }
}

/// A lazy stream of series in strictly ascending label-set order, with a
/// terminal error and non-fatal warnings.
///
/// Generic over granularity: `Item` is [SeriesRef] or [ChunkSeriesRef].
pub trait SeriesSet: Send {
    type Item: Labeled + Clone + Send + 'static;

    /// Advance to the next series. Once false, stays false.
    fn next(&mut self) -> bool;

    /// The exposed series, stable between `next()` calls. Panics when none
    /// is exposed.
    fn at(&self) -> Self::Item;

    /// Terminal error, if any. Meaningful after `next()` returned false.
    fn err(&self) -> Option<&GenericError>;

    /// Non-fatal diagnostics gathered so far.
    fn warnings(&self) -> Warnings;
}

pub type SendableSeriesSet = Box<dyn SeriesSet<Item = SeriesRef>>;
pub type SendableChunkSeriesSet = Box<dyn SeriesSet<Item = ChunkSeriesRef>>;

/// The degenerate series: no labels, no samples.
#[derive(Debug, Default)]
pub struct EmptySeries {
    labels: Labels,
}

impl Labeled for EmptySeries {
    fn labels(&self) -> &Labels {
        &self.labels
    }
}

impl Series for EmptySeries {
    fn iterator(&self) -> Box<dyn SampleIterator> {
        Box::new(EmptySampleIterator)
    }
}

/// The degenerate chunk series: no labels, no chunks.
#[derive(Debug, Default)]
pub struct EmptyChunkSeries {
    labels: Labels,
}

impl Labeled for EmptyChunkSeries {
    fn labels(&self) -> &Labels {
        &self.labels
    }
}

impl ChunkSeries for EmptyChunkSeries {
    fn iterator(&self) -> Box<dyn ChunkIterator> {
        Box::new(EmptyChunkIterator)
    }
}

#[derive(Debug)]
pub struct EmptySampleIterator;

impl SampleIterator for EmptySampleIterator {
    fn seek(&mut self, _ts: Timestamp) -> bool {
        false
    }

    fn next(&mut self) -> bool {
        false
    }

    fn at(&self) -> Sample {
        panic!("at() called on empty sample iterator")
    }

    fn err(&self) -> Option<&GenericError> {
        None
    }
}

#[derive(Debug)]
pub struct EmptyChunkIterator;

impl ChunkIterator for EmptyChunkIterator {
    fn next(&mut self) -> bool {
        false
    }

    fn at(&self) -> Chunk {
        panic!("at() called on empty chunk iterator")
    }

    fn err(&self) -> Option<&GenericError> {
        None
    }
}

/// A set yielding nothing.
pub struct EmptySeriesSet<T> {
    _phantom: PhantomData<fn() -> T>,
}

impl<T> EmptySeriesSet<T> {
    pub fn new() -> Self {
        Self {
            _phantom: PhantomData,
        }
    }
}

impl<T> Default for EmptySeriesSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Labeled + Clone + Send + 'static> SeriesSet for EmptySeriesSet<T> {
    type Item = T;

    fn next(&mut self) -> bool {
        false
    }

    fn at(&self) -> T {
        panic!("at() called on empty series set")
    }

    fn err(&self) -> Option<&GenericError> {
        None
    }

    fn warnings(&self) -> Warnings {
        Warnings::new()
    }
}
