// Copyright 2022 CeresDB Project Authors. Licensed under Apache-2.0.

//! Chunk-level vertical merge.

use std::{cmp::Ordering, collections::BinaryHeap, sync::Arc};

use common_types::{chunk::Chunk, labels::Labels};
use common_util::error::GenericError;

use crate::{
    merge::VerticalChunkSeriesMergeFn,
    series::{ChunkIterator, ChunkSeries, ChunkSeriesRef, EmptyChunkSeries, Labeled},
};

/// Fuses a chain of time-overlapping chunks of one series into a
/// replacement stream, typically a single re-encoded chunk.
///
/// The chunks handed in are sorted by `(min_time, max_time)` and every
/// neighboring pair overlaps transitively. Splitting chunks on size is the
/// merger's business, not this module's.
pub type VerticalChunksMergeFn = Arc<dyn Fn(Vec<Chunk>) -> Box<dyn ChunkIterator> + Send + Sync>;

/// Returns a series merger fusing time-overlapping chunks through
/// `chunks_merge`.
pub fn vertical_chunk_series_merge_fn(
    chunks_merge: VerticalChunksMergeFn,
) -> VerticalChunkSeriesMergeFn {
    Arc::new(move |series: Vec<ChunkSeriesRef>| -> ChunkSeriesRef {
        if series.is_empty() {
            return Arc::new(EmptyChunkSeries::default());
        }

        let labels = series[0].labels().clone();
        Arc::new(VerticalChunkSeriesMerger {
            chunks_merge: chunks_merge.clone(),
            labels,
            series,
        })
    })
}

/// Same-label chunk series merged through [ChainChunkIterator].
pub struct VerticalChunkSeriesMerger {
    chunks_merge: VerticalChunksMergeFn,
    labels: Labels,
    series: Vec<ChunkSeriesRef>,
}

impl Labeled for VerticalChunkSeriesMerger {
    fn labels(&self) -> &Labels {
        &self.labels
    }
}

impl ChunkSeries for VerticalChunkSeriesMerger {
    fn iterator(&self) -> Box<dyn ChunkIterator> {
        let iterators = self.series.iter().map(|series| series.iterator()).collect();
        Box::new(ChainChunkIterator::new(iterators, self.chunks_merge.clone()))
    }
}

/// Heap entry of one source, keyed by the exposed chunk's time interval.
///
/// Comparison is reversed so the std max-heap pops the smallest
/// `(min_time, max_time)`; the source index breaks ties.
struct ChunkCursor {
    chunk: Chunk,
    source_idx: usize,
}

impl PartialEq for ChunkCursor {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ChunkCursor {}

impl PartialOrd for ChunkCursor {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ChunkCursor {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .chunk
            .min_time
            .cmp(&self.chunk.min_time)
            .then_with(|| other.chunk.max_time.cmp(&self.chunk.max_time))
            .then_with(|| other.source_idx.cmp(&self.source_idx))
    }
}

/// K-way merge of chunk iterators belonging to one series.
///
/// Runs of time-overlapping chunks are handed to the pluggable merger in
/// one call; the merger's output re-enters the heap like any other source.
pub struct ChainChunkIterator {
    chunks_merge: VerticalChunksMergeFn,
    /// Sources plus merger outputs; cursors index into this arena and
    /// `err()` scans all of it.
    iterators: Vec<Box<dyn ChunkIterator>>,
    /// Every member exposes a valid chunk.
    heap: BinaryHeap<ChunkCursor>,
    primed: bool,
}

impl ChainChunkIterator {
    pub fn new(iterators: Vec<Box<dyn ChunkIterator>>, chunks_merge: VerticalChunksMergeFn) -> Self {
        let heap = BinaryHeap::with_capacity(iterators.len());
        Self {
            chunks_merge,
            iterators,
            heap,
            primed: false,
        }
    }

    /// Advance the source and push its cursor iff a chunk is exposed.
    fn push_if_alive(&mut self, source_idx: usize) {
        if self.iterators[source_idx].next() {
            let chunk = self.iterators[source_idx].at();
            self.heap.push(ChunkCursor { chunk, source_idx });
        }
    }
}

impl ChunkIterator for ChainChunkIterator {
    fn next(&mut self) -> bool {
        if !self.primed {
            self.primed = true;
            for source_idx in 0..self.iterators.len() {
                self.push_if_alive(source_idx);
            }
            return !self.heap.is_empty();
        }

        if self.heap.is_empty() {
            return false;
        }

        // Walk the run of time-overlapping chunks starting at the exposed
        // one. Overlap is transitive through the run: each popped chunk is
        // compared against the chunk that followed it onto the heap top.
        let mut last = self.at();
        let mut overlapped = Vec::new();
        loop {
            let source_idx = self.heap.pop().unwrap().source_idx;
            self.push_if_alive(source_idx);

            let next = match self.heap.peek() {
                Some(top) => top.chunk.clone(),
                None => break,
            };
            if next.min_time > last.max_time {
                break;
            }
            overlapped.push(last);
            last = next;
        }

        if !overlapped.is_empty() {
            // Close the run and hand the whole chain to the merger. Its
            // output enters the heap pre-advanced like any other source.
            overlapped.push(last);
            let merged = (self.chunks_merge)(overlapped);
            self.iterators.push(merged);
            let source_idx = self.iterators.len() - 1;
            self.push_if_alive(source_idx);
        }

        !self.heap.is_empty()
    }

    fn at(&self) -> Chunk {
        self.heap
            .peek()
            .expect("at() called with no chunk exposed")
            .chunk
            .clone()
    }

    fn err(&self) -> Option<&GenericError> {
        self.iterators.iter().find_map(|iter| iter.err())
    }
}
