// Copyright 2022 CeresDB Project Authors. Licensed under Apache-2.0.

//! Sample-level vertical merge.

use std::{cmp::Ordering, collections::BinaryHeap, sync::Arc};

use common_types::{labels::Labels, sample::Sample, time::Timestamp};
use common_util::error::GenericError;

use crate::series::{EmptySeries, Labeled, SampleIterator, Series, SeriesRef};

/// Merge series sharing one label set into a single series by chaining
/// their samples together.
///
/// On duplicate timestamps the sample of the earliest input wins and the
/// rest are dropped; same-timestamp samples of one series are presumed
/// semantically equal across backends.
pub fn chained_series_merge(series: Vec<SeriesRef>) -> SeriesRef {
    if series.is_empty() {
        return Arc::new(EmptySeries::default());
    }

    let labels = series[0].labels().clone();
    Arc::new(ChainSeries { labels, series })
}

/// Same-label series merged through [ChainSampleIterator].
pub struct ChainSeries {
    labels: Labels,
    series: Vec<SeriesRef>,
}

impl Labeled for ChainSeries {
    fn labels(&self) -> &Labels {
        &self.labels
    }
}

impl Series for ChainSeries {
    fn iterator(&self) -> Box<dyn SampleIterator> {
        let iterators = self.series.iter().map(|series| series.iterator()).collect();
        Box::new(ChainSampleIterator::new(iterators))
    }
}

/// Heap entry of one source, keyed by its exposed sample.
///
/// Comparison is reversed so the std max-heap pops the smallest timestamp;
/// the source index breaks ties, making the duplicate winner stable.
struct SampleCursor {
    sample: Sample,
    source_idx: usize,
}

impl PartialEq for SampleCursor {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for SampleCursor {}

impl PartialOrd for SampleCursor {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SampleCursor {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .sample
            .timestamp
            .cmp(&self.sample.timestamp)
            .then_with(|| other.source_idx.cmp(&self.source_idx))
    }
}

/// K-way merge of sample iterators belonging to one series.
///
/// Sources are primed lazily on the first `next()` or `seek()`.
pub struct ChainSampleIterator {
    /// All sources in construction order. Exhausted sources stay here so
    /// `err()` can scan them in fixed order.
    iterators: Vec<Box<dyn SampleIterator>>,
    /// Every member exposes a valid sample.
    heap: BinaryHeap<SampleCursor>,
    primed: bool,
}

impl ChainSampleIterator {
    pub fn new(iterators: Vec<Box<dyn SampleIterator>>) -> Self {
        let heap = BinaryHeap::with_capacity(iterators.len());
        Self {
            iterators,
            heap,
            primed: false,
        }
    }

    fn prime(&mut self) {
        for source_idx in 0..self.iterators.len() {
            if self.iterators[source_idx].next() {
                self.heap.push(SampleCursor {
                    sample: self.iterators[source_idx].at(),
                    source_idx,
                });
            }
        }
        self.primed = true;
    }

    /// Pop the top cursor and advance its source, keeping it iff alive.
    fn advance_top(&mut self) {
        let source_idx = self.heap.pop().unwrap().source_idx;
        if self.iterators[source_idx].next() {
            self.heap.push(SampleCursor {
                sample: self.iterators[source_idx].at(),
                source_idx,
            });
        }
    }
}

impl SampleIterator for ChainSampleIterator {
    fn seek(&mut self, ts: Timestamp) -> bool {
        self.heap.clear();
        for source_idx in 0..self.iterators.len() {
            if self.iterators[source_idx].seek(ts) {
                self.heap.push(SampleCursor {
                    sample: self.iterators[source_idx].at(),
                    source_idx,
                });
            }
        }
        self.primed = true;

        !self.heap.is_empty()
    }

    fn next(&mut self) -> bool {
        if !self.primed {
            self.prime();
            return !self.heap.is_empty();
        }

        if self.heap.is_empty() {
            return false;
        }

        // Advance every source stuck at the exposed timestamp; all but the
        // exposed sample are duplicates to drop.
        let current = self.at().timestamp;
        while let Some(top) = self.heap.peek() {
            if top.sample.timestamp != current {
                break;
            }
            self.advance_top();
        }

        !self.heap.is_empty()
    }

    fn at(&self) -> Sample {
        self.heap
            .peek()
            .expect("at() called with no sample exposed")
            .sample
    }

    fn err(&self) -> Option<&GenericError> {
        self.iterators.iter().find_map(|iter| iter.err())
    }
}
