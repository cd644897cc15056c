// Copyright 2022 CeresDB Project Authors. Licensed under Apache-2.0.

//! Label-keyed merge of series sets across backends.

use std::{
    cmp::Ordering,
    collections::BinaryHeap,
    fmt, mem,
    time::Instant,
};

use common_util::error::GenericError;
use log::debug;

use crate::{
    merge::{MergeFn, VerticalChunkSeriesMergeFn, VerticalSeriesMergeFn},
    series::{Labeled, SendableChunkSeriesSet, SendableSeriesSet, SeriesSet},
    storage::Warnings,
};

/// Merge label-ascending `sets` into one label-ascending set containing one
/// entry per distinct label set; same-label groups are fused through
/// `merge_fn`.
///
/// Inputs are primed lazily on the first `next()` call.
pub fn merge_series_sets(
    sets: Vec<SendableSeriesSet>,
    merge_fn: VerticalSeriesMergeFn,
) -> SendableSeriesSet {
    if sets.len() == 1 {
        return sets.into_iter().next().unwrap();
    }
    Box::new(MergeSeriesSet::new(sets, merge_fn))
}

/// Chunk-granularity counterpart of [merge_series_sets].
pub fn merge_chunk_series_sets(
    sets: Vec<SendableChunkSeriesSet>,
    merge_fn: VerticalChunkSeriesMergeFn,
) -> SendableChunkSeriesSet {
    if sets.len() == 1 {
        return sets.into_iter().next().unwrap();
    }
    Box::new(MergeSeriesSet::new(sets, merge_fn))
}

/// Heap entry of one input set, keyed by the labels of its exposed series.
///
/// Comparison is reversed so the std max-heap pops the smallest label set;
/// the set index breaks ties so the primary's entry leads its group.
pub(crate) struct SetCursor<T> {
    pub(crate) entry: T,
    pub(crate) set_idx: usize,
}

impl<T: Labeled> PartialEq for SetCursor<T> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<T: Labeled> Eq for SetCursor<T> {}

impl<T: Labeled> PartialOrd for SetCursor<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T: Labeled> Ord for SetCursor<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .entry
            .labels()
            .cmp(self.entry.labels())
            .then_with(|| other.set_idx.cmp(&self.set_idx))
    }
}

/// Metrics of one merge pass, logged when the set is dropped.
struct Metrics {
    num_sets: usize,
    total_groups: usize,
    create_at: Instant,
    inited_at: Option<Instant>,
}

impl Metrics {
    fn new(num_sets: usize) -> Self {
        Self {
            num_sets,
            total_groups: 0,
            create_at: Instant::now(),
            inited_at: None,
        }
    }
}

impl fmt::Debug for Metrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Metrics")
            .field("num_sets", &self.num_sets)
            .field("total_groups", &self.total_groups)
            .field("duration_since_create", &self.create_at.elapsed())
            .field("duration_since_init", &self.inited_at.map(|v| v.elapsed()))
            .finish()
    }
}

/// K-way merge of label-ascending series sets.
///
/// Sets exposed in the current group are advanced only by the following
/// `next()` call, keeping `at()` stable in between.
pub struct MergeSeriesSet<T: Labeled + Clone + Send + 'static> {
    /// All input sets in construction order. Exhausted sets stay here so
    /// `err()` and `warnings()` can scan them in fixed order.
    sets: Vec<Box<dyn SeriesSet<Item = T>>>,
    /// Every member exposes a valid series.
    heap: BinaryHeap<SetCursor<T>>,
    /// Cursors of the exposed same-label group.
    current: Vec<SetCursor<T>>,
    merge_fn: MergeFn<T>,
    inited: bool,
    metrics: Metrics,
}

impl<T: Labeled + Clone + Send + 'static> MergeSeriesSet<T> {
    pub fn new(sets: Vec<Box<dyn SeriesSet<Item = T>>>, merge_fn: MergeFn<T>) -> Self {
        let heap = BinaryHeap::with_capacity(sets.len());
        let metrics = Metrics::new(sets.len());
        Self {
            sets,
            heap,
            current: Vec::new(),
            merge_fn,
            inited: false,
            metrics,
        }
    }

    /// Build from inputs already primed into `heap`, cursors indexing into
    /// `sets`.
    pub(crate) fn from_primed(
        sets: Vec<Box<dyn SeriesSet<Item = T>>>,
        heap: BinaryHeap<SetCursor<T>>,
        merge_fn: MergeFn<T>,
    ) -> Self {
        let mut metrics = Metrics::new(sets.len());
        metrics.inited_at = Some(Instant::now());
        Self {
            sets,
            heap,
            current: Vec::new(),
            merge_fn,
            inited: true,
            metrics,
        }
    }

    fn init_if_necessary(&mut self) {
        if self.inited {
            return;
        }
        self.inited = true;

        for set_idx in 0..self.sets.len() {
            if self.sets[set_idx].next() {
                self.heap.push(SetCursor {
                    entry: self.sets[set_idx].at(),
                    set_idx,
                });
            }
        }
        self.metrics.inited_at = Some(Instant::now());
    }
}

impl<T: Labeled + Clone + Send + 'static> SeriesSet for MergeSeriesSet<T> {
    type Item = T;

    fn next(&mut self) -> bool {
        self.init_if_necessary();

        // Loop in case every set popped for a label comes back dead; then
        // keep trying with the next label set.
        loop {
            // First advance the previously exposed group, keeping at()
            // stable up to this point.
            for cursor in mem::take(&mut self.current) {
                let set_idx = cursor.set_idx;
                if self.sets[set_idx].next() {
                    self.heap.push(SetCursor {
                        entry: self.sets[set_idx].at(),
                        set_idx,
                    });
                }
            }

            if self.heap.is_empty() {
                return false;
            }

            // Pop every set whose exposed series carries the smallest
            // label set; together they form the next group.
            let group_labels = self.heap.peek().unwrap().entry.labels().clone();
            while let Some(top) = self.heap.peek() {
                if top.entry.labels() != &group_labels {
                    break;
                }
                self.current.push(self.heap.pop().unwrap());
            }

            if !self.current.is_empty() {
                self.metrics.total_groups += 1;
                return true;
            }
        }
    }

    fn at(&self) -> T {
        assert!(
            !self.current.is_empty(),
            "at() called with no series exposed"
        );

        if self.current.len() == 1 {
            return self.current[0].entry.clone();
        }

        let group = self
            .current
            .iter()
            .map(|cursor| cursor.entry.clone())
            .collect();
        (self.merge_fn)(group)
    }

    fn err(&self) -> Option<&GenericError> {
        self.sets.iter().find_map(|set| set.err())
    }

    fn warnings(&self) -> Warnings {
        let mut warnings = Warnings::new();
        for set in &self.sets {
            warnings.extend(set.warnings());
        }
        warnings
    }
}

impl<T: Labeled + Clone + Send + 'static> Drop for MergeSeriesSet<T> {
    fn drop(&mut self) {
        debug!("Merge series set dropped, metrics:{:?}", self.metrics);
    }
}

#[cfg(test)]
mod tests {
    use common_types::labels::Labels;

    use super::*;
    use crate::{
        merge::chained_series_merge_fn,
        series::SeriesRef,
        tests::{collect_series, samples, series, string_err, VectorSeriesSet},
    };

    fn boxed(set: VectorSeriesSet<SeriesRef>) -> SendableSeriesSet {
        Box::new(set)
    }

    #[test]
    fn test_merge_sets_disjoint_series() {
        let mut merged = merge_series_sets(
            vec![
                boxed(VectorSeriesSet::new(vec![series(
                    vec![("name", "a")],
                    vec![(1, 1.0), (3, 3.0)],
                )])),
                boxed(VectorSeriesSet::new(vec![series(
                    vec![("name", "b")],
                    vec![(2, 2.0)],
                )])),
            ],
            chained_series_merge_fn(),
        );

        assert_eq!(
            collect_series(merged.as_mut()),
            vec![
                (
                    Labels::from(vec![("name", "a")]),
                    samples(vec![(1, 1.0), (3, 3.0)])
                ),
                (Labels::from(vec![("name", "b")]), samples(vec![(2, 2.0)])),
            ]
        );
        assert!(merged.err().is_none());
        assert!(merged.warnings().is_empty());
    }

    #[test]
    fn test_merge_sets_same_series_overlapping_samples() {
        let mut merged = merge_series_sets(
            vec![
                boxed(VectorSeriesSet::new(vec![series(
                    vec![("name", "x")],
                    vec![(1, 10.0), (2, 20.0)],
                )])),
                boxed(VectorSeriesSet::new(vec![series(
                    vec![("name", "x")],
                    vec![(2, 99.0), (3, 30.0)],
                )])),
            ],
            chained_series_merge_fn(),
        );

        let got = collect_series(merged.as_mut());
        assert_eq!(got.len(), 1);
        let (labels, got_samples) = &got[0];
        assert_eq!(labels, &Labels::from(vec![("name", "x")]));
        // Exactly three samples, strictly ascending, timestamp 2 once.
        assert_eq!(*got_samples, samples(vec![(1, 10.0), (2, 20.0), (3, 30.0)]));
    }

    #[test]
    fn test_merge_sets_label_ascending_interleaved() {
        let mut merged = merge_series_sets(
            vec![
                boxed(VectorSeriesSet::new(vec![
                    series(vec![("name", "a")], vec![(1, 1.0)]),
                    series(vec![("name", "c")], vec![(1, 1.0)]),
                ])),
                boxed(VectorSeriesSet::new(vec![
                    series(vec![("name", "b")], vec![(1, 1.0)]),
                    series(vec![("name", "d")], vec![(1, 1.0)]),
                ])),
                boxed(VectorSeriesSet::new(vec![
                    series(vec![("name", "b")], vec![(2, 2.0)]),
                    series(vec![("name", "e")], vec![(1, 1.0)]),
                ])),
            ],
            chained_series_merge_fn(),
        );

        let got = collect_series(merged.as_mut());
        let names: Vec<_> = got
            .iter()
            .map(|(labels, _)| labels.get("name").unwrap().to_string())
            .collect();
        // Each distinct label set appears exactly once, ascending.
        assert_eq!(names, vec!["a", "b", "c", "d", "e"]);

        let b_samples = &got[1].1;
        assert_eq!(*b_samples, samples(vec![(1, 1.0), (2, 2.0)]));
    }

    #[test]
    fn test_merge_sets_all_empty() {
        let mut merged = merge_series_sets(
            vec![
                boxed(VectorSeriesSet::new(Vec::new())),
                boxed(VectorSeriesSet::new(Vec::new())),
            ],
            chained_series_merge_fn(),
        );

        assert!(!merged.next());
        assert!(merged.err().is_none());
        assert!(merged.warnings().is_empty());
    }

    #[test]
    fn test_merge_sets_at_stable_between_next() {
        let mut merged = merge_series_sets(
            vec![
                boxed(VectorSeriesSet::new(vec![series(
                    vec![("name", "a")],
                    vec![(1, 1.0)],
                )])),
                boxed(VectorSeriesSet::new(vec![series(
                    vec![("name", "b")],
                    vec![(2, 2.0)],
                )])),
            ],
            chained_series_merge_fn(),
        );

        assert!(merged.next());
        assert_eq!(merged.at().labels(), &Labels::from(vec![("name", "a")]));
        assert_eq!(merged.at().labels(), &Labels::from(vec![("name", "a")]));
        assert!(merged.next());
        assert_eq!(merged.at().labels(), &Labels::from(vec![("name", "b")]));
    }

    #[test]
    fn test_merge_sets_err_first_in_fixed_order() {
        let mut merged = merge_series_sets(
            vec![
                boxed(VectorSeriesSet::new(vec![series(
                    vec![("name", "a")],
                    vec![(1, 1.0)],
                )])),
                boxed(VectorSeriesSet::new(Vec::new()).with_err(string_err("backend down"))),
            ],
            chained_series_merge_fn(),
        );

        assert!(merged.next());
        assert!(!merged.next());
        assert_eq!(merged.err().unwrap().to_string(), "backend down");
    }

    #[test]
    fn test_merge_sets_warnings_concatenated() {
        let mut merged = merge_series_sets(
            vec![
                boxed(VectorSeriesSet::new(Vec::new()).with_warning("slow backend")),
                boxed(VectorSeriesSet::new(Vec::new()).with_warning("stale data")),
            ],
            chained_series_merge_fn(),
        );

        assert!(!merged.next());
        let warnings = merged.warnings();
        let messages: Vec<_> = warnings.iter().map(|w| w.to_string()).collect();
        assert_eq!(messages, vec!["slow backend", "stale data"]);
    }

    #[test]
    fn test_merge_chunk_sets_overlap_across_backends() {
        use std::sync::{Arc, Mutex};

        use crate::{
            merge::chunk::vertical_chunk_series_merge_fn,
            series::ChunkSeriesRef,
            tests::{chunk, chunk_series, collect_chunks, recording_chunks_merger},
        };

        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut merged = merge_chunk_series_sets(
            vec![
                Box::new(VectorSeriesSet::new(vec![chunk_series(
                    vec![("name", "y")],
                    vec![chunk(0, 5), chunk(10, 15)],
                )])) as SendableChunkSeriesSet,
                Box::new(VectorSeriesSet::new(vec![chunk_series(
                    vec![("name", "y")],
                    vec![chunk(3, 12)],
                )])),
            ],
            vertical_chunk_series_merge_fn(recording_chunks_merger(calls.clone())),
        );

        assert!(merged.next());
        let series: ChunkSeriesRef = merged.at();
        assert_eq!(series.labels(), &Labels::from(vec![("name", "y")]));

        let mut iter = series.iterator();
        let got = collect_chunks(iter.as_mut());

        // The whole overlap run reached the merger in one call and the
        // output jointly covers [0, 15] in (min_time, max_time) order.
        assert_eq!(
            *calls.lock().unwrap(),
            vec![vec![chunk(0, 5), chunk(3, 12), chunk(10, 15)]]
        );
        assert_eq!(got, vec![chunk(0, 5), chunk(0, 15)]);
        for window in got.windows(2) {
            assert!(window[0].min_time <= window[1].min_time);
        }

        assert!(!merged.next());
    }

    #[test]
    fn test_merge_sets_single_input_passthrough() {
        let mut merged = merge_series_sets(
            vec![boxed(VectorSeriesSet::new(vec![series(
                vec![("name", "a")],
                vec![(1, 1.0)],
            )]))],
            chained_series_merge_fn(),
        );

        assert_eq!(collect_series(merged.as_mut()).len(), 1);
    }
}
