// Copyright 2022 CeresDB Project Authors. Licensed under Apache-2.0.

//! Merge querier scattering reads across one primary and many secondary
//! queriers and merging the gathered results.

use std::{
    cmp::Ordering,
    collections::{BTreeSet, BinaryHeap},
    sync::Arc,
};

use async_trait::async_trait;
use common_types::{labels::Matcher, request_id::RequestId};
use common_util::error::{BoxError, GenericError, MultiError};
use futures::future::join_all;
use log::debug;
use snafu::ResultExt;
use tokio::sync::mpsc;

use crate::{
    merge::{set::SetCursor, MergeFn, MergeSeriesSet},
    series::{Labeled, SeriesSet},
    storage::{
        CloseQueriers, LabelNames, LabelValues, Querier, QueryContext, Result, SelectHints,
        Warning, Warnings,
    },
};

type DynSeriesSet<T> = Box<dyn SeriesSet<Item = T>>;
type DynQuerier<T> = Arc<dyn Querier<Item = T>>;

/// Querier merging the results of one primary and many secondary queriers.
///
/// The primary is authoritative: its errors abort the operation. A
/// secondary never fails an operation; its errors are demoted to warnings
/// and whatever partial output it produced is used as is. Series appearing
/// in several backends under the same label set are fused through the
/// merge fn supplied at construction.
pub struct MergeQuerier<T: Labeled + Clone + Send + 'static> {
    request_id: RequestId,
    /// Primary first, then the wrapped secondaries in declared order.
    queriers: Vec<DynQuerier<T>>,
    merge_fn: MergeFn<T>,
}

impl<T: Labeled + Clone + Send + Sync + 'static> MergeQuerier<T> {
    pub fn new(
        ctx: &QueryContext,
        primary: DynQuerier<T>,
        secondaries: Vec<DynQuerier<T>>,
        merge_fn: MergeFn<T>,
    ) -> Self {
        let mut queriers = Vec::with_capacity(secondaries.len() + 1);
        queriers.push(primary);
        for querier in secondaries {
            // Designated no-op queriers contribute nothing, skip them.
            if !querier.is_noop() {
                queriers.push(Arc::new(SecondaryQuerier { inner: querier }) as DynQuerier<T>);
            }
        }

        Self {
            request_id: ctx.request_id,
            queriers,
            merge_fn,
        }
    }
}

#[async_trait]
impl<T: Labeled + Clone + Send + Sync + 'static> Querier for MergeQuerier<T> {
    type Item = T;

    async fn select(
        &self,
        sort_series: bool,
        hints: Option<SelectHints>,
        matchers: Vec<Matcher>,
    ) -> DynSeriesSet<T> {
        if self.queriers.len() == 1 {
            return self.queriers[0].select(sort_series, hints, matchers).await;
        }

        debug!(
            "Merge querier select, request_id:{}, queriers:{}, matchers:{:?}",
            self.request_id,
            self.queriers.len(),
            matchers
        );

        let (tx, mut rx) = mpsc::channel(self.queriers.len());
        for querier in &self.queriers {
            let querier = querier.clone();
            let tx = tx.clone();
            let hints = hints.clone();
            let matchers = matchers.clone();
            tokio::spawn(async move {
                // Inputs must be sorted for the label-keyed merge.
                let set = querier.select(true, hints, matchers).await;
                // A dropped receiver means the request was abandoned.
                let _ = tx.send(set).await;
            });
        }
        drop(tx);

        // The channel closing once every task has sent is the join barrier.
        let mut sets = Vec::with_capacity(self.queriers.len());
        while let Some(set) = rx.recv().await {
            sets.push(set);
        }

        Box::new(LazySet::new(sets, self.merge_fn.clone()))
    }

    async fn label_values(&self, name: &str) -> Result<(Vec<String>, Warnings)> {
        let mut results = Vec::with_capacity(self.queriers.len());
        let mut warnings = Warnings::new();
        for querier in &self.queriers {
            let (values, wrn) = querier
                .label_values(name)
                .await
                .box_err()
                .context(LabelValues { name })?;
            warnings.extend(wrn);
            results.push(values);
        }

        Ok((merge_string_slices(results), warnings))
    }

    async fn label_names(&self) -> Result<(Vec<String>, Warnings)> {
        let mut names = BTreeSet::new();
        let mut warnings = Warnings::new();
        for querier in &self.queriers {
            let (backend_names, wrn) = querier.label_names().await.box_err().context(LabelNames)?;
            warnings.extend(wrn);
            names.extend(backend_names);
        }

        Ok((names.into_iter().collect(), warnings))
    }

    async fn close(&self) -> Result<()> {
        let results = join_all(self.queriers.iter().map(|querier| querier.close())).await;

        let mut errs = MultiError::new();
        for result in results {
            errs.collect(result);
        }
        match errs.err() {
            Some(errs) => Err(errs).box_err().context(CloseQueriers),
            None => Ok(()),
        }
    }
}

/// Fold sorted string slices into one sorted deduplicated list by pairwise
/// merging halves.
fn merge_string_slices(mut slices: Vec<Vec<String>>) -> Vec<String> {
    match slices.len() {
        0 => Vec::new(),
        1 => slices.pop().unwrap(),
        2 => {
            let b = slices.pop().unwrap();
            let a = slices.pop().unwrap();
            merge_two_string_slices(a, b)
        }
        _ => {
            let rest = slices.split_off(slices.len() / 2);
            merge_two_string_slices(merge_string_slices(slices), merge_string_slices(rest))
        }
    }
}

fn merge_two_string_slices(a: Vec<String>, b: Vec<String>) -> Vec<String> {
    let mut result = Vec::with_capacity(a.len() + b.len());
    let mut a = a.into_iter().peekable();
    let mut b = b.into_iter().peekable();
    while let (Some(x), Some(y)) = (a.peek(), b.peek()) {
        match x.cmp(y) {
            Ordering::Equal => {
                result.push(a.next().unwrap());
                b.next();
            }
            Ordering::Less => result.push(a.next().unwrap()),
            Ordering::Greater => result.push(b.next().unwrap()),
        }
    }
    result.extend(a);
    result.extend(b);

    result
}

/// Wrapper demoting every error of a secondary querier to a warning.
struct SecondaryQuerier<T: Labeled + Clone + Send + 'static> {
    inner: DynQuerier<T>,
}

#[async_trait]
impl<T: Labeled + Clone + Send + Sync + 'static> Querier for SecondaryQuerier<T> {
    type Item = T;

    async fn select(
        &self,
        sort_series: bool,
        hints: Option<SelectHints>,
        matchers: Vec<Matcher>,
    ) -> DynSeriesSet<T> {
        Box::new(SecondarySet {
            inner: self.inner.select(sort_series, hints, matchers).await,
            demoted: None,
        })
    }

    async fn label_values(&self, name: &str) -> Result<(Vec<String>, Warnings)> {
        match self.inner.label_values(name).await {
            Ok(response) => Ok(response),
            Err(e) => Ok((Vec::new(), vec![Arc::new(e) as Warning])),
        }
    }

    async fn label_names(&self) -> Result<(Vec<String>, Warnings)> {
        match self.inner.label_names().await {
            Ok(response) => Ok(response),
            Err(e) => Ok((Vec::new(), vec![Arc::new(e) as Warning])),
        }
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}

/// Set of a secondary querier. A terminal error is demoted to a warning
/// once iteration ends; entries already yielded stand.
struct SecondarySet<T: Labeled + Clone + Send + 'static> {
    inner: DynSeriesSet<T>,
    demoted: Option<Warning>,
}

impl<T: Labeled + Clone + Send + 'static> SeriesSet for SecondarySet<T> {
    type Item = T;

    fn next(&mut self) -> bool {
        let alive = self.inner.next();
        if !alive && self.demoted.is_none() {
            if let Some(err) = self.inner.err() {
                let boxed: GenericError = err.to_string().into();
                self.demoted = Some(Arc::from(boxed));
            }
        }
        alive
    }

    fn at(&self) -> T {
        self.inner.at()
    }

    fn err(&self) -> Option<&GenericError> {
        None
    }

    fn warnings(&self) -> Warnings {
        let mut warnings = self.inner.warnings();
        if let Some(warning) = &self.demoted {
            warnings.push(warning.clone());
        }
        warnings
    }
}

/// Merged set deferring heap construction to the first `next()` call, so a
/// primary failing during priming is reported without having consumed the
/// secondaries.
pub(crate) struct LazySet<T: Labeled + Clone + Send + 'static> {
    pending: Option<(Vec<DynSeriesSet<T>>, MergeFn<T>)>,
    inner: Option<DynSeriesSet<T>>,
}

impl<T: Labeled + Clone + Send + 'static> LazySet<T> {
    pub(crate) fn new(sets: Vec<DynSeriesSet<T>>, merge_fn: MergeFn<T>) -> Self {
        Self {
            pending: Some((sets, merge_fn)),
            inner: None,
        }
    }

    /// Prime every input and build the merged set, aborting on the first
    /// hard error. Secondary sets never report errors, so an aborting
    /// error always comes from the primary; its set is kept as the only
    /// inner set and everything gathered from secondaries is discarded.
    fn create(mut sets: Vec<DynSeriesSet<T>>, merge_fn: MergeFn<T>) -> (DynSeriesSet<T>, bool) {
        if sets.len() == 1 {
            let mut set = sets.pop().unwrap();
            let advanced = set.next();
            return (set, advanced);
        }

        let mut heap = BinaryHeap::with_capacity(sets.len());
        for set_idx in 0..sets.len() {
            if sets[set_idx].next() {
                heap.push(SetCursor {
                    entry: sets[set_idx].at(),
                    set_idx,
                });
            } else if sets[set_idx].err().is_some() {
                let failed = sets.swap_remove(set_idx);
                return (failed, false);
            }
        }

        let mut merged = MergeSeriesSet::from_primed(sets, heap, merge_fn);
        let advanced = merged.next();
        (Box::new(merged), advanced)
    }
}

impl<T: Labeled + Clone + Send + 'static> SeriesSet for LazySet<T> {
    type Item = T;

    fn next(&mut self) -> bool {
        if let Some((sets, merge_fn)) = self.pending.take() {
            let (inner, advanced) = Self::create(sets, merge_fn);
            self.inner = Some(inner);
            return advanced;
        }

        match &mut self.inner {
            Some(inner) => inner.next(),
            None => false,
        }
    }

    fn at(&self) -> T {
        self.inner.as_ref().expect("at() called before next()").at()
    }

    fn err(&self) -> Option<&GenericError> {
        self.inner.as_ref().and_then(|inner| inner.err())
    }

    fn warnings(&self) -> Warnings {
        match &self.inner {
            Some(inner) => inner.warnings(),
            None => Warnings::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use common_types::labels::Labels;
    use common_util::tests::init_log_for_test;

    use super::*;
    use crate::{
        merge::chained_series_merge_fn,
        series::SeriesRef,
        storage::{noop_querier, Error},
        tests::{collect_series, samples, series, MockQuerier},
    };

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    fn merge_querier(
        primary: MockQuerier,
        secondaries: Vec<MockQuerier>,
    ) -> MergeQuerier<SeriesRef> {
        MergeQuerier::new(
            &QueryContext::new(),
            Arc::new(primary),
            secondaries
                .into_iter()
                .map(|querier| Arc::new(querier) as DynQuerier<SeriesRef>)
                .collect(),
            chained_series_merge_fn(),
        )
    }

    #[test]
    fn test_merge_string_slices() {
        assert!(merge_string_slices(Vec::new()).is_empty());
        assert_eq!(
            merge_string_slices(vec![strings(&["a", "c", "e"])]),
            strings(&["a", "c", "e"])
        );
        // Duplicates collapse on merge.
        assert_eq!(
            merge_string_slices(vec![
                strings(&["a", "c", "e"]),
                strings(&["b", "c", "d"]),
                strings(&["a", "f"]),
            ]),
            strings(&["a", "b", "c", "d", "e", "f"])
        );
    }

    #[tokio::test]
    async fn test_select_two_backends_disjoint() {
        init_log_for_test();
        let querier = merge_querier(
            MockQuerier::new().with_series(vec![series(vec![("name", "a")], vec![(1, 1.0), (3, 3.0)])]),
            vec![MockQuerier::new().with_series(vec![series(vec![("name", "b")], vec![(2, 2.0)])])],
        );

        let mut set = querier.select(true, None, Vec::new()).await;
        assert_eq!(
            collect_series(set.as_mut()),
            vec![
                (
                    Labels::from(vec![("name", "a")]),
                    samples(vec![(1, 1.0), (3, 3.0)])
                ),
                (Labels::from(vec![("name", "b")]), samples(vec![(2, 2.0)])),
            ]
        );
        assert!(set.err().is_none());
        assert!(set.warnings().is_empty());
    }

    #[tokio::test]
    async fn test_select_overlapping_series_deduplicated() {
        let querier = merge_querier(
            MockQuerier::new().with_series(vec![series(
                vec![("name", "x")],
                vec![(1, 10.0), (2, 20.0)],
            )]),
            vec![MockQuerier::new().with_series(vec![series(
                vec![("name", "x")],
                vec![(2, 99.0), (3, 30.0)],
            )])],
        );

        let mut set = querier.select(true, None, Vec::new()).await;
        let got = collect_series(set.as_mut());
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].1, samples(vec![(1, 10.0), (2, 20.0), (3, 30.0)]));
    }

    #[tokio::test]
    async fn test_select_primary_error_aborts() {
        let querier = merge_querier(
            MockQuerier::new().fail_select("primary exploded"),
            vec![MockQuerier::new().with_series(vec![series(vec![("name", "a")], vec![(1, 1.0)])])],
        );

        let mut set = querier.select(true, None, Vec::new()).await;
        // No element survives and the failure surfaces as the terminal
        // error; secondary results gathered during priming are discarded.
        assert!(!set.next());
        assert!(set.err().unwrap().to_string().contains("primary exploded"));
    }

    #[tokio::test]
    async fn test_select_secondary_error_demoted() {
        let querier = merge_querier(
            MockQuerier::new().with_series(vec![series(vec![("name", "a")], vec![(1, 1.0)])]),
            vec![MockQuerier::new().fail_select("secondary exploded")],
        );

        let mut set = querier.select(true, None, Vec::new()).await;
        let got = collect_series(set.as_mut());
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].0, Labels::from(vec![("name", "a")]));

        assert!(set.err().is_none());
        let warnings = set.warnings();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].to_string().contains("secondary exploded"));
    }

    #[tokio::test]
    async fn test_select_single_querier_delegates() {
        let querier = merge_querier(
            MockQuerier::new().with_series(vec![series(vec![("name", "a")], vec![(1, 1.0)])]),
            Vec::new(),
        );

        let mut set = querier.select(true, None, Vec::new()).await;
        assert_eq!(collect_series(set.as_mut()).len(), 1);
    }

    #[tokio::test]
    async fn test_select_skips_noop_secondary() {
        let querier = MergeQuerier::new(
            &QueryContext::new(),
            Arc::new(MockQuerier::new().with_series(vec![series(vec![("name", "a")], vec![(1, 1.0)])])),
            vec![noop_querier()],
            chained_series_merge_fn(),
        );

        // The noop secondary is skipped entirely, leaving the single
        // querier fast path.
        assert_eq!(querier.queriers.len(), 1);
        let mut set = querier.select(true, None, Vec::new()).await;
        assert_eq!(collect_series(set.as_mut()).len(), 1);
    }

    #[tokio::test]
    async fn test_select_chunk_granularity() {
        use std::sync::Mutex;

        use crate::{
            merge::chunk::vertical_chunk_series_merge_fn,
            series::ChunkSeriesRef,
            tests::{chunk, chunk_series, collect_chunks, recording_chunks_merger, VectorSeriesSet},
        };

        struct MockChunkQuerier {
            series: Vec<ChunkSeriesRef>,
        }

        #[async_trait]
        impl Querier for MockChunkQuerier {
            type Item = ChunkSeriesRef;

            async fn select(
                &self,
                _sort_series: bool,
                _hints: Option<SelectHints>,
                _matchers: Vec<Matcher>,
            ) -> DynSeriesSet<ChunkSeriesRef> {
                Box::new(VectorSeriesSet::new(self.series.clone()))
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
        }

        let calls = Arc::new(Mutex::new(Vec::new()));
        let querier = MergeQuerier::new(
            &QueryContext::new(),
            Arc::new(MockChunkQuerier {
                series: vec![chunk_series(
                    vec![("name", "y")],
                    vec![chunk(0, 5), chunk(10, 15)],
                )],
            }),
            vec![Arc::new(MockChunkQuerier {
                series: vec![chunk_series(vec![("name", "y")], vec![chunk(3, 12)])],
            }) as DynQuerier<ChunkSeriesRef>],
            vertical_chunk_series_merge_fn(recording_chunks_merger(calls.clone())),
        );

        let mut set = querier.select(true, None, Vec::new()).await;
        assert!(set.next());
        let series = set.at();
        let mut iter = series.iterator();
        assert_eq!(
            collect_chunks(iter.as_mut()),
            vec![chunk(0, 5), chunk(0, 15)]
        );
        assert_eq!(calls.lock().unwrap().len(), 1);
        assert!(!set.next());
    }

    #[tokio::test]
    async fn test_label_values_merged_sorted_dedup() {
        let querier = merge_querier(
            MockQuerier::new().with_label_values(strings(&["a", "c", "e"])),
            vec![
                MockQuerier::new().with_label_values(strings(&["b", "c", "d"])),
                MockQuerier::new().with_label_values(strings(&["a", "f"])),
            ],
        );

        let (values, warnings) = querier.label_values("job").await.unwrap();
        assert_eq!(values, strings(&["a", "b", "c", "d", "e", "f"]));
        assert!(warnings.is_empty());
    }

    #[tokio::test]
    async fn test_label_values_primary_error_wraps_name() {
        let querier = merge_querier(
            MockQuerier::new().fail_label_values("primary exploded"),
            Vec::new(),
        );

        let err = querier.label_values("job").await.unwrap_err();
        assert!(matches!(err, Error::LabelValues { ref name, .. } if name == "job"));
        assert!(err.to_string().contains("job"));
    }

    #[tokio::test]
    async fn test_label_values_secondary_error_demoted() {
        let querier = merge_querier(
            MockQuerier::new().with_label_values(strings(&["a"])),
            vec![MockQuerier::new().fail_label_values("secondary exploded")],
        );

        let (values, warnings) = querier.label_values("job").await.unwrap();
        assert_eq!(values, strings(&["a"]));
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].to_string().contains("secondary exploded"));
    }

    #[tokio::test]
    async fn test_label_names_union_sorted_dedup() {
        let querier = merge_querier(
            MockQuerier::new().with_label_names(strings(&["instance", "job"])),
            vec![MockQuerier::new().with_label_names(strings(&["job", "zone"]))],
        );

        let (names, warnings) = querier.label_names().await.unwrap();
        assert_eq!(names, strings(&["instance", "job", "zone"]));
        assert!(warnings.is_empty());
    }

    #[tokio::test]
    async fn test_label_names_primary_error_aborts() {
        let querier = merge_querier(
            MockQuerier::new().fail_label_names("primary exploded"),
            vec![MockQuerier::new().with_label_names(strings(&["job"]))],
        );

        assert!(matches!(
            querier.label_names().await,
            Err(Error::LabelNames { .. })
        ));
    }

    #[tokio::test]
    async fn test_close_closes_every_querier_once() {
        let primary = MockQuerier::new();
        let secondary = MockQuerier::new();
        let primary_closes = primary.close_count();
        let secondary_closes = secondary.close_count();

        let querier = merge_querier(primary, vec![secondary]);
        querier.close().await.unwrap();

        assert_eq!(primary_closes.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(
            secondary_closes.load(std::sync::atomic::Ordering::SeqCst),
            1
        );
    }

    #[tokio::test]
    async fn test_close_aggregates_errors() {
        let querier = merge_querier(
            MockQuerier::new().fail_close("primary close"),
            vec![MockQuerier::new().fail_close("secondary close")],
        );

        let err = querier.close().await.unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("primary close"));
        assert!(msg.contains("secondary close"));
    }
}
