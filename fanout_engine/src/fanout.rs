// Copyright 2022 CeresDB Project Authors. Licensed under Apache-2.0.

//! Fanout storage broadcasting writes and scattering reads across one
//! primary and any number of secondary backends.

use std::sync::Arc;

use async_trait::async_trait;
use common_types::{labels::Labels, time::Timestamp};
use common_util::error::{BoxError, MultiError};
use log::{debug, error};
use snafu::ResultExt;

use crate::{
    merge::chained_series_merge_fn,
    querier::MergeQuerier,
    storage::{
        AppendRef, Appender, AppenderRef, CloseStorage, OpenFanoutQuerier, QuerierRef,
        QueryContext, Result, Storage, StorageRef,
    },
};

/// Storage proxying reads and writes through one primary and any number of
/// secondary storages.
///
/// The primary/secondary split matters on the read path only: a primary
/// failure fails the operation, while a secondary failure demotes that
/// backend's contribution to a warning. On the write path the first
/// backend to fail, primary or secondary, aborts the call.
pub struct FanoutStorage {
    primary: StorageRef,
    secondaries: Vec<StorageRef>,
}

impl FanoutStorage {
    pub fn new(primary: StorageRef, secondaries: Vec<StorageRef>) -> Self {
        Self {
            primary,
            secondaries,
        }
    }
}

#[async_trait]
impl Storage for FanoutStorage {
    async fn start_time(&self) -> Result<Timestamp> {
        // Earliest start time across every backend; any failure aborts.
        let mut first = self.primary.start_time().await?;
        for storage in &self.secondaries {
            first = first.min(storage.start_time().await?);
        }

        Ok(first)
    }

    async fn querier(
        &self,
        ctx: &QueryContext,
        mint: Timestamp,
        maxt: Timestamp,
    ) -> Result<QuerierRef> {
        let primary = self.primary.querier(ctx, mint, maxt).await?;

        let mut secondaries = Vec::with_capacity(self.secondaries.len());
        for storage in &self.secondaries {
            match storage.querier(ctx, mint, maxt).await {
                Ok(querier) => secondaries.push(querier),
                Err(open_err) => {
                    // Close already open queriers, keeping every close
                    // failure next to the open error.
                    let mut errs = MultiError::new();
                    errs.push(Box::new(open_err));
                    errs.collect(primary.close().await);
                    for querier in &secondaries {
                        errs.collect(querier.close().await);
                    }
                    return Err(errs).box_err().context(OpenFanoutQuerier);
                }
            }
        }

        debug!(
            "Fanout querier opened, request_id:{}, mint:{}, maxt:{}, secondaries:{}",
            ctx.request_id,
            mint,
            maxt,
            secondaries.len()
        );

        Ok(Arc::new(MergeQuerier::new(
            ctx,
            primary,
            secondaries,
            chained_series_merge_fn(),
        )))
    }

    fn appender(&self) -> AppenderRef {
        let secondaries = self
            .secondaries
            .iter()
            .map(|storage| storage.appender())
            .collect();

        Box::new(FanoutAppender {
            primary: self.primary.appender(),
            secondaries,
        })
    }

    async fn close(&self) -> Result<()> {
        let mut errs = MultiError::new();
        errs.collect(self.primary.close().await);
        for storage in &self.secondaries {
            errs.collect(storage.close().await);
        }

        match errs.err() {
            Some(errs) => Err(errs).box_err().context(CloseStorage),
            None => Ok(()),
        }
    }
}

/// Appender broadcasting every write to all backends, primary first.
///
/// The reference returned by `add` is the primary's; `add_fast` hands that
/// same reference to every secondary, so secondaries must honor the
/// primary's reference namespace. Deployments pairing backends with
/// private namespaces have to route writes through `add`.
pub struct FanoutAppender {
    primary: AppenderRef,
    secondaries: Vec<AppenderRef>,
}

#[async_trait]
impl Appender for FanoutAppender {
    async fn add(
        &mut self,
        labels: Labels,
        timestamp: Timestamp,
        value: f64,
    ) -> Result<AppendRef> {
        let reference = self.primary.add(labels.clone(), timestamp, value).await?;

        for appender in &mut self.secondaries {
            appender.add(labels.clone(), timestamp, value).await?;
        }

        // Only the primary's reference is meaningful to the caller.
        Ok(reference)
    }

    async fn add_fast(
        &mut self,
        reference: AppendRef,
        timestamp: Timestamp,
        value: f64,
    ) -> Result<()> {
        self.primary.add_fast(reference, timestamp, value).await?;

        for appender in &mut self.secondaries {
            appender.add_fast(reference, timestamp, value).await?;
        }

        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        let mut result = self.primary.commit().await;

        for appender in &mut self.secondaries {
            if result.is_ok() {
                result = appender.commit().await;
            } else if let Err(rollback_err) = appender.rollback().await {
                error!("Squashed rollback error on commit, err:{}", rollback_err);
            }
        }

        result
    }

    async fn rollback(&mut self) -> Result<()> {
        let mut result = self.primary.rollback().await;

        for appender in &mut self.secondaries {
            let rollback_result = appender.rollback().await;
            if result.is_ok() {
                result = rollback_result;
            } else if let Err(rollback_err) = rollback_result {
                error!("Squashed rollback error on rollback, err:{}", rollback_err);
            }
        }

        // Rollback of the secondaries is best effort, but the first
        // failure is still surfaced so callers know it was incomplete.
        result
    }
}
