// This file is part of settlement-engine.
// Copyright (C) 2025 Midnight Foundation
// SPDX-License-Identifier: Apache-2.0
// Licensed under the Apache License, Version 2.0 (the "License");
// You may not use this file except in compliance with the License.
// You may obtain a copy of the License at
// http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::domain::{
    BatchSettlementEngine, ChainClient, ClaimNotifier, ConversionOracle, Engine,
    FiatOnrampReconciler, Job, JobError, JobRecord, Mailer, storage::Storage,
};
use anyhow::Context;
use chrono::{DateTime, Utc};
use fastrace::{Span, future::FutureExt, prelude::SpanContext};
use futures::future::try_join_all;
use log::{debug, error, info, warn};
use metrics::counter;
use serde::Deserialize;
use std::{error::Error as StdError, num::NonZeroUsize, time::Duration};
use tokio::{
    select,
    signal::unix::Signal,
    task,
    time::{MissedTickBehavior, interval, sleep},
};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Number of jobs executed concurrently.
    pub concurrency: NonZeroUsize,

    /// Pause before polling again when no job is due.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Time a claimed job is reserved for its worker; afterwards it is picked up again.
    #[serde(with = "humantime_serde")]
    pub job_lease: Duration,

    #[serde(with = "humantime_serde")]
    pub rate_sync_interval: Duration,

    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,

    pub sweep_limit: usize,
}

pub async fn run<S, C, M>(
    config: Config,
    engine: Engine<S, C>,
    storage: S,
    mailer: M,
    mut sigterm: Signal,
) -> anyhow::Result<()>
where
    S: Storage,
    C: ChainClient,
    M: Mailer,
{
    let Config {
        concurrency,
        poll_interval,
        job_lease,
        rate_sync_interval,
        sweep_interval,
        sweep_limit,
    } = config;

    let rate = engine
        .oracle
        .current()
        .await
        .context("get initial conversion rate")?;
    info!(rate:% = rate.get(), concurrency:%; "starting worker");

    let sync_rate_task = task::spawn(sync_rate(engine.oracle.clone(), rate_sync_interval));

    let sweep_task = task::spawn(sweep(
        engine.onramp.clone(),
        engine.settlement.clone(),
        sweep_interval,
        sweep_limit,
    ));

    let jobs_task = task::spawn({
        let runner = JobRunner::new(engine, storage, mailer, job_lease);

        async move {
            let workers = (0..concurrency.get())
                .map(|worker| run_jobs(worker, runner.clone(), poll_interval));
            try_join_all(workers).await.map(|_| ())
        }
    });

    // None of the tasks is expected to complete.
    select! {
        result = sync_rate_task => result
            .context("sync_rate_task panicked")
            .and_then(|r| r.context("sync_rate_task failed")),

        result = sweep_task => result
            .context("sweep_task panicked")
            .and_then(|r| r.context("sweep_task failed")),

        result = jobs_task => result
            .context("jobs_task panicked")
            .and_then(|r| r.context("jobs_task failed")),

        _ = sigterm.recv() => {
            warn!("SIGTERM received");
            Ok(())
        }
    }
}

/// Executes jobs claimed from storage and applies the retry policy of the job kind to failures.
#[derive(Debug, Clone)]
pub struct JobRunner<S, C, M> {
    engine: Engine<S, C>,
    notifier: ClaimNotifier<S, M>,
    storage: S,
    lease: Duration,
}

impl<S, C, M> JobRunner<S, C, M>
where
    S: Storage,
    C: ChainClient,
    M: Mailer,
{
    pub fn new(engine: Engine<S, C>, storage: S, mailer: M, lease: Duration) -> Self {
        let notifier = ClaimNotifier::new(storage.clone(), mailer, engine.config.clone());

        Self {
            engine,
            notifier,
            storage,
            lease,
        }
    }

    /// Claim and execute the next due job; false if none is due.
    pub async fn run_next(&self) -> Result<bool, sqlx::Error> {
        let Some(JobRecord { id, job, attempts }) =
            self.storage.claim_next_job(Utc::now(), self.lease).await?
        else {
            return Ok(false);
        };

        let kind = job.kind();
        let result = self
            .execute(&job)
            .in_span(Span::root(kind.as_str(), SpanContext::random()))
            .await;

        match result {
            Ok(()) => {
                self.storage.complete_job(id).await?;
                counter!("settlement_jobs_completed_total", "kind" => kind.as_str()).increment(1);
                debug!(job_id:% = id, kind = kind.as_str(), attempts; "job completed");
            }

            Err(job_error) => {
                let retryable = job_error.is_retryable();
                let message = error_chain(job_error);
                let policy = self.engine.config.retry.policy(kind);

                if retryable && policy.should_retry(attempts) {
                    let run_at = retry_at(Utc::now(), policy.backoff);
                    self.storage.retry_job(id, run_at, &message).await?;

                    counter!("settlement_jobs_retried_total", "kind" => kind.as_str())
                        .increment(1);
                    warn!(
                        job_id:% = id,
                        kind = kind.as_str(),
                        attempts,
                        run_at:%,
                        error = message;
                        "job failed, retrying"
                    );
                } else {
                    self.storage.fail_job(id, &message).await?;

                    counter!("settlement_jobs_failed_total", "kind" => kind.as_str()).increment(1);
                    error!(
                        job_id:% = id,
                        kind = kind.as_str(),
                        attempts,
                        error = message;
                        "job failed"
                    );
                }
            }
        }

        Ok(true)
    }

    async fn execute(&self, job: &Job) -> Result<(), JobError> {
        match job {
            Job::SubmitHold { escrow_id } => self.engine.holds.submit_hold(*escrow_id).await,

            Job::SettleCampaign {
                campaign_id,
                outcome,
            } => self.engine.settlement.settle(*campaign_id, *outcome).await,

            Job::RecordTransaction(request) => {
                self.engine.recorder.record(request).await.map(|_| ())
            }

            Job::ProcessWithdrawal { reservation_id } => {
                self.engine.withdrawals.process(*reservation_id).await
            }

            Job::SendClaimNotification { guest_order_id } => {
                self.notifier.notify(*guest_order_id).await
            }

            Job::CreditGuestOrder { guest_order_id } => {
                self.engine.guest_credits.credit(*guest_order_id).await
            }
        }
    }
}

async fn run_jobs<S, C, M>(
    worker: usize,
    runner: JobRunner<S, C, M>,
    poll_interval: Duration,
) -> anyhow::Result<()>
where
    S: Storage,
    C: ChainClient,
    M: Mailer,
{
    debug!(worker; "job worker started");

    loop {
        match runner.run_next().await {
            Ok(true) => {}

            Ok(false) => sleep(poll_interval).await,

            Err(error) => {
                warn!(worker, error = error_chain(error); "cannot run next job");
                sleep(poll_interval).await;
            }
        }
    }
}

async fn sync_rate<S, C>(oracle: ConversionOracle<S, C>, period: Duration) -> anyhow::Result<()>
where
    S: Storage,
    C: ChainClient,
{
    let mut ticks = interval(period);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticks.tick().await;

        if let Err(error) = oracle.sync().await {
            warn!(error = error_chain(error); "cannot sync conversion rate");
        }
    }
}

/// Catch webhooks lost before their notification was enqueued and close expired campaigns.
async fn sweep<S, C>(
    onramp: FiatOnrampReconciler<S>,
    settlement: BatchSettlementEngine<S, C>,
    period: Duration,
    limit: usize,
) -> anyhow::Result<()>
where
    S: Storage,
    C: ChainClient,
{
    let mut ticks = interval(period);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticks.tick().await;

        match onramp.sweep(limit).await {
            Ok(0) => {}
            Ok(notified) => info!(notified; "swept confirmed guest orders"),
            Err(error) => warn!(error = error_chain(error); "cannot sweep guest orders"),
        }

        match settlement.close_expired(Utc::now(), limit).await {
            Ok(0) => {}
            Ok(closed) => info!(closed; "closed expired campaigns"),
            Err(error) => warn!(error = error_chain(error); "cannot close expired campaigns"),
        }
    }
}

fn retry_at(now: DateTime<Utc>, backoff: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(backoff)
        .ok()
        .and_then(|backoff| now.checked_add_signed(backoff))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn error_chain(error: impl StdError + Send + Sync + 'static) -> String {
    format!("{:#}", anyhow::Error::new(error))
}
