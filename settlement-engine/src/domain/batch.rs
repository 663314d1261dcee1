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

//! Release or refund of all holds of a closed campaign.
//!
//! A single owner account signs every batch, hence batches of one campaign are submitted strictly
//! sequentially within one job execution with consecutive nonces. Every submitted batch is
//! recorded per buyer in the settlements table before waiting for its receipt, so a retry never
//! resubmits for a buyer that is already part of a submitted or settled batch, regardless of
//! whether the on-chain buyer list has caught up yet.

use crate::domain::{
    Campaign, CampaignStatus, ChainClient, ChainError, Config, ContractCall, ContractEvent, Error,
    Job, JobError, NewJob, Receipt, RecordRequest, SettlementOutcome, TxParams, ValidationError,
    credits_delta, storage::Storage,
};
use chrono::{DateTime, Utc};
use derive_more::Display;
use fastrace::trace;
use itertools::Itertools;
use log::{debug, info, warn};
use settlement_common::domain::{CampaignId, TxHash, UserId};
use sqlx::Type;
use std::{collections::HashSet, sync::Arc};

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Type)]
#[sqlx(type_name = "SETTLEMENT_STATUS", rename_all = "snake_case")]
pub enum SettlementStatus {
    Submitted,
    Settled,
}

/// Per buyer record of a submitted settlement batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settlement {
    pub campaign_id: CampaignId,
    pub user_id: UserId,
    pub outcome: SettlementOutcome,
    pub tx_hash: TxHash,
    pub status: SettlementStatus,
}

#[derive(Debug, Clone)]
pub struct BatchSettlementEngine<S, C> {
    storage: S,
    chain: C,
    config: Arc<Config>,
}

impl<S, C> BatchSettlementEngine<S, C>
where
    S: Storage,
    C: ChainClient,
{
    pub fn new(storage: S, chain: C, config: Arc<Config>) -> Self {
        Self {
            storage,
            chain,
            config,
        }
    }

    /// Close an open campaign and enqueue its settlement. Returns false if it was already closed.
    #[trace]
    pub async fn close_campaign(&self, campaign_id: CampaignId) -> Result<bool, Error> {
        let campaign = self
            .storage
            .get_campaign(campaign_id)
            .await?
            .ok_or(ValidationError::UnknownCampaign(campaign_id))?;

        self.close(&campaign).await
    }

    /// Close all open campaigns past their deadline.
    #[trace]
    pub async fn close_expired(&self, now: DateTime<Utc>, limit: usize) -> Result<usize, Error> {
        let campaigns = self.storage.expired_open_campaigns(now, limit).await?;

        let mut closed = 0;
        for campaign in campaigns {
            if self.close(&campaign).await? {
                closed += 1;
            }
        }

        Ok(closed)
    }

    async fn close(&self, campaign: &Campaign) -> Result<bool, Error> {
        if campaign.status == CampaignStatus::Closed {
            debug!(campaign_id:% = campaign.id; "campaign already closed");
            return Ok(false);
        }

        let outcome = campaign.settlement_outcome();
        let job = NewJob::now(Job::SettleCampaign {
            campaign_id: campaign.id,
            outcome,
        });

        let closed = self
            .storage
            .close_campaign(campaign.id, outcome, &job)
            .await?;
        if closed {
            info!(
                campaign_id:% = campaign.id,
                outcome:%,
                sold_quantity = campaign.sold_quantity,
                goal_quantity = campaign.goal_quantity;
                "campaign closed"
            );
        }

        Ok(closed)
    }

    /// Settle all remaining buyers of the given campaign. Any failure aborts the remaining batches
    /// and is retryable; already mined batches are not rolled back.
    #[trace]
    pub async fn settle(
        &self,
        campaign_id: CampaignId,
        outcome: SettlementOutcome,
    ) -> Result<(), JobError> {
        let campaign = self
            .storage
            .get_campaign(campaign_id)
            .await?
            .ok_or_else(|| JobError::terminal(ValidationError::UnknownCampaign(campaign_id)))?;

        self.resume_submitted(&campaign, outcome).await?;

        let known = self
            .storage
            .settlements(campaign_id)
            .await?
            .into_iter()
            .map(|settlement| settlement.user_id)
            .collect::<HashSet<_>>();

        let buyers = self
            .chain
            .campaign_buyers(campaign.on_chain_campaign_id)
            .await
            .map_err(JobError::retryable)?
            .into_iter()
            .filter(|buyer| !known.contains(buyer))
            .unique()
            .collect::<Vec<_>>();

        if buyers.is_empty() {
            info!(campaign_id:%, outcome:%; "no buyers left to settle");
            return Ok(());
        }

        let base_nonce = self
            .chain
            .pending_nonce(self.config.owner_address)
            .await
            .map_err(JobError::retryable)?;

        let batches = buyers
            .chunks(self.config.batch_size.get())
            .map(|batch| batch.to_vec())
            .collect::<Vec<_>>();
        let batch_count = batches.len();

        for (batch_index, batch) in batches.into_iter().enumerate() {
            let call = match outcome {
                SettlementOutcome::Release => ContractCall::ReleaseBatch {
                    campaign: campaign.on_chain_campaign_id,
                    buyers: batch.clone(),
                },
                SettlementOutcome::Refund => ContractCall::RefundBatch {
                    campaign: campaign.on_chain_campaign_id,
                    buyers: batch.clone(),
                },
            };
            let params = TxParams {
                from: self.config.owner_address,
                nonce: Some(base_nonce + batch_index as u64),
                gas_limit: self.config.gas.batch_limit,
            };

            let tx_hash = self
                .chain
                .submit(&call, &params)
                .await
                .map_err(JobError::retryable)?;
            self.storage
                .insert_settlements(campaign_id, outcome, &batch, tx_hash)
                .await?;

            info!(
                campaign_id:%,
                outcome:%,
                batch_index,
                batch_count,
                buyers = batch.len(),
                tx_hash:%;
                "settlement batch submitted"
            );

            let receipt = self
                .chain
                .wait_receipt(tx_hash, self.config.receipt_timeout)
                .await
                .map_err(JobError::retryable)?;

            self.complete_batch(&campaign, outcome, &receipt)
                .await
                .map_err(JobError::Retryable)?;
        }

        Ok(())
    }

    /// Process batches submitted by a previous attempt from their receipts instead of
    /// resubmitting them; reverted batches are forgotten so their buyers are submitted again.
    async fn resume_submitted(
        &self,
        campaign: &Campaign,
        outcome: SettlementOutcome,
    ) -> Result<(), JobError> {
        let tx_hashes = self
            .storage
            .settlements(campaign.id)
            .await?
            .into_iter()
            .filter(|settlement| settlement.status == SettlementStatus::Submitted)
            .map(|settlement| settlement.tx_hash)
            .unique()
            .collect::<Vec<_>>();

        for tx_hash in tx_hashes {
            match self
                .chain
                .get_receipt(tx_hash)
                .await
                .map_err(JobError::retryable)?
            {
                None => {
                    return Err(JobError::retryable(ChainError::NotMined(tx_hash)));
                }

                Some(receipt) if !receipt.success => {
                    warn!(campaign_id:% = campaign.id, tx_hash:%; "settlement batch reverted, resubmitting");
                    self.storage.delete_settlements(campaign.id, tx_hash).await?;
                }

                Some(receipt) => {
                    debug!(campaign_id:% = campaign.id, tx_hash:%; "resuming mined settlement batch");
                    self.complete_batch(campaign, outcome, &receipt)
                        .await
                        .map_err(JobError::Retryable)?;
                }
            }
        }

        Ok(())
    }

    /// Enqueue one ledger job per decoded buyer event with the exact on-chain integers and
    /// finalize the buyers' escrow records.
    async fn complete_batch(
        &self,
        campaign: &Campaign,
        outcome: SettlementOutcome,
        receipt: &Receipt,
    ) -> Result<(), Error> {
        if !receipt.success {
            return Err(ChainError::Reverted(receipt.tx_hash).into());
        }

        let events = self.chain.decode_events(receipt).await?;

        let mut buyers = Vec::with_capacity(events.len());
        let mut jobs = Vec::with_capacity(events.len());
        for event in events {
            let (buyer, tt_amount_wei, credit_amount_wei) = match (outcome, event) {
                (
                    SettlementOutcome::Release,
                    ContractEvent::HoldReleased {
                        campaign: on_chain_campaign_id,
                        buyer,
                        tt_amount_wei,
                        credit_amount_wei,
                    },
                )
                | (
                    SettlementOutcome::Refund,
                    ContractEvent::HoldRefunded {
                        campaign: on_chain_campaign_id,
                        buyer,
                        tt_amount_wei,
                        credit_amount_wei,
                    },
                ) if on_chain_campaign_id == campaign.on_chain_campaign_id => {
                    (buyer, tt_amount_wei, credit_amount_wei)
                }

                (_, event) => {
                    debug!(event:?; "ignoring unrelated event");
                    continue;
                }
            };

            jobs.push(NewJob::now(Job::RecordTransaction(RecordRequest {
                tx_hash: receipt.tx_hash,
                user_id: buyer,
                campaign_id: Some(campaign.id),
                tx_type: outcome.tx_type(),
                tt_amount_wei,
                credits_delta_wei: credits_delta(credit_amount_wei, false)?,
                reservation_id: None,
            })));
            buyers.push(buyer);
        }

        self.storage
            .complete_settlement_batch(
                campaign.id,
                receipt.tx_hash,
                outcome.escrow_status(),
                &buyers,
                &jobs,
            )
            .await?;

        info!(
            campaign_id:% = campaign.id,
            outcome:%,
            tx_hash:% = receipt.tx_hash,
            buyers = buyers.len();
            "settlement batch completed"
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        domain::{
            BatchSettlementEngine, CampaignStatus, ContractCall, EscrowStatus, HoldCoordinator,
            Job, JobError, LedgerRecorder, RecordRequest, SettlementOutcome, SettlementStatus,
            TxType, storage::Storage,
        },
        testing::{FakeChain, InMemoryStorage, campaign, config, user},
    };
    use assert_matches::assert_matches;
    use settlement_common::domain::{CampaignId, UserId};
    use std::{collections::HashMap, num::NonZeroUsize, sync::Arc};

    const ONE: u128 = 1_000_000_000_000_000_000;

    struct Setup {
        storage: InMemoryStorage,
        chain: FakeChain,
        engine: BatchSettlementEngine<InMemoryStorage, FakeChain>,
    }

    /// Five buyers with two holds each of one ticket at 10 credits, rate 10.
    async fn setup(goal_quantity: u64, refund_on_deadline: bool) -> Setup {
        let storage = InMemoryStorage::default();
        let chain = FakeChain::default();
        chain.set_conversion_rate(10);

        let mut campaign = campaign(CampaignId(1), 10);
        campaign.goal_quantity = goal_quantity;
        campaign.refund_on_deadline = refund_on_deadline;
        storage.add_campaign(campaign);

        let mut config = config();
        config.batch_size = NonZeroUsize::new(2).unwrap();
        let config = Arc::new(config);

        let holds = HoldCoordinator::new(storage.clone(), chain.clone(), config.clone());
        for id in 1..=5 {
            storage.add_user(user(UserId(id), &format!("fan{id}")));
            chain.set_balances(UserId(id), 100 * ONE, 100 * ONE);
            for _ in 0..2 {
                let record = holds
                    .participate(UserId(id), CampaignId(1), 1)
                    .await
                    .unwrap();
                holds.submit_hold(record.id).await.unwrap();
            }
        }
        storage.clear_jobs();

        let engine = BatchSettlementEngine::new(storage.clone(), chain.clone(), config);
        Setup {
            storage,
            chain,
            engine,
        }
    }

    fn record_requests(storage: &InMemoryStorage) -> Vec<RecordRequest> {
        storage
            .queued_jobs()
            .into_iter()
            .filter_map(|job| match job.job {
                Job::RecordTransaction(request) => Some(request),
                _ => None,
            })
            .collect()
    }

    async fn close_and_settle(setup: &Setup) -> SettlementOutcome {
        assert_matches!(setup.engine.close_campaign(CampaignId(1)).await, Ok(true));
        assert_matches!(setup.engine.close_campaign(CampaignId(1)).await, Ok(false));

        let settle_jobs = setup
            .storage
            .queued_jobs()
            .into_iter()
            .filter_map(|job| match job.job {
                Job::SettleCampaign {
                    campaign_id,
                    outcome,
                } => Some((campaign_id, outcome)),
                _ => None,
            })
            .collect::<Vec<_>>();
        let [(campaign_id, outcome)] = settle_jobs.as_slice() else {
            panic!("expected exactly one settle job, got {settle_jobs:?}");
        };

        setup.engine.settle(*campaign_id, *outcome).await.unwrap();
        *outcome
    }

    #[tokio::test]
    async fn test_release_one_row_per_buyer() {
        let setup = setup(10, true).await;

        let outcome = close_and_settle(&setup).await;
        assert_eq!(outcome, SettlementOutcome::Release);

        // 5 buyers in batches of 2 with consecutive nonces.
        let batches = setup
            .chain
            .submitted_with_params()
            .into_iter()
            .filter(|(call, _)| matches!(call, ContractCall::ReleaseBatch { .. }))
            .map(|(_, params)| params.nonce)
            .collect::<Vec<_>>();
        assert_eq!(batches.len(), 3);
        let base = batches[0].unwrap();
        assert_eq!(batches, vec![Some(base), Some(base + 1), Some(base + 2)]);

        let recorder = LedgerRecorder::new(setup.storage.clone(), setup.chain.clone());
        for request in record_requests(&setup.storage) {
            recorder.record(&request).await.unwrap();
            // Replayed jobs are no-ops.
            recorder.record(&request).await.unwrap();
        }

        let rows = setup
            .storage
            .ledger_entries()
            .into_iter()
            .filter(|entry| entry.tx_type == TxType::Release)
            .collect::<Vec<_>>();
        assert_eq!(rows.len(), 5);

        let per_buyer = rows
            .iter()
            .map(|entry| (entry.user_id, entry.tt_amount_wei))
            .collect::<HashMap<_, _>>();
        assert_eq!(per_buyer.len(), 5);
        assert!(per_buyer.values().all(|tt| *tt == 2 * ONE));

        let records = setup.storage.escrow_records();
        assert_eq!(records.len(), 10);
        assert!(records.iter().all(|r| r.status == EscrowStatus::Released));

        let campaign = setup
            .storage
            .get_campaign(CampaignId(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(campaign.status, CampaignStatus::Closed);
        assert_eq!(campaign.settlement_policy, Some(SettlementOutcome::Release));
    }

    #[tokio::test]
    async fn test_refund_when_goal_missed() {
        let setup = setup(100, true).await;

        let outcome = close_and_settle(&setup).await;
        assert_eq!(outcome, SettlementOutcome::Refund);

        let records = setup.storage.escrow_records();
        assert!(records.iter().all(|r| r.status == EscrowStatus::Refunded));

        let requests = record_requests(&setup.storage);
        assert_eq!(requests.len(), 5);
        assert!(requests.iter().all(|r| r.tx_type == TxType::Refund));
    }

    #[tokio::test]
    async fn test_retry_after_partial_failure() {
        let setup = setup(10, false).await;
        setup.engine.close_campaign(CampaignId(1)).await.unwrap();

        // The second batch fails to submit; the contract's buyer list does not shrink either.
        setup.chain.freeze_buyers();
        setup.chain.fail_submission(2);
        let result = setup
            .engine
            .settle(CampaignId(1), SettlementOutcome::Release)
            .await;
        assert_matches!(result, Err(JobError::Retryable(_)));

        let settled = setup
            .storage
            .settlements(CampaignId(1))
            .await
            .unwrap()
            .into_iter()
            .filter(|s| s.status == SettlementStatus::Settled)
            .count();
        assert_eq!(settled, 2);

        setup
            .engine
            .settle(CampaignId(1), SettlementOutcome::Release)
            .await
            .unwrap();

        // Every buyer was part of exactly one submitted batch.
        let mut submitted = setup
            .chain
            .submitted()
            .into_iter()
            .filter_map(|call| match call {
                ContractCall::ReleaseBatch { buyers, .. } => Some(buyers),
                _ => None,
            })
            .flatten()
            .collect::<Vec<_>>();
        submitted.sort();
        assert_eq!(submitted, (1..=5).map(UserId).collect::<Vec<_>>());

        // A further retry finds no buyers left.
        setup
            .engine
            .settle(CampaignId(1), SettlementOutcome::Release)
            .await
            .unwrap();
        assert_eq!(setup.chain.submitted().len(), 10 + 3);
    }
}
