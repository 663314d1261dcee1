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
    ChainClient, ChainError, Config, ContractCall, ConversionOracle, EscrowLedger, EscrowRecord,
    EscrowStatus, Error, Job, JobError, NewEscrow, NewJob, RecordRequest, TxParams, TxType,
    ValidationError, credits_delta, storage::Storage,
};
use chrono::Utc;
use fastrace::trace;
use log::{debug, info, warn};
use settlement_common::domain::{
    AmountError, CampaignId, TxHash, UserId, amount::credits_to_token_wei,
};
use std::sync::Arc;
use uuid::Uuid;

/// Creates holds for participations and submits them on chain.
#[derive(Debug, Clone)]
pub struct HoldCoordinator<S, C> {
    storage: S,
    chain: C,
    oracle: ConversionOracle<S, C>,
    escrow: EscrowLedger<S>,
    config: Arc<Config>,
}

impl<S, C> HoldCoordinator<S, C>
where
    S: Storage,
    C: ChainClient,
{
    pub fn new(storage: S, chain: C, config: Arc<Config>) -> Self {
        Self {
            oracle: ConversionOracle::new(storage.clone(), chain.clone()),
            escrow: EscrowLedger::new(storage.clone()),
            storage,
            chain,
            config,
        }
    }

    /// Open a `held` escrow record for the participation; the job submitting the hold becomes
    /// visible together with the record.
    pub async fn participate(
        &self,
        user_id: UserId,
        campaign_id: CampaignId,
        quantity: u64,
    ) -> Result<EscrowRecord, Error> {
        self.open_participation(user_id, campaign_id, quantity, None)
            .await?
            .ok_or_else(|| Error::Mismatch("escrow record not opened".to_string()))
    }

    /// Like [HoldCoordinator::participate], but at most once for the given guest order.
    #[trace]
    pub async fn open_participation(
        &self,
        user_id: UserId,
        campaign_id: CampaignId,
        quantity: u64,
        guest_order_id: Option<Uuid>,
    ) -> Result<Option<EscrowRecord>, Error> {
        if quantity == 0 {
            return Err(ValidationError::InvalidQuantity.into());
        }

        let campaign = self
            .storage
            .get_campaign(campaign_id)
            .await?
            .ok_or(ValidationError::UnknownCampaign(campaign_id))?;
        if !campaign.accepts_participations(Utc::now()) {
            return Err(ValidationError::CampaignClosed(campaign_id).into());
        }

        self.storage
            .get_user(user_id)
            .await?
            .ok_or(ValidationError::UnknownUser(user_id))?;

        let credit_amount_wei = campaign
            .unit_price_credits_wei
            .checked_mul(quantity as u128)
            .ok_or(AmountError::Overflow("credit_amount"))?;
        let rate = self.oracle.current().await?;
        let tt_amount_wei = credits_to_token_wei(credit_amount_wei, rate);

        let escrow = NewEscrow {
            user_id,
            campaign_id,
            on_chain_campaign_id: campaign.on_chain_campaign_id,
            quantity,
            tt_amount_wei,
            credit_amount_wei,
        };
        let record = self.escrow.open(escrow, guest_order_id).await?;

        if let Some(record) = &record {
            info!(
                escrow_id:% = record.id,
                user_id:%,
                campaign_id:%,
                quantity,
                credit_amount_wei,
                tt_amount_wei;
                "escrow record opened"
            );
        }

        Ok(record)
    }

    /// Verify balances, submit the hold and record the outcome. Insufficient balance, reverts and
    /// timeouts refund the record and are terminal; RPC failures are retried.
    #[trace]
    pub async fn submit_hold(&self, escrow_id: Uuid) -> Result<(), JobError> {
        let record = self
            .storage
            .get_escrow(escrow_id)
            .await?
            .ok_or_else(|| {
                JobError::terminal(Error::Mismatch(format!("unknown escrow record {escrow_id}")))
            })?;

        if record.status != EscrowStatus::Held {
            debug!(escrow_id:%, status:% = record.status; "escrow record already final");
            return Ok(());
        }

        let tx_hash = match record.tx_hash {
            Some(tx_hash) => {
                debug!(escrow_id:%, tx_hash:%; "resuming submitted hold");
                tx_hash
            }

            None => {
                let balances = self.chain.get_balances(record.user_id).await?;
                if balances.token_wei < record.tt_amount_wei
                    || balances.credits_wei < record.credit_amount_wei
                {
                    let error = ValidationError::InsufficientBalance {
                        required_token_wei: record.tt_amount_wei,
                        required_credits_wei: record.credit_amount_wei,
                        available_token_wei: balances.token_wei,
                        available_credits_wei: balances.credits_wei,
                    };
                    return Err(self.refund(&record, None, error.into()).await);
                }

                let call = ContractCall::Hold {
                    campaign: record.on_chain_campaign_id,
                    buyer: record.user_id,
                    tt_amount_wei: record.tt_amount_wei,
                    credit_amount_wei: record.credit_amount_wei,
                };
                let params = TxParams {
                    from: self.config.owner_address,
                    nonce: None,
                    gas_limit: self.config.gas.hold_limit,
                };

                let tx_hash = match self.chain.submit(&call, &params).await {
                    Ok(tx_hash) => tx_hash,

                    Err(error @ (ChainError::Reverted(_) | ChainError::Rejected(_))) => {
                        return Err(self.refund(&record, None, error.into()).await);
                    }

                    Err(error) => return Err(error.into()),
                };

                self.storage
                    .set_escrow_submission(record.id, tx_hash)
                    .await?;
                tx_hash
            }
        };

        let receipt = match self
            .chain
            .wait_receipt(tx_hash, self.config.receipt_timeout)
            .await
        {
            Ok(receipt) if receipt.success => receipt,

            Ok(_) => {
                let error = ChainError::Reverted(tx_hash);
                return Err(self.refund(&record, Some(tx_hash), error.into()).await);
            }

            Err(
                error @ (ChainError::Reverted(_) | ChainError::Timeout(_) | ChainError::NotMined(_)),
            ) => {
                return Err(self.refund(&record, Some(tx_hash), error.into()).await);
            }

            Err(error) => return Err(error.into()),
        };

        let rate = self.oracle.current().await.map_err(JobError::Retryable)?;
        let gas_cost_tt_wei = receipt.gas_cost_wei();
        let gas_cost_credits_wei = gas_cost_tt_wei.saturating_mul(rate.get());

        let credits_delta_wei =
            credits_delta(record.credit_amount_wei, true).map_err(JobError::terminal)?;
        let job = NewJob::now(Job::RecordTransaction(RecordRequest {
            tx_hash,
            user_id: record.user_id,
            campaign_id: Some(record.campaign_id),
            tx_type: TxType::OnHold,
            tt_amount_wei: record.tt_amount_wei,
            credits_delta_wei,
            reservation_id: None,
        }));

        self.storage
            .record_hold_mined(record.id, gas_cost_tt_wei, gas_cost_credits_wei, &job)
            .await?;

        info!(
            escrow_id:%,
            tx_hash:%,
            block_number = receipt.block_number,
            gas_cost_tt_wei;
            "hold mined"
        );

        Ok(())
    }

    async fn refund(
        &self,
        record: &EscrowRecord,
        tx_hash: Option<TxHash>,
        error: Error,
    ) -> JobError {
        match self
            .escrow
            .finalize(record.id, EscrowStatus::Refunded, tx_hash)
            .await
        {
            Ok(_) => {
                warn!(escrow_id:% = record.id, error:% = error; "hold failed, escrow record refunded");
                JobError::Terminal(error)
            }

            Err(storage_error) => JobError::retryable(storage_error),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        domain::{
            ChainError, ContractCall, EscrowStatus, Error, HoldCoordinator, Job, JobError,
            TxType, ValidationError, storage::Storage,
        },
        testing::{FakeChain, InMemoryStorage, campaign, config, user},
    };
    use assert_matches::assert_matches;
    use settlement_common::domain::{CampaignId, OnChainCampaignId, UserId};
    use std::sync::Arc;

    const ONE: u128 = 1_000_000_000_000_000_000;

    fn setup() -> (InMemoryStorage, FakeChain, HoldCoordinator<InMemoryStorage, FakeChain>) {
        let storage = InMemoryStorage::default();
        storage.add_user(user(UserId(1), "fan"));
        storage.add_campaign(campaign(CampaignId(1), 10));
        let chain = FakeChain::default();
        chain.set_conversion_rate(10);
        let holds = HoldCoordinator::new(storage.clone(), chain.clone(), Arc::new(config()));
        (storage, chain, holds)
    }

    #[tokio::test]
    async fn test_tickets_scenario() {
        let (storage, chain, holds) = setup();
        chain.set_balances(UserId(1), 100 * ONE, 100 * ONE);

        // 3 tickets at 10 credits with 10 credits per token.
        let record = holds
            .participate(UserId(1), CampaignId(1), 3)
            .await
            .unwrap();
        assert_eq!(record.credit_amount_wei, 30 * ONE);
        assert_eq!(record.tt_amount_wei, 3 * ONE);
        assert_eq!(record.status, EscrowStatus::Held);
        assert!(record.tx_hash.is_none());

        holds.submit_hold(record.id).await.unwrap();

        let record = storage.get_escrow(record.id).await.unwrap().unwrap();
        assert_eq!(record.status, EscrowStatus::Held);
        assert!(record.tx_hash.is_some());
        assert!(record.gas_cost_tt_wei > 0);
        assert_eq!(record.gas_cost_credits_wei, record.gas_cost_tt_wei * 10);

        assert_matches!(
            chain.submitted().as_slice(),
            [ContractCall::Hold { tt_amount_wei, credit_amount_wei, .. }]
                if *tt_amount_wei == 3 * ONE && *credit_amount_wei == 30 * ONE
        );

        let record_jobs = storage
            .queued_jobs()
            .into_iter()
            .filter_map(|job| match job.job {
                Job::RecordTransaction(request) => Some(request),
                _ => None,
            })
            .collect::<Vec<_>>();
        assert_matches!(
            record_jobs.as_slice(),
            [request] if request.tx_type == TxType::OnHold
                && request.credits_delta_wei == -(30 * ONE as i128)
                && request.tt_amount_wei == 3 * ONE
        );

        // A retried job does not submit again.
        holds.submit_hold(record.id).await.unwrap();
        assert_eq!(chain.submitted().len(), 1);
    }

    #[tokio::test]
    async fn test_insufficient_balance_is_terminal() {
        let (storage, chain, holds) = setup();
        chain.set_balances(UserId(1), ONE, 100 * ONE);

        let record = holds
            .participate(UserId(1), CampaignId(1), 3)
            .await
            .unwrap();

        let result = holds.submit_hold(record.id).await;
        assert_matches!(
            result,
            Err(JobError::Terminal(Error::Validation(ValidationError::InsufficientBalance { .. })))
        );
        assert!(chain.submitted().is_empty());

        let record = storage.get_escrow(record.id).await.unwrap().unwrap();
        assert_eq!(record.status, EscrowStatus::Refunded);
    }

    #[tokio::test]
    async fn test_revert_refunds() {
        let (storage, chain, holds) = setup();
        chain.set_balances(UserId(1), 100 * ONE, 100 * ONE);
        chain.revert_next_submission();

        let record = holds
            .participate(UserId(1), CampaignId(1), 1)
            .await
            .unwrap();

        let result = holds.submit_hold(record.id).await;
        assert_matches!(result, Err(JobError::Terminal(Error::Chain(ChainError::Reverted(_)))));

        let record = storage.get_escrow(record.id).await.unwrap().unwrap();
        assert_eq!(record.status, EscrowStatus::Refunded);
        assert!(record.tx_hash.is_some());
    }

    #[tokio::test]
    async fn test_rpc_failure_is_retryable() {
        let (storage, chain, holds) = setup();
        chain.set_balances(UserId(1), 100 * ONE, 100 * ONE);
        let record = holds
            .participate(UserId(1), CampaignId(1), 1)
            .await
            .unwrap();
        chain.fail_next_rpc();

        let result = holds.submit_hold(record.id).await;
        assert_matches!(result, Err(JobError::Retryable(_)));

        let record = storage.get_escrow(record.id).await.unwrap().unwrap();
        assert_eq!(record.status, EscrowStatus::Held);
    }

    #[tokio::test]
    async fn test_participate_validation() {
        let (storage, _, holds) = setup();

        assert_matches!(
            holds.participate(UserId(1), CampaignId(1), 0).await,
            Err(Error::Validation(ValidationError::InvalidQuantity))
        );
        assert_matches!(
            holds.participate(UserId(1), CampaignId(9), 1).await,
            Err(Error::Validation(ValidationError::UnknownCampaign(_)))
        );
        assert_matches!(
            holds.participate(UserId(9), CampaignId(1), 1).await,
            Err(Error::Validation(ValidationError::UnknownUser(_)))
        );

        let mut closed = campaign(CampaignId(2), 10);
        closed.on_chain_campaign_id = OnChainCampaignId(2);
        closed.status = crate::domain::CampaignStatus::Closed;
        storage.add_campaign(closed);
        assert_matches!(
            holds.participate(UserId(1), CampaignId(2), 1).await,
            Err(Error::Validation(ValidationError::CampaignClosed(_)))
        );
    }
}
