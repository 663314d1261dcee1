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
    ChainClient, ChainError, Config, ContractCall, ContractEvent, ConversionOracle, Error,
    FiatOnrampReconciler, GuestOrder, HoldCoordinator, Job, JobError, NewJob, OrderStatus,
    RecordRequest, TxParams, TxType, credits_delta, storage::Storage,
};
use fastrace::trace;
use log::{debug, error, info, warn};
use settlement_common::domain::{TxHash, UserId, amount::token_wei_to_credits_wei};
use std::sync::Arc;
use uuid::Uuid;

/// Credits claimed guest orders on chain and opens their participation.
#[derive(Debug, Clone)]
pub struct GuestCreditor<S, C> {
    storage: S,
    chain: C,
    oracle: ConversionOracle<S, C>,
    reconciler: FiatOnrampReconciler<S>,
    holds: HoldCoordinator<S, C>,
    config: Arc<Config>,
}

impl<S, C> GuestCreditor<S, C>
where
    S: Storage,
    C: ChainClient,
{
    pub fn new(storage: S, chain: C, config: Arc<Config>) -> Self {
        Self {
            oracle: ConversionOracle::new(storage.clone(), chain.clone()),
            reconciler: FiatOnrampReconciler::new(storage.clone(), config.clone()),
            holds: HoldCoordinator::new(storage.clone(), chain.clone(), config.clone()),
            storage,
            chain,
            config,
        }
    }

    /// Credit the claimed guest order. Retryable until both sides agree the order is confirmed;
    /// the order is marked as submitted before the deposit is submitted, hence an interrupted
    /// submission is never repeated.
    #[trace]
    pub async fn credit(&self, guest_order_id: Uuid) -> Result<(), JobError> {
        let guest_order = self
            .storage
            .get_guest_order(guest_order_id)
            .await?
            .ok_or_else(|| {
                JobError::terminal(Error::Mismatch(format!("unknown guest order {guest_order_id}")))
            })?;

        let user_id = match (guest_order.status, guest_order.user_id) {
            (OrderStatus::Claimed, Some(user_id)) => user_id,
            (status, _) => {
                return Err(JobError::terminal(Error::Mismatch(format!(
                    "guest order {guest_order_id} is {status}, not claimed"
                ))));
            }
        };

        let tx_hash = match (guest_order.credit_tx_hash, guest_order.credit_submitted_at) {
            (Some(tx_hash), _) => {
                debug!(guest_order_id:%, tx_hash:%; "resuming guest credit");
                tx_hash
            }

            (None, Some(submitted_at)) => {
                error!(
                    guest_order_id:%,
                    submitted_at:%;
                    "guest credit submitted without transaction hash, manual reconciliation required"
                );
                return Err(JobError::terminal(Error::Mismatch(format!(
                    "guest order {guest_order_id} credit interrupted"
                ))));
            }

            (None, None) => match self.submit(&guest_order, user_id).await? {
                Some(tx_hash) => tx_hash,
                None => return Ok(()),
            },
        };

        let receipt = match self
            .chain
            .wait_receipt(tx_hash, self.config.receipt_timeout)
            .await
        {
            Ok(receipt) if receipt.success => receipt,

            Ok(_) | Err(ChainError::Reverted(_)) => {
                error!(guest_order_id:%, tx_hash:%; "guest credit reverted");
                return Err(JobError::terminal(ChainError::Reverted(tx_hash)));
            }

            Err(error) => return Err(JobError::retryable(error)),
        };

        let (tt_amount_wei, credits_wei) = self
            .chain
            .decode_events(&receipt)
            .await?
            .into_iter()
            .find_map(|event| match event {
                ContractEvent::Deposited {
                    user,
                    tt_amount_wei,
                    credits_wei,
                } if user == user_id => Some((tt_amount_wei, credits_wei)),
                _ => None,
            })
            .ok_or_else(|| {
                JobError::terminal(Error::Mismatch(format!("no deposit event in {tx_hash}")))
            })?;

        let job = NewJob::now(Job::RecordTransaction(RecordRequest {
            tx_hash,
            user_id,
            campaign_id: None,
            tx_type: TxType::Deposit,
            tt_amount_wei,
            credits_delta_wei: credits_delta(credits_wei, false).map_err(JobError::terminal)?,
            reservation_id: None,
        }));
        self.storage.enqueue_job(&job).await?;

        info!(guest_order_id:%, user_id:%, tx_hash:%, credits_wei; "guest order credited");

        self.open_participation(&guest_order, user_id).await
    }

    async fn submit(
        &self,
        guest_order: &GuestOrder,
        user_id: UserId,
    ) -> Result<Option<TxHash>, JobError> {
        let wert_order = self
            .reconciler
            .find_wert_order(guest_order)
            .await
            .map_err(JobError::Retryable)?
            .ok_or_else(|| {
                JobError::Retryable(Error::Mismatch(format!(
                    "no provider order for guest order {}",
                    guest_order.id
                )))
            })?;

        if !self
            .reconciler
            .agreed(guest_order, &wert_order)
            .map_err(JobError::Terminal)?
        {
            return Err(JobError::Retryable(Error::Mismatch(format!(
                "guest order {} not yet confirmed by provider",
                guest_order.id
            ))));
        }

        let rate = self.oracle.current().await.map_err(JobError::Retryable)?;
        let tt_amount_wei = guest_order.amount_wei;
        let credits_wei =
            token_wei_to_credits_wei(tt_amount_wei, rate).map_err(JobError::terminal)?;

        if !self.storage.mark_credit_submitted(guest_order.id).await? {
            debug!(guest_order_id:% = guest_order.id; "guest credit already submitted");
            return Ok(None);
        }

        let call = ContractCall::Deposit {
            user: user_id,
            tt_amount_wei,
            credits_wei,
        };
        let params = TxParams {
            from: self.config.owner_address,
            nonce: None,
            gas_limit: self.config.gas.deposit_limit,
        };

        let tx_hash = self.chain.submit(&call, &params).await.map_err(|error| {
            error!(
                guest_order_id:% = guest_order.id,
                error:% = error;
                "cannot submit guest credit, manual reconciliation required"
            );
            JobError::terminal(error)
        })?;

        self.storage
            .set_credit_tx_hash(guest_order.id, tx_hash)
            .await?;

        Ok(Some(tx_hash))
    }

    async fn open_participation(
        &self,
        guest_order: &GuestOrder,
        user_id: UserId,
    ) -> Result<(), JobError> {
        let Some(campaign_id) = guest_order.campaign_id else {
            return Ok(());
        };
        if guest_order.entries == 0 || guest_order.participation_escrow_id.is_some() {
            return Ok(());
        }

        match self
            .holds
            .open_participation(user_id, campaign_id, guest_order.entries, Some(guest_order.id))
            .await
        {
            Ok(Some(record)) => {
                info!(
                    guest_order_id:% = guest_order.id,
                    escrow_id:% = record.id;
                    "guest participation opened"
                );
                Ok(())
            }

            Ok(None) => Ok(()),

            Err(Error::Validation(error)) => {
                warn!(
                    guest_order_id:% = guest_order.id,
                    campaign_id:%,
                    error:%;
                    "cannot open guest participation"
                );
                Ok(())
            }

            Err(error) => Err(JobError::Retryable(error)),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        domain::{
            ContractCall, EscrowStatus, GuestCreditor, GuestClaimService, Job, JobError,
            NewGuestOrder, TxType, storage::Storage,
        },
        testing::{FakeChain, InMemoryStorage, campaign, config, reconciler},
    };
    use assert_matches::assert_matches;
    use serde_json::json;
    use settlement_common::domain::CampaignId;
    use std::{sync::Arc, time::Duration};
    use uuid::Uuid;

    const ONE: u128 = 1_000_000_000_000_000_000;

    /// A claimed guest order for 25 tokens with two entries in campaign 1.
    async fn claimed_guest_order(storage: &InMemoryStorage, confirm: bool) -> Uuid {
        storage.add_campaign(campaign(CampaignId(1), 10));

        let reconciler = reconciler(storage.clone(), config());
        let guest_order = reconciler
            .create_guest_order(NewGuestOrder {
                click_id: "click-1".to_string(),
                email: "guest@example.com".to_string(),
                amount_wei: 25 * ONE,
                campaign_id: Some(CampaignId(1)),
                entries: 2,
            })
            .await
            .unwrap();

        let body = json!({
            "type": "order_complete",
            "click_id": "click-1",
            "order": { "id": "order-1", "base": "TT", "base_amount": "25" }
        });
        reconciler
            .handle_webhook(&serde_json::to_vec(&body).unwrap(), None)
            .await
            .unwrap();

        let claims = GuestClaimService::new(storage.clone(), Arc::new(config()));
        let token = claims.tokenizer().issue(
            "click-1",
            "guest@example.com",
            Duration::from_secs(60),
        );
        claims.claim(&token, "guest", Some("hunter2")).await.unwrap();

        if !confirm {
            storage.set_wert_order_base_amount("click-1", None);
        }

        guest_order.id
    }

    #[tokio::test]
    async fn test_credit_and_participate() {
        let storage = InMemoryStorage::default();
        let guest_order_id = claimed_guest_order(&storage, true).await;
        let chain = FakeChain::default();
        chain.set_conversion_rate(10);
        let creditor = GuestCreditor::new(storage.clone(), chain.clone(), Arc::new(config()));

        creditor.credit(guest_order_id).await.unwrap();
        // A retry neither deposits nor participates twice.
        creditor.credit(guest_order_id).await.unwrap();

        let deposits = chain
            .submitted()
            .into_iter()
            .filter(|call| matches!(call, ContractCall::Deposit { .. }))
            .collect::<Vec<_>>();
        assert_matches!(
            deposits.as_slice(),
            [ContractCall::Deposit { tt_amount_wei, credits_wei, .. }]
                if *tt_amount_wei == 25 * ONE && *credits_wei == 250 * ONE
        );

        let deposit_records = storage
            .queued_jobs()
            .into_iter()
            .filter(|job| {
                matches!(&job.job, Job::RecordTransaction(request) if request.tx_type == TxType::Deposit)
            })
            .count();
        assert!(deposit_records >= 1);

        let records = storage.escrow_records();
        assert_matches!(
            records.as_slice(),
            [record] if record.quantity == 2 && record.status == EscrowStatus::Held
        );

        let guest_order = storage
            .get_guest_order(guest_order_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(guest_order.participation_escrow_id, Some(records[0].id));
        assert!(guest_order.credit_tx_hash.is_some());
    }

    #[tokio::test]
    async fn test_retry_until_confirmed() {
        let storage = InMemoryStorage::default();
        let guest_order_id = claimed_guest_order(&storage, false).await;
        let chain = FakeChain::default();
        chain.set_conversion_rate(10);
        let creditor = GuestCreditor::new(storage.clone(), chain.clone(), Arc::new(config()));

        assert_matches!(creditor.credit(guest_order_id).await, Err(JobError::Retryable(_)));
        assert!(chain.submitted().is_empty());

        let guest_order = storage
            .get_guest_order(guest_order_id)
            .await
            .unwrap()
            .unwrap();
        assert!(guest_order.credit_submitted_at.is_none());
    }

    #[tokio::test]
    async fn test_interrupted_submission_fails_closed() {
        let storage = InMemoryStorage::default();
        let guest_order_id = claimed_guest_order(&storage, true).await;
        let chain = FakeChain::default();
        chain.set_conversion_rate(10);
        let creditor = GuestCreditor::new(storage.clone(), chain.clone(), Arc::new(config()));

        chain.fail_submission(1);
        assert_matches!(creditor.credit(guest_order_id).await, Err(JobError::Terminal(_)));
        assert_matches!(creditor.credit(guest_order_id).await, Err(JobError::Terminal(_)));
        assert!(chain.submitted().is_empty());
    }
}
