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

use crate::domain::{Job, NewJob, storage::Storage};
use chrono::{DateTime, Utc};
use derive_more::Display;
use fastrace::trace;
use log::warn;
use serde::Serialize;
use settlement_common::domain::{
    CampaignId, CreditsWei, OnChainCampaignId, TokenWei, TxHash, UserId,
};
use sqlx::Type;
use uuid::Uuid;

/// One hold per participation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EscrowRecord {
    pub id: Uuid,
    pub user_id: UserId,
    pub campaign_id: CampaignId,
    pub on_chain_campaign_id: OnChainCampaignId,
    pub quantity: u64,
    pub tt_amount_wei: TokenWei,
    pub credit_amount_wei: CreditsWei,
    pub gas_cost_credits_wei: CreditsWei,
    pub gas_cost_tt_wei: TokenWei,
    pub status: EscrowStatus,
    pub tx_hash: Option<TxHash>,

    /// ID of the job submitting the hold.
    pub task_id: Uuid,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Serialize, Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "ESCROW_STATUS", rename_all = "snake_case")]
pub enum EscrowStatus {
    Held,
    Released,
    Refunded,
}

impl EscrowStatus {
    /// Only `held` may transition and only into one of the terminal states.
    pub fn can_transition(self, to: EscrowStatus) -> bool {
        matches!(
            (self, to),
            (EscrowStatus::Held, EscrowStatus::Released) | (EscrowStatus::Held, EscrowStatus::Refunded)
        )
    }

    pub fn is_terminal(self) -> bool {
        self != EscrowStatus::Held
    }
}

/// Fields required to open a hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewEscrow {
    pub user_id: UserId,
    pub campaign_id: CampaignId,
    pub on_chain_campaign_id: OnChainCampaignId,
    pub quantity: u64,
    pub tt_amount_wei: TokenWei,
    pub credit_amount_wei: CreditsWei,
}

/// State machine storage for escrow records.
#[derive(Debug, Clone)]
pub struct EscrowLedger<S> {
    storage: S,
}

impl<S> EscrowLedger<S>
where
    S: Storage,
{
    pub fn new(storage: S) -> Self {
        Self { storage }
    }

    /// Open a `held` record together with the job submitting the hold; both become visible
    /// atomically. When `guest_order_id` is given, the record is only opened if that guest order
    /// has no participation yet, otherwise `None` is returned.
    #[trace]
    pub async fn open(
        &self,
        escrow: NewEscrow,
        guest_order_id: Option<Uuid>,
    ) -> Result<Option<EscrowRecord>, sqlx::Error> {
        let job_id = Uuid::now_v7();
        let id = Uuid::now_v7();
        let now = Utc::now();

        let record = EscrowRecord {
            id,
            user_id: escrow.user_id,
            campaign_id: escrow.campaign_id,
            on_chain_campaign_id: escrow.on_chain_campaign_id,
            quantity: escrow.quantity,
            tt_amount_wei: escrow.tt_amount_wei,
            credit_amount_wei: escrow.credit_amount_wei,
            gas_cost_credits_wei: 0,
            gas_cost_tt_wei: 0,
            status: EscrowStatus::Held,
            tx_hash: None,
            task_id: job_id,
            created_at: now,
            updated_at: now,
        };

        let job = NewJob {
            id: job_id,
            job: Job::SubmitHold { escrow_id: id },
            run_at: now,
        };

        let opened = self
            .storage
            .open_escrow(&record, &job, guest_order_id)
            .await?;

        Ok(opened.then_some(record))
    }

    /// Transition a `held` record into the given terminal status. Returns false without changes
    /// if the record is not `held` anymore.
    #[trace]
    pub async fn finalize(
        &self,
        id: Uuid,
        status: EscrowStatus,
        tx_hash: Option<TxHash>,
    ) -> Result<bool, sqlx::Error> {
        if !EscrowStatus::Held.can_transition(status) {
            warn!(escrow_id:% = id, status:%; "cannot finalize escrow record into non-terminal status");
            return Ok(false);
        }

        let finalized = self.storage.finalize_escrow(id, status, tx_hash).await?;
        if !finalized {
            warn!(escrow_id:% = id, status:%; "escrow record already finalized");
        }

        Ok(finalized)
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        domain::{EscrowLedger, EscrowStatus, Job, NewEscrow, storage::Storage},
        testing::{InMemoryStorage, campaign, user},
    };
    use assert_matches::assert_matches;
    use settlement_common::domain::{CampaignId, OnChainCampaignId, TxHash, UserId};

    const ALL: [EscrowStatus; 3] = [
        EscrowStatus::Held,
        EscrowStatus::Released,
        EscrowStatus::Refunded,
    ];

    #[test]
    fn test_can_transition() {
        for from in ALL {
            for to in ALL {
                let expected = from == EscrowStatus::Held && to != EscrowStatus::Held;
                assert_eq!(from.can_transition(to), expected, "{from} -> {to}");
            }
        }
    }

    #[tokio::test]
    async fn test_open_and_finalize() {
        let storage = InMemoryStorage::default();
        storage.add_user(user(UserId(1), "fan"));
        storage.add_campaign(campaign(CampaignId(1), 10));
        let ledger = EscrowLedger::new(storage.clone());

        let record = ledger
            .open(
                NewEscrow {
                    user_id: UserId(1),
                    campaign_id: CampaignId(1),
                    on_chain_campaign_id: OnChainCampaignId(1),
                    quantity: 1,
                    tt_amount_wei: 1,
                    credit_amount_wei: 10,
                },
                None,
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.status, EscrowStatus::Held);
        assert!(record.tx_hash.is_none());

        let jobs = storage.queued_jobs();
        assert_matches!(
            jobs.as_slice(),
            [job] if job.id == record.task_id && job.job == Job::SubmitHold { escrow_id: record.id }
        );

        let tx_hash = Some(TxHash::from([1; 32]));
        assert!(ledger.finalize(record.id, EscrowStatus::Released, tx_hash).await.unwrap());

        // Never both, never regresses.
        assert!(!ledger.finalize(record.id, EscrowStatus::Refunded, tx_hash).await.unwrap());
        assert!(!ledger.finalize(record.id, EscrowStatus::Held, None).await.unwrap());
        assert!(!ledger.finalize(record.id, EscrowStatus::Released, tx_hash).await.unwrap());

        let record = storage.get_escrow(record.id).await.unwrap().unwrap();
        assert_eq!(record.status, EscrowStatus::Released);
        assert_eq!(record.tx_hash, tx_hash);
    }
}
