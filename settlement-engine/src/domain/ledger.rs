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

use crate::domain::{ChainClient, ChainError, Error, JobError, Receipt, storage::Storage};
use chrono::{DateTime, Utc};
use derive_more::Display;
use fastrace::trace;
use log::{debug, info};
use metrics::counter;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_with::{DisplayFromStr, serde_as};
use settlement_common::domain::{
    Address, AmountError, CampaignId, CreditsWei, TokenWei, TxHash, UserId,
    amount::{DISPLAY_PLACES, TOKEN_DECIMALS, signed_to_display, to_display},
};
use sqlx::Type;
use uuid::Uuid;

/// Ledger transaction types. User ledger rows are `deposit`, `withdraw` and `spend`; escrow
/// ledger rows are `on_hold`, `release` and `refund`.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "TX_TYPE", rename_all = "snake_case")]
pub enum TxType {
    Deposit,
    Withdraw,
    Spend,
    OnHold,
    Release,
    Refund,
}

impl TxType {
    pub fn ledger(self) -> Ledger {
        match self {
            TxType::Deposit | TxType::Withdraw | TxType::Spend => Ledger::User,
            TxType::OnHold | TxType::Release | TxType::Refund => Ledger::Influencer,
        }
    }
}

/// The two canonical ledgers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ledger {
    /// Stored in `transactions`.
    User,

    /// Stored in `influencer_transactions`.
    Influencer,
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Type)]
#[sqlx(type_name = "LEDGER_STATUS", rename_all = "snake_case")]
pub enum LedgerStatus {
    Pending,
    Completed,
    Failed,
}

/// Canonical, append-only ledger row. Display amounts are rounded down to two places; the exact
/// wei values are kept alongside.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    pub id: Uuid,
    pub tx_hash: Option<TxHash>,
    pub tx_type: TxType,
    pub user_id: UserId,
    pub campaign_id: Option<CampaignId>,
    pub tt_amount: Decimal,
    pub credits_delta: Decimal,
    pub tt_amount_wei: TokenWei,
    pub credits_delta_wei: i128,
    pub block_number: Option<u64>,
    pub gas_used: Option<u128>,
    pub effective_gas_price: Option<u128>,
    pub from_address: Option<Address>,
    pub to_address: Option<Address>,
    pub status: LedgerStatus,
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    /// A `pending` entry without transaction, e.g. a withdrawal reservation.
    pub fn pending(
        tx_type: TxType,
        user_id: UserId,
        campaign_id: Option<CampaignId>,
        tt_amount_wei: TokenWei,
        credits_delta_wei: i128,
    ) -> Result<Self, Error> {
        Ok(Self {
            id: Uuid::now_v7(),
            tx_hash: None,
            tx_type,
            user_id,
            campaign_id,
            tt_amount: to_display(tt_amount_wei, TOKEN_DECIMALS, DISPLAY_PLACES)?,
            credits_delta: signed_to_display(credits_delta_wei, TOKEN_DECIMALS, DISPLAY_PLACES)?,
            tt_amount_wei,
            credits_delta_wei,
            block_number: None,
            gas_used: None,
            effective_gas_price: None,
            from_address: None,
            to_address: None,
            status: LedgerStatus::Pending,
            created_at: Utc::now(),
        })
    }

    /// A `completed` entry for the given request and its mined receipt.
    pub fn completed(request: &RecordRequest, receipt: &Receipt) -> Result<Self, Error> {
        let entry = Self::pending(
            request.tx_type,
            request.user_id,
            request.campaign_id,
            request.tt_amount_wei,
            request.credits_delta_wei,
        )?;

        Ok(Self {
            id: request.reservation_id.unwrap_or(entry.id),
            tx_hash: Some(request.tx_hash),
            block_number: Some(receipt.block_number),
            gas_used: Some(receipt.gas_used),
            effective_gas_price: Some(receipt.effective_gas_price),
            from_address: Some(receipt.from),
            to_address: receipt.to,
            status: LedgerStatus::Completed,
            ..entry
        })
    }
}

/// Signed credit delta of the given magnitude; debits are negative.
pub fn credits_delta(credits_wei: CreditsWei, debit: bool) -> Result<i128, AmountError> {
    let delta = i128::try_from(credits_wei).map_err(|_| AmountError::Overflow("credits_delta"))?;
    Ok(if debit { -delta } else { delta })
}

/// Request to record a mined transaction, carrying the exact on-chain integers.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordRequest {
    pub tx_hash: TxHash,
    pub user_id: UserId,
    pub campaign_id: Option<CampaignId>,
    pub tx_type: TxType,

    #[serde_as(as = "DisplayFromStr")]
    pub tt_amount_wei: TokenWei,

    #[serde_as(as = "DisplayFromStr")]
    pub credits_delta_wei: i128,

    /// Pending ledger entry to complete instead of inserting a new one.
    #[serde(default)]
    pub reservation_id: Option<Uuid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Recorded,
    Duplicate,
}

/// Idempotently persists canonical ledger rows for mined transactions.
#[derive(Debug, Clone)]
pub struct LedgerRecorder<S, C> {
    storage: S,
    chain: C,
}

impl<S, C> LedgerRecorder<S, C>
where
    S: Storage,
    C: ChainClient,
{
    pub fn new(storage: S, chain: C) -> Self {
        Self { storage, chain }
    }

    /// Record the given transaction once it is mined. Not yet mined transactions yield a
    /// retryable [ChainError::NotMined]; recording the same `(tx_hash, tx_type, user)` twice is a
    /// no-op.
    #[trace]
    pub async fn record(&self, request: &RecordRequest) -> Result<RecordOutcome, JobError> {
        let receipt = self
            .chain
            .get_receipt(request.tx_hash)
            .await?
            .ok_or(JobError::Retryable(ChainError::NotMined(request.tx_hash).into()))?;

        if !receipt.success {
            if let Some(id) = request.reservation_id {
                self.storage.fail_reservation(id).await?;
            }
            return Err(JobError::terminal(ChainError::Reverted(request.tx_hash)));
        }

        let entry = LedgerEntry::completed(request, &receipt).map_err(JobError::Terminal)?;

        let recorded = match request.reservation_id {
            Some(id) => self.storage.complete_reservation(id, &entry).await?,
            None => self.storage.insert_ledger_entry(&entry).await?,
        };

        if recorded {
            counter!("settlement_ledger_rows_total", "tx_type" => entry.tx_type.to_string())
                .increment(1);
            info!(
                tx_hash:% = request.tx_hash,
                tx_type:% = request.tx_type,
                user_id:% = request.user_id,
                tt_amount:% = entry.tt_amount,
                credits_delta:% = entry.credits_delta;
                "ledger row recorded"
            );

            Ok(RecordOutcome::Recorded)
        } else {
            debug!(
                tx_hash:% = request.tx_hash,
                tx_type:% = request.tx_type,
                user_id:% = request.user_id;
                "ledger row already recorded"
            );

            Ok(RecordOutcome::Duplicate)
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        domain::{
            ChainError, Error, JobError, LedgerRecorder, LedgerStatus, RecordOutcome,
            RecordRequest, TxType,
        },
        testing::{FakeChain, InMemoryStorage, user},
    };
    use assert_matches::assert_matches;
    use rust_decimal::Decimal;
    use settlement_common::domain::{CampaignId, TxHash, UserId};
    use std::str::FromStr;

    const ONE: u128 = 1_000_000_000_000_000_000;

    fn request(tx_hash: TxHash) -> RecordRequest {
        RecordRequest {
            tx_hash,
            user_id: UserId(1),
            campaign_id: Some(CampaignId(1)),
            tt_amount_wei: 3 * ONE + 5,
            credits_delta_wei: 30 * ONE as i128 + 999,
            tx_type: TxType::Release,
            reservation_id: None,
        }
    }

    #[tokio::test]
    async fn test_not_mined() {
        let storage = InMemoryStorage::default();
        let chain = FakeChain::default();
        let recorder = LedgerRecorder::new(storage, chain);

        let tx_hash = TxHash::from([1; 32]);
        let result = recorder.record(&request(tx_hash)).await;
        assert_matches!(
            result,
            Err(JobError::Retryable(Error::Chain(ChainError::NotMined(h)))) if h == tx_hash
        );
    }

    #[tokio::test]
    async fn test_record_idempotent() {
        let storage = InMemoryStorage::default();
        storage.add_user(user(UserId(1), "fan"));
        let chain = FakeChain::default();
        let tx_hash = chain.mine(true);
        let recorder = LedgerRecorder::new(storage.clone(), chain);

        let result = recorder.record(&request(tx_hash)).await;
        assert_matches!(result, Ok(RecordOutcome::Recorded));
        let result = recorder.record(&request(tx_hash)).await;
        assert_matches!(result, Ok(RecordOutcome::Duplicate));

        let entries = storage.ledger_entries();
        assert_eq!(entries.len(), 1);
        let entry = &entries[0];
        assert_eq!(entry.status, LedgerStatus::Completed);
        assert_eq!(entry.tt_amount, Decimal::from(3));
        assert_eq!(entry.credits_delta, Decimal::from(30));
        assert_eq!(entry.tt_amount_wei, 3 * ONE + 5);
        assert_eq!(entry.tx_hash, Some(tx_hash));
        assert!(entry.block_number.is_some());
    }

    #[tokio::test]
    async fn test_negative_delta_rounds_down() {
        let storage = InMemoryStorage::default();
        storage.add_user(user(UserId(1), "fan"));
        let chain = FakeChain::default();
        let tx_hash = chain.mine(true);
        let recorder = LedgerRecorder::new(storage.clone(), chain);

        let request = RecordRequest {
            tx_type: TxType::OnHold,
            credits_delta_wei: -(ONE as i128) - 1,
            ..request(tx_hash)
        };
        recorder.record(&request).await.unwrap();

        let entries = storage.ledger_entries();
        assert_eq!(entries[0].credits_delta, Decimal::from_str("-1.01").unwrap());
    }

    #[tokio::test]
    async fn test_reverted() {
        let storage = InMemoryStorage::default();
        let chain = FakeChain::default();
        let tx_hash = chain.mine(false);
        let recorder = LedgerRecorder::new(storage.clone(), chain);

        let result = recorder.record(&request(tx_hash)).await;
        assert_matches!(result, Err(JobError::Terminal(Error::Chain(ChainError::Reverted(_)))));
        assert!(storage.ledger_entries().is_empty());
    }
}
