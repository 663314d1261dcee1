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
    Campaign, EscrowRecord, EscrowStatus, GuestOrder, JobRecord, LedgerEntry, NewJob, NewUser,
    OrderStatus, Reservation, Settlement, SettlementOutcome, TxType, User, WertOrder,
    WertOrderUpdate,
};
use chrono::{DateTime, NaiveDate, Utc};
use settlement_common::domain::{
    CampaignId, ConversionRate, CreditsWei, TokenWei, TxHash, UserId,
};
use std::time::Duration;
use uuid::Uuid;

/// Storage abstraction. Methods taking a [NewJob] enqueue it in the same transaction as the state
/// change, hence the job becomes visible if and only if the change is committed.
#[trait_variant::make(Send)]
pub trait Storage
where
    Self: Clone + Send + Sync + 'static,
{
    /// Get the stored conversion rate, if any.
    async fn get_conversion_rate(&self) -> Result<Option<ConversionRate>, sqlx::Error>;

    /// Replace the stored conversion rate.
    async fn save_conversion_rate(&self, rate: ConversionRate) -> Result<(), sqlx::Error>;

    async fn get_campaign(&self, id: CampaignId) -> Result<Option<Campaign>, sqlx::Error>;

    /// Close the given campaign if open, store the settlement outcome and enqueue the job.
    async fn close_campaign(
        &self,
        id: CampaignId,
        outcome: SettlementOutcome,
        job: &NewJob,
    ) -> Result<bool, sqlx::Error>;

    /// Get open campaigns with a deadline at or before the given time.
    async fn expired_open_campaigns(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Campaign>, sqlx::Error>;

    async fn get_user(&self, id: UserId) -> Result<Option<User>, sqlx::Error>;

    async fn find_user_by_username(&self, username: &str) -> Result<Option<User>, sqlx::Error>;

    /// Create a user; `None` if the username is taken.
    async fn create_user(&self, user: &NewUser) -> Result<Option<User>, sqlx::Error>;

    async fn set_user_password(&self, id: UserId, password_hash: &str) -> Result<(), sqlx::Error>;

    /// Insert the given `held` record, increase the campaign's sold quantity and enqueue the job.
    /// With a guest order ID the record is only inserted if that guest order has no participation
    /// yet, which is then set to the record; returns false otherwise.
    async fn open_escrow(
        &self,
        record: &EscrowRecord,
        job: &NewJob,
        guest_order_id: Option<Uuid>,
    ) -> Result<bool, sqlx::Error>;

    async fn get_escrow(&self, id: Uuid) -> Result<Option<EscrowRecord>, sqlx::Error>;

    /// Store the transaction hash of the submitted hold.
    async fn set_escrow_submission(&self, id: Uuid, tx_hash: TxHash) -> Result<(), sqlx::Error>;

    /// Store the gas cost of the mined hold and enqueue the ledger job.
    async fn record_hold_mined(
        &self,
        id: Uuid,
        gas_cost_tt_wei: TokenWei,
        gas_cost_credits_wei: CreditsWei,
        job: &NewJob,
    ) -> Result<(), sqlx::Error>;

    /// Transition a `held` record into the given status; false if it is not `held`.
    async fn finalize_escrow(
        &self,
        id: Uuid,
        status: EscrowStatus,
        tx_hash: Option<TxHash>,
    ) -> Result<bool, sqlx::Error>;

    /// Insert a ledger row into the ledger of its transaction type; false if a row for the same
    /// `(tx_hash, tx_type, user_id)` exists.
    async fn insert_ledger_entry(&self, entry: &LedgerEntry) -> Result<bool, sqlx::Error>;

    /// Get the ledger row with the given ID from the ledger of the given transaction type.
    async fn get_ledger_entry(
        &self,
        tx_type: TxType,
        id: Uuid,
    ) -> Result<Option<LedgerEntry>, sqlx::Error>;

    /// Complete the `pending` reservation with the given ID with the data of the given entry;
    /// false if it is not `pending`.
    async fn complete_reservation(&self, id: Uuid, entry: &LedgerEntry)
    -> Result<bool, sqlx::Error>;

    /// Mark the `pending` reservation with the given ID as `failed`.
    async fn fail_reservation(&self, id: Uuid) -> Result<(), sqlx::Error>;

    async fn set_reservation_tx_hash(&self, id: Uuid, tx_hash: TxHash) -> Result<(), sqlx::Error>;

    /// Serialized per user: reject unless the user holds a verified session, sum the `pending`
    /// and `completed` withdrawals created on the given day, reject if the entry exceeds the
    /// limit, otherwise insert the entry, clear the user's verification flags and enqueue the job.
    async fn reserve_withdrawal(
        &self,
        entry: &LedgerEntry,
        day: NaiveDate,
        limit: CreditsWei,
        job: &NewJob,
    ) -> Result<Reservation, sqlx::Error>;

    /// Insert a guest order together with its provider mirror; false if the click ID exists.
    async fn insert_guest_order(
        &self,
        guest_order: &GuestOrder,
        wert_order: &WertOrder,
    ) -> Result<bool, sqlx::Error>;

    async fn get_guest_order(&self, id: Uuid) -> Result<Option<GuestOrder>, sqlx::Error>;

    async fn get_guest_order_by_ref(&self, reference: &str)
    -> Result<Option<GuestOrder>, sqlx::Error>;

    async fn get_guest_order_by_click_id(
        &self,
        click_id: &str,
    ) -> Result<Option<GuestOrder>, sqlx::Error>;

    /// Compare-and-set the status; the provider order and transaction IDs are only overwritten
    /// when given.
    async fn advance_guest_order_status(
        &self,
        id: Uuid,
        from: OrderStatus,
        to: OrderStatus,
        order_id: Option<&str>,
        tx_hash: Option<&str>,
    ) -> Result<bool, sqlx::Error>;

    /// Set `notified_at` of a confirmed, not yet notified guest order and enqueue the job; false
    /// if already notified.
    async fn mark_guest_order_notified(&self, id: Uuid, job: &NewJob)
    -> Result<bool, sqlx::Error>;

    async fn confirmed_unnotified_guest_orders(
        &self,
        limit: usize,
    ) -> Result<Vec<GuestOrder>, sqlx::Error>;

    /// Transition a confirmed guest order to `claimed` for the given user and enqueue the job;
    /// false if not confirmed.
    async fn claim_guest_order(
        &self,
        id: Uuid,
        user_id: UserId,
        job: &NewJob,
    ) -> Result<bool, sqlx::Error>;

    /// Set `credit_submitted_at` unless already set; false if already set.
    async fn mark_credit_submitted(&self, id: Uuid) -> Result<bool, sqlx::Error>;

    async fn set_credit_tx_hash(&self, id: Uuid, tx_hash: TxHash) -> Result<(), sqlx::Error>;

    /// Merge into the provider mirror matching the order ID, else the click ID: given fields
    /// overwrite, missing ones are kept. Without a match a new mirror is inserted if a click ID is
    /// given, otherwise None is returned. The status is not touched.
    async fn upsert_wert_order(
        &self,
        update: &WertOrderUpdate,
    ) -> Result<Option<WertOrder>, sqlx::Error>;

    async fn get_wert_order_by_ref(&self, reference: &str)
    -> Result<Option<WertOrder>, sqlx::Error>;

    async fn get_wert_order_by_click_id(
        &self,
        click_id: &str,
    ) -> Result<Option<WertOrder>, sqlx::Error>;

    async fn advance_wert_order_status(
        &self,
        id: Uuid,
        from: OrderStatus,
        to: OrderStatus,
    ) -> Result<bool, sqlx::Error>;

    /// Get all per buyer settlement records of the given campaign.
    async fn settlements(&self, campaign_id: CampaignId) -> Result<Vec<Settlement>, sqlx::Error>;

    /// Record the given buyers as `submitted` in the batch with the given transaction hash.
    async fn insert_settlements(
        &self,
        campaign_id: CampaignId,
        outcome: SettlementOutcome,
        buyers: &[UserId],
        tx_hash: TxHash,
    ) -> Result<(), sqlx::Error>;

    /// Forget the `submitted` batch with the given transaction hash.
    async fn delete_settlements(
        &self,
        campaign_id: CampaignId,
        tx_hash: TxHash,
    ) -> Result<(), sqlx::Error>;

    /// Mark the batch with the given transaction hash `settled`, finalize the `held` records of
    /// the given buyers and enqueue the given jobs.
    async fn complete_settlement_batch(
        &self,
        campaign_id: CampaignId,
        tx_hash: TxHash,
        status: EscrowStatus,
        buyers: &[UserId],
        jobs: &[NewJob],
    ) -> Result<(), sqlx::Error>;

    async fn enqueue_job(&self, job: &NewJob) -> Result<(), sqlx::Error>;

    /// Lease the next due job: queued jobs with `run_at` in the past or running jobs with an
    /// expired lease. Increments the attempts.
    async fn claim_next_job(
        &self,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Option<JobRecord>, sqlx::Error>;

    async fn complete_job(&self, id: Uuid) -> Result<(), sqlx::Error>;

    /// Requeue the job to run at the given time.
    async fn retry_job(
        &self,
        id: Uuid,
        run_at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), sqlx::Error>;

    async fn fail_job(&self, id: Uuid, error: &str) -> Result<(), sqlx::Error>;
}
