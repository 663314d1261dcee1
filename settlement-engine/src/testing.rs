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

//! In-memory test doubles for storage, chain and mail.

use crate::domain::{
    Balances, Campaign, CampaignStatus, ChainClient, ChainError, Config, ContractCall,
    ContractEvent, EscrowRecord, EscrowStatus, FiatOnrampReconciler, GasConfig, GuestOrder,
    JobRecord, JobStatus, LedgerEntry, LedgerStatus, Mail, Mailer, NewJob, NewUser, OrderStatus,
    Receipt, Reservation, RetryConfig, RetryPolicy, Settlement, SettlementOutcome,
    SettlementStatus, TxParams, TxType, User, WertOrder, WertOrderUpdate, storage::Storage,
};
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use secrecy::SecretString;
use settlement_common::{
    domain::{
        Address, CampaignId, ConversionRate, CreditsWei, OnChainCampaignId, TokenWei, TxHash,
        UserId,
    },
    error::BoxError,
};
use std::{
    collections::{BTreeMap, HashMap},
    num::NonZeroUsize,
    sync::Arc,
    time::Duration,
};
use uuid::Uuid;

const ONE: u128 = 1_000_000_000_000_000_000;

const GAS_USED: u128 = 21_000;
const GAS_PRICE: u128 = 1_000_000_000;

/// A user with an `example.com` email and without password.
pub fn user(id: UserId, username: &str) -> User {
    User {
        id,
        username: username.to_owned(),
        email: format!("{username}@example.com"),
        password_hash: None,
        email_verified: false,
        phone_verified: false,
    }
}

/// An open campaign with the same on-chain ID, a goal of 10 and a deadline tomorrow.
pub fn campaign(id: CampaignId, unit_price_credits: u128) -> Campaign {
    Campaign {
        id,
        influencer_id: UserId(0),
        on_chain_campaign_id: OnChainCampaignId(id.0 as u64),
        unit_price_credits_wei: unit_price_credits * ONE,
        goal_quantity: 10,
        sold_quantity: 0,
        deadline: Utc::now() + chrono::Duration::days(1),
        refund_on_deadline: false,
        status: CampaignStatus::Open,
        settlement_policy: None,
    }
}

pub fn config() -> Config {
    let policy = RetryPolicy {
        max_attempts: 5,
        backoff: Duration::from_secs(1),
    };

    Config {
        owner_address: Address::from([0xaa; 20]),
        batch_size: NonZeroUsize::new(50).unwrap_or(NonZeroUsize::MIN),
        gas: GasConfig {
            hold_limit: 200_000,
            batch_limit: 2_000_000,
            withdraw_limit: 150_000,
            deposit_limit: 150_000,
        },
        receipt_timeout: Duration::from_secs(1),
        daily_withdrawal_limit_fiat: Decimal::from(1_000),
        amount_tolerance: Decimal::new(1, 2),
        claim_token_secret: SecretString::from("secret"),
        claim_token_ttl: Duration::from_secs(24 * 60 * 60),
        claim_credit_delay: Duration::from_secs(30),
        claim_base_url: "https://example.com/claim".to_string(),
        webhook_secret: None,
        retry: RetryConfig {
            default: policy,
            ledger_recorder: RetryPolicy {
                max_attempts: 10,
                ..policy
            },
            guest_credit: RetryPolicy {
                max_attempts: 20,
                ..policy
            },
        },
    }
}

pub fn reconciler(storage: InMemoryStorage, config: Config) -> FiatOnrampReconciler<InMemoryStorage> {
    FiatOnrampReconciler::new(storage, Arc::new(config))
}

#[derive(Debug, Clone)]
struct StoredJob {
    job: NewJob,
    status: JobStatus,
    attempts: u32,
    locked_until: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

#[derive(Debug, Default)]
struct State {
    rate: Option<ConversionRate>,
    users: BTreeMap<UserId, User>,
    campaigns: BTreeMap<CampaignId, Campaign>,
    escrows: Vec<EscrowRecord>,
    ledger: Vec<LedgerEntry>,
    guest_orders: Vec<GuestOrder>,
    wert_orders: Vec<WertOrder>,
    settlements: Vec<Settlement>,
    jobs: Vec<StoredJob>,
}

impl State {
    fn enqueue(&mut self, job: &NewJob) {
        self.jobs.push(StoredJob {
            job: job.clone(),
            status: JobStatus::Queued,
            attempts: 0,
            locked_until: None,
            last_error: None,
        });
    }

    fn guest_order_mut(&mut self, id: Uuid) -> Option<&mut GuestOrder> {
        self.guest_orders.iter_mut().find(|g| g.id == id)
    }

    fn ledger_entry_mut(&mut self, id: Uuid) -> Option<&mut LedgerEntry> {
        self.ledger.iter_mut().find(|e| e.id == id)
    }

    fn job_mut(&mut self, id: Uuid) -> Option<&mut StoredJob> {
        self.jobs.iter_mut().find(|j| j.job.id == id)
    }
}

/// [Storage] keeping everything in memory behind one lock, hence every method is atomic.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStorage {
    state: Arc<Mutex<State>>,
}

impl InMemoryStorage {
    pub fn add_user(&self, user: User) {
        self.state.lock().users.insert(user.id, user);
    }

    /// Mark a completed one-time email verification for the user.
    pub fn verify_user(&self, id: UserId) {
        if let Some(user) = self.state.lock().users.get_mut(&id) {
            user.email_verified = true;
        }
    }

    pub fn add_campaign(&self, campaign: Campaign) {
        self.state.lock().campaigns.insert(campaign.id, campaign);
    }

    /// All jobs not yet completed or failed, in enqueue order.
    pub fn queued_jobs(&self) -> Vec<NewJob> {
        self.state
            .lock()
            .jobs
            .iter()
            .filter(|j| matches!(j.status, JobStatus::Queued | JobStatus::Running))
            .map(|j| j.job.clone())
            .collect()
    }

    pub fn job_status(&self, id: Uuid) -> Option<(JobStatus, u32, Option<String>)> {
        self.state
            .lock()
            .jobs
            .iter()
            .find(|j| j.job.id == id)
            .map(|j| (j.status, j.attempts, j.last_error.clone()))
    }

    pub fn job_run_at(&self, id: Uuid) -> Option<DateTime<Utc>> {
        self.state.lock().job_mut(id).map(|j| j.job.run_at)
    }

    /// Move the given queued job's run time to now.
    pub fn make_due(&self, id: Uuid) {
        if let Some(job) = self.state.lock().job_mut(id) {
            job.job.run_at = Utc::now();
        }
    }

    pub fn clear_jobs(&self) {
        self.state.lock().jobs.clear();
    }

    /// Rows of both ledgers in insertion order.
    pub fn ledger_entries(&self) -> Vec<LedgerEntry> {
        self.state.lock().ledger.clone()
    }

    pub fn escrow_records(&self) -> Vec<EscrowRecord> {
        self.state.lock().escrows.clone()
    }

    pub fn set_wert_order_base_amount(&self, click_id: &str, base_amount: Option<Decimal>) {
        let mut state = self.state.lock();
        if let Some(wert_order) = state.wert_orders.iter_mut().find(|w| w.click_id == click_id) {
            wert_order.base_amount = base_amount;
        }
    }
}

impl Storage for InMemoryStorage {
    async fn get_conversion_rate(&self) -> Result<Option<ConversionRate>, sqlx::Error> {
        Ok(self.state.lock().rate)
    }

    async fn save_conversion_rate(&self, rate: ConversionRate) -> Result<(), sqlx::Error> {
        self.state.lock().rate = Some(rate);
        Ok(())
    }

    async fn get_campaign(&self, id: CampaignId) -> Result<Option<Campaign>, sqlx::Error> {
        Ok(self.state.lock().campaigns.get(&id).cloned())
    }

    async fn close_campaign(
        &self,
        id: CampaignId,
        outcome: SettlementOutcome,
        job: &NewJob,
    ) -> Result<bool, sqlx::Error> {
        let mut state = self.state.lock();

        let Some(campaign) = state
            .campaigns
            .get_mut(&id)
            .filter(|c| c.status == CampaignStatus::Open)
        else {
            return Ok(false);
        };
        campaign.status = CampaignStatus::Closed;
        campaign.settlement_policy = Some(outcome);
        state.enqueue(job);

        Ok(true)
    }

    async fn expired_open_campaigns(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Campaign>, sqlx::Error> {
        Ok(self
            .state
            .lock()
            .campaigns
            .values()
            .filter(|c| c.status == CampaignStatus::Open && c.deadline <= now)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn get_user(&self, id: UserId) -> Result<Option<User>, sqlx::Error> {
        Ok(self.state.lock().users.get(&id).cloned())
    }

    async fn find_user_by_username(&self, username: &str) -> Result<Option<User>, sqlx::Error> {
        Ok(self
            .state
            .lock()
            .users
            .values()
            .find(|u| u.username == username)
            .cloned())
    }

    async fn create_user(&self, new_user: &NewUser) -> Result<Option<User>, sqlx::Error> {
        let mut state = self.state.lock();

        if state.users.values().any(|u| u.username == new_user.username) {
            return Ok(None);
        }

        let id = state
            .users
            .keys()
            .next_back()
            .map(|id| UserId(id.0 + 1))
            .unwrap_or(UserId(1));
        let user = User {
            id,
            username: new_user.username.clone(),
            email: new_user.email.clone(),
            password_hash: new_user.password_hash.clone(),
            email_verified: false,
            phone_verified: false,
        };
        state.users.insert(id, user.clone());

        Ok(Some(user))
    }

    async fn set_user_password(&self, id: UserId, password_hash: &str) -> Result<(), sqlx::Error> {
        if let Some(user) = self.state.lock().users.get_mut(&id) {
            user.password_hash = Some(password_hash.to_owned());
        }
        Ok(())
    }

    async fn open_escrow(
        &self,
        record: &EscrowRecord,
        job: &NewJob,
        guest_order_id: Option<Uuid>,
    ) -> Result<bool, sqlx::Error> {
        let mut state = self.state.lock();

        if let Some(guest_order_id) = guest_order_id {
            match state.guest_order_mut(guest_order_id) {
                Some(guest_order) if guest_order.participation_escrow_id.is_none() => {
                    guest_order.participation_escrow_id = Some(record.id);
                }
                _ => return Ok(false),
            }
        }

        if let Some(campaign) = state.campaigns.get_mut(&record.campaign_id) {
            campaign.sold_quantity += record.quantity;
        }
        state.escrows.push(record.clone());
        state.enqueue(job);

        Ok(true)
    }

    async fn get_escrow(&self, id: Uuid) -> Result<Option<EscrowRecord>, sqlx::Error> {
        Ok(self
            .state
            .lock()
            .escrows
            .iter()
            .find(|r| r.id == id)
            .cloned())
    }

    async fn set_escrow_submission(&self, id: Uuid, tx_hash: TxHash) -> Result<(), sqlx::Error> {
        if let Some(record) = self.state.lock().escrows.iter_mut().find(|r| r.id == id) {
            record.tx_hash = Some(tx_hash);
            record.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn record_hold_mined(
        &self,
        id: Uuid,
        gas_cost_tt_wei: TokenWei,
        gas_cost_credits_wei: CreditsWei,
        job: &NewJob,
    ) -> Result<(), sqlx::Error> {
        let mut state = self.state.lock();
        if let Some(record) = state.escrows.iter_mut().find(|r| r.id == id) {
            record.gas_cost_tt_wei = gas_cost_tt_wei;
            record.gas_cost_credits_wei = gas_cost_credits_wei;
            record.updated_at = Utc::now();
        }
        state.enqueue(job);
        Ok(())
    }

    async fn finalize_escrow(
        &self,
        id: Uuid,
        status: EscrowStatus,
        tx_hash: Option<TxHash>,
    ) -> Result<bool, sqlx::Error> {
        let mut state = self.state.lock();

        let Some(record) = state
            .escrows
            .iter_mut()
            .find(|r| r.id == id && r.status == EscrowStatus::Held)
        else {
            return Ok(false);
        };
        record.status = status;
        record.tx_hash = tx_hash.or(record.tx_hash);
        record.updated_at = Utc::now();

        Ok(true)
    }

    async fn insert_ledger_entry(&self, entry: &LedgerEntry) -> Result<bool, sqlx::Error> {
        let mut state = self.state.lock();

        let exists = state.ledger.iter().any(|e| {
            e.tx_hash.is_some()
                && e.tx_hash == entry.tx_hash
                && e.tx_type == entry.tx_type
                && e.user_id == entry.user_id
        });
        if exists {
            return Ok(false);
        }

        state.ledger.push(entry.clone());
        Ok(true)
    }

    async fn get_ledger_entry(
        &self,
        tx_type: TxType,
        id: Uuid,
    ) -> Result<Option<LedgerEntry>, sqlx::Error> {
        Ok(self
            .state
            .lock()
            .ledger
            .iter()
            .find(|e| e.id == id && e.tx_type.ledger() == tx_type.ledger())
            .cloned())
    }

    async fn complete_reservation(
        &self,
        id: Uuid,
        entry: &LedgerEntry,
    ) -> Result<bool, sqlx::Error> {
        let mut state = self.state.lock();

        let Some(reservation) = state
            .ledger_entry_mut(id)
            .filter(|e| e.status == LedgerStatus::Pending)
        else {
            return Ok(false);
        };
        *reservation = LedgerEntry {
            id,
            created_at: reservation.created_at,
            ..entry.clone()
        };

        Ok(true)
    }

    async fn fail_reservation(&self, id: Uuid) -> Result<(), sqlx::Error> {
        let mut state = self.state.lock();
        if let Some(entry) = state
            .ledger_entry_mut(id)
            .filter(|e| e.status == LedgerStatus::Pending)
        {
            entry.status = LedgerStatus::Failed;
        }
        Ok(())
    }

    async fn set_reservation_tx_hash(&self, id: Uuid, tx_hash: TxHash) -> Result<(), sqlx::Error> {
        if let Some(entry) = self.state.lock().ledger_entry_mut(id) {
            entry.tx_hash = Some(tx_hash);
        }
        Ok(())
    }

    async fn reserve_withdrawal(
        &self,
        entry: &LedgerEntry,
        day: NaiveDate,
        limit: CreditsWei,
        job: &NewJob,
    ) -> Result<Reservation, sqlx::Error> {
        let mut state = self.state.lock();

        let user_id = entry.user_id;
        match state.users.get(&user_id) {
            None => return Ok(Reservation::UnknownUser),
            Some(user) if !user.email_verified && !user.phone_verified => {
                return Ok(Reservation::NotVerified);
            }
            Some(_) => {}
        }

        let used = state
            .ledger
            .iter()
            .filter(|e| {
                e.tx_type == TxType::Withdraw
                    && e.user_id == user_id
                    && e.status != LedgerStatus::Failed
                    && e.created_at.date_naive() == day
            })
            .map(|e| e.credits_delta_wei.unsigned_abs())
            .sum::<u128>();

        let requested = entry.credits_delta_wei.unsigned_abs();
        if used.saturating_add(requested) > limit {
            return Ok(Reservation::Exceeded { used });
        }

        if let Some(user) = state.users.get_mut(&user_id) {
            user.email_verified = false;
            user.phone_verified = false;
        }
        state.ledger.push(entry.clone());
        state.enqueue(job);

        Ok(Reservation::Reserved)
    }

    async fn insert_guest_order(
        &self,
        guest_order: &GuestOrder,
        wert_order: &WertOrder,
    ) -> Result<bool, sqlx::Error> {
        let mut state = self.state.lock();

        if state
            .guest_orders
            .iter()
            .any(|g| g.click_id == guest_order.click_id || g.reference == guest_order.reference)
        {
            return Ok(false);
        }

        state.guest_orders.push(guest_order.clone());
        if !state
            .wert_orders
            .iter()
            .any(|w| w.click_id == wert_order.click_id)
        {
            state.wert_orders.push(wert_order.clone());
        }

        Ok(true)
    }

    async fn get_guest_order(&self, id: Uuid) -> Result<Option<GuestOrder>, sqlx::Error> {
        Ok(self
            .state
            .lock()
            .guest_orders
            .iter()
            .find(|g| g.id == id)
            .cloned())
    }

    async fn get_guest_order_by_ref(
        &self,
        reference: &str,
    ) -> Result<Option<GuestOrder>, sqlx::Error> {
        Ok(self
            .state
            .lock()
            .guest_orders
            .iter()
            .find(|g| g.reference == reference)
            .cloned())
    }

    async fn get_guest_order_by_click_id(
        &self,
        click_id: &str,
    ) -> Result<Option<GuestOrder>, sqlx::Error> {
        Ok(self
            .state
            .lock()
            .guest_orders
            .iter()
            .find(|g| g.click_id == click_id)
            .cloned())
    }

    async fn advance_guest_order_status(
        &self,
        id: Uuid,
        from: OrderStatus,
        to: OrderStatus,
        order_id: Option<&str>,
        tx_hash: Option<&str>,
    ) -> Result<bool, sqlx::Error> {
        let mut state = self.state.lock();

        let Some(guest_order) = state
            .guest_order_mut(id)
            .filter(|g| g.status == from)
        else {
            return Ok(false);
        };
        guest_order.status = to;
        if let Some(order_id) = order_id {
            guest_order.order_id = Some(order_id.to_owned());
        }
        if let Some(tx_hash) = tx_hash {
            guest_order.tx_hash = Some(tx_hash.to_owned());
        }
        guest_order.updated_at = Utc::now();

        Ok(true)
    }

    async fn mark_guest_order_notified(
        &self,
        id: Uuid,
        job: &NewJob,
    ) -> Result<bool, sqlx::Error> {
        let mut state = self.state.lock();

        let Some(guest_order) = state
            .guest_order_mut(id)
            .filter(|g| g.status == OrderStatus::Confirmed && g.notified_at.is_none())
        else {
            return Ok(false);
        };
        guest_order.notified_at = Some(Utc::now());
        state.enqueue(job);

        Ok(true)
    }

    async fn confirmed_unnotified_guest_orders(
        &self,
        limit: usize,
    ) -> Result<Vec<GuestOrder>, sqlx::Error> {
        Ok(self
            .state
            .lock()
            .guest_orders
            .iter()
            .filter(|g| g.status == OrderStatus::Confirmed && g.notified_at.is_none())
            .take(limit)
            .cloned()
            .collect())
    }

    async fn claim_guest_order(
        &self,
        id: Uuid,
        user_id: UserId,
        job: &NewJob,
    ) -> Result<bool, sqlx::Error> {
        let mut state = self.state.lock();

        let Some(guest_order) = state
            .guest_order_mut(id)
            .filter(|g| g.status == OrderStatus::Confirmed)
        else {
            return Ok(false);
        };
        guest_order.status = OrderStatus::Claimed;
        guest_order.user_id = Some(user_id);
        guest_order.updated_at = Utc::now();
        state.enqueue(job);

        Ok(true)
    }

    async fn mark_credit_submitted(&self, id: Uuid) -> Result<bool, sqlx::Error> {
        let mut state = self.state.lock();

        let Some(guest_order) = state
            .guest_order_mut(id)
            .filter(|g| g.credit_submitted_at.is_none())
        else {
            return Ok(false);
        };
        guest_order.credit_submitted_at = Some(Utc::now());

        Ok(true)
    }

    async fn set_credit_tx_hash(&self, id: Uuid, tx_hash: TxHash) -> Result<(), sqlx::Error> {
        if let Some(guest_order) = self.state.lock().guest_order_mut(id) {
            guest_order.credit_tx_hash = Some(tx_hash);
        }
        Ok(())
    }

    async fn upsert_wert_order(
        &self,
        update: &WertOrderUpdate,
    ) -> Result<Option<WertOrder>, sqlx::Error> {
        let mut state = self.state.lock();
        let now = Utc::now();

        let index = update
            .order_id
            .as_ref()
            .and_then(|order_id| {
                state
                    .wert_orders
                    .iter()
                    .position(|w| w.order_id.as_ref() == Some(order_id))
            })
            .or_else(|| {
                update.click_id.as_ref().and_then(|click_id| {
                    state
                        .wert_orders
                        .iter()
                        .position(|w| &w.click_id == click_id)
                })
            });

        match (index, &update.click_id) {
            (Some(index), _) => {
                let wert_order = &mut state.wert_orders[index];
                wert_order.order_id = update.order_id.clone().or(wert_order.order_id.take());
                wert_order.base = update.base.clone().or(wert_order.base.take());
                wert_order.base_amount = update.base_amount.or(wert_order.base_amount);
                wert_order.quote = update.quote.clone().or(wert_order.quote.take());
                wert_order.quote_amount = update.quote_amount.or(wert_order.quote_amount);
                wert_order.transaction_id = update
                    .transaction_id
                    .clone()
                    .or(wert_order.transaction_id.take());
                wert_order.raw = update.raw.clone();
                wert_order.updated_at = now;
                Ok(Some(wert_order.clone()))
            }

            (None, Some(click_id)) => {
                let wert_order = WertOrder {
                    id: Uuid::now_v7(),
                    order_id: update.order_id.clone(),
                    click_id: click_id.clone(),
                    reference: None,
                    status: OrderStatus::Created,
                    base: update.base.clone(),
                    base_amount: update.base_amount,
                    quote: update.quote.clone(),
                    quote_amount: update.quote_amount,
                    transaction_id: update.transaction_id.clone(),
                    raw: update.raw.clone(),
                    created_at: now,
                    updated_at: now,
                };
                state.wert_orders.push(wert_order.clone());
                Ok(Some(wert_order))
            }

            (None, None) => Ok(None),
        }
    }

    async fn get_wert_order_by_ref(
        &self,
        reference: &str,
    ) -> Result<Option<WertOrder>, sqlx::Error> {
        Ok(self
            .state
            .lock()
            .wert_orders
            .iter()
            .find(|w| w.reference.as_deref() == Some(reference))
            .cloned())
    }

    async fn get_wert_order_by_click_id(
        &self,
        click_id: &str,
    ) -> Result<Option<WertOrder>, sqlx::Error> {
        Ok(self
            .state
            .lock()
            .wert_orders
            .iter()
            .find(|w| w.click_id == click_id)
            .cloned())
    }

    async fn advance_wert_order_status(
        &self,
        id: Uuid,
        from: OrderStatus,
        to: OrderStatus,
    ) -> Result<bool, sqlx::Error> {
        let mut state = self.state.lock();

        let Some(wert_order) = state
            .wert_orders
            .iter_mut()
            .find(|w| w.id == id && w.status == from)
        else {
            return Ok(false);
        };
        wert_order.status = to;
        wert_order.updated_at = Utc::now();

        Ok(true)
    }

    async fn settlements(&self, campaign_id: CampaignId) -> Result<Vec<Settlement>, sqlx::Error> {
        Ok(self
            .state
            .lock()
            .settlements
            .iter()
            .filter(|s| s.campaign_id == campaign_id)
            .cloned()
            .collect())
    }

    async fn insert_settlements(
        &self,
        campaign_id: CampaignId,
        outcome: SettlementOutcome,
        buyers: &[UserId],
        tx_hash: TxHash,
    ) -> Result<(), sqlx::Error> {
        let mut state = self.state.lock();

        for buyer in buyers {
            let exists = state
                .settlements
                .iter()
                .any(|s| s.campaign_id == campaign_id && s.user_id == *buyer);
            if !exists {
                state.settlements.push(Settlement {
                    campaign_id,
                    user_id: *buyer,
                    outcome,
                    tx_hash,
                    status: SettlementStatus::Submitted,
                });
            }
        }

        Ok(())
    }

    async fn delete_settlements(
        &self,
        campaign_id: CampaignId,
        tx_hash: TxHash,
    ) -> Result<(), sqlx::Error> {
        self.state.lock().settlements.retain(|s| {
            !(s.campaign_id == campaign_id
                && s.tx_hash == tx_hash
                && s.status == SettlementStatus::Submitted)
        });
        Ok(())
    }

    async fn complete_settlement_batch(
        &self,
        campaign_id: CampaignId,
        tx_hash: TxHash,
        status: EscrowStatus,
        buyers: &[UserId],
        jobs: &[NewJob],
    ) -> Result<(), sqlx::Error> {
        let mut state = self.state.lock();
        let now = Utc::now();

        for settlement in state
            .settlements
            .iter_mut()
            .filter(|s| s.campaign_id == campaign_id && s.tx_hash == tx_hash)
        {
            settlement.status = SettlementStatus::Settled;
        }

        for record in state.escrows.iter_mut().filter(|r| {
            r.campaign_id == campaign_id
                && r.status == EscrowStatus::Held
                && buyers.contains(&r.user_id)
        }) {
            record.status = status;
            record.updated_at = now;
        }

        for job in jobs {
            state.enqueue(job);
        }

        Ok(())
    }

    async fn enqueue_job(&self, job: &NewJob) -> Result<(), sqlx::Error> {
        self.state.lock().enqueue(job);
        Ok(())
    }

    async fn claim_next_job(
        &self,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Option<JobRecord>, sqlx::Error> {
        let mut state = self.state.lock();
        let lease = chrono::Duration::from_std(lease).unwrap_or(chrono::Duration::MAX);

        let job = state
            .jobs
            .iter_mut()
            .filter(|j| match j.status {
                JobStatus::Queued => j.job.run_at <= now,
                JobStatus::Running => j.locked_until.is_some_and(|until| until < now),
                _ => false,
            })
            .min_by_key(|j| j.job.run_at);

        Ok(job.map(|job| {
            job.status = JobStatus::Running;
            job.attempts += 1;
            job.locked_until = now.checked_add_signed(lease);

            JobRecord {
                id: job.job.id,
                job: job.job.job.clone(),
                attempts: job.attempts,
            }
        }))
    }

    async fn complete_job(&self, id: Uuid) -> Result<(), sqlx::Error> {
        if let Some(job) = self.state.lock().job_mut(id) {
            job.status = JobStatus::Completed;
            job.locked_until = None;
        }
        Ok(())
    }

    async fn retry_job(
        &self,
        id: Uuid,
        run_at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), sqlx::Error> {
        if let Some(job) = self.state.lock().job_mut(id) {
            job.status = JobStatus::Queued;
            job.job.run_at = run_at;
            job.locked_until = None;
            job.last_error = Some(error.to_owned());
        }
        Ok(())
    }

    async fn fail_job(&self, id: Uuid, error: &str) -> Result<(), sqlx::Error> {
        if let Some(job) = self.state.lock().job_mut(id) {
            job.status = JobStatus::Failed;
            job.locked_until = None;
            job.last_error = Some(error.to_owned());
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct ChainState {
    rate: u128,
    balances: HashMap<UserId, Balances>,
    receipts: HashMap<TxHash, Receipt>,
    events: HashMap<TxHash, Vec<ContractEvent>>,
    submitted: Vec<(ContractCall, TxParams)>,
    holds: BTreeMap<OnChainCampaignId, BTreeMap<UserId, (TokenWei, CreditsWei)>>,
    nonce: u64,
    tx_count: u64,
    revert_next: bool,
    fail_next_rpc: bool,
    fail_submission_in: Option<usize>,
    frozen_buyers: bool,
}

impl ChainState {
    fn next_tx_hash(&mut self) -> TxHash {
        self.tx_count += 1;
        let mut bytes = [0; 32];
        bytes[24..].copy_from_slice(&self.tx_count.to_be_bytes());
        TxHash::from(bytes)
    }

    fn check_rpc(&mut self) -> Result<(), ChainError> {
        if self.fail_next_rpc {
            self.fail_next_rpc = false;
            return Err(ChainError::Rpc("injected RPC failure".into()));
        }
        Ok(())
    }

    fn mine(&mut self, tx_hash: TxHash, from: Address, success: bool) {
        let receipt = Receipt {
            tx_hash,
            block_number: 1_000 + self.tx_count,
            gas_used: GAS_USED,
            effective_gas_price: GAS_PRICE,
            from,
            to: Some(Address::from([0xee; 20])),
            success,
            logs: vec![],
        };
        self.receipts.insert(tx_hash, receipt);
    }

    fn apply(&mut self, call: &ContractCall) -> Vec<ContractEvent> {
        match call {
            ContractCall::Hold {
                campaign,
                buyer,
                tt_amount_wei,
                credit_amount_wei,
            } => {
                let hold = self
                    .holds
                    .entry(*campaign)
                    .or_default()
                    .entry(*buyer)
                    .or_default();
                hold.0 += tt_amount_wei;
                hold.1 += credit_amount_wei;

                vec![ContractEvent::HoldCreated {
                    campaign: *campaign,
                    buyer: *buyer,
                    tt_amount_wei: *tt_amount_wei,
                    credit_amount_wei: *credit_amount_wei,
                }]
            }

            ContractCall::ReleaseBatch { campaign, buyers }
            | ContractCall::RefundBatch { campaign, buyers } => {
                let release = matches!(call, ContractCall::ReleaseBatch { .. });
                let frozen = self.frozen_buyers;
                let holds = self.holds.entry(*campaign).or_default();

                buyers
                    .iter()
                    .filter_map(|buyer| {
                        let (tt_amount_wei, credit_amount_wei) = if frozen {
                            holds.get(buyer).copied()?
                        } else {
                            holds.remove(buyer)?
                        };

                        let event = if release {
                            ContractEvent::HoldReleased {
                                campaign: *campaign,
                                buyer: *buyer,
                                tt_amount_wei,
                                credit_amount_wei,
                            }
                        } else {
                            ContractEvent::HoldRefunded {
                                campaign: *campaign,
                                buyer: *buyer,
                                tt_amount_wei,
                                credit_amount_wei,
                            }
                        };
                        Some(event)
                    })
                    .collect()
            }

            ContractCall::Withdraw {
                user,
                credits_wei,
                tt_amount_wei,
            } => vec![ContractEvent::Withdrawn {
                user: *user,
                tt_amount_wei: *tt_amount_wei,
                credits_wei: *credits_wei,
            }],

            ContractCall::Deposit {
                user,
                tt_amount_wei,
                credits_wei,
            } => vec![ContractEvent::Deposited {
                user: *user,
                tt_amount_wei: *tt_amount_wei,
                credits_wei: *credits_wei,
            }],
        }
    }
}

/// [ChainClient] mining every successful submission immediately.
#[derive(Debug, Clone, Default)]
pub struct FakeChain {
    state: Arc<Mutex<ChainState>>,
}

impl FakeChain {
    pub fn set_conversion_rate(&self, rate: u128) {
        self.state.lock().rate = rate;
    }

    pub fn set_balances(&self, user_id: UserId, token_wei: TokenWei, credits_wei: CreditsWei) {
        self.state.lock().balances.insert(
            user_id,
            Balances {
                token_wei,
                credits_wei,
            },
        );
    }

    /// Mine a transaction without contract call.
    pub fn mine(&self, success: bool) -> TxHash {
        let mut state = self.state.lock();
        let tx_hash = state.next_tx_hash();
        state.mine(tx_hash, Address::default(), success);
        tx_hash
    }

    /// Successfully submitted calls in submission order.
    pub fn submitted(&self) -> Vec<ContractCall> {
        self.state
            .lock()
            .submitted
            .iter()
            .map(|(call, _)| call.clone())
            .collect()
    }

    pub fn submitted_with_params(&self) -> Vec<(ContractCall, TxParams)> {
        self.state.lock().submitted.clone()
    }

    /// The next submission is accepted but mined as reverted.
    pub fn revert_next_submission(&self) {
        self.state.lock().revert_next = true;
    }

    /// The next call of any [ChainClient] method fails with [ChainError::Rpc].
    pub fn fail_next_rpc(&self) {
        self.state.lock().fail_next_rpc = true;
    }

    /// The n-th next submission, starting at 1, fails with [ChainError::Rpc].
    pub fn fail_submission(&self, n: usize) {
        self.state.lock().fail_submission_in = Some(n);
    }

    /// Settlement batches no longer remove buyers from the campaign's buyer list.
    pub fn freeze_buyers(&self) {
        self.state.lock().frozen_buyers = true;
    }
}

impl ChainClient for FakeChain {
    async fn get_balances(&self, user_id: UserId) -> Result<Balances, ChainError> {
        let mut state = self.state.lock();
        state.check_rpc()?;
        Ok(state.balances.get(&user_id).copied().unwrap_or_default())
    }

    async fn campaign_buyers(
        &self,
        campaign: OnChainCampaignId,
    ) -> Result<Vec<UserId>, ChainError> {
        let mut state = self.state.lock();
        state.check_rpc()?;
        Ok(state
            .holds
            .get(&campaign)
            .map(|holds| holds.keys().copied().collect())
            .unwrap_or_default())
    }

    async fn pending_nonce(&self, _address: Address) -> Result<u64, ChainError> {
        let mut state = self.state.lock();
        state.check_rpc()?;
        Ok(state.nonce)
    }

    async fn submit(&self, call: &ContractCall, params: &TxParams) -> Result<TxHash, ChainError> {
        let mut state = self.state.lock();
        state.check_rpc()?;

        match state.fail_submission_in {
            Some(n) if n <= 1 => {
                state.fail_submission_in = None;
                return Err(ChainError::Rpc("injected submission failure".into()));
            }
            Some(n) => state.fail_submission_in = Some(n - 1),
            None => {}
        }

        state.submitted.push((call.clone(), params.clone()));
        state.nonce += 1;
        let tx_hash = state.next_tx_hash();

        if state.revert_next {
            state.revert_next = false;
            state.mine(tx_hash, params.from, false);
        } else {
            let events = state.apply(call);
            state.events.insert(tx_hash, events);
            state.mine(tx_hash, params.from, true);
        }

        Ok(tx_hash)
    }

    async fn wait_receipt(
        &self,
        tx_hash: TxHash,
        _timeout: Duration,
    ) -> Result<Receipt, ChainError> {
        let mut state = self.state.lock();
        state.check_rpc()?;
        match state.receipts.get(&tx_hash) {
            Some(receipt) if receipt.success => Ok(receipt.clone()),
            Some(_) => Err(ChainError::Reverted(tx_hash)),
            None => Err(ChainError::Timeout(tx_hash)),
        }
    }

    async fn get_receipt(&self, tx_hash: TxHash) -> Result<Option<Receipt>, ChainError> {
        let mut state = self.state.lock();
        state.check_rpc()?;
        Ok(state.receipts.get(&tx_hash).cloned())
    }

    async fn decode_events(&self, receipt: &Receipt) -> Result<Vec<ContractEvent>, ChainError> {
        let mut state = self.state.lock();
        state.check_rpc()?;
        Ok(state
            .events
            .get(&receipt.tx_hash)
            .cloned()
            .unwrap_or_default())
    }

    async fn current_conversion_rate(&self) -> Result<u128, ChainError> {
        let mut state = self.state.lock();
        state.check_rpc()?;
        Ok(state.rate)
    }
}

/// [Mailer] recording sent mails; fails while `fail` is set.
#[derive(Debug, Clone, Default)]
pub struct RecordingMailer {
    sent: Arc<Mutex<Vec<Mail>>>,
    fail: Arc<Mutex<bool>>,
}

impl RecordingMailer {
    pub fn sent(&self) -> Vec<Mail> {
        self.sent.lock().clone()
    }

    pub fn set_failing(&self, fail: bool) {
        *self.fail.lock() = fail;
    }
}

impl Mailer for RecordingMailer {
    async fn send(&self, mail: &Mail) -> Result<(), BoxError> {
        if *self.fail.lock() {
            return Err("mail relay unavailable".into());
        }
        self.sent.lock().push(mail.clone());
        Ok(())
    }
}
