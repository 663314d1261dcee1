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
    self, Campaign, CampaignStatus, EscrowRecord, EscrowStatus, GuestOrder, Job, JobRecord,
    JobStatus, Ledger, LedgerEntry, LedgerStatus, NewJob, NewUser, OrderStatus, Reservation,
    Settlement, SettlementOutcome, SettlementStatus, TxType, User, WertOrder, WertOrderUpdate,
};
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use fastrace::trace;
use indoc::{formatdoc, indoc};
use rust_decimal::Decimal;
use settlement_common::{
    domain::{
        ByteArray, CampaignId, ConversionRate, CreditsWei, OnChainCampaignId, TokenWei, TxHash,
        UserId,
    },
    infra::pool::postgres::PostgresPool,
};
use sqlx::{FromRow, Postgres, QueryBuilder, types::Json};
use std::{fmt::Display, str::FromStr, time::Duration};
use uuid::Uuid;

/// Sqlx transaction for Postgres.
type Tx = sqlx::Transaction<'static, Postgres>;

const CAMPAIGN_COLUMNS: &str = indoc! {"
    id,
    influencer_id,
    on_chain_campaign_id,
    unit_price_credits::TEXT AS unit_price_credits,
    goal_quantity,
    sold_quantity,
    deadline,
    refund_on_deadline,
    status,
    settlement_policy
"};

const USER_COLUMNS: &str = indoc! {"
    id,
    username,
    email,
    password_hash,
    email_verified,
    phone_verified
"};

const ESCROW_COLUMNS: &str = indoc! {"
    id,
    user_id,
    campaign_id,
    on_chain_campaign_id,
    quantity,
    tt_amount::TEXT AS tt_amount,
    credit_amount::TEXT AS credit_amount,
    gas_cost_credits::TEXT AS gas_cost_credits,
    gas_cost_tt::TEXT AS gas_cost_tt,
    status,
    tx_hash,
    task_id,
    created_at,
    updated_at
"};

const LEDGER_COLUMNS: &str = indoc! {"
    id,
    tx_hash,
    tx_type,
    user_id,
    campaign_id,
    tt_amount,
    credits_delta,
    tt_amount_wei::TEXT AS tt_amount_wei,
    credits_delta_wei::TEXT AS credits_delta_wei,
    block_number,
    gas_used::TEXT AS gas_used,
    effective_gas_price::TEXT AS effective_gas_price,
    from_address,
    to_address,
    status,
    created_at
"};

const GUEST_ORDER_COLUMNS: &str = indoc! {"
    id,
    click_id,
    ref,
    email,
    amount::TEXT AS amount,
    token_decimals,
    status,
    user_id,
    campaign_id,
    entries,
    order_id,
    tx_hash,
    notified_at,
    credit_submitted_at,
    credit_tx_hash,
    participation_escrow_id,
    created_at,
    updated_at
"};

const WERT_ORDER_COLUMNS: &str = indoc! {"
    id,
    order_id,
    click_id,
    ref,
    status,
    base,
    base_amount,
    quote,
    quote_amount,
    transaction_id,
    raw,
    created_at,
    updated_at
"};

/// Postgres based implementation of [domain::storage::Storage].
#[derive(Debug, Clone)]
pub struct Storage {
    pool: PostgresPool,
}

impl Storage {
    pub fn new(pool: PostgresPool) -> Self {
        Self { pool }
    }
}

impl domain::storage::Storage for Storage {
    #[trace]
    async fn get_conversion_rate(&self) -> Result<Option<ConversionRate>, sqlx::Error> {
        let query = indoc! {"
            SELECT rate_wei::TEXT
            FROM conversion_rate
            WHERE id = 1
        "};

        sqlx::query_as::<_, (String,)>(query)
            .fetch_optional(&*self.pool)
            .await?
            .map(|(rate,)| {
                let rate = decode_number::<u128>(&rate)?;
                ConversionRate::try_from(rate).map_err(|error| sqlx::Error::Decode(error.into()))
            })
            .transpose()
    }

    #[trace]
    async fn save_conversion_rate(&self, rate: ConversionRate) -> Result<(), sqlx::Error> {
        let query = indoc! {"
            INSERT INTO conversion_rate (id, rate_wei, updated_at)
            VALUES (1, $1::NUMERIC, NOW())
            ON CONFLICT (id)
            DO UPDATE SET rate_wei = EXCLUDED.rate_wei, updated_at = EXCLUDED.updated_at
        "};

        sqlx::query(query)
            .bind(rate.get().to_string())
            .execute(&*self.pool)
            .await?;

        Ok(())
    }

    #[trace(properties = { "id": "{id}" })]
    async fn get_campaign(&self, id: CampaignId) -> Result<Option<Campaign>, sqlx::Error> {
        let query = format!("SELECT {CAMPAIGN_COLUMNS} FROM campaigns WHERE id = $1");

        sqlx::query_as::<_, CampaignRow>(&query)
            .bind(id.0)
            .fetch_optional(&*self.pool)
            .await?
            .map(Campaign::try_from)
            .transpose()
    }

    #[trace(properties = { "id": "{id}" })]
    async fn close_campaign(
        &self,
        id: CampaignId,
        outcome: SettlementOutcome,
        job: &NewJob,
    ) -> Result<bool, sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        let query = indoc! {"
            UPDATE campaigns
            SET status = $3, settlement_policy = $4, closed_at = NOW()
            WHERE id = $1
            AND status = $2
        "};

        let closed = sqlx::query(query)
            .bind(id.0)
            .bind(CampaignStatus::Open)
            .bind(CampaignStatus::Closed)
            .bind(outcome)
            .execute(&mut *tx)
            .await?
            .rows_affected()
            == 1;

        if closed {
            insert_job(job, &mut tx).await?;
        }
        tx.commit().await?;

        Ok(closed)
    }

    #[trace]
    async fn expired_open_campaigns(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Campaign>, sqlx::Error> {
        let query = format!(
            "SELECT {CAMPAIGN_COLUMNS} FROM campaigns WHERE status = $1 AND deadline <= $2 \
             ORDER BY deadline LIMIT $3"
        );

        sqlx::query_as::<_, CampaignRow>(&query)
            .bind(CampaignStatus::Open)
            .bind(now)
            .bind(limit as i64)
            .fetch_all(&*self.pool)
            .await?
            .into_iter()
            .map(Campaign::try_from)
            .collect()
    }

    #[trace(properties = { "id": "{id}" })]
    async fn get_user(&self, id: UserId) -> Result<Option<User>, sqlx::Error> {
        let query = format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1");

        let user = sqlx::query_as::<_, UserRow>(&query)
            .bind(id.0)
            .fetch_optional(&*self.pool)
            .await?;

        Ok(user.map(Into::into))
    }

    #[trace]
    async fn find_user_by_username(&self, username: &str) -> Result<Option<User>, sqlx::Error> {
        let query = format!("SELECT {USER_COLUMNS} FROM users WHERE username = $1");

        let user = sqlx::query_as::<_, UserRow>(&query)
            .bind(username)
            .fetch_optional(&*self.pool)
            .await?;

        Ok(user.map(Into::into))
    }

    #[trace]
    async fn create_user(&self, user: &NewUser) -> Result<Option<User>, sqlx::Error> {
        let query = format!(
            "INSERT INTO users (username, email, password_hash) VALUES ($1, $2, $3) \
             ON CONFLICT (username) DO NOTHING RETURNING {USER_COLUMNS}"
        );

        let user = sqlx::query_as::<_, UserRow>(&query)
            .bind(&user.username)
            .bind(&user.email)
            .bind(user.password_hash.as_deref())
            .fetch_optional(&*self.pool)
            .await?;

        Ok(user.map(Into::into))
    }

    #[trace(properties = { "id": "{id}" })]
    async fn set_user_password(&self, id: UserId, password_hash: &str) -> Result<(), sqlx::Error> {
        let query = indoc! {"
            UPDATE users
            SET password_hash = $2
            WHERE id = $1
        "};

        sqlx::query(query)
            .bind(id.0)
            .bind(password_hash)
            .execute(&*self.pool)
            .await?;

        Ok(())
    }

    #[trace]
    async fn open_escrow(
        &self,
        record: &EscrowRecord,
        job: &NewJob,
        guest_order_id: Option<Uuid>,
    ) -> Result<bool, sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        if let Some(guest_order_id) = guest_order_id {
            let query = indoc! {"
                UPDATE guest_orders
                SET participation_escrow_id = $2, updated_at = NOW()
                WHERE id = $1
                AND participation_escrow_id IS NULL
            "};

            let rows_affected = sqlx::query(query)
                .bind(guest_order_id)
                .bind(record.id)
                .execute(&mut *tx)
                .await?
                .rows_affected();

            if rows_affected == 0 {
                return Ok(false);
            }
        }

        let query = indoc! {"
            INSERT INTO escrow_records (
                id,
                user_id,
                campaign_id,
                on_chain_campaign_id,
                quantity,
                tt_amount,
                credit_amount,
                gas_cost_credits,
                gas_cost_tt,
                status,
                tx_hash,
                task_id,
                created_at,
                updated_at
            )
            VALUES (
                $1, $2, $3, $4, $5, $6::NUMERIC, $7::NUMERIC, $8::NUMERIC, $9::NUMERIC,
                $10, $11, $12, $13, $14
            )
        "};

        sqlx::query(query)
            .bind(record.id)
            .bind(record.user_id.0)
            .bind(record.campaign_id.0)
            .bind(record.on_chain_campaign_id.0 as i64)
            .bind(record.quantity as i64)
            .bind(record.tt_amount_wei.to_string())
            .bind(record.credit_amount_wei.to_string())
            .bind(record.gas_cost_credits_wei.to_string())
            .bind(record.gas_cost_tt_wei.to_string())
            .bind(record.status)
            .bind(record.tx_hash.map(|hash| hash.0.to_vec()))
            .bind(record.task_id)
            .bind(record.created_at)
            .bind(record.updated_at)
            .execute(&mut *tx)
            .await?;

        let query = indoc! {"
            UPDATE campaigns
            SET sold_quantity = sold_quantity + $2
            WHERE id = $1
        "};

        sqlx::query(query)
            .bind(record.campaign_id.0)
            .bind(record.quantity as i64)
            .execute(&mut *tx)
            .await?;

        insert_job(job, &mut tx).await?;
        tx.commit().await?;

        Ok(true)
    }

    #[trace(properties = { "id": "{id}" })]
    async fn get_escrow(&self, id: Uuid) -> Result<Option<EscrowRecord>, sqlx::Error> {
        let query = format!("SELECT {ESCROW_COLUMNS} FROM escrow_records WHERE id = $1");

        sqlx::query_as::<_, EscrowRow>(&query)
            .bind(id)
            .fetch_optional(&*self.pool)
            .await?
            .map(EscrowRecord::try_from)
            .transpose()
    }

    #[trace(properties = { "id": "{id}" })]
    async fn set_escrow_submission(&self, id: Uuid, tx_hash: TxHash) -> Result<(), sqlx::Error> {
        let query = indoc! {"
            UPDATE escrow_records
            SET tx_hash = $2, updated_at = NOW()
            WHERE id = $1
        "};

        sqlx::query(query)
            .bind(id)
            .bind(tx_hash.as_ref())
            .execute(&*self.pool)
            .await?;

        Ok(())
    }

    #[trace(properties = { "id": "{id}" })]
    async fn record_hold_mined(
        &self,
        id: Uuid,
        gas_cost_tt_wei: TokenWei,
        gas_cost_credits_wei: CreditsWei,
        job: &NewJob,
    ) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        let query = indoc! {"
            UPDATE escrow_records
            SET gas_cost_tt = $2::NUMERIC, gas_cost_credits = $3::NUMERIC, updated_at = NOW()
            WHERE id = $1
        "};

        sqlx::query(query)
            .bind(id)
            .bind(gas_cost_tt_wei.to_string())
            .bind(gas_cost_credits_wei.to_string())
            .execute(&mut *tx)
            .await?;

        insert_job(job, &mut tx).await?;
        tx.commit().await?;

        Ok(())
    }

    #[trace(properties = { "id": "{id}", "status": "{status}" })]
    async fn finalize_escrow(
        &self,
        id: Uuid,
        status: EscrowStatus,
        tx_hash: Option<TxHash>,
    ) -> Result<bool, sqlx::Error> {
        let query = indoc! {"
            UPDATE escrow_records
            SET status = $3, tx_hash = COALESCE($4, tx_hash), updated_at = NOW()
            WHERE id = $1
            AND status = $2
        "};

        let rows_affected = sqlx::query(query)
            .bind(id)
            .bind(EscrowStatus::Held)
            .bind(status)
            .bind(tx_hash.map(|hash| hash.0.to_vec()))
            .execute(&*self.pool)
            .await?
            .rows_affected();

        Ok(rows_affected == 1)
    }

    #[trace]
    async fn insert_ledger_entry(&self, entry: &LedgerEntry) -> Result<bool, sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        let inserted = insert_ledger_entry(entry, &mut tx).await?;
        tx.commit().await?;

        Ok(inserted)
    }

    #[trace(properties = { "tx_type": "{tx_type}", "id": "{id}" })]
    async fn get_ledger_entry(
        &self,
        tx_type: TxType,
        id: Uuid,
    ) -> Result<Option<LedgerEntry>, sqlx::Error> {
        let table = ledger_table(tx_type);
        let query = format!("SELECT {LEDGER_COLUMNS} FROM {table} WHERE id = $1 AND tx_type = $2");

        sqlx::query_as::<_, LedgerRow>(&query)
            .bind(id)
            .bind(tx_type)
            .fetch_optional(&*self.pool)
            .await?
            .map(LedgerEntry::try_from)
            .transpose()
    }

    #[trace(properties = { "id": "{id}" })]
    async fn complete_reservation(
        &self,
        id: Uuid,
        entry: &LedgerEntry,
    ) -> Result<bool, sqlx::Error> {
        let table = ledger_table(entry.tx_type);
        let query = formatdoc! {"
            UPDATE {table}
            SET
                tx_hash = $3,
                tt_amount = $4,
                credits_delta = $5,
                tt_amount_wei = $6::NUMERIC,
                credits_delta_wei = $7::NUMERIC,
                block_number = $8,
                gas_used = $9::NUMERIC,
                effective_gas_price = $10::NUMERIC,
                from_address = $11,
                to_address = $12,
                status = $13
            WHERE id = $1
            AND status = $2
        "};

        let rows_affected = sqlx::query(&query)
            .bind(id)
            .bind(LedgerStatus::Pending)
            .bind(entry.tx_hash.map(|hash| hash.0.to_vec()))
            .bind(entry.tt_amount)
            .bind(entry.credits_delta)
            .bind(entry.tt_amount_wei.to_string())
            .bind(entry.credits_delta_wei.to_string())
            .bind(entry.block_number.map(|n| n as i64))
            .bind(entry.gas_used.map(|n| n.to_string()))
            .bind(entry.effective_gas_price.map(|n| n.to_string()))
            .bind(entry.from_address.map(|address| address.0.to_vec()))
            .bind(entry.to_address.map(|address| address.0.to_vec()))
            .bind(entry.status)
            .execute(&*self.pool)
            .await?
            .rows_affected();

        Ok(rows_affected == 1)
    }

    #[trace(properties = { "id": "{id}" })]
    async fn fail_reservation(&self, id: Uuid) -> Result<(), sqlx::Error> {
        let query = indoc! {"
            UPDATE transactions
            SET status = $3
            WHERE id = $1
            AND status = $2
        "};

        sqlx::query(query)
            .bind(id)
            .bind(LedgerStatus::Pending)
            .bind(LedgerStatus::Failed)
            .execute(&*self.pool)
            .await?;

        Ok(())
    }

    #[trace(properties = { "id": "{id}" })]
    async fn set_reservation_tx_hash(&self, id: Uuid, tx_hash: TxHash) -> Result<(), sqlx::Error> {
        let query = indoc! {"
            UPDATE transactions
            SET tx_hash = $2
            WHERE id = $1
        "};

        sqlx::query(query)
            .bind(id)
            .bind(tx_hash.as_ref())
            .execute(&*self.pool)
            .await?;

        Ok(())
    }

    #[trace]
    async fn reserve_withdrawal(
        &self,
        entry: &LedgerEntry,
        day: NaiveDate,
        limit: CreditsWei,
        job: &NewJob,
    ) -> Result<Reservation, sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        // Serializes concurrent withdrawals of the same user.
        let query = indoc! {"
            SELECT email_verified, phone_verified
            FROM users
            WHERE id = $1
            FOR UPDATE
        "};

        let user = sqlx::query_as::<_, (bool, bool)>(query)
            .bind(entry.user_id.0)
            .fetch_optional(&mut *tx)
            .await?;
        match user {
            None => return Ok(Reservation::UnknownUser),
            Some((false, false)) => return Ok(Reservation::NotVerified),
            Some(_) => {}
        }

        let query = indoc! {"
            SELECT COALESCE(SUM(ABS(credits_delta_wei)), 0)::TEXT
            FROM transactions
            WHERE user_id = $1
            AND tx_type = $2
            AND status <> $3
            AND created_at >= $4
            AND created_at < $5
        "};

        let start = day.and_time(NaiveTime::MIN).and_utc();
        let end = start + chrono::Duration::days(1);
        let (used,) = sqlx::query_as::<_, (String,)>(query)
            .bind(entry.user_id.0)
            .bind(TxType::Withdraw)
            .bind(LedgerStatus::Failed)
            .bind(start)
            .bind(end)
            .fetch_one(&mut *tx)
            .await?;
        let used = decode_number::<u128>(&used)?;

        let requested = entry.credits_delta_wei.unsigned_abs();
        if used.saturating_add(requested) > limit {
            return Ok(Reservation::Exceeded { used });
        }

        insert_ledger_entry(entry, &mut tx).await?;

        let query = indoc! {"
            UPDATE users
            SET email_verified = FALSE, phone_verified = FALSE
            WHERE id = $1
        "};

        sqlx::query(query)
            .bind(entry.user_id.0)
            .execute(&mut *tx)
            .await?;

        insert_job(job, &mut tx).await?;
        tx.commit().await?;

        Ok(Reservation::Reserved)
    }

    #[trace]
    async fn insert_guest_order(
        &self,
        guest_order: &GuestOrder,
        wert_order: &WertOrder,
    ) -> Result<bool, sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        let query = indoc! {"
            INSERT INTO guest_orders (
                id,
                click_id,
                ref,
                email,
                amount,
                token_decimals,
                status,
                user_id,
                campaign_id,
                entries,
                order_id,
                tx_hash,
                created_at,
                updated_at
            )
            VALUES ($1, $2, $3, $4, $5::NUMERIC, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT DO NOTHING
        "};

        let rows_affected = sqlx::query(query)
            .bind(guest_order.id)
            .bind(&guest_order.click_id)
            .bind(&guest_order.reference)
            .bind(&guest_order.email)
            .bind(guest_order.amount_wei.to_string())
            .bind(guest_order.token_decimals as i32)
            .bind(guest_order.status)
            .bind(guest_order.user_id.map(|id| id.0))
            .bind(guest_order.campaign_id.map(|id| id.0))
            .bind(guest_order.entries as i64)
            .bind(guest_order.order_id.as_deref())
            .bind(guest_order.tx_hash.as_deref())
            .bind(guest_order.created_at)
            .bind(guest_order.updated_at)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        if rows_affected == 0 {
            return Ok(false);
        }

        let query = indoc! {"
            INSERT INTO wert_orders (
                id,
                order_id,
                click_id,
                ref,
                status,
                base,
                base_amount,
                quote,
                quote_amount,
                transaction_id,
                raw,
                created_at,
                updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (click_id) DO NOTHING
        "};

        sqlx::query(query)
            .bind(wert_order.id)
            .bind(wert_order.order_id.as_deref())
            .bind(&wert_order.click_id)
            .bind(wert_order.reference.as_deref())
            .bind(wert_order.status)
            .bind(wert_order.base.as_deref())
            .bind(wert_order.base_amount)
            .bind(wert_order.quote.as_deref())
            .bind(wert_order.quote_amount)
            .bind(wert_order.transaction_id.as_deref())
            .bind(Json(&wert_order.raw))
            .bind(wert_order.created_at)
            .bind(wert_order.updated_at)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(true)
    }

    #[trace(properties = { "id": "{id}" })]
    async fn get_guest_order(&self, id: Uuid) -> Result<Option<GuestOrder>, sqlx::Error> {
        let query = format!("SELECT {GUEST_ORDER_COLUMNS} FROM guest_orders WHERE id = $1");
        self.fetch_guest_order(&query, id).await
    }

    #[trace]
    async fn get_guest_order_by_ref(
        &self,
        reference: &str,
    ) -> Result<Option<GuestOrder>, sqlx::Error> {
        let query = format!("SELECT {GUEST_ORDER_COLUMNS} FROM guest_orders WHERE ref = $1");
        self.fetch_guest_order(&query, reference).await
    }

    #[trace]
    async fn get_guest_order_by_click_id(
        &self,
        click_id: &str,
    ) -> Result<Option<GuestOrder>, sqlx::Error> {
        let query = format!("SELECT {GUEST_ORDER_COLUMNS} FROM guest_orders WHERE click_id = $1");
        self.fetch_guest_order(&query, click_id).await
    }

    #[trace(properties = { "id": "{id}", "from": "{from}", "to": "{to}" })]
    async fn advance_guest_order_status(
        &self,
        id: Uuid,
        from: OrderStatus,
        to: OrderStatus,
        order_id: Option<&str>,
        tx_hash: Option<&str>,
    ) -> Result<bool, sqlx::Error> {
        let query = indoc! {"
            UPDATE guest_orders
            SET
                status = $3,
                order_id = COALESCE($4, order_id),
                tx_hash = COALESCE($5, tx_hash),
                updated_at = NOW()
            WHERE id = $1
            AND status = $2
        "};

        let rows_affected = sqlx::query(query)
            .bind(id)
            .bind(from)
            .bind(to)
            .bind(order_id)
            .bind(tx_hash)
            .execute(&*self.pool)
            .await?
            .rows_affected();

        Ok(rows_affected == 1)
    }

    #[trace(properties = { "id": "{id}" })]
    async fn mark_guest_order_notified(
        &self,
        id: Uuid,
        job: &NewJob,
    ) -> Result<bool, sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        let query = indoc! {"
            UPDATE guest_orders
            SET notified_at = NOW(), updated_at = NOW()
            WHERE id = $1
            AND status = $2
            AND notified_at IS NULL
        "};

        let notified = sqlx::query(query)
            .bind(id)
            .bind(OrderStatus::Confirmed)
            .execute(&mut *tx)
            .await?
            .rows_affected()
            == 1;

        if notified {
            insert_job(job, &mut tx).await?;
        }
        tx.commit().await?;

        Ok(notified)
    }

    #[trace]
    async fn confirmed_unnotified_guest_orders(
        &self,
        limit: usize,
    ) -> Result<Vec<GuestOrder>, sqlx::Error> {
        let query = format!(
            "SELECT {GUEST_ORDER_COLUMNS} FROM guest_orders WHERE status = $1 \
             AND notified_at IS NULL ORDER BY created_at LIMIT $2"
        );

        sqlx::query_as::<_, GuestOrderRow>(&query)
            .bind(OrderStatus::Confirmed)
            .bind(limit as i64)
            .fetch_all(&*self.pool)
            .await?
            .into_iter()
            .map(GuestOrder::try_from)
            .collect()
    }

    #[trace(properties = { "id": "{id}", "user_id": "{user_id}" })]
    async fn claim_guest_order(
        &self,
        id: Uuid,
        user_id: UserId,
        job: &NewJob,
    ) -> Result<bool, sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        let query = indoc! {"
            UPDATE guest_orders
            SET status = $3, user_id = $4, updated_at = NOW()
            WHERE id = $1
            AND status = $2
        "};

        let claimed = sqlx::query(query)
            .bind(id)
            .bind(OrderStatus::Confirmed)
            .bind(OrderStatus::Claimed)
            .bind(user_id.0)
            .execute(&mut *tx)
            .await?
            .rows_affected()
            == 1;

        if claimed {
            insert_job(job, &mut tx).await?;
        }
        tx.commit().await?;

        Ok(claimed)
    }

    #[trace(properties = { "id": "{id}" })]
    async fn mark_credit_submitted(&self, id: Uuid) -> Result<bool, sqlx::Error> {
        let query = indoc! {"
            UPDATE guest_orders
            SET credit_submitted_at = NOW(), updated_at = NOW()
            WHERE id = $1
            AND credit_submitted_at IS NULL
        "};

        let rows_affected = sqlx::query(query)
            .bind(id)
            .execute(&*self.pool)
            .await?
            .rows_affected();

        Ok(rows_affected == 1)
    }

    #[trace(properties = { "id": "{id}" })]
    async fn set_credit_tx_hash(&self, id: Uuid, tx_hash: TxHash) -> Result<(), sqlx::Error> {
        let query = indoc! {"
            UPDATE guest_orders
            SET credit_tx_hash = $2, updated_at = NOW()
            WHERE id = $1
        "};

        sqlx::query(query)
            .bind(id)
            .bind(tx_hash.as_ref())
            .execute(&*self.pool)
            .await?;

        Ok(())
    }

    #[trace]
    async fn upsert_wert_order(
        &self,
        update: &WertOrderUpdate,
    ) -> Result<Option<WertOrder>, sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        // By order ID first, click ID second.
        let id = match &update.order_id {
            Some(order_id) => lock_wert_order("order_id", order_id, &mut tx).await?,
            None => None,
        };
        let id = match (id, &update.click_id) {
            (None, Some(click_id)) => lock_wert_order("click_id", click_id, &mut tx).await?,
            (id, _) => id,
        };

        let wert_order = match (id, &update.click_id) {
            (Some(id), _) => {
                let query = formatdoc! {"
                        UPDATE wert_orders
                        SET order_id = COALESCE($2, order_id),
                            base = COALESCE($3, base),
                            base_amount = COALESCE($4, base_amount),
                            quote = COALESCE($5, quote),
                            quote_amount = COALESCE($6, quote_amount),
                            transaction_id = COALESCE($7, transaction_id),
                            raw = $8,
                            updated_at = NOW()
                        WHERE id = $1
                        RETURNING {WERT_ORDER_COLUMNS}
                    "};

                sqlx::query_as::<_, WertOrderRow>(&query)
                    .bind(id)
                    .bind(update.order_id.as_deref())
                    .bind(update.base.as_deref())
                    .bind(update.base_amount)
                    .bind(update.quote.as_deref())
                    .bind(update.quote_amount)
                    .bind(update.transaction_id.as_deref())
                    .bind(Json(&update.raw))
                    .fetch_one(&mut *tx)
                    .await?
            }

            (None, Some(click_id)) => {
                let query = formatdoc! {"
                        INSERT INTO wert_orders (
                            id,
                            order_id,
                            click_id,
                            status,
                            base,
                            base_amount,
                            quote,
                            quote_amount,
                            transaction_id,
                            raw
                        )
                        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                        RETURNING {WERT_ORDER_COLUMNS}
                    "};

                sqlx::query_as::<_, WertOrderRow>(&query)
                    .bind(Uuid::now_v7())
                    .bind(update.order_id.as_deref())
                    .bind(click_id)
                    .bind(OrderStatus::Created)
                    .bind(update.base.as_deref())
                    .bind(update.base_amount)
                    .bind(update.quote.as_deref())
                    .bind(update.quote_amount)
                    .bind(update.transaction_id.as_deref())
                    .bind(Json(&update.raw))
                    .fetch_one(&mut *tx)
                    .await?
            }

            (None, None) => return Ok(None),
        };

        tx.commit().await?;

        Ok(Some(wert_order.into()))
    }

    #[trace]
    async fn get_wert_order_by_ref(
        &self,
        reference: &str,
    ) -> Result<Option<WertOrder>, sqlx::Error> {
        let query = format!("SELECT {WERT_ORDER_COLUMNS} FROM wert_orders WHERE ref = $1");

        let wert_order = sqlx::query_as::<_, WertOrderRow>(&query)
            .bind(reference)
            .fetch_optional(&*self.pool)
            .await?;

        Ok(wert_order.map(Into::into))
    }

    #[trace]
    async fn get_wert_order_by_click_id(
        &self,
        click_id: &str,
    ) -> Result<Option<WertOrder>, sqlx::Error> {
        let query = format!("SELECT {WERT_ORDER_COLUMNS} FROM wert_orders WHERE click_id = $1");

        let wert_order = sqlx::query_as::<_, WertOrderRow>(&query)
            .bind(click_id)
            .fetch_optional(&*self.pool)
            .await?;

        Ok(wert_order.map(Into::into))
    }

    #[trace(properties = { "id": "{id}", "from": "{from}", "to": "{to}" })]
    async fn advance_wert_order_status(
        &self,
        id: Uuid,
        from: OrderStatus,
        to: OrderStatus,
    ) -> Result<bool, sqlx::Error> {
        let query = indoc! {"
            UPDATE wert_orders
            SET status = $3, updated_at = NOW()
            WHERE id = $1
            AND status = $2
        "};

        let rows_affected = sqlx::query(query)
            .bind(id)
            .bind(from)
            .bind(to)
            .execute(&*self.pool)
            .await?
            .rows_affected();

        Ok(rows_affected == 1)
    }

    #[trace(properties = { "campaign_id": "{campaign_id}" })]
    async fn settlements(&self, campaign_id: CampaignId) -> Result<Vec<Settlement>, sqlx::Error> {
        let query = indoc! {"
            SELECT campaign_id, user_id, outcome, tx_hash, status
            FROM settlements
            WHERE campaign_id = $1
            ORDER BY user_id
        "};

        sqlx::query_as::<_, SettlementRow>(query)
            .bind(campaign_id.0)
            .fetch_all(&*self.pool)
            .await?
            .into_iter()
            .map(Settlement::try_from)
            .collect()
    }

    #[trace(properties = { "campaign_id": "{campaign_id}", "tx_hash": "{tx_hash}" })]
    async fn insert_settlements(
        &self,
        campaign_id: CampaignId,
        outcome: SettlementOutcome,
        buyers: &[UserId],
        tx_hash: TxHash,
    ) -> Result<(), sqlx::Error> {
        if buyers.is_empty() {
            return Ok(());
        }

        let query = indoc! {"
            INSERT INTO settlements (
                campaign_id,
                user_id,
                outcome,
                tx_hash,
                status
            )
        "};

        QueryBuilder::<Postgres>::new(query)
            .push_values(buyers.iter(), |mut q, buyer| {
                q.push_bind(campaign_id.0)
                    .push_bind(buyer.0)
                    .push_bind(outcome)
                    .push_bind(tx_hash.0.to_vec())
                    .push_bind(SettlementStatus::Submitted);
            })
            .push(" ON CONFLICT (campaign_id, user_id) DO NOTHING")
            .build()
            .execute(&*self.pool)
            .await?;

        Ok(())
    }

    #[trace(properties = { "campaign_id": "{campaign_id}", "tx_hash": "{tx_hash}" })]
    async fn delete_settlements(
        &self,
        campaign_id: CampaignId,
        tx_hash: TxHash,
    ) -> Result<(), sqlx::Error> {
        let query = indoc! {"
            DELETE FROM settlements
            WHERE campaign_id = $1
            AND tx_hash = $2
            AND status = $3
        "};

        sqlx::query(query)
            .bind(campaign_id.0)
            .bind(tx_hash.as_ref())
            .bind(SettlementStatus::Submitted)
            .execute(&*self.pool)
            .await?;

        Ok(())
    }

    #[trace(properties = { "campaign_id": "{campaign_id}", "tx_hash": "{tx_hash}" })]
    async fn complete_settlement_batch(
        &self,
        campaign_id: CampaignId,
        tx_hash: TxHash,
        status: EscrowStatus,
        buyers: &[UserId],
        jobs: &[NewJob],
    ) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        let query = indoc! {"
            UPDATE settlements
            SET status = $3, updated_at = NOW()
            WHERE campaign_id = $1
            AND tx_hash = $2
        "};

        sqlx::query(query)
            .bind(campaign_id.0)
            .bind(tx_hash.as_ref())
            .bind(SettlementStatus::Settled)
            .execute(&mut *tx)
            .await?;

        let query = indoc! {"
            UPDATE escrow_records
            SET status = $3, updated_at = NOW()
            WHERE campaign_id = $1
            AND status = $2
            AND user_id = ANY($4)
        "};

        let buyers = buyers.iter().map(|buyer| buyer.0).collect::<Vec<_>>();
        sqlx::query(query)
            .bind(campaign_id.0)
            .bind(EscrowStatus::Held)
            .bind(status)
            .bind(buyers)
            .execute(&mut *tx)
            .await?;

        for job in jobs {
            insert_job(job, &mut tx).await?;
        }
        tx.commit().await?;

        Ok(())
    }

    #[trace]
    async fn enqueue_job(&self, job: &NewJob) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        insert_job(job, &mut tx).await?;
        tx.commit().await?;

        Ok(())
    }

    #[trace]
    async fn claim_next_job(
        &self,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Option<JobRecord>, sqlx::Error> {
        let query = indoc! {"
            UPDATE jobs
            SET status = $2, attempts = attempts + 1, locked_until = $4, updated_at = NOW()
            WHERE id = (
                SELECT id
                FROM jobs
                WHERE (status = $1 AND run_at <= $3)
                OR (status = $2 AND locked_until < $3)
                ORDER BY run_at
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, payload, attempts
        "};

        let lease = chrono::Duration::from_std(lease).unwrap_or(chrono::Duration::MAX);
        let locked_until = now
            .checked_add_signed(lease)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        let job = sqlx::query_as::<_, (Uuid, Json<Job>, i32)>(query)
            .bind(JobStatus::Queued)
            .bind(JobStatus::Running)
            .bind(now)
            .bind(locked_until)
            .fetch_optional(&*self.pool)
            .await?;

        Ok(job.map(|(id, Json(job), attempts)| JobRecord {
            id,
            job,
            attempts: attempts as u32,
        }))
    }

    #[trace(properties = { "id": "{id}" })]
    async fn complete_job(&self, id: Uuid) -> Result<(), sqlx::Error> {
        self.set_job_status(id, JobStatus::Completed, None, None)
            .await
    }

    #[trace(properties = { "id": "{id}" })]
    async fn retry_job(
        &self,
        id: Uuid,
        run_at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), sqlx::Error> {
        self.set_job_status(id, JobStatus::Queued, Some(run_at), Some(error))
            .await
    }

    #[trace(properties = { "id": "{id}" })]
    async fn fail_job(&self, id: Uuid, error: &str) -> Result<(), sqlx::Error> {
        self.set_job_status(id, JobStatus::Failed, None, Some(error))
            .await
    }
}

impl Storage {
    async fn fetch_guest_order<'a, T>(
        &self,
        query: &'a str,
        key: T,
    ) -> Result<Option<GuestOrder>, sqlx::Error>
    where
        T: sqlx::Encode<'a, Postgres> + sqlx::Type<Postgres> + Send + 'a,
    {
        sqlx::query_as::<_, GuestOrderRow>(query)
            .bind(key)
            .fetch_optional(&*self.pool)
            .await?
            .map(GuestOrder::try_from)
            .transpose()
    }

    async fn set_job_status(
        &self,
        id: Uuid,
        status: JobStatus,
        run_at: Option<DateTime<Utc>>,
        error: Option<&str>,
    ) -> Result<(), sqlx::Error> {
        let query = indoc! {"
            UPDATE jobs
            SET
                status = $2,
                run_at = COALESCE($3, run_at),
                last_error = COALESCE($4, last_error),
                locked_until = NULL,
                updated_at = NOW()
            WHERE id = $1
        "};

        sqlx::query(query)
            .bind(id)
            .bind(status)
            .bind(run_at)
            .bind(error)
            .execute(&*self.pool)
            .await?;

        Ok(())
    }
}

/// Lock the provider mirror matching the given unique column, returning its ID.
async fn lock_wert_order(
    column: &'static str,
    value: &str,
    tx: &mut Tx,
) -> Result<Option<Uuid>, sqlx::Error> {
    let query = formatdoc! {"
        SELECT id
        FROM wert_orders
        WHERE {column} = $1
        FOR UPDATE
    "};

    let id = sqlx::query_as::<_, (Uuid,)>(&query)
        .bind(value)
        .fetch_optional(&mut **tx)
        .await?;

    Ok(id.map(|(id,)| id))
}

async fn insert_job(job: &NewJob, tx: &mut Tx) -> Result<(), sqlx::Error> {
    let query = indoc! {"
        INSERT INTO jobs (id, kind, payload, status, run_at)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (id) DO NOTHING
    "};

    sqlx::query(query)
        .bind(job.id)
        .bind(job.job.kind().as_str())
        .bind(Json(&job.job))
        .bind(JobStatus::Queued)
        .bind(job.run_at)
        .execute(&mut **tx)
        .await?;

    Ok(())
}

async fn insert_ledger_entry(entry: &LedgerEntry, tx: &mut Tx) -> Result<bool, sqlx::Error> {
    let table = ledger_table(entry.tx_type);
    let query = formatdoc! {"
            INSERT INTO {table} (
                id,
                tx_hash,
                tx_type,
                user_id,
                campaign_id,
                tt_amount,
                credits_delta,
                tt_amount_wei,
                credits_delta_wei,
                block_number,
                gas_used,
                effective_gas_price,
                from_address,
                to_address,
                status,
                created_at
            )
            VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8::NUMERIC, $9::NUMERIC, $10, $11::NUMERIC,
                $12::NUMERIC, $13, $14, $15, $16
            )
            ON CONFLICT (tx_hash, tx_type, user_id) DO NOTHING
        "};

    let rows_affected = sqlx::query(&query)
        .bind(entry.id)
        .bind(entry.tx_hash.map(|hash| hash.0.to_vec()))
        .bind(entry.tx_type)
        .bind(entry.user_id.0)
        .bind(entry.campaign_id.map(|id| id.0))
        .bind(entry.tt_amount)
        .bind(entry.credits_delta)
        .bind(entry.tt_amount_wei.to_string())
        .bind(entry.credits_delta_wei.to_string())
        .bind(entry.block_number.map(|n| n as i64))
        .bind(entry.gas_used.map(|n| n.to_string()))
        .bind(entry.effective_gas_price.map(|n| n.to_string()))
        .bind(entry.from_address.map(|address| address.0.to_vec()))
        .bind(entry.to_address.map(|address| address.0.to_vec()))
        .bind(entry.status)
        .bind(entry.created_at)
        .execute(&mut **tx)
        .await?
        .rows_affected();

    Ok(rows_affected == 1)
}

fn ledger_table(tx_type: TxType) -> &'static str {
    match tx_type.ledger() {
        Ledger::User => "transactions",
        Ledger::Influencer => "influencer_transactions",
    }
}

/// Numeric columns exceeding 64 bits are selected as text.
fn decode_number<T>(value: &str) -> Result<T, sqlx::Error>
where
    T: FromStr,
    T::Err: Display,
{
    value
        .parse()
        .map_err(|error| sqlx::Error::Decode(format!("invalid number {value}: {error}").into()))
}

fn decode_bytes<const N: usize>(bytes: Vec<u8>) -> Result<ByteArray<N>, sqlx::Error> {
    ByteArray::try_from(bytes).map_err(|error| sqlx::Error::Decode(error.into()))
}

#[derive(Debug, FromRow)]
struct CampaignRow {
    id: i64,
    influencer_id: i64,
    on_chain_campaign_id: i64,
    unit_price_credits: String,
    goal_quantity: i64,
    sold_quantity: i64,
    deadline: DateTime<Utc>,
    refund_on_deadline: bool,
    status: CampaignStatus,
    settlement_policy: Option<SettlementOutcome>,
}

impl TryFrom<CampaignRow> for Campaign {
    type Error = sqlx::Error;

    fn try_from(row: CampaignRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: CampaignId(row.id),
            influencer_id: UserId(row.influencer_id),
            on_chain_campaign_id: OnChainCampaignId(row.on_chain_campaign_id as u64),
            unit_price_credits_wei: decode_number(&row.unit_price_credits)?,
            goal_quantity: row.goal_quantity as u64,
            sold_quantity: row.sold_quantity as u64,
            deadline: row.deadline,
            refund_on_deadline: row.refund_on_deadline,
            status: row.status,
            settlement_policy: row.settlement_policy,
        })
    }
}

#[derive(Debug, FromRow)]
struct UserRow {
    id: i64,
    username: String,
    email: String,
    password_hash: Option<String>,
    email_verified: bool,
    phone_verified: bool,
}

impl From<UserRow> for User {
    fn from(row: UserRow) -> Self {
        Self {
            id: UserId(row.id),
            username: row.username,
            email: row.email,
            password_hash: row.password_hash,
            email_verified: row.email_verified,
            phone_verified: row.phone_verified,
        }
    }
}

#[derive(Debug, FromRow)]
struct EscrowRow {
    id: Uuid,
    user_id: i64,
    campaign_id: i64,
    on_chain_campaign_id: i64,
    quantity: i64,
    tt_amount: String,
    credit_amount: String,
    gas_cost_credits: String,
    gas_cost_tt: String,
    status: EscrowStatus,
    tx_hash: Option<Vec<u8>>,
    task_id: Uuid,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<EscrowRow> for EscrowRecord {
    type Error = sqlx::Error;

    fn try_from(row: EscrowRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            user_id: UserId(row.user_id),
            campaign_id: CampaignId(row.campaign_id),
            on_chain_campaign_id: OnChainCampaignId(row.on_chain_campaign_id as u64),
            quantity: row.quantity as u64,
            tt_amount_wei: decode_number(&row.tt_amount)?,
            credit_amount_wei: decode_number(&row.credit_amount)?,
            gas_cost_credits_wei: decode_number(&row.gas_cost_credits)?,
            gas_cost_tt_wei: decode_number(&row.gas_cost_tt)?,
            status: row.status,
            tx_hash: row.tx_hash.map(decode_bytes).transpose()?,
            task_id: row.task_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct LedgerRow {
    id: Uuid,
    tx_hash: Option<Vec<u8>>,
    tx_type: TxType,
    user_id: i64,
    campaign_id: Option<i64>,
    tt_amount: Decimal,
    credits_delta: Decimal,
    tt_amount_wei: String,
    credits_delta_wei: String,
    block_number: Option<i64>,
    gas_used: Option<String>,
    effective_gas_price: Option<String>,
    from_address: Option<Vec<u8>>,
    to_address: Option<Vec<u8>>,
    status: LedgerStatus,
    created_at: DateTime<Utc>,
}

impl TryFrom<LedgerRow> for LedgerEntry {
    type Error = sqlx::Error;

    fn try_from(row: LedgerRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            tx_hash: row.tx_hash.map(decode_bytes).transpose()?,
            tx_type: row.tx_type,
            user_id: UserId(row.user_id),
            campaign_id: row.campaign_id.map(CampaignId),
            tt_amount: row.tt_amount,
            credits_delta: row.credits_delta,
            tt_amount_wei: decode_number(&row.tt_amount_wei)?,
            credits_delta_wei: decode_number(&row.credits_delta_wei)?,
            block_number: row.block_number.map(|n| n as u64),
            gas_used: row.gas_used.as_deref().map(decode_number).transpose()?,
            effective_gas_price: row
                .effective_gas_price
                .as_deref()
                .map(decode_number)
                .transpose()?,
            from_address: row.from_address.map(decode_bytes).transpose()?,
            to_address: row.to_address.map(decode_bytes).transpose()?,
            status: row.status,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct GuestOrderRow {
    id: Uuid,
    click_id: String,
    #[sqlx(rename = "ref")]
    reference: String,
    email: String,
    amount: String,
    token_decimals: i32,
    status: OrderStatus,
    user_id: Option<i64>,
    campaign_id: Option<i64>,
    entries: i64,
    order_id: Option<String>,
    tx_hash: Option<String>,
    notified_at: Option<DateTime<Utc>>,
    credit_submitted_at: Option<DateTime<Utc>>,
    credit_tx_hash: Option<Vec<u8>>,
    participation_escrow_id: Option<Uuid>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<GuestOrderRow> for GuestOrder {
    type Error = sqlx::Error;

    fn try_from(row: GuestOrderRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            click_id: row.click_id,
            reference: row.reference,
            email: row.email,
            amount_wei: decode_number(&row.amount)?,
            token_decimals: row.token_decimals as u32,
            status: row.status,
            user_id: row.user_id.map(UserId),
            campaign_id: row.campaign_id.map(CampaignId),
            entries: row.entries as u64,
            order_id: row.order_id,
            tx_hash: row.tx_hash,
            notified_at: row.notified_at,
            credit_submitted_at: row.credit_submitted_at,
            credit_tx_hash: row.credit_tx_hash.map(decode_bytes).transpose()?,
            participation_escrow_id: row.participation_escrow_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct WertOrderRow {
    id: Uuid,
    order_id: Option<String>,
    click_id: String,
    #[sqlx(rename = "ref")]
    reference: Option<String>,
    status: OrderStatus,
    base: Option<String>,
    base_amount: Option<Decimal>,
    quote: Option<String>,
    quote_amount: Option<Decimal>,
    transaction_id: Option<String>,
    raw: Json<serde_json::Value>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<WertOrderRow> for WertOrder {
    fn from(row: WertOrderRow) -> Self {
        Self {
            id: row.id,
            order_id: row.order_id,
            click_id: row.click_id,
            reference: row.reference,
            status: row.status,
            base: row.base,
            base_amount: row.base_amount,
            quote: row.quote,
            quote_amount: row.quote_amount,
            transaction_id: row.transaction_id,
            raw: row.raw.0,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct SettlementRow {
    campaign_id: i64,
    user_id: i64,
    outcome: SettlementOutcome,
    tx_hash: Vec<u8>,
    status: SettlementStatus,
}

impl TryFrom<SettlementRow> for Settlement {
    type Error = sqlx::Error;

    fn try_from(row: SettlementRow) -> Result<Self, Self::Error> {
        Ok(Self {
            campaign_id: CampaignId(row.campaign_id),
            user_id: UserId(row.user_id),
            outcome: row.outcome,
            tx_hash: decode_bytes(row.tx_hash)?,
            status: row.status,
        })
    }
}
