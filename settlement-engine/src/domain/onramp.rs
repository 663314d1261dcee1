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

//! Fiat on-ramp reconciliation: provider webhooks drive a forward-only state machine over pairs
//! of guest orders and their provider-side mirrors.

use crate::domain::{Config, Error, Job, NewJob, ValidationError, storage::Storage};
use chrono::{DateTime, Utc};
use derive_more::Display;
use fastrace::trace;
use hmac::{Hmac, Mac};
use log::{debug, info, warn};
use metrics::counter;
use rust_decimal::Decimal;
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use settlement_common::domain::{
    CampaignId, TxHash, UserId,
    amount::{TOKEN_DECIMALS, to_display, within_tolerance},
};
use sha2::{Digest, Sha256};
use sqlx::Type;
use std::sync::Arc;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Serialize, Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "ORDER_STATUS", rename_all = "snake_case")]
pub enum OrderStatus {
    Created,
    Pending,
    Confirmed,
    Failed,
    Claimed,
}

impl OrderStatus {
    /// Forward-only transitions; a late `failed` may still be corrected by a confirmation.
    pub fn can_advance(self, to: OrderStatus) -> bool {
        use OrderStatus::*;

        matches!(
            (self, to),
            (Created, Pending | Confirmed | Failed)
                | (Pending, Confirmed | Failed)
                | (Failed, Confirmed)
                | (Confirmed, Claimed)
        )
    }

    /// Map a provider event type; unknown events map to `None` and leave the status untouched.
    pub fn from_event(event: &str) -> Option<OrderStatus> {
        match event {
            "payment_started" | "transfer_started" => Some(OrderStatus::Pending),
            "order_complete" => Some(OrderStatus::Confirmed),
            "order_failed" | "order_canceled" | "tx_smart_contract_failed" => {
                Some(OrderStatus::Failed)
            }
            _ => None,
        }
    }
}

/// A purchase made before the buyer has an account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestOrder {
    pub id: Uuid,
    pub click_id: String,
    pub reference: String,
    pub email: String,
    pub amount_wei: u128,
    pub token_decimals: u32,
    pub status: OrderStatus,
    pub user_id: Option<UserId>,
    pub campaign_id: Option<CampaignId>,
    pub entries: u64,
    pub order_id: Option<String>,
    pub tx_hash: Option<String>,
    pub notified_at: Option<DateTime<Utc>>,
    pub credit_submitted_at: Option<DateTime<Utc>>,
    pub credit_tx_hash: Option<TxHash>,
    pub participation_escrow_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl GuestOrder {
    /// The amount at full precision.
    pub fn amount(&self) -> Result<Decimal, Error> {
        Ok(to_display(
            self.amount_wei,
            self.token_decimals,
            self.token_decimals,
        )?)
    }
}

/// The provider's view of an order.
#[derive(Debug, Clone, PartialEq)]
pub struct WertOrder {
    pub id: Uuid,
    pub order_id: Option<String>,
    pub click_id: String,
    pub reference: Option<String>,
    pub status: OrderStatus,
    pub base: Option<String>,
    pub base_amount: Option<Decimal>,
    pub quote: Option<String>,
    pub quote_amount: Option<Decimal>,
    pub transaction_id: Option<String>,
    pub raw: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Webhook data merged into a [WertOrder]; the status is advanced separately.
#[derive(Debug, Clone, PartialEq)]
pub struct WertOrderUpdate {
    pub order_id: Option<String>,
    pub click_id: Option<String>,
    pub base: Option<String>,
    pub base_amount: Option<Decimal>,
    pub quote: Option<String>,
    pub quote_amount: Option<Decimal>,
    pub transaction_id: Option<String>,
    pub raw: serde_json::Value,
}

/// Provider webhook body.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookPayload {
    #[serde(rename = "type")]
    pub event: String,

    #[serde(default)]
    pub user: Option<WebhookUser>,

    #[serde(default)]
    pub click_id: Option<String>,

    #[serde(default)]
    pub order: Option<WebhookOrder>,
}

impl WebhookPayload {
    /// The client supplied correlation id; the provider echoes it as `user.user_id` on some events.
    pub fn click_id(&self) -> Option<&str> {
        self.click_id
            .as_deref()
            .or_else(|| self.user.as_ref().and_then(|user| user.user_id.as_deref()))
            .filter(|click_id| !click_id.is_empty())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookUser {
    #[serde(default)]
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebhookOrder {
    #[serde(default)]
    pub id: Option<String>,

    #[serde(default)]
    pub transaction_id: Option<String>,

    #[serde(default)]
    pub base: Option<String>,

    #[serde(default)]
    pub base_amount: Option<Decimal>,

    #[serde(default)]
    pub quote: Option<String>,

    #[serde(default)]
    pub quote_amount: Option<Decimal>,
}

/// Request to create a guest order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewGuestOrder {
    pub click_id: String,
    pub email: String,
    pub amount_wei: u128,
    pub campaign_id: Option<CampaignId>,
    pub entries: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Signature present but invalid; nothing was changed.
    Rejected,

    /// No guest order for the correlation ids.
    Unmatched,

    /// Mirror and guest order updated; no notification due.
    Updated,

    /// Both sides confirmed and agree; one claim notification enqueued.
    NotificationEnqueued,

    /// Both sides confirmed but disagree on the amount; crediting withheld.
    Withheld,
}

/// Reconciles provider webhooks against guest orders.
#[derive(Debug, Clone)]
pub struct FiatOnrampReconciler<S> {
    storage: S,
    config: Arc<Config>,
}

impl<S> FiatOnrampReconciler<S>
where
    S: Storage,
{
    pub fn new(storage: S, config: Arc<Config>) -> Self {
        Self { storage, config }
    }

    /// Create a guest order together with its provider mirror in `created`.
    #[trace]
    pub async fn create_guest_order(&self, order: NewGuestOrder) -> Result<GuestOrder, Error> {
        if order.click_id.is_empty() {
            return Err(ValidationError::MalformedWebhook("empty click id".to_string()).into());
        }
        if order.amount_wei == 0 {
            return Err(ValidationError::InvalidAmount.into());
        }
        // The claim token payload is `|` separated.
        if order.email.is_empty() || order.email.contains('|') {
            return Err(ValidationError::InvalidEmail(order.email).into());
        }

        let now = Utc::now();
        let reference = guest_order_ref(&order.click_id, &order.email, order.amount_wei);

        let guest_order = GuestOrder {
            id: Uuid::now_v7(),
            click_id: order.click_id.clone(),
            reference: reference.clone(),
            email: order.email,
            amount_wei: order.amount_wei,
            token_decimals: TOKEN_DECIMALS,
            status: OrderStatus::Created,
            user_id: None,
            campaign_id: order.campaign_id,
            entries: order.entries,
            order_id: None,
            tx_hash: None,
            notified_at: None,
            credit_submitted_at: None,
            credit_tx_hash: None,
            participation_escrow_id: None,
            created_at: now,
            updated_at: now,
        };

        let wert_order = WertOrder {
            id: Uuid::now_v7(),
            order_id: None,
            click_id: order.click_id.clone(),
            reference: Some(reference),
            status: OrderStatus::Created,
            base: None,
            base_amount: None,
            quote: None,
            quote_amount: None,
            transaction_id: None,
            raw: serde_json::Value::Null,
            created_at: now,
            updated_at: now,
        };

        let inserted = self
            .storage
            .insert_guest_order(&guest_order, &wert_order)
            .await?;
        if !inserted {
            return Err(ValidationError::DuplicateClickId(order.click_id).into());
        }

        info!(guest_order_id:% = guest_order.id, click_id:% = guest_order.click_id; "guest order created");

        Ok(guest_order)
    }

    /// Handle a raw webhook body. A signature is only verified when both a secret is configured
    /// and the header is present; unsigned requests are processed.
    pub async fn handle_webhook(
        &self,
        body: &[u8],
        signature: Option<&str>,
    ) -> Result<ReconcileOutcome, Error> {
        match (&self.config.webhook_secret, signature) {
            (Some(secret), Some(signature)) => {
                if !verify_signature(secret.expose_secret().as_bytes(), body, signature) {
                    warn!("invalid webhook signature, ignoring webhook");
                    counter!("settlement_webhooks_total", "event" => "rejected").increment(1);
                    return Ok(ReconcileOutcome::Rejected);
                }
            }

            (Some(_), None) => {
                warn!("unsigned webhook, processing anyway");
            }

            (None, _) => {}
        }

        let raw = serde_json::from_slice::<serde_json::Value>(body)
            .map_err(|error| ValidationError::MalformedWebhook(error.to_string()))?;
        let payload = serde_json::from_value::<WebhookPayload>(raw.clone())
            .map_err(|error| ValidationError::MalformedWebhook(error.to_string()))?;

        self.reconcile(&payload, raw).await
    }

    /// Apply one webhook to the order pair it correlates to.
    #[trace]
    pub async fn reconcile(
        &self,
        payload: &WebhookPayload,
        raw: serde_json::Value,
    ) -> Result<ReconcileOutcome, Error> {
        counter!("settlement_webhooks_total", "event" => payload.event.clone()).increment(1);

        let click_id = payload.click_id();
        let to = OrderStatus::from_event(&payload.event);
        let order = payload.order.clone().unwrap_or_default();
        let order_id = order.id.as_deref().filter(|order_id| !order_id.is_empty());

        if click_id.is_none() && order_id.is_none() {
            let error = ValidationError::MalformedWebhook("missing click id and order id".to_string());
            return Err(error.into());
        }

        debug!(
            click_id:?,
            order_id:?,
            event:% = payload.event,
            status:? = to;
            "reconciling webhook"
        );

        let update = WertOrderUpdate {
            order_id: order_id.map(ToOwned::to_owned),
            click_id: click_id.map(ToOwned::to_owned),
            base: order.base,
            base_amount: order.base_amount,
            quote: order.quote,
            quote_amount: order.quote_amount,
            transaction_id: order.transaction_id.clone(),
            raw,
        };
        let Some(wert_order) = self.storage.upsert_wert_order(&update).await? else {
            return Err(ValidationError::MalformedWebhook(format!(
                "no order for order id {}",
                order_id.unwrap_or_default()
            ))
            .into());
        };

        if let Some(to) = to.filter(|to| wert_order.status.can_advance(*to)) {
            self.storage
                .advance_wert_order_status(wert_order.id, wert_order.status, to)
                .await?;
        }

        let guest_order = match &wert_order.reference {
            Some(reference) => self.storage.get_guest_order_by_ref(reference).await?,
            None => None,
        };
        let guest_order = match guest_order {
            Some(guest_order) => Some(guest_order),
            None => {
                self.storage
                    .get_guest_order_by_click_id(&wert_order.click_id)
                    .await?
            }
        };
        let Some(guest_order) = guest_order else {
            warn!(click_id:% = wert_order.click_id; "no guest order for webhook");
            return Ok(ReconcileOutcome::Unmatched);
        };

        let to = to.filter(|to| *to != OrderStatus::Claimed && guest_order.status.can_advance(*to));
        if let Some(to) = to {
            let advanced = self
                .storage
                .advance_guest_order_status(
                    guest_order.id,
                    guest_order.status,
                    to,
                    order_id,
                    order.transaction_id.as_deref(),
                )
                .await?;
            if advanced {
                info!(
                    guest_order_id:% = guest_order.id,
                    from:% = guest_order.status,
                    to:%;
                    "guest order status advanced"
                );
            }
        }

        let guest_order = self
            .storage
            .get_guest_order(guest_order.id)
            .await?
            .ok_or(ValidationError::UnknownGuestOrder)?;

        self.notify_if_agreed(guest_order).await
    }

    /// Re-scan confirmed guest orders without notification and enqueue the missing ones.
    #[trace]
    pub async fn sweep(&self, limit: usize) -> Result<usize, Error> {
        let guest_orders = self.storage.confirmed_unnotified_guest_orders(limit).await?;

        let mut enqueued = 0;
        for guest_order in guest_orders {
            if self.notify_if_agreed(guest_order).await? == ReconcileOutcome::NotificationEnqueued {
                enqueued += 1;
            }
        }

        if enqueued > 0 {
            info!(enqueued; "sweep enqueued missed claim notifications");
        }

        Ok(enqueued)
    }

    /// Find the provider mirror of the given guest order: by ref first, click id second.
    pub async fn find_wert_order(
        &self,
        guest_order: &GuestOrder,
    ) -> Result<Option<WertOrder>, Error> {
        match self
            .storage
            .get_wert_order_by_ref(&guest_order.reference)
            .await?
        {
            Some(wert_order) => Ok(Some(wert_order)),
            None => Ok(self
                .storage
                .get_wert_order_by_click_id(&guest_order.click_id)
                .await?),
        }
    }

    /// Whether both sides agree the order is confirmed with a matching amount.
    pub fn agreed(&self, guest_order: &GuestOrder, wert_order: &WertOrder) -> Result<bool, Error> {
        if wert_order.status != OrderStatus::Confirmed {
            return Ok(false);
        }

        let Some(base_amount) = wert_order.base_amount else {
            return Ok(false);
        };

        Ok(within_tolerance(
            guest_order.amount()?,
            base_amount,
            self.config.amount_tolerance,
        ))
    }

    async fn notify_if_agreed(&self, guest_order: GuestOrder) -> Result<ReconcileOutcome, Error> {
        if guest_order.status != OrderStatus::Confirmed || guest_order.notified_at.is_some() {
            return Ok(ReconcileOutcome::Updated);
        }

        let Some(wert_order) = self.find_wert_order(&guest_order).await? else {
            return Ok(ReconcileOutcome::Updated);
        };
        if wert_order.status != OrderStatus::Confirmed {
            return Ok(ReconcileOutcome::Updated);
        }

        if !self.agreed(&guest_order, &wert_order)? {
            warn!(
                guest_order_id:% = guest_order.id,
                amount:% = guest_order.amount()?,
                base_amount:? = wert_order.base_amount;
                "guest order and provider order disagree on amount, withholding"
            );
            return Ok(ReconcileOutcome::Withheld);
        }

        let job = NewJob::now(Job::SendClaimNotification {
            guest_order_id: guest_order.id,
        });
        let marked = self
            .storage
            .mark_guest_order_notified(guest_order.id, &job)
            .await?;

        if marked {
            info!(guest_order_id:% = guest_order.id; "claim notification enqueued");
            Ok(ReconcileOutcome::NotificationEnqueued)
        } else {
            Ok(ReconcileOutcome::Updated)
        }
    }
}

/// Hex encoded SHA-256 binding the click id to the order details.
pub fn guest_order_ref(click_id: &str, email: &str, amount_wei: u128) -> String {
    let digest = Sha256::digest(format!("{click_id}|{email}|{amount_wei}"));
    const_hex::encode(digest)
}

/// Verify a hex encoded HMAC-SHA256 signature over the raw body in constant time.
pub fn verify_signature(secret: &[u8], body: &[u8], signature: &str) -> bool {
    let Ok(signature) = const_hex::decode(signature.trim()) else {
        return false;
    };

    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return false;
    };
    mac.update(body);

    mac.verify_slice(&signature).is_ok()
}

#[cfg(test)]
mod tests {
    use crate::{
        domain::{
            Error, Job, NewGuestOrder, OrderStatus, ReconcileOutcome, ValidationError,
            verify_signature, storage::Storage,
        },
        testing::{InMemoryStorage, config, reconciler},
    };
    use assert_matches::assert_matches;
    use hmac::{Hmac, Mac};
    use serde_json::json;
    use sha2::Sha256;

    const ONE: u128 = 1_000_000_000_000_000_000;

    const ALL: [OrderStatus; 5] = [
        OrderStatus::Created,
        OrderStatus::Pending,
        OrderStatus::Confirmed,
        OrderStatus::Failed,
        OrderStatus::Claimed,
    ];

    fn webhook(event: &str, click_id: &str, base_amount: &str) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "type": event,
            "click_id": click_id,
            "user": { "user_id": click_id },
            "order": {
                "id": "order-1",
                "transaction_id": "0xabc",
                "base": "TT",
                "base_amount": base_amount,
                "quote": "USD",
                "quote_amount": "25.00"
            }
        }))
        .unwrap()
    }

    #[test]
    fn test_never_regresses() {
        for from in [OrderStatus::Confirmed, OrderStatus::Claimed] {
            for to in [OrderStatus::Created, OrderStatus::Pending, OrderStatus::Failed] {
                assert!(!from.can_advance(to), "{from} -> {to}");
            }
        }
        for status in ALL {
            assert!(!status.can_advance(status));
            assert!(!OrderStatus::Claimed.can_advance(status));
        }
        assert!(OrderStatus::Failed.can_advance(OrderStatus::Confirmed));
    }

    #[test]
    fn test_from_event() {
        assert_eq!(OrderStatus::from_event("payment_started"), Some(OrderStatus::Pending));
        assert_eq!(OrderStatus::from_event("transfer_started"), Some(OrderStatus::Pending));
        assert_eq!(OrderStatus::from_event("order_complete"), Some(OrderStatus::Confirmed));
        assert_eq!(OrderStatus::from_event("order_canceled"), Some(OrderStatus::Failed));
        assert_eq!(
            OrderStatus::from_event("tx_smart_contract_failed"),
            Some(OrderStatus::Failed)
        );
        assert_eq!(OrderStatus::from_event("something_new"), None);
    }

    #[test]
    fn test_verify_signature() {
        let body = b"{\"type\":\"order_complete\"}";
        let mut mac = Hmac::<Sha256>::new_from_slice(b"secret").unwrap();
        mac.update(body);
        let signature = const_hex::encode(mac.finalize().into_bytes());

        assert!(verify_signature(b"secret", body, &signature));
        assert!(!verify_signature(b"other", body, &signature));
        assert!(!verify_signature(b"secret", b"{}", &signature));
        assert!(!verify_signature(b"secret", body, "not hex"));
    }

    #[tokio::test]
    async fn test_webhook_sequence_and_replay() {
        let storage = InMemoryStorage::default();
        let reconciler = reconciler(storage.clone(), config());

        let guest_order = reconciler
            .create_guest_order(NewGuestOrder {
                click_id: "click-1".to_string(),
                email: "guest@example.com".to_string(),
                amount_wei: 25 * ONE,
                campaign_id: None,
                entries: 0,
            })
            .await
            .unwrap();
        assert_eq!(guest_order.status, OrderStatus::Created);

        let outcome = reconciler
            .handle_webhook(&webhook("payment_started", "click-1", "25"), None)
            .await;
        assert_matches!(outcome, Ok(ReconcileOutcome::Updated));

        let outcome = reconciler
            .handle_webhook(&webhook("order_complete", "click-1", "25"), None)
            .await;
        assert_matches!(outcome, Ok(ReconcileOutcome::NotificationEnqueued));

        // Replays and late events neither regress nor notify twice.
        for event in ["order_complete", "payment_started", "order_failed"] {
            let outcome = reconciler
                .handle_webhook(&webhook(event, "click-1", "25"), None)
                .await;
            assert_matches!(outcome, Ok(ReconcileOutcome::Updated));
        }

        let guest_order = storage.get_guest_order(guest_order.id).await.unwrap().unwrap();
        assert_eq!(guest_order.status, OrderStatus::Confirmed);
        assert_eq!(guest_order.order_id.as_deref(), Some("order-1"));
        assert!(guest_order.notified_at.is_some());

        let notifications = storage
            .queued_jobs()
            .into_iter()
            .filter(|job| matches!(job.job, Job::SendClaimNotification { .. }))
            .count();
        assert_eq!(notifications, 1);

        // The sweep does not enqueue again either.
        assert_matches!(reconciler.sweep(10).await, Ok(0));
    }

    #[tokio::test]
    async fn test_amount_mismatch_withheld() {
        let storage = InMemoryStorage::default();
        let reconciler = reconciler(storage.clone(), config());

        reconciler
            .create_guest_order(NewGuestOrder {
                click_id: "click-2".to_string(),
                email: "guest@example.com".to_string(),
                amount_wei: 25 * ONE,
                campaign_id: None,
                entries: 0,
            })
            .await
            .unwrap();

        let outcome = reconciler
            .handle_webhook(&webhook("order_complete", "click-2", "24.50"), None)
            .await;
        assert_matches!(outcome, Ok(ReconcileOutcome::Withheld));
        assert!(storage.queued_jobs().is_empty());

        // A correcting event releases the notification.
        let outcome = reconciler
            .handle_webhook(&webhook("order_complete", "click-2", "25.00"), None)
            .await;
        assert_matches!(outcome, Ok(ReconcileOutcome::NotificationEnqueued));
    }

    #[tokio::test]
    async fn test_unmatched_and_malformed() {
        let storage = InMemoryStorage::default();
        let reconciler = reconciler(storage, config());

        let outcome = reconciler
            .handle_webhook(&webhook("order_complete", "unknown", "1"), None)
            .await;
        assert_matches!(outcome, Ok(ReconcileOutcome::Unmatched));

        assert!(reconciler.handle_webhook(b"not json", None).await.is_err());
        assert!(
            reconciler
                .handle_webhook(b"{\"type\":\"order_complete\"}", None)
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_correlate_by_order_id() {
        let storage = InMemoryStorage::default();
        let reconciler = reconciler(storage.clone(), config());

        let guest_order = reconciler
            .create_guest_order(NewGuestOrder {
                click_id: "click-4".to_string(),
                email: "guest@example.com".to_string(),
                amount_wei: 25 * ONE,
                campaign_id: None,
                entries: 0,
            })
            .await
            .unwrap();

        let outcome = reconciler
            .handle_webhook(&webhook("payment_started", "click-4", "25"), None)
            .await;
        assert_matches!(outcome, Ok(ReconcileOutcome::Updated));

        // Later events may only carry the provider's order id.
        let body = json!({
            "type": "order_complete",
            "order": { "id": "order-1", "base": "TT", "base_amount": "25" }
        });
        let outcome = reconciler
            .handle_webhook(&serde_json::to_vec(&body).unwrap(), None)
            .await;
        assert_matches!(outcome, Ok(ReconcileOutcome::NotificationEnqueued));

        let guest_order = storage.get_guest_order(guest_order.id).await.unwrap().unwrap();
        assert_eq!(guest_order.status, OrderStatus::Confirmed);

        let wert_order = storage
            .get_wert_order_by_click_id("click-4")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(wert_order.status, OrderStatus::Confirmed);
        assert_eq!(wert_order.order_id.as_deref(), Some("order-1"));

        // An order id nobody has seen cannot be correlated.
        let body = json!({ "type": "order_complete", "order": { "id": "order-9" } });
        let outcome = reconciler
            .handle_webhook(&serde_json::to_vec(&body).unwrap(), None)
            .await;
        assert_matches!(
            outcome,
            Err(Error::Validation(ValidationError::MalformedWebhook(_)))
        );
    }

    #[tokio::test]
    async fn test_duplicate_click_id() {
        let storage = InMemoryStorage::default();
        let reconciler = reconciler(storage, config());

        let order = NewGuestOrder {
            click_id: "click-3".to_string(),
            email: "guest@example.com".to_string(),
            amount_wei: ONE,
            campaign_id: None,
            entries: 0,
        };
        assert!(reconciler.create_guest_order(order.clone()).await.is_ok());
        assert!(reconciler.create_guest_order(order).await.is_err());
    }

    #[tokio::test]
    async fn test_invalid_email() {
        let storage = InMemoryStorage::default();
        let reconciler = reconciler(storage.clone(), config());

        for email in ["", "guest|x@example.com"] {
            let result = reconciler
                .create_guest_order(NewGuestOrder {
                    click_id: "click-5".to_string(),
                    email: email.to_string(),
                    amount_wei: ONE,
                    campaign_id: None,
                    entries: 0,
                })
                .await;
            assert_matches!(
                result,
                Err(Error::Validation(ValidationError::InvalidEmail(_)))
            );
        }
        assert!(storage.get_guest_order_by_click_id("click-5").await.unwrap().is_none());
    }
}
