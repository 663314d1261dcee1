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

use crate::infra::api::AppState;
use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use log::{debug, error, warn};
use metrics::counter;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use settlement_common::domain::{
    AmountError, CampaignId, CreditsWei, UserId,
    amount::{DISPLAY_PLACES, TOKEN_DECIMALS, from_display, to_display},
};
use settlement_engine::domain::{
    ChainClient, ClaimOutcome, ClaimPreview, EscrowRecord, EscrowStatus, Error, GuestOrder,
    LedgerEntry, NewGuestOrder, OrderStatus, TokenError, ValidationError, storage::Storage,
};
use thiserror::Error;
use uuid::Uuid;

/// Header carrying the hex encoded HMAC-SHA256 of the raw webhook body.
pub const SIGNATURE_HEADER: &str = "x-wert-signature";

pub fn make_app<S, C>() -> Router<AppState<S, C>>
where
    S: Storage,
    C: ChainClient,
{
    Router::new()
        .route("/webhooks/wert", post(wert_webhook::<S, C>))
        .route("/claim", get(claim_preview::<S, C>).post(claim::<S, C>))
        .route("/participations", post(participate::<S, C>))
        .route("/withdrawals", post(withdraw::<S, C>))
        .route("/campaigns/{id}/close", post(close_campaign::<S, C>))
        .route("/guest-orders", post(create_guest_order::<S, C>))
}

/// Always acknowledged, also on failures, to keep the provider from retrying.
async fn wert_webhook<S, C>(
    State(state): State<AppState<S, C>>,
    headers: HeaderMap,
    body: Bytes,
) -> Json<Ack>
where
    S: Storage,
    C: ChainClient,
{
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok());

    match state.engine.onramp.handle_webhook(&body, signature).await {
        Ok(outcome) => debug!(outcome:?; "webhook handled"),
        Err(error) => {
            let error = format!("{:#}", anyhow::Error::new(error));
            error!(error; "cannot handle webhook")
        }
    }

    Json(Ack { ok: true })
}

async fn claim_preview<S, C>(
    State(state): State<AppState<S, C>>,
    Query(ClaimQuery { token }): Query<ClaimQuery>,
) -> Result<Json<ClaimPreviewResponse>, ApiError>
where
    S: Storage,
    C: ChainClient,
{
    let preview = state.engine.claims.preview(&token).await?;
    Ok(Json(preview.into()))
}

async fn claim<S, C>(
    State(state): State<AppState<S, C>>,
    Json(request): Json<ClaimRequest>,
) -> Result<Json<ClaimResponse>, ApiError>
where
    S: Storage,
    C: ChainClient,
{
    let ClaimRequest {
        token,
        username,
        password,
    } = request;

    let outcome = state
        .engine
        .claims
        .claim(&token, &username, password.as_deref())
        .await?;

    Ok(Json(outcome.into()))
}

async fn participate<S, C>(
    State(state): State<AppState<S, C>>,
    Json(request): Json<ParticipationRequest>,
) -> Result<(StatusCode, Json<ParticipationResponse>), ApiError>
where
    S: Storage,
    C: ChainClient,
{
    let ParticipationRequest {
        user_id,
        campaign_id,
        quantity,
    } = request;

    let record = state
        .engine
        .holds
        .participate(user_id, campaign_id, quantity)
        .await?;

    Ok((StatusCode::CREATED, Json(record.try_into()?)))
}

async fn withdraw<S, C>(
    State(state): State<AppState<S, C>>,
    Json(request): Json<WithdrawalRequest>,
) -> Result<(StatusCode, Json<WithdrawalResponse>), ApiError>
where
    S: Storage,
    C: ChainClient,
{
    let WithdrawalRequest { user_id, credits } = request;

    let credits_wei = from_display(credits, TOKEN_DECIMALS).map_err(Error::from)?;
    let entry = state
        .engine
        .withdrawals
        .request(user_id, credits_wei)
        .await?;

    Ok((StatusCode::ACCEPTED, Json(entry.into())))
}

async fn close_campaign<S, C>(
    State(state): State<AppState<S, C>>,
    Path(id): Path<i64>,
) -> Result<Json<CloseCampaignResponse>, ApiError>
where
    S: Storage,
    C: ChainClient,
{
    let closed = state.engine.settlement.close_campaign(CampaignId(id)).await?;
    Ok(Json(CloseCampaignResponse { closed }))
}

async fn create_guest_order<S, C>(
    State(state): State<AppState<S, C>>,
    Json(request): Json<GuestOrderRequest>,
) -> Result<(StatusCode, Json<GuestOrderResponse>), ApiError>
where
    S: Storage,
    C: ChainClient,
{
    let GuestOrderRequest {
        click_id,
        email,
        amount,
        campaign_id,
        entries,
    } = request;

    let amount_wei = from_display(amount, TOKEN_DECIMALS).map_err(Error::from)?;
    let guest_order = state
        .engine
        .onramp
        .create_guest_order(NewGuestOrder {
            click_id,
            email,
            amount_wei,
            campaign_id,
            entries,
        })
        .await?;

    Ok((StatusCode::CREATED, Json(guest_order.try_into()?)))
}

#[derive(Debug, Serialize)]
struct Ack {
    ok: bool,
}

#[derive(Debug, Deserialize)]
struct ClaimQuery {
    token: String,
}

#[derive(Debug, Serialize)]
struct ClaimPreviewResponse {
    guest_order_id: Uuid,
    click_id: String,
    email: String,
    amount: Decimal,
    status: OrderStatus,
}

impl From<ClaimPreview> for ClaimPreviewResponse {
    fn from(preview: ClaimPreview) -> Self {
        Self {
            guest_order_id: preview.guest_order_id,
            click_id: preview.click_id,
            email: preview.email,
            amount: preview.amount,
            status: preview.status,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ClaimRequest {
    token: String,
    username: String,

    #[serde(default)]
    password: Option<String>,
}

#[derive(Debug, Serialize)]
struct ClaimResponse {
    guest_order_id: Uuid,
    user_id: UserId,
    user_created: bool,
    credit_job_id: Uuid,
}

impl From<ClaimOutcome> for ClaimResponse {
    fn from(outcome: ClaimOutcome) -> Self {
        Self {
            guest_order_id: outcome.guest_order_id,
            user_id: outcome.user_id,
            user_created: outcome.user_created,
            credit_job_id: outcome.credit_job_id,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ParticipationRequest {
    user_id: UserId,
    campaign_id: CampaignId,
    quantity: u64,
}

#[derive(Debug, Serialize)]
struct ParticipationResponse {
    escrow_id: Uuid,
    status: EscrowStatus,
    quantity: u64,
    tt_amount: Decimal,
    credit_amount: Decimal,
}

impl TryFrom<EscrowRecord> for ParticipationResponse {
    type Error = AmountError;

    fn try_from(record: EscrowRecord) -> Result<Self, Self::Error> {
        Ok(Self {
            escrow_id: record.id,
            status: record.status,
            quantity: record.quantity,
            tt_amount: to_display(record.tt_amount_wei, TOKEN_DECIMALS, DISPLAY_PLACES)?,
            credit_amount: to_display(record.credit_amount_wei, TOKEN_DECIMALS, DISPLAY_PLACES)?,
        })
    }
}

#[derive(Debug, Deserialize)]
struct WithdrawalRequest {
    user_id: UserId,

    /// Display amount of credits.
    credits: Decimal,
}

#[derive(Debug, Serialize)]
struct WithdrawalResponse {
    reservation_id: Uuid,
    credits: Decimal,
    tt_amount: Decimal,
}

impl From<LedgerEntry> for WithdrawalResponse {
    fn from(entry: LedgerEntry) -> Self {
        Self {
            reservation_id: entry.id,
            credits: entry.credits_delta.abs(),
            tt_amount: entry.tt_amount,
        }
    }
}

#[derive(Debug, Serialize)]
struct CloseCampaignResponse {
    closed: bool,
}

#[derive(Debug, Deserialize)]
struct GuestOrderRequest {
    click_id: String,
    email: String,

    /// Display amount of tokens.
    amount: Decimal,

    #[serde(default)]
    campaign_id: Option<CampaignId>,

    #[serde(default)]
    entries: u64,
}

#[derive(Debug, Serialize)]
struct GuestOrderResponse {
    id: Uuid,
    click_id: String,
    #[serde(rename = "ref")]
    reference: String,
    amount: Decimal,
    status: OrderStatus,
}

impl TryFrom<GuestOrder> for GuestOrderResponse {
    type Error = Error;

    fn try_from(guest_order: GuestOrder) -> Result<Self, Self::Error> {
        Ok(Self {
            amount: guest_order.amount()?,
            id: guest_order.id,
            click_id: guest_order.click_id,
            reference: guest_order.reference,
            status: guest_order.status,
        })
    }
}

/// Engine errors mapped onto HTTP responses.
#[derive(Debug, Error)]
#[error(transparent)]
pub struct ApiError(#[from] Error);

impl From<AmountError> for ApiError {
    fn from(error: AmountError) -> Self {
        Self(error.into())
    }
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match &self.0 {
            Error::Validation(error) => match error {
                ValidationError::Token(TokenError::Expired) => StatusCode::GONE,

                ValidationError::UnknownCampaign(_)
                | ValidationError::UnknownUser(_)
                | ValidationError::UnknownGuestOrder => StatusCode::NOT_FOUND,

                ValidationError::OrderNotConfirmed(_)
                | ValidationError::AlreadyClaimed(_)
                | ValidationError::DuplicateClickId(_)
                | ValidationError::UsernameTaken(_) => StatusCode::CONFLICT,

                ValidationError::DailyLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,

                ValidationError::WrongPassword => StatusCode::UNAUTHORIZED,

                ValidationError::NotVerified(_) => StatusCode::FORBIDDEN,

                _ => StatusCode::BAD_REQUEST,
            },

            Error::Amount(_) => StatusCode::BAD_REQUEST,

            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_code(&self) -> &'static str {
        match &self.0 {
            Error::Validation(ValidationError::DailyLimitExceeded { .. }) => "DAILY_LIMIT_EXCEEDED",
            Error::Validation(ValidationError::Token(_)) => "INVALID_TOKEN",
            Error::Validation(ValidationError::NotVerified(_)) => "NOT_VERIFIED",
            Error::Validation(_) | Error::Amount(_) => "VALIDATION_ERROR",
            _ => "INTERNAL_ERROR",
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    code: &'static str,
    message: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    limit: Option<Decimal>,

    #[serde(skip_serializing_if = "Option::is_none")]
    remaining: Option<Decimal>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.error_code();
        counter!("settlement_api_errors_total", "status" => status.as_u16().to_string())
            .increment(1);

        let (limit, remaining) = match &self.0 {
            Error::Validation(ValidationError::DailyLimitExceeded {
                limit, remaining, ..
            }) => (display_credits(*limit), display_credits(*remaining)),
            _ => (None, None),
        };

        let message = if status.is_server_error() {
            let error = format!("{:#}", anyhow::Error::new(self.0));
            error!(error; "cannot handle request");
            "internal error".to_string()
        } else {
            warn!(error:% = self.0; "rejecting request");
            self.0.to_string()
        };

        let body = ErrorResponse {
            code,
            message,
            limit,
            remaining,
        };

        (status, Json(body)).into_response()
    }
}

fn display_credits(credits_wei: CreditsWei) -> Option<Decimal> {
    to_display(credits_wei, TOKEN_DECIMALS, DISPLAY_PLACES).ok()
}

#[cfg(test)]
mod tests {
    use crate::infra::api::{
        AppState,
        v1::{ApiError, SIGNATURE_HEADER, make_app},
    };
    use axum::{
        Router,
        body::{Body, to_bytes},
        http::{Request, StatusCode},
        response::Response,
    };
    use assert_matches::assert_matches;
    use fake::Fake;
    use serde_json::{Value, json};
    use settlement_common::domain::{CampaignId, UserId};
    use settlement_engine::{
        domain::{
            Engine, Error, EscrowStatus, Job, OrderStatus, TokenError, ValidationError,
            storage::Storage,
        },
        testing::{FakeChain, InMemoryStorage, campaign, config, user},
    };
    use std::time::Duration;
    use tower::ServiceExt;
    use uuid::Uuid;

    fn app(storage: &InMemoryStorage, chain: &FakeChain) -> Router {
        let engine = Engine::new(config(), storage.clone(), chain.clone());
        make_app().with_state(AppState { engine, db: None })
    }

    async fn send(app: Router, method: &str, uri: &str, body: Option<Value>) -> Response {
        let request = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => request
                .header("content-type", "application/json")
                .body(Body::from(serde_json::to_vec(&body).unwrap())),
            None => request.body(Body::empty()),
        };

        app.oneshot(request.unwrap()).await.unwrap()
    }

    async fn json_body(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn webhook(event: &str, click_id: &str, base_amount: &str) -> Value {
        json!({
            "type": event,
            "click_id": click_id,
            "order": {
                "id": "order-1",
                "transaction_id": "0xabc",
                "base": "TT",
                "base_amount": base_amount
            }
        })
    }

    #[tokio::test]
    async fn test_webhook_always_acknowledged() {
        let storage = InMemoryStorage::default();
        let chain = FakeChain::default();

        let response = app(&storage, &chain)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/webhooks/wert")
                    .header(SIGNATURE_HEADER, "deadbeef")
                    .body(Body::from("not json"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await, json!({ "ok": true }));

        // Unknown click id.
        let response = send(
            app(&storage, &chain),
            "POST",
            "/webhooks/wert",
            Some(webhook("order_complete", "unknown", "25")),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await, json!({ "ok": true }));
    }

    #[tokio::test]
    async fn test_guest_order_and_claim() {
        let storage = InMemoryStorage::default();
        let chain = FakeChain::default();

        let request = json!({
            "click_id": "click-1",
            "email": "guest@example.com",
            "amount": "25"
        });
        let response = send(app(&storage, &chain), "POST", "/guest-orders", Some(request.clone())).await;
        assert_eq!(response.status(), StatusCode::CREATED);
        let body = json_body(response).await;
        assert_eq!(body["status"], "created");
        assert_eq!(body["amount"], "25.00");
        assert_eq!(body["ref"].as_str().map(str::len), Some(64));

        let response = send(app(&storage, &chain), "POST", "/guest-orders", Some(request)).await;
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let engine = Engine::new(config(), storage.clone(), chain.clone());
        let token = engine.claims.tokenizer().issue(
            "click-1",
            "guest@example.com",
            Duration::from_secs(60),
        );

        let uri = format!("/claim?token={token}");
        let response = send(app(&storage, &chain), "GET", &uri, None).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["click_id"], "click-1");
        assert_eq!(body["status"], "created");

        // Not yet confirmed.
        let claim = json!({ "token": token, "username": "guest", "password": "secret" });
        let response = send(app(&storage, &chain), "POST", "/claim", Some(claim.clone())).await;
        assert_eq!(response.status(), StatusCode::CONFLICT);

        for event in ["payment_started", "order_complete"] {
            let response = send(
                app(&storage, &chain),
                "POST",
                "/webhooks/wert",
                Some(webhook(event, "click-1", "25")),
            )
            .await;
            assert_eq!(response.status(), StatusCode::OK);
        }

        let response = send(app(&storage, &chain), "POST", "/claim", Some(claim.clone())).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["user_created"], true);

        let guest_order = storage
            .get_guest_order_by_click_id("click-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(guest_order.status, OrderStatus::Claimed);
        assert!(
            storage
                .queued_jobs()
                .iter()
                .any(|job| matches!(job.job, Job::CreditGuestOrder { .. }))
        );

        let response = send(app(&storage, &chain), "POST", "/claim", Some(claim)).await;
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_expired_claim_token() {
        let storage = InMemoryStorage::default();
        let chain = FakeChain::default();

        let engine = Engine::new(config(), storage.clone(), chain.clone());
        let token = engine
            .claims
            .tokenizer()
            .issue_until("click-1", "guest@example.com", 1);

        let uri = format!("/claim?token={token}");
        let response = send(app(&storage, &chain), "GET", &uri, None).await;
        assert_eq!(response.status(), StatusCode::GONE);

        let response = send(app(&storage, &chain), "GET", "/claim?token=garbage", None).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["code"], "INVALID_TOKEN");
    }

    #[tokio::test]
    async fn test_participate() {
        let storage = InMemoryStorage::default();
        let chain = FakeChain::default();
        chain.set_conversion_rate(100);
        storage.add_user(user(UserId(1), "alice"));
        storage.add_campaign(campaign(CampaignId(7), 10));

        let quantity = (1..5u64).fake::<u64>();
        let request = json!({ "user_id": 1, "campaign_id": 7, "quantity": quantity });
        let response = send(app(&storage, &chain), "POST", "/participations", Some(request)).await;
        assert_eq!(response.status(), StatusCode::CREATED);
        let body = json_body(response).await;
        assert_eq!(body["status"], "held");
        assert_eq!(body["quantity"], quantity);

        let records = storage.escrow_records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, EscrowStatus::Held);
        assert_eq!(records[0].quantity, quantity);

        let request = json!({ "user_id": 1, "campaign_id": 8, "quantity": 1 });
        let response = send(app(&storage, &chain), "POST", "/participations", Some(request)).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let request = json!({ "user_id": 1, "campaign_id": 7, "quantity": 0 });
        let response = send(app(&storage, &chain), "POST", "/participations", Some(request)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_withdraw_daily_limit() {
        let storage = InMemoryStorage::default();
        let chain = FakeChain::default();
        chain.set_conversion_rate(100);
        storage.add_user(user(UserId(1), "alice"));
        storage.verify_user(UserId(1));

        // 1000 fiat at 100 credits per token.
        let request = json!({ "user_id": 1, "credits": "60000" });
        let response = send(app(&storage, &chain), "POST", "/withdrawals", Some(request)).await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let body = json_body(response).await;
        assert_eq!(body["credits"], "60000.00");
        assert_eq!(body["tt_amount"], "600.00");

        // The verified session was used up by the first withdrawal.
        let request = json!({ "user_id": 1, "credits": "50000" });
        let response = send(app(&storage, &chain), "POST", "/withdrawals", Some(request)).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(json_body(response).await["code"], "NOT_VERIFIED");

        storage.verify_user(UserId(1));
        let request = json!({ "user_id": 1, "credits": "50000" });
        let response = send(app(&storage, &chain), "POST", "/withdrawals", Some(request)).await;
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let body = json_body(response).await;
        assert_eq!(body["code"], "DAILY_LIMIT_EXCEEDED");
        assert_eq!(body["remaining"], "40000.00");
        assert_eq!(body["limit"], "100000.00");

        let request = json!({ "user_id": 2, "credits": "1" });
        let response = send(app(&storage, &chain), "POST", "/withdrawals", Some(request)).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let request = json!({ "user_id": 1, "credits": "-1" });
        let response = send(app(&storage, &chain), "POST", "/withdrawals", Some(request)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_status_code() {
        let error = ApiError::from(Error::from(ValidationError::NotVerified(UserId(1))));
        assert_eq!(error.status_code(), StatusCode::FORBIDDEN);
        assert_matches!(error.error_code(), "NOT_VERIFIED");

        let error = ApiError::from(Error::from(ValidationError::Token(TokenError::Expired)));
        assert_eq!(error.status_code(), StatusCode::GONE);
        assert_matches!(error.error_code(), "INVALID_TOKEN");

        let error = ApiError::from(Error::from(ValidationError::InvalidEmail("a|b".to_owned())));
        assert_eq!(error.status_code(), StatusCode::BAD_REQUEST);

        let error = ApiError::from(Error::from(ValidationError::AlreadyClaimed(Uuid::nil())));
        assert_eq!(error.status_code(), StatusCode::CONFLICT);

        let error = ApiError::from(Error::from(ValidationError::DailyLimitExceeded {
            limit: 2,
            used: 1,
            remaining: 1,
            requested: 2,
        }));
        assert_eq!(error.status_code(), StatusCode::TOO_MANY_REQUESTS);
        assert_matches!(error.error_code(), "DAILY_LIMIT_EXCEEDED");
    }

    #[tokio::test]
    async fn test_close_campaign() {
        let storage = InMemoryStorage::default();
        let chain = FakeChain::default();
        storage.add_campaign(campaign(CampaignId(7), 10));

        let response = send(app(&storage, &chain), "POST", "/campaigns/7/close", None).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await, json!({ "closed": true }));

        let response = send(app(&storage, &chain), "POST", "/campaigns/7/close", None).await;
        assert_eq!(json_body(response).await, json!({ "closed": false }));

        let response = send(app(&storage, &chain), "POST", "/campaigns/8/close", None).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
