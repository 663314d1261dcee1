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

//! Signed, time-boxed claim tokens and the claim flow attaching a guest order to an account.

use crate::domain::{
    Config, Error, GuestOrder, Job, JobError, Mail, Mailer, NewJob, NewUser, OrderStatus, User,
    ValidationError, storage::Storage,
};
use argon2::{
    Argon2, PasswordHash, PasswordHasher, PasswordVerifier,
    password_hash::{SaltString, rand_core::OsRng},
};
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::Utc;
use fastrace::trace;
use hmac::{Hmac, Mac};
use log::{debug, info};
use rust_decimal::Decimal;
use secrecy::{ExposeSecret, SecretString};
use settlement_common::domain::UserId;
use sha2::Sha256;
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("malformed token")]
    Malformed,

    #[error("invalid token signature")]
    InvalidSignature,

    #[error("token expired")]
    Expired,
}

/// The verified content of a claim token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimToken {
    pub click_id: String,
    pub email: String,

    /// Expiry as unix timestamp in seconds.
    pub exp: i64,
}

/// Issues and verifies `base64url(payload) + "." + hex(hmac_sha256(payload))` tokens with payload
/// `click_id|email|exp`.
#[derive(Debug, Clone)]
pub struct GuestClaimTokenizer {
    secret: SecretString,
}

impl GuestClaimTokenizer {
    pub fn new(secret: SecretString) -> Self {
        Self { secret }
    }

    pub fn issue(&self, click_id: &str, email: &str, ttl: Duration) -> String {
        let ttl = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);
        self.issue_until(click_id, email, Utc::now().timestamp().saturating_add(ttl))
    }

    pub fn issue_until(&self, click_id: &str, email: &str, exp: i64) -> String {
        let payload = format!("{click_id}|{email}|{exp}");
        let signature = const_hex::encode(self.sign(payload.as_bytes()));

        format!("{}.{signature}", URL_SAFE_NO_PAD.encode(payload))
    }

    pub fn verify(&self, token: &str) -> Result<ClaimToken, TokenError> {
        self.verify_at(token, Utc::now().timestamp())
    }

    /// Verify the signature in constant time first, the expiry second.
    pub fn verify_at(&self, token: &str, now: i64) -> Result<ClaimToken, TokenError> {
        let (payload, signature) = token.split_once('.').ok_or(TokenError::Malformed)?;
        let payload = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|_| TokenError::Malformed)?;
        let signature = const_hex::decode(signature).map_err(|_| TokenError::Malformed)?;

        let mut mac = self.mac();
        mac.update(&payload);
        mac.verify_slice(&signature)
            .map_err(|_| TokenError::InvalidSignature)?;

        let payload = String::from_utf8(payload).map_err(|_| TokenError::Malformed)?;
        let mut parts = payload.rsplitn(3, '|');
        let exp = parts
            .next()
            .and_then(|exp| exp.parse::<i64>().ok())
            .ok_or(TokenError::Malformed)?;
        let email = parts.next().ok_or(TokenError::Malformed)?;
        let click_id = parts.next().ok_or(TokenError::Malformed)?;

        if now >= exp {
            return Err(TokenError::Expired);
        }

        Ok(ClaimToken {
            click_id: click_id.to_owned(),
            email: email.to_owned(),
            exp,
        })
    }

    fn sign(&self, payload: &[u8]) -> Vec<u8> {
        let mut mac = self.mac();
        mac.update(payload);
        mac.finalize().into_bytes().to_vec()
    }

    fn mac(&self) -> HmacSha256 {
        HmacSha256::new_from_slice(self.secret.expose_secret().as_bytes())
            .unwrap_or_else(|_| unreachable!("HMAC accepts keys of any length"))
    }
}

/// Sends the claim link once a guest order is confirmed.
#[derive(Debug, Clone)]
pub struct ClaimNotifier<S, M> {
    storage: S,
    mailer: M,
    tokenizer: GuestClaimTokenizer,
    config: Arc<Config>,
}

impl<S, M> ClaimNotifier<S, M>
where
    S: Storage,
    M: Mailer,
{
    pub fn new(storage: S, mailer: M, config: Arc<Config>) -> Self {
        Self {
            storage,
            mailer,
            tokenizer: GuestClaimTokenizer::new(config.claim_token_secret.clone()),
            config,
        }
    }

    #[trace]
    pub async fn notify(&self, guest_order_id: Uuid) -> Result<(), JobError> {
        let guest_order = self
            .storage
            .get_guest_order(guest_order_id)
            .await?
            .ok_or(JobError::Terminal(ValidationError::UnknownGuestOrder.into()))?;

        if guest_order.status != OrderStatus::Confirmed {
            debug!(guest_order_id:%, status:% = guest_order.status; "skipping claim notification");
            return Ok(());
        }

        let token = self.tokenizer.issue(
            &guest_order.click_id,
            &guest_order.email,
            self.config.claim_token_ttl,
        );
        let mail = Mail {
            to: guest_order.email.clone(),
            subject: "Claim your purchase".to_string(),
            body: format!(
                "Your purchase of {} tokens is confirmed. Claim it at {}?token={token}",
                guest_order.amount().map_err(JobError::Terminal)?,
                self.config.claim_base_url,
            ),
        };

        self.mailer
            .send(&mail)
            .await
            .map_err(|error| JobError::Retryable(Error::Mail(error)))?;

        info!(guest_order_id:%; "claim notification sent");

        Ok(())
    }
}

/// What a claim link shows before claiming.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimPreview {
    pub guest_order_id: Uuid,
    pub click_id: String,
    pub email: String,
    pub amount: Decimal,
    pub status: OrderStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimOutcome {
    pub guest_order_id: Uuid,
    pub user_id: UserId,
    pub user_created: bool,
    pub credit_job_id: Uuid,
}

/// Attaches a confirmed guest order to a new or existing account.
#[derive(Debug, Clone)]
pub struct GuestClaimService<S> {
    storage: S,
    tokenizer: GuestClaimTokenizer,
    config: Arc<Config>,
}

impl<S> GuestClaimService<S>
where
    S: Storage,
{
    pub fn new(storage: S, config: Arc<Config>) -> Self {
        Self {
            storage,
            tokenizer: GuestClaimTokenizer::new(config.claim_token_secret.clone()),
            config,
        }
    }

    pub fn tokenizer(&self) -> &GuestClaimTokenizer {
        &self.tokenizer
    }

    #[trace]
    pub async fn preview(&self, token: &str) -> Result<ClaimPreview, Error> {
        let guest_order = self.guest_order(token).await?;

        Ok(ClaimPreview {
            guest_order_id: guest_order.id,
            amount: guest_order.amount()?,
            click_id: guest_order.click_id,
            email: guest_order.email,
            status: guest_order.status,
        })
    }

    /// Claim the guest order of the given token for the given username. An existing account must
    /// carry the token's email and, if it has a usable password, the matching password; a new
    /// account requires a password. Crediting is scheduled after a short delay.
    #[trace]
    pub async fn claim(
        &self,
        token: &str,
        username: &str,
        password: Option<&str>,
    ) -> Result<ClaimOutcome, Error> {
        let guest_order = self.guest_order(token).await?;

        match guest_order.status {
            OrderStatus::Confirmed => {}
            OrderStatus::Claimed => {
                return Err(ValidationError::AlreadyClaimed(guest_order.id).into());
            }
            _ => return Err(ValidationError::OrderNotConfirmed(guest_order.id).into()),
        }

        let password = password.filter(|password| !password.is_empty());

        let (user, user_created) = match self.storage.find_user_by_username(username).await? {
            Some(user) => (self.attach(user, &guest_order, password).await?, false),

            None => {
                let password = password.ok_or(ValidationError::PasswordRequired)?;
                let new_user = NewUser {
                    username: username.to_owned(),
                    email: guest_order.email.clone(),
                    password_hash: Some(hash_password(password)?),
                };
                let user = self
                    .storage
                    .create_user(&new_user)
                    .await?
                    .ok_or_else(|| ValidationError::UsernameTaken(username.to_owned()))?;
                (user, true)
            }
        };

        let job = NewJob::delayed(
            Job::CreditGuestOrder {
                guest_order_id: guest_order.id,
            },
            self.config.claim_credit_delay,
        );
        let claimed = self
            .storage
            .claim_guest_order(guest_order.id, user.id, &job)
            .await?;
        if !claimed {
            return Err(ValidationError::AlreadyClaimed(guest_order.id).into());
        }

        info!(
            guest_order_id:% = guest_order.id,
            user_id:% = user.id,
            user_created;
            "guest order claimed"
        );

        Ok(ClaimOutcome {
            guest_order_id: guest_order.id,
            user_id: user.id,
            user_created,
            credit_job_id: job.id,
        })
    }

    async fn guest_order(&self, token: &str) -> Result<GuestOrder, Error> {
        let token = self
            .tokenizer
            .verify(token)
            .map_err(ValidationError::Token)?;

        let guest_order = self
            .storage
            .get_guest_order_by_click_id(&token.click_id)
            .await?
            .ok_or(ValidationError::UnknownGuestOrder)?;

        if !guest_order.email.eq_ignore_ascii_case(&token.email) {
            return Err(ValidationError::Token(TokenError::InvalidSignature).into());
        }

        Ok(guest_order)
    }

    async fn attach(
        &self,
        user: User,
        guest_order: &GuestOrder,
        password: Option<&str>,
    ) -> Result<User, Error> {
        if !user.email.eq_ignore_ascii_case(&guest_order.email) {
            return Err(ValidationError::UsernameTaken(user.username).into());
        }

        match (&user.password_hash, password) {
            (Some(hash), password) if user.has_usable_password() => {
                let password = password.ok_or(ValidationError::PasswordRequired)?;
                if !verify_password(hash, password) {
                    return Err(ValidationError::WrongPassword.into());
                }
            }

            (_, Some(password)) => {
                self.storage
                    .set_user_password(user.id, &hash_password(password)?)
                    .await?;
            }

            (_, None) => {}
        }

        Ok(user)
    }
}

pub fn hash_password(password: &str) -> Result<String, Error> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|error| Error::PasswordHash(error.to_string()))?;
    Ok(hash.to_string())
}

pub fn verify_password(hash: &str, password: &str) -> bool {
    PasswordHash::new(hash)
        .map(|hash| {
            Argon2::default()
                .verify_password(password.as_bytes(), &hash)
                .is_ok()
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use crate::{
        domain::{
            ClaimNotifier, Error, GuestClaimService, GuestClaimTokenizer, Job, NewGuestOrder,
            OrderStatus, TokenError, ValidationError, hash_password, storage::Storage,
            verify_password,
        },
        testing::{InMemoryStorage, RecordingMailer, config, reconciler, user},
    };
    use assert_matches::assert_matches;
    use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
    use chrono::Utc;
    use rust_decimal::Decimal;
    use secrecy::SecretString;
    use serde_json::json;
    use settlement_common::domain::UserId;
    use std::{sync::Arc, time::Duration};

    const ONE: u128 = 1_000_000_000_000_000_000;

    fn tokenizer() -> GuestClaimTokenizer {
        GuestClaimTokenizer::new(SecretString::from("secret"))
    }

    #[test]
    fn test_issue_verify() {
        let tokenizer = tokenizer();
        let token = tokenizer.issue("click-1", "guest@example.com", Duration::from_secs(60));

        assert_matches!(
            tokenizer.verify(&token),
            Ok(claim) if claim.click_id == "click-1" && claim.email == "guest@example.com"
        );

        let other = GuestClaimTokenizer::new(SecretString::from("other"));
        assert_matches!(other.verify(&token), Err(TokenError::InvalidSignature));
    }

    #[test]
    fn test_tampered_payload() {
        let tokenizer = tokenizer();
        let exp = Utc::now().timestamp() + 60;
        let token = tokenizer.issue_until("click-1", "guest@example.com", exp);
        let (_, signature) = token.split_once('.').unwrap();

        let payload = URL_SAFE_NO_PAD.encode(format!("click-1|attacker@example.com|{exp}"));
        let tampered = format!("{payload}.{signature}");
        assert_matches!(tokenizer.verify(&tampered), Err(TokenError::InvalidSignature));

        assert_matches!(tokenizer.verify("no-dot"), Err(TokenError::Malformed));
        assert_matches!(tokenizer.verify("!!.00"), Err(TokenError::Malformed));
    }

    #[test]
    fn test_expired() {
        let tokenizer = tokenizer();
        let token = tokenizer.issue_until("click-1", "guest@example.com", 1_000);

        assert_matches!(tokenizer.verify_at(&token, 999), Ok(_));
        assert_matches!(tokenizer.verify_at(&token, 1_000), Err(TokenError::Expired));
        assert_matches!(tokenizer.verify(&token), Err(TokenError::Expired));
    }

    #[test]
    fn test_click_id_with_separator() {
        let tokenizer = tokenizer();
        let token = tokenizer.issue("a|b", "guest@example.com", Duration::from_secs(60));
        assert_matches!(tokenizer.verify(&token), Ok(claim) if claim.click_id == "a|b");
    }

    #[test]
    fn test_password() {
        let hash = hash_password("hunter2").unwrap();
        assert!(verify_password(&hash, "hunter2"));
        assert!(!verify_password(&hash, "hunter3"));
        assert!(!verify_password("not a hash", "hunter2"));
    }

    /// A guest order confirmed by both sides, returning its claim token.
    async fn confirmed_guest_order(storage: &InMemoryStorage) -> String {
        let reconciler = reconciler(storage.clone(), config());
        reconciler
            .create_guest_order(NewGuestOrder {
                click_id: "click-1".to_string(),
                email: "guest@example.com".to_string(),
                amount_wei: 25 * ONE,
                campaign_id: None,
                entries: 0,
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

        tokenizer().issue("click-1", "guest@example.com", Duration::from_secs(60))
    }

    #[tokio::test]
    async fn test_notify() {
        let storage = InMemoryStorage::default();
        confirmed_guest_order(&storage).await;

        let guest_order_id = storage
            .queued_jobs()
            .into_iter()
            .find_map(|job| match job.job {
                Job::SendClaimNotification { guest_order_id } => Some(guest_order_id),
                _ => None,
            })
            .unwrap();

        let mailer = RecordingMailer::default();
        let notifier = ClaimNotifier::new(storage, mailer.clone(), Arc::new(config()));
        notifier.notify(guest_order_id).await.unwrap();

        let mails = mailer.sent();
        assert_eq!(mails.len(), 1);
        assert_eq!(mails[0].to, "guest@example.com");

        let token = mails[0].body.split("?token=").nth(1).unwrap();
        assert_matches!(
            tokenizer().verify(token),
            Ok(claim) if claim.click_id == "click-1"
        );
    }

    #[tokio::test]
    async fn test_claim_new_user() {
        let storage = InMemoryStorage::default();
        let token = confirmed_guest_order(&storage).await;
        let claims = GuestClaimService::new(storage.clone(), Arc::new(config()));

        let preview = claims.preview(&token).await.unwrap();
        assert_eq!(preview.status, OrderStatus::Confirmed);
        assert_eq!(preview.amount, Decimal::from(25));

        assert_matches!(
            claims.claim(&token, "guest", None).await,
            Err(Error::Validation(ValidationError::PasswordRequired))
        );

        let outcome = claims.claim(&token, "guest", Some("hunter2")).await.unwrap();
        assert!(outcome.user_created);

        let guest_order = storage
            .get_guest_order(outcome.guest_order_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(guest_order.status, OrderStatus::Claimed);
        assert_eq!(guest_order.user_id, Some(outcome.user_id));

        let credit_job = storage
            .queued_jobs()
            .into_iter()
            .find(|job| job.id == outcome.credit_job_id)
            .unwrap();
        assert!(credit_job.run_at > Utc::now());

        assert_matches!(
            claims.claim(&token, "guest", Some("hunter2")).await,
            Err(Error::Validation(ValidationError::AlreadyClaimed(_)))
        );
    }

    #[tokio::test]
    async fn test_claim_existing_user() {
        let storage = InMemoryStorage::default();
        let token = confirmed_guest_order(&storage).await;
        let claims = GuestClaimService::new(storage.clone(), Arc::new(config()));

        let mut taken = user(UserId(1), "taken");
        taken.email = "someone@example.com".to_string();
        storage.add_user(taken);
        assert_matches!(
            claims.claim(&token, "taken", Some("pw")).await,
            Err(Error::Validation(ValidationError::UsernameTaken(_)))
        );

        let mut existing = user(UserId(2), "guest");
        existing.email = "guest@example.com".to_string();
        existing.password_hash = Some(hash_password("hunter2").unwrap());
        storage.add_user(existing);
        assert_matches!(
            claims.claim(&token, "guest", None).await,
            Err(Error::Validation(ValidationError::PasswordRequired))
        );
        assert_matches!(
            claims.claim(&token, "guest", Some("wrong")).await,
            Err(Error::Validation(ValidationError::WrongPassword))
        );

        let outcome = claims.claim(&token, "guest", Some("hunter2")).await.unwrap();
        assert_eq!(outcome.user_id, UserId(2));
        assert!(!outcome.user_created);
    }

    #[tokio::test]
    async fn test_claim_existing_user_without_password() {
        let storage = InMemoryStorage::default();
        let token = confirmed_guest_order(&storage).await;
        let claims = GuestClaimService::new(storage.clone(), Arc::new(config()));

        let mut existing = user(UserId(3), "guest");
        existing.email = "guest@example.com".to_string();
        existing.password_hash = None;
        storage.add_user(existing);

        let outcome = claims.claim(&token, "guest", None).await.unwrap();
        assert_eq!(outcome.user_id, UserId(3));
    }
}
