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

use crate::domain::{ChainError, TokenError};
use settlement_common::{
    domain::{AmountError, CampaignId, CreditsWei, TokenWei, UserId},
    error::BoxError,
};
use thiserror::Error;
use uuid::Uuid;

/// Engine error taxonomy.
#[derive(Debug, Error)]
pub enum Error {
    #[error("validation failed")]
    Validation(#[from] ValidationError),

    #[error("chain failure")]
    Chain(#[from] ChainError),

    #[error("reconciliation mismatch: {0}")]
    Mismatch(String),

    #[error("storage failure")]
    Storage(#[from] sqlx::Error),

    #[error("amount conversion failed")]
    Amount(#[from] AmountError),

    #[error("cannot send mail")]
    Mail(#[source] BoxError),

    #[error("cannot hash password")]
    PasswordHash(String),
}

/// Failures surfaced immediately to the caller and never retried.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error(
        "insufficient balance: required {required_token_wei} token wei and \
         {required_credits_wei} credits wei, available {available_token_wei} token wei and \
         {available_credits_wei} credits wei"
    )]
    InsufficientBalance {
        required_token_wei: TokenWei,
        required_credits_wei: CreditsWei,
        available_token_wei: TokenWei,
        available_credits_wei: CreditsWei,
    },

    #[error("daily withdrawal limit of {limit} credits wei exceeded, remaining {remaining}")]
    DailyLimitExceeded {
        limit: CreditsWei,
        used: CreditsWei,
        remaining: CreditsWei,
        requested: CreditsWei,
    },

    #[error("unknown campaign {0}")]
    UnknownCampaign(CampaignId),

    #[error("campaign {0} is closed")]
    CampaignClosed(CampaignId),

    #[error("unknown user {0}")]
    UnknownUser(UserId),

    #[error("user {0} has no verified session")]
    NotVerified(UserId),

    #[error("quantity must be positive")]
    InvalidQuantity,

    #[error("amount must be positive")]
    InvalidAmount,

    #[error("invalid email {0}")]
    InvalidEmail(String),

    #[error("invalid conversion rate {0}")]
    InvalidRate(u128),

    #[error("malformed webhook: {0}")]
    MalformedWebhook(String),

    #[error("invalid webhook signature")]
    InvalidSignature,

    #[error("invalid claim token")]
    Token(#[from] TokenError),

    #[error("unknown guest order")]
    UnknownGuestOrder,

    #[error("guest order {0} is not confirmed")]
    OrderNotConfirmed(Uuid),

    #[error("guest order {0} is already claimed")]
    AlreadyClaimed(Uuid),

    #[error("duplicate guest order click id {0}")]
    DuplicateClickId(String),

    #[error("username {0} is taken")]
    UsernameTaken(String),

    #[error("password required")]
    PasswordRequired,

    #[error("wrong password")]
    WrongPassword,
}

/// Outcome of a job execution that did not succeed; the retry middleware decides based on the
/// variant whether to reschedule.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("retryable job failure")]
    Retryable(#[source] Error),

    #[error("terminal job failure")]
    Terminal(#[source] Error),
}

impl JobError {
    pub fn retryable(error: impl Into<Error>) -> Self {
        Self::Retryable(error.into())
    }

    pub fn terminal(error: impl Into<Error>) -> Self {
        Self::Terminal(error.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }
}

/// Default classification for jobs: transient chain failures and storage errors are retried,
/// everything else is terminal. Handlers override this where a job has stricter rules.
impl From<Error> for JobError {
    fn from(error: Error) -> Self {
        match error {
            Error::Chain(ChainError::NotMined(_) | ChainError::Timeout(_) | ChainError::Rpc(_))
            | Error::Storage(_)
            | Error::Mail(_) => Self::Retryable(error),

            _ => Self::Terminal(error),
        }
    }
}

impl From<sqlx::Error> for JobError {
    fn from(error: sqlx::Error) -> Self {
        Self::Retryable(error.into())
    }
}

impl From<ChainError> for JobError {
    fn from(error: ChainError) -> Self {
        Error::from(error).into()
    }
}
