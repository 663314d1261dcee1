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

pub mod storage;

mod batch;
mod campaign;
mod chain;
mod claim;
mod conversion;
mod error;
mod escrow;
mod guest_credit;
mod hold;
mod job;
mod ledger;
mod mailer;
mod onramp;
mod user;
mod withdrawal;

pub use batch::*;
pub use campaign::*;
pub use chain::*;
pub use claim::*;
pub use conversion::*;
pub use error::*;
pub use escrow::*;
pub use guest_credit::*;
pub use hold::*;
pub use job::*;
pub use ledger::*;
pub use mailer::*;
pub use onramp::*;
pub use user::*;
pub use withdrawal::*;

use crate::domain::storage::Storage;
use rust_decimal::Decimal;
use secrecy::SecretString;
use serde::Deserialize;
use settlement_common::domain::Address;
use std::{num::NonZeroUsize, sync::Arc, time::Duration};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Account signing all escrow contract calls.
    pub owner_address: Address,

    /// Maximum number of buyers per release or refund batch.
    pub batch_size: NonZeroUsize,

    pub gas: GasConfig,

    #[serde(with = "humantime_serde")]
    pub receipt_timeout: Duration,

    /// Daily withdrawal cap in fiat; one token per fiat unit.
    pub daily_withdrawal_limit_fiat: Decimal,

    /// Accepted absolute difference between a guest order and its provider order.
    pub amount_tolerance: Decimal,

    pub claim_token_secret: SecretString,

    #[serde(with = "humantime_serde")]
    pub claim_token_ttl: Duration,

    #[serde(with = "humantime_serde")]
    pub claim_credit_delay: Duration,

    pub claim_base_url: String,

    #[serde(default)]
    pub webhook_secret: Option<SecretString>,

    pub retry: RetryConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct GasConfig {
    pub hold_limit: u64,
    pub batch_limit: u64,
    pub withdraw_limit: u64,
    pub deposit_limit: u64,
}

/// All engine components sharing one storage, chain client and config.
#[derive(Debug, Clone)]
pub struct Engine<S, C> {
    pub oracle: ConversionOracle<S, C>,
    pub holds: HoldCoordinator<S, C>,
    pub settlement: BatchSettlementEngine<S, C>,
    pub recorder: LedgerRecorder<S, C>,
    pub withdrawals: WithdrawalGate<S, C>,
    pub onramp: FiatOnrampReconciler<S>,
    pub claims: GuestClaimService<S>,
    pub guest_credits: GuestCreditor<S, C>,
    pub config: Arc<Config>,
}

impl<S, C> Engine<S, C>
where
    S: Storage,
    C: ChainClient,
{
    pub fn new(config: Config, storage: S, chain: C) -> Self {
        let config = Arc::new(config);

        Self {
            oracle: ConversionOracle::new(storage.clone(), chain.clone()),
            holds: HoldCoordinator::new(storage.clone(), chain.clone(), config.clone()),
            settlement: BatchSettlementEngine::new(storage.clone(), chain.clone(), config.clone()),
            recorder: LedgerRecorder::new(storage.clone(), chain.clone()),
            withdrawals: WithdrawalGate::new(storage.clone(), chain.clone(), config.clone()),
            onramp: FiatOnrampReconciler::new(storage.clone(), config.clone()),
            claims: GuestClaimService::new(storage.clone(), config.clone()),
            guest_credits: GuestCreditor::new(storage, chain, config.clone()),
            config,
        }
    }
}
