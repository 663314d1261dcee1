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

use serde::{Deserialize, Serialize};
use serde_with::{DisplayFromStr, serde_as};
use settlement_common::{
    domain::{Address, ByteArray, CreditsWei, OnChainCampaignId, TokenWei, TxHash, UserId},
    error::BoxError,
};
use std::time::Duration;
use thiserror::Error;

/// Chain client abstraction: signing, submission and receipt retrieval are owned by an external
/// collaborator.
#[trait_variant::make(Send)]
pub trait ChainClient
where
    Self: Clone + Send + Sync + 'static,
{
    /// Get the token and credit balances held for the given user.
    async fn get_balances(&self, user_id: UserId) -> Result<Balances, ChainError>;

    /// Get the buyers which still have holds for the given campaign.
    async fn campaign_buyers(&self, campaign: OnChainCampaignId)
    -> Result<Vec<UserId>, ChainError>;

    /// Get the next nonce for the given signing address.
    async fn pending_nonce(&self, address: Address) -> Result<u64, ChainError>;

    /// Sign and submit the given contract call, returning the transaction hash.
    async fn submit(&self, call: &ContractCall, params: &TxParams) -> Result<TxHash, ChainError>;

    /// Wait until the given transaction is mined. Returns [ChainError::Reverted] for a failed and
    /// [ChainError::Timeout] for a not yet mined transaction after the given timeout.
    async fn wait_receipt(&self, tx_hash: TxHash, timeout: Duration)
    -> Result<Receipt, ChainError>;

    /// Get the receipt of the given transaction if mined.
    async fn get_receipt(&self, tx_hash: TxHash) -> Result<Option<Receipt>, ChainError>;

    /// Decode the escrow contract events of the given receipt.
    async fn decode_events(&self, receipt: &Receipt) -> Result<Vec<ContractEvent>, ChainError>;

    /// Get the current credits per token conversion rate.
    async fn current_conversion_rate(&self) -> Result<u128, ChainError>;
}

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("transaction {0} not yet mined")]
    NotMined(TxHash),

    #[error("timeout waiting for transaction {0}")]
    Timeout(TxHash),

    #[error("transaction {0} reverted")]
    Reverted(TxHash),

    #[error("contract call rejected: {0}")]
    Rejected(String),

    #[error("chain RPC failed")]
    Rpc(#[source] BoxError),
}

#[serde_as]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Balances {
    #[serde_as(as = "DisplayFromStr")]
    pub token_wei: TokenWei,

    #[serde_as(as = "DisplayFromStr")]
    pub credits_wei: CreditsWei,
}

/// Escrow contract calls.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "function", rename_all = "snake_case")]
pub enum ContractCall {
    Hold {
        campaign: OnChainCampaignId,
        buyer: UserId,
        #[serde_as(as = "DisplayFromStr")]
        tt_amount_wei: TokenWei,
        #[serde_as(as = "DisplayFromStr")]
        credit_amount_wei: CreditsWei,
    },

    ReleaseBatch {
        campaign: OnChainCampaignId,
        buyers: Vec<UserId>,
    },

    RefundBatch {
        campaign: OnChainCampaignId,
        buyers: Vec<UserId>,
    },

    /// Burns the credits and pays out the tokens in one call.
    Withdraw {
        user: UserId,
        #[serde_as(as = "DisplayFromStr")]
        credits_wei: CreditsWei,
        #[serde_as(as = "DisplayFromStr")]
        tt_amount_wei: TokenWei,
    },

    /// Credits tokens bought through the fiat on-ramp.
    Deposit {
        user: UserId,
        #[serde_as(as = "DisplayFromStr")]
        tt_amount_wei: TokenWei,
        #[serde_as(as = "DisplayFromStr")]
        credits_wei: CreditsWei,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxParams {
    pub from: Address,
    pub nonce: Option<u64>,
    pub gas_limit: u64,
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub tx_hash: TxHash,
    pub block_number: u64,
    #[serde_as(as = "DisplayFromStr")]
    pub gas_used: u128,
    #[serde_as(as = "DisplayFromStr")]
    pub effective_gas_price: u128,
    pub from: Address,
    pub to: Option<Address>,
    pub success: bool,
    #[serde(default)]
    pub logs: Vec<Log>,
}

impl Receipt {
    /// Gas cost in token base units.
    pub fn gas_cost_wei(&self) -> TokenWei {
        self.gas_used.saturating_mul(self.effective_gas_price)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Log {
    pub address: Address,
    pub topics: Vec<ByteArray<32>>,
    pub data: String,
}

/// Decoded escrow contract events carrying the exact on-chain integers.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum ContractEvent {
    HoldCreated {
        campaign: OnChainCampaignId,
        buyer: UserId,
        #[serde_as(as = "DisplayFromStr")]
        tt_amount_wei: TokenWei,
        #[serde_as(as = "DisplayFromStr")]
        credit_amount_wei: CreditsWei,
    },

    HoldReleased {
        campaign: OnChainCampaignId,
        buyer: UserId,
        #[serde_as(as = "DisplayFromStr")]
        tt_amount_wei: TokenWei,
        #[serde_as(as = "DisplayFromStr")]
        credit_amount_wei: CreditsWei,
    },

    HoldRefunded {
        campaign: OnChainCampaignId,
        buyer: UserId,
        #[serde_as(as = "DisplayFromStr")]
        tt_amount_wei: TokenWei,
        #[serde_as(as = "DisplayFromStr")]
        credit_amount_wei: CreditsWei,
    },

    Withdrawn {
        user: UserId,
        #[serde_as(as = "DisplayFromStr")]
        tt_amount_wei: TokenWei,
        #[serde_as(as = "DisplayFromStr")]
        credits_wei: CreditsWei,
    },

    Deposited {
        user: UserId,
        #[serde_as(as = "DisplayFromStr")]
        tt_amount_wei: TokenWei,
        #[serde_as(as = "DisplayFromStr")]
        credits_wei: CreditsWei,
    },
}
