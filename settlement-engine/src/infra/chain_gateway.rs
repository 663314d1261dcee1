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
    Balances, ChainClient, ChainError, ContractCall, ContractEvent, Receipt, TxParams,
};
use fastrace::trace;
use log::debug;
use reqwest::{Client as HttpClient, Response, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_with::{DisplayFromStr, serde_as};
use settlement_common::domain::{Address, OnChainCampaignId, TxHash, UserId};
use std::time::Duration;
use thiserror::Error;
use tokio::time::{Instant, sleep};

/// Config for the signer gateway.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub url: String,

    pub api_key: SecretString,

    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,

    #[serde(with = "humantime_serde")]
    pub receipt_poll_interval: Duration,
}

/// A [ChainClient] implementation talking HTTP/JSON to a signer gateway which owns the keys of
/// the escrow contract owner.
#[derive(Debug, Clone)]
pub struct ChainGateway {
    http: HttpClient,
    url: String,
    api_key: SecretString,
    receipt_poll_interval: Duration,
}

impl ChainGateway {
    pub fn new(config: Config) -> Result<Self, ChainGatewayError> {
        let Config {
            url,
            api_key,
            request_timeout,
            receipt_poll_interval,
        } = config;

        let http = HttpClient::builder()
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .timeout(request_timeout)
            .build()
            .map_err(ChainGatewayError::Client)?;

        Ok(Self {
            http,
            url: url.trim_end_matches('/').to_owned(),
            api_key,
            receipt_poll_interval,
        })
    }

    async fn get<T>(&self, path: &str) -> Result<Option<T>, ChainError>
    where
        T: DeserializeOwned,
    {
        let response = self
            .http
            .get(format!("{}{path}", self.url))
            .bearer_auth(self.api_key.expose_secret())
            .send()
            .await
            .map_err(|error| ChainError::Rpc(error.into()))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        json(check(path, response).await?).await.map(Some)
    }

    async fn post<B, T>(&self, path: &str, body: &B) -> Result<T, ChainError>
    where
        B: Serialize,
        T: DeserializeOwned,
    {
        let response = self
            .http
            .post(format!("{}{path}", self.url))
            .bearer_auth(self.api_key.expose_secret())
            .json(body)
            .send()
            .await
            .map_err(|error| ChainError::Rpc(error.into()))?;

        json(check(path, response).await?).await
    }
}

impl ChainClient for ChainGateway {
    #[trace(properties = { "user_id": "{user_id}" })]
    async fn get_balances(&self, user_id: UserId) -> Result<Balances, ChainError> {
        let path = format!("/v1/users/{user_id}/balances");
        self.get(&path)
            .await?
            .ok_or_else(|| ChainError::Rpc(format!("no balances for user {user_id}").into()))
    }

    #[trace(properties = { "campaign": "{campaign}" })]
    async fn campaign_buyers(
        &self,
        campaign: OnChainCampaignId,
    ) -> Result<Vec<UserId>, ChainError> {
        let path = format!("/v1/campaigns/{campaign}/buyers");
        let buyers = self.get::<Vec<UserId>>(&path).await?;

        Ok(buyers.unwrap_or_default())
    }

    #[trace(properties = { "address": "{address}" })]
    async fn pending_nonce(&self, address: Address) -> Result<u64, ChainError> {
        let path = format!("/v1/accounts/{address}/nonce");
        let NonceResponse { nonce } = self
            .get(&path)
            .await?
            .ok_or_else(|| ChainError::Rpc(format!("no nonce for {address}").into()))?;

        Ok(nonce)
    }

    #[trace]
    async fn submit(&self, call: &ContractCall, params: &TxParams) -> Result<TxHash, ChainError> {
        let request = SubmitRequest { call, params };
        let SubmitResponse { tx_hash } = self.post("/v1/transactions", &request).await?;
        debug!(tx_hash:%; "transaction submitted");

        Ok(tx_hash)
    }

    #[trace(properties = { "tx_hash": "{tx_hash}" })]
    async fn wait_receipt(
        &self,
        tx_hash: TxHash,
        timeout: Duration,
    ) -> Result<Receipt, ChainError> {
        let deadline = Instant::now() + timeout;

        loop {
            match self.get_receipt(tx_hash).await? {
                Some(receipt) if receipt.success => return Ok(receipt),
                Some(_) => return Err(ChainError::Reverted(tx_hash)),
                None if Instant::now() >= deadline => return Err(ChainError::Timeout(tx_hash)),
                None => sleep(self.receipt_poll_interval).await,
            }
        }
    }

    #[trace(properties = { "tx_hash": "{tx_hash}" })]
    async fn get_receipt(&self, tx_hash: TxHash) -> Result<Option<Receipt>, ChainError> {
        let path = format!("/v1/transactions/{tx_hash}/receipt");
        self.get(&path).await
    }

    #[trace]
    async fn decode_events(&self, receipt: &Receipt) -> Result<Vec<ContractEvent>, ChainError> {
        self.post("/v1/events/decode", receipt).await
    }

    #[trace]
    async fn current_conversion_rate(&self) -> Result<u128, ChainError> {
        let ConversionRateResponse { rate_wei } = self
            .get("/v1/conversion-rate")
            .await?
            .ok_or_else(|| ChainError::Rpc("no conversion rate".into()))?;

        Ok(rate_wei)
    }
}

/// Error possibly returned by [ChainGateway::new].
#[derive(Debug, Error)]
pub enum ChainGatewayError {
    #[error("cannot create HTTP client")]
    Client(#[source] reqwest::Error),
}

#[derive(Debug, Serialize)]
struct SubmitRequest<'a> {
    call: &'a ContractCall,
    params: &'a TxParams,
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    tx_hash: TxHash,
}

#[derive(Debug, Deserialize)]
struct NonceResponse {
    nonce: u64,
}

#[serde_as]
#[derive(Debug, Deserialize)]
struct ConversionRateResponse {
    #[serde_as(as = "DisplayFromStr")]
    rate_wei: u128,
}

/// Client errors are rejections of the call itself, anything else is a transport failure.
async fn check(path: &str, response: Response) -> Result<Response, ChainError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let text = response.text().await.unwrap_or_default();
    if status.is_client_error() {
        Err(ChainError::Rejected(format!("{path}: {status} {text}")))
    } else {
        Err(ChainError::Rpc(format!("{path}: {status} {text}").into()))
    }
}

async fn json<T>(response: Response) -> Result<T, ChainError>
where
    T: DeserializeOwned,
{
    response
        .json()
        .await
        .map_err(|error| ChainError::Rpc(error.into()))
}

#[cfg(test)]
mod tests {
    use crate::{
        domain::{ContractCall, TxParams},
        infra::chain_gateway::{ConversionRateResponse, SubmitRequest, SubmitResponse},
    };
    use serde_json::json;
    use settlement_common::domain::{Address, OnChainCampaignId, TxHash, UserId};

    #[test]
    fn test_submit_request() {
        let call = ContractCall::Hold {
            campaign: OnChainCampaignId(7),
            buyer: UserId(42),
            tt_amount_wei: 1_000_000_000_000_000_000,
            credit_amount_wei: 10_000_000_000_000_000_000,
        };
        let params = TxParams {
            from: Address::from([0xaa; 20]),
            nonce: Some(3),
            gas_limit: 200_000,
        };

        let request = serde_json::to_value(SubmitRequest {
            call: &call,
            params: &params,
        })
        .unwrap();
        assert_eq!(
            request,
            json!({
                "call": {
                    "function": "hold",
                    "campaign": 7,
                    "buyer": 42,
                    "tt_amount_wei": "1000000000000000000",
                    "credit_amount_wei": "10000000000000000000"
                },
                "params": {
                    "from": format!("0x{}", "aa".repeat(20)),
                    "nonce": 3,
                    "gas_limit": 200000
                }
            })
        );
    }

    #[test]
    fn test_responses() {
        let tx_hash = format!("0x{}", "01".repeat(32));
        let response =
            serde_json::from_value::<SubmitResponse>(json!({ "tx_hash": tx_hash })).unwrap();
        assert_eq!(response.tx_hash, TxHash::from([1; 32]));

        // Exceeds the range of JSON numbers.
        let response = serde_json::from_value::<ConversionRateResponse>(
            json!({ "rate_wei": "340282366920938463463374607431768211455" }),
        )
        .unwrap();
        assert_eq!(response.rate_wei, u128::MAX);
    }
}
