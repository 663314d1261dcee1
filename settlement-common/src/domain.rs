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

pub mod amount;

mod bytes;

pub use amount::{AmountError, ConversionRate};
pub use bytes::*;

use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};

// Plain bytes: on-chain hashes and addresses.
pub type TxHash = ByteArray<32>;
pub type Address = ByteArray<20>;

/// Amount in token base units (18 decimals).
pub type TokenWei = u128;

/// Amount in credit base units (18 decimals).
pub type CreditsWei = u128;

/// Identifier of a platform user; users are owned by an external service.
#[derive(
    Debug, Display, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, From, Into, Serialize,
    Deserialize,
)]
#[serde(transparent)]
pub struct UserId(pub i64);

/// Identifier of a campaign row; campaigns are owned by an external service.
#[derive(
    Debug, Display, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, From, Into, Serialize,
    Deserialize,
)]
#[serde(transparent)]
pub struct CampaignId(pub i64);

/// Identifier of a campaign in the escrow contract.
#[derive(
    Debug, Display, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, From, Into, Serialize,
    Deserialize,
)]
#[serde(transparent)]
pub struct OnChainCampaignId(pub u64);
