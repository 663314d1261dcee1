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

use crate::domain::{EscrowStatus, TxType};
use chrono::{DateTime, Utc};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use settlement_common::domain::{CampaignId, CreditsWei, OnChainCampaignId, UserId};
use sqlx::Type;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Campaign {
    pub id: CampaignId,
    pub influencer_id: UserId,
    pub on_chain_campaign_id: OnChainCampaignId,
    pub unit_price_credits_wei: CreditsWei,
    pub goal_quantity: u64,
    pub sold_quantity: u64,
    pub deadline: DateTime<Utc>,
    pub refund_on_deadline: bool,
    pub status: CampaignStatus,
    pub settlement_policy: Option<SettlementOutcome>,
}

impl Campaign {
    /// Refund if configured to and the sales goal was not met, release otherwise.
    pub fn settlement_outcome(&self) -> SettlementOutcome {
        if self.refund_on_deadline && self.sold_quantity < self.goal_quantity {
            SettlementOutcome::Refund
        } else {
            SettlementOutcome::Release
        }
    }

    pub fn accepts_participations(&self, now: DateTime<Utc>) -> bool {
        self.status == CampaignStatus::Open && now < self.deadline
    }
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Type)]
#[sqlx(type_name = "CAMPAIGN_STATUS", rename_all = "snake_case")]
pub enum CampaignStatus {
    Open,
    Closed,
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "SETTLEMENT_OUTCOME", rename_all = "snake_case")]
pub enum SettlementOutcome {
    Release,
    Refund,
}

impl SettlementOutcome {
    pub fn escrow_status(self) -> EscrowStatus {
        match self {
            SettlementOutcome::Release => EscrowStatus::Released,
            SettlementOutcome::Refund => EscrowStatus::Refunded,
        }
    }

    pub fn tx_type(self) -> TxType {
        match self {
            SettlementOutcome::Release => TxType::Release,
            SettlementOutcome::Refund => TxType::Refund,
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::testing::campaign;
    use crate::domain::SettlementOutcome;
    use settlement_common::domain::CampaignId;

    #[test]
    fn test_settlement_outcome() {
        let mut campaign = campaign(CampaignId(1), 10);
        campaign.goal_quantity = 100;
        campaign.sold_quantity = 100;
        campaign.refund_on_deadline = true;
        assert_eq!(campaign.settlement_outcome(), SettlementOutcome::Release);

        campaign.sold_quantity = 99;
        assert_eq!(campaign.settlement_outcome(), SettlementOutcome::Refund);

        campaign.refund_on_deadline = false;
        assert_eq!(campaign.settlement_outcome(), SettlementOutcome::Release);
    }
}
