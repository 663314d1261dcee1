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

use crate::domain::{RecordRequest, SettlementOutcome};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use settlement_common::domain::CampaignId;
use sqlx::Type;
use std::time::Duration;
use uuid::Uuid;

/// Background work; each variant is persisted as a tagged JSON payload in the job queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Job {
    /// Check balances and submit the on-chain hold for an escrow record.
    SubmitHold { escrow_id: Uuid },

    /// Release or refund all holds of a closed campaign in batches.
    SettleCampaign {
        campaign_id: CampaignId,
        outcome: SettlementOutcome,
    },

    /// Write the canonical ledger row for a mined transaction.
    RecordTransaction(RecordRequest),

    /// Burn the reserved credits and pay out tokens.
    ProcessWithdrawal { reservation_id: Uuid },

    /// Issue a claim token and email the claim link to a guest.
    SendClaimNotification { guest_order_id: Uuid },

    /// Credit a claimed guest order on chain.
    CreditGuestOrder { guest_order_id: Uuid },
}

impl Job {
    pub fn kind(&self) -> JobKind {
        match self {
            Job::SubmitHold { .. } => JobKind::SubmitHold,
            Job::SettleCampaign { .. } => JobKind::SettleCampaign,
            Job::RecordTransaction(_) => JobKind::RecordTransaction,
            Job::ProcessWithdrawal { .. } => JobKind::ProcessWithdrawal,
            Job::SendClaimNotification { .. } => JobKind::SendClaimNotification,
            Job::CreditGuestOrder { .. } => JobKind::CreditGuestOrder,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    SubmitHold,
    SettleCampaign,
    RecordTransaction,
    ProcessWithdrawal,
    SendClaimNotification,
    CreditGuestOrder,
}

impl JobKind {
    pub fn as_str(self) -> &'static str {
        match self {
            JobKind::SubmitHold => "submit_hold",
            JobKind::SettleCampaign => "settle_campaign",
            JobKind::RecordTransaction => "record_transaction",
            JobKind::ProcessWithdrawal => "process_withdrawal",
            JobKind::SendClaimNotification => "send_claim_notification",
            JobKind::CreditGuestOrder => "credit_guest_order",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Type)]
#[sqlx(type_name = "JOB_STATUS", rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

/// A job to be enqueued, visible to workers not before `run_at`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewJob {
    pub id: Uuid,
    pub job: Job,
    pub run_at: DateTime<Utc>,
}

impl NewJob {
    pub fn now(job: Job) -> Self {
        Self {
            id: Uuid::now_v7(),
            job,
            run_at: Utc::now(),
        }
    }

    pub fn delayed(job: Job, delay: Duration) -> Self {
        let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
        let run_at = Utc::now()
            .checked_add_signed(delay)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        Self {
            id: Uuid::now_v7(),
            job,
            run_at,
        }
    }
}

/// A job claimed by a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRecord {
    pub id: Uuid,
    pub job: Job,

    /// Number of attempts including the current one.
    pub attempts: u32,
}

/// Bounded attempts with fixed backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,

    #[serde(with = "humantime_serde")]
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

/// Retry policies per job kind; jobs without a dedicated policy use `default`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct RetryConfig {
    pub default: RetryPolicy,
    pub ledger_recorder: RetryPolicy,
    pub guest_credit: RetryPolicy,
}

impl RetryConfig {
    pub fn policy(&self, kind: JobKind) -> RetryPolicy {
        match kind {
            JobKind::RecordTransaction => self.ledger_recorder,
            JobKind::CreditGuestOrder => self.guest_credit,
            _ => self.default,
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::domain::{Job, JobKind, RecordRequest, RetryPolicy, SettlementOutcome, TxType};
    use assert_matches::assert_matches;
    use settlement_common::domain::{CampaignId, TxHash, UserId};
    use std::time::Duration;

    #[test]
    fn test_job_payload() {
        let job = Job::SettleCampaign {
            campaign_id: CampaignId(7),
            outcome: SettlementOutcome::Refund,
        };
        let json = serde_json::to_value(&job).unwrap();
        assert_eq!(json["kind"], "settle_campaign");
        assert_eq!(json["outcome"], "refund");
        assert_eq!(job.kind().as_str(), "settle_campaign");

        let job = Job::RecordTransaction(RecordRequest {
            tx_hash: TxHash::from([1; 32]),
            user_id: UserId(1),
            campaign_id: None,
            tx_type: TxType::Withdraw,
            tt_amount_wei: u128::MAX,
            credits_delta_wei: -1,
            reservation_id: None,
        });
        let json = serde_json::to_string(&job).unwrap();
        assert!(json.contains(&u128::MAX.to_string()));
        assert_matches!(serde_json::from_str::<Job>(&json), Ok(j) if j == job);
        assert_eq!(job.kind(), JobKind::RecordTransaction);
    }

    #[test]
    fn test_retry_policy() {
        let policy = RetryPolicy {
            max_attempts: 3,
            backoff: Duration::from_secs(1),
        };
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
    }
}
