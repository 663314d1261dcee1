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
    ChainClient, ChainError, Config, ContractCall, ConversionOracle, Error, Job, JobError,
    LedgerEntry, LedgerStatus, NewJob, RecordRequest, TxParams, TxType, ValidationError,
    credits_delta, storage::Storage,
};
use chrono::{NaiveDate, Utc};
use fastrace::trace;
use log::{debug, info, warn};
use settlement_common::domain::{
    AmountError, CreditsWei, UserId,
    amount::{TOKEN_DECIMALS, credits_to_token_wei, from_display},
};
use std::sync::Arc;
use uuid::Uuid;

/// Result of atomically checking the daily cap and reserving a withdrawal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reservation {
    Reserved,
    Exceeded { used: CreditsWei },
    NotVerified,
    UnknownUser,
}

/// Enforces the daily withdrawal cap before credits are burned for a payout.
#[derive(Debug, Clone)]
pub struct WithdrawalGate<S, C> {
    storage: S,
    chain: C,
    oracle: ConversionOracle<S, C>,
    config: Arc<Config>,
}

impl<S, C> WithdrawalGate<S, C>
where
    S: Storage,
    C: ChainClient,
{
    pub fn new(storage: S, chain: C, config: Arc<Config>) -> Self {
        Self {
            oracle: ConversionOracle::new(storage.clone(), chain.clone()),
            storage,
            chain,
            config,
        }
    }

    /// The daily cap in credits: the fiat cap at the live rate, one token per fiat unit.
    pub async fn daily_limit(&self) -> Result<CreditsWei, Error> {
        let rate = self.oracle.current().await?;
        let limit_token_wei =
            from_display(self.config.daily_withdrawal_limit_fiat, TOKEN_DECIMALS)?;

        let limit = limit_token_wei
            .checked_mul(rate.get())
            .ok_or(AmountError::Overflow("daily_limit"))?;
        Ok(limit)
    }

    /// Check the daily cap for the given day and reserve the withdrawal as a `pending` ledger row
    /// which counts against the cap right away. The user must hold a verified session; its
    /// one-time flags are cleared together with the reservation, which also enqueues the payout.
    #[trace]
    pub async fn check_and_reserve(
        &self,
        user_id: UserId,
        credits_wei: CreditsWei,
        day: NaiveDate,
    ) -> Result<LedgerEntry, Error> {
        if credits_wei == 0 {
            return Err(ValidationError::InvalidAmount.into());
        }

        let rate = self.oracle.current().await?;
        let limit = self.daily_limit().await?;
        let tt_amount_wei = credits_to_token_wei(credits_wei, rate);

        let entry = LedgerEntry::pending(
            TxType::Withdraw,
            user_id,
            None,
            tt_amount_wei,
            credits_delta(credits_wei, true)?,
        )?;
        let job = NewJob::now(Job::ProcessWithdrawal {
            reservation_id: entry.id,
        });

        match self
            .storage
            .reserve_withdrawal(&entry, day, limit, &job)
            .await?
        {
            Reservation::Reserved => {
                info!(
                    user_id:%,
                    reservation_id:% = entry.id,
                    credits_wei,
                    tt_amount_wei;
                    "withdrawal reserved"
                );
                Ok(entry)
            }

            Reservation::Exceeded { used } => {
                warn!(
                    user_id:%,
                    limit,
                    used,
                    requested = credits_wei;
                    "daily withdrawal limit exceeded"
                );
                Err(ValidationError::DailyLimitExceeded {
                    limit,
                    used,
                    remaining: limit.saturating_sub(used),
                    requested: credits_wei,
                }
                .into())
            }

            Reservation::NotVerified => {
                warn!(user_id:%; "withdrawal without verified session");
                Err(ValidationError::NotVerified(user_id).into())
            }

            Reservation::UnknownUser => Err(ValidationError::UnknownUser(user_id).into()),
        }
    }

    /// Like [WithdrawalGate::check_and_reserve] for today (UTC).
    pub async fn request(
        &self,
        user_id: UserId,
        credits_wei: CreditsWei,
    ) -> Result<LedgerEntry, Error> {
        self.check_and_reserve(user_id, credits_wei, Utc::now().date_naive())
            .await
    }

    /// Burn the reserved credits and pay out tokens, then record the ledger row.
    #[trace]
    pub async fn process(&self, reservation_id: Uuid) -> Result<(), JobError> {
        let entry = self
            .storage
            .get_ledger_entry(TxType::Withdraw, reservation_id)
            .await?
            .ok_or_else(|| {
                JobError::terminal(Error::Mismatch(format!(
                    "unknown withdrawal reservation {reservation_id}"
                )))
            })?;

        if entry.status != LedgerStatus::Pending {
            debug!(reservation_id:%, status:% = entry.status; "withdrawal already processed");
            return Ok(());
        }

        let credits_wei = entry.credits_delta_wei.unsigned_abs();

        let tx_hash = match entry.tx_hash {
            Some(tx_hash) => tx_hash,

            None => {
                let call = ContractCall::Withdraw {
                    user: entry.user_id,
                    credits_wei,
                    tt_amount_wei: entry.tt_amount_wei,
                };
                let params = TxParams {
                    from: self.config.owner_address,
                    nonce: None,
                    gas_limit: self.config.gas.withdraw_limit,
                };

                let tx_hash = match self.chain.submit(&call, &params).await {
                    Ok(tx_hash) => tx_hash,

                    Err(error @ (ChainError::Reverted(_) | ChainError::Rejected(_))) => {
                        self.storage.fail_reservation(reservation_id).await?;
                        return Err(JobError::terminal(error));
                    }

                    Err(error) => return Err(error.into()),
                };

                self.storage
                    .set_reservation_tx_hash(reservation_id, tx_hash)
                    .await?;
                tx_hash
            }
        };

        match self
            .chain
            .wait_receipt(tx_hash, self.config.receipt_timeout)
            .await
        {
            Ok(receipt) if receipt.success => {}

            Ok(_) | Err(ChainError::Reverted(_)) => {
                self.storage.fail_reservation(reservation_id).await?;
                warn!(reservation_id:%, tx_hash:%; "withdrawal reverted, reservation released");
                return Err(JobError::terminal(ChainError::Reverted(tx_hash)));
            }

            Err(error) => return Err(JobError::retryable(error)),
        }

        let job = NewJob::now(Job::RecordTransaction(RecordRequest {
            tx_hash,
            user_id: entry.user_id,
            campaign_id: None,
            tx_type: TxType::Withdraw,
            tt_amount_wei: entry.tt_amount_wei,
            credits_delta_wei: entry.credits_delta_wei,
            reservation_id: Some(reservation_id),
        }));
        self.storage.enqueue_job(&job).await?;

        info!(reservation_id:%, tx_hash:%; "withdrawal mined");

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        domain::{
            ContractCall, Error, Job, LedgerRecorder, LedgerStatus, TxType, ValidationError,
            WithdrawalGate, storage::Storage,
        },
        testing::{FakeChain, InMemoryStorage, config, user},
    };
    use assert_matches::assert_matches;
    use chrono::{NaiveDate, Utc};
    use fake::Fake;
    use rust_decimal::Decimal;
    use settlement_common::domain::UserId;
    use std::sync::Arc;

    const ONE: u128 = 1_000_000_000_000_000_000;

    fn setup() -> (InMemoryStorage, FakeChain, WithdrawalGate<InMemoryStorage, FakeChain>) {
        let storage = InMemoryStorage::default();
        let mut fan = user(UserId(1), "fan");
        fan.email_verified = true;
        fan.phone_verified = true;
        storage.add_user(fan);

        let chain = FakeChain::default();
        chain.set_conversion_rate(10);

        // 500 in fiat at 10 credits per token is 5000 credits.
        let mut config = config();
        config.daily_withdrawal_limit_fiat = Decimal::from(500);
        let gate = WithdrawalGate::new(storage.clone(), chain.clone(), Arc::new(config));

        (storage, chain, gate)
    }

    #[tokio::test]
    async fn test_daily_limit_exceeded() {
        let (storage, _, gate) = setup();

        assert_matches!(gate.daily_limit().await, Ok(limit) if limit == 5000 * ONE);

        let result = gate.request(UserId(1), 6000 * ONE).await;
        assert_matches!(
            result,
            Err(Error::Validation(ValidationError::DailyLimitExceeded {
                limit,
                used,
                remaining,
                requested,
            })) if limit == 5000 * ONE
                && used == 0
                && remaining == 5000 * ONE
                && requested == 6000 * ONE
        );
        assert!(storage.ledger_entries().is_empty());
    }

    #[tokio::test]
    async fn test_pending_counts_against_cap() {
        let (storage, _, gate) = setup();

        let entry = gate.request(UserId(1), 3000 * ONE).await.unwrap();
        assert_eq!(entry.status, LedgerStatus::Pending);
        assert_eq!(entry.tt_amount_wei, 300 * ONE);
        assert_eq!(entry.credits_delta, Decimal::from(-3000));

        // Verification flags are single use.
        let fan = storage.get_user(UserId(1)).await.unwrap().unwrap();
        assert!(!fan.email_verified && !fan.phone_verified);

        storage.verify_user(UserId(1));
        let result = gate.request(UserId(1), 2500 * ONE).await;
        assert_matches!(
            result,
            Err(Error::Validation(ValidationError::DailyLimitExceeded { used, remaining, .. }))
                if used == 3000 * ONE && remaining == 2000 * ONE
        );

        // A rejected request leaves the session verified.
        assert!(gate.request(UserId(1), 2000 * ONE).await.is_ok());

        // Another day has its own cap.
        storage.verify_user(UserId(1));
        let tomorrow = Utc::now().date_naive().succ_opt().unwrap();
        assert!(gate.check_and_reserve(UserId(1), 5000 * ONE, tomorrow).await.is_ok());

        storage.verify_user(UserId(1));
        let other_day = NaiveDate::from_ymd_opt(2020, 1, 1).unwrap();
        assert!(gate.check_and_reserve(UserId(1), 6000 * ONE, other_day).await.is_err());
    }

    #[tokio::test]
    async fn test_process_and_record() {
        let (storage, chain, gate) = setup();

        let entry = gate.request(UserId(1), 1000 * ONE).await.unwrap();
        gate.process(entry.id).await.unwrap();
        // Retry does not submit twice.
        gate.process(entry.id).await.unwrap();

        assert_matches!(
            chain.submitted().as_slice(),
            [ContractCall::Withdraw { credits_wei, tt_amount_wei, .. }]
                if *credits_wei == 1000 * ONE && *tt_amount_wei == 100 * ONE
        );

        let recorder = LedgerRecorder::new(storage.clone(), chain.clone());
        for job in storage.queued_jobs() {
            if let Job::RecordTransaction(request) = job.job {
                recorder.record(&request).await.unwrap();
            }
        }

        let entries = storage.ledger_entries();
        assert_matches!(
            entries.as_slice(),
            [entry] if entry.status == LedgerStatus::Completed
                && entry.tx_type == TxType::Withdraw
                && entry.tx_hash.is_some()
                && entry.block_number.is_some()
        );
    }

    #[tokio::test]
    async fn test_revert_releases_reservation() {
        let (storage, chain, gate) = setup();

        let entry = gate.request(UserId(1), 5000 * ONE).await.unwrap();
        chain.revert_next_submission();
        assert!(gate.process(entry.id).await.is_err());

        let entries = storage.ledger_entries();
        assert_eq!(entries[0].status, LedgerStatus::Failed);

        // Failed withdrawals do not count against the cap.
        storage.verify_user(UserId(1));
        assert!(gate.request(UserId(1), 5000 * ONE).await.is_ok());
    }

    #[tokio::test]
    async fn test_verified_session_single_use() {
        let (storage, _, gate) = setup();

        assert!(gate.request(UserId(1), 100 * ONE).await.is_ok());

        let result = gate.request(UserId(1), 100 * ONE).await;
        assert_matches!(
            result,
            Err(Error::Validation(ValidationError::NotVerified(UserId(1))))
        );
        assert_eq!(storage.ledger_entries().len(), 1);
        assert_eq!(storage.queued_jobs().len(), 1);

        storage.verify_user(UserId(1));
        assert!(gate.request(UserId(1), 100 * ONE).await.is_ok());
        assert_eq!(storage.ledger_entries().len(), 2);

        // Never verified.
        storage.add_user(user(UserId(2), "guest"));
        let result = gate.request(UserId(2), 100 * ONE).await;
        assert_matches!(
            result,
            Err(Error::Validation(ValidationError::NotVerified(UserId(2))))
        );

        let result = gate.request(UserId(3), 100 * ONE).await;
        assert_matches!(
            result,
            Err(Error::Validation(ValidationError::UnknownUser(UserId(3))))
        );
    }

    #[tokio::test]
    async fn test_reserved_never_exceed_cap() {
        let (storage, _, gate) = setup();
        let limit = gate.daily_limit().await.unwrap();

        for _ in 0..50 {
            storage.verify_user(UserId(1));
            let requested = (1..2_000u64).fake::<u64>() as u128 * ONE;
            let _ = gate.request(UserId(1), requested).await;
        }

        let reserved = storage
            .ledger_entries()
            .iter()
            .filter(|e| e.status != LedgerStatus::Failed)
            .map(|e| e.credits_delta_wei.unsigned_abs())
            .sum::<u128>();
        assert!(reserved <= limit);
    }
}
