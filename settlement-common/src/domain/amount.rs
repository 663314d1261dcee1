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

//! Conversions between display amounts, credits and token base units.
//!
//! All arithmetic is integer or fixed point; whenever an exact amount has to be coerced into a
//! display value it is rounded towards negative infinity, i.e. never up.

use crate::domain::{CreditsWei, TokenWei};
use derive_more::Display;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Decimals of the token and of credits in base units.
pub const TOKEN_DECIMALS: u32 = 18;

/// Decimal places of display and ledger amounts.
pub const DISPLAY_PLACES: u32 = 2;

/// Credits per one token unit; always at least one.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u128", into = "u128")]
pub struct ConversionRate(u128);

impl ConversionRate {
    pub fn get(self) -> u128 {
        self.0
    }
}

impl TryFrom<u128> for ConversionRate {
    type Error = AmountError;

    fn try_from(rate: u128) -> Result<Self, Self::Error> {
        if rate == 0 {
            Err(AmountError::InvalidRate(rate))
        } else {
            Ok(Self(rate))
        }
    }
}

impl From<ConversionRate> for u128 {
    fn from(rate: ConversionRate) -> Self {
        rate.0
    }
}

/// Convert credits to tokens, rounding the token amount down.
pub fn credits_to_token_wei(credits_wei: CreditsWei, rate: ConversionRate) -> TokenWei {
    credits_wei / rate.0
}

/// Convert tokens to credits.
pub fn token_wei_to_credits_wei(
    token_wei: TokenWei,
    rate: ConversionRate,
) -> Result<CreditsWei, AmountError> {
    token_wei
        .checked_mul(rate.0)
        .ok_or(AmountError::Overflow("token_wei_to_credits_wei"))
}

/// Convert an amount in base units into a display amount with the given decimal places, rounding
/// down.
pub fn to_display(wei: u128, decimals: u32, places: u32) -> Result<Decimal, AmountError> {
    let wei = i128::try_from(wei).map_err(|_| AmountError::Overflow("to_display"))?;
    signed_to_display(wei, decimals, places)
}

/// Like [to_display] for signed amounts, e.g. credit deltas; negative values are rounded towards
/// negative infinity as well.
pub fn signed_to_display(wei: i128, decimals: u32, places: u32) -> Result<Decimal, AmountError> {
    let scaled = if places <= decimals {
        wei.div_euclid(pow10(decimals - places)?)
    } else {
        wei.checked_mul(pow10(places - decimals)?)
            .ok_or(AmountError::Overflow("signed_to_display"))?
    };

    Decimal::try_from_i128_with_scale(scaled, places)
        .map_err(|_| AmountError::Overflow("signed_to_display"))
}

/// Round the given display amount down to the given decimal places. Idempotent.
pub fn quantize_down(value: Decimal, places: u32) -> Decimal {
    value.round_dp_with_strategy(places, RoundingStrategy::ToNegativeInfinity)
}

/// Convert a non-negative display amount into base units; digits beyond `decimals` are dropped.
pub fn from_display(value: Decimal, decimals: u32) -> Result<u128, AmountError> {
    if value.is_sign_negative() && !value.is_zero() {
        return Err(AmountError::Negative(value));
    }

    let mantissa = value.mantissa().unsigned_abs();
    let scale = value.scale();

    if scale <= decimals {
        mantissa
            .checked_mul(pow10_unsigned(decimals - scale)?)
            .ok_or(AmountError::Overflow("from_display"))
    } else {
        Ok(mantissa / pow10_unsigned(scale - decimals)?)
    }
}

/// Whether two display amounts agree within the given absolute tolerance.
pub fn within_tolerance(a: Decimal, b: Decimal, tolerance: Decimal) -> bool {
    (a - b).abs() <= tolerance
}

fn pow10(exp: u32) -> Result<i128, AmountError> {
    10i128
        .checked_pow(exp)
        .ok_or(AmountError::Overflow("pow10"))
}

fn pow10_unsigned(exp: u32) -> Result<u128, AmountError> {
    10u128
        .checked_pow(exp)
        .ok_or(AmountError::Overflow("pow10"))
}

#[derive(Debug, Error)]
pub enum AmountError {
    #[error("conversion rate must be at least one, but was {0}")]
    InvalidRate(u128),

    #[error("amount overflow in {0}")]
    Overflow(&'static str),

    #[error("amount must not be negative, but was {0}")]
    Negative(Decimal),
}
