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

use crate::domain::{ChainClient, Error, ValidationError, storage::Storage};
use fastrace::trace;
use log::{info, warn};
use settlement_common::domain::ConversionRate;

/// Single source for the credits per token rate, cached from chain into storage.
#[derive(Debug, Clone)]
pub struct ConversionOracle<S, C> {
    storage: S,
    chain: C,
}

impl<S, C> ConversionOracle<S, C>
where
    S: Storage,
    C: ChainClient,
{
    pub fn new(storage: S, chain: C) -> Self {
        Self { storage, chain }
    }

    /// The stored rate; synced once from chain if none is stored yet.
    #[trace]
    pub async fn current(&self) -> Result<ConversionRate, Error> {
        match self.storage.get_conversion_rate().await? {
            Some(rate) => Ok(rate),
            None => self.sync().await,
        }
    }

    /// Read the rate from chain and store it if it changed. A rate below one is rejected and the
    /// stored rate kept.
    #[trace]
    pub async fn sync(&self) -> Result<ConversionRate, Error> {
        let rate = self.chain.current_conversion_rate().await?;
        let rate = ConversionRate::try_from(rate).map_err(|_| {
            warn!(rate; "rejecting invalid conversion rate from chain");
            ValidationError::InvalidRate(rate)
        })?;

        let stored = self.storage.get_conversion_rate().await?;
        if stored != Some(rate) {
            self.storage.save_conversion_rate(rate).await?;
            info!(rate:%, previous:? = stored.map(ConversionRate::get); "conversion rate updated");
        }

        Ok(rate)
    }
}
