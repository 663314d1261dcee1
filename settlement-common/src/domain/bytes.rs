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

use serde::{Deserialize, Deserializer, Serialize, Serializer, de};
use std::{
    fmt::{self, Debug, Display, Formatter},
    str::FromStr,
};
use thiserror::Error;

/// Fixed size byte array, hex encoded with `0x` prefix for display and serialization.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ByteArray<const N: usize>(pub [u8; N]);

impl<const N: usize> ByteArray<N> {
    pub const ZERO: Self = Self([0; N]);

    pub fn is_zero(&self) -> bool {
        self.0 == [0; N]
    }
}

impl<const N: usize> Default for ByteArray<N> {
    fn default() -> Self {
        Self::ZERO
    }
}

impl<const N: usize> AsRef<[u8]> for ByteArray<N> {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl<const N: usize> From<[u8; N]> for ByteArray<N> {
    fn from(bytes: [u8; N]) -> Self {
        Self(bytes)
    }
}

impl<const N: usize> TryFrom<&[u8]> for ByteArray<N> {
    type Error = ByteArrayLenError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        let bytes = <[u8; N]>::try_from(bytes).map_err(|_| ByteArrayLenError(N, bytes.len()))?;
        Ok(Self(bytes))
    }
}

impl<const N: usize> TryFrom<Vec<u8>> for ByteArray<N> {
    type Error = ByteArrayLenError;

    fn try_from(bytes: Vec<u8>) -> Result<Self, Self::Error> {
        bytes.as_slice().try_into()
    }
}

impl<const N: usize> Display for ByteArray<N> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", const_hex::encode(self.0))
    }
}

impl<const N: usize> Debug for ByteArray<N> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(self, f)
    }
}

impl<const N: usize> FromStr for ByteArray<N> {
    type Err = const_hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        const_hex::decode_to_array::<_, N>(s).map(Self)
    }
}

impl<const N: usize> Serialize for ByteArray<N> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de, const N: usize> Deserialize<'de> for ByteArray<N> {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

#[derive(Debug, Error)]
#[error("expected {0} bytes, but got {1}")]
pub struct ByteArrayLenError(usize, usize);

#[cfg(test)]
mod tests {
    use crate::domain::{Address, TxHash};
    use assert_matches::assert_matches;

    #[test]
    fn test_display_from_str() {
        let hash = TxHash::from([1; 32]);
        let s = hash.to_string();
        assert!(s.starts_with("0x0101"));
        assert_matches!(s.parse::<TxHash>(), Ok(h) if h == hash);

        let without_prefix = s.trim_start_matches("0x");
        assert_matches!(without_prefix.parse::<TxHash>(), Ok(h) if h == hash);

        assert!("0x0102".parse::<Address>().is_err());
    }

    #[test]
    fn test_try_from_bytes() {
        assert_matches!(Address::try_from(vec![7; 20]), Ok(a) if a.0 == [7; 20]);
        assert!(Address::try_from(vec![7; 19]).is_err());
        assert!(TxHash::default().is_zero());
    }
}
