// This file is part of validator-aggregator.
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

pub mod node;

mod apy;
mod ranking;
mod validator;

pub use apy::*;
pub use ranking::*;
pub use validator::*;

use derive_more::{Deref, Display, Into};
use serde::Deserialize;
use std::str::FromStr;
use thiserror::Error;

/// Index of a staking era; eras are monotonically increasing. The "active era" is the one
/// currently in progress, the "last era" the most recently completed one.
pub type EraIndex = u32;

/// Amount in the smallest on-chain unit.
pub type Amount = u128;

/// Per-validator activity score for an era, used to apportion the era reward.
pub type Points = u32;

/// Upper bound for the historical drill-down window, in eras.
pub const MAX_HISTORY_LENGTH: u32 = 84;

/// SS58-encoded validator account address.
#[derive(Debug, Display, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Deref, Into, Deserialize)]
#[deref(forward)]
#[serde(try_from = "String")]
pub struct ValidatorAddress(pub String);

impl TryFrom<String> for ValidatorAddress {
    type Error = InvalidValidatorAddressError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        if s.is_empty() {
            Err(InvalidValidatorAddressError::Empty)
        } else {
            Ok(Self(s))
        }
    }
}

impl TryFrom<&str> for ValidatorAddress {
    type Error = InvalidValidatorAddressError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        s.to_owned().try_into()
    }
}

impl FromStr for ValidatorAddress {
    type Err = InvalidValidatorAddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.try_into()
    }
}

#[derive(Debug, Error)]
pub enum InvalidValidatorAddressError {
    #[error("validator address must not be empty")]
    Empty,
}

/// Denominator of the fixed-point commission representation (parts per billion).
pub const COMMISSION_DENOMINATOR: u32 = 1_000_000_000;

/// Fraction of the nominator-facing reward retained by the validator, as parts per billion.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize)]
#[serde(from = "u32")]
pub struct Commission(u32);

impl Commission {
    pub const ZERO: Self = Self(0);
    pub const FULL: Self = Self(COMMISSION_DENOMINATOR);

    /// Create a commission from parts per billion, saturating at 100%.
    pub fn from_parts(parts: u32) -> Self {
        Self(parts.min(COMMISSION_DENOMINATOR))
    }

    pub fn parts(&self) -> u32 {
        self.0
    }

    pub fn as_fraction(&self) -> f64 {
        self.0 as f64 / COMMISSION_DENOMINATOR as f64
    }

    /// A validator taking 100% commission leaves nothing for its nominators.
    pub fn is_full(&self) -> bool {
        self.0 >= COMMISSION_DENOMINATOR
    }
}

impl From<u32> for Commission {
    fn from(parts: u32) -> Self {
        Self::from_parts(parts)
    }
}
