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

use crate::domain::{Amount, Commission, EraIndex, Points, ValidatorAddress};
use std::{error::Error as StdError, fmt::Debug};

/// Chain state query abstraction, the only true I/O boundary of the engine.
///
/// Every operation may fail (network, timeout) or resolve to `None` (no data for that key).
/// Callers must treat both as "unknown, apply the documented default"; only a missing active
/// era is fatal to session bootstrap.
#[trait_variant::make(Send)]
pub trait ChainQuery
where
    Self: Clone + Send + Sync + 'static,
{
    type Error: StdError + Send + Sync + 'static;

    /// The era currently in progress.
    async fn get_active_era(&self) -> Result<Option<EraIndex>, Self::Error>;

    /// The total validator reward paid out for the given (completed) era.
    async fn get_era_total_reward(&self, era: EraIndex) -> Result<Option<Amount>, Self::Error>;

    /// Per-validator and total reward points for the given era.
    async fn get_era_reward_points(
        &self,
        era: EraIndex,
    ) -> Result<Option<EraRewardPoints>, Self::Error>;

    /// Addresses of the current validator set, in session order.
    async fn get_validator_set(&self) -> Result<Vec<ValidatorAddress>, Self::Error>;

    /// Current preferences (commission, blocked nominations) of the given validator.
    async fn get_validator_preferences(
        &self,
        validator: &ValidatorAddress,
    ) -> Result<Option<ValidatorPreferences>, Self::Error>;

    /// Preferences of the given validator as recorded for the given era.
    async fn get_era_validator_preferences(
        &self,
        era: EraIndex,
        validator: &ValidatorAddress,
    ) -> Result<Option<ValidatorPreferences>, Self::Error>;

    /// Total and own stake backing the given validator in the given era.
    async fn get_era_stake_overview(
        &self,
        era: EraIndex,
        validator: &ValidatorAddress,
    ) -> Result<Option<StakeOverview>, Self::Error>;
}

/// Reward points of one era: the per-validator scores and their sum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EraRewardPoints {
    /// Per-validator points in the order returned by the chain.
    pub individual: Vec<(ValidatorAddress, Points)>,
    pub total: Points,
}

/// Absence on chain means the documented default: zero commission, nominations open.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ValidatorPreferences {
    pub commission: Commission,
    pub blocked: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StakeOverview {
    pub total: Amount,
    pub own: Amount,
}
