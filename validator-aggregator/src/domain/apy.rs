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

use crate::domain::{Amount, COMMISSION_DENOMINATOR, Commission, EraIndex, Points};
use std::collections::BTreeMap;

/// Annualization factor: one era per day.
pub const ERAS_PER_YEAR: f64 = 365.25;

/// Annualized percentage yield estimated by extrapolating one era's nominator-facing return
/// rate over a year.
///
/// The monetary part (validator reward share, commission cut) is computed in exact `u128`
/// arithmetic with the commission as a /1e9 fixed-point fraction; floating-point enters only
/// for the final return-rate-to-percent step. Zero points, zero total points or zero stake
/// yield an APY of 0 for that era: the validator earned nothing, the era had no activity, or
/// the stake is unknown. That is policy, not a missing-data error.
pub fn era_apy(
    points: Points,
    total_points: Points,
    era_reward: Amount,
    commission: Commission,
    total_stake: Amount,
) -> f64 {
    if points == 0 || total_points == 0 || total_stake == 0 {
        return 0.0;
    }

    let validator_reward = era_reward * points as u128 / total_points as u128;
    let nominator_share = (COMMISSION_DENOMINATOR - commission.parts()) as u128;
    let nominator_reward = validator_reward * nominator_share / COMMISSION_DENOMINATOR as u128;

    let era_return_rate = nominator_reward as f64 / total_stake as f64;
    era_return_rate * ERAS_PER_YEAR * 100.0
}

/// Mean APY over all eras of the given map, eras with zero APY included; 0 when empty.
pub fn average_apy(apy_by_era: &BTreeMap<EraIndex, f64>) -> f64 {
    if apy_by_era.is_empty() {
        return 0.0;
    }
    apy_by_era.values().sum::<f64>() / apy_by_era.len() as f64
}

/// Mean APY restricted to eras with nonzero APY; 0 when there are none.
pub fn active_only_average_apy(apy_by_era: &BTreeMap<EraIndex, f64>) -> f64 {
    let active = apy_by_era
        .values()
        .filter(|apy| **apy != 0.0)
        .collect::<Vec<_>>();
    if active.is_empty() {
        return 0.0;
    }
    active.iter().copied().sum::<f64>() / active.len() as f64
}
