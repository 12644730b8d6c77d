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

use crate::domain::{Points, ValidatorAddress, node::EraRewardPoints};
use std::collections::HashMap;

/// Minimal ranking unit; immutable once computed for a given active era.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatorSummary {
    pub address: ValidatorAddress,
    pub points: Points,
}

/// Projection of a ranked validator used for sorting and pagination. `last_era_apy` stays
/// `None` until the bulk APY job has resolved it.
#[derive(Debug, Clone, PartialEq)]
pub struct FilteredEntry {
    pub address: ValidatorAddress,
    pub points: Points,
    pub last_era_apy: Option<f64>,
}

/// Which validators are members of the filtered projection. Changing it rebuilds the
/// projection but leaves the cache untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterState {
    pub include_full_commission: bool,
    pub include_blocked_nominations: bool,
}

impl Default for FilterState {
    fn default() -> Self {
        Self {
            include_full_commission: true,
            include_blocked_nominations: true,
        }
    }
}

impl FilterState {
    /// Membership predicate over a validator's preferences.
    pub fn admits(&self, commission: crate::domain::Commission, blocked: bool) -> bool {
        (self.include_full_commission || !commission.is_full())
            && (self.include_blocked_nominations || !blocked)
    }
}

/// Build the authoritative ranked validator list for the active era: every address of the
/// validator set, sorted descending by era points. The sort is stable, so validators with
/// equal points keep the collaborator-returned order. Addresses without points rank last
/// with zero.
pub fn rank_validators(
    validator_set: Vec<ValidatorAddress>,
    reward_points: &EraRewardPoints,
) -> Vec<ValidatorSummary> {
    let points_by_address = reward_points
        .individual
        .iter()
        .map(|(address, points)| (address, *points))
        .collect::<HashMap<_, _>>();

    let mut ranking = validator_set
        .into_iter()
        .map(|address| {
            let points = points_by_address.get(&address).copied().unwrap_or_default();
            ValidatorSummary { address, points }
        })
        .collect::<Vec<_>>();
    ranking.sort_by(|a, b| b.points.cmp(&a.points));

    ranking
}

/// Order the filtered projection: by last-era APY descending once the bulk APY job has run
/// this session, by ranking (points) order before that. Stable, so ties keep their previous
/// relative order.
pub fn sort_filtered(entries: &mut [FilteredEntry], apy_ready: bool) {
    if apy_ready {
        entries.sort_by(|a, b| {
            b.last_era_apy
                .unwrap_or_default()
                .total_cmp(&a.last_era_apy.unwrap_or_default())
        });
    } else {
        entries.sort_by(|a, b| b.points.cmp(&a.points));
    }
}
