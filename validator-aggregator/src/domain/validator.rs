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

use crate::domain::{
    Amount, Commission, EraIndex, Points, ValidatorAddress, active_only_average_apy, average_apy,
};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Whether a record's detail fields were actually fetched, defaulted after a failed fetch, or
/// never requested. Lets consumers tell "genuinely zero" apart from "unknown".
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum FetchStatus {
    #[default]
    Unknown,

    Fetched,

    Failed,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct Performance {
    pub current_era_points: Points,
    /// Points per completed era; absent keys mean "not fetched", not zero.
    pub previous_eras_points: BTreeMap<EraIndex, Points>,
    pub average_points: f64,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct Rewards {
    pub current_era_reward: Amount,
    /// Validator reward share per completed era.
    pub previous_eras_rewards: BTreeMap<EraIndex, Amount>,
    pub apy_by_era: BTreeMap<EraIndex, f64>,
    pub average_apy: f64,
    pub active_only_average_apy: f64,
}

/// Fully or partially hydrated per-validator data, one record per address, living for the
/// process session.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatorRecord {
    pub address: ValidatorAddress,
    pub commission: Commission,
    pub blocked_nominations: bool,
    pub total_stake: Amount,
    pub own_stake: Amount,
    /// `None` until the APY engine has run for this validator; distinct from a computed zero.
    pub last_era_apy: Option<f64>,
    pub performance: Performance,
    pub rewards: Rewards,
    pub historical_commission: BTreeMap<EraIndex, Commission>,
    pub average_commission: f64,
    /// Status of the cheap preference lookup (commission, blocked nominations).
    pub prefs: FetchStatus,
    /// Status of the full detail fetch (preferences plus stake overview).
    pub detail: FetchStatus,
    /// Eras whose history or APY fetch failed and was defaulted to zero.
    pub failed_eras: BTreeSet<EraIndex>,
}

impl ValidatorRecord {
    pub fn new(address: ValidatorAddress) -> Self {
        Self {
            address,
            commission: Commission::ZERO,
            blocked_nominations: false,
            total_stake: 0,
            own_stake: 0,
            last_era_apy: None,
            performance: Performance::default(),
            rewards: Rewards::default(),
            historical_commission: BTreeMap::default(),
            average_commission: 0.0,
            prefs: FetchStatus::Unknown,
            detail: FetchStatus::Unknown,
            failed_eras: BTreeSet::default(),
        }
    }

    /// The documented default for a validator whose detail fetch failed: zeroed fields, still
    /// rendered as a row rather than omitted.
    pub fn failure_default(address: ValidatorAddress) -> Self {
        Self {
            last_era_apy: Some(0.0),
            prefs: FetchStatus::Failed,
            detail: FetchStatus::Failed,
            ..Self::new(address)
        }
    }

    /// Whether the record already covers every era of the given descending window.
    pub fn covers_history(&self, last_era: EraIndex, length: u32) -> bool {
        history_window(last_era, length)
            .all(|era| self.performance.previous_eras_points.contains_key(&era))
    }

    /// The bounded historical series for this validator over the given descending window.
    /// Absent entries render as zero; absence itself stays queryable through the era maps.
    pub fn historical_series(&self, last_era: EraIndex, length: u32) -> HistoricalSeries {
        let eras = history_window(last_era, length).collect::<Vec<_>>();
        let points = eras
            .iter()
            .map(|era| {
                self.performance
                    .previous_eras_points
                    .get(era)
                    .copied()
                    .unwrap_or_default()
            })
            .collect();
        let rewards = eras
            .iter()
            .map(|era| {
                self.rewards
                    .previous_eras_rewards
                    .get(era)
                    .copied()
                    .unwrap_or_default()
            })
            .collect();
        let commission = eras
            .iter()
            .map(|era| {
                self.historical_commission
                    .get(era)
                    .copied()
                    .unwrap_or_default()
            })
            .collect();
        let apy = eras
            .iter()
            .map(|era| self.rewards.apy_by_era.get(era).copied().unwrap_or_default())
            .collect();

        HistoricalSeries {
            address: self.address.clone(),
            eras,
            points,
            rewards,
            commission,
            apy,
        }
    }

    /// Recompute all average fields from the era maps. Averages are never merged directly so
    /// they cannot drift from the maps they summarize.
    fn recompute_averages(&mut self) {
        let points = &self.performance.previous_eras_points;
        self.performance.average_points = if points.is_empty() {
            0.0
        } else {
            points.values().map(|points| *points as f64).sum::<f64>() / points.len() as f64
        };

        self.rewards.average_apy = average_apy(&self.rewards.apy_by_era);
        self.rewards.active_only_average_apy = active_only_average_apy(&self.rewards.apy_by_era);

        let commission = &self.historical_commission;
        self.average_commission = if commission.is_empty() {
            0.0
        } else {
            commission.values().map(Commission::as_fraction).sum::<f64>() / commission.len() as f64
        };
    }
}

/// Eras of a historical window, descending from `last_era`, capped so the window never
/// reaches below era 0.
pub fn history_window(last_era: EraIndex, length: u32) -> impl Iterator<Item = EraIndex> {
    let length = length.min(last_era + 1);
    (0..length).map(move |offset| last_era - offset)
}

/// Partial update for a [ValidatorRecord]. Scalar fields overwrite only when present; era
/// maps are merged key-by-key so a later partial covering fewer eras cannot erase previously
/// known ones.
#[derive(Debug, Default, Clone)]
pub struct ValidatorPartial {
    pub commission: Option<Commission>,
    pub blocked_nominations: Option<bool>,
    pub total_stake: Option<Amount>,
    pub own_stake: Option<Amount>,
    pub last_era_apy: Option<f64>,
    pub current_era_points: Option<Points>,
    pub current_era_reward: Option<Amount>,
    pub previous_eras_points: BTreeMap<EraIndex, Points>,
    pub previous_eras_rewards: BTreeMap<EraIndex, Amount>,
    pub apy_by_era: BTreeMap<EraIndex, f64>,
    pub historical_commission: BTreeMap<EraIndex, Commission>,
    pub prefs: Option<FetchStatus>,
    pub detail: Option<FetchStatus>,
    pub failed_eras: BTreeSet<EraIndex>,
}

/// Bounded-length historical drill-down for one validator, eras descending.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoricalSeries {
    pub address: ValidatorAddress,
    pub eras: Vec<EraIndex>,
    pub points: Vec<Points>,
    pub rewards: Vec<Amount>,
    pub commission: Vec<Commission>,
    pub apy: Vec<f64>,
}

/// Session-lifetime store of validator records. Append/merge only, no eviction: the dataset
/// is bounded by the validator-set size. Reads never trigger remote fetches; hydration is
/// the caller's responsibility.
#[derive(Debug, Default)]
pub struct ValidatorCache {
    records: HashMap<ValidatorAddress, ValidatorRecord>,
}

impl ValidatorCache {
    pub fn get(&self, address: &ValidatorAddress) -> Option<&ValidatorRecord> {
        self.records.get(address)
    }

    pub fn contains(&self, address: &ValidatorAddress) -> bool {
        self.records.contains_key(address)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Field-wise merge of a partial into the record for the given address, creating the
    /// record if absent. Never deletes or overwrites a field with "unknown".
    pub fn merge(
        &mut self,
        address: &ValidatorAddress,
        partial: ValidatorPartial,
    ) -> &ValidatorRecord {
        let record = self
            .records
            .entry(address.clone())
            .or_insert_with(|| ValidatorRecord::new(address.clone()));

        if let Some(commission) = partial.commission {
            record.commission = commission;
        }
        if let Some(blocked) = partial.blocked_nominations {
            record.blocked_nominations = blocked;
        }
        if let Some(total_stake) = partial.total_stake {
            record.total_stake = total_stake;
        }
        if let Some(own_stake) = partial.own_stake {
            record.own_stake = own_stake;
        }
        if let Some(last_era_apy) = partial.last_era_apy {
            record.last_era_apy = Some(last_era_apy);
        }
        if let Some(points) = partial.current_era_points {
            record.performance.current_era_points = points;
        }
        if let Some(reward) = partial.current_era_reward {
            record.rewards.current_era_reward = reward;
        }
        if let Some(prefs) = partial.prefs {
            record.prefs = prefs;
        }
        if let Some(detail) = partial.detail {
            record.detail = detail;
        }

        record
            .performance
            .previous_eras_points
            .extend(partial.previous_eras_points);
        record
            .rewards
            .previous_eras_rewards
            .extend(partial.previous_eras_rewards);
        record.rewards.apy_by_era.extend(partial.apy_by_era);
        record
            .historical_commission
            .extend(partial.historical_commission);
        record.failed_eras.extend(partial.failed_eras);

        record.recompute_averages();
        record
    }
}
