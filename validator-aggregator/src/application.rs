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

mod batch;

pub use batch::run_batched;

use crate::{
    domain::{
        Amount, Commission, EraIndex, FetchStatus, FilterState, FilteredEntry, HistoricalSeries,
        MAX_HISTORY_LENGTH, Points, ValidatorAddress, ValidatorCache, ValidatorPartial,
        ValidatorRecord, ValidatorSummary, era_apy, history_window,
        node::{ChainQuery, EraRewardPoints},
        rank_validators, sort_filtered,
    },
    error::BoxError,
};
use log::{debug, info, warn};
use metrics::{counter, gauge};
use parking_lot::RwLock;
use serde::Deserialize;
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};
use thiserror::Error;
use tokio::task;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub page_size: usize,
    pub history_length: u32,
    /// Page hydration issues multiple sub-queries per validator; keep this batch small.
    pub page_batch_size: usize,
    /// Historical per-era fetches are also multi-query; smallest batch.
    pub history_batch_size: usize,
    /// Bulk last-era APY across the full validator set.
    pub apy_batch_size: usize,
    /// Preference lookups are a single cheap query each; largest batch.
    pub preferences_batch_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            page_size: 10,
            history_length: 28,
            page_batch_size: 10,
            history_batch_size: 5,
            apy_batch_size: 25,
            preferences_batch_size: 50,
        }
    }
}

#[derive(Debug, Error)]
pub enum AggregatorError {
    /// No active era resolvable; fatal for session bootstrap, everything else degrades.
    #[error("no active era data available from the chain")]
    DataUnavailable,

    #[error("chain query failed during session bootstrap")]
    Chain(#[source] BoxError),
}

/// View-model state: the ranked list, its filtered projection and the pagination/selection
/// cursor over it. Guarded as a whole so projection and cursor never diverge.
#[derive(Debug, Default)]
struct ViewState {
    active_era: EraIndex,
    ranking: Vec<ValidatorSummary>,
    filtered: Vec<FilteredEntry>,
    filter: FilterState,
    current_page: usize,
    page_size: usize,
    history_length: u32,
    selected: Option<ValidatorAddress>,
    last_era_apy_ready: bool,
    error: Option<String>,
    warnings: Vec<String>,
}

#[derive(Debug, Default)]
struct LoadingFlags {
    loading: AtomicBool,
    loading_page: AtomicBool,
    loading_apy: AtomicBool,
    loading_historical: AtomicBool,
    apy_job_in_flight: AtomicBool,
}

#[derive(Debug)]
struct Inner {
    config: Config,
    cache: RwLock<ValidatorCache>,
    state: RwLock<ViewState>,
    flags: LoadingFlags,
}

/// The validator data aggregation and caching engine.
///
/// Owns the session-lifetime [ValidatorCache], the filter/pagination view state and the
/// loading flags; drives bounded-concurrency background jobs that backfill missing record
/// fields without blocking interactive reads. Cheap to clone; clones share all state.
#[derive(Debug, Clone)]
pub struct Aggregator<C> {
    chain: C,
    inner: Arc<Inner>,
}

impl<C> Aggregator<C>
where
    C: ChainQuery,
{
    pub fn new(config: Config, chain: C) -> Self {
        let state = ViewState {
            current_page: 1,
            page_size: config.page_size.max(1),
            history_length: config.history_length.clamp(1, MAX_HISTORY_LENGTH),
            ..ViewState::default()
        };

        Self {
            chain,
            inner: Arc::new(Inner {
                config,
                cache: RwLock::default(),
                state: RwLock::new(state),
                flags: LoadingFlags::default(),
            }),
        }
    }

    /// Bootstrap the session: resolve the active era, build the ranking, apply the filter and
    /// hydrate the first page. Background backfill jobs are spawned only after this
    /// bootstrap-critical work has completed.
    ///
    /// The only fatal failure of the whole engine: without an active era there is no ranking
    /// and no session.
    pub async fn bootstrap(&self) -> Result<(), AggregatorError> {
        self.inner.flags.loading.store(true, Ordering::SeqCst);
        let result = self.bootstrap_inner().await;
        self.inner.flags.loading.store(false, Ordering::SeqCst);

        if let Err(error) = &result {
            self.inner.state.write().error = Some(error.to_string());
        }
        result
    }

    async fn bootstrap_inner(&self) -> Result<(), AggregatorError> {
        let active_era = self
            .chain
            .get_active_era()
            .await
            .map_err(|error| AggregatorError::Chain(error.into()))?
            .ok_or(AggregatorError::DataUnavailable)?;

        let validator_set = self
            .chain
            .get_validator_set()
            .await
            .map_err(|error| AggregatorError::Chain(error.into()))?;
        // Absent reward points just mean nobody has scored yet; the ranking degrades to the
        // collaborator-returned set order.
        let reward_points = self
            .chain
            .get_era_reward_points(active_era)
            .await
            .map_err(|error| AggregatorError::Chain(error.into()))?
            .unwrap_or_else(|| EraRewardPoints {
                individual: Vec::default(),
                total: 0,
            });

        let ranking = rank_validators(validator_set, &reward_points);
        info!(active_era, validators = ranking.len(); "ranking built");

        // Seed the cache with the active-era points; the estimated current-era reward share
        // follows when the chain already exposes a running total for the active era.
        let current_era_reward = match self.chain.get_era_total_reward(active_era).await {
            Ok(current_era_reward) => current_era_reward,
            Err(error) => {
                self.push_warning(format!(
                    "total reward for era {active_era} unavailable: {error}"
                ));
                None
            }
        };
        {
            let mut cache = self.inner.cache.write();
            for summary in &ranking {
                let reward = current_era_reward.map(|total| {
                    validator_reward_share(total, summary.points, reward_points.total)
                });
                cache.merge(
                    &summary.address,
                    ValidatorPartial {
                        current_era_points: Some(summary.points),
                        current_era_reward: reward,
                        ..ValidatorPartial::default()
                    },
                );
            }
        }

        {
            let mut state = self.inner.state.write();
            state.active_era = active_era;
            state.history_length = state
                .history_length
                .clamp(1, MAX_HISTORY_LENGTH.min(active_era).max(1));
            state.ranking = ranking;
            state.error = None;
        }

        self.apply_filter().await;
        self.load_page(1).await;

        Ok(())
    }

    /// Rebuild the filtered projection from scratch over the current ranking. Preferences of
    /// validators not yet in the cache are fetched first (one cheap query each, large
    /// batches). If any entries still lack a resolved last-era APY, the bulk APY job is
    /// scheduled asynchronously; filtering never blocks on it.
    async fn apply_filter(&self) {
        let unknown = {
            let cache = self.inner.cache.read();
            let state = self.inner.state.read();
            state
                .ranking
                .iter()
                .map(|summary| &summary.address)
                .filter(|address| {
                    // Unknown and Failed both qualify; re-invocation is the retry mechanism.
                    cache
                        .get(address)
                        .map(|record| record.prefs != FetchStatus::Fetched)
                        .unwrap_or(true)
                })
                .cloned()
                .collect::<Vec<_>>()
        };

        run_batched(
            &unknown,
            self.inner.config.preferences_batch_size,
            |address| {
                let address = address.clone();
                async move { self.fetch_preferences(&address).await }
            },
        )
        .await;

        let needs_apy = {
            let cache = self.inner.cache.read();
            let mut state = self.inner.state.write();

            let mut filtered = state
                .ranking
                .iter()
                .filter_map(|summary| {
                    let record = cache.get(&summary.address)?;
                    state
                        .filter
                        .admits(record.commission, record.blocked_nominations)
                        .then(|| FilteredEntry {
                            address: summary.address.clone(),
                            points: summary.points,
                            last_era_apy: record.last_era_apy,
                        })
                })
                .collect::<Vec<_>>();
            sort_filtered(&mut filtered, state.last_era_apy_ready);

            let needs_apy = filtered.iter().any(|entry| entry.last_era_apy.is_none());
            state.filtered = filtered;
            needs_apy
        };

        if needs_apy {
            self.spawn_last_era_apy_job();
        }
    }

    /// One cheap preference query, merged into the cache for filter membership. Failure
    /// degrades to the zeroed default and a soft warning; absence means the documented
    /// default (commission 0, not blocked).
    async fn fetch_preferences(&self, address: &ValidatorAddress) {
        match self.chain.get_validator_preferences(address).await {
            Ok(preferences) => {
                let preferences = preferences.unwrap_or_default();
                self.inner.cache.write().merge(
                    address,
                    ValidatorPartial {
                        commission: Some(preferences.commission),
                        blocked_nominations: Some(preferences.blocked),
                        prefs: Some(FetchStatus::Fetched),
                        ..ValidatorPartial::default()
                    },
                );
            }

            Err(error) => {
                self.record_fetch_failure(address, &error);
                self.inner.cache.write().merge(
                    address,
                    ValidatorPartial {
                        prefs: Some(FetchStatus::Failed),
                        ..ValidatorPartial::default()
                    },
                );
            }
        }
    }

    /// Hydrate the current page slice: fetch-and-merge every entry whose detail is not yet in
    /// the cache. Small batches; each item issues multiple sub-queries.
    async fn load_page(&self, page: usize) {
        self.inner.flags.loading_page.store(true, Ordering::SeqCst);

        let (addresses, active_era) = {
            let state = self.inner.state.read();
            (page_slice(&state.filtered, page, state.page_size), state.active_era)
        };
        let not_hydrated = {
            let cache = self.inner.cache.read();
            addresses
                .into_iter()
                .filter(|address| {
                    // A Failed detail is retried on the next page load, not just Unknown.
                    cache
                        .get(address)
                        .map(|record| record.detail != FetchStatus::Fetched)
                        .unwrap_or(true)
                })
                .collect::<Vec<_>>()
        };

        run_batched(&not_hydrated, self.inner.config.page_batch_size, |address| {
            let address = address.clone();
            async move { self.hydrate_validator(&address, active_era).await }
        })
        .await;

        gauge!("aggregator_cache_records").set(self.inner.cache.read().len() as f64);
        self.inner.flags.loading_page.store(false, Ordering::SeqCst);
    }

    /// Full detail fetch for one validator: preferences plus the stake overview for the
    /// active era. A failed item degrades to the documented default record; previously
    /// fetched fields are never clobbered.
    async fn hydrate_validator(&self, address: &ValidatorAddress, active_era: EraIndex) {
        let preferences = self.chain.get_validator_preferences(address).await;
        let stake = self.chain.get_era_stake_overview(active_era, address).await;

        match (preferences, stake) {
            (Ok(preferences), Ok(stake)) => {
                let preferences = preferences.unwrap_or_default();
                let mut partial = ValidatorPartial {
                    commission: Some(preferences.commission),
                    blocked_nominations: Some(preferences.blocked),
                    prefs: Some(FetchStatus::Fetched),
                    detail: Some(FetchStatus::Fetched),
                    ..ValidatorPartial::default()
                };
                if let Some(stake) = stake {
                    partial.total_stake = Some(stake.total);
                    partial.own_stake = Some(stake.own);
                }
                self.inner.cache.write().merge(address, partial);
            }

            (preferences, stake) => {
                if let Err(error) = preferences {
                    self.record_fetch_failure(address, &error);
                }
                if let Err(error) = stake {
                    self.record_fetch_failure(address, &error);
                }
                self.inner.cache.write().merge(
                    address,
                    ValidatorPartial {
                        detail: Some(FetchStatus::Failed),
                        ..ValidatorPartial::default()
                    },
                );
            }
        }
    }

    fn spawn_last_era_apy_job(&self) {
        let engine = self.clone();
        task::spawn(async move { engine.compute_last_era_apy_for_all().await });
    }

    /// Compute the last-era APY for every ranked validator, in bounded batches, and feed the
    /// results into the cache and the filtered projection's sort order. Single-flight per
    /// session: re-running while already in flight is a no-op.
    pub async fn compute_last_era_apy_for_all(&self) {
        if self
            .inner
            .flags
            .apy_job_in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("last-era APY job already in flight");
            return;
        }
        self.inner.flags.loading_apy.store(true, Ordering::SeqCst);

        let (active_era, addresses) = {
            let state = self.inner.state.read();
            let addresses = state
                .ranking
                .iter()
                .map(|summary| summary.address.clone())
                .collect::<Vec<_>>();
            (state.active_era, addresses)
        };

        if active_era > 0 {
            let last_era = active_era - 1;
            let era_facts = self.fetch_era_facts(last_era).await;

            run_batched(&addresses, self.inner.config.apy_batch_size, |address| {
                let address = address.clone();
                let era_facts = era_facts.clone();
                async move {
                    self.compute_validator_last_era_apy(&address, last_era, &era_facts)
                        .await
                }
            })
            .await;

            counter!("aggregator_apy_runs_total").increment(1);
        }

        {
            let cache = self.inner.cache.read();
            let mut state = self.inner.state.write();
            for entry in &mut state.filtered {
                entry.last_era_apy = cache.get(&entry.address).and_then(|record| {
                    record.last_era_apy.or(Some(0.0))
                });
            }
            state.last_era_apy_ready = true;
            let mut filtered = std::mem::take(&mut state.filtered);
            sort_filtered(&mut filtered, true);
            state.filtered = filtered;
        }

        self.inner.flags.loading_apy.store(false, Ordering::SeqCst);
        self.inner
            .flags
            .apy_job_in_flight
            .store(false, Ordering::SeqCst);
        info!(validators = addresses.len(); "last-era APY computed");
    }

    /// Era-level inputs of the APY formula, shared by all validators of one era. Failure or
    /// absence degrades to zeros, which the formula resolves to zero APY by policy.
    async fn fetch_era_facts(&self, era: EraIndex) -> EraFacts {
        let reward_points = match self.chain.get_era_reward_points(era).await {
            Ok(reward_points) => reward_points,
            Err(error) => {
                self.push_warning(format!("reward points for era {era} unavailable: {error}"));
                None
            }
        };
        let total_reward = match self.chain.get_era_total_reward(era).await {
            Ok(total_reward) => total_reward,
            Err(error) => {
                self.push_warning(format!("total reward for era {era} unavailable: {error}"));
                None
            }
        };

        let (points_by_address, total_points) = match reward_points {
            Some(EraRewardPoints { individual, total }) => {
                (individual.into_iter().collect::<BTreeMap<_, _>>(), total)
            }
            None => (BTreeMap::default(), 0),
        };

        EraFacts {
            points_by_address: Arc::new(points_by_address),
            total_points,
            total_reward: total_reward.unwrap_or_default(),
        }
    }

    async fn compute_validator_last_era_apy(
        &self,
        address: &ValidatorAddress,
        last_era: EraIndex,
        era_facts: &EraFacts,
    ) {
        let points = era_facts
            .points_by_address
            .get(address)
            .copied()
            .unwrap_or_default();

        // Commission is usually cached from the membership lookup; the stake overview for the
        // last era still has to be fetched per validator.
        let commission = {
            let cache = self.inner.cache.read();
            cache
                .get(address)
                .filter(|record| record.prefs == FetchStatus::Fetched)
                .map(|record| record.commission)
        };
        let commission = match commission {
            Some(commission) => commission,
            None => match self.chain.get_validator_preferences(address).await {
                Ok(preferences) => preferences.unwrap_or_default().commission,
                Err(error) => {
                    self.record_fetch_failure(address, &error);
                    self.inner.cache.write().merge(
                        address,
                        ValidatorPartial {
                            last_era_apy: Some(0.0),
                            apy_by_era: BTreeMap::from([(last_era, 0.0)]),
                            failed_eras: BTreeSet::from([last_era]),
                            ..ValidatorPartial::default()
                        },
                    );
                    return;
                }
            },
        };

        let stake = match self.chain.get_era_stake_overview(last_era, address).await {
            Ok(stake) => stake,
            Err(error) => {
                self.record_fetch_failure(address, &error);
                self.inner.cache.write().merge(
                    address,
                    ValidatorPartial {
                        last_era_apy: Some(0.0),
                        apy_by_era: BTreeMap::from([(last_era, 0.0)]),
                        failed_eras: BTreeSet::from([last_era]),
                        ..ValidatorPartial::default()
                    },
                );
                return;
            }
        };

        let total_stake = stake.map(|stake| stake.total).unwrap_or_default();
        let apy = era_apy(
            points,
            era_facts.total_points,
            era_facts.total_reward,
            commission,
            total_stake,
        );

        let mut partial = ValidatorPartial {
            last_era_apy: Some(apy),
            previous_eras_points: BTreeMap::from([(last_era, points)]),
            apy_by_era: BTreeMap::from([(last_era, apy)]),
            ..ValidatorPartial::default()
        };
        if let Some(stake) = stake {
            partial.total_stake = Some(stake.total);
            partial.own_stake = Some(stake.own);
        }
        self.inner.cache.write().merge(address, partial);
    }

    /// Select a validator for historical drill-down (or deselect with `None`). Fetches the
    /// historical series if the cached coverage is insufficient, then computes per-era APY.
    /// Results of a superseded selection still land in the cache but are not displayed.
    pub async fn select_validator(&self, address: Option<ValidatorAddress>) {
        self.inner.state.write().selected = address.clone();
        let Some(address) = address else {
            return;
        };

        self.inner
            .flags
            .loading_historical
            .store(true, Ordering::SeqCst);
        self.fetch_historical_performance(&address, false).await;
        self.compute_historical_apy(&address).await;
        self.inner
            .flags
            .loading_historical
            .store(false, Ordering::SeqCst);
    }

    /// Clamp and set the historical window length. With a validator selected this forces a
    /// refetch of its series and APY, bypassing the coverage check.
    pub async fn set_history_length(&self, length: u32) {
        let selected = {
            let mut state = self.inner.state.write();
            let max_length = MAX_HISTORY_LENGTH.min(state.active_era).max(1);
            state.history_length = length.clamp(1, max_length);
            state.selected.clone()
        };

        if let Some(address) = selected {
            self.inner
                .flags
                .loading_historical
                .store(true, Ordering::SeqCst);
            self.fetch_historical_performance(&address, true).await;
            self.compute_historical_apy(&address).await;
            self.inner
                .flags
                .loading_historical
                .store(false, Ordering::SeqCst);
        }
    }

    /// Backfill points, reward share and commission for every era of the selected window.
    /// Skipped when the cache already covers the window, unless forced.
    async fn fetch_historical_performance(&self, address: &ValidatorAddress, force: bool) {
        let (last_era, length) = self.history_window();
        if !force {
            let covered = self
                .inner
                .cache
                .read()
                .get(address)
                .map(|record| record.covers_history(last_era, length))
                .unwrap_or_default();
            if covered {
                debug!(address:% = address; "historical performance already cached");
                return;
            }
        }

        let eras = history_window(last_era, length).collect::<Vec<_>>();
        run_batched(&eras, self.inner.config.history_batch_size, |era| {
            let era = *era;
            async move { self.fetch_era_performance(address, era).await }
        })
        .await;
    }

    /// One era of the historical backfill: points, validator reward share, commission.
    async fn fetch_era_performance(&self, address: &ValidatorAddress, era: EraIndex) {
        let reward_points = self.chain.get_era_reward_points(era).await;
        let total_reward = self.chain.get_era_total_reward(era).await;
        let preferences = self.chain.get_era_validator_preferences(era, address).await;

        let (reward_points, total_reward, preferences) =
            match (reward_points, total_reward, preferences) {
                (Ok(reward_points), Ok(total_reward), Ok(preferences)) => {
                    (reward_points, total_reward, preferences)
                }
                _ => {
                    self.push_warning(format!("history fetch for era {era} failed: {address}"));
                    counter!("aggregator_fetch_failures_total").increment(1);
                    self.inner.cache.write().merge(
                        address,
                        ValidatorPartial {
                            failed_eras: BTreeSet::from([era]),
                            ..ValidatorPartial::default()
                        },
                    );
                    return;
                }
            };

        let (points, total_points) = reward_points
            .map(|reward_points| {
                let points = reward_points
                    .individual
                    .iter()
                    .find(|(a, _)| a == address)
                    .map(|(_, points)| *points)
                    .unwrap_or_default();
                (points, reward_points.total)
            })
            .unwrap_or_default();
        let reward = validator_reward_share(total_reward.unwrap_or_default(), points, total_points);

        let mut partial = ValidatorPartial {
            previous_eras_points: BTreeMap::from([(era, points)]),
            previous_eras_rewards: BTreeMap::from([(era, reward)]),
            ..ValidatorPartial::default()
        };
        if let Some(preferences) = preferences {
            partial.historical_commission = BTreeMap::from([(era, preferences.commission)]);
        }
        self.inner.cache.write().merge(address, partial);
    }

    /// Per-era APY over the selected validator's window, in small batches. A per-era query
    /// failure sets that era's APY to zero and records a soft warning rather than failing the
    /// whole series.
    pub async fn compute_historical_apy(&self, address: &ValidatorAddress) {
        let (last_era, length) = self.history_window();
        let eras = history_window(last_era, length).collect::<Vec<_>>();

        run_batched(&eras, self.inner.config.history_batch_size, |era| {
            let era = *era;
            async move { self.compute_era_apy(address, era).await }
        })
        .await;
    }

    async fn compute_era_apy(&self, address: &ValidatorAddress, era: EraIndex) {
        // Points and commission are usually present from the history backfill; only fetch
        // what the cache does not cover.
        let (cached_points, cached_commission) = {
            let cache = self.inner.cache.read();
            let record = cache.get(address);
            (
                record.and_then(|record| record.performance.previous_eras_points.get(&era).copied()),
                record.and_then(|record| record.historical_commission.get(&era).copied()),
            )
        };

        let result: Result<(Points, Points, Amount, Commission, Amount), C::Error> = async {
            let (points, total_points) = match cached_points {
                Some(points) => {
                    let total_points = self
                        .chain
                        .get_era_reward_points(era)
                        .await?
                        .map(|reward_points| reward_points.total)
                        .unwrap_or_default();
                    (points, total_points)
                }
                None => self
                    .chain
                    .get_era_reward_points(era)
                    .await?
                    .map(|reward_points| {
                        let points = reward_points
                            .individual
                            .iter()
                            .find(|(a, _)| a == address)
                            .map(|(_, points)| *points)
                            .unwrap_or_default();
                        (points, reward_points.total)
                    })
                    .unwrap_or_default(),
            };

            let total_reward = self
                .chain
                .get_era_total_reward(era)
                .await?
                .unwrap_or_default();

            let commission = match cached_commission {
                Some(commission) => commission,
                None => self
                    .chain
                    .get_era_validator_preferences(era, address)
                    .await?
                    .unwrap_or_default()
                    .commission,
            };

            let total_stake = self
                .chain
                .get_era_stake_overview(era, address)
                .await?
                .map(|stake| stake.total)
                .unwrap_or_default();

            Ok((points, total_points, total_reward, commission, total_stake))
        }
        .await;

        let partial = match result {
            Ok((points, total_points, total_reward, commission, total_stake)) => {
                let apy = era_apy(points, total_points, total_reward, commission, total_stake);
                ValidatorPartial {
                    apy_by_era: BTreeMap::from([(era, apy)]),
                    ..ValidatorPartial::default()
                }
            }

            Err(error) => {
                self.push_warning(format!("APY for era {era} failed: {error}"));
                counter!("aggregator_fetch_failures_total").increment(1);
                ValidatorPartial {
                    apy_by_era: BTreeMap::from([(era, 0.0)]),
                    failed_eras: BTreeSet::from([era]),
                    ..ValidatorPartial::default()
                }
            }
        };

        self.inner.cache.write().merge(address, partial);
    }

    /// Change the membership filter; rebuilds the projection from scratch and resets to page
    /// one. The cache is untouched.
    pub async fn set_filter(&self, filter: FilterState) {
        {
            let mut state = self.inner.state.write();
            state.filter = filter;
            state.current_page = 1;
        }
        self.apply_filter().await;
        self.load_page(1).await;
    }

    /// Switch to the given page, clamped to the valid range, and hydrate its slice.
    pub async fn set_page(&self, page: usize) {
        let page = {
            let mut state = self.inner.state.write();
            let page = page.clamp(1, total_pages(state.filtered.len(), state.page_size).max(1));
            state.current_page = page;
            page
        };
        self.load_page(page).await;
    }

    /// Change the page size; always resets to page one.
    pub async fn set_page_size(&self, page_size: usize) {
        {
            let mut state = self.inner.state.write();
            state.page_size = page_size.max(1);
            state.current_page = 1;
        }
        self.load_page(1).await;
    }

    /// The hydrated records of the current page slice. Always one row per filtered entry of
    /// the slice, zeroed when a fetch failed or has not completed yet; never triggers a
    /// remote call.
    pub fn displayed_page(&self) -> Vec<ValidatorRecord> {
        // Cache before state, matching the acquisition order used everywhere else.
        let cache = self.inner.cache.read();
        let state = self.inner.state.read();

        page_slice(&state.filtered, state.current_page, state.page_size)
            .into_iter()
            .map(|address| {
                cache
                    .get(&address)
                    .cloned()
                    .unwrap_or_else(|| ValidatorRecord::new(address))
            })
            .collect()
    }

    pub fn total_pages(&self) -> usize {
        let state = self.inner.state.read();
        total_pages(state.filtered.len(), state.page_size)
    }

    pub fn current_page(&self) -> usize {
        self.inner.state.read().current_page
    }

    pub fn total_filtered(&self) -> usize {
        self.inner.state.read().filtered.len()
    }

    pub fn total_validators(&self) -> usize {
        self.inner.state.read().ranking.len()
    }

    pub fn active_era(&self) -> EraIndex {
        self.inner.state.read().active_era
    }

    pub fn history_length(&self) -> u32 {
        self.inner.state.read().history_length
    }

    pub fn selected_validator(&self) -> Option<ValidatorAddress> {
        self.inner.state.read().selected.clone()
    }

    /// The historical series of the given validator over the current window, read from the
    /// cache. `None` when the validator has no record yet.
    pub fn historical_series(&self, address: &ValidatorAddress) -> Option<HistoricalSeries> {
        let (last_era, length) = self.history_window();
        self.inner
            .cache
            .read()
            .get(address)
            .map(|record| record.historical_series(last_era, length))
    }

    /// Snapshot of a single cached record.
    pub fn record(&self, address: &ValidatorAddress) -> Option<ValidatorRecord> {
        self.inner.cache.read().get(address).cloned()
    }

    pub fn loading(&self) -> bool {
        self.inner.flags.loading.load(Ordering::SeqCst)
    }

    pub fn loading_page(&self) -> bool {
        self.inner.flags.loading_page.load(Ordering::SeqCst)
    }

    pub fn loading_apy(&self) -> bool {
        self.inner.flags.loading_apy.load(Ordering::SeqCst)
    }

    pub fn loading_historical(&self) -> bool {
        self.inner.flags.loading_historical.load(Ordering::SeqCst)
    }

    pub fn last_era_apy_ready(&self) -> bool {
        self.inner.state.read().last_era_apy_ready
    }

    /// The last session error, retained until overwritten or cleared.
    pub fn error(&self) -> Option<String> {
        self.inner.state.read().error.clone()
    }

    pub fn clear_error(&self) {
        self.inner.state.write().error = None;
    }

    /// Soft warnings from per-item fetch failures, oldest first.
    pub fn warnings(&self) -> Vec<String> {
        self.inner.state.read().warnings.clone()
    }

    fn history_window(&self) -> (EraIndex, u32) {
        let state = self.inner.state.read();
        (state.active_era.saturating_sub(1), state.history_length)
    }

    fn record_fetch_failure(&self, address: &ValidatorAddress, error: &C::Error) {
        counter!("aggregator_fetch_failures_total").increment(1);
        self.push_warning(format!("fetch for {address} failed: {error}"));
    }

    fn push_warning(&self, warning: String) {
        warn!(warning:% = warning; "partial fetch failure");
        self.inner.state.write().warnings.push(warning);
    }
}

/// Era-level APY inputs shared by every validator of one era.
#[derive(Debug, Clone)]
struct EraFacts {
    points_by_address: Arc<BTreeMap<ValidatorAddress, Points>>,
    total_points: Points,
    total_reward: Amount,
}

/// `floor(total_reward * points / total_points)`, zero when the era had no points.
fn validator_reward_share(total_reward: Amount, points: Points, total_points: Points) -> Amount {
    if total_points == 0 {
        return 0;
    }
    total_reward * points as u128 / total_points as u128
}

fn total_pages(filtered_len: usize, page_size: usize) -> usize {
    filtered_len.div_ceil(page_size.max(1))
}

fn page_slice(
    filtered: &[FilteredEntry],
    page: usize,
    page_size: usize,
) -> Vec<ValidatorAddress> {
    let start = (page.max(1) - 1) * page_size;
    filtered
        .iter()
        .skip(start)
        .take(page_size)
        .map(|entry| entry.address.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::node::{StakeOverview, ValidatorPreferences};
    use assert_matches::assert_matches;
    use std::{
        collections::{HashMap, HashSet},
        sync::atomic::AtomicUsize,
        time::Duration,
    };
    use thiserror::Error;
    use tokio::time::{sleep, timeout};

    #[derive(Debug, Error)]
    #[error("mock chain failure")]
    struct MockError;

    #[derive(Debug, Default)]
    struct MockData {
        active_era: Option<EraIndex>,
        validators: Vec<ValidatorAddress>,
        era_points: HashMap<EraIndex, EraRewardPoints>,
        era_total_rewards: HashMap<EraIndex, Amount>,
        preferences: HashMap<ValidatorAddress, ValidatorPreferences>,
        era_preferences: HashMap<(EraIndex, ValidatorAddress), ValidatorPreferences>,
        stakes: HashMap<(EraIndex, ValidatorAddress), StakeOverview>,
        // Togglable so tests can let a validator fail first and recover later.
        failing: RwLock<HashSet<ValidatorAddress>>,
        failing_total_rewards: bool,
        stake_calls: AtomicUsize,
        era_points_calls: AtomicUsize,
    }

    #[derive(Debug, Clone, Default)]
    struct MockChain(Arc<MockData>);

    impl ChainQuery for MockChain {
        type Error = MockError;

        async fn get_active_era(&self) -> Result<Option<EraIndex>, Self::Error> {
            Ok(self.0.active_era)
        }

        async fn get_era_total_reward(&self, era: EraIndex) -> Result<Option<Amount>, Self::Error> {
            if self.0.failing_total_rewards {
                return Err(MockError);
            }
            Ok(self.0.era_total_rewards.get(&era).copied())
        }

        async fn get_era_reward_points(
            &self,
            era: EraIndex,
        ) -> Result<Option<EraRewardPoints>, Self::Error> {
            self.0.era_points_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.0.era_points.get(&era).cloned())
        }

        async fn get_validator_set(&self) -> Result<Vec<ValidatorAddress>, Self::Error> {
            Ok(self.0.validators.clone())
        }

        async fn get_validator_preferences(
            &self,
            validator: &ValidatorAddress,
        ) -> Result<Option<ValidatorPreferences>, Self::Error> {
            if self.0.failing.read().contains(validator) {
                return Err(MockError);
            }
            Ok(self.0.preferences.get(validator).copied())
        }

        async fn get_era_validator_preferences(
            &self,
            era: EraIndex,
            validator: &ValidatorAddress,
        ) -> Result<Option<ValidatorPreferences>, Self::Error> {
            if self.0.failing.read().contains(validator) {
                return Err(MockError);
            }
            Ok(self
                .0
                .era_preferences
                .get(&(era, validator.clone()))
                .copied())
        }

        async fn get_era_stake_overview(
            &self,
            era: EraIndex,
            validator: &ValidatorAddress,
        ) -> Result<Option<StakeOverview>, Self::Error> {
            self.0.stake_calls.fetch_add(1, Ordering::SeqCst);
            // Give interleaved jobs a chance to overlap.
            sleep(Duration::from_millis(1)).await;
            if self.0.failing.read().contains(validator) {
                return Err(MockError);
            }
            Ok(self.0.stakes.get(&(era, validator.clone())).copied())
        }
    }

    fn addr(s: &str) -> ValidatorAddress {
        s.try_into().expect("address should not be empty")
    }

    async fn wait_for_apy(engine: &Aggregator<MockChain>) {
        timeout(Duration::from_secs(5), async {
            while !engine.last_era_apy_ready() {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("last-era APY job should complete");
    }

    /// Era 100 is active, era 99 completed: validators A and B with the §8-style inputs.
    fn scenario_chain() -> MockChain {
        let a = addr("5A");
        let b = addr("5B");
        let points = EraRewardPoints {
            individual: vec![(a.clone(), 100), (b.clone(), 300)],
            total: 400,
        };

        MockChain(Arc::new(MockData {
            active_era: Some(100),
            validators: vec![a.clone(), b.clone()],
            era_points: HashMap::from([(99, points.clone()), (100, points)]),
            era_total_rewards: HashMap::from([(99, 1_000_000_000_000)]),
            preferences: HashMap::from([(
                a.clone(),
                ValidatorPreferences {
                    commission: Commission::from_parts(100_000_000),
                    blocked: false,
                },
            )]),
            stakes: HashMap::from([(
                (99, a.clone()),
                StakeOverview {
                    total: 500_000_000_000,
                    own: 100_000_000_000,
                },
            )]),
            ..MockData::default()
        }))
    }

    #[tokio::test]
    async fn test_bootstrap_without_active_era() {
        let engine = Aggregator::new(Config::default(), MockChain::default());
        let result = engine.bootstrap().await;

        assert_matches!(result, Err(AggregatorError::DataUnavailable));
        assert_matches!(engine.error(), Some(error) if error.contains("no active era"));
    }

    #[tokio::test]
    async fn test_bootstrap_and_last_era_apy() {
        let engine = Aggregator::new(Config::default(), scenario_chain());
        engine.bootstrap().await.expect("bootstrap should succeed");

        assert_eq!(engine.active_era(), 100);
        assert_eq!(engine.total_validators(), 2);
        assert_eq!(engine.total_filtered(), 2);

        wait_for_apy(&engine).await;

        // validator_reward = floor(1e12 * 100/400) = 250e9; nominator share at 10% commission
        // is 225e9; over a 500e9 stake that annualizes to 0.45 * 365.25 * 100.
        let record = engine.record(&addr("5A")).expect("record should exist");
        let apy = record.last_era_apy.expect("APY should be resolved");
        assert!((apy - 16_436.25).abs() < 1e-9);
        assert_eq!(record.rewards.apy_by_era.get(&99), Some(&apy));

        // B has no stake data for era 99, so its APY is zero by policy and A sorts first.
        let page = engine.displayed_page();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].address, addr("5A"));
        assert_eq!(page[1].last_era_apy, Some(0.0));
    }

    #[tokio::test]
    async fn test_pagination() {
        let validators = (0..25).map(|n| addr(&format!("5V{n:02}"))).collect::<Vec<_>>();
        let points = EraRewardPoints {
            individual: validators
                .iter()
                .enumerate()
                .map(|(n, address)| (address.clone(), 25 - n as Points))
                .collect(),
            total: 325,
        };
        let chain = MockChain(Arc::new(MockData {
            active_era: Some(10),
            validators: validators.clone(),
            era_points: HashMap::from([(9, points.clone()), (10, points)]),
            ..MockData::default()
        }));

        let engine = Aggregator::new(Config::default(), chain);
        engine.bootstrap().await.expect("bootstrap should succeed");

        assert_eq!(engine.total_filtered(), 25);
        assert_eq!(engine.total_pages(), 3);
        assert_eq!(engine.current_page(), 1);
        assert_eq!(engine.displayed_page().len(), 10);

        engine.set_page(3).await;
        assert_eq!(engine.current_page(), 3);
        assert_eq!(engine.displayed_page().len(), 5);

        // Out-of-range pages clamp instead of failing.
        engine.set_page(17).await;
        assert_eq!(engine.current_page(), 3);
        engine.set_page(0).await;
        assert_eq!(engine.current_page(), 1);

        engine.set_page(2).await;
        engine.set_page_size(7).await;
        assert_eq!(engine.current_page(), 1);
        assert_eq!(engine.total_pages(), 4);
        assert_eq!(engine.displayed_page().len(), 7);
    }

    #[tokio::test]
    async fn test_filter_toggle_resets_page() {
        let validators = (0..15).map(|n| addr(&format!("5V{n:02}"))).collect::<Vec<_>>();
        let points = EraRewardPoints {
            individual: validators
                .iter()
                .map(|address| (address.clone(), 10))
                .collect(),
            total: 150,
        };
        // The first five validators take full commission.
        let preferences = validators
            .iter()
            .enumerate()
            .map(|(n, address)| {
                let commission = if n < 5 {
                    Commission::FULL
                } else {
                    Commission::from_parts(50_000_000)
                };
                (
                    address.clone(),
                    ValidatorPreferences {
                        commission,
                        blocked: false,
                    },
                )
            })
            .collect();
        let chain = MockChain(Arc::new(MockData {
            active_era: Some(10),
            validators: validators.clone(),
            era_points: HashMap::from([(10, points)]),
            preferences,
            ..MockData::default()
        }));

        let engine = Aggregator::new(
            Config {
                page_size: 5,
                ..Config::default()
            },
            chain,
        );
        engine.bootstrap().await.expect("bootstrap should succeed");
        assert_eq!(engine.total_filtered(), 15);

        engine.set_page(2).await;
        assert_eq!(engine.current_page(), 2);

        engine
            .set_filter(FilterState {
                include_full_commission: false,
                include_blocked_nominations: true,
            })
            .await;

        assert_eq!(engine.current_page(), 1);
        assert_eq!(engine.total_filtered(), 10);
        for record in engine.displayed_page() {
            assert!(!record.commission.is_full());
        }
    }

    #[tokio::test]
    async fn test_failed_fetch_still_renders_row() {
        let a = addr("5A");
        let b = addr("5B");
        let points = EraRewardPoints {
            individual: vec![(a.clone(), 10), (b.clone(), 20)],
            total: 30,
        };
        let chain = MockChain(Arc::new(MockData {
            active_era: Some(10),
            validators: vec![a.clone(), b.clone()],
            era_points: HashMap::from([(9, points.clone()), (10, points)]),
            failing: RwLock::new(HashSet::from([a.clone()])),
            ..MockData::default()
        }));

        let engine = Aggregator::new(Config::default(), chain);
        engine.bootstrap().await.expect("bootstrap should succeed");

        // Both rows present despite A failing every detail query.
        let page = engine.displayed_page();
        assert_eq!(page.len(), 2);
        let failed = page
            .iter()
            .find(|record| record.address == a)
            .expect("row for the failing validator");
        assert_eq!(failed.detail, FetchStatus::Failed);
        assert_eq!(failed.commission, Commission::ZERO);
        assert_eq!(failed.total_stake, 0);

        assert!(!engine.warnings().is_empty());
        assert_matches!(engine.error(), None);
    }

    #[tokio::test]
    async fn test_reinvocation_retries_failed_fetches() {
        let a = addr("5A");
        let b = addr("5B");
        let points = EraRewardPoints {
            individual: vec![(a.clone(), 10), (b.clone(), 20)],
            total: 30,
        };
        let chain = MockChain(Arc::new(MockData {
            active_era: Some(10),
            validators: vec![a.clone(), b.clone()],
            era_points: HashMap::from([(9, points.clone()), (10, points)]),
            preferences: HashMap::from([(
                a.clone(),
                ValidatorPreferences {
                    commission: Commission::from_parts(100_000_000),
                    blocked: false,
                },
            )]),
            stakes: HashMap::from([(
                (10, a.clone()),
                StakeOverview {
                    total: 500_000_000_000,
                    own: 100_000_000_000,
                },
            )]),
            failing: RwLock::new(HashSet::from([a.clone()])),
            ..MockData::default()
        }));

        let engine = Aggregator::new(Config::default(), chain.clone());
        engine.bootstrap().await.expect("bootstrap should succeed");

        let record = engine.record(&a).expect("record should exist");
        assert_eq!(record.prefs, FetchStatus::Failed);
        assert_eq!(record.detail, FetchStatus::Failed);

        // The chain recovers; loading the page again must fetch the failed record anew
        // instead of pinning it to the zeroed default forever.
        chain.0.failing.write().clear();
        engine.set_page(1).await;

        let record = engine.record(&a).expect("record should exist");
        assert_eq!(record.prefs, FetchStatus::Fetched);
        assert_eq!(record.detail, FetchStatus::Fetched);
        assert_eq!(record.commission, Commission::from_parts(100_000_000));
        assert_eq!(record.total_stake, 500_000_000_000);
    }

    #[tokio::test]
    async fn test_total_reward_failure_is_soft() {
        let a = addr("5A");
        let points = EraRewardPoints {
            individual: vec![(a.clone(), 10)],
            total: 10,
        };
        let chain = MockChain(Arc::new(MockData {
            active_era: Some(10),
            validators: vec![a.clone()],
            era_points: HashMap::from([(10, points)]),
            failing_total_rewards: true,
            ..MockData::default()
        }));

        let engine = Aggregator::new(Config::default(), chain);
        engine.bootstrap().await.expect("bootstrap should succeed");

        // A failing reward query must not fail bootstrap, only leave a warning behind.
        assert_matches!(engine.error(), None);
        assert!(
            engine
                .warnings()
                .iter()
                .any(|warning| warning.contains("total reward for era 10"))
        );
    }

    #[tokio::test]
    async fn test_historical_drill_down() {
        let a = addr("5A");
        let mut era_points = HashMap::new();
        let mut era_total_rewards = HashMap::new();
        let mut era_preferences = HashMap::new();
        let mut stakes = HashMap::new();
        for era in 95..=100 {
            era_points.insert(
                era,
                EraRewardPoints {
                    individual: vec![(a.clone(), 100)],
                    total: 400,
                },
            );
            era_total_rewards.insert(era, 1_000_000_000_000);
            era_preferences.insert(
                (era, a.clone()),
                ValidatorPreferences {
                    commission: Commission::from_parts(100_000_000),
                    blocked: false,
                },
            );
            stakes.insert(
                (era, a.clone()),
                StakeOverview {
                    total: 500_000_000_000,
                    own: 100_000_000_000,
                },
            );
        }
        let chain = MockChain(Arc::new(MockData {
            active_era: Some(100),
            validators: vec![a.clone()],
            era_points,
            era_total_rewards,
            era_preferences,
            stakes,
            ..MockData::default()
        }));

        let engine = Aggregator::new(
            Config {
                history_length: 3,
                ..Config::default()
            },
            chain.clone(),
        );
        engine.bootstrap().await.expect("bootstrap should succeed");
        wait_for_apy(&engine).await;

        engine.select_validator(Some(a.clone())).await;
        assert_eq!(engine.selected_validator(), Some(a.clone()));

        let series = engine.historical_series(&a).expect("series should exist");
        assert_eq!(series.eras, vec![99, 98, 97]);
        assert_eq!(series.points, vec![100, 100, 100]);
        for apy in &series.apy {
            assert!((apy - 16_436.25).abs() < 1e-9);
        }

        let record = engine.record(&a).expect("record should exist");
        assert!((record.rewards.average_apy - 16_436.25).abs() < 1e-9);
        assert_eq!(
            record.rewards.average_apy,
            record.rewards.active_only_average_apy
        );
        assert_eq!(record.rewards.previous_eras_rewards.get(&99), Some(&250_000_000_000));

        // Re-selecting with full coverage must not refetch history.
        let calls_before = chain.0.era_points_calls.load(Ordering::SeqCst);
        engine.select_validator(Some(a.clone())).await;
        let history_calls = chain.0.era_points_calls.load(Ordering::SeqCst) - calls_before;
        // Only the per-era APY recomputation queries run again, not the history backfill;
        // with 3 eras that is exactly one points query per era.
        assert_eq!(history_calls, 3);

        // Growing the window forces a refetch of the series.
        engine.set_history_length(5).await;
        assert_eq!(engine.history_length(), 5);
        let series = engine.historical_series(&a).expect("series should exist");
        assert_eq!(series.eras, vec![99, 98, 97, 96, 95]);
    }

    #[tokio::test]
    async fn test_history_length_clamped() {
        let engine = Aggregator::new(Config::default(), scenario_chain());
        engine.bootstrap().await.expect("bootstrap should succeed");

        engine.set_history_length(500).await;
        assert_eq!(engine.history_length(), MAX_HISTORY_LENGTH);

        engine.set_history_length(0).await;
        assert_eq!(engine.history_length(), 1);
    }

    #[tokio::test]
    async fn test_last_era_apy_single_flight() {
        let chain = scenario_chain();
        let engine = Aggregator::new(Config::default(), chain.clone());
        engine.bootstrap().await.expect("bootstrap should succeed");
        wait_for_apy(&engine).await;

        let stake_calls_before = chain.0.stake_calls.load(Ordering::SeqCst);
        // Two concurrent invocations: the second must be a no-op while the first is in
        // flight, so the per-validator stake queries run exactly once more per validator.
        tokio::join!(
            engine.compute_last_era_apy_for_all(),
            engine.compute_last_era_apy_for_all(),
        );
        let stake_calls = chain.0.stake_calls.load(Ordering::SeqCst) - stake_calls_before;
        assert_eq!(stake_calls, 2);
    }

    #[tokio::test]
    async fn test_deselect_keeps_cache() {
        let engine = Aggregator::new(Config::default(), scenario_chain());
        engine.bootstrap().await.expect("bootstrap should succeed");
        wait_for_apy(&engine).await;

        let a = addr("5A");
        engine.select_validator(Some(a.clone())).await;
        engine.select_validator(None).await;

        // The drill-down results of the superseded selection stay cached; only the display
        // follows the latest selection.
        assert_eq!(engine.selected_validator(), None);
        let record = engine.record(&a).expect("record should exist");
        assert!(!record.rewards.apy_by_era.is_empty());
    }

    #[tokio::test]
    async fn test_merge_is_additive_across_jobs() {
        let engine = Aggregator::new(Config::default(), scenario_chain());
        engine.bootstrap().await.expect("bootstrap should succeed");
        wait_for_apy(&engine).await;

        let a = addr("5A");
        let before = engine.record(&a).expect("record should exist");

        // A later, narrower merge must not erase previously known eras.
        engine.compute_historical_apy(&a).await;
        let after = engine.record(&a).expect("record should exist");
        assert!(after.rewards.apy_by_era.len() >= before.rewards.apy_by_era.len());
        assert_eq!(after.commission, before.commission);
    }
}
