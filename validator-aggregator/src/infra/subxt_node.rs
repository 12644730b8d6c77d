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

use crate::{
    domain::{
        Amount, Commission, EraIndex, ValidatorAddress,
        node::{ChainQuery, EraRewardPoints, StakeOverview, ValidatorPreferences},
    },
    error::BoxError,
};
use serde::Deserialize;
use std::{str::FromStr, time::Duration};
use subxt::{
    OnlineClient, PolkadotConfig,
    backend::rpc::reconnecting_rpc_client::{ExponentialBackoff, RpcClient},
    dynamic::{self, DecodedValueThunk, Value},
    utils::AccountId32,
};
use thiserror::Error;

/// Config for node connection.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub url: String,

    #[serde(with = "humantime_serde")]
    pub reconnect_max_delay: Duration,

    pub reconnect_max_attempts: usize,
}

/// A [ChainQuery] implementation based on subxt, reading the staking pallet storage of a
/// substrate chain via dynamic queries at the latest finalized state.
#[derive(Debug, Clone)]
pub struct SubxtChainQuery {
    online_client: OnlineClient<PolkadotConfig>,
}

impl SubxtChainQuery {
    /// Create a new [SubxtChainQuery] with the given [Config].
    pub async fn new(config: Config) -> Result<Self, Error> {
        let Config {
            url,
            reconnect_max_delay,
            reconnect_max_attempts,
        } = config;

        let retry_policy = ExponentialBackoff::from_millis(10)
            .max_delay(reconnect_max_delay)
            .take(reconnect_max_attempts);
        let rpc_client = RpcClient::builder()
            .retry_policy(retry_policy)
            .build(&url)
            .await
            .map_err(|error| Error::RpcClient(error.into()))?;

        let online_client =
            OnlineClient::<PolkadotConfig>::from_rpc_client(rpc_client.clone()).await?;

        Ok(Self { online_client })
    }

    async fn fetch(
        &self,
        pallet: &'static str,
        entry: &'static str,
        keys: Vec<Value>,
    ) -> Result<Option<DecodedValueThunk>, SubxtChainQueryError> {
        let query = dynamic::storage(pallet, entry, keys);
        let storage = self
            .online_client
            .storage()
            .at_latest()
            .await
            .map_err(|error| SubxtChainQueryError::GetStorage(entry, error.into()))?;
        storage
            .fetch(&query)
            .await
            .map_err(|error| SubxtChainQueryError::GetStorage(entry, error.into()))
    }
}

impl ChainQuery for SubxtChainQuery {
    type Error = SubxtChainQueryError;

    async fn get_active_era(&self) -> Result<Option<EraIndex>, Self::Error> {
        let value = self.fetch("Staking", "ActiveEra", vec![]).await?;

        // ActiveEraInfo is { index, start }.
        value
            .map(|value| {
                let (index, _start) = value
                    .as_type::<(EraIndex, Option<u64>)>()
                    .map_err(|error| SubxtChainQueryError::Decode("ActiveEra", error.into()))?;
                Ok(index)
            })
            .transpose()
    }

    async fn get_era_total_reward(&self, era: EraIndex) -> Result<Option<Amount>, Self::Error> {
        let value = self
            .fetch(
                "Staking",
                "ErasValidatorReward",
                vec![Value::u128(era as u128)],
            )
            .await?;

        value
            .map(|value| {
                value
                    .as_type::<Amount>()
                    .map_err(|error| {
                        SubxtChainQueryError::Decode("ErasValidatorReward", error.into())
                    })
            })
            .transpose()
    }

    async fn get_era_reward_points(
        &self,
        era: EraIndex,
    ) -> Result<Option<EraRewardPoints>, Self::Error> {
        let value = self
            .fetch(
                "Staking",
                "ErasRewardPoints",
                vec![Value::u128(era as u128)],
            )
            .await?;

        value
            .map(|value| {
                // EraRewardPoints is { total, individual }.
                let (total, individual) = value
                    .as_type::<(u32, Vec<(AccountId32, u32)>)>()
                    .map_err(|error| {
                        SubxtChainQueryError::Decode("ErasRewardPoints", error.into())
                    })?;
                let individual = individual
                    .into_iter()
                    .map(|(account, points)| (ValidatorAddress(account.to_string()), points))
                    .collect();
                Ok(EraRewardPoints { individual, total })
            })
            .transpose()
    }

    async fn get_validator_set(&self) -> Result<Vec<ValidatorAddress>, Self::Error> {
        let value = self.fetch("Session", "Validators", vec![]).await?;

        let accounts = value
            .map(|value| {
                value
                    .as_type::<Vec<AccountId32>>()
                    .map_err(|error| SubxtChainQueryError::Decode("Validators", error.into()))
            })
            .transpose()?
            .unwrap_or_default();

        Ok(accounts
            .into_iter()
            .map(|account| ValidatorAddress(account.to_string()))
            .collect())
    }

    async fn get_validator_preferences(
        &self,
        validator: &ValidatorAddress,
    ) -> Result<Option<ValidatorPreferences>, Self::Error> {
        let account = parse_account(validator)?;
        let value = self
            .fetch(
                "Staking",
                "Validators",
                vec![Value::from_bytes(account.0)],
            )
            .await?;

        value.map(|value| decode_preferences(&value)).transpose()
    }

    async fn get_era_validator_preferences(
        &self,
        era: EraIndex,
        validator: &ValidatorAddress,
    ) -> Result<Option<ValidatorPreferences>, Self::Error> {
        let account = parse_account(validator)?;
        let value = self
            .fetch(
                "Staking",
                "ErasValidatorPrefs",
                vec![Value::u128(era as u128), Value::from_bytes(account.0)],
            )
            .await?;

        value.map(|value| decode_preferences(&value)).transpose()
    }

    async fn get_era_stake_overview(
        &self,
        era: EraIndex,
        validator: &ValidatorAddress,
    ) -> Result<Option<StakeOverview>, Self::Error> {
        let account = parse_account(validator)?;
        let value = self
            .fetch(
                "Staking",
                "ErasStakersOverview",
                vec![Value::u128(era as u128), Value::from_bytes(account.0)],
            )
            .await?;

        value
            .map(|value| {
                // PagedExposureMetadata is { total, own, nominator_count, page_count }.
                let (total, own, _nominator_count, _page_count) = value
                    .as_type::<(Amount, Amount, u32, u32)>()
                    .map_err(|error| {
                        SubxtChainQueryError::Decode("ErasStakersOverview", error.into())
                    })?;
                Ok(StakeOverview { total, own })
            })
            .transpose()
    }
}

/// ValidatorPrefs is { commission: Perbill, blocked }.
fn decode_preferences(
    value: &DecodedValueThunk,
) -> Result<ValidatorPreferences, SubxtChainQueryError> {
    let (commission, blocked) = value
        .as_type::<(u32, bool)>()
        .map_err(|error| SubxtChainQueryError::Decode("ValidatorPrefs", error.into()))?;

    Ok(ValidatorPreferences {
        commission: Commission::from_parts(commission),
        blocked,
    })
}

fn parse_account(validator: &ValidatorAddress) -> Result<AccountId32, SubxtChainQueryError> {
    AccountId32::from_str(validator)
        .map_err(|_| SubxtChainQueryError::InvalidAddress(validator.clone()))
}

/// Error possibly returned by [SubxtChainQuery::new].
#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot create reconnecting subxt RPC client")]
    RpcClient(#[source] BoxError),

    #[error("cannot create subxt online client")]
    OnlineClient(#[from] subxt::Error),
}

/// Error possibly returned by each [ChainQuery] operation.
#[derive(Debug, Error)]
pub enum SubxtChainQueryError {
    #[error("cannot fetch {0} storage entry")]
    GetStorage(&'static str, #[source] Box<subxt::Error>),

    #[error("cannot decode {0} storage value")]
    Decode(&'static str, #[source] BoxError),

    #[error("invalid validator address {0}")]
    InvalidAddress(ValidatorAddress),
}
