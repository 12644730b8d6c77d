// This file is part of validator-aggregator.
// Copyright (C) 2025 Midnight Foundation
// SPDX-License-Identifier: Apache-2.0

use crate::{application, infra};
use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::de::DeserializeOwned;

#[derive(Debug, Clone, serde::Deserialize)]
pub struct Config {
    #[serde(rename = "application")]
    pub application_config: application::Config,

    #[serde(rename = "infra")]
    pub infra_config: infra::subxt_node::Config,
}

/// Extension methods for "config" structs which can be deserialized.
pub trait ConfigExt
where
    Self: DeserializeOwned,
{
    /// Load configuration from the `config.yaml` file, overridden by `APP__` prefixed and
    /// `__` separated environment variables.
    fn load() -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Yaml::file("config.yaml"))
            .merge(Env::prefixed("APP__").split("__"))
            .extract()
    }
}

impl<T> ConfigExt for T where T: DeserializeOwned {}
