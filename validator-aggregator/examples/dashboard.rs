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

use anyhow::Context;
use std::time::Duration;
use tokio::time::sleep;
use validator_aggregator::{
    application::{Aggregator, Config},
    infra::subxt_node::{Config as NodeConfig, SubxtChainQuery},
    telemetry,
};

/// This program connects to a local node, bootstraps an aggregation session and prints the
/// first page of the ranked validator list plus the historical series of the top validator.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init_logging();

    let node_config = NodeConfig {
        url: "ws://localhost:9944".to_string(),
        reconnect_max_delay: Duration::from_secs(1),
        reconnect_max_attempts: 3,
    };
    let chain = SubxtChainQuery::new(node_config)
        .await
        .context("create SubxtChainQuery")?;

    let engine = Aggregator::new(Config::default(), chain);
    engine
        .bootstrap()
        .await
        .context("bootstrap aggregation session")?;

    // Give the background job a moment to resolve the last-era APYs.
    for _ in 0..100 {
        if engine.last_era_apy_ready() {
            break;
        }
        sleep(Duration::from_millis(100)).await;
    }

    println!("## ACTIVE ERA: {}", engine.active_era());
    println!(
        "## VALIDATORS: {} ranked, {} after filter, page 1/{}",
        engine.total_validators(),
        engine.total_filtered(),
        engine.total_pages()
    );
    for record in engine.displayed_page() {
        println!(
            "    ## VALIDATOR: address={}, \tpoints={}, commission={:.1}%, stake={}, apy={:.2}%",
            record.address,
            record.performance.current_era_points,
            record.commission.as_fraction() * 100.0,
            record.total_stake,
            record.last_era_apy.unwrap_or_default()
        );
    }

    if let Some(top) = engine.displayed_page().into_iter().next() {
        engine.select_validator(Some(top.address.clone())).await;
        if let Some(series) = engine.historical_series(&top.address) {
            println!("## HISTORY: address={}", top.address);
            for (n, era) in series.eras.iter().enumerate() {
                println!(
                    "    ## ERA {era}: points={}, reward={}, apy={:.2}%",
                    series.points[n], series.rewards[n], series.apy[n]
                );
            }
        }
    }

    for warning in engine.warnings() {
        eprintln!("## WARNING: {warning}");
    }

    Ok(())
}
