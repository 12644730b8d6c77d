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

use logforth::{append, filter::env_filter::EnvFilterBuilder};

/// Initialize logging to stderr, filtered via the `RUST_LOG` environment variable.
///
/// To be called once and early by the embedding process, before any engine operation.
pub fn init_logging() {
    logforth::starter_log::builder()
        .dispatch(|dispatch| {
            dispatch
                .filter(EnvFilterBuilder::from_default_env().build())
                .append(append::Stderr::default())
        })
        .apply();
}
