// This file is part of validator-aggregator.
// Copyright (C) 2025 Midnight Foundation
// SPDX-License-Identifier: Apache-2.0

use std::error::Error as StdError;

/// Boxed error, mainly to be used as value for error sources.
pub type BoxError = Box<dyn StdError + Send + Sync>;
