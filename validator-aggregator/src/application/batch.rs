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

use futures::future;
use std::future::Future;

/// Run `f` over all items in consecutive groups of at most `batch_size`, awaiting each group
/// before starting the next. This bounds the number of simultaneously outstanding futures to
/// `batch_size` and yields between groups so other scheduled work is not starved.
///
/// Per-item outputs are returned in item order. An item-level failure is just an output value
/// (typically `Err`); it never aborts sibling items of the same group.
pub async fn run_batched<T, O, F, Fut>(items: &[T], batch_size: usize, f: F) -> Vec<O>
where
    F: Fn(&T) -> Fut,
    Fut: Future<Output = O>,
{
    let mut outputs = Vec::with_capacity(items.len());

    for group in items.chunks(batch_size.max(1)) {
        let group_outputs = future::join_all(group.iter().map(&f)).await;
        outputs.extend(group_outputs);

        tokio::task::yield_now().await;
    }

    outputs
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };
    use tokio::time::sleep;

    #[tokio::test]
    async fn test_run_batched_bounds_concurrency() {
        let in_flight = AtomicUsize::new(0);
        let max_in_flight = AtomicUsize::new(0);

        let items = (0..23).collect::<Vec<u32>>();
        let outputs = run_batched(&items, 5, |item| {
            let item = *item;
            let in_flight = &in_flight;
            let max_in_flight = &max_in_flight;
            async move {
                let current = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                max_in_flight.fetch_max(current, Ordering::SeqCst);
                sleep(Duration::from_millis(1)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                item
            }
        })
        .await;

        assert_eq!(outputs, items);
        assert!(max_in_flight.load(Ordering::SeqCst) <= 5);
    }

    #[tokio::test]
    async fn test_run_batched_failure_does_not_abort_siblings() {
        let items = vec![1, 2, 3, 4];
        let outputs = run_batched(&items, 2, |item| {
            let item = *item;
            async move {
                if item == 2 {
                    Err("boom")
                } else {
                    Ok(item)
                }
            }
        })
        .await;

        assert_eq!(outputs, vec![Ok(1), Err("boom"), Ok(3), Ok(4)]);
    }

    #[tokio::test]
    async fn test_run_batched_zero_batch_size() {
        let items = vec![1, 2];
        let outputs = run_batched(&items, 0, |item| future::ready(*item)).await;
        assert_eq!(outputs, vec![1, 2]);
    }
}
