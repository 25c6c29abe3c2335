// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
use std::time::Duration;

use crate::olapscan_config::config as olapscan_app_config;

pub(crate) fn chunk_size() -> usize {
    olapscan_app_config()
        .ok()
        .map(|c| c.scan.chunk_size)
        .unwrap_or(4096)
}

pub(crate) fn operator_buffer_chunks() -> usize {
    olapscan_app_config()
        .ok()
        .map(|c| c.scan.operator_buffer_chunks)
        .unwrap_or(8)
}

pub(crate) fn scan_batch_chunks() -> usize {
    olapscan_app_config()
        .ok()
        .map(|c| c.scan.scan_batch_chunks)
        .unwrap_or(4)
}

pub(crate) fn scanners_per_tablet() -> usize {
    olapscan_app_config()
        .ok()
        .map(|c| c.scan.scanners_per_tablet)
        .unwrap_or(64)
}

pub(crate) fn max_scan_key_num() -> usize {
    olapscan_app_config()
        .ok()
        .map(|c| c.scan.max_scan_key_num)
        .unwrap_or(1024)
}

pub(crate) fn max_pushdown_conditions_per_column() -> usize {
    olapscan_app_config()
        .ok()
        .map(|c| c.scan.max_pushdown_conditions_per_column)
        .unwrap_or(1024)
}

pub(crate) fn yield_max_time_spent() -> Duration {
    let ms = olapscan_app_config()
        .ok()
        .map(|c| c.scan.yield_max_time_spent_ms)
        .unwrap_or(100);
    Duration::from_millis(ms)
}

pub(crate) fn yield_preempt_max_time_spent() -> Duration {
    let ms = olapscan_app_config()
        .ok()
        .map(|c| c.scan.yield_preempt_max_time_spent_ms)
        .unwrap_or(20);
    Duration::from_millis(ms)
}

pub(crate) fn disable_storage_page_cache() -> bool {
    olapscan_app_config()
        .ok()
        .map(|c| c.scan.disable_storage_page_cache)
        .unwrap_or(false)
}

pub(crate) fn scan_thread_pool_thread_num() -> usize {
    olapscan_app_config()
        .ok()
        .map(|c| c.scan.actual_scan_threads())
        .unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
}

pub(crate) fn scan_thread_pool_queue_size() -> usize {
    olapscan_app_config()
        .ok()
        .map(|c| c.scan.scan_thread_pool_queue_size)
        .unwrap_or(102_400)
}

/// Scan tuning resolved once per scan operator.
///
/// Built from the process config by default; tests construct it directly to pin thresholds.
/// The row count per chunk is a query setting and lives on `RuntimeState`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScanOptions {
    pub buffer_capacity: usize,
    pub scan_batch_chunks: usize,
    pub scanners_per_tablet: usize,
    pub max_scan_key_num: usize,
    pub max_pushdown_conditions_per_column: usize,
    pub yield_max_time_spent: Duration,
    pub yield_preempt_max_time_spent: Duration,
    pub use_page_cache: bool,
}

impl ScanOptions {
    pub fn from_config() -> Self {
        Self {
            buffer_capacity: operator_buffer_chunks().max(1),
            scan_batch_chunks: scan_batch_chunks().max(1),
            scanners_per_tablet: scanners_per_tablet().max(1),
            max_scan_key_num: max_scan_key_num().max(1),
            max_pushdown_conditions_per_column: max_pushdown_conditions_per_column(),
            yield_max_time_spent: yield_max_time_spent(),
            yield_preempt_max_time_spent: yield_preempt_max_time_spent(),
            use_page_cache: !disable_storage_page_cache(),
        }
    }

    pub fn with_buffer_capacity(mut self, capacity: usize) -> Self {
        self.buffer_capacity = capacity.max(1);
        self
    }

    pub fn with_scan_batch_chunks(mut self, chunks: usize) -> Self {
        self.scan_batch_chunks = chunks.max(1);
        self
    }

    pub fn with_scanners_per_tablet(mut self, scanners: usize) -> Self {
        self.scanners_per_tablet = scanners.max(1);
        self
    }

    pub fn with_yield_thresholds(mut self, max: Duration, preempt: Duration) -> Self {
        self.yield_max_time_spent = max;
        self.yield_preempt_max_time_spent = preempt.min(max);
        self
    }
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            buffer_capacity: 8,
            scan_batch_chunks: 4,
            scanners_per_tablet: 64,
            max_scan_key_num: 1024,
            max_pushdown_conditions_per_column: 1024,
            yield_max_time_spent: Duration::from_millis(100),
            yield_preempt_max_time_spent: Duration::from_millis(20),
            use_page_cache: true,
        }
    }
}
