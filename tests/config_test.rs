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
//! Integration tests for config loading and the values scans resolve from it.

use std::time::Duration;

use crate::common::{TestConfig, test_query_id};
use olapscan::common::config::ScanOptions;
use olapscan::olapscan_config::OlapScanConfig;
use olapscan::olapscan_logging;
use olapscan::runtime::runtime_state::RuntimeState;

mod common;

#[test]
fn test_scan_settings_come_from_config_file() {
    let test_config = TestConfig::new().expect("test config");
    let cfg = test_config.load_config().expect("load config");
    olapscan_logging::init_from_config(cfg);
    assert_eq!(cfg.effective_log_filter(), "debug");
    assert_eq!(cfg.scan.actual_scan_threads(), 2);

    let options = ScanOptions::from_config();
    assert_eq!(options.buffer_capacity, 4);
    assert_eq!(options.scan_batch_chunks, 2);
    assert_eq!(options.scanners_per_tablet, 16);
    assert_eq!(options.yield_max_time_spent, Duration::from_millis(50));
    assert_eq!(options.yield_preempt_max_time_spent, Duration::from_millis(10));
    assert!(options.use_page_cache);

    let state = RuntimeState::new(test_query_id());
    assert_eq!(state.chunk_size(), 1024);
    assert_eq!(state.query_id(), Some(test_query_id()));
}

#[test]
fn test_invalid_config_is_rejected_with_context() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("broken.toml");
    std::fs::write(&path, "[scan]\nchunk_size = 0\n").expect("write config");
    let err = OlapScanConfig::load_from_file(&path).expect_err("zero chunk size");
    let chain = format!("{err:#}");
    assert!(chain.contains("broken.toml"), "err={chain}");
    assert!(chain.contains("scan.chunk_size must be positive"), "err={chain}");
}
