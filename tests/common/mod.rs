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
//! Common utilities and helpers for integration tests.
#![allow(dead_code)]
#![allow(unused_imports)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use arrow::array::{Int32Array, Int64Array, RecordBatch, StringArray};
use arrow::datatypes::DataType;
use tempfile::TempDir;

use olapscan::common::ids::SlotId;
use olapscan::common::types::UniqueId;
use olapscan::exec::chunk::Chunk;
use olapscan::exec::node::scan::{OlapScanNode, SlotDescriptor};
use olapscan::exec::pipeline::operator::{Operator, SourceOperator};
use olapscan::exec::pipeline::scan::PipelineScanOperator;
use olapscan::runtime::runtime_state::RuntimeState;
use olapscan::storage::memory::{MemStorageEngine, MemTablet};
use olapscan::storage::{KeysType, Tablet, TabletColumn, TabletSchema};
use olapscan::{ScanResult, olapscan_config, olapscan_logging};

pub const SCHEMA_HASH: u32 = 7;
pub const VERSION: i64 = 1;

/// Test configuration for integration tests.
pub struct TestConfig {
    /// Temporary directory for test artifacts
    pub temp_dir: TempDir,
    /// Test config path
    pub config_path: PathBuf,
}

impl TestConfig {
    /// Create a new test configuration with default settings.
    pub fn new() -> anyhow::Result<Self> {
        let temp_dir = tempfile::tempdir()?;
        let config_path = temp_dir.path().join("test_olapscan.toml");

        let config_content = r#"
log_level = "debug"

[scan]
chunk_size = 1024
operator_buffer_chunks = 4
scan_batch_chunks = 2
scanners_per_tablet = 16
yield_max_time_spent_ms = 50
yield_preempt_max_time_spent_ms = 10
scan_thread_pool_thread_num = 2
"#;

        std::fs::write(&config_path, config_content)?;

        Ok(Self {
            temp_dir,
            config_path,
        })
    }

    /// Initialize logging for tests.
    pub fn init_logging(&self) {
        olapscan_logging::init_with_level("debug");
    }

    /// Load the test configuration.
    pub fn load_config(&self) -> anyhow::Result<&'static olapscan_config::OlapScanConfig> {
        olapscan_config::init_from_path(&self.config_path)
    }
}

impl Default for TestConfig {
    fn default() -> Self {
        Self::new().expect("Failed to create test config")
    }
}

/// Generate a test query ID.
pub fn test_query_id() -> UniqueId {
    UniqueId {
        hi: 1234567890,
        lo: 9876543210,
    }
}

/// Schema used by most scan tests: `k0` key, `v1` value, `s2` nullable string.
pub fn kv_schema(keys_type: KeysType) -> TabletSchema {
    TabletSchema::try_new(
        vec![
            TabletColumn::key("k0", DataType::Int32),
            TabletColumn::value("v1", DataType::Int64, false),
            TabletColumn::value("s2", DataType::Utf8, true),
        ],
        keys_type,
    )
    .expect("kv schema")
}

/// One segment with keys `keys`, `v1 = k0 * 10` and `s2` cycling through three colors
/// (every seventh row null).
pub fn kv_segment(tablet: &MemTablet, keys: std::ops::Range<i32>) -> RecordBatch {
    let k0 = keys.clone().collect::<Vec<_>>();
    let v1 = keys.clone().map(|k| k as i64 * 10).collect::<Vec<_>>();
    let s2 = keys
        .map(|k| match k % 7 {
            0 => None,
            n => Some(["red", "green", "blue"][(n % 3) as usize]),
        })
        .collect::<Vec<_>>();
    RecordBatch::try_new(
        tablet.schema().arrow_schema(),
        vec![
            Arc::new(Int32Array::from(k0)),
            Arc::new(Int64Array::from(v1)),
            Arc::new(StringArray::from(s2)),
        ],
    )
    .expect("kv segment")
}

/// Duplicate-key tablet whose single rowset holds one segment per entry of `segments`.
pub fn kv_tablet(tablet_id: i64, segments: &[std::ops::Range<i32>]) -> MemTablet {
    let tablet = MemTablet::new(tablet_id, SCHEMA_HASH, kv_schema(KeysType::Duplicate));
    let batches = segments
        .iter()
        .map(|keys| kv_segment(&tablet, keys.clone()))
        .collect::<Vec<_>>();
    tablet.append_rowset(VERSION, batches).expect("append rowset");
    tablet
}

pub fn engine_with(tablets: Vec<MemTablet>) -> Arc<MemStorageEngine> {
    let engine = Arc::new(MemStorageEngine::new());
    for tablet in tablets {
        engine.add_tablet(Arc::new(tablet));
    }
    engine
}

/// Scan node materializing `columns`, slot ids numbered from 1 in the given order.
pub fn scan_node(columns: &[&str]) -> OlapScanNode {
    let slots = columns
        .iter()
        .enumerate()
        .map(|(idx, name)| SlotDescriptor::new(SlotId::new(idx as u32 + 1), *name))
        .collect();
    OlapScanNode::new(1, slots)
}

/// Poll `op` to completion the way a pipeline driver would.
pub fn drain(op: &mut PipelineScanOperator, state: &RuntimeState) -> ScanResult<Vec<Chunk>> {
    let deadline = Instant::now() + Duration::from_secs(30);
    let mut chunks = Vec::new();
    while !op.is_finished() {
        assert!(Instant::now() < deadline, "scan did not finish in time");
        if op.has_output() {
            if let Some(chunk) = op.pull_chunk(state)? {
                chunks.push(chunk);
            }
        } else {
            std::thread::sleep(Duration::from_millis(1));
        }
    }
    Ok(chunks)
}

pub fn total_rows(chunks: &[Chunk]) -> usize {
    chunks.iter().map(Chunk::num_rows).sum()
}

/// Wait for a condition to become true, with timeout.
pub fn wait_for<F>(mut condition: F, timeout: Duration) -> bool
where
    F: FnMut() -> bool,
{
    let start = Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    false
}

/// Assert that a result is Ok and return the value.
#[macro_export]
macro_rules! assert_ok {
    ($result:expr) => {
        match $result {
            Ok(value) => value,
            Err(e) => panic!("Expected Ok, got Err: {:?}", e),
        }
    };
    ($result:expr, $message:expr) => {
        match $result {
            Ok(value) => value,
            Err(e) => panic!("{}: {:?}", $message, e),
        }
    };
}
