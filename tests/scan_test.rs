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
//! Integration tests for the pipeline OLAP scan over in-memory tablets.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use arrow::array::{Array, AsArray, Int32Array};
use arrow::datatypes::{DataType, Int32Type};

use crate::common::{
    SCHEMA_HASH, VERSION, drain, engine_with, kv_tablet, scan_node, test_query_id, total_rows,
    wait_for,
};
use olapscan::common::config::ScanOptions;
use olapscan::common::ids::SlotId;
use olapscan::exec::chunk::Chunk;
use olapscan::exec::node::scan::OlapScanNode;
use olapscan::exec::pipeline::operator::{Operator, SourceOperator};
use olapscan::exec::pipeline::scan::{
    ChunkBuffer, ChunkSource, FillStatus, FixedMorselQueue, MorselQueue, MorselQueueRef, OlapMorsel,
    PipelineScanOperator, ScanIoMode, YieldBudget,
};
use olapscan::exec::predicate::{Conjunct, PredicateOp, ScalarValue};
use olapscan::exec::workgroup::{WorkGroupId, WorkGroupManager, WorkerOwnership};
use olapscan::runtime::global_dict::{GlobalDict, GlobalDictMap};
use olapscan::runtime::mem_tracker::MemTracker;
use olapscan::runtime::profile::RuntimeProfile;
use olapscan::runtime::runtime_state::RuntimeState;
use olapscan::runtime::scan_executor::ScanExecutor;
use olapscan::storage::StorageEngine;
use olapscan::ScanError;

mod common;

fn morsels(tablet_ids: &[i64]) -> MorselQueueRef {
    FixedMorselQueue::new(
        tablet_ids
            .iter()
            .map(|id| OlapMorsel::new(*id, VERSION, SCHEMA_HASH))
            .collect(),
    )
}

fn inline_operator(
    node: OlapScanNode,
    storage: Arc<dyn StorageEngine>,
    tablet_ids: &[i64],
) -> PipelineScanOperator {
    PipelineScanOperator::new(
        Arc::new(node),
        storage,
        morsels(tablet_ids),
        ScanOptions::default(),
        ScanIoMode::Inline,
    )
}

fn k0(slot: u32, op: PredicateOp, value: i32) -> Conjunct {
    Conjunct::predicate(SlotId::new(slot), op, vec![ScalarValue::Int32(value)])
}

fn int_values(chunks: &[Chunk], slot: u32) -> Vec<i32> {
    chunks
        .iter()
        .flat_map(|chunk| {
            let column = chunk.column_by_slot_id(SlotId::new(slot)).expect("slot column");
            let ints = column
                .as_any()
                .downcast_ref::<Int32Array>()
                .expect("int32 column")
                .clone();
            ints.values().to_vec()
        })
        .collect()
}

#[test]
fn key_window_reads_only_matching_rows() {
    let engine = engine_with(vec![kv_tablet(10, &[0..10_000])]);
    let node = scan_node(&["k0"]).with_conjuncts(vec![
        k0(1, PredicateOp::Ge, 500),
        k0(1, PredicateOp::Lt, 1500),
    ]);
    let mut op = inline_operator(node, engine, &[10]);
    let state = RuntimeState::new(test_query_id()).with_chunk_size(1024);
    assert_ok!(op.prepare(&state));
    let chunks = assert_ok!(drain(&mut op, &state));
    assert_ok!(op.close(&state));

    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0].num_rows(), 1000);
    assert_eq!(int_values(&chunks, 1), (500..1500).collect::<Vec<_>>());
    let unique = &op.profiles().unique;
    assert_eq!(unique.counter_value("RowsRead"), Some(1000));
    assert_eq!(unique.counter_value("RawRowsRead"), Some(1000));
    assert_eq!(unique.counter_value("ShortKeyFilterRows"), Some(9000));
}

#[test]
fn rows_are_conserved_across_tablets_and_segments() {
    let engine = engine_with(vec![
        kv_tablet(1, &[0..300, 300..301, 301..1000]),
        kv_tablet(2, &[0..0]),
        kv_tablet(3, &[0..77]),
    ]);
    let mut op = inline_operator(scan_node(&["k0", "v1"]), engine, &[1, 2, 3]);
    let state = RuntimeState::default().with_chunk_size(64);
    assert_ok!(op.prepare(&state));
    let chunks = assert_ok!(drain(&mut op, &state));
    assert_ok!(op.close(&state));

    assert_eq!(total_rows(&chunks), 1077);
    assert!(chunks.iter().all(|c| !c.is_empty() && c.num_rows() <= 64));
    let sum: i64 = int_values(&chunks, 1).into_iter().map(i64::from).sum();
    assert_eq!(sum, (0..1000i64).sum::<i64>() + (0..77i64).sum::<i64>());
    assert_eq!(op.profiles().unique.counter_value("TabletCount"), Some(3));
}

#[test]
fn output_columns_follow_tablet_column_order() {
    let engine = engine_with(vec![kv_tablet(1, &[0..20])]);
    // Slot 1 is s2, slot 2 is k0.
    let mut op = inline_operator(scan_node(&["s2", "k0"]), engine, &[1]);
    let state = RuntimeState::default();
    assert_ok!(op.prepare(&state));
    let chunks = assert_ok!(drain(&mut op, &state));

    let chunk = &chunks[0];
    assert_eq!(chunk.num_columns(), 2);
    assert_eq!(chunk.schema().field(0).name(), "k0");
    assert_eq!(chunk.schema().field(1).name(), "s2");
    assert_eq!(int_values(&chunks, 2), (0..20).collect::<Vec<_>>());
    let colors = chunk.column_by_slot_id(SlotId::new(1)).expect("s2");
    assert_eq!(colors.data_type(), &DataType::Utf8);
    assert!(colors.is_null(0));
    assert_eq!(colors.as_string::<i32>().value(1), "green");
}

#[test]
fn limit_truncates_each_tablet_scan() {
    let engine = engine_with(vec![kv_tablet(1, &[0..100])]);
    let mut op = inline_operator(
        scan_node(&["k0"]).with_limit(25),
        Arc::clone(&engine) as Arc<dyn StorageEngine>,
        &[1],
    );
    let state = RuntimeState::default().with_chunk_size(10);
    assert_ok!(op.prepare(&state));
    let chunks = assert_ok!(drain(&mut op, &state));
    assert_eq!(total_rows(&chunks), 25);
    assert!(chunks.iter().all(|c| c.num_rows() <= 10));
    assert_eq!(int_values(&chunks, 1), (0..25).collect::<Vec<_>>());

    let mut op = inline_operator(scan_node(&["k0"]).with_limit(0), engine, &[1]);
    assert_ok!(op.prepare(&state));
    let chunks = assert_ok!(drain(&mut op, &state));
    assert!(chunks.is_empty());
    assert_ok!(op.close(&state));
    assert_eq!(op.profiles().unique.counter_value("RawRowsRead"), Some(0));
}

#[test]
fn fully_filtered_chunks_are_never_emitted() {
    let engine = engine_with(vec![kv_tablet(1, &[0..1000])]);
    let edges = Conjunct::or(k0(1, PredicateOp::Lt, 5), k0(1, PredicateOp::Ge, 995));
    let mut op = inline_operator(scan_node(&["k0"]).with_conjuncts(vec![edges]), engine, &[1]);
    let state = RuntimeState::default().with_chunk_size(100);
    assert_ok!(op.prepare(&state));
    let chunks = assert_ok!(drain(&mut op, &state));

    let sizes = chunks.iter().map(Chunk::num_rows).collect::<Vec<_>>();
    assert_eq!(sizes, vec![5, 5]);
    assert_eq!(
        int_values(&chunks, 1),
        vec![0, 1, 2, 3, 4, 995, 996, 997, 998, 999]
    );
}

#[test]
fn buffered_chunks_stay_within_capacity() {
    let engine = engine_with(vec![kv_tablet(1, &[0..500])]);
    let executor = Arc::new(ScanExecutor::new(2, 64));
    let mut op = PipelineScanOperator::new(
        Arc::new(scan_node(&["k0"])),
        engine,
        morsels(&[1]),
        ScanOptions::default()
            .with_buffer_capacity(3)
            .with_scan_batch_chunks(8),
        ScanIoMode::Executor {
            executor: Arc::clone(&executor),
            ownership: Arc::new(WorkGroupManager::new()),
            workgroup: WorkGroupId(1),
        },
    );
    let state = RuntimeState::default().with_chunk_size(10);
    assert_ok!(op.prepare(&state));

    // Nobody pulls: the scan must stop once the buffer is full.
    assert!(wait_for(
        || {
            op.has_output();
            op.buffered_chunks() == 3
        },
        Duration::from_secs(5)
    ));
    std::thread::sleep(Duration::from_millis(50));
    op.has_output();
    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(op.buffered_chunks(), 3);

    let chunks = assert_ok!(drain(&mut op, &state));
    assert_eq!(total_rows(&chunks), 500);
    assert_ok!(op.close(&state));
    executor.shutdown();
}

#[test]
fn operators_share_one_morsel_queue() {
    let engine = engine_with(
        (1..=5)
            .map(|id| kv_tablet(id, &[0..(id as i32 * 40)]))
            .collect(),
    );
    let executor = Arc::new(ScanExecutor::new(2, 64));
    let manager = Arc::new(WorkGroupManager::new());
    let queue = morsels(&[1, 2, 3, 4, 5]);
    let node = Arc::new(scan_node(&["k0", "v1"]));
    let state = RuntimeState::default().with_chunk_size(16);

    let rows = std::thread::scope(|scope| {
        let handles = (0..3)
            .map(|_| {
                let mut op = PipelineScanOperator::new(
                    Arc::clone(&node),
                    Arc::clone(&engine) as Arc<dyn StorageEngine>,
                    Arc::clone(&queue),
                    ScanOptions::default().with_buffer_capacity(2),
                    ScanIoMode::Executor {
                        executor: Arc::clone(&executor),
                        ownership: Arc::clone(&manager) as Arc<dyn WorkerOwnership>,
                        workgroup: WorkGroupId(7),
                    },
                );
                let state = state.clone();
                scope.spawn(move || {
                    op.prepare(&state).expect("prepare");
                    let chunks = drain(&mut op, &state).expect("drain");
                    op.close(&state).expect("close");
                    total_rows(&chunks)
                })
            })
            .collect::<Vec<_>>();
        handles
            .into_iter()
            .map(|h| h.join().expect("scan thread"))
            .sum::<usize>()
    });

    assert_eq!(rows, 40 + 80 + 120 + 160 + 200);
    assert!(queue.empty());
    executor.shutdown();
}

#[test]
fn cancellation_surfaces_as_cancelled_error() {
    let engine = engine_with(vec![kv_tablet(1, &[0..100])]);
    let mut op = inline_operator(scan_node(&["k0"]), engine, &[1]);
    let state = RuntimeState::new(test_query_id()).with_chunk_size(10);
    assert_ok!(op.prepare(&state));
    assert!(op.pull_chunk(&state).expect("first pull").is_some());
    state.cancel();

    let err = loop {
        match op.pull_chunk(&state) {
            Ok(_) => continue,
            Err(err) => break err,
        }
    };
    assert!(err.is_cancelled(), "err={err}");
    assert!(op.is_finished());
    // The error stays visible to every later pull.
    assert_eq!(op.pull_chunk(&state).expect_err("sticky"), err);
    assert_ok!(op.close(&state));
}

#[test]
fn missing_tablet_or_column_is_internal_error() {
    let engine = engine_with(vec![kv_tablet(1, &[0..10]), kv_tablet(2, &[0..10])]);
    assert!(engine.drop_tablet(2).is_some());
    let state = RuntimeState::default();

    let mut op = inline_operator(
        scan_node(&["k0"]),
        Arc::clone(&engine) as Arc<dyn StorageEngine>,
        &[2],
    );
    assert_ok!(op.prepare(&state));
    let err = drain(&mut op, &state).expect_err("missing tablet");
    assert!(matches!(err, ScanError::InternalError(_)), "err={err}");
    assert!(err.message().contains("tablet_id=2"), "err={err}");
    assert!(err.message().contains("tablet not found"), "err={err}");

    let mut op = inline_operator(scan_node(&["k0", "nope"]), engine, &[1]);
    assert_ok!(op.prepare(&state));
    let err = drain(&mut op, &state).expect_err("missing column");
    assert_eq!(err, ScanError::internal("invalid field name: nope"));
}

#[test]
fn residual_filter_respects_memory_limit() {
    let engine = engine_with(vec![kv_tablet(1, &[0..100])]);
    let edges = Conjunct::or(k0(1, PredicateOp::Lt, 5), k0(1, PredicateOp::Ge, 95));
    let node = scan_node(&["k0"]).with_conjuncts(vec![edges]);
    let tracker = MemTracker::new_root_with_limit("query", 16);
    let state = RuntimeState::default()
        .with_chunk_size(50)
        .with_mem_tracker(Arc::clone(&tracker));
    let mut op = inline_operator(node, engine, &[1]);
    assert_ok!(op.prepare(&state));
    let err = drain(&mut op, &state).expect_err("over limit");
    assert!(matches!(err, ScanError::ResourceExhausted(_)), "err={err}");
    assert_eq!(tracker.current(), 0);
}

#[test]
fn global_dict_slots_come_back_encoded() {
    let engine = engine_with(vec![kv_tablet(1, &[0..14])]);
    let mut dicts = GlobalDictMap::new();
    let dict = GlobalDict::try_new(vec!["blue".into(), "green".into(), "red".into()])
        .expect("dict");
    dicts.insert(SlotId::new(1), Arc::new(dict));
    let state = RuntimeState::default().with_global_dicts(dicts);
    let mut op = inline_operator(scan_node(&["s2"]), engine, &[1]);
    assert_ok!(op.prepare(&state));
    let chunks = assert_ok!(drain(&mut op, &state));

    let column = chunks[0].column_by_slot_id(SlotId::new(1)).expect("s2");
    assert_eq!(
        column.data_type(),
        &DataType::Dictionary(Box::new(DataType::Int32), Box::new(DataType::Utf8))
    );
    let encoded = column.as_dictionary::<Int32Type>();
    assert!(encoded.is_null(0));
    // Row 1 is "green", code 1.
    assert_eq!(encoded.keys().value(1), 1);
}

#[test]
fn workgroup_budget_yields_the_worker() {
    let tablet = kv_tablet(1, &[0..200]).with_io_latency(Duration::from_millis(5));
    let engine = engine_with(vec![tablet]);
    let buffer = Arc::new(ChunkBuffer::new(64, "test"));
    let mut source = ChunkSource::new(
        OlapMorsel::new(1, VERSION, SCHEMA_HASH),
        Arc::new(scan_node(&["k0"])),
        engine,
        ScanOptions::default().with_yield_thresholds(Duration::from_millis(12), Duration::ZERO),
        RuntimeProfile::new("test"),
        Arc::clone(&buffer),
    );
    assert_ok!(source.prepare(&RuntimeState::default().with_chunk_size(10)));
    let manager = WorkGroupManager::new();
    manager.assign_scan_worker(0, WorkGroupId(1));
    let stop = AtomicBool::new(false);
    let budget = YieldBudget {
        worker_id: 0,
        running_wg: WorkGroupId(1),
        ownership: &manager,
    };

    // Sole owner: runs until the time budget is spent.
    let (status, chunks) = assert_ok!(source.fill_batch_for_workgroup(16, &stop, &budget));
    assert_eq!(status, FillStatus::Ok);
    assert!((1..=3).contains(&chunks), "chunks={chunks}");

    // Another workgroup claims the worker: give it back after one chunk.
    manager.assign_scan_worker(0, WorkGroupId(2));
    let (_, chunks) = assert_ok!(source.fill_batch_for_workgroup(16, &stop, &budget));
    assert_eq!(chunks, 1);

    let mut status = FillStatus::Ok;
    let mut chunks_total = buffer.size();
    manager.release_scan_worker(0, WorkGroupId(2));
    while status == FillStatus::Ok {
        let (next, n) = assert_ok!(source.fill_batch_for_workgroup(16, &stop, &budget));
        status = next;
        chunks_total += n;
    }
    assert_eq!(chunks_total, 20);
    assert_eq!(source.num_rows_read(), 200);
}
