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
//! OLAP scan source operator.
//!
//! Responsibilities:
//! - Pulls morsels from a shared queue and scans them one chunk source at a time.
//! - Runs read batches inline on the polling thread or as tasks on the scan IO pool.
//! - Hands buffered chunks to the pipeline and surfaces the first scan error.
//!
//! Key exported interfaces:
//! - Types: `PipelineScanOperator`, `ScanIoMode`.
//!
//! Current limitations:
//! - At most one IO task per operator is in flight; parallelism comes from running several
//!   operators over the same morsel queue.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};

use crate::common::config::ScanOptions;
use crate::common::error::{ScanError, ScanResult};
use crate::exec::chunk::Chunk;
use crate::exec::node::scan::OlapScanNode;
use crate::exec::pipeline::operator::{BlockedReason, Operator, SourceOperator};
use crate::exec::pipeline::scan::chunk_buffer::ChunkBuffer;
use crate::exec::pipeline::scan::chunk_source::{ChunkSource, FillStatus, YieldBudget};
use crate::exec::pipeline::scan::morsel::MorselQueueRef;
use crate::exec::runtime_filter::RuntimeInFilterSet;
use crate::exec::workgroup::{WorkGroupId, WorkerOwnership};
use crate::olapscan_logging::{debug, warn};
use crate::runtime::profile::{CounterUnit, OperatorProfiles, RuntimeProfile};
use crate::runtime::runtime_state::RuntimeState;
use crate::runtime::scan_executor::{ScanExecutor, scan_executor};
use crate::storage::StorageEngine;

/// Where read batches run.
#[derive(Clone)]
pub enum ScanIoMode {
    /// On the thread that polls the operator, without a time budget.
    Inline,
    /// On the scan pool, time-budgeted against the workgroup scheduler.
    Executor {
        executor: Arc<ScanExecutor>,
        ownership: Arc<dyn WorkerOwnership>,
        workgroup: WorkGroupId,
    },
}

impl ScanIoMode {
    /// Executor mode on the process-wide scan pool.
    pub fn shared(ownership: Arc<dyn WorkerOwnership>, workgroup: WorkGroupId) -> Self {
        ScanIoMode::Executor {
            executor: scan_executor(),
            ownership,
            workgroup,
        }
    }
}

/// State shared between the operator and its in-flight IO task.
struct ScanContext {
    node: Arc<OlapScanNode>,
    storage: Arc<dyn StorageEngine>,
    morsels: MorselQueueRef,
    options: ScanOptions,
    unique_profile: RuntimeProfile,
    buffer: Arc<ChunkBuffer>,
    runtime_in_filters: Option<Arc<RuntimeInFilterSet>>,
    runtime_state: RuntimeState,
    source: Mutex<Option<ChunkSource>>,
    error: Mutex<Option<ScanError>>,
    io_inflight: AtomicBool,
    finishing: AtomicBool,
    exhausted: AtomicBool,
}

impl ScanContext {
    fn lock_source(&self) -> MutexGuard<'_, Option<ChunkSource>> {
        self.source.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn error(&self) -> Option<ScanError> {
        self.error
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn set_error(&self, err: ScanError) {
        let mut guard = self.error.lock().unwrap_or_else(|e| e.into_inner());
        if guard.is_none() {
            *guard = Some(err);
        }
    }

    fn stopped(&self) -> bool {
        self.finishing.load(Ordering::Acquire)
            || self.exhausted.load(Ordering::Acquire)
            || self.error().is_some()
    }

    fn no_more_morsels(&self) -> bool {
        self.morsels.empty() && !self.morsels.has_more()
    }

    /// Run one read batch, opening the next morsel when the current source is done.
    fn run_io(&self, batch_size: usize, budget: Option<&YieldBudget<'_>>) {
        let mut guard = self.lock_source();
        loop {
            if self.stopped() {
                if let Some(mut source) = guard.take() {
                    source.close();
                }
                return;
            }
            if guard.is_none() {
                let Some(morsel) = self.morsels.try_get() else {
                    if !self.morsels.has_more() {
                        self.exhausted.store(true, Ordering::Release);
                    }
                    return;
                };
                debug!(
                    "scan operator open morsel: node_id={} {}",
                    self.node.node_id, morsel
                );
                let runtime_in_filters = self
                    .runtime_in_filters
                    .as_ref()
                    .map(|set| set.snapshot())
                    .unwrap_or_default();
                let mut source = ChunkSource::new(
                    morsel,
                    Arc::clone(&self.node),
                    Arc::clone(&self.storage),
                    self.options.clone(),
                    self.unique_profile.clone(),
                    Arc::clone(&self.buffer),
                )
                .with_runtime_in_filters(runtime_in_filters);
                self.unique_profile
                    .counter_add("TabletCount", CounterUnit::Unit, 1);
                if let Err(err) = source.prepare(&self.runtime_state) {
                    source.close();
                    self.set_error(err);
                    return;
                }
                *guard = Some(source);
            }
            let Some(source) = guard.as_mut() else {
                return;
            };
            let result = match budget {
                Some(budget) => {
                    let result =
                        source.fill_batch_for_workgroup(batch_size, &self.finishing, budget);
                    budget
                        .ownership
                        .account_cpu_time(budget.running_wg, source.last_spent_cpu_time_ns());
                    result
                }
                None => source
                    .fill_batch(batch_size, &self.finishing)
                    .map(|status| (status, 0)),
            };
            match result {
                Err(err) => {
                    self.set_error(err);
                    return;
                }
                Ok((FillStatus::Ok, _)) => {
                    if self.finishing.load(Ordering::Acquire)
                        && let Some(mut source) = guard.take()
                    {
                        source.close();
                    }
                    return;
                }
                Ok((FillStatus::EndOfStream, _)) => {
                    if let Some(mut done) = guard.take() {
                        done.close();
                    }
                    if self.no_more_morsels() {
                        self.exhausted.store(true, Ordering::Release);
                        return;
                    }
                    if !self.buffer.empty() {
                        return;
                    }
                }
            }
        }
    }

    fn close_source(&self) {
        if let Some(mut source) = self.lock_source().take() {
            source.close();
        }
    }

    /// Close the current source unless an IO task holds it; that task closes it on return.
    fn try_close_source(&self) {
        let mut guard = match self.source.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(e)) => e.into_inner(),
            Err(TryLockError::WouldBlock) => return,
        };
        if let Some(mut source) = guard.take() {
            source.close();
        }
    }
}

/// Owned by a queued IO task. Clears the in-flight flag when the task finishes or when the
/// executor drops it unrun.
struct IoTaskGuard {
    ctx: Arc<ScanContext>,
}

impl IoTaskGuard {
    fn run(&self, batch_size: usize, budget: &YieldBudget<'_>) {
        self.ctx.run_io(batch_size, Some(budget));
    }
}

impl Drop for IoTaskGuard {
    fn drop(&mut self) {
        self.ctx.io_inflight.store(false, Ordering::Release);
    }
}

pub struct PipelineScanOperator {
    name: String,
    node: Arc<OlapScanNode>,
    storage: Arc<dyn StorageEngine>,
    morsels: MorselQueueRef,
    options: ScanOptions,
    io_mode: ScanIoMode,
    runtime_in_filters: Option<Arc<RuntimeInFilterSet>>,
    profiles: OperatorProfiles,
    ctx: Option<Arc<ScanContext>>,
    submit_rejected: AtomicBool,
    closed: bool,
}

impl PipelineScanOperator {
    pub fn new(
        node: Arc<OlapScanNode>,
        storage: Arc<dyn StorageEngine>,
        morsels: MorselQueueRef,
        options: ScanOptions,
        io_mode: ScanIoMode,
    ) -> Self {
        let name = format!("OLAP_SCAN (plan_node_id={})", node.node_id);
        let profiles = OperatorProfiles::new(RuntimeProfile::new(name.clone()));
        Self {
            name,
            node,
            storage,
            morsels,
            options,
            io_mode,
            runtime_in_filters: None,
            profiles,
            ctx: None,
            submit_rejected: AtomicBool::new(false),
            closed: false,
        }
    }

    /// Runtime filters of the scan node; each morsel opened after a publish sees it.
    pub fn with_runtime_in_filters(mut self, filters: Arc<RuntimeInFilterSet>) -> Self {
        self.runtime_in_filters = Some(filters);
        self
    }

    pub fn profiles(&self) -> &OperatorProfiles {
        &self.profiles
    }

    /// Chunks currently buffered; zero before prepare.
    pub fn buffered_chunks(&self) -> usize {
        self.ctx.as_ref().map_or(0, |ctx| ctx.buffer.size())
    }

    fn maybe_start_scan(&self) {
        let Some(ctx) = self.ctx.as_ref() else {
            return;
        };
        if self.closed || ctx.stopped() {
            return;
        }
        let batch_size = self
            .options
            .scan_batch_chunks
            .min(ctx.buffer.remaining());
        if batch_size == 0 {
            return;
        }
        match &self.io_mode {
            ScanIoMode::Inline => {
                if ctx.buffer.empty() {
                    ctx.run_io(batch_size, None);
                }
            }
            ScanIoMode::Executor {
                executor,
                ownership,
                workgroup,
            } => {
                if ctx
                    .io_inflight
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    return;
                }
                let task = IoTaskGuard {
                    ctx: Arc::clone(ctx),
                };
                let ownership = Arc::clone(ownership);
                let workgroup = *workgroup;
                let submitted = executor.submit(move |worker_id| {
                    let budget = YieldBudget {
                        worker_id,
                        running_wg: workgroup,
                        ownership: ownership.as_ref(),
                    };
                    task.run(batch_size, &budget);
                });
                if submitted {
                    self.submit_rejected.store(false, Ordering::Release);
                } else if !self.submit_rejected.swap(true, Ordering::AcqRel) {
                    warn!(
                        "scan executor rejected io task: node_id={} queued_tasks={}",
                        self.node.node_id,
                        executor.num_tasks()
                    );
                }
            }
        }
    }
}

impl Operator for PipelineScanOperator {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_profiles(&mut self, profiles: OperatorProfiles) {
        self.profiles = profiles;
    }

    fn prepare(&mut self, state: &RuntimeState) -> ScanResult<()> {
        if self.ctx.is_some() {
            return Ok(());
        }
        let label = format!("{} buffer", self.name);
        let buffer = Arc::new(ChunkBuffer::new(self.options.buffer_capacity, label));
        self.profiles.common.counter_set(
            "ChunkBufferCapacity",
            CounterUnit::Unit,
            buffer.capacity() as i64,
        );
        self.ctx = Some(Arc::new(ScanContext {
            node: Arc::clone(&self.node),
            storage: Arc::clone(&self.storage),
            morsels: Arc::clone(&self.morsels),
            options: self.options.clone(),
            unique_profile: self.profiles.unique.clone(),
            buffer,
            runtime_in_filters: self.runtime_in_filters.clone(),
            runtime_state: state.clone(),
            source: Mutex::new(None),
            error: Mutex::new(None),
            io_inflight: AtomicBool::new(false),
            finishing: AtomicBool::new(false),
            exhausted: AtomicBool::new(false),
        }));
        let io_mode = match self.io_mode {
            ScanIoMode::Inline => "inline",
            ScanIoMode::Executor { .. } => "executor",
        };
        self.profiles.operator.add_info_string("IOMode", io_mode);
        debug!(
            "scan operator prepared: name={} original_morsels={} io_mode={}",
            self.name,
            self.morsels.num_original_morsels(),
            io_mode
        );
        Ok(())
    }

    fn close(&mut self, _state: &RuntimeState) -> ScanResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if let Some(ctx) = self.ctx.as_ref() {
            ctx.finishing.store(true, Ordering::Release);
            ctx.close_source();
            let dropped = ctx.buffer.clear();
            debug!(
                "scan operator closed: name={} dropped_chunks={}",
                self.name, dropped
            );
        }
        Ok(())
    }

    fn cancel(&mut self) {
        if let Some(ctx) = self.ctx.as_ref() {
            ctx.finishing.store(true, Ordering::Release);
        }
    }

    fn is_finished(&self) -> bool {
        let Some(ctx) = self.ctx.as_ref() else {
            return false;
        };
        if !ctx.buffer.empty() {
            return false;
        }
        if ctx.error().is_some() {
            return true;
        }
        if ctx.io_inflight.load(Ordering::Acquire) {
            return false;
        }
        ctx.finishing.load(Ordering::Acquire) || ctx.exhausted.load(Ordering::Acquire)
    }

    fn as_source_mut(&mut self) -> Option<&mut dyn SourceOperator> {
        Some(self)
    }
}

impl SourceOperator for PipelineScanOperator {
    fn has_output(&self) -> bool {
        self.maybe_start_scan();
        let Some(ctx) = self.ctx.as_ref() else {
            return false;
        };
        !ctx.buffer.empty() || ctx.error().is_some()
    }

    fn pull_chunk(&mut self, _state: &RuntimeState) -> ScanResult<Option<Chunk>> {
        let Some(ctx) = self.ctx.clone() else {
            return Err(ScanError::internal(format!(
                "{} pulled before prepare",
                self.name
            )));
        };
        if let Some(err) = ctx.error() {
            return Err(err);
        }
        if ctx.buffer.empty() {
            self.maybe_start_scan();
        }
        let chunk = ctx.buffer.try_get();
        match &chunk {
            Some(chunk) => {
                self.profiles
                    .common
                    .counter_add("PullChunkNum", CounterUnit::Unit, 1);
                self.profiles.common.counter_add(
                    "PullRowNum",
                    CounterUnit::Unit,
                    chunk.num_rows() as i64,
                );
            }
            None => {
                if let Some(err) = ctx.error() {
                    return Err(err);
                }
            }
        }
        if matches!(self.io_mode, ScanIoMode::Executor { .. }) {
            self.maybe_start_scan();
        }
        Ok(chunk)
    }

    fn set_finishing(&mut self, _state: &RuntimeState) -> ScanResult<()> {
        if let Some(ctx) = self.ctx.as_ref() {
            ctx.finishing.store(true, Ordering::Release);
            ctx.try_close_source();
        }
        Ok(())
    }

    fn blocked_reason(&self) -> Option<BlockedReason> {
        let ctx = self.ctx.as_ref()?;
        if !ctx.buffer.empty() || self.is_finished() {
            return None;
        }
        if self.submit_rejected.load(Ordering::Acquire) {
            Some(BlockedReason::IoQueueFull)
        } else {
            Some(BlockedReason::InputEmpty)
        }
    }
}

impl Drop for PipelineScanOperator {
    fn drop(&mut self) {
        if let Some(ctx) = self.ctx.as_ref() {
            ctx.finishing.store(true, Ordering::Release);
            ctx.close_source();
        }
    }
}
