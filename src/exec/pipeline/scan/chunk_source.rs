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
//! Chunk source over one tablet morsel.
//!
//! Responsibilities:
//! - Resolves the morsel's tablet, classifies the scan conjuncts and opens the storage reader.
//! - Runs bounded read batches that apply residual filters and feed the operator's chunk buffer.
//! - Folds reader statistics into the scan profile while reading and when closed.
//!
//! Key exported interfaces:
//! - Types: `ChunkSource`, `ChunkSourceState`, `FillStatus`, `YieldBudget`.
//!
//! Current limitations:
//! - One storage reader per morsel; scanner range groups are flattened into that reader's key
//!   ranges in order, so all pushed ranges must share their bound inclusiveness.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use crate::common::config::ScanOptions;
use crate::common::error::{ScanError, ScanResult};
use crate::common::ids::{ColumnId, SlotId};
use crate::exec::chunk::Chunk;
use crate::exec::node::scan::{OlapScanNode, SlotDescriptor};
use crate::exec::pipeline::scan::chunk_buffer::ChunkBuffer;
use crate::exec::pipeline::scan::morsel::OlapMorsel;
use crate::exec::predicate::classifier::{ClassifiedConjuncts, ClassifyOptions};
use crate::exec::predicate::key_range::{KeyRange, group_scanner_ranges};
use crate::exec::predicate::{ColumnPredicate, Conjunct};
use crate::exec::runtime_filter::RuntimeInFilter;
use crate::exec::workgroup::{WorkGroupId, WorkerOwnership};
use crate::olapscan_logging::{debug, warn};
use crate::runtime::global_dict::ColumnIdToGlobalDictMap;
use crate::runtime::mem_tracker::MemTracker;
use crate::runtime::profile::{CounterUnit, RuntimeProfile};
use crate::runtime::runtime_state::RuntimeState;
use crate::storage::projection::ReadChain;
use crate::storage::{
    ChunkIterator, ChunkPoll, RangeEndOp, RangeStartOp, ReaderParams, ScanStatistics,
    StorageEngine, TabletSchema,
};

/// Terminal status of one read batch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FillStatus {
    /// More data may follow.
    Ok,
    EndOfStream,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChunkSourceState {
    Created,
    Prepared,
    Scanning,
    Exhausted,
    Error,
    Closed,
}

/// Scheduler context for a time-budgeted read batch.
pub struct YieldBudget<'a> {
    pub worker_id: usize,
    pub running_wg: WorkGroupId,
    pub ownership: &'a dyn WorkerOwnership,
}

/// Outcome of one attempt to produce a non-empty chunk.
enum StorageRead {
    Chunk(Chunk),
    EndOfStream,
    /// The time budget ran out while every physical read was filtered away.
    Yield,
}

type StatisticsCounter = (&'static str, CounterUnit, fn(&ScanStatistics) -> i64);

// Reader statistics folded into the profile at close.
const STATISTICS_COUNTERS: &[StatisticsCounter] = &[
    ("CreateSegmentIter", CounterUnit::TimeNs, |s| s.create_segment_iter_ns),
    ("IOTime", CounterUnit::TimeNs, |s| s.io_ns),
    ("CompressedBytesRead", CounterUnit::Bytes, |s| s.compressed_bytes_read),
    ("DecompressT", CounterUnit::TimeNs, |s| s.decompress_ns),
    ("UncompressedBytesRead", CounterUnit::Bytes, |s| s.uncompressed_bytes_read),
    ("BytesRead", CounterUnit::Bytes, |s| s.bytes_read),
    ("BlockLoad", CounterUnit::TimeNs, |s| s.block_load_ns),
    ("BlockLoadCount", CounterUnit::Unit, |s| s.blocks_load),
    ("BlockFetch", CounterUnit::TimeNs, |s| s.block_fetch_ns),
    ("BlockFetchCount", CounterUnit::Unit, |s| s.block_fetch_count),
    ("BlockSeek", CounterUnit::TimeNs, |s| s.block_seek_ns),
    ("BlockSeekCount", CounterUnit::Unit, |s| s.block_seek_num),
    ("RawRowsRead", CounterUnit::Unit, |s| s.raw_rows_read),
    ("ChunkCopy", CounterUnit::TimeNs, |s| s.vec_cond_chunk_copy_ns),
    ("SegmentInit", CounterUnit::TimeNs, |s| s.segment_init_ns),
    ("PredFilter", CounterUnit::TimeNs, |s| s.vec_cond_evaluate_ns),
    ("PredFilterRows", CounterUnit::Unit, |s| s.rows_vec_cond_filtered),
    ("DelVecFilterRows", CounterUnit::Unit, |s| s.rows_del_vec_filtered),
    ("ZoneMapIndexFilterRows", CounterUnit::Unit, |s| s.rows_stats_filtered),
    ("BloomFilterFilterRows", CounterUnit::Unit, |s| s.rows_bf_filtered),
    ("ShortKeyFilterRows", CounterUnit::Unit, |s| s.rows_key_range_filtered),
    ("IndexLoad", CounterUnit::TimeNs, |s| s.index_load_ns),
    ("ReadPagesNum", CounterUnit::Unit, |s| s.total_pages_num),
    ("CachedPagesNum", CounterUnit::Unit, |s| s.cached_pages_num),
    ("BitmapIndexFilterRows", CounterUnit::Unit, |s| s.rows_bitmap_index_filtered),
    ("BitmapIndexFilter", CounterUnit::TimeNs, |s| s.bitmap_index_filter_timer),
    ("RowsetsReadCount", CounterUnit::Unit, |s| s.rowsets_read_count),
    ("SegmentsReadCount", CounterUnit::Unit, |s| s.segments_read_count),
    ("TotalColumnsDataPageCount", CounterUnit::Unit, |s| s.total_columns_data_page_count),
    ("DictDecode", CounterUnit::TimeNs, |s| s.decode_dict_ns),
    ("LateMaterialize", CounterUnit::TimeNs, |s| s.late_materialize_ns),
    ("DeleteFilter", CounterUnit::TimeNs, |s| s.del_filter_ns),
    ("DeleteFilterRows", CounterUnit::Unit, |s| s.rows_del_filtered),
];

pub struct ChunkSource {
    morsel: OlapMorsel,
    node: Arc<OlapScanNode>,
    storage: Arc<dyn StorageEngine>,
    options: ScanOptions,
    profile: RuntimeProfile,
    buffer: Arc<ChunkBuffer>,
    runtime_in_filters: Vec<Arc<RuntimeInFilter>>,

    state: ChunkSourceState,
    status: Option<ScanError>,
    cancelled: Option<Arc<AtomicBool>>,
    mem_tracker: Option<Arc<MemTracker>>,

    reader: Option<ReadChain>,
    residual_predicates: Vec<ColumnPredicate>,
    residual_exprs: Vec<Conjunct>,
    slot_bindings: Vec<(SlotId, String)>,
    pushdown_predicates: usize,
    // Chunk handed back by a full buffer; delivered before anything else.
    pending: Option<Chunk>,

    num_rows_read: usize,
    raw_rows_read: i64,
    compressed_bytes_read: i64,
    last_cpu_time_ns: i64,
}

impl ChunkSource {
    pub fn new(
        morsel: OlapMorsel,
        node: Arc<OlapScanNode>,
        storage: Arc<dyn StorageEngine>,
        options: ScanOptions,
        profile: RuntimeProfile,
        buffer: Arc<ChunkBuffer>,
    ) -> Self {
        Self {
            morsel,
            node,
            storage,
            options,
            profile,
            buffer,
            runtime_in_filters: Vec::new(),
            state: ChunkSourceState::Created,
            status: None,
            cancelled: None,
            mem_tracker: None,
            reader: None,
            residual_predicates: Vec::new(),
            residual_exprs: Vec::new(),
            slot_bindings: Vec::new(),
            pushdown_predicates: 0,
            pending: None,
            num_rows_read: 0,
            raw_rows_read: 0,
            compressed_bytes_read: 0,
            last_cpu_time_ns: 0,
        }
    }

    /// Runtime filters applied on top of the node's conjuncts.
    pub fn with_runtime_in_filters(mut self, filters: Vec<Arc<RuntimeInFilter>>) -> Self {
        self.runtime_in_filters = filters;
        self
    }

    pub fn morsel(&self) -> &OlapMorsel {
        &self.morsel
    }

    pub fn state(&self) -> ChunkSourceState {
        self.state
    }

    pub fn status(&self) -> Option<&ScanError> {
        self.status.as_ref()
    }

    /// Rows delivered to the buffer so far.
    pub fn num_rows_read(&self) -> usize {
        self.num_rows_read
    }

    pub fn raw_rows_read(&self) -> i64 {
        self.raw_rows_read
    }

    pub fn compressed_bytes_read(&self) -> i64 {
        self.compressed_bytes_read
    }

    /// No further chunk will come out of this source.
    pub fn is_terminal(&self) -> bool {
        self.pending.is_none()
            && matches!(
                self.state,
                ChunkSourceState::Exhausted | ChunkSourceState::Error | ChunkSourceState::Closed
            )
    }

    pub fn prepare(&mut self, state: &RuntimeState) -> ScanResult<()> {
        if self.state != ChunkSourceState::Created {
            return Err(ScanError::internal(format!(
                "chunk source for tablet {} prepared twice",
                self.morsel.tablet_id
            )));
        }
        let _timer = self.profile.scoped_timer("PrepareChunkSourceTime");
        self.cancelled = Some(state.cancellation_flag());
        if let Some(root) = state.mem_tracker() {
            self.mem_tracker = Some(MemTracker::new_child(
                format!("OlapChunkSource tablet_id={}", self.morsel.tablet_id),
                &root,
            ));
        }
        if let Err(err) = self.init_olap_reader(state) {
            self.set_error(err.clone());
            return Err(err);
        }
        Ok(())
    }

    fn init_olap_reader(&mut self, state: &RuntimeState) -> ScanResult<()> {
        let tablet = self
            .storage
            .get_tablet(self.morsel.tablet_id, self.morsel.schema_hash)
            .inspect_err(|e| warn!("{}", e))?;
        let schema = tablet.schema();

        let classify_options =
            ClassifyOptions::from_scan_options(&self.options, self.node.skip_aggregation);
        let mut conjuncts = self.node.conjuncts.clone();
        conjuncts.extend(self.runtime_in_filters.iter().map(|f| f.to_conjunct()));
        self.profile.counter_set(
            "RuntimeInFilterNum",
            CounterUnit::Unit,
            self.runtime_in_filters.len() as i64,
        );
        let classified = self.node.classifier.classify(
            &conjuncts,
            &self.node.slots,
            &schema,
            &classify_options,
        )?;
        let scanner_columns = self.init_scanner_columns(&schema)?;
        let unused_output_columns = self.init_unused_output_columns(&schema)?;
        if classified.always_false {
            debug!(
                "olap chunk source short-circuited by constant false conjunct: node_id={} tablet_id={}",
                self.node.node_id, self.morsel.tablet_id
            );
            self.state = ChunkSourceState::Exhausted;
            return Ok(());
        }
        let global_dicts = self.init_global_dicts(state, &schema);
        let reader_columns = if self.node.skip_aggregation {
            scanner_columns.clone()
        } else {
            let mut columns = schema.key_column_ids();
            columns.extend(scanner_columns.iter().filter(|c| !schema.is_key(**c)));
            columns.sort();
            columns
        };

        let ClassifiedConjuncts {
            pushable,
            residual_predicates,
            residual_exprs,
            key_ranges,
            ..
        } = classified;
        let key_ranges = if key_ranges.is_empty() || key_ranges == [KeyRange::full()] {
            if self.morsel.key_ranges.is_empty() {
                key_ranges
            } else {
                self.morsel.key_ranges.clone()
            }
        } else {
            key_ranges
        };
        let scanner_ranges = group_scanner_ranges(&key_ranges, self.options.scanners_per_tablet);
        let output_columns = output_columns(
            &scanner_columns,
            &unused_output_columns,
            &residual_predicates,
            &residual_exprs,
            &self.node.slots,
            &schema,
        )?;

        let chunk_size = match self.node.limit {
            Some(limit) => limit.min(state.chunk_size()).max(1),
            None => state.chunk_size(),
        };
        let mut params = ReaderParams {
            tablet_id: self.morsel.tablet_id,
            version: self.morsel.version,
            predicates: pushable,
            reader_columns: reader_columns.clone(),
            chunk_size,
            global_dicts,
            skip_aggregation: self.node.skip_aggregation,
            use_page_cache: self.options.use_page_cache,
            ..ReaderParams::default()
        };
        // The reader takes one pair of range operators for all of its ranges.
        let mut bounds: Option<(bool, bool)> = None;
        for range in scanner_ranges.iter().flatten() {
            if range.is_unbounded_begin() {
                continue;
            }
            let range_bounds = (range.begin_include, range.end_include);
            if bounds.is_some_and(|b| b != range_bounds) {
                return Err(ScanError::invalid_argument(format!(
                    "key ranges of tablet {} mix inclusive and exclusive bounds",
                    self.morsel.tablet_id
                )));
            }
            bounds = Some(range_bounds);
            params.range = if range.begin_include {
                RangeStartOp::Ge
            } else {
                RangeStartOp::Gt
            };
            params.end_range = if range.end_include {
                RangeEndOp::Le
            } else {
                RangeEndOp::Lt
            };
            params.start_key.push(range.begin.clone());
            params.end_key.push(range.end.clone());
        }
        self.pushdown_predicates = params.predicates.len();

        let reader_schema = schema
            .projected_schema(&reader_columns, &params.global_dicts)
            .map_err(ScanError::internal)?;
        debug!(
            "olap chunk source prepare: node_id={} tablet_id={} version={} scanner_ranges={} key_ranges={} pushdown={} residual_predicates={} residual_exprs={} runtime_in_filters={} reader_columns={:?} output_columns={:?}",
            self.node.node_id,
            self.morsel.tablet_id,
            self.morsel.version,
            scanner_ranges.len(),
            params.start_key.len(),
            params.predicates.len(),
            residual_predicates.len(),
            residual_exprs.len(),
            self.runtime_in_filters.len(),
            reader_columns,
            output_columns
        );
        let mut reader = tablet.new_reader(self.morsel.version, reader_schema)?;
        reader.open(params)?;
        self.reader = Some(ReadChain::new(reader, &reader_columns, &output_columns)?);
        self.residual_predicates = residual_predicates;
        self.residual_exprs = residual_exprs;
        self.slot_bindings = self
            .node
            .slots
            .iter()
            .filter(|slot| {
                schema
                    .field_index(&slot.col_name)
                    .is_some_and(|c| output_columns.contains(&c))
            })
            .map(|slot| (slot.id, slot.col_name.clone()))
            .collect();
        self.state = ChunkSourceState::Prepared;
        Ok(())
    }

    /// Tablet columns of the materialized slots, ascending.
    fn init_scanner_columns(&self, schema: &TabletSchema) -> ScanResult<Vec<ColumnId>> {
        let mut columns = Vec::with_capacity(self.node.slots.len());
        for slot in &self.node.slots {
            let column = schema.field_index(&slot.col_name).ok_or_else(|| {
                ScanError::internal(format!("invalid field name: {}", slot.col_name))
            })?;
            columns.push(column);
        }
        columns.sort();
        columns.dedup();
        if columns.is_empty() {
            return Err(ScanError::internal(
                "failed to build storage scanner, no materialized slot!",
            ));
        }
        Ok(columns)
    }

    fn init_unused_output_columns(&self, schema: &TabletSchema) -> ScanResult<Vec<ColumnId>> {
        self.node
            .unused_output_column_names
            .iter()
            .map(|name| {
                schema
                    .field_index(name)
                    .ok_or_else(|| ScanError::internal(format!("invalid field name: {}", name)))
            })
            .collect()
    }

    fn init_global_dicts(
        &self,
        state: &RuntimeState,
        schema: &TabletSchema,
    ) -> ColumnIdToGlobalDictMap {
        let dicts = state.global_dicts();
        let mut out = ColumnIdToGlobalDictMap::new();
        if dicts.is_empty() {
            return out;
        }
        for slot in &self.node.slots {
            let Some(dict) = dicts.get(&slot.id) else {
                continue;
            };
            if let Some(column) = schema.field_index(&slot.col_name) {
                out.insert(column, Arc::clone(dict));
            }
        }
        out
    }

    /// Read up to `batch_size` chunks into the buffer.
    pub fn fill_batch(
        &mut self,
        batch_size: usize,
        can_finish: &AtomicBool,
    ) -> ScanResult<FillStatus> {
        self.read_batch(batch_size, can_finish, None)
            .map(|(status, _)| status)
    }

    /// Like `fill_batch`, but gives the worker back once the time budget is spent or, past the
    /// preemption threshold, as soon as another workgroup claims the worker.
    pub fn fill_batch_for_workgroup(
        &mut self,
        batch_size: usize,
        can_finish: &AtomicBool,
        budget: &YieldBudget<'_>,
    ) -> ScanResult<(FillStatus, usize)> {
        self.read_batch(batch_size, can_finish, Some(budget))
    }

    fn read_batch(
        &mut self,
        batch_size: usize,
        can_finish: &AtomicBool,
        budget: Option<&YieldBudget<'_>>,
    ) -> ScanResult<(FillStatus, usize)> {
        if let Some(err) = &self.status {
            return Err(err.clone());
        }
        match self.state {
            ChunkSourceState::Created => {
                return Err(ScanError::internal(format!(
                    "chunk source for tablet {} is not prepared",
                    self.morsel.tablet_id
                )));
            }
            ChunkSourceState::Closed => {
                return Err(ScanError::internal(format!(
                    "chunk source for tablet {} is closed",
                    self.morsel.tablet_id
                )));
            }
            ChunkSourceState::Exhausted | ChunkSourceState::Error => {
                return Ok((FillStatus::EndOfStream, 0));
            }
            ChunkSourceState::Prepared => self.state = ChunkSourceState::Scanning,
            ChunkSourceState::Scanning => {}
        }

        let _timer = self.profile.scoped_timer("ScanTime");
        let start = Instant::now();
        if let Some(chunk) = self.pending.take()
            && let Err(chunk) = self.buffer.try_put(chunk)
        {
            self.pending = Some(chunk);
            return Ok((FillStatus::Ok, 0));
        }

        let mut num_read_chunks = 0;
        for _ in 0..batch_size {
            if can_finish.load(Ordering::Acquire) {
                break;
            }
            match self.read_chunk_from_storage(budget.map(|b| (b, start))) {
                Ok(StorageRead::Chunk(chunk)) => {
                    num_read_chunks += 1;
                    if let Err(chunk) = self.buffer.try_put(chunk) {
                        self.pending = Some(chunk);
                        break;
                    }
                }
                Ok(StorageRead::Yield) => break,
                Ok(StorageRead::EndOfStream) => {
                    self.state = ChunkSourceState::Exhausted;
                    debug!(
                        "olap chunk source reached end of stream: tablet_id={} rows={}",
                        self.morsel.tablet_id, self.num_rows_read
                    );
                    return Ok((FillStatus::EndOfStream, num_read_chunks));
                }
                Err(err) => {
                    self.set_error(err.clone());
                    return Err(err);
                }
            }
            if budget.is_some_and(|b| self.should_yield(b, start)) {
                break;
            }
        }
        Ok((FillStatus::Ok, num_read_chunks))
    }

    /// Time budget spent, or the preemption threshold passed while another workgroup claims
    /// the worker.
    fn should_yield(&self, budget: &YieldBudget<'_>, start: Instant) -> bool {
        let spent = start.elapsed();
        if spent >= self.options.yield_max_time_spent {
            debug!(
                "olap chunk source yield: tablet_id={} worker_id={} spent_ms={}",
                self.morsel.tablet_id,
                budget.worker_id,
                spent.as_millis()
            );
            return true;
        }
        if spent >= self.options.yield_preempt_max_time_spent
            && budget
                .ownership
                .worker_claimed_by_other(budget.worker_id, budget.running_wg)
        {
            debug!(
                "olap chunk source preempted: tablet_id={} worker_id={} workgroup={} spent_ms={}",
                self.morsel.tablet_id,
                budget.worker_id,
                budget.running_wg,
                spent.as_millis()
            );
            return true;
        }
        false
    }

    /// Next non-empty chunk after residual filtering. End of stream also covers a reached
    /// limit. With a budget, gives up once the budget is spent on chunks that filtered to
    /// nothing.
    fn read_chunk_from_storage(
        &mut self,
        budget: Option<(&YieldBudget<'_>, Instant)>,
    ) -> ScanResult<StorageRead> {
        loop {
            if let Some(limit) = self.node.limit
                && self.num_rows_read >= limit
            {
                debug!(
                    "olap chunk source limit reach: tablet_id={} limit={}",
                    self.morsel.tablet_id, limit
                );
                return Ok(StorageRead::EndOfStream);
            }
            if self
                .cancelled
                .as_ref()
                .is_some_and(|flag| flag.load(Ordering::Acquire))
            {
                return Err(ScanError::cancelled("canceled state"));
            }
            let reader = self.reader.as_mut().ok_or_else(|| {
                ScanError::internal(format!(
                    "chunk source for tablet {} has no reader",
                    self.morsel.tablet_id
                ))
            })?;
            let mut chunk = match reader.get_next()? {
                ChunkPoll::EndOfStream => return Ok(StorageRead::EndOfStream),
                ChunkPoll::Ready(chunk) => chunk,
            };
            self.update_realtime_counter();
            for (slot_id, name) in &self.slot_bindings {
                chunk
                    .bind_slot(*slot_id, name)
                    .map_err(ScanError::internal)?;
            }
            self.filter_residual(&mut chunk)?;
            if chunk.is_empty() {
                if let Some((budget, start)) = budget
                    && self.should_yield(budget, start)
                {
                    return Ok(StorageRead::Yield);
                }
                continue;
            }
            if let Some(limit) = self.node.limit {
                let remaining = limit - self.num_rows_read;
                if chunk.num_rows() > remaining {
                    chunk = chunk.slice(0, remaining);
                }
            }
            self.num_rows_read += chunk.num_rows();
            return Ok(StorageRead::Chunk(chunk));
        }
    }

    fn filter_residual(&self, chunk: &mut Chunk) -> ScanResult<()> {
        if chunk.is_empty() || (self.residual_predicates.is_empty() && self.residual_exprs.is_empty())
        {
            return Ok(());
        }
        let charge = chunk.estimated_bytes() as i64;
        if let Some(tracker) = &self.mem_tracker {
            tracker
                .try_consume(charge)
                .map_err(ScanError::resource_exhausted)?;
        }
        let result = self.apply_residual(chunk);
        if let Some(tracker) = &self.mem_tracker {
            tracker.release(charge);
        }
        result
    }

    fn apply_residual(&self, chunk: &mut Chunk) -> ScanResult<()> {
        let _timer = self.profile.scoped_timer("ExprFilterTime");
        for predicate in &self.residual_predicates {
            let mask = predicate
                .evaluate_chunk(chunk)
                .map_err(ScanError::internal)?;
            chunk.filter(&mask).map_err(ScanError::internal)?;
            if chunk.is_empty() {
                return Ok(());
            }
        }
        for conjunct in &self.residual_exprs {
            let mask = conjunct.evaluate(chunk).map_err(ScanError::internal)?;
            chunk.filter(&mask).map_err(ScanError::internal)?;
            if chunk.is_empty() {
                return Ok(());
            }
        }
        Ok(())
    }

    fn update_realtime_counter(&mut self) {
        let Some(reader) = self.reader.as_mut() else {
            return;
        };
        let stats = reader.stats_mut();
        let compressed = std::mem::take(&mut stats.compressed_bytes_read);
        let raw_rows = std::mem::take(&mut stats.raw_rows_read);
        self.compressed_bytes_read += compressed;
        self.raw_rows_read += raw_rows;
        self.profile
            .counter_add("CompressedBytesRead", CounterUnit::Bytes, compressed);
        self.profile
            .counter_add("RawRowsRead", CounterUnit::Unit, raw_rows);
    }

    fn update_counter(&self, stats: &ScanStatistics) {
        for (name, unit, value) in STATISTICS_COUNTERS {
            self.profile.counter_add(name, *unit, value(stats));
        }
        self.profile
            .counter_add("RowsRead", CounterUnit::Unit, self.num_rows_read as i64);
        self.profile.counter_set(
            "PushdownPredicates",
            CounterUnit::Unit,
            self.pushdown_predicates as i64,
        );
    }

    /// Reader CPU time (decompression, predicate and delete filtering) since the previous call.
    pub fn last_spent_cpu_time_ns(&mut self) -> i64 {
        let Some(reader) = self.reader.as_ref() else {
            return 0;
        };
        let stats = reader.stats();
        let total = stats.decompress_ns + stats.vec_cond_ns + stats.del_filter_ns;
        let delta = total - self.last_cpu_time_ns;
        self.last_cpu_time_ns = total;
        delta
    }

    fn set_error(&mut self, err: ScanError) {
        if err.is_cancelled() {
            debug!(
                "olap chunk source cancelled: tablet_id={}",
                self.morsel.tablet_id
            );
        } else {
            warn!(
                "olap chunk source failed: tablet_id={} error={}",
                self.morsel.tablet_id, err
            );
        }
        self.status = Some(err);
        self.state = ChunkSourceState::Error;
    }

    /// Release the reader and flush its statistics. Later calls do nothing.
    pub fn close(&mut self) {
        if self.state == ChunkSourceState::Closed {
            return;
        }
        if let Some(mut reader) = self.reader.take() {
            self.update_counter(reader.stats());
            reader.close();
        } else if self.state != ChunkSourceState::Created {
            self.update_counter(&ScanStatistics::default());
        }
        self.residual_predicates.clear();
        self.residual_exprs.clear();
        self.pending = None;
        self.mem_tracker = None;
        self.state = ChunkSourceState::Closed;
        debug!(
            "olap chunk source closed: tablet_id={} rows_read={} raw_rows_read={}",
            self.morsel.tablet_id, self.num_rows_read, self.raw_rows_read
        );
    }
}

/// Scanner columns minus the unused output columns. Unused columns read by a residual filter
/// are kept.
fn output_columns(
    scanner_columns: &[ColumnId],
    unused_output_columns: &[ColumnId],
    residual_predicates: &[ColumnPredicate],
    residual_exprs: &[Conjunct],
    slots: &[SlotDescriptor],
    schema: &TabletSchema,
) -> ScanResult<Vec<ColumnId>> {
    if unused_output_columns.is_empty() {
        return Ok(scanner_columns.to_vec());
    }
    let mut needed = residual_predicates
        .iter()
        .map(|p| p.column)
        .collect::<Vec<_>>();
    for slot_id in residual_exprs.iter().flat_map(Conjunct::slot_ids) {
        if let Some(column) = slots
            .iter()
            .find(|s| s.id == slot_id)
            .and_then(|s| schema.field_index(&s.col_name))
        {
            needed.push(column);
        }
    }
    let columns = scanner_columns
        .iter()
        .copied()
        .filter(|c| !unused_output_columns.contains(c) || needed.contains(c))
        .collect::<Vec<_>>();
    if columns.is_empty() {
        return Err(ScanError::internal(
            "failed to build storage scanner, every materialized slot is an unused output column",
        ));
    }
    Ok(columns)
}

impl Drop for ChunkSource {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    use arrow::array::{Array, Int32Array, Int64Array, RecordBatch};
    use arrow::datatypes::DataType;

    use super::*;
    use crate::exec::predicate::classifier::ConjunctClassifier;
    use crate::exec::predicate::key_range::OlapTuple;
    use crate::exec::predicate::{PredicateOp, ScalarValue};
    use crate::exec::workgroup::NeverClaimed;
    use crate::storage::memory::{MemStorageEngine, MemTablet};
    use crate::storage::{KeysType, Tablet, TabletColumn};

    fn engine(rows: i32) -> Arc<MemStorageEngine> {
        engine_with_latency(rows, Duration::ZERO)
    }

    fn engine_with_latency(rows: i32, latency: Duration) -> Arc<MemStorageEngine> {
        let schema = TabletSchema::try_new(
            vec![
                TabletColumn::key("k", DataType::Int32),
                TabletColumn::value("v", DataType::Int64, false),
            ],
            KeysType::Duplicate,
        )
        .expect("schema");
        let tablet = MemTablet::new(1, 9, schema).with_io_latency(latency);
        let batch = RecordBatch::try_new(
            tablet.schema().arrow_schema(),
            vec![
                Arc::new(Int32Array::from((0..rows).collect::<Vec<_>>())),
                Arc::new(Int64Array::from((0..rows).map(|v| v as i64 * 10).collect::<Vec<_>>())),
            ],
        )
        .expect("batch");
        tablet.append_rowset(1, vec![batch]).expect("rowset");
        let engine = Arc::new(MemStorageEngine::new());
        engine.add_tablet(Arc::new(tablet));
        engine
    }

    fn source(node: OlapScanNode, engine: Arc<MemStorageEngine>, capacity: usize) -> ChunkSource {
        ChunkSource::new(
            OlapMorsel::new(1, 1, 9),
            Arc::new(node),
            engine,
            ScanOptions::default(),
            RuntimeProfile::new("test"),
            Arc::new(ChunkBuffer::new(capacity, "test")),
        )
    }

    fn slots() -> Vec<SlotDescriptor> {
        vec![SlotDescriptor::new(SlotId::new(1), "v")]
    }

    #[test]
    fn fill_batch_stops_at_batch_size_and_resumes() {
        let mut source = source(OlapScanNode::new(0, slots()), engine(100), 16);
        let state = RuntimeState::default().with_chunk_size(10);
        source.prepare(&state).expect("prepare");
        let stop = AtomicBool::new(false);
        assert_eq!(source.fill_batch(3, &stop).expect("fill"), FillStatus::Ok);
        assert_eq!(source.buffer.size(), 3);
        assert_eq!(source.state(), ChunkSourceState::Scanning);
        let mut status = FillStatus::Ok;
        while status == FillStatus::Ok {
            status = source.fill_batch(4, &stop).expect("fill");
        }
        assert_eq!(source.buffer.size(), 10);
        assert_eq!(source.num_rows_read(), 100);
        assert!(source.is_terminal());
        // Projection drops the key column read for merging.
        let chunk = source.buffer.try_get().expect("chunk");
        assert_eq!(chunk.num_columns(), 1);
        assert!(chunk.column_by_slot_id(SlotId::new(1)).is_ok());
    }

    #[test]
    fn can_finish_stops_before_reading() {
        let mut source = source(OlapScanNode::new(0, slots()), engine(10), 4);
        source.prepare(&RuntimeState::default()).expect("prepare");
        let stop = AtomicBool::new(true);
        assert_eq!(source.fill_batch(4, &stop).expect("fill"), FillStatus::Ok);
        assert!(source.buffer.empty());
        assert_eq!(source.raw_rows_read(), 0);
    }

    #[test]
    fn residual_expr_drops_empty_chunks_and_slices_limit() {
        let conjunct = Conjunct::predicate(
            SlotId::new(1),
            PredicateOp::Ge,
            vec![ScalarValue::Int64(450)],
        );
        let node = OlapScanNode::new(0, slots())
            .with_conjuncts(vec![Conjunct::or(conjunct.clone(), conjunct)])
            .with_limit(25);
        let mut source = source(node, engine(100), 16);
        source
            .prepare(&RuntimeState::default().with_chunk_size(10))
            .expect("prepare");
        let stop = AtomicBool::new(false);
        let mut status = FillStatus::Ok;
        while status == FillStatus::Ok {
            status = source.fill_batch(16, &stop).expect("fill");
        }
        let sizes = std::iter::from_fn(|| source.buffer.try_get())
            .map(|c| c.num_rows())
            .collect::<Vec<_>>();
        // Rows 45..=69 in chunks of at most 10; the first post-filter chunk holds 5 rows.
        assert_eq!(sizes, vec![5, 10, 10]);
        assert_eq!(source.num_rows_read(), 25);
    }

    #[test]
    fn cancellation_is_sticky() {
        let mut source = source(OlapScanNode::new(0, slots()), engine(10), 4);
        let state = RuntimeState::default();
        source.prepare(&state).expect("prepare");
        state.cancel();
        let stop = AtomicBool::new(false);
        let err = source.fill_batch(1, &stop).expect_err("cancelled");
        assert!(err.is_cancelled());
        assert_eq!(source.state(), ChunkSourceState::Error);
        let again = source.fill_batch(1, &stop).expect_err("sticky");
        assert_eq!(again, err);
        assert!(source.buffer.empty());
    }

    #[test]
    fn close_flushes_statistics_once() {
        let profile = RuntimeProfile::new("test");
        let mut source = ChunkSource::new(
            OlapMorsel::new(1, 1, 9),
            Arc::new(OlapScanNode::new(0, slots())),
            engine(30),
            ScanOptions::default(),
            profile.clone(),
            Arc::new(ChunkBuffer::new(8, "test")),
        );
        source
            .prepare(&RuntimeState::default().with_chunk_size(16))
            .expect("prepare");
        let stop = AtomicBool::new(false);
        while source.fill_batch(8, &stop).expect("fill") == FillStatus::Ok {}
        assert_eq!(profile.counter_value("RawRowsRead"), Some(30));
        source.close();
        source.close();
        assert_eq!(profile.counter_value("RowsRead"), Some(30));
        assert_eq!(profile.counter_value("RawRowsRead"), Some(30));
        assert_eq!(profile.counter_value("SegmentsReadCount"), Some(1));
        assert_eq!(source.state(), ChunkSourceState::Closed);
        assert_eq!(source.last_spent_cpu_time_ns(), 0);
    }

    #[test]
    fn preempted_worker_yields_after_threshold() {
        struct AlwaysClaimed;
        impl WorkerOwnership for AlwaysClaimed {
            fn worker_claimed_by_other(&self, _worker_id: usize, _current: WorkGroupId) -> bool {
                true
            }
        }
        let mut source = source(OlapScanNode::new(0, slots()), engine(100), 64);
        source.options = ScanOptions::default()
            .with_yield_thresholds(Duration::from_secs(10), Duration::ZERO);
        source
            .prepare(&RuntimeState::default().with_chunk_size(1))
            .expect("prepare");
        let stop = AtomicBool::new(false);
        let budget = YieldBudget {
            worker_id: 0,
            running_wg: WorkGroupId(1),
            ownership: &AlwaysClaimed,
        };
        let (status, chunks) = source
            .fill_batch_for_workgroup(64, &stop, &budget)
            .expect("fill");
        assert_eq!(status, FillStatus::Ok);
        assert_eq!(chunks, 1);

        let budget = YieldBudget {
            worker_id: 0,
            running_wg: WorkGroupId(1),
            ownership: &NeverClaimed,
        };
        let (_, chunks) = source
            .fill_batch_for_workgroup(5, &stop, &budget)
            .expect("fill");
        assert_eq!(chunks, 5);
        let chunk = source.buffer.try_get().expect("chunk");
        let values = chunk
            .column_by_slot_id(SlotId::new(1))
            .expect("column");
        assert_eq!(values.len(), 1);
    }

    fn drain(source: &mut ChunkSource) -> Vec<i32> {
        let stop = AtomicBool::new(false);
        while source.fill_batch(8, &stop).expect("fill") == FillStatus::Ok {}
        let mut keys = Vec::new();
        while let Some(chunk) = source.buffer.try_get() {
            let column = chunk.column_by_slot_id(SlotId::new(1)).expect("column");
            let column = column
                .as_any()
                .downcast_ref::<Int32Array>()
                .expect("int32");
            keys.extend(column.values().iter().copied());
        }
        keys
    }

    #[test]
    fn morsel_key_ranges_bound_unconstrained_scan() {
        let range = KeyRange::new(
            OlapTuple::values(vec![ScalarValue::Int32(20)]),
            true,
            OlapTuple::values(vec![ScalarValue::Int32(30)]),
            false,
        );
        let node = OlapScanNode::new(0, vec![SlotDescriptor::new(SlotId::new(1), "k")]);
        let mut source = ChunkSource::new(
            OlapMorsel::new(1, 1, 9).with_key_ranges(vec![range]),
            Arc::new(node),
            engine(100),
            ScanOptions::default().with_scanners_per_tablet(1),
            RuntimeProfile::new("test"),
            Arc::new(ChunkBuffer::new(16, "test")),
        );
        source
            .prepare(&RuntimeState::default().with_chunk_size(4))
            .expect("prepare");
        assert_eq!(drain(&mut source), (20..30).collect::<Vec<_>>());
        assert_eq!(source.num_rows_read(), 10);
    }

    #[test]
    fn skip_aggregation_reads_scanner_columns_only() {
        let mut merged = source(OlapScanNode::new(0, slots()), engine(10), 4);
        merged.prepare(&RuntimeState::default()).expect("prepare");
        assert_eq!(merged.reader.as_ref().map(ReadChain::is_projected), Some(true));

        let node = OlapScanNode::new(0, slots()).with_skip_aggregation(true);
        let mut direct = source(node, engine(10), 4);
        direct.prepare(&RuntimeState::default()).expect("prepare");
        assert_eq!(direct.reader.as_ref().map(ReadChain::is_projected), Some(false));
    }

    #[test]
    fn unknown_unused_output_column_fails_prepare() {
        let node = OlapScanNode::new(0, slots()).with_unused_output_columns(vec!["zzz".to_string()]);
        let mut source = source(node, engine(10), 4);
        let err = source
            .prepare(&RuntimeState::default())
            .expect_err("unknown column");
        assert!(matches!(err, ScanError::InternalError(_)), "err={err}");
        assert!(err.message().contains("invalid field name: zzz"), "err={err}");
    }

    #[test]
    fn plan_supplied_classifier_can_prune_the_scan() {
        struct NothingMatches;
        impl ConjunctClassifier for NothingMatches {
            fn classify(
                &self,
                _conjuncts: &[Conjunct],
                _slots: &[SlotDescriptor],
                _schema: &TabletSchema,
                _options: &ClassifyOptions,
            ) -> ScanResult<ClassifiedConjuncts> {
                Ok(ClassifiedConjuncts {
                    always_false: true,
                    ..ClassifiedConjuncts::default()
                })
            }
        }
        let node = OlapScanNode::new(0, slots()).with_classifier(Arc::new(NothingMatches));
        let mut source = source(node, engine(10), 4);
        source.prepare(&RuntimeState::default()).expect("prepare");
        assert_eq!(source.state(), ChunkSourceState::Exhausted);
        let stop = AtomicBool::new(false);
        assert_eq!(source.fill_batch(4, &stop).expect("fill"), FillStatus::EndOfStream);
        assert!(source.buffer.empty());
    }

    fn key_and_value_slots() -> Vec<SlotDescriptor> {
        vec![
            SlotDescriptor::new(SlotId::new(1), "k"),
            SlotDescriptor::new(SlotId::new(2), "v"),
        ]
    }

    fn first_chunk(source: &mut ChunkSource) -> Chunk {
        let stop = AtomicBool::new(false);
        source.fill_batch(1, &stop).expect("fill");
        source.buffer.try_get().expect("chunk")
    }

    #[test]
    fn unused_output_columns_are_dropped_from_chunks() {
        let node = OlapScanNode::new(0, key_and_value_slots())
            .with_unused_output_columns(vec!["v".to_string()]);
        let mut source = source(node, engine(10), 4);
        source.prepare(&RuntimeState::default()).expect("prepare");
        assert_eq!(source.reader.as_ref().map(ReadChain::is_projected), Some(true));
        let chunk = first_chunk(&mut source);
        assert_eq!(chunk.num_columns(), 1);
        assert!(chunk.column_by_slot_id(SlotId::new(1)).is_ok());
        assert!(chunk.column_by_slot_id(SlotId::new(2)).is_err());
    }

    #[test]
    fn unused_output_column_read_by_residual_filter_is_kept() {
        let v = |op, value| Conjunct::predicate(SlotId::new(2), op, vec![ScalarValue::Int64(value)]);
        let node = OlapScanNode::new(0, key_and_value_slots())
            .with_conjuncts(vec![Conjunct::or(v(PredicateOp::Ge, 50), v(PredicateOp::Lt, 0))])
            .with_unused_output_columns(vec!["v".to_string()]);
        let mut source = source(node, engine(10), 4);
        source.prepare(&RuntimeState::default()).expect("prepare");
        let chunk = first_chunk(&mut source);
        assert_eq!(chunk.num_columns(), 2);
        assert_eq!(chunk.num_rows(), 5);
    }

    #[test]
    fn mixed_key_range_bounds_are_rejected() {
        let range = |lo: i32, hi: i32, end_include: bool| {
            KeyRange::new(
                OlapTuple::values(vec![ScalarValue::Int32(lo)]),
                true,
                OlapTuple::values(vec![ScalarValue::Int32(hi)]),
                end_include,
            )
        };
        let mut source = ChunkSource::new(
            OlapMorsel::new(1, 1, 9).with_key_ranges(vec![range(20, 30, false), range(40, 50, true)]),
            Arc::new(OlapScanNode::new(0, slots())),
            engine(100),
            ScanOptions::default(),
            RuntimeProfile::new("test"),
            Arc::new(ChunkBuffer::new(4, "test")),
        );
        let err = source
            .prepare(&RuntimeState::default())
            .expect_err("mixed bounds");
        assert!(matches!(err, ScanError::InvalidArgument(_)), "err={err}");
        assert!(err.message().contains("mix inclusive and exclusive"), "err={err}");
        assert_eq!(source.state(), ChunkSourceState::Error);
    }

    #[test]
    fn budget_is_checked_while_chunks_filter_to_nothing() {
        let k = |op, value| Conjunct::predicate(SlotId::new(1), op, vec![ScalarValue::Int32(value)]);
        let rejects_all = Conjunct::or(k(PredicateOp::Ge, 100_000), k(PredicateOp::Lt, -5));
        let node = OlapScanNode::new(0, vec![SlotDescriptor::new(SlotId::new(1), "k")])
            .with_conjuncts(vec![rejects_all]);
        let mut source = source(node, engine_with_latency(400, Duration::from_millis(5)), 16);
        source.options = ScanOptions::default()
            .with_yield_thresholds(Duration::from_millis(10), Duration::from_secs(10));
        source
            .prepare(&RuntimeState::default().with_chunk_size(10))
            .expect("prepare");
        let stop = AtomicBool::new(false);
        let budget = YieldBudget {
            worker_id: 0,
            running_wg: WorkGroupId(1),
            ownership: &NeverClaimed,
        };
        let (status, chunks) = source
            .fill_batch_for_workgroup(4, &stop, &budget)
            .expect("fill");
        assert_eq!((status, chunks), (FillStatus::Ok, 0));
        // Every read sleeps 5ms, so the 10ms budget is gone after at most two reads.
        let raw_rows = source.raw_rows_read();
        assert!((10..=20).contains(&raw_rows), "raw_rows={raw_rows}");
        assert_eq!(source.state(), ChunkSourceState::Scanning);

        let mut calls = 1;
        let mut status = FillStatus::Ok;
        while status == FillStatus::Ok {
            (status, _) = source
                .fill_batch_for_workgroup(4, &stop, &budget)
                .expect("fill");
            calls += 1;
        }
        assert_eq!(source.raw_rows_read(), 400);
        assert_eq!(source.num_rows_read(), 0);
        assert!(calls >= 20, "calls={calls}");
        assert!(source.buffer.empty());
    }
}
