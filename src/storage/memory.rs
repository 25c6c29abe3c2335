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
//! In-memory tablet store.
//!
//! Responsibilities:
//! - Holds versioned rowsets of Arrow record batches per tablet.
//! - Implements `StorageReader` with key-range seeks, pushed-down predicates, column
//!   selection, batch sizing, global-dictionary encoding and reader statistics.
//!
//! Key exported interfaces:
//! - Types: `MemStorageEngine`, `MemTablet`, `MemTabletReader`.
//!
//! Current limitations:
//! - Rows are never merged by key; aggregate and unique tablets are read as stored.
//! - Every segment is one record batch and counts as one page per column.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::thread;
use std::time::{Duration, Instant};

use arrow::array::{
    Array, ArrayRef, BooleanArray, DictionaryArray, Int32Array, RecordBatch, StringArray,
    UInt32Array,
};
use arrow::compute::{and_kleene, filter_record_batch, take_record_batch};
use arrow::datatypes::{DataType, Int32Type, SchemaRef};

use crate::common::error::{ScanError, ScanResult};
use crate::common::ids::{ColumnId, SchemaHash, TabletId, Version};
use crate::exec::chunk::{Chunk, field_column_id, record_batch_bytes};
use crate::exec::predicate::key_range::KeyRange;
use crate::exec::predicate::scalar_at;
use crate::olapscan_logging::debug;
use crate::runtime::global_dict::GlobalDict;
use crate::runtime::profile::clamp_u128_to_i64;
use crate::storage::{
    ChunkIterator, ChunkPoll, RangeEndOp, RangeStartOp, ReaderParams, ScanStatistics,
    StorageEngine, StorageReader, Tablet, TabletSchema,
};

#[derive(Clone, Debug)]
struct MemRowset {
    version: Version,
    segments: Vec<RecordBatch>,
}

pub struct MemTablet {
    tablet_id: TabletId,
    schema_hash: SchemaHash,
    schema: Arc<TabletSchema>,
    rowsets: RwLock<Vec<MemRowset>>,
    io_latency: Duration,
}

impl MemTablet {
    pub fn new(tablet_id: TabletId, schema_hash: SchemaHash, schema: TabletSchema) -> Self {
        Self {
            tablet_id,
            schema_hash,
            schema: Arc::new(schema),
            rowsets: RwLock::new(Vec::new()),
            io_latency: Duration::ZERO,
        }
    }

    /// Sleep this long on every chunk fetch, emulating slow storage.
    pub fn with_io_latency(mut self, latency: Duration) -> Self {
        self.io_latency = latency;
        self
    }

    /// Publish `segments` as a rowset visible to reads at `version` and above.
    pub fn append_rowset(&self, version: Version, segments: Vec<RecordBatch>) -> Result<(), String> {
        for (idx, segment) in segments.iter().enumerate() {
            self.check_segment(idx, segment)?;
        }
        let mut guard = self.rowsets.write().unwrap_or_else(|e| e.into_inner());
        guard.push(MemRowset { version, segments });
        Ok(())
    }

    pub fn max_version(&self) -> Version {
        self.rowsets
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|r| r.version)
            .max()
            .unwrap_or(0)
    }

    fn check_segment(&self, idx: usize, segment: &RecordBatch) -> Result<(), String> {
        let columns = self.schema.columns();
        if segment.num_columns() != columns.len() {
            return Err(format!(
                "segment {} has {} columns, tablet {} expects {}",
                idx,
                segment.num_columns(),
                self.tablet_id,
                columns.len()
            ));
        }
        for (column, array) in columns.iter().zip(segment.columns()) {
            if array.data_type() != &column.data_type {
                return Err(format!(
                    "segment {} column {} has type {:?}, expected {:?}",
                    idx,
                    column.name,
                    array.data_type(),
                    column.data_type
                ));
            }
            if !column.nullable && array.null_count() > 0 {
                return Err(format!(
                    "segment {} column {} is not nullable but has nulls",
                    idx, column.name
                ));
            }
        }
        Ok(())
    }
}

impl Tablet for MemTablet {
    fn tablet_id(&self) -> TabletId {
        self.tablet_id
    }

    fn schema_hash(&self) -> SchemaHash {
        self.schema_hash
    }

    fn schema(&self) -> Arc<TabletSchema> {
        Arc::clone(&self.schema)
    }

    fn new_reader(
        &self,
        version: Version,
        output_schema: SchemaRef,
    ) -> ScanResult<Box<dyn StorageReader>> {
        let max_version = self.max_version();
        if version > max_version {
            return Err(ScanError::internal(format!(
                "version {} not found for tablet {}, max version {}",
                version, self.tablet_id, max_version
            )));
        }
        let guard = self.rowsets.read().unwrap_or_else(|e| e.into_inner());
        let visible = guard
            .iter()
            .filter(|r| r.version <= version)
            .collect::<Vec<_>>();
        let rowsets_count = visible.len();
        let segments = visible
            .into_iter()
            .flat_map(|r| r.segments.iter().cloned())
            .collect::<Vec<_>>();
        Ok(Box::new(MemTabletReader {
            tablet_id: self.tablet_id,
            tablet_schema: Arc::clone(&self.schema),
            output_schema,
            segments,
            rowsets_count,
            io_latency: self.io_latency,
            params: None,
            key_ranges: Vec::new(),
            key_prefix_len: 0,
            segment_idx: 0,
            segment_ready: false,
            selected: Vec::new(),
            cursor: 0,
            stats: ScanStatistics::default(),
            closed: false,
        }))
    }
}

pub struct MemTabletReader {
    tablet_id: TabletId,
    tablet_schema: Arc<TabletSchema>,
    output_schema: SchemaRef,
    segments: Vec<RecordBatch>,
    rowsets_count: usize,
    io_latency: Duration,
    params: Option<ReaderParams>,
    key_ranges: Vec<KeyRange>,
    key_prefix_len: usize,
    segment_idx: usize,
    segment_ready: bool,
    selected: Vec<u32>,
    cursor: usize,
    stats: ScanStatistics,
    closed: bool,
}

impl MemTabletReader {
    fn validate_params(&self, params: &ReaderParams) -> ScanResult<()> {
        let mut output_ids = Vec::with_capacity(self.output_schema.fields().len());
        for field in self.output_schema.fields() {
            let id = field_column_id(field)
                .map_err(ScanError::internal)?
                .ok_or_else(|| {
                    ScanError::internal(format!("reader field {} has no column id", field.name()))
                })?;
            output_ids.push(id);
        }
        if output_ids != params.reader_columns {
            return Err(ScanError::internal(format!(
                "reader columns {:?} do not match reader schema {:?}",
                params.reader_columns, output_ids
            )));
        }
        let sorted = params.reader_columns.windows(2).all(|w| w[0] < w[1]);
        if !sorted {
            return Err(ScanError::internal(format!(
                "reader columns must be sorted: {:?}",
                params.reader_columns
            )));
        }
        for column in params
            .reader_columns
            .iter()
            .chain(params.predicates.iter().map(|p| &p.column))
        {
            if self.tablet_schema.column(*column).is_none() {
                return Err(ScanError::internal(format!(
                    "column id {} out of range for tablet {}",
                    column, self.tablet_id
                )));
            }
        }
        for column in params.global_dicts.keys() {
            let data_type = self
                .tablet_schema
                .column(*column)
                .map(|c| c.data_type.clone());
            if data_type != Some(DataType::Utf8) {
                return Err(ScanError::internal(format!(
                    "global dict on non-string column {} ({:?})",
                    column, data_type
                )));
            }
        }
        if params.start_key.len() != params.end_key.len() {
            return Err(ScanError::invalid_argument(format!(
                "start_key has {} tuples but end_key has {}",
                params.start_key.len(),
                params.end_key.len()
            )));
        }
        Ok(())
    }

    fn init_segment(&mut self) -> ScanResult<()> {
        let start = Instant::now();
        let segment = &self.segments[self.segment_idx];
        let num_rows = segment.num_rows();
        self.selected.clear();
        self.cursor = 0;
        if self.key_ranges.is_empty() {
            self.selected.extend(0..num_rows as u32);
        } else {
            let mut keys = Vec::with_capacity(self.key_prefix_len);
            for row in 0..num_rows {
                keys.clear();
                for column in 0..self.key_prefix_len {
                    keys.push(
                        scalar_at(segment.column(column).as_ref(), row)
                            .map_err(ScanError::internal)?,
                    );
                }
                if self.key_ranges.iter().any(|r| r.contains(&keys)) {
                    self.selected.push(row as u32);
                }
            }
            self.stats.rows_key_range_filtered += (num_rows - self.selected.len()) as i64;
        }
        self.segment_ready = true;
        self.stats.segment_init_ns += clamp_u128_to_i64(start.elapsed().as_nanos());
        Ok(())
    }

    fn read_next_block(&mut self, params: &ReaderParams) -> ScanResult<RecordBatch> {
        let fetch_start = Instant::now();
        if !self.io_latency.is_zero() {
            thread::sleep(self.io_latency);
        }
        let end = (self.cursor + params.chunk_size.max(1)).min(self.selected.len());
        let indices = UInt32Array::from(self.selected[self.cursor..end].to_vec());
        self.cursor = end;
        let segment = &self.segments[self.segment_idx];
        let raw = if indices.len() == segment.num_rows() {
            segment.clone()
        } else {
            take_record_batch(segment, &indices)?
        };
        let fetch_ns = clamp_u128_to_i64(fetch_start.elapsed().as_nanos());
        self.stats.io_ns += fetch_ns;
        self.stats.block_fetch_ns += fetch_ns;
        self.stats.block_fetch_count += 1;
        self.stats.blocks_load += 1;
        self.stats.block_seek_num += 1;
        let pages = raw.num_columns() as i64;
        self.stats.total_pages_num += pages;
        self.stats.total_columns_data_page_count += pages;
        if params.use_page_cache {
            self.stats.cached_pages_num += pages;
        }
        let bytes = record_batch_bytes(&raw) as i64;
        self.stats.compressed_bytes_read += bytes;
        self.stats.uncompressed_bytes_read += bytes;
        self.stats.raw_rows_read += raw.num_rows() as i64;
        Ok(raw)
    }

    fn apply_predicates(&mut self, params: &ReaderParams, raw: RecordBatch) -> ScanResult<RecordBatch> {
        if params.predicates.is_empty() {
            return Ok(raw);
        }
        let start = Instant::now();
        let mut mask: Option<BooleanArray> = None;
        for predicate in &params.predicates {
            let column = raw.column(predicate.column.index());
            let current = predicate
                .evaluate(column.as_ref())
                .map_err(ScanError::internal)?;
            mask = Some(match mask {
                Some(prev) => and_kleene(&prev, &current)?,
                None => current,
            });
        }
        let filtered = match mask {
            Some(mask) => filter_record_batch(&raw, &mask)?,
            None => raw.clone(),
        };
        let elapsed = clamp_u128_to_i64(start.elapsed().as_nanos());
        self.stats.vec_cond_ns += elapsed;
        self.stats.vec_cond_evaluate_ns += elapsed;
        self.stats.rows_vec_cond_filtered += (raw.num_rows() - filtered.num_rows()) as i64;
        Ok(filtered)
    }

    fn materialize(&mut self, params: &ReaderParams, filtered: &RecordBatch) -> ScanResult<RecordBatch> {
        let start = Instant::now();
        let mut columns = Vec::with_capacity(params.reader_columns.len());
        for column in &params.reader_columns {
            let array = filtered.column(column.index());
            match params.global_dicts.get(column) {
                Some(dict) => columns.push(encode_with_dict(array, dict, *column)?),
                None => columns.push(Arc::clone(array)),
            }
        }
        if !params.global_dicts.is_empty() {
            self.stats.decode_dict_ns += clamp_u128_to_i64(start.elapsed().as_nanos());
        }
        let batch = RecordBatch::try_new(Arc::clone(&self.output_schema), columns)?;
        self.stats.bytes_read += record_batch_bytes(&batch) as i64;
        Ok(batch)
    }
}

fn encode_with_dict(array: &ArrayRef, dict: &GlobalDict, column: ColumnId) -> ScanResult<ArrayRef> {
    let strings = array
        .as_any()
        .downcast_ref::<StringArray>()
        .ok_or_else(|| {
            ScanError::internal(format!(
                "global dict column {} is not Utf8: {:?}",
                column,
                array.data_type()
            ))
        })?;
    let mut codes = Vec::with_capacity(strings.len());
    for value in strings.iter() {
        match value {
            None => codes.push(None),
            Some(v) => {
                let code = dict.code_of(v).ok_or_else(|| {
                    ScanError::internal(format!(
                        "value '{}' of column {} not found in global dict",
                        v, column
                    ))
                })?;
                codes.push(Some(code));
            }
        }
    }
    let keys = Int32Array::from(codes);
    let encoded = DictionaryArray::<Int32Type>::try_new(keys, dict.values_array())?;
    Ok(Arc::new(encoded))
}

impl ChunkIterator for MemTabletReader {
    fn schema(&self) -> SchemaRef {
        Arc::clone(&self.output_schema)
    }

    fn get_next(&mut self) -> ScanResult<ChunkPoll> {
        if self.closed {
            return Err(ScanError::internal(format!(
                "reader of tablet {} is closed",
                self.tablet_id
            )));
        }
        let Some(params) = self.params.take() else {
            return Err(ScanError::internal(format!(
                "reader of tablet {} is not opened",
                self.tablet_id
            )));
        };
        let result = self.next_chunk(&params);
        self.params = Some(params);
        result
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.segments.clear();
        self.selected.clear();
        debug!(
            "mem tablet reader closed: tablet_id={} raw_rows_read={} rows_key_range_filtered={} rows_vec_cond_filtered={}",
            self.tablet_id,
            self.stats.raw_rows_read,
            self.stats.rows_key_range_filtered,
            self.stats.rows_vec_cond_filtered
        );
    }
}

impl MemTabletReader {
    fn next_chunk(&mut self, params: &ReaderParams) -> ScanResult<ChunkPoll> {
        loop {
            if self.segment_idx >= self.segments.len() {
                return Ok(ChunkPoll::EndOfStream);
            }
            if !self.segment_ready {
                self.init_segment()?;
            }
            if self.cursor >= self.selected.len() {
                self.segment_idx += 1;
                self.segment_ready = false;
                continue;
            }
            let raw = self.read_next_block(params)?;
            let filtered = self.apply_predicates(params, raw)?;
            let batch = self.materialize(params, &filtered)?;
            let chunk = Chunk::try_new(batch).map_err(ScanError::internal)?;
            return Ok(ChunkPoll::Ready(chunk));
        }
    }
}

impl StorageReader for MemTabletReader {
    fn open(&mut self, params: ReaderParams) -> ScanResult<()> {
        if self.params.is_some() {
            return Err(ScanError::internal(format!(
                "reader of tablet {} opened twice",
                self.tablet_id
            )));
        }
        let start = Instant::now();
        self.validate_params(&params)?;
        self.key_ranges = params
            .start_key
            .iter()
            .zip(params.end_key.iter())
            .map(|(begin, end)| {
                KeyRange::new(
                    begin.clone(),
                    params.range == RangeStartOp::Ge,
                    end.clone(),
                    params.end_range == RangeEndOp::Le,
                )
            })
            .collect();
        self.key_prefix_len = params
            .start_key
            .iter()
            .chain(params.end_key.iter())
            .map(|t| t.len())
            .max()
            .unwrap_or(0)
            .min(self.tablet_schema.num_key_columns());
        self.stats.rowsets_read_count += self.rowsets_count as i64;
        self.stats.segments_read_count += self.segments.len() as i64;
        self.stats.create_segment_iter_ns += clamp_u128_to_i64(start.elapsed().as_nanos());
        debug!(
            "mem tablet reader opened: tablet_id={} version={} segments={} key_ranges={} predicates={} columns={:?}",
            self.tablet_id,
            params.version,
            self.segments.len(),
            self.key_ranges.len(),
            params.predicates.len(),
            params.reader_columns
        );
        self.params = Some(params);
        Ok(())
    }

    fn stats(&self) -> &ScanStatistics {
        &self.stats
    }

    fn stats_mut(&mut self) -> &mut ScanStatistics {
        &mut self.stats
    }
}

/// Tablet registry keyed by tablet id.
#[derive(Default)]
pub struct MemStorageEngine {
    tablets: RwLock<HashMap<TabletId, Arc<MemTablet>>>,
}

impl MemStorageEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_tablet(&self, tablet: Arc<MemTablet>) {
        let mut guard = self.tablets.write().unwrap_or_else(|e| e.into_inner());
        guard.insert(tablet.tablet_id, tablet);
    }

    pub fn drop_tablet(&self, tablet_id: TabletId) -> Option<Arc<MemTablet>> {
        let mut guard = self.tablets.write().unwrap_or_else(|e| e.into_inner());
        guard.remove(&tablet_id)
    }
}

impl StorageEngine for MemStorageEngine {
    fn get_tablet(
        &self,
        tablet_id: TabletId,
        schema_hash: SchemaHash,
    ) -> ScanResult<Arc<dyn Tablet>> {
        let guard = self.tablets.read().unwrap_or_else(|e| e.into_inner());
        let reason = match guard.get(&tablet_id) {
            Some(tablet) if tablet.schema_hash == schema_hash => {
                return Ok(Arc::clone(tablet) as Arc<dyn Tablet>);
            }
            Some(tablet) => format!("schema hash mismatch, actual={}", tablet.schema_hash),
            None => "tablet not found".to_string(),
        };
        Err(ScanError::internal(format!(
            "failed to get tablet. tablet_id={}, with schema_hash={}, reason={}",
            tablet_id, schema_hash, reason
        )))
    }
}
