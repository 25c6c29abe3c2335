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
//! Storage-facing contracts of the scan.
//!
//! Responsibilities:
//! - Describes tablet schemas and the parameters a chunk source hands to a storage reader.
//! - Defines the iterator, reader, tablet and engine traits the scan core drives.
//! - Carries reader statistics merged into the scan profile.
//!
//! Key exported interfaces:
//! - Types: `TabletSchema`, `TabletColumn`, `KeysType`, `ReaderParams`, `ScanStatistics`, `ChunkPoll`.
//! - Traits: `ChunkIterator`, `StorageReader`, `Tablet`, `StorageEngine`.
//!
//! Current limitations:
//! - Only the in-memory engine in `memory` ships with the crate.

pub mod memory;
pub mod projection;

use std::collections::HashMap;
use std::sync::Arc;

use arrow::datatypes::{DataType, Field, Schema, SchemaRef};

use crate::common::error::ScanResult;
use crate::common::ids::{ColumnId, SchemaHash, TabletId, Version};
use crate::exec::chunk::{Chunk, field_with_column_id};
use crate::exec::predicate::ColumnPredicate;
use crate::exec::predicate::key_range::OlapTuple;
use crate::runtime::global_dict::ColumnIdToGlobalDictMap;

/// Data model of a tablet. Everything but `Duplicate` merges rows by key on read.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeysType {
    Duplicate,
    Aggregate,
    Unique,
    Primary,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TabletColumn {
    pub name: String,
    pub data_type: DataType,
    pub nullable: bool,
    pub is_key: bool,
}

impl TabletColumn {
    pub fn key(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable: false,
            is_key: true,
        }
    }

    pub fn value(name: impl Into<String>, data_type: DataType, nullable: bool) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable,
            is_key: false,
        }
    }
}

/// Column layout of a tablet. Column ids are positions; key columns form a prefix.
#[derive(Clone, Debug)]
pub struct TabletSchema {
    columns: Vec<TabletColumn>,
    num_key_columns: usize,
    keys_type: KeysType,
    name_to_id: HashMap<String, ColumnId>,
}

impl TabletSchema {
    pub fn try_new(columns: Vec<TabletColumn>, keys_type: KeysType) -> Result<Self, String> {
        let num_key_columns = columns.iter().take_while(|c| c.is_key).count();
        if let Some(pos) = columns.iter().skip(num_key_columns).position(|c| c.is_key) {
            return Err(format!(
                "key column {} follows a value column",
                columns[num_key_columns + pos].name
            ));
        }
        if num_key_columns == 0 {
            return Err("tablet schema has no key column".to_string());
        }
        let mut name_to_id = HashMap::with_capacity(columns.len());
        for (idx, column) in columns.iter().enumerate() {
            let id = u32::try_from(idx)
                .map(ColumnId::new)
                .map_err(|_| format!("too many columns: {}", columns.len()))?;
            if name_to_id.insert(column.name.clone(), id).is_some() {
                return Err(format!("duplicate column name {}", column.name));
            }
        }
        Ok(Self {
            columns,
            num_key_columns,
            keys_type,
            name_to_id,
        })
    }

    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    pub fn num_key_columns(&self) -> usize {
        self.num_key_columns
    }

    pub fn keys_type(&self) -> KeysType {
        self.keys_type
    }

    pub fn columns(&self) -> &[TabletColumn] {
        &self.columns
    }

    pub fn column(&self, id: ColumnId) -> Option<&TabletColumn> {
        self.columns.get(id.index())
    }

    pub fn is_key(&self, id: ColumnId) -> bool {
        id.index() < self.num_key_columns
    }

    pub fn field_index(&self, name: &str) -> Option<ColumnId> {
        self.name_to_id.get(name).copied()
    }

    pub fn key_column_ids(&self) -> Vec<ColumnId> {
        (0..self.num_key_columns)
            .map(|idx| ColumnId::new(idx as u32))
            .collect()
    }

    /// Arrow schema of the full tablet, each field tagged with its column id.
    pub fn arrow_schema(&self) -> SchemaRef {
        let fields = self
            .columns
            .iter()
            .enumerate()
            .map(|(idx, c)| {
                field_with_column_id(
                    Field::new(&c.name, c.data_type.clone(), c.nullable),
                    ColumnId::new(idx as u32),
                )
            })
            .collect::<Vec<_>>();
        Arc::new(Schema::new(fields))
    }

    /// Arrow schema of `columns` in the given order. Dictionary-mapped columns become
    /// `Dictionary(Int32, Utf8)`.
    pub fn projected_schema(
        &self,
        columns: &[ColumnId],
        dicts: &ColumnIdToGlobalDictMap,
    ) -> Result<SchemaRef, String> {
        let mut fields = Vec::with_capacity(columns.len());
        for id in columns {
            let column = self
                .column(*id)
                .ok_or_else(|| format!("column id {} out of range {}", id, self.columns.len()))?;
            let data_type = if dicts.contains_key(id) {
                DataType::Dictionary(Box::new(DataType::Int32), Box::new(DataType::Utf8))
            } else {
                column.data_type.clone()
            };
            fields.push(field_with_column_id(
                Field::new(&column.name, data_type, column.nullable),
                *id,
            ));
        }
        Ok(Arc::new(Schema::new(fields)))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RangeStartOp {
    Ge,
    Gt,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RangeEndOp {
    Le,
    Lt,
}

/// Everything a storage reader needs to open one tablet scan.
#[derive(Clone, Debug)]
pub struct ReaderParams {
    pub tablet_id: TabletId,
    pub version: Version,
    /// Pushed-down predicates, all ANDed.
    pub predicates: Vec<ColumnPredicate>,
    pub range: RangeStartOp,
    pub end_range: RangeEndOp,
    pub start_key: Vec<OlapTuple>,
    pub end_key: Vec<OlapTuple>,
    /// Sorted ascending; key columns first.
    pub reader_columns: Vec<ColumnId>,
    pub chunk_size: usize,
    pub global_dicts: ColumnIdToGlobalDictMap,
    pub skip_aggregation: bool,
    pub use_page_cache: bool,
}

impl Default for ReaderParams {
    fn default() -> Self {
        Self {
            tablet_id: 0,
            version: 0,
            predicates: Vec::new(),
            range: RangeStartOp::Ge,
            end_range: RangeEndOp::Le,
            start_key: Vec::new(),
            end_key: Vec::new(),
            reader_columns: Vec::new(),
            chunk_size: crate::common::config::chunk_size().max(1),
            global_dicts: ColumnIdToGlobalDictMap::new(),
            skip_aggregation: false,
            use_page_cache: true,
        }
    }
}

/// Counters maintained by a storage reader. Timings are in nanoseconds.
///
/// The chunk source resets `compressed_bytes_read` and `raw_rows_read` after every delivered
/// chunk and folds everything else into the profile when it closes.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScanStatistics {
    pub io_ns: i64,
    pub bytes_read: i64,
    pub compressed_bytes_read: i64,
    pub uncompressed_bytes_read: i64,
    pub raw_rows_read: i64,
    pub decompress_ns: i64,
    pub create_segment_iter_ns: i64,
    pub segment_init_ns: i64,
    pub block_load_ns: i64,
    pub blocks_load: i64,
    pub block_fetch_ns: i64,
    pub block_fetch_count: i64,
    pub block_seek_ns: i64,
    pub block_seek_num: i64,
    pub vec_cond_ns: i64,
    pub vec_cond_evaluate_ns: i64,
    pub vec_cond_chunk_copy_ns: i64,
    pub rows_vec_cond_filtered: i64,
    pub rows_del_vec_filtered: i64,
    pub del_filter_ns: i64,
    pub rows_del_filtered: i64,
    pub rows_stats_filtered: i64,
    pub rows_bf_filtered: i64,
    pub rows_key_range_filtered: i64,
    pub rows_bitmap_index_filtered: i64,
    pub bitmap_index_filter_timer: i64,
    pub index_load_ns: i64,
    pub total_pages_num: i64,
    pub cached_pages_num: i64,
    pub rowsets_read_count: i64,
    pub segments_read_count: i64,
    pub total_columns_data_page_count: i64,
    pub decode_dict_ns: i64,
    pub late_materialize_ns: i64,
}

/// Result of one `get_next` call.
#[derive(Debug)]
pub enum ChunkPoll {
    Ready(Chunk),
    EndOfStream,
}

/// Pull-based producer of chunks.
pub trait ChunkIterator: Send {
    /// Schema of the chunks this iterator produces.
    fn schema(&self) -> SchemaRef;

    fn get_next(&mut self) -> ScanResult<ChunkPoll>;

    fn close(&mut self);
}

/// Reader over one tablet version.
pub trait StorageReader: ChunkIterator {
    fn open(&mut self, params: ReaderParams) -> ScanResult<()>;

    fn stats(&self) -> &ScanStatistics;

    fn stats_mut(&mut self) -> &mut ScanStatistics;
}

pub trait Tablet: Send + Sync {
    fn tablet_id(&self) -> TabletId;

    fn schema_hash(&self) -> SchemaHash;

    fn schema(&self) -> Arc<TabletSchema>;

    /// Create an unopened reader that will return `output_schema` columns at `version`.
    fn new_reader(
        &self,
        version: Version,
        output_schema: SchemaRef,
    ) -> ScanResult<Box<dyn StorageReader>>;
}

pub trait StorageEngine: Send + Sync {
    fn get_tablet(&self, tablet_id: TabletId, schema_hash: SchemaHash)
    -> ScanResult<Arc<dyn Tablet>>;
}
