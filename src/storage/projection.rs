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
//! Column projection over a storage reader.
//!
//! The reader may have to read more columns than the scan outputs (key columns needed for
//! merge-on-read). `ProjectionIterator` narrows each chunk to the requested columns and
//! `ReadChain` picks the direct or projected path once at open time.

use std::sync::Arc;

use arrow::datatypes::{Schema, SchemaRef};

use crate::common::error::{ScanError, ScanResult};
use crate::common::ids::ColumnId;
use crate::exec::chunk::{Chunk, field_column_id};
use crate::storage::{ChunkIterator, ChunkPoll, ScanStatistics, StorageReader};

pub struct ProjectionIterator {
    child: Box<dyn StorageReader>,
    output_schema: SchemaRef,
    indices: Vec<usize>,
}

impl ProjectionIterator {
    /// Project `child` chunks onto `columns`, in that order.
    pub fn try_new(child: Box<dyn StorageReader>, columns: &[ColumnId]) -> ScanResult<Self> {
        let child_schema = child.schema();
        let mut indices = Vec::with_capacity(columns.len());
        for column in columns {
            let idx = find_column(&child_schema, *column)?.ok_or_else(|| {
                ScanError::internal(format!(
                    "projection column {} missing from reader schema",
                    column
                ))
            })?;
            indices.push(idx);
        }
        let output_schema = Arc::new(
            child_schema
                .project(&indices)
                .map_err(|e| ScanError::internal(e.to_string()))?,
        );
        Ok(Self {
            child,
            output_schema,
            indices,
        })
    }

    pub fn init_output_schema(&self) -> SchemaRef {
        Arc::clone(&self.output_schema)
    }

    pub fn reader(&self) -> &dyn StorageReader {
        self.child.as_ref()
    }

    pub fn reader_mut(&mut self) -> &mut dyn StorageReader {
        self.child.as_mut()
    }
}

fn find_column(schema: &Schema, column: ColumnId) -> ScanResult<Option<usize>> {
    for (idx, field) in schema.fields().iter().enumerate() {
        if field_column_id(field).map_err(ScanError::internal)? == Some(column) {
            return Ok(Some(idx));
        }
    }
    Ok(None)
}

impl ChunkIterator for ProjectionIterator {
    fn schema(&self) -> SchemaRef {
        Arc::clone(&self.output_schema)
    }

    fn get_next(&mut self) -> ScanResult<ChunkPoll> {
        match self.child.get_next()? {
            ChunkPoll::EndOfStream => Ok(ChunkPoll::EndOfStream),
            ChunkPoll::Ready(chunk) => {
                let batch = chunk.batch.project(&self.indices)?;
                let chunk = Chunk::try_new(batch).map_err(ScanError::internal)?;
                Ok(ChunkPoll::Ready(chunk))
            }
        }
    }

    fn close(&mut self) {
        self.child.close();
    }
}

/// Iterator chain between the chunk source and storage.
pub enum ReadChain {
    Direct(Box<dyn StorageReader>),
    Projected(ProjectionIterator),
}

impl ReadChain {
    /// Wrap `reader` in a projection unless it already yields exactly `output_columns`.
    pub fn new(
        reader: Box<dyn StorageReader>,
        reader_columns: &[ColumnId],
        output_columns: &[ColumnId],
    ) -> ScanResult<Self> {
        if reader_columns == output_columns {
            Ok(ReadChain::Direct(reader))
        } else {
            Ok(ReadChain::Projected(ProjectionIterator::try_new(
                reader,
                output_columns,
            )?))
        }
    }

    pub fn is_projected(&self) -> bool {
        matches!(self, ReadChain::Projected(_))
    }

    pub fn stats(&self) -> &ScanStatistics {
        match self {
            ReadChain::Direct(reader) => reader.stats(),
            ReadChain::Projected(projection) => projection.reader().stats(),
        }
    }

    pub fn stats_mut(&mut self) -> &mut ScanStatistics {
        match self {
            ReadChain::Direct(reader) => reader.stats_mut(),
            ReadChain::Projected(projection) => projection.reader_mut().stats_mut(),
        }
    }
}

impl ChunkIterator for ReadChain {
    fn schema(&self) -> SchemaRef {
        match self {
            ReadChain::Direct(reader) => reader.schema(),
            ReadChain::Projected(projection) => projection.schema(),
        }
    }

    fn get_next(&mut self) -> ScanResult<ChunkPoll> {
        match self {
            ReadChain::Direct(reader) => reader.get_next(),
            ReadChain::Projected(projection) => projection.get_next(),
        }
    }

    fn close(&mut self) {
        match self {
            ReadChain::Direct(reader) => reader.close(),
            ReadChain::Projected(projection) => projection.close(),
        }
    }
}
