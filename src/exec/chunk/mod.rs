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
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use arrow::array::{Array, ArrayRef, BooleanArray, RecordBatch};
use arrow::buffer::Buffer;
use arrow::compute::filter_record_batch;
use arrow::datatypes::{Field, Schema, SchemaRef};

use crate::common::ids::{ColumnId, SlotId};

pub const FIELD_META_SLOT_ID: &str = "olapscan.slot_id";
pub const FIELD_META_COLUMN_ID: &str = "olapscan.column_id";

/// A columnar batch of rows.
///
/// Wraps an Arrow `RecordBatch`; every column has the batch's row count. Fields produced by a
/// storage reader carry their tablet column id in metadata, and slots bound by the chunk source
/// are resolved through `slot_id_to_index`.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub batch: RecordBatch,
    slot_id_to_index: Arc<HashMap<SlotId, usize>>,
}

impl Chunk {
    pub fn try_new(batch: RecordBatch) -> Result<Self, String> {
        let slot_id_to_index = slot_id_to_index_from_schema(batch.schema().as_ref())?;
        Ok(Self {
            batch,
            slot_id_to_index: Arc::new(slot_id_to_index),
        })
    }

    pub fn new_empty(schema: SchemaRef) -> Self {
        Self {
            batch: RecordBatch::new_empty(schema),
            slot_id_to_index: Arc::new(HashMap::new()),
        }
    }

    pub fn schema(&self) -> SchemaRef {
        self.batch.schema()
    }

    pub fn slot_id_to_index(&self) -> &HashMap<SlotId, usize> {
        &self.slot_id_to_index
    }

    /// Map `slot_id` to the field named `column_name`.
    pub fn bind_slot(&mut self, slot_id: SlotId, column_name: &str) -> Result<(), String> {
        let idx = self
            .batch
            .schema()
            .index_of(column_name)
            .map_err(|_| format!("column {} for slot {} not found in chunk", column_name, slot_id))?;
        Arc::make_mut(&mut self.slot_id_to_index).insert(slot_id, idx);
        Ok(())
    }

    pub fn column_by_slot_id(&self, slot_id: SlotId) -> Result<ArrayRef, String> {
        let idx = self
            .slot_id_to_index
            .get(&slot_id)
            .copied()
            .ok_or_else(|| {
                format!(
                    "slot id {} not found in chunk (num_columns={}, slot_ids={:?})",
                    slot_id,
                    self.batch.num_columns(),
                    self.slot_id_to_index.keys().collect::<Vec<_>>()
                )
            })?;
        self.batch
            .columns()
            .get(idx)
            .cloned()
            .ok_or_else(|| format!("slot id {} mapped to invalid index {}", slot_id, idx))
    }

    pub fn column_by_column_id(&self, column_id: ColumnId) -> Result<ArrayRef, String> {
        let schema = self.batch.schema();
        for (idx, field) in schema.fields().iter().enumerate() {
            if field_column_id(field.as_ref())? == Some(column_id) {
                return Ok(Arc::clone(self.batch.column(idx)));
            }
        }
        Err(format!(
            "column id {} not found in chunk (num_columns={})",
            column_id,
            self.batch.num_columns()
        ))
    }

    pub fn len(&self) -> usize {
        self.batch.num_rows()
    }

    pub fn num_rows(&self) -> usize {
        self.batch.num_rows()
    }

    pub fn num_columns(&self) -> usize {
        self.batch.num_columns()
    }

    pub fn is_empty(&self) -> bool {
        self.batch.num_rows() == 0
    }

    pub fn columns(&self) -> &[ArrayRef] {
        self.batch.columns()
    }

    pub fn slice(&self, offset: usize, length: usize) -> Self {
        Self {
            batch: self.batch.slice(offset, length),
            slot_id_to_index: Arc::clone(&self.slot_id_to_index),
        }
    }

    /// Keep only the rows whose mask entry is true; null mask entries drop the row.
    pub fn filter(&mut self, selection: &BooleanArray) -> Result<(), String> {
        if selection.len() != self.len() {
            return Err(format!(
                "selection length {} does not match chunk rows {}",
                selection.len(),
                self.len()
            ));
        }
        if selection.null_count() == 0 && selection.true_count() == selection.len() {
            return Ok(());
        }
        self.batch = filter_record_batch(&self.batch, selection).map_err(|e| e.to_string())?;
        Ok(())
    }

    pub fn estimated_bytes(&self) -> usize {
        self.batch.get_array_memory_size()
    }
}

impl Default for Chunk {
    fn default() -> Self {
        Self::new_empty(Arc::new(Schema::empty()))
    }
}

pub fn field_with_slot_id(field: Field, slot_id: SlotId) -> Field {
    let mut meta = field.metadata().clone();
    meta.insert(FIELD_META_SLOT_ID.to_string(), slot_id.to_string());
    field.with_metadata(meta)
}

pub fn field_slot_id(field: &Field) -> Result<Option<SlotId>, String> {
    let Some(v) = field.metadata().get(FIELD_META_SLOT_ID) else {
        return Ok(None);
    };
    Ok(Some(v.parse::<SlotId>()?))
}

pub fn field_with_column_id(field: Field, column_id: ColumnId) -> Field {
    let mut meta = field.metadata().clone();
    meta.insert(FIELD_META_COLUMN_ID.to_string(), column_id.to_string());
    field.with_metadata(meta)
}

pub fn field_column_id(field: &Field) -> Result<Option<ColumnId>, String> {
    let Some(v) = field.metadata().get(FIELD_META_COLUMN_ID) else {
        return Ok(None);
    };
    Ok(Some(v.parse::<ColumnId>()?))
}

fn slot_id_to_index_from_schema(schema: &Schema) -> Result<HashMap<SlotId, usize>, String> {
    let mut map = HashMap::new();
    for (idx, f) in schema.fields().iter().enumerate() {
        let Some(slot_id) = field_slot_id(f.as_ref())? else {
            continue;
        };
        if map.insert(slot_id, idx).is_some() {
            // Slot id collision in a single chunk is a logic error and would make expression evaluation ambiguous.
            return Err(format!(
                "duplicate slot id {} in chunk schema (field index {}, name={})",
                slot_id,
                idx,
                f.name()
            ));
        }
    }
    Ok(map)
}

/// Estimate RecordBatch size by summing unique buffers inside the batch.
///
/// Buffers are de-duplicated only within a single batch; dictionary values shared across
/// batches are counted once per batch.
pub fn record_batch_bytes(batch: &RecordBatch) -> usize {
    let mut seen = HashSet::new();
    let mut total = 0usize;
    for column in batch.columns() {
        total = total.saturating_add(array_data_bytes(&column.to_data(), &mut seen));
    }
    total
}

fn array_data_bytes(data: &arrow::array::ArrayData, seen: &mut HashSet<usize>) -> usize {
    let mut total = 0usize;
    for buffer in data.buffers() {
        total = total.saturating_add(buffer_bytes(buffer, seen));
    }
    if let Some(nulls) = data.nulls() {
        total = total.saturating_add(buffer_bytes(nulls.buffer(), seen));
    }
    for child in data.child_data() {
        total = total.saturating_add(array_data_bytes(child, seen));
    }
    total
}

fn buffer_bytes(buffer: &Buffer, seen: &mut HashSet<usize>) -> usize {
    let ptr = buffer.data_ptr().as_ptr() as usize;
    if !seen.insert(ptr) {
        return 0;
    }
    buffer.capacity().max(buffer.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Int32Array;
    use arrow::datatypes::DataType;

    fn two_column_chunk() -> Chunk {
        let schema = Arc::new(Schema::new(vec![
            field_with_column_id(Field::new("k", DataType::Int32, false), ColumnId::new(0)),
            field_with_column_id(Field::new("v", DataType::Int32, true), ColumnId::new(1)),
        ]));
        let batch = RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int32Array::from(vec![1, 2, 3, 4])),
                Arc::new(Int32Array::from(vec![Some(10), None, Some(30), Some(40)])),
            ],
        )
        .expect("record batch");
        Chunk::try_new(batch).expect("chunk")
    }

    #[test]
    fn rejects_duplicate_slot_id() {
        let schema = Arc::new(Schema::new(vec![
            field_with_slot_id(Field::new("a", DataType::Int32, true), SlotId::new(1)),
            field_with_slot_id(Field::new("b", DataType::Int32, true), SlotId::new(1)),
        ]));
        let batch = RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int32Array::from(vec![1, 2])),
                Arc::new(Int32Array::from(vec![3, 4])),
            ],
        )
        .expect("record batch");
        let err = Chunk::try_new(batch).expect_err("expected duplicate error");
        assert!(err.contains("duplicate slot id"), "err={}", err);
    }

    #[test]
    fn bind_slot_resolves_by_name() {
        let mut chunk = two_column_chunk();
        chunk.bind_slot(SlotId::new(9), "v").expect("bind");
        let col = chunk.column_by_slot_id(SlotId::new(9)).expect("slot column");
        assert_eq!(col.null_count(), 1);
        assert!(chunk.bind_slot(SlotId::new(10), "missing").is_err());
    }

    #[test]
    fn filter_keeps_selected_rows_and_slot_bindings() {
        let mut chunk = two_column_chunk();
        chunk.bind_slot(SlotId::new(1), "k").expect("bind");
        let mask = BooleanArray::from(vec![Some(true), None, Some(false), Some(true)]);
        chunk.filter(&mask).expect("filter");
        assert_eq!(chunk.num_rows(), 2);
        let keys = chunk.column_by_slot_id(SlotId::new(1)).expect("slot");
        let keys = keys.as_any().downcast_ref::<Int32Array>().expect("int32");
        assert_eq!(keys.values(), &[1, 4]);
        let by_id = chunk.column_by_column_id(ColumnId::new(1)).expect("column id");
        assert_eq!(by_id.len(), 2);
    }

    #[test]
    fn filter_rejects_mismatched_mask() {
        let mut chunk = two_column_chunk();
        let err = chunk
            .filter(&BooleanArray::from(vec![true]))
            .expect_err("length mismatch");
        assert!(err.contains("selection length"), "err={}", err);
    }
}
