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
//! Query-global low-cardinality dictionaries.
//!
//! Dictionaries are immutable snapshots shared through `Arc`; lookups need no locking.

use std::collections::HashMap;
use std::sync::Arc;

use arrow::array::{ArrayRef, StringArray};

use crate::common::ids::{ColumnId, SlotId};

/// Value dictionary of one string column; codes are positions in `values`.
#[derive(Debug)]
pub struct GlobalDict {
    values: Vec<String>,
    codes: HashMap<String, i32>,
}

impl GlobalDict {
    pub fn try_new(values: Vec<String>) -> Result<Self, String> {
        let mut codes = HashMap::with_capacity(values.len());
        for (idx, value) in values.iter().enumerate() {
            let code = i32::try_from(idx)
                .map_err(|_| format!("global dict too large: {} values", values.len()))?;
            if codes.insert(value.clone(), code).is_some() {
                return Err(format!("duplicate global dict value: {value}"));
            }
        }
        Ok(Self { values, codes })
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn code_of(&self, value: &str) -> Option<i32> {
        self.codes.get(value).copied()
    }

    pub fn value_of(&self, code: i32) -> Option<&str> {
        usize::try_from(code)
            .ok()
            .and_then(|idx| self.values.get(idx))
            .map(String::as_str)
    }

    /// Dictionary values as an Arrow array, in code order.
    pub fn values_array(&self) -> ArrayRef {
        Arc::new(StringArray::from_iter_values(self.values.iter()))
    }
}

/// Dictionaries supplied by the query, keyed by output slot.
pub type GlobalDictMap = HashMap<SlotId, Arc<GlobalDict>>;

/// Dictionaries re-keyed by tablet column for the storage reader.
pub type ColumnIdToGlobalDictMap = HashMap<ColumnId, Arc<GlobalDict>>;

#[cfg(test)]
mod tests {
    use super::GlobalDict;

    #[test]
    fn codes_follow_value_order() {
        let dict = GlobalDict::try_new(vec!["cn".into(), "de".into(), "us".into()]).expect("dict");
        assert_eq!(dict.code_of("de"), Some(1));
        assert_eq!(dict.value_of(2), Some("us"));
        assert_eq!(dict.code_of("fr"), None);
        assert_eq!(dict.value_of(-1), None);
    }

    #[test]
    fn duplicate_values_are_rejected() {
        let err = GlobalDict::try_new(vec!["a".into(), "a".into()]).expect_err("duplicate");
        assert!(err.contains("duplicate"), "err={}", err);
    }
}
