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
//! Runtime IN filters published by join build sides.
//!
//! Responsibilities:
//! - Holds the exact build-side key values of one join key as a filter on a scan slot.
//! - Shares the filters of a scan node between its operators; every chunk source takes a
//!   snapshot when it is prepared and treats the filters as extra conjuncts.
//!
//! Key exported interfaces:
//! - Types: `RuntimeInFilter`, `RuntimeInFilterSet`.
//!
//! Current limitations:
//! - Filters published after a chunk source is prepared only apply to later morsels.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use crate::common::ids::SlotId;
use crate::exec::predicate::{Conjunct, PredicateOp, ScalarValue};
use crate::olapscan_logging::debug;

/// Exact-value filter on one scan slot.
#[derive(Clone, Debug, PartialEq)]
pub struct RuntimeInFilter {
    filter_id: i32,
    slot_id: SlotId,
    values: Vec<ScalarValue>,
}

impl RuntimeInFilter {
    /// NULL build keys never match a scanned row and are dropped.
    pub fn new(filter_id: i32, slot_id: SlotId, values: Vec<ScalarValue>) -> Self {
        let values = values.into_iter().filter(|v| !v.is_null()).collect();
        Self {
            filter_id,
            slot_id,
            values,
        }
    }

    pub fn filter_id(&self) -> i32 {
        self.filter_id
    }

    pub fn slot_id(&self) -> SlotId {
        self.slot_id
    }

    pub fn values(&self) -> &[ScalarValue] {
        &self.values
    }

    /// The filter as a scan conjunct. An empty build side rejects every row.
    pub fn to_conjunct(&self) -> Conjunct {
        if self.values.is_empty() {
            return Conjunct::Literal(Some(false));
        }
        Conjunct::predicate(self.slot_id, PredicateOp::In, self.values.clone())
    }
}

/// Runtime IN filters of one scan node, keyed by filter id.
#[derive(Debug, Default)]
pub struct RuntimeInFilterSet {
    filters: RwLock<BTreeMap<i32, Arc<RuntimeInFilter>>>,
}

impl RuntimeInFilterSet {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Add `filter`, replacing an earlier filter with the same id.
    pub fn publish(&self, filter: RuntimeInFilter) {
        debug!(
            "runtime in filter published: filter_id={} slot_id={} values={}",
            filter.filter_id,
            filter.slot_id,
            filter.values.len()
        );
        let mut guard = self.filters.write().unwrap_or_else(|e| e.into_inner());
        guard.insert(filter.filter_id, Arc::new(filter));
    }

    /// Filters available now, ordered by filter id.
    pub fn snapshot(&self) -> Vec<Arc<RuntimeInFilter>> {
        self.filters
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_replaces_filter_with_same_id() {
        let set = RuntimeInFilterSet::new();
        assert!(set.snapshot().is_empty());
        set.publish(RuntimeInFilter::new(
            1,
            SlotId::new(2),
            vec![ScalarValue::Int32(5)],
        ));
        set.publish(RuntimeInFilter::new(
            1,
            SlotId::new(2),
            vec![ScalarValue::Int32(6), ScalarValue::Int32(7)],
        ));
        let filters = set.snapshot();
        assert_eq!(filters.len(), 1);
        assert_eq!(filters[0].values().len(), 2);
        assert_eq!(filters[0].slot_id(), SlotId::new(2));
        assert_eq!(filters[0].filter_id(), 1);
    }

    #[test]
    fn null_keys_are_dropped_and_empty_filter_rejects_all() {
        let filter = RuntimeInFilter::new(3, SlotId::new(1), vec![ScalarValue::Null]);
        assert!(filter.values().is_empty());
        assert_eq!(filter.to_conjunct().constant_value(), Some(Some(false)));

        let filter = RuntimeInFilter::new(
            4,
            SlotId::new(1),
            vec![ScalarValue::Int32(9), ScalarValue::Null],
        );
        assert_eq!(
            filter.to_conjunct(),
            Conjunct::predicate(SlotId::new(1), PredicateOp::In, vec![ScalarValue::Int32(9)])
        );
    }
}
