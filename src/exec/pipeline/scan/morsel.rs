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
//! Tablet morsels and the queues that hand them to scan operators.
//!
//! Responsibilities:
//! - Defines the unit of scan work: one tablet at one version.
//! - Distributes morsels across the scan operators of a pipeline.
//!
//! Key exported interfaces:
//! - Types: `OlapMorsel`, `MorselQueue`, `MorselQueueRef`, `FixedMorselQueue`, `DynamicMorselQueue`.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::common::ids::{SchemaHash, TabletId, Version};
use crate::exec::predicate::key_range::KeyRange;

/// One tablet scan assignment.
#[derive(Clone, Debug, PartialEq)]
pub struct OlapMorsel {
    pub tablet_id: TabletId,
    pub version: Version,
    pub schema_hash: SchemaHash,
    /// Planner-supplied key ranges. Used only when the scan's conjuncts bound no key column.
    pub key_ranges: Vec<KeyRange>,
}

impl OlapMorsel {
    pub fn new(tablet_id: TabletId, version: Version, schema_hash: SchemaHash) -> Self {
        Self {
            tablet_id,
            version,
            schema_hash,
            key_ranges: Vec::new(),
        }
    }

    pub fn with_key_ranges(mut self, key_ranges: Vec<KeyRange>) -> Self {
        self.key_ranges = key_ranges;
        self
    }
}

impl fmt::Display for OlapMorsel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "tablet_id={} version={} schema_hash={} key_ranges={}",
            self.tablet_id,
            self.version,
            self.schema_hash,
            self.key_ranges.len()
        )
    }
}

pub trait MorselQueue: Send + Sync {
    fn try_get(&self) -> Option<OlapMorsel>;
    fn unget(&self, morsel: OlapMorsel);
    fn empty(&self) -> bool;
    /// More morsels may still be appended even though the queue is empty now.
    fn has_more(&self) -> bool;
    fn num_original_morsels(&self) -> usize;
}

pub type MorselQueueRef = Arc<dyn MorselQueue>;

/// Queue over a morsel list known at plan time.
pub struct FixedMorselQueue {
    queue: Mutex<VecDeque<OlapMorsel>>,
    original_morsels: usize,
}

impl FixedMorselQueue {
    pub fn new(morsels: Vec<OlapMorsel>) -> Arc<Self> {
        let original_morsels = morsels.len();
        Arc::new(Self {
            queue: Mutex::new(VecDeque::from(morsels)),
            original_morsels,
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<OlapMorsel>> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl MorselQueue for FixedMorselQueue {
    fn try_get(&self) -> Option<OlapMorsel> {
        self.lock().pop_front()
    }

    fn unget(&self, morsel: OlapMorsel) {
        self.lock().push_front(morsel);
    }

    fn empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn has_more(&self) -> bool {
        false
    }

    fn num_original_morsels(&self) -> usize {
        self.original_morsels
    }
}

/// Queue fed incrementally while tablets are still being assigned.
pub struct DynamicMorselQueue {
    queue: Mutex<VecDeque<OlapMorsel>>,
    has_more: AtomicBool,
    original_morsels: usize,
}

impl DynamicMorselQueue {
    pub fn new(morsels: Vec<OlapMorsel>, has_more: bool) -> Arc<Self> {
        let original_morsels = morsels.len();
        Arc::new(Self {
            queue: Mutex::new(VecDeque::from(morsels)),
            has_more: AtomicBool::new(has_more),
            original_morsels,
        })
    }

    pub fn append_morsels(&self, morsels: Vec<OlapMorsel>) {
        if morsels.is_empty() {
            return;
        }
        self.queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(morsels);
    }

    pub fn set_has_more(&self, value: bool) {
        self.has_more.store(value, Ordering::Release);
    }
}

impl MorselQueue for DynamicMorselQueue {
    fn try_get(&self) -> Option<OlapMorsel> {
        self.queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
    }

    fn unget(&self, morsel: OlapMorsel) {
        self.queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_front(morsel);
    }

    fn empty(&self) -> bool {
        self.queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_empty()
    }

    fn has_more(&self) -> bool {
        self.has_more.load(Ordering::Acquire)
    }

    fn num_original_morsels(&self) -> usize {
        self.original_morsels
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_queue_hands_out_in_order() {
        let queue = FixedMorselQueue::new(vec![OlapMorsel::new(1, 2, 3), OlapMorsel::new(4, 2, 3)]);
        let first = queue.try_get().expect("first");
        assert_eq!(first.tablet_id, 1);
        queue.unget(first);
        assert_eq!(queue.try_get().map(|m| m.tablet_id), Some(1));
        assert_eq!(queue.try_get().map(|m| m.tablet_id), Some(4));
        assert!(queue.empty());
        assert!(!queue.has_more());
        assert_eq!(queue.num_original_morsels(), 2);
    }

    #[test]
    fn dynamic_queue_accepts_late_morsels() {
        let queue = DynamicMorselQueue::new(Vec::new(), true);
        assert!(queue.empty());
        assert!(queue.has_more());
        queue.append_morsels(vec![OlapMorsel::new(9, 1, 1)]);
        queue.set_has_more(false);
        assert_eq!(queue.try_get().map(|m| m.tablet_id), Some(9));
        assert!(!queue.has_more());
    }
}
