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
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::common::types::UniqueId;
use crate::olapscan_logging::debug;
use crate::runtime::global_dict::GlobalDictMap;
use crate::runtime::mem_tracker::MemTracker;

/// RuntimeState is the per-fragment-instance query context handed to scan operators at prepare.
///
/// It carries the chunk size, the cancellation flag polled before every physical read, the
/// query memory tracker and the query-global dictionaries. Clones share the flag, tracker
/// and dictionaries.
#[derive(Clone, Debug)]
pub struct RuntimeState {
    query_id: Option<UniqueId>,
    chunk_size: usize,
    cancelled: Arc<AtomicBool>,
    mem_tracker: Option<Arc<MemTracker>>,
    global_dicts: Arc<GlobalDictMap>,
}

impl Default for RuntimeState {
    fn default() -> Self {
        Self {
            query_id: None,
            chunk_size: crate::common::config::chunk_size().max(1),
            cancelled: Arc::new(AtomicBool::new(false)),
            mem_tracker: None,
            global_dicts: Arc::new(GlobalDictMap::new()),
        }
    }
}

impl RuntimeState {
    pub fn new(query_id: UniqueId) -> Self {
        Self {
            query_id: Some(query_id),
            ..Self::default()
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn with_mem_tracker(mut self, tracker: Arc<MemTracker>) -> Self {
        self.mem_tracker = Some(tracker);
        self
    }

    pub fn with_global_dicts(mut self, dicts: GlobalDictMap) -> Self {
        self.global_dicts = Arc::new(dicts);
        self
    }

    pub fn query_id(&self) -> Option<UniqueId> {
        self.query_id
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn mem_tracker(&self) -> Option<Arc<MemTracker>> {
        self.mem_tracker.clone()
    }

    pub fn global_dicts(&self) -> &GlobalDictMap {
        &self.global_dicts
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Trip the query-scoped cancellation flag. Watchdogs implement timeouts through this.
    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::AcqRel) {
            debug!(
                "query cancelled: query_id={}",
                self.query_id
                    .map(|id| id.to_string())
                    .unwrap_or_else(|| "unknown".to_string())
            );
        }
    }

    /// Shared handle to the cancellation flag.
    pub fn cancellation_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }
}
