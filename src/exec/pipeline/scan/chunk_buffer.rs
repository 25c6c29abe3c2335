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
//! Bounded chunk queue between a scan's read loop and the pipeline poll.
//!
//! The buffer never blocks. The producer sizes its batches from `capacity() - size()` and gets
//! the chunk back from `try_put` if it overshoots anyway.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use crate::exec::chunk::Chunk;

pub struct ChunkBuffer {
    queue: Mutex<VecDeque<Chunk>>,
    capacity: usize,
    label: String,
}

impl ChunkBuffer {
    pub fn new(capacity: usize, label: impl Into<String>) -> Self {
        let capacity = capacity.max(1);
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            label: label.into(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Chunk>> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append `chunk`, or hand it back when the buffer is full.
    pub fn try_put(&self, chunk: Chunk) -> Result<(), Chunk> {
        let mut guard = self.lock();
        if guard.len() >= self.capacity {
            return Err(chunk);
        }
        guard.push_back(chunk);
        Ok(())
    }

    pub fn try_get(&self) -> Option<Chunk> {
        self.lock().pop_front()
    }

    pub fn size(&self) -> usize {
        self.lock().len()
    }

    pub fn empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Free slots left for the producer.
    pub fn remaining(&self) -> usize {
        self.capacity.saturating_sub(self.size())
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Drop everything still queued; returns the number of chunks discarded.
    pub fn clear(&self) -> usize {
        let mut guard = self.lock();
        let n = guard.len();
        guard.clear();
        n
    }
}
