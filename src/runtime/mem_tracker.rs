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
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// Tracks logical memory usage for a component and its ancestors.
///
/// This is a lightweight accounting utility that only records bytes explicitly
/// reported by the caller. It does NOT reflect real process RSS or allocator
/// statistics. A negative limit means unlimited.
#[derive(Debug)]
pub struct MemTracker {
    label: String,
    limit: i64,
    parent: Option<Arc<MemTracker>>,
    current: AtomicI64,
    peak: AtomicI64,
    allocated: AtomicI64,
    deallocated: AtomicI64,
    children: Mutex<Vec<Weak<MemTracker>>>,
}

impl MemTracker {
    /// Create a root tracker with no parent.
    pub fn new_root(label: impl Into<String>) -> Arc<Self> {
        Self::new_root_with_limit(label, -1)
    }

    pub fn new_root_with_limit(label: impl Into<String>, limit: i64) -> Arc<Self> {
        Arc::new(Self::new_inner(label.into(), limit, None))
    }

    /// Create a child tracker with the provided parent.
    pub fn new_child(label: impl Into<String>, parent: &Arc<MemTracker>) -> Arc<Self> {
        let child = Arc::new(Self::new_inner(label.into(), -1, Some(Arc::clone(parent))));
        parent
            .children
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::downgrade(&child));
        child
    }

    fn new_inner(label: String, limit: i64, parent: Option<Arc<MemTracker>>) -> Self {
        Self {
            label,
            limit,
            parent,
            current: AtomicI64::new(0),
            peak: AtomicI64::new(0),
            allocated: AtomicI64::new(0),
            deallocated: AtomicI64::new(0),
            children: Mutex::new(Vec::new()),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn limit(&self) -> i64 {
        self.limit
    }

    pub fn current(&self) -> i64 {
        self.current.load(Ordering::Relaxed)
    }

    pub fn peak(&self) -> i64 {
        self.peak.load(Ordering::Relaxed)
    }

    pub fn allocated(&self) -> i64 {
        self.allocated.load(Ordering::Relaxed)
    }

    pub fn deallocated(&self) -> i64 {
        self.deallocated.load(Ordering::Relaxed)
    }

    pub fn children(&self) -> Vec<Arc<MemTracker>> {
        let guard = self.children.lock().unwrap_or_else(|e| e.into_inner());
        guard.iter().filter_map(Weak::upgrade).collect()
    }

    /// Increase consumption for this tracker and all ancestors.
    pub fn consume(&self, bytes: i64) {
        if bytes <= 0 {
            return;
        }
        let mut tracker: Option<&MemTracker> = Some(self);
        while let Some(current) = tracker {
            let new_value = current.current.fetch_add(bytes, Ordering::AcqRel) + bytes;
            current.allocated.fetch_add(bytes, Ordering::AcqRel);
            current.update_peak(new_value);
            tracker = current.parent.as_deref();
        }
    }

    /// Charge `bytes` unless some tracker on the path to the root would exceed its limit.
    ///
    /// Returns the label of the first tracker over its limit; nothing is charged in that case.
    pub fn try_consume(&self, bytes: i64) -> Result<(), String> {
        if bytes <= 0 {
            return Ok(());
        }
        let mut tracker: Option<&MemTracker> = Some(self);
        while let Some(current) = tracker {
            if current.limit >= 0 && current.current().saturating_add(bytes) > current.limit {
                return Err(format!(
                    "memory limit exceeded: tracker={} limit={} current={} request={}",
                    current.label,
                    current.limit,
                    current.current(),
                    bytes
                ));
            }
            tracker = current.parent.as_deref();
        }
        self.consume(bytes);
        Ok(())
    }

    /// Decrease consumption for this tracker and all ancestors.
    pub fn release(&self, bytes: i64) {
        if bytes <= 0 {
            return;
        }
        let mut tracker: Option<&MemTracker> = Some(self);
        while let Some(current) = tracker {
            current.current.fetch_sub(bytes, Ordering::AcqRel);
            current.deallocated.fetch_add(bytes, Ordering::AcqRel);
            tracker = current.parent.as_deref();
        }
    }

    fn update_peak(&self, value: i64) {
        let mut prev = self.peak.load(Ordering::Relaxed);
        while value > prev {
            match self
                .peak
                .compare_exchange(prev, value, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(actual) => prev = actual,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::MemTracker;

    #[test]
    fn child_consumption_propagates_to_root() {
        let root = MemTracker::new_root("query");
        let child = MemTracker::new_child("scan", &root);
        child.consume(100);
        assert_eq!(root.current(), 100);
        child.release(40);
        assert_eq!(root.current(), 60);
        assert_eq!(root.peak(), 100);
        assert_eq!(root.children().len(), 1);
    }

    #[test]
    fn try_consume_respects_ancestor_limit() {
        let root = MemTracker::new_root_with_limit("query", 128);
        let child = MemTracker::new_child("scan", &root);
        child.try_consume(100).expect("within limit");
        let err = child.try_consume(64).expect_err("over limit");
        assert!(err.contains("tracker=query"), "err={}", err);
        assert_eq!(root.current(), 100);
    }
}
