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
//! Workgroup bookkeeping for scan workers.
//!
//! Responsibilities:
//! - Records which workgroups own each scan worker thread.
//! - Answers the preemption question asked by time-budgeted scan loops.
//! - Accumulates scan CPU time per workgroup.
//!
//! Key exported interfaces:
//! - Types: `WorkGroupId`, `WorkGroupManager`, `NeverClaimed`.
//! - Traits: `WorkerOwnership`.

use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;

use crate::olapscan_logging::debug;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkGroupId(pub i64);

impl WorkGroupId {
    pub const DEFAULT: WorkGroupId = WorkGroupId(0);
}

impl fmt::Display for WorkGroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Scheduler view consulted by the time-budgeted scan loop.
pub trait WorkerOwnership: Send + Sync {
    /// True when a workgroup other than `current` owns `worker_id` and may want it back.
    fn worker_claimed_by_other(&self, worker_id: usize, current: WorkGroupId) -> bool;

    /// Charge scan CPU time spent on behalf of `wg`.
    fn account_cpu_time(&self, wg: WorkGroupId, ns: i64) {
        let _ = (wg, ns);
    }
}

/// Ownership view for pools without workgroups; nothing ever preempts.
#[derive(Clone, Copy, Debug, Default)]
pub struct NeverClaimed;

impl WorkerOwnership for NeverClaimed {
    fn worker_claimed_by_other(&self, _worker_id: usize, _current: WorkGroupId) -> bool {
        false
    }
}

#[derive(Default)]
pub struct WorkGroupManager {
    scan_worker_owners: RwLock<HashMap<usize, Vec<WorkGroupId>>>,
    cpu_runtime_ns: RwLock<HashMap<WorkGroupId, i64>>,
}

impl WorkGroupManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `wg` to the owners of scan worker `worker_id`.
    pub fn assign_scan_worker(&self, worker_id: usize, wg: WorkGroupId) {
        let mut owners = self
            .scan_worker_owners
            .write()
            .unwrap_or_else(|e| e.into_inner());
        let entry = owners.entry(worker_id).or_default();
        if !entry.contains(&wg) {
            entry.push(wg);
            debug!("scan worker {} assigned to workgroup {}", worker_id, wg);
        }
    }

    pub fn release_scan_worker(&self, worker_id: usize, wg: WorkGroupId) {
        let mut owners = self
            .scan_worker_owners
            .write()
            .unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = owners.get_mut(&worker_id) {
            entry.retain(|owner| *owner != wg);
            if entry.is_empty() {
                owners.remove(&worker_id);
            }
        }
    }

    pub fn owners_of_scan_worker(&self, worker_id: usize) -> Vec<WorkGroupId> {
        self.scan_worker_owners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&worker_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn add_cpu_runtime_ns(&self, wg: WorkGroupId, ns: i64) {
        if ns <= 0 {
            return;
        }
        let mut guard = self.cpu_runtime_ns.write().unwrap_or_else(|e| e.into_inner());
        *guard.entry(wg).or_insert(0) += ns;
    }

    pub fn cpu_runtime_ns(&self, wg: WorkGroupId) -> i64 {
        self.cpu_runtime_ns
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&wg)
            .copied()
            .unwrap_or(0)
    }
}

impl WorkerOwnership for WorkGroupManager {
    fn worker_claimed_by_other(&self, worker_id: usize, current: WorkGroupId) -> bool {
        self.scan_worker_owners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&worker_id)
            .is_some_and(|owners| owners.iter().any(|owner| *owner != current))
    }

    fn account_cpu_time(&self, wg: WorkGroupId, ns: i64) {
        self.add_cpu_runtime_ns(wg, ns);
    }
}
