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
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CounterUnit {
    Unit,
    Bytes,
    TimeNs,
}

#[derive(Clone, Debug)]
pub struct RuntimeProfile {
    inner: Arc<RuntimeProfileInner>,
}

#[derive(Debug)]
struct RuntimeProfileInner {
    name: RwLock<String>,
    counters: Mutex<HashMap<String, CounterRef>>,
    info_strings: Mutex<BTreeMap<String, String>>,
    children: Mutex<Vec<RuntimeProfile>>,
    child_map: Mutex<HashMap<String, RuntimeProfile>>,
}

impl RuntimeProfile {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(RuntimeProfileInner {
                name: RwLock::new(name.into()),
                counters: Mutex::new(HashMap::new()),
                info_strings: Mutex::new(BTreeMap::new()),
                children: Mutex::new(Vec::new()),
                child_map: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn name(&self) -> String {
        self.inner
            .name
            .read()
            .map(|s| s.clone())
            .unwrap_or_else(|e| e.into_inner().clone())
    }

    pub fn get_child(&self, name: &str) -> Option<RuntimeProfile> {
        self.inner
            .child_map
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    pub fn children(&self) -> Vec<RuntimeProfile> {
        self.inner
            .children
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Get or create the named child profile.
    pub fn child(&self, name: impl Into<String>) -> RuntimeProfile {
        let name = name.into();
        let mut map = self
            .inner
            .child_map
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = map.get(&name) {
            return existing.clone();
        }
        let child = RuntimeProfile::new(name.clone());
        map.insert(name, child.clone());
        drop(map);
        self.inner
            .children
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(child.clone());
        child
    }

    pub fn add_info_string(&self, key: impl Into<String>, value: impl Into<String>) {
        let mut guard = self
            .inner
            .info_strings
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        guard.insert(key.into(), value.into());
    }

    pub fn get_info_string(&self, key: &str) -> Option<String> {
        self.inner
            .info_strings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    pub fn add_counter(&self, name: impl Into<String>, unit: CounterUnit) -> CounterRef {
        self.add_child_counter(name, unit, None)
    }

    /// Counter displayed under `parent` (e.g. `BlockSeek` under `SegmentRead`).
    pub fn add_child_counter(
        &self,
        name: impl Into<String>,
        unit: CounterUnit,
        parent: Option<&str>,
    ) -> CounterRef {
        let name = name.into();
        let mut guard = self
            .inner
            .counters
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if let Some(counter) = guard.get(&name) {
            return Arc::clone(counter);
        }
        let counter = Arc::new(Counter::new(
            name.clone(),
            unit,
            parent.map(|p| p.to_string()),
        ));
        guard.insert(name, Arc::clone(&counter));
        counter
    }

    pub fn add_timer(&self, name: impl Into<String>) -> CounterRef {
        self.add_counter(name, CounterUnit::TimeNs)
    }

    pub fn add_child_timer(&self, name: impl Into<String>, parent: &str) -> CounterRef {
        self.add_child_counter(name, CounterUnit::TimeNs, Some(parent))
    }

    pub fn counter_add(&self, name: &str, unit: CounterUnit, delta: i64) {
        self.add_counter(name.to_string(), unit).add(delta);
    }

    pub fn counter_set(&self, name: &str, unit: CounterUnit, value: i64) {
        self.add_counter(name.to_string(), unit).set(value);
    }

    pub fn get_counter(&self, name: &str) -> Option<CounterRef> {
        self.inner
            .counters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    pub fn counter_value(&self, name: &str) -> Option<i64> {
        self.get_counter(name).map(|c| c.value())
    }

    pub fn scoped_timer(&self, name: impl Into<String>) -> ScopedTimer {
        ScopedTimer::new(self.add_timer(name))
    }
}

pub type CounterRef = Arc<Counter>;

#[derive(Debug)]
pub struct Counter {
    name: String,
    unit: CounterUnit,
    parent: Option<String>,
    value: AtomicI64,
}

impl Counter {
    pub fn new(name: impl Into<String>, unit: CounterUnit, parent: Option<String>) -> Self {
        Self {
            name: name.into(),
            unit,
            parent,
            value: AtomicI64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn unit(&self) -> CounterUnit {
        self.unit
    }

    pub fn parent(&self) -> Option<&str> {
        self.parent.as_deref()
    }

    pub fn add(&self, delta: i64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn set(&self, value: i64) {
        self.value.store(value, Ordering::Relaxed);
    }

    pub fn value(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Adds the elapsed wall time to its counter on drop.
pub struct ScopedTimer {
    counter: CounterRef,
    start: Instant,
}

impl ScopedTimer {
    pub fn new(counter: CounterRef) -> Self {
        Self {
            counter,
            start: Instant::now(),
        }
    }
}

impl Drop for ScopedTimer {
    fn drop(&mut self) {
        self.counter
            .add(clamp_u128_to_i64(self.start.elapsed().as_nanos()));
    }
}

#[derive(Clone, Debug)]
pub struct OperatorProfiles {
    pub operator: RuntimeProfile,
    pub common: RuntimeProfile,
    pub unique: RuntimeProfile,
}

impl OperatorProfiles {
    pub fn new(operator: RuntimeProfile) -> Self {
        let common = operator.child("CommonMetrics");
        let unique = operator.child("UniqueMetrics");
        Self {
            operator,
            common,
            unique,
        }
    }
}

pub fn clamp_u128_to_i64(value: u128) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}
