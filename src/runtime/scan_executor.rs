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
//! Scan IO thread pool.
//!
//! Workers are numbered `0..num_threads`; every task receives the id of the worker running it
//! so time-budgeted reads can ask the workgroup manager who else owns that worker.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::thread;

use crate::common::config::{scan_thread_pool_queue_size, scan_thread_pool_thread_num};
use crate::olapscan_logging::{debug, warn};

type ScanTask = Box<dyn FnOnce(usize) + Send + 'static>;

pub struct ScanExecutor {
    inner: Arc<ScanExecutorInner>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
    num_workers: usize,
}

impl ScanExecutor {
    pub fn new(num_threads: usize, queue_capacity: usize) -> Self {
        let inner = Arc::new(ScanExecutorInner::new(queue_capacity));
        let threads = num_threads.max(1);
        let mut workers = Vec::with_capacity(threads);
        for worker_id in 0..threads {
            let inner_clone = Arc::clone(&inner);
            let spawned = thread::Builder::new()
                .name(format!("scan_io_{worker_id}"))
                .spawn(move || worker_loop(inner_clone, worker_id));
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => warn!("failed to spawn scan worker {}: {}", worker_id, e),
            }
        }
        let num_workers = workers.len();
        debug!(
            "scan executor started: workers={} queue_capacity={}",
            num_workers, inner.capacity
        );
        Self {
            inner,
            workers: Mutex::new(workers),
            num_workers,
        }
    }

    /// Queue `task`; false when the queue is full or the executor is shut down.
    pub fn submit<F>(&self, task: F) -> bool
    where
        F: FnOnce(usize) + Send + 'static,
    {
        self.inner.submit(Box::new(task))
    }

    pub fn num_tasks(&self) -> usize {
        self.inner.num_tasks()
    }

    pub fn num_workers(&self) -> usize {
        self.num_workers
    }

    /// Stop accepting tasks, drop queued ones and join the workers.
    pub fn shutdown(&self) {
        self.inner.shutdown();
        let handles = {
            let mut guard = self.workers.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *guard)
        };
        for handle in handles {
            if handle.join().is_err() {
                warn!("scan worker panicked before shutdown");
            }
        }
    }
}

impl Drop for ScanExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct ScanExecutorInner {
    queue: Mutex<VecDeque<ScanTask>>,
    cv: Condvar,
    capacity: usize,
    shutdown: AtomicBool,
}

impl ScanExecutorInner {
    fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            cv: Condvar::new(),
            capacity: capacity.max(1),
            shutdown: AtomicBool::new(false),
        }
    }

    fn submit(&self, task: ScanTask) -> bool {
        if self.shutdown.load(Ordering::Acquire) {
            return false;
        }
        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        if queue.len() >= self.capacity {
            return false;
        }
        queue.push_back(task);
        self.cv.notify_one();
        true
    }

    fn num_tasks(&self) -> usize {
        self.queue.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn shutdown(&self) {
        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        self.shutdown.store(true, Ordering::Release);
        queue.clear();
        self.cv.notify_all();
    }

    fn take(&self) -> Option<ScanTask> {
        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        while queue.is_empty() && !self.shutdown.load(Ordering::Acquire) {
            queue = self.cv.wait(queue).unwrap_or_else(|e| e.into_inner());
        }
        if self.shutdown.load(Ordering::Acquire) {
            return None;
        }
        queue.pop_front()
    }
}

fn worker_loop(inner: Arc<ScanExecutorInner>, worker_id: usize) {
    while let Some(task) = inner.take() {
        task(worker_id);
    }
}

static SCAN_EXECUTOR: OnceLock<Arc<ScanExecutor>> = OnceLock::new();

/// Process-wide scan pool sized from the `[scan]` thread and queue settings.
pub fn scan_executor() -> Arc<ScanExecutor> {
    Arc::clone(SCAN_EXECUTOR.get_or_init(|| {
        let threads = scan_thread_pool_thread_num();
        let queue_capacity = scan_thread_pool_queue_size();
        Arc::new(ScanExecutor::new(threads, queue_capacity))
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    impl ScanExecutor {
        // Test-only constructor: no worker threads, controlled by test code.
        fn new_for_test(queue_capacity: usize) -> Self {
            let inner = Arc::new(ScanExecutorInner::new(queue_capacity));
            Self {
                inner,
                workers: Mutex::new(Vec::new()),
                num_workers: 1,
            }
        }

        fn pop_one_for_test(&self, worker_id: usize) -> bool {
            let task = {
                let mut queue = self.inner.queue.lock().expect("scan executor queue lock");
                queue.pop_front()
            };
            match task {
                Some(task) => {
                    task(worker_id);
                    true
                }
                None => false,
            }
        }
    }

    #[test]
    fn scan_executor_submit_respects_capacity() {
        let exec = ScanExecutor::new_for_test(1);
        assert!(exec.submit(|_| {}));
        assert!(!exec.submit(|_| {}));
        assert_eq!(exec.num_tasks(), 1);
        assert!(exec.pop_one_for_test(0));
        assert!(exec.submit(|_| {}));
    }

    #[test]
    fn tasks_receive_worker_id() {
        let exec = ScanExecutor::new_for_test(4);
        let (tx, rx) = mpsc::channel::<usize>();
        assert!(exec.submit(move |worker_id| {
            let _ = tx.send(worker_id);
        }));
        assert!(exec.pop_one_for_test(3));
        assert_eq!(rx.recv_timeout(Duration::from_millis(200)).ok(), Some(3));
    }

    #[test]
    fn worker_threads_run_tasks_and_shutdown_rejects_new_ones() {
        let exec = ScanExecutor::new(2, 16);
        assert_eq!(exec.num_workers(), 2);
        let (tx, rx) = mpsc::channel::<usize>();
        for _ in 0..4 {
            let tx = tx.clone();
            assert!(exec.submit(move |worker_id| {
                let _ = tx.send(worker_id);
            }));
        }
        for _ in 0..4 {
            let worker_id = rx
                .recv_timeout(Duration::from_secs(5))
                .expect("task executed");
            assert!(worker_id < 2);
        }
        exec.shutdown();
        assert!(!exec.submit(|_| {}));
    }

    #[test]
    fn shared_pool_is_created_once() {
        let pool = scan_executor();
        assert!(Arc::ptr_eq(&pool, &scan_executor()));
        assert!(pool.num_workers() >= 1);
    }
}
