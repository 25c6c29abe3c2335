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
//! Operator traits driven by the pipeline.
//!
//! Responsibilities:
//! - Defines the lifecycle shared by every operator and the pull contract of source operators.
//! - Lets drivers record why a source cannot make progress and yield.
//!
//! Key exported interfaces:
//! - Types: `BlockedReason`, `Operator`, `SourceOperator`.

use crate::common::error::ScanResult;
use crate::exec::chunk::Chunk;
use crate::runtime::profile::OperatorProfiles;
use crate::runtime::runtime_state::RuntimeState;

/// The execution engine uses cooperative scheduling.
///
/// A driver repeatedly polls its source. When the source cannot make progress without blocking,
/// the driver records a [`BlockedReason`] and yields its thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockedReason {
    /// Nothing buffered yet; a read is in flight or about to be scheduled.
    InputEmpty,
    /// The scan pool refused a task; retry on the next poll.
    IoQueueFull,
}

pub trait Operator: Send {
    fn name(&self) -> &str;

    fn set_profiles(&mut self, profiles: OperatorProfiles) {
        let _ = profiles;
    }

    /// Called once before the first poll.
    fn prepare(&mut self, state: &RuntimeState) -> ScanResult<()>;

    /// Release resources. Safe to call more than once.
    fn close(&mut self, state: &RuntimeState) -> ScanResult<()>;

    fn cancel(&mut self) {}

    fn is_finished(&self) -> bool;

    fn as_source_mut(&mut self) -> Option<&mut dyn SourceOperator> {
        None
    }
}

/// Operators at the head of a pipeline.
pub trait SourceOperator: Operator {
    fn has_output(&self) -> bool;

    /// Next chunk, `None` when nothing is buffered right now.
    fn pull_chunk(&mut self, state: &RuntimeState) -> ScanResult<Option<Chunk>>;

    /// Stop producing; buffered chunks may still be pulled.
    fn set_finishing(&mut self, state: &RuntimeState) -> ScanResult<()>;

    fn blocked_reason(&self) -> Option<BlockedReason> {
        None
    }
}
