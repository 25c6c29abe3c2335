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
//! Pipeline OLAP scan.
//!
//! Responsibilities:
//! - Turns tablet morsels into chunk sources and drives them under a cooperative time budget.
//! - Buffers produced chunks for the pipeline poll loop.
//!
//! Key exported interfaces:
//! - Types: `PipelineScanOperator`, `ChunkSource`, `ChunkBuffer`, `OlapMorsel`, `MorselQueue`.

pub mod chunk_buffer;
pub mod chunk_source;
pub mod morsel;
pub mod scan_operator;

pub use chunk_buffer::ChunkBuffer;
pub use chunk_source::{ChunkSource, ChunkSourceState, FillStatus, YieldBudget};
pub use morsel::{DynamicMorselQueue, FixedMorselQueue, MorselQueue, MorselQueueRef, OlapMorsel};
pub use scan_operator::{PipelineScanOperator, ScanIoMode};
