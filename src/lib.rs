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
//! Vectorized OLAP table-scan core.
//!
//! A scan classifies its conjuncts into storage predicates and key ranges, opens one chunk
//! source per tablet morsel and feeds a bounded chunk buffer from a time-budgeted read loop.

pub mod common;
pub mod exec;
pub mod runtime;
pub mod storage;

// BE-like folder layout, with `olapscan_*` convenience aliases.
pub use common::app_config as olapscan_config;
pub use common::logging as olapscan_logging;

pub use common::error::{ScanError, ScanResult};
pub use common::types::UniqueId;
pub use exec::pipeline::scan::{PipelineScanOperator, ScanIoMode};
