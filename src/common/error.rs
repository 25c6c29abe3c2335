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
//! Scan error taxonomy.
//!
//! End of stream is not an error. Readers and chunk sources report it through
//! `ChunkPoll::EndOfStream` and `FillStatus::EndOfStream`.

use thiserror::Error;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ScanError {
    /// Cooperative cancellation flag observed before a physical read.
    #[error("Cancelled: {0}")]
    Cancelled(String),
    /// Malformed predicate or path input detected while classifying conjuncts.
    #[error("InvalidArgument: {0}")]
    InvalidArgument(String),
    /// Missing tablet, missing column or inconsistent schema.
    #[error("InternalError: {0}")]
    InternalError(String),
    /// Allocation could not be charged while evaluating residual filters.
    #[error("ResourceExhausted: {0}")]
    ResourceExhausted(String),
}

pub type ScanResult<T> = Result<T, ScanError>;

impl ScanError {
    pub fn cancelled(msg: impl Into<String>) -> Self {
        ScanError::Cancelled(msg.into())
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        ScanError::InvalidArgument(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        ScanError::InternalError(msg.into())
    }

    pub fn resource_exhausted(msg: impl Into<String>) -> Self {
        ScanError::ResourceExhausted(msg.into())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ScanError::Cancelled(_))
    }

    pub fn message(&self) -> &str {
        match self {
            ScanError::Cancelled(msg)
            | ScanError::InvalidArgument(msg)
            | ScanError::InternalError(msg)
            | ScanError::ResourceExhausted(msg) => msg,
        }
    }
}

// `ArrowError` is neither `Clone` nor `PartialEq`, so it is flattened into the message.
impl From<arrow::error::ArrowError> for ScanError {
    fn from(err: arrow::error::ArrowError) -> Self {
        ScanError::InternalError(format!("arrow error: {err}"))
    }
}
