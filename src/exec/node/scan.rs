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
use std::fmt;
use std::sync::Arc;

use crate::common::ids::SlotId;
use crate::exec::predicate::Conjunct;
use crate::exec::predicate::classifier::{ConjunctClassifier, DefaultConjunctClassifier};

/// Materialized output slot of a scan, bound to a tablet column by name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SlotDescriptor {
    pub id: SlotId,
    pub col_name: String,
}

impl SlotDescriptor {
    pub fn new(id: SlotId, col_name: impl Into<String>) -> Self {
        Self {
            id,
            col_name: col_name.into(),
        }
    }
}

/// Plan-side description of an OLAP table scan, shared by every chunk source of the node.
#[derive(Clone)]
pub struct OlapScanNode {
    pub node_id: i32,
    pub slots: Vec<SlotDescriptor>,
    pub conjuncts: Vec<Conjunct>,
    /// Maximum number of rows the node delivers; `None` is unbounded.
    pub limit: Option<usize>,
    /// Read without merging rows by key (pre-aggregation off).
    pub skip_aggregation: bool,
    /// Columns read for filtering but not needed by the parent operator.
    pub unused_output_column_names: Vec<String>,
    pub classifier: Arc<dyn ConjunctClassifier>,
}

impl OlapScanNode {
    pub fn new(node_id: i32, slots: Vec<SlotDescriptor>) -> Self {
        Self {
            node_id,
            slots,
            conjuncts: Vec::new(),
            limit: None,
            skip_aggregation: false,
            unused_output_column_names: Vec::new(),
            classifier: Arc::new(DefaultConjunctClassifier),
        }
    }

    pub fn with_conjuncts(mut self, conjuncts: Vec<Conjunct>) -> Self {
        self.conjuncts = conjuncts;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_skip_aggregation(mut self, skip: bool) -> Self {
        self.skip_aggregation = skip;
        self
    }

    pub fn with_unused_output_columns(mut self, names: Vec<String>) -> Self {
        self.unused_output_column_names = names;
        self
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn ConjunctClassifier>) -> Self {
        self.classifier = classifier;
        self
    }
}

impl fmt::Debug for OlapScanNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OlapScanNode")
            .field("node_id", &self.node_id)
            .field("slots", &self.slots)
            .field("conjuncts", &self.conjuncts.len())
            .field("limit", &self.limit)
            .field("skip_aggregation", &self.skip_aggregation)
            .field("unused_output_column_names", &self.unused_output_column_names)
            .finish()
    }
}
