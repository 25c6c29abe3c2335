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
//! Conjunct classification for tablet scans.
//!
//! Splits the scan's conjuncts into predicates the storage reader can apply, predicates that
//! must run after the reader, opaque residual expressions and the key ranges derived from the
//! sort-key columns.

use std::cmp::Ordering;

use crate::common::config::ScanOptions;
use crate::common::error::{ScanError, ScanResult};
use crate::common::ids::ColumnId;
use crate::exec::node::scan::SlotDescriptor;
use crate::exec::predicate::key_range::{KeyRange, OlapTuple};
use crate::exec::predicate::{ColumnPredicate, Conjunct, PredicateOp, ScalarValue};
use crate::storage::{KeysType, TabletSchema};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClassifyOptions {
    pub max_scan_key_num: usize,
    pub max_pushdown_conditions_per_column: usize,
    pub skip_aggregation: bool,
}

impl ClassifyOptions {
    pub fn from_scan_options(options: &ScanOptions, skip_aggregation: bool) -> Self {
        Self {
            max_scan_key_num: options.max_scan_key_num.max(1),
            max_pushdown_conditions_per_column: options.max_pushdown_conditions_per_column,
            skip_aggregation,
        }
    }
}

impl Default for ClassifyOptions {
    fn default() -> Self {
        Self::from_scan_options(&ScanOptions::default(), false)
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ClassifiedConjuncts {
    /// Applied by the storage reader.
    pub pushable: Vec<ColumnPredicate>,
    /// Column predicates evaluated by the chunk source after the reader.
    pub residual_predicates: Vec<ColumnPredicate>,
    /// Arbitrary conjuncts evaluated over bound slots after the residual predicates.
    pub residual_exprs: Vec<Conjunct>,
    pub key_ranges: Vec<KeyRange>,
    /// Some conjunct can never hold; the scan produces no rows.
    pub always_false: bool,
}

pub trait ConjunctClassifier: Send + Sync {
    fn classify(
        &self,
        conjuncts: &[Conjunct],
        slots: &[SlotDescriptor],
        schema: &TabletSchema,
        options: &ClassifyOptions,
    ) -> ScanResult<ClassifiedConjuncts>;
}

/// Classifier used when the plan does not supply one.
///
/// Single-column predicates are pushed down when the tablet does not merge rows on read or
/// the column is a key column. Key ranges are built over the sort key: leading columns
/// constrained to point sets are expanded into prefixes while the product stays within
/// `max_scan_key_num`, and the first range-constrained column closes the tuple.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultConjunctClassifier;

impl ConjunctClassifier for DefaultConjunctClassifier {
    fn classify(
        &self,
        conjuncts: &[Conjunct],
        slots: &[SlotDescriptor],
        schema: &TabletSchema,
        options: &ClassifyOptions,
    ) -> ScanResult<ClassifiedConjuncts> {
        let mut out = ClassifiedConjuncts::default();
        for conjunct in conjuncts {
            if let Some(value) = conjunct.constant_value() {
                if value != Some(true) {
                    out.always_false = true;
                }
                continue;
            }
            for slot in conjunct.slot_ids() {
                if !slots.iter().any(|s| s.id == slot) {
                    return Err(ScanError::invalid_argument(format!(
                        "conjunct references unknown slot {}",
                        slot
                    )));
                }
            }
            let Conjunct::Predicate { slot, op, values } = conjunct else {
                out.residual_exprs.push(conjunct.clone());
                continue;
            };
            op.validate_values(values)
                .map_err(ScanError::invalid_argument)?;
            let column = resolve_column(*slot, slots, schema)?;
            if values.len() > options.max_pushdown_conditions_per_column {
                out.residual_exprs.push(conjunct.clone());
                continue;
            }
            let predicate = ColumnPredicate::new(column, *op, values.clone());
            if can_pushdown(schema, column, options.skip_aggregation) {
                out.pushable.push(predicate);
            } else {
                out.residual_predicates.push(predicate);
            }
        }
        if !out.always_false {
            match build_key_ranges(&out.pushable, schema, options) {
                Some(ranges) => out.key_ranges = ranges,
                None => out.always_false = true,
            }
        }
        Ok(out)
    }
}

fn resolve_column(
    slot: crate::common::ids::SlotId,
    slots: &[SlotDescriptor],
    schema: &TabletSchema,
) -> ScanResult<ColumnId> {
    let desc = slots
        .iter()
        .find(|s| s.id == slot)
        .ok_or_else(|| ScanError::invalid_argument(format!("unknown slot {}", slot)))?;
    schema
        .field_index(&desc.col_name)
        .ok_or_else(|| ScanError::internal(format!("invalid field name: {}", desc.col_name)))
}

fn can_pushdown(schema: &TabletSchema, column: ColumnId, skip_aggregation: bool) -> bool {
    skip_aggregation
        || schema.is_key(column)
        || matches!(schema.keys_type(), KeysType::Duplicate | KeysType::Primary)
}

#[derive(Default)]
struct ColumnValueRange {
    lower: Option<(ScalarValue, bool)>,
    upper: Option<(ScalarValue, bool)>,
    points: Option<Vec<ScalarValue>>,
    empty: bool,
}

impl ColumnValueRange {
    fn add(&mut self, op: PredicateOp, values: &[ScalarValue]) {
        match op {
            PredicateOp::Eq | PredicateOp::In => {
                let points = values
                    .iter()
                    .filter(|v| !v.is_null())
                    .cloned()
                    .collect::<Vec<_>>();
                self.intersect_points(points);
            }
            PredicateOp::Ge | PredicateOp::Gt => match values.first() {
                Some(v) if !v.is_null() => self.tighten_lower(v.clone(), op == PredicateOp::Ge),
                _ => self.empty = true,
            },
            PredicateOp::Le | PredicateOp::Lt => match values.first() {
                Some(v) if !v.is_null() => self.tighten_upper(v.clone(), op == PredicateOp::Le),
                _ => self.empty = true,
            },
            PredicateOp::Ne | PredicateOp::NotIn | PredicateOp::IsNull | PredicateOp::IsNotNull => {}
        }
    }

    fn intersect_points(&mut self, mut points: Vec<ScalarValue>) {
        sort_dedup(&mut points);
        let merged = match self.points.take() {
            Some(existing) => existing
                .into_iter()
                .filter(|p| points.iter().any(|q| p.compare(q) == Some(Ordering::Equal)))
                .collect(),
            None => points,
        };
        self.points = Some(merged);
    }

    fn tighten_lower(&mut self, value: ScalarValue, include: bool) {
        let replace = match &mut self.lower {
            None => true,
            Some((current, current_include)) => match value.compare(current) {
                Some(Ordering::Greater) => true,
                Some(Ordering::Equal) => {
                    *current_include = *current_include && include;
                    false
                }
                _ => false,
            },
        };
        if replace {
            self.lower = Some((value, include));
        }
    }

    fn tighten_upper(&mut self, value: ScalarValue, include: bool) {
        let replace = match &mut self.upper {
            None => true,
            Some((current, current_include)) => match value.compare(current) {
                Some(Ordering::Less) => true,
                Some(Ordering::Equal) => {
                    *current_include = *current_include && include;
                    false
                }
                _ => false,
            },
        };
        if replace {
            self.upper = Some((value, include));
        }
    }

    fn within_bounds(&self, value: &ScalarValue) -> bool {
        let above = match &self.lower {
            None => true,
            Some((lo, incl)) => match value.compare(lo) {
                Some(Ordering::Greater) => true,
                Some(Ordering::Equal) => *incl,
                _ => false,
            },
        };
        let below = match &self.upper {
            None => true,
            Some((hi, incl)) => match value.compare(hi) {
                Some(Ordering::Less) => true,
                Some(Ordering::Equal) => *incl,
                _ => false,
            },
        };
        above && below
    }

    /// Point set after applying the bounds, if the column is point-constrained.
    fn points(&self) -> Option<Vec<ScalarValue>> {
        self.points.as_ref().map(|points| {
            points
                .iter()
                .filter(|p| self.within_bounds(p))
                .cloned()
                .collect()
        })
    }

    fn is_empty(&self) -> bool {
        if self.empty {
            return true;
        }
        if let Some(points) = self.points() {
            return points.is_empty();
        }
        match (&self.lower, &self.upper) {
            (Some((lo, lo_incl)), Some((hi, hi_incl))) => match lo.compare(hi) {
                Some(Ordering::Greater) => true,
                Some(Ordering::Equal) => !(*lo_incl && *hi_incl),
                _ => false,
            },
            _ => false,
        }
    }

    fn is_unconstrained(&self) -> bool {
        self.points.is_none() && self.lower.is_none() && self.upper.is_none()
    }
}

fn sort_dedup(values: &mut Vec<ScalarValue>) {
    values.sort_by(|a, b| a.compare(b).unwrap_or(Ordering::Equal));
    values.dedup_by(|a, b| a.compare(b) == Some(Ordering::Equal));
}

/// Key ranges implied by the pushable predicates; `None` when they select nothing.
fn build_key_ranges(
    pushable: &[ColumnPredicate],
    schema: &TabletSchema,
    options: &ClassifyOptions,
) -> Option<Vec<KeyRange>> {
    let mut prefixes: Vec<Vec<ScalarValue>> = vec![Vec::new()];
    let mut lower: Option<(ScalarValue, bool)> = None;
    let mut upper: Option<(ScalarValue, bool)> = None;

    for key in schema.key_column_ids() {
        let mut range = ColumnValueRange::default();
        for predicate in pushable.iter().filter(|p| p.column == key) {
            range.add(predicate.op, &predicate.values);
        }
        if range.is_empty() {
            return None;
        }
        if range.is_unconstrained() {
            break;
        }
        if let Some(points) = range.points() {
            let total = prefixes.len().saturating_mul(points.len());
            if total <= options.max_scan_key_num {
                prefixes = prefixes
                    .iter()
                    .flat_map(|prefix| {
                        points.iter().map(move |p| {
                            let mut tuple = prefix.clone();
                            tuple.push(p.clone());
                            tuple
                        })
                    })
                    .collect();
                continue;
            }
            // Too many keys: scan the hull of the point set instead.
            lower = points.first().map(|p| (p.clone(), true));
            upper = points.last().map(|p| (p.clone(), true));
            break;
        }
        lower = range.lower;
        upper = range.upper;
        break;
    }

    let unbounded_prefix = prefixes.len() == 1 && prefixes[0].is_empty();
    if unbounded_prefix && lower.is_none() && upper.is_none() {
        return Some(vec![KeyRange::full()]);
    }

    let ranges = prefixes
        .into_iter()
        .map(|prefix| {
            let (begin, begin_include) = match &lower {
                Some((v, incl)) => (extend(&prefix, v), *incl),
                None if prefix.is_empty() => (OlapTuple::NegativeInfinity, true),
                None => (OlapTuple::Values(prefix.clone()), true),
            };
            let (end, end_include) = match &upper {
                Some((v, incl)) => (extend(&prefix, v), *incl),
                None if prefix.is_empty() => (OlapTuple::PositiveInfinity, true),
                None => (OlapTuple::Values(prefix.clone()), true),
            };
            KeyRange::new(begin, begin_include, end, end_include)
        })
        .collect();
    Some(ranges)
}

fn extend(prefix: &[ScalarValue], value: &ScalarValue) -> OlapTuple {
    let mut tuple = prefix.to_vec();
    tuple.push(value.clone());
    OlapTuple::Values(tuple)
}
