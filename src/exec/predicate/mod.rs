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
//! Scan predicates.
//!
//! Responsibilities:
//! - Defines literal values, per-column predicates and query conjuncts consumed by the scan.
//! - Evaluates predicates over Arrow arrays into three-valued selection masks.
//!
//! Key exported interfaces:
//! - Types: `ScalarValue`, `PredicateOp`, `ColumnPredicate`, `Conjunct`.
//! - Functions: `evaluate_op`, `scalar_at`.
//!
//! Current limitations:
//! - Supported column types are Boolean, signed integers, Float32/64, Date32, Utf8/LargeUtf8
//!   and `Dictionary(Int32, Utf8)`.

pub mod classifier;
pub mod key_range;

use std::cmp::Ordering;
use std::fmt;

use arrow::array::{
    Array, ArrayRef, BooleanArray, Date32Array, DictionaryArray, Float32Array, Float64Array,
    Int8Array, Int16Array, Int32Array, Int64Array, LargeStringArray, StringArray,
};
use arrow::compute::kernels::cmp::{eq, gt, gt_eq, lt, lt_eq, neq};
use arrow::compute::{and_kleene, cast, not, or_kleene};
use arrow::datatypes::{DataType, Int32Type};

use crate::common::ids::{ColumnId, SlotId};
use crate::exec::chunk::Chunk;

#[derive(Clone, Debug, PartialEq)]
pub enum ScalarValue {
    Null,
    Boolean(bool),
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    Utf8(String),
    Date32(i32),
}

impl ScalarValue {
    pub fn is_null(&self) -> bool {
        matches!(self, ScalarValue::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ScalarValue::Int8(v) => Some(i64::from(*v)),
            ScalarValue::Int16(v) => Some(i64::from(*v)),
            ScalarValue::Int32(v) => Some(i64::from(*v)),
            ScalarValue::Int64(v) => Some(*v),
            ScalarValue::Date32(v) => Some(i64::from(*v)),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ScalarValue::Float32(v) => Some(f64::from(*v)),
            ScalarValue::Float64(v) => Some(*v),
            other => other.as_i64().map(|v| v as f64),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ScalarValue::Utf8(v) => Some(v.as_str()),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ScalarValue::Boolean(v) => Some(*v),
            _ => None,
        }
    }

    /// Total order between comparable values. Integers, dates and floats compare numerically;
    /// `None` for null or incompatible operands.
    pub fn compare(&self, other: &ScalarValue) -> Option<Ordering> {
        match (self, other) {
            (ScalarValue::Null, _) | (_, ScalarValue::Null) => None,
            (ScalarValue::Boolean(a), ScalarValue::Boolean(b)) => Some(a.cmp(b)),
            (ScalarValue::Utf8(a), ScalarValue::Utf8(b)) => Some(a.cmp(b)),
            (a, b) => match (a.as_i64(), b.as_i64()) {
                (Some(x), Some(y)) => Some(x.cmp(&y)),
                _ => match (a.as_f64(), b.as_f64()) {
                    (Some(x), Some(y)) => x.partial_cmp(&y),
                    _ => None,
                },
            },
        }
    }
}

impl fmt::Display for ScalarValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScalarValue::Null => write!(f, "NULL"),
            ScalarValue::Boolean(v) => write!(f, "{v}"),
            ScalarValue::Int8(v) => write!(f, "{v}"),
            ScalarValue::Int16(v) => write!(f, "{v}"),
            ScalarValue::Int32(v) => write!(f, "{v}"),
            ScalarValue::Int64(v) => write!(f, "{v}"),
            ScalarValue::Float32(v) => write!(f, "{v}"),
            ScalarValue::Float64(v) => write!(f, "{v}"),
            ScalarValue::Utf8(v) => write!(f, "'{v}'"),
            ScalarValue::Date32(v) => write!(f, "date32({v})"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PredicateOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    NotIn,
    IsNull,
    IsNotNull,
}

impl PredicateOp {
    pub fn is_binary(self) -> bool {
        matches!(
            self,
            PredicateOp::Eq
                | PredicateOp::Ne
                | PredicateOp::Lt
                | PredicateOp::Le
                | PredicateOp::Gt
                | PredicateOp::Ge
        )
    }

    pub fn symbol(self) -> &'static str {
        match self {
            PredicateOp::Eq => "=",
            PredicateOp::Ne => "!=",
            PredicateOp::Lt => "<",
            PredicateOp::Le => "<=",
            PredicateOp::Gt => ">",
            PredicateOp::Ge => ">=",
            PredicateOp::In => "IN",
            PredicateOp::NotIn => "NOT IN",
            PredicateOp::IsNull => "IS NULL",
            PredicateOp::IsNotNull => "IS NOT NULL",
        }
    }

    /// Check the operand count for this operator.
    pub fn validate_values(self, values: &[ScalarValue]) -> Result<(), String> {
        let ok = match self {
            PredicateOp::IsNull | PredicateOp::IsNotNull => values.is_empty(),
            PredicateOp::In | PredicateOp::NotIn => !values.is_empty(),
            _ => values.len() == 1,
        };
        if ok {
            Ok(())
        } else {
            Err(format!(
                "predicate {} expects {} operand(s), got {}",
                self.symbol(),
                match self {
                    PredicateOp::IsNull | PredicateOp::IsNotNull => "0",
                    PredicateOp::In | PredicateOp::NotIn => "at least 1",
                    _ => "1",
                },
                values.len()
            ))
        }
    }
}

/// Predicate over a single tablet column.
#[derive(Clone, Debug, PartialEq)]
pub struct ColumnPredicate {
    pub column: ColumnId,
    pub op: PredicateOp,
    pub values: Vec<ScalarValue>,
}

impl ColumnPredicate {
    pub fn new(column: ColumnId, op: PredicateOp, values: Vec<ScalarValue>) -> Self {
        Self { column, op, values }
    }

    pub fn evaluate(&self, array: &dyn Array) -> Result<BooleanArray, String> {
        evaluate_op(array, self.op, &self.values)
    }

    /// Evaluate against the chunk column carrying this predicate's column id.
    pub fn evaluate_chunk(&self, chunk: &Chunk) -> Result<BooleanArray, String> {
        let column = chunk.column_by_column_id(self.column)?;
        self.evaluate(column.as_ref())
    }
}

impl fmt::Display for ColumnPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "column({}) {}", self.column, self.op.symbol())?;
        match self.op {
            PredicateOp::IsNull | PredicateOp::IsNotNull => Ok(()),
            PredicateOp::In | PredicateOp::NotIn => {
                let values = self
                    .values
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>();
                write!(f, " ({})", values.join(", "))
            }
            _ => match self.values.first() {
                Some(v) => write!(f, " {v}"),
                None => Ok(()),
            },
        }
    }
}

/// One conjunct of the scan's filter, expressed over query slots.
#[derive(Clone, Debug, PartialEq)]
pub enum Conjunct {
    /// Constant conjunct. `Some(false)` and `None` (NULL) reject every row.
    Literal(Option<bool>),
    Predicate {
        slot: SlotId,
        op: PredicateOp,
        values: Vec<ScalarValue>,
    },
    /// Compare two slot columns row by row.
    Compare {
        left: SlotId,
        op: PredicateOp,
        right: SlotId,
    },
    And(Box<Conjunct>, Box<Conjunct>),
    Or(Box<Conjunct>, Box<Conjunct>),
    Not(Box<Conjunct>),
}

impl Conjunct {
    pub fn predicate(slot: SlotId, op: PredicateOp, values: Vec<ScalarValue>) -> Self {
        Conjunct::Predicate { slot, op, values }
    }

    pub fn or(left: Conjunct, right: Conjunct) -> Self {
        Conjunct::Or(Box::new(left), Box::new(right))
    }

    pub fn and(left: Conjunct, right: Conjunct) -> Self {
        Conjunct::And(Box::new(left), Box::new(right))
    }

    pub fn negate(inner: Conjunct) -> Self {
        Conjunct::Not(Box::new(inner))
    }

    /// Constant value if the conjunct does not reference any slot.
    pub fn constant_value(&self) -> Option<Option<bool>> {
        match self {
            Conjunct::Literal(v) => Some(*v),
            Conjunct::Not(inner) => inner.constant_value().map(|v| v.map(|b| !b)),
            Conjunct::And(l, r) => match (l.constant_value()?, r.constant_value()?) {
                (Some(false), _) | (_, Some(false)) => Some(Some(false)),
                (Some(true), Some(true)) => Some(Some(true)),
                _ => Some(None),
            },
            Conjunct::Or(l, r) => match (l.constant_value()?, r.constant_value()?) {
                (Some(true), _) | (_, Some(true)) => Some(Some(true)),
                (Some(false), Some(false)) => Some(Some(false)),
                _ => Some(None),
            },
            Conjunct::Predicate { .. } | Conjunct::Compare { .. } => None,
        }
    }

    pub fn slot_ids(&self) -> Vec<SlotId> {
        let mut out = Vec::new();
        self.collect_slot_ids(&mut out);
        out
    }

    fn collect_slot_ids(&self, out: &mut Vec<SlotId>) {
        match self {
            Conjunct::Literal(_) => {}
            Conjunct::Predicate { slot, .. } => out.push(*slot),
            Conjunct::Compare { left, right, .. } => {
                out.push(*left);
                out.push(*right);
            }
            Conjunct::And(l, r) | Conjunct::Or(l, r) => {
                l.collect_slot_ids(out);
                r.collect_slot_ids(out);
            }
            Conjunct::Not(inner) => inner.collect_slot_ids(out),
        }
    }

    /// Evaluate into a selection mask; NULL entries reject the row.
    pub fn evaluate(&self, chunk: &Chunk) -> Result<BooleanArray, String> {
        match self {
            Conjunct::Literal(v) => Ok(BooleanArray::from(vec![*v; chunk.len()])),
            Conjunct::Predicate { slot, op, values } => {
                let column = chunk.column_by_slot_id(*slot)?;
                evaluate_op(column.as_ref(), *op, values)
            }
            Conjunct::Compare { left, op, right } => {
                let l = chunk.column_by_slot_id(*left)?;
                let r = chunk.column_by_slot_id(*right)?;
                compare_columns(l, *op, r)
            }
            Conjunct::And(l, r) => {
                and_kleene(&l.evaluate(chunk)?, &r.evaluate(chunk)?).map_err(|e| e.to_string())
            }
            Conjunct::Or(l, r) => {
                or_kleene(&l.evaluate(chunk)?, &r.evaluate(chunk)?).map_err(|e| e.to_string())
            }
            Conjunct::Not(inner) => not(&inner.evaluate(chunk)?).map_err(|e| e.to_string()),
        }
    }
}

fn decode_dictionary(array: ArrayRef) -> Result<ArrayRef, String> {
    match array.data_type() {
        DataType::Dictionary(_, value_type) => {
            let value_type = value_type.as_ref().clone();
            cast(&array, &value_type).map_err(|e| e.to_string())
        }
        _ => Ok(array),
    }
}

fn compare_columns(left: ArrayRef, op: PredicateOp, right: ArrayRef) -> Result<BooleanArray, String> {
    let left = decode_dictionary(left)?;
    let mut right = decode_dictionary(right)?;
    if left.data_type() != right.data_type() {
        right = cast(&right, left.data_type()).map_err(|e| e.to_string())?;
    }
    let result = match op {
        PredicateOp::Eq => eq(&left, &right),
        PredicateOp::Ne => neq(&left, &right),
        PredicateOp::Lt => lt(&left, &right),
        PredicateOp::Le => lt_eq(&left, &right),
        PredicateOp::Gt => gt(&left, &right),
        PredicateOp::Ge => gt_eq(&left, &right),
        other => {
            return Err(format!(
                "operator {} is not a column comparison",
                other.symbol()
            ));
        }
    };
    result.map_err(|e| e.to_string())
}

/// Evaluate `array <op> values` row by row with SQL NULL semantics.
pub fn evaluate_op(
    array: &dyn Array,
    op: PredicateOp,
    values: &[ScalarValue],
) -> Result<BooleanArray, String> {
    op.validate_values(values)?;
    let len = array.len();
    if op.is_binary() && values.first().is_some_and(ScalarValue::is_null) {
        return Ok(BooleanArray::from(vec![None::<bool>; len]));
    }
    let list_has_null = values.iter().any(ScalarValue::is_null);
    let non_null = values
        .iter()
        .filter(|v| !v.is_null())
        .cloned()
        .collect::<Vec<_>>();

    match array.data_type() {
        DataType::Dictionary(key_type, value_type)
            if key_type.as_ref() == &DataType::Int32 && value_type.as_ref() == &DataType::Utf8 =>
        {
            let dict = downcast::<DictionaryArray<Int32Type>>(array, "Dictionary(Int32, Utf8)")?;
            let value_mask = evaluate_op(dict.values().as_ref(), op, values)?;
            let keys = dict.keys();
            let mut out = Vec::with_capacity(len);
            for row in 0..len {
                if keys.is_null(row) {
                    out.push(null_row_result(op));
                    continue;
                }
                let code = usize::try_from(keys.value(row))
                    .map_err(|_| format!("negative dictionary code at row {row}"))?;
                if code >= value_mask.len() {
                    return Err(format!(
                        "dictionary code {} out of range {}",
                        code,
                        value_mask.len()
                    ));
                }
                out.push(if value_mask.is_null(code) {
                    None
                } else {
                    Some(value_mask.value(code))
                });
            }
            Ok(BooleanArray::from(out))
        }
        DataType::Int8 => {
            let a = downcast::<Int8Array>(array, "Int8")?;
            let vals = int_operands(&non_null)?;
            Ok(build_mask(len, op, &vals, list_has_null, |i| a.is_null(i), |i| {
                i64::from(a.value(i))
            }))
        }
        DataType::Int16 => {
            let a = downcast::<Int16Array>(array, "Int16")?;
            let vals = int_operands(&non_null)?;
            Ok(build_mask(len, op, &vals, list_has_null, |i| a.is_null(i), |i| {
                i64::from(a.value(i))
            }))
        }
        DataType::Int32 => {
            let a = downcast::<Int32Array>(array, "Int32")?;
            let vals = int_operands(&non_null)?;
            Ok(build_mask(len, op, &vals, list_has_null, |i| a.is_null(i), |i| {
                i64::from(a.value(i))
            }))
        }
        DataType::Int64 => {
            let a = downcast::<Int64Array>(array, "Int64")?;
            let vals = int_operands(&non_null)?;
            Ok(build_mask(len, op, &vals, list_has_null, |i| a.is_null(i), |i| a.value(i)))
        }
        DataType::Date32 => {
            let a = downcast::<Date32Array>(array, "Date32")?;
            let vals = int_operands(&non_null)?;
            Ok(build_mask(len, op, &vals, list_has_null, |i| a.is_null(i), |i| {
                i64::from(a.value(i))
            }))
        }
        DataType::Float32 => {
            let a = downcast::<Float32Array>(array, "Float32")?;
            let vals = float_operands(&non_null)?;
            Ok(build_mask(len, op, &vals, list_has_null, |i| a.is_null(i), |i| {
                f64::from(a.value(i))
            }))
        }
        DataType::Float64 => {
            let a = downcast::<Float64Array>(array, "Float64")?;
            let vals = float_operands(&non_null)?;
            Ok(build_mask(len, op, &vals, list_has_null, |i| a.is_null(i), |i| a.value(i)))
        }
        DataType::Boolean => {
            let a = downcast::<BooleanArray>(array, "Boolean")?;
            let vals = non_null
                .iter()
                .map(|v| {
                    v.as_bool()
                        .ok_or_else(|| format!("operand {} is not comparable with Boolean", v))
                })
                .collect::<Result<Vec<_>, _>>()?;
            Ok(build_mask(len, op, &vals, list_has_null, |i| a.is_null(i), |i| a.value(i)))
        }
        DataType::Utf8 => {
            let a = downcast::<StringArray>(array, "Utf8")?;
            let vals = str_operands(&non_null)?;
            Ok(build_mask(len, op, &vals, list_has_null, |i| a.is_null(i), |i| a.value(i)))
        }
        DataType::LargeUtf8 => {
            let a = downcast::<LargeStringArray>(array, "LargeUtf8")?;
            let vals = str_operands(&non_null)?;
            Ok(build_mask(len, op, &vals, list_has_null, |i| a.is_null(i), |i| a.value(i)))
        }
        other => Err(format!("unsupported column type for predicate: {:?}", other)),
    }
}

/// Read one row of `array` as a scalar. Dictionary columns yield the decoded value.
pub fn scalar_at(array: &dyn Array, row: usize) -> Result<ScalarValue, String> {
    if row >= array.len() {
        return Err(format!("row {} out of range {}", row, array.len()));
    }
    if array.is_null(row) {
        return Ok(ScalarValue::Null);
    }
    let value = match array.data_type() {
        DataType::Boolean => ScalarValue::Boolean(downcast::<BooleanArray>(array, "Boolean")?.value(row)),
        DataType::Int8 => ScalarValue::Int8(downcast::<Int8Array>(array, "Int8")?.value(row)),
        DataType::Int16 => ScalarValue::Int16(downcast::<Int16Array>(array, "Int16")?.value(row)),
        DataType::Int32 => ScalarValue::Int32(downcast::<Int32Array>(array, "Int32")?.value(row)),
        DataType::Int64 => ScalarValue::Int64(downcast::<Int64Array>(array, "Int64")?.value(row)),
        DataType::Float32 => {
            ScalarValue::Float32(downcast::<Float32Array>(array, "Float32")?.value(row))
        }
        DataType::Float64 => {
            ScalarValue::Float64(downcast::<Float64Array>(array, "Float64")?.value(row))
        }
        DataType::Date32 => ScalarValue::Date32(downcast::<Date32Array>(array, "Date32")?.value(row)),
        DataType::Utf8 => {
            ScalarValue::Utf8(downcast::<StringArray>(array, "Utf8")?.value(row).to_string())
        }
        DataType::LargeUtf8 => ScalarValue::Utf8(
            downcast::<LargeStringArray>(array, "LargeUtf8")?
                .value(row)
                .to_string(),
        ),
        DataType::Dictionary(_, _) => {
            let dict = downcast::<DictionaryArray<Int32Type>>(array, "Dictionary(Int32, _)")?;
            let code = usize::try_from(dict.keys().value(row))
                .map_err(|_| format!("negative dictionary code at row {row}"))?;
            return scalar_at(dict.values().as_ref(), code);
        }
        other => return Err(format!("unsupported column type for scalar access: {:?}", other)),
    };
    Ok(value)
}

fn downcast<'a, T: 'static>(array: &'a dyn Array, expected: &str) -> Result<&'a T, String> {
    array.as_any().downcast_ref::<T>().ok_or_else(|| {
        format!(
            "predicate array type mismatch: expected={}, actual={:?}",
            expected,
            array.data_type()
        )
    })
}

fn int_operands(values: &[ScalarValue]) -> Result<Vec<i64>, String> {
    values
        .iter()
        .map(|v| {
            v.as_i64()
                .ok_or_else(|| format!("operand {} is not comparable with an integer column", v))
        })
        .collect()
}

fn float_operands(values: &[ScalarValue]) -> Result<Vec<f64>, String> {
    values
        .iter()
        .map(|v| {
            v.as_f64()
                .ok_or_else(|| format!("operand {} is not comparable with a float column", v))
        })
        .collect()
}

fn str_operands(values: &[ScalarValue]) -> Result<Vec<&str>, String> {
    values
        .iter()
        .map(|v| {
            v.as_str()
                .ok_or_else(|| format!("operand {} is not comparable with a string column", v))
        })
        .collect()
}

fn null_row_result(op: PredicateOp) -> Option<bool> {
    match op {
        PredicateOp::IsNull => Some(true),
        PredicateOp::IsNotNull => Some(false),
        _ => None,
    }
}

fn build_mask<T: PartialOrd>(
    len: usize,
    op: PredicateOp,
    values: &[T],
    list_has_null: bool,
    is_null: impl Fn(usize) -> bool,
    value_at: impl Fn(usize) -> T,
) -> BooleanArray {
    let mut out = Vec::with_capacity(len);
    for row in 0..len {
        if is_null(row) {
            out.push(null_row_result(op));
        } else {
            out.push(eval_value(op, &value_at(row), values, list_has_null));
        }
    }
    BooleanArray::from(out)
}

fn eval_value<T: PartialOrd>(
    op: PredicateOp,
    value: &T,
    values: &[T],
    list_has_null: bool,
) -> Option<bool> {
    let first = values.first();
    match op {
        PredicateOp::Eq => first.map(|v| value == v),
        PredicateOp::Ne => first.map(|v| value != v),
        PredicateOp::Lt => first.map(|v| value < v),
        PredicateOp::Le => first.map(|v| value <= v),
        PredicateOp::Gt => first.map(|v| value > v),
        PredicateOp::Ge => first.map(|v| value >= v),
        PredicateOp::In => {
            if values.iter().any(|v| v == value) {
                Some(true)
            } else if list_has_null {
                None
            } else {
                Some(false)
            }
        }
        PredicateOp::NotIn => {
            if values.iter().any(|v| v == value) {
                Some(false)
            } else if list_has_null {
                None
            } else {
                Some(true)
            }
        }
        PredicateOp::IsNull => Some(false),
        PredicateOp::IsNotNull => Some(true),
    }
}
