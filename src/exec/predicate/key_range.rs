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
use std::cmp::Ordering;
use std::fmt;

use crate::exec::predicate::ScalarValue;

/// Prefix tuple over the leading key columns of a tablet.
#[derive(Clone, Debug, PartialEq)]
pub enum OlapTuple {
    /// Lower than every key. A begin bound of this form marks an unbounded range.
    NegativeInfinity,
    /// Higher than every key.
    PositiveInfinity,
    Values(Vec<ScalarValue>),
}

impl OlapTuple {
    pub fn values(values: Vec<ScalarValue>) -> Self {
        OlapTuple::Values(values)
    }

    pub fn is_negative_infinity(&self) -> bool {
        matches!(self, OlapTuple::NegativeInfinity)
    }

    pub fn len(&self) -> usize {
        match self {
            OlapTuple::Values(values) => values.len(),
            _ => 1,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Compare a row's key columns against this tuple on the tuple's prefix length.
    ///
    /// Returns `None` when a key value is NULL or not comparable with the bound.
    pub fn compare_row(&self, row_keys: &[ScalarValue]) -> Option<Ordering> {
        match self {
            OlapTuple::NegativeInfinity => Some(Ordering::Greater),
            OlapTuple::PositiveInfinity => Some(Ordering::Less),
            OlapTuple::Values(bound) => {
                for (row_value, bound_value) in row_keys.iter().zip(bound.iter()) {
                    match row_value.compare(bound_value)? {
                        Ordering::Equal => continue,
                        other => return Some(other),
                    }
                }
                if row_keys.len() < bound.len() {
                    return None;
                }
                Some(Ordering::Equal)
            }
        }
    }
}

impl fmt::Display for OlapTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OlapTuple::NegativeInfinity => write!(f, "(-oo)"),
            OlapTuple::PositiveInfinity => write!(f, "(+oo)"),
            OlapTuple::Values(values) => {
                let parts = values.iter().map(ToString::to_string).collect::<Vec<_>>();
                write!(f, "({})", parts.join(","))
            }
        }
    }
}

/// Contiguous key interval over the tablet's sort key.
#[derive(Clone, Debug, PartialEq)]
pub struct KeyRange {
    pub begin: OlapTuple,
    pub begin_include: bool,
    pub end: OlapTuple,
    pub end_include: bool,
}

impl KeyRange {
    pub fn new(begin: OlapTuple, begin_include: bool, end: OlapTuple, end_include: bool) -> Self {
        Self {
            begin,
            begin_include,
            end,
            end_include,
        }
    }

    /// The whole key space.
    pub fn full() -> Self {
        Self::new(
            OlapTuple::NegativeInfinity,
            true,
            OlapTuple::PositiveInfinity,
            true,
        )
    }

    pub fn point(values: Vec<ScalarValue>) -> Self {
        Self::new(
            OlapTuple::Values(values.clone()),
            true,
            OlapTuple::Values(values),
            true,
        )
    }

    /// True when the begin bound is a lone -oo; such ranges add no bound to the reader.
    pub fn is_unbounded_begin(&self) -> bool {
        self.begin.is_negative_infinity()
    }

    pub fn contains(&self, row_keys: &[ScalarValue]) -> bool {
        let after_begin = match self.begin.compare_row(row_keys) {
            Some(Ordering::Greater) => true,
            Some(Ordering::Equal) => self.begin_include,
            _ => false,
        };
        if !after_begin {
            return false;
        }
        match self.end.compare_row(row_keys) {
            Some(Ordering::Less) => true,
            Some(Ordering::Equal) => self.end_include,
            _ => false,
        }
    }
}

impl fmt::Display for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{} : {}{}",
            if self.begin_include { "[" } else { "(" },
            self.begin,
            self.end,
            if self.end_include { "]" } else { ")" }
        )
    }
}

/// Group key ranges into per-scanner batches.
///
/// Each group takes up to `max(1, ranges.len() / scanners_per_tablet)` contiguous ranges and
/// never mixes ranges with different `end_include`. Flattening the groups yields the input
/// order unchanged.
pub fn group_scanner_ranges(ranges: &[KeyRange], scanners_per_tablet: usize) -> Vec<Vec<KeyRange>> {
    let scanners = scanners_per_tablet.max(1);
    let ranges_per_scanner = (ranges.len() / scanners).max(1);
    let mut groups = Vec::new();
    let mut i = 0;
    while i < ranges.len() {
        let mut group = vec![ranges[i].clone()];
        i += 1;
        while i < ranges.len()
            && group.len() < ranges_per_scanner
            && ranges[i].end_include == ranges[i - 1].end_include
        {
            group.push(ranges[i].clone());
            i += 1;
        }
        groups.push(group);
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int_range(lo: i32, hi: i32, end_include: bool) -> KeyRange {
        KeyRange::new(
            OlapTuple::values(vec![ScalarValue::Int32(lo)]),
            true,
            OlapTuple::values(vec![ScalarValue::Int32(hi)]),
            end_include,
        )
    }

    #[test]
    fn half_open_range_membership() {
        let range = int_range(500, 1500, false);
        assert!(range.contains(&[ScalarValue::Int32(500)]));
        assert!(range.contains(&[ScalarValue::Int32(1499)]));
        assert!(!range.contains(&[ScalarValue::Int32(1500)]));
        assert!(!range.contains(&[ScalarValue::Int32(499)]));
        assert!(!range.contains(&[ScalarValue::Null]));
        assert!(KeyRange::full().contains(&[ScalarValue::Null]));
        assert!(KeyRange::full().contains(&[ScalarValue::Int32(i32::MIN)]));
    }

    #[test]
    fn prefix_bounds_compare_on_prefix_only() {
        let range = KeyRange::new(
            OlapTuple::values(vec![ScalarValue::Int32(1), ScalarValue::Int64(5)]),
            true,
            OlapTuple::values(vec![ScalarValue::Int32(1)]),
            true,
        );
        assert!(range.contains(&[ScalarValue::Int32(1), ScalarValue::Int64(9)]));
        assert!(!range.contains(&[ScalarValue::Int32(1), ScalarValue::Int64(4)]));
        assert!(!range.contains(&[ScalarValue::Int32(2), ScalarValue::Int64(0)]));
    }

    #[test]
    fn grouping_respects_end_include_boundaries() {
        let ranges = vec![
            int_range(0, 1, true),
            int_range(2, 3, true),
            int_range(4, 5, false),
            int_range(6, 7, false),
            int_range(8, 9, true),
        ];
        let groups = group_scanner_ranges(&ranges, 1);
        let sizes = groups.iter().map(Vec::len).collect::<Vec<_>>();
        assert_eq!(sizes, vec![2, 2, 1]);
        let flattened = groups.into_iter().flatten().collect::<Vec<_>>();
        assert_eq!(flattened, ranges);
    }

    #[test]
    fn grouping_uses_one_range_per_scanner_when_ranges_are_few() {
        let ranges = (0..10).map(|i| int_range(i, i, true)).collect::<Vec<_>>();
        let groups = group_scanner_ranges(&ranges, 64);
        assert_eq!(groups.len(), 10);
        let groups = group_scanner_ranges(&ranges, 5);
        assert_eq!(groups.len(), 5);
        assert!(group_scanner_ranges(&[], 64).is_empty());
    }
}
