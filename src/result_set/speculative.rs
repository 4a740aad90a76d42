// Copyright 2025 Stoolap Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Speculative top-N
//!
//! For `SELECT k, COUNT(*) ... GROUP BY k ORDER BY 2 DESC LIMIT n` each
//! storage fragment keeps only its first `n` groups in sort order and remembers
//! the count of the first group it dropped. Merging fragments tracks, per key, whether its count may be
//! missing contributions that were dropped elsewhere. The final top-N is only
//! accepted when it can be proven exact; otherwise
//! [`Error::SpeculativeTopNFailed`] asks the caller to rerun without
//! speculation.
//!
//! [`SpeculativeTopNBlacklist`] remembers query shapes that failed so they are
//! not attempted again.

use std::cmp::Ordering;
use std::ops::Range;

use dashmap::DashSet;
use rustc_hash::FxHashMap;

use crate::core::{Error, Result};

use super::{Cell, ResultSet, ResultSetBuilder, TargetInfo};

/// Group-by shapes for which speculation failed, keyed by the group-by
/// expression fingerprint and the sort direction
#[derive(Debug, Default)]
pub struct SpeculativeTopNBlacklist {
    entries: DashSet<(u64, bool)>,
}

impl SpeculativeTopNBlacklist {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, group_by_fingerprint: u64, desc: bool) {
        self.entries.insert((group_by_fingerprint, desc));
    }

    pub fn contains(&self, group_by_fingerprint: u64, desc: bool) -> bool {
        self.entries.contains(&(group_by_fingerprint, desc))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SpeculativeTopNVal {
    val: i64,
    /// Contributions from some fragment may be missing
    unknown: bool,
}

/// Partial (key, count) groups of one or more fragments
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpeculativeTopNMap {
    map: FxHashMap<i64, SpeculativeTopNVal>,
    /// Upper bound for the count of any group not in `map`
    unknown: i64,
}

impl SpeculativeTopNMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// One map per storage fragment, each keeping its first `truncate_n`
    /// groups in sort direction, merged with [`reduce`](Self::reduce). The
    /// (key, count) columns may come in either order.
    pub fn from_result_set(rows: &ResultSet, truncate_n: usize, desc: bool) -> Result<Self> {
        if rows.col_count() != 2 {
            return Err(Error::invalid_argument(format!(
                "speculative top-n expects 2 columns, got {}",
                rows.col_count()
            )));
        }
        let count_first = rows.targets()[0].is_agg;
        let mut merged: Option<Self> = None;
        for entries in rows.fragment_entry_ranges() {
            let fragment = Self::from_fragment(rows, entries, truncate_n, desc, count_first)?;
            match merged.as_mut() {
                Some(merged) => merged.reduce(fragment),
                None => merged = Some(fragment),
            }
        }
        Ok(merged.unwrap_or_default())
    }

    fn from_fragment(
        rows: &ResultSet,
        entries: Range<usize>,
        truncate_n: usize,
        desc: bool,
        count_first: bool,
    ) -> Result<Self> {
        let mut groups = Vec::new();
        for entry in entries {
            let Some(row) = rows.entry_values(entry, false)? else {
                continue;
            };
            let (key, val) = if count_first {
                (&row[1], &row[0])
            } else {
                (&row[0], &row[1])
            };
            let (Some(key), Some(val)) = (key.as_int64(), val.as_int64()) else {
                return Err(Error::type_error(
                    "speculative top-n needs integer keys and counts",
                ));
            };
            groups.push((key, val));
        }
        groups.sort_by(|a, b| {
            let ord = a.1.cmp(&b.1);
            let ord = if desc { ord.reverse() } else { ord };
            ord.then(a.0.cmp(&b.0))
        });

        let mut out = Self::new();
        if let Some(&(_, val)) = groups.get(truncate_n) {
            out.unknown = val;
        }
        groups.truncate(truncate_n);
        for (key, val) in groups {
            out.map.insert(key, SpeculativeTopNVal { val, unknown: false });
        }
        Ok(out)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn unknown(&self) -> i64 {
        self.unknown
    }

    /// Merge another fragment's groups
    pub fn reduce(&mut self, mut that: SpeculativeTopNMap) {
        for (key, this_entry) in self.map.iter_mut() {
            match that.map.remove(key) {
                Some(that_entry) => {
                    this_entry.val += that_entry.val;
                    this_entry.unknown |= that_entry.unknown;
                }
                None => {
                    this_entry.val += that.unknown;
                    this_entry.unknown |= that.unknown != 0;
                }
            }
        }
        for (key, that_entry) in that.map {
            self.map.insert(
                key,
                SpeculativeTopNVal {
                    val: that_entry.val + self.unknown,
                    unknown: that_entry.unknown || self.unknown != 0,
                },
            );
        }
        self.unknown += that.unknown;
    }

    /// The first `n` (key, count) groups; fails when they cannot be proven exact
    pub fn top_n(&self, n: usize, desc: bool) -> Result<Vec<(i64, i64)>> {
        let mut entries: Vec<(i64, SpeculativeTopNVal)> =
            self.map.iter().map(|(k, v)| (*k, *v)).collect();
        entries.sort_by(|a, b| {
            let ord = a.1.val.cmp(&b.1.val);
            let ord = if desc { ord.reverse() } else { ord };
            match ord {
                Ordering::Equal => a.0.cmp(&b.0),
                other => other,
            }
        });
        let num_rows = n.min(entries.len());
        if let Some(pos) = entries[..num_rows].iter().position(|(_, v)| v.unknown) {
            return Err(Error::SpeculativeTopNFailed(format!(
                "count of row {} is not exact",
                pos
            )));
        }
        if self.unknown > 0 {
            let beaten = if desc {
                num_rows < n || num_rows == 0 || entries[num_rows - 1].1.val < self.unknown
            } else {
                true
            };
            if beaten {
                return Err(Error::SpeculativeTopNFailed(format!(
                    "a dropped group may reach count {}",
                    self.unknown
                )));
            }
        }
        Ok(entries
            .into_iter()
            .take(num_rows)
            .map(|(k, v)| (k, v.val))
            .collect())
    }

    /// The top `n` groups as a group-by result set with `targets`
    pub fn to_result_set(&self, targets: Vec<TargetInfo>, n: usize, desc: bool) -> Result<ResultSet> {
        let count_first = targets.first().map(|t| t.is_agg).unwrap_or(false);
        let mut builder = ResultSetBuilder::group_by(targets, 1);
        for (key, val) in self.top_n(n, desc)? {
            if count_first {
                builder.row(vec![Cell::from(val), Cell::from(key)]);
            } else {
                builder.row(vec![Cell::from(key), Cell::from(val)]);
            }
        }
        builder.build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ColumnType, Value};
    use crate::ir::AggKind;

    fn targets() -> Vec<TargetInfo> {
        vec![
            TargetInfo::column(ColumnType::bigint()),
            TargetInfo::agg(AggKind::Count, ColumnType::bigint()),
        ]
    }

    fn fragment(groups: &[(i64, i64)]) -> ResultSet {
        let mut b = ResultSetBuilder::group_by(targets(), 1);
        for (k, v) in groups {
            b.row(vec![Cell::from(*k), Cell::from(*v)]);
        }
        b.build().unwrap()
    }

    #[test]
    fn test_blacklist() {
        let blacklist = SpeculativeTopNBlacklist::new();
        assert!(blacklist.is_empty());
        blacklist.add(42, true);
        blacklist.add(42, true);
        assert!(blacklist.contains(42, true));
        assert!(!blacklist.contains(42, false));
        assert_eq!(blacklist.len(), 1);
        blacklist.clear();
        assert!(!blacklist.contains(42, true));
    }

    #[test]
    fn test_exact_when_dropped_groups_are_light() {
        let mut merged =
            SpeculativeTopNMap::from_result_set(&fragment(&[(1, 100), (2, 50), (3, 1)]), 2, true).unwrap();
        assert_eq!(merged.unknown(), 1);
        let other =
            SpeculativeTopNMap::from_result_set(&fragment(&[(1, 80), (2, 60), (4, 2)]), 2, true).unwrap();
        merged.reduce(other);
        assert_eq!(merged.top_n(2, true).unwrap(), vec![(1, 180), (2, 110)]);
        let rs = merged.to_result_set(targets(), 1, true).unwrap();
        assert_eq!(
            rs.rows(true).unwrap(),
            vec![vec![Value::integer(1), Value::integer(180)]]
        );
    }

    #[test]
    fn test_fails_when_unknown_count_reaches_top() {
        let mut merged =
            SpeculativeTopNMap::from_result_set(&fragment(&[(1, 10), (2, 9)]), 1, true).unwrap();
        let other = SpeculativeTopNMap::from_result_set(&fragment(&[(2, 10), (3, 9)]), 1, true).unwrap();
        merged.reduce(other);
        assert!(matches!(
            merged.top_n(1, true),
            Err(Error::SpeculativeTopNFailed(_))
        ));
    }

    #[test]
    fn test_ascending_with_dropped_groups_fails() {
        let map = SpeculativeTopNMap::from_result_set(&fragment(&[(1, 5), (2, 3)]), 1, false).unwrap();
        assert!(map.top_n(1, false).is_err());
        let map = SpeculativeTopNMap::from_result_set(&fragment(&[(1, 5), (2, 3)]), 5, false).unwrap();
        assert_eq!(map.top_n(1, false).unwrap(), vec![(2, 3)]);
    }

    #[test]
    fn test_appended_fragments_are_reduced() {
        let mut rs = fragment(&[(1, 100), (2, 50), (3, 1)]);
        rs.append(fragment(&[(1, 80), (2, 60), (4, 2)])).unwrap();
        let merged = SpeculativeTopNMap::from_result_set(&rs, 2, true).unwrap();
        assert_eq!(merged.unknown(), 3);
        assert_eq!(merged.top_n(2, true).unwrap(), vec![(1, 180), (2, 110)]);

        // each fragment's winner is the other's runner-up
        let mut rs = fragment(&[(1, 10), (2, 9)]);
        rs.append(fragment(&[(2, 10), (3, 9)])).unwrap();
        let merged = SpeculativeTopNMap::from_result_set(&rs, 1, true).unwrap();
        assert!(matches!(
            merged.top_n(1, true),
            Err(Error::SpeculativeTopNFailed(_))
        ));
    }

    #[test]
    fn test_truncates_in_sort_direction() {
        let rs = fragment(&[(1, 5), (2, 3), (3, 4)]);
        let asc = SpeculativeTopNMap::from_result_set(&rs, 2, false).unwrap();
        assert_eq!(asc.unknown(), 5);
        let desc = SpeculativeTopNMap::from_result_set(&rs, 2, true).unwrap();
        assert_eq!(desc.unknown(), 3);
        assert_eq!(desc.top_n(2, true).unwrap(), vec![(1, 5), (3, 4)]);
    }
}
