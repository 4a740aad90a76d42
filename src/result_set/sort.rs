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

//! Sort and Top-N
//!
//! [`ResultSet::sort`] picks one of four strategies:
//!
//! - **Radix sort** for layouts flagged `sort_on_gpu`: the device sorter runs
//!   first and a CPU radix sort takes over when it reports out-of-memory. The
//!   storage is reordered in place and no permutation is kept.
//! - **Parallel top-N** when a bound is given and the result is large: each
//!   thread top-sorts a contiguous interval, then one final pass top-sorts the
//!   concatenated survivors.
//! - **Single column fast path** for a full sort of one numeric, columnar,
//!   eagerly fetched projection column.
//! - **General path**: a permutation over non-empty entries ordered by
//!   [`ResultSetComparator`].

use std::cmp::Ordering;

use tracing::{debug, warn};

use crate::core::types::{inline_int_null, NULL_DOUBLE, NULL_FLOAT};
use crate::core::{Error, Result};

use super::comparator::ResultSetComparator;
use super::descriptor::QueryDescriptionType;
use super::ResultSet;

/// Default minimum entry count for parallel top-N
pub const DEFAULT_PARALLEL_TOP_MIN: usize = 100_000;

/// Default entry count above which the watchdog refuses parallel top-N
pub const DEFAULT_PARALLEL_TOP_MAX: usize = 20_000_000;

/// Default entry count above which the watchdog refuses a serial sort
pub const DEFAULT_BASELINE_THRESHOLD: usize = 1_000_000;

/// One ORDER BY key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OrderEntry {
    /// 1-based target number
    pub tle_no: usize,
    pub is_desc: bool,
    pub nulls_first: bool,
}

impl OrderEntry {
    pub fn new(tle_no: usize, is_desc: bool, nulls_first: bool) -> Self {
        Self {
            tle_no,
            is_desc,
            nulls_first,
        }
    }

    /// 0-based target index
    pub fn target_idx(&self) -> usize {
        self.tle_no.saturating_sub(1)
    }
}

/// Sort tuning knobs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortConfig {
    /// Refuse sorts that would be too slow (default: false)
    pub watchdog_enabled: bool,
    /// Minimum entry count for parallel top-N (default: 100,000)
    pub parallel_top_min: usize,
    /// Watchdog limit for parallel top-N (default: 20,000,000)
    pub parallel_top_max: usize,
    /// Watchdog limit for a serial sort (default: 1,000,000)
    pub baseline_threshold: usize,
    /// Allow the single column fast path (default: true)
    pub enable_direct_columnarization: bool,
}

impl Default for SortConfig {
    fn default() -> Self {
        Self {
            watchdog_enabled: false,
            parallel_top_min: DEFAULT_PARALLEL_TOP_MIN,
            parallel_top_max: DEFAULT_PARALLEL_TOP_MAX,
            baseline_threshold: DEFAULT_BASELINE_THRESHOLD,
            enable_direct_columnarization: true,
        }
    }
}

fn too_slow() -> Error {
    Error::Watchdog("Sorting the result would be too slow".to_string())
}

impl ResultSet {
    /// Order the result by `order_entries`, keeping only the first `top_n`
    /// rows when `top_n > 0`
    pub fn sort(&mut self, order_entries: &[OrderEntry], top_n: usize, config: &SortConfig) -> Result<()> {
        if self.storage().is_none() {
            return Ok(());
        }
        self.check_sort_keys(order_entries)?;
        self.invalidate_cached_row_count();

        let entry_count = self.entry_count();
        if self.query_mem_desc().sort_on_gpu() && order_entries.len() == 1 && self.appended_storage().is_empty() {
            return self.radix_sort(&order_entries[0]);
        }
        if entry_count > u32::MAX as usize {
            return Err(Error::RowSort(
                "Sorting more than 4B elements not supported".to_string(),
            ));
        }

        if top_n > 0 && config.parallel_top_min < entry_count {
            if config.watchdog_enabled && config.parallel_top_max < entry_count {
                return Err(too_slow());
            }
            debug!(entry_count, top_n, "parallel top-n");
            let permutation = self.parallel_top(order_entries, top_n)?;
            self.set_permutation(permutation);
            return Ok(());
        }
        if config.watchdog_enabled && config.baseline_threshold < entry_count {
            return Err(too_slow());
        }

        let permutation = if top_n == 0
            && order_entries.len() == 1
            && config.enable_direct_columnarization
            && self.can_sort_single_column(&order_entries[0])
        {
            self.sort_single_column(&order_entries[0])
        } else {
            let mut permutation = self.init_permutation_buffer(0, entry_count);
            let comparator = ResultSetComparator::new(self, order_entries, &permutation, false)?;
            top_permutation(&mut permutation, top_n, &comparator, false);
            permutation
        };
        self.set_permutation(permutation);
        Ok(())
    }

    fn check_sort_keys(&self, order_entries: &[OrderEntry]) -> Result<()> {
        for order_entry in order_entries {
            let target_idx = order_entry.target_idx();
            let target = self
                .targets()
                .get(target_idx)
                .ok_or(Error::ColumnIndexOutOfBounds { index: target_idx })?;
            if target.sql_type.is_array() {
                return Err(Error::unsupported(
                    "Columns with array types cannot be used in an ORDER BY clause.",
                ));
            }
        }
        Ok(())
    }

    /// Non-empty global entries in `[begin, end)`
    pub fn init_permutation_buffer(&self, begin: usize, end: usize) -> Vec<u32> {
        let end = end.min(self.entry_count());
        (begin..end)
            .filter(|&i| !self.is_row_at_empty(i))
            .map(|i| i as u32)
            .collect()
    }

    fn parallel_top(&self, order_entries: &[OrderEntry], top_n: usize) -> Result<Vec<u32>> {
        let intervals = make_intervals(0, self.entry_count(), worker_count());
        let top_one = |&(begin, end): &(usize, usize)| -> Result<Vec<u32>> {
            let mut permutation = self.init_permutation_buffer(begin, end);
            let comparator = ResultSetComparator::new(self, order_entries, &permutation, true)?;
            top_permutation(&mut permutation, top_n, &comparator, true);
            Ok(permutation)
        };

        #[cfg(feature = "parallel")]
        let partial: Vec<Vec<u32>> = {
            use rayon::prelude::*;
            intervals.par_iter().map(top_one).collect::<Result<_>>()?
        };
        #[cfg(not(feature = "parallel"))]
        let partial: Vec<Vec<u32>> = intervals.iter().map(top_one).collect::<Result<_>>()?;

        let mut permutation: Vec<u32> = partial.concat();
        let comparator = ResultSetComparator::new(self, order_entries, &permutation, false)?;
        top_permutation(&mut permutation, top_n, &comparator, false);
        Ok(permutation)
    }

    fn can_sort_single_column(&self, order_entry: &OrderEntry) -> bool {
        let target_idx = order_entry.target_idx();
        let Some(target) = self.targets().get(target_idx) else {
            return false;
        };
        self.is_direct_columnar_conversion_possible()
            && self.query_mem_desc().query_type() == QueryDescriptionType::Projection
            && self.appended_storage().is_empty()
            && !self.is_lazily_fetched(target_idx)
            && !target.is_agg
            && target.sql_type.is_number()
    }

    /// Nulls partitioned to their end, then the rest sorted by raw value
    fn sort_single_column(&self, order_entry: &OrderEntry) -> Vec<u32> {
        let target_idx = order_entry.target_idx();
        let slot_idx = self.slot_indices_for_target_indices()[target_idx];
        let permutation = self.init_permutation_buffer(0, self.entry_count());
        let Some(storage) = self.storage() else {
            return permutation;
        };
        let view = storage.slot_view(slot_idx);
        let ty = &self.targets()[target_idx].sql_type;
        if ty.data_type.is_fp() {
            if self.stored_as_f32(target_idx, slot_idx) {
                sort_column(permutation, order_entry, |e| view.get_f32(e), |v| *v == NULL_FLOAT)
            } else {
                sort_column(permutation, order_entry, |e| view.get_f64(e), |v| *v == NULL_DOUBLE)
            }
        } else {
            // the sentinel follows the column type, not the slot width
            let null = inline_int_null(ty.size());
            sort_column(permutation, order_entry, |e| view.get(e), |v| *v == null)
        }
    }

    fn radix_sort(&mut self, order_entry: &OrderEntry) -> Result<()> {
        if let Some(sorter) = self.device_sorter().cloned() {
            let desc = self.query_mem_desc().clone();
            let Some(storage) = self.storage_mut() else {
                return Ok(());
            };
            match sorter.sort(&desc, storage.buffer_mut(), std::slice::from_ref(order_entry)) {
                Ok(()) => return Ok(()),
                Err(Error::OutOfGpuMemory) => {
                    warn!(entries = desc.entry_count(), "device sort out of memory, sorting on CPU");
                }
                Err(e) => return Err(e),
            }
        }
        self.radix_sort_on_cpu(order_entry)
    }

    /// Reorders the primary storage by one key, empty entries last. NULL
    /// placement follows the raw sentinel order.
    fn radix_sort_on_cpu(&mut self, order_entry: &OrderEntry) -> Result<()> {
        let target_idx = order_entry.target_idx();
        let slot_idx = self.slot_indices_for_target_indices()[target_idx];
        let as_f32 = self.stored_as_f32(target_idx, slot_idx);
        let is_fp = self.targets()[target_idx].sql_type.data_type.is_fp();
        let Some(storage) = self.storage() else {
            return Ok(());
        };
        let entry_count = storage.entry_count();
        let (mut order, empties): (Vec<u32>, Vec<u32>) =
            (0..entry_count as u32).partition(|&i| !storage.is_empty_entry(i as usize));
        let view = storage.slot_view(slot_idx);
        if is_fp {
            let key = |i: &u32| {
                let v = if as_f32 {
                    view.get_f32(*i as usize) as f64
                } else {
                    view.get_f64(*i as usize)
                };
                if order_entry.is_desc {
                    -v
                } else {
                    v
                }
            };
            radsort::sort_by_key(&mut order, key);
        } else if order_entry.is_desc {
            radsort::sort_by_key(&mut order, |i| view.get(*i as usize).wrapping_neg().wrapping_sub(1));
        } else {
            radsort::sort_by_key(&mut order, |i| view.get(*i as usize));
        }
        order.extend(empties);
        if let Some(storage) = self.storage_mut() {
            storage.permute_entries(&order)?;
        }
        Ok(())
    }
}

/// Keep the first `n` entries in order, or order them all when `n == 0`
pub(crate) fn top_permutation(
    permutation: &mut Vec<u32>,
    n: usize,
    comparator: &ResultSetComparator<'_>,
    #[cfg_attr(not(feature = "parallel"), allow(unused_variables))] single_threaded: bool,
) {
    let cmp = |a: &u32, b: &u32| comparator.compare(*a, *b);
    if n > 0 && n < permutation.len() {
        permutation.select_nth_unstable_by(n - 1, cmp);
        permutation.truncate(n);
    }
    #[cfg(feature = "parallel")]
    if !single_threaded && permutation.len() >= super::PARALLEL_ALGORITHMS_THRESHOLD {
        use rayon::prelude::*;
        permutation.par_sort_unstable_by(cmp);
        return;
    }
    permutation.sort_unstable_by(cmp);
}

/// Split `[begin, end)` into at most `n` contiguous non-empty intervals
pub(crate) fn make_intervals(begin: usize, end: usize, n: usize) -> Vec<(usize, usize)> {
    let len = end.saturating_sub(begin);
    let n = n.max(1);
    let step = len.div_ceil(n).max(1);
    (begin..end)
        .step_by(step)
        .map(|start| (start, (start + step).min(end)))
        .collect()
}

fn worker_count() -> usize {
    #[cfg(feature = "parallel")]
    {
        rayon::current_num_threads()
    }
    #[cfg(not(feature = "parallel"))]
    {
        1
    }
}

/// A raw column value the fast path sorts by
trait SortKey: Copy + Send + Sync {
    fn key_cmp(&self, other: &Self) -> Ordering;
}

impl SortKey for i64 {
    fn key_cmp(&self, other: &Self) -> Ordering {
        self.cmp(other)
    }
}

impl SortKey for f32 {
    fn key_cmp(&self, other: &Self) -> Ordering {
        self.total_cmp(other)
    }
}

impl SortKey for f64 {
    fn key_cmp(&self, other: &Self) -> Ordering {
        self.total_cmp(other)
    }
}

fn sort_column<K: SortKey>(
    permutation: Vec<u32>,
    order_entry: &OrderEntry,
    read: impl Fn(usize) -> K,
    is_null: impl Fn(&K) -> bool,
) -> Vec<u32> {
    let (nulls, mut values): (Vec<(u32, K)>, Vec<(u32, K)>) = permutation
        .into_iter()
        .map(|entry| (entry, read(entry as usize)))
        .partition(|(_, key)| is_null(key));

    let desc = order_entry.is_desc;
    let cmp = |a: &(u32, K), b: &(u32, K)| {
        let ord = a.1.key_cmp(&b.1);
        if desc {
            ord.reverse()
        } else {
            ord
        }
    };
    #[cfg(feature = "parallel")]
    {
        use rayon::prelude::*;
        values.par_sort_by(cmp);
    }
    #[cfg(not(feature = "parallel"))]
    values.sort_by(cmp);

    let sorted = values.into_iter().map(|(entry, _)| entry);
    let nulls = nulls.into_iter().map(|(entry, _)| entry);
    if order_entry.nulls_first {
        nulls.chain(sorted).collect()
    } else {
        sorted.chain(nulls).collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::core::{ColumnType, DataType, Value};
    use crate::ir::AggKind;
    use crate::result_set::{
        Cell, DeviceSorter, QueryMemoryDescriptor, ResultSetBuilder, TargetInfo,
    };

    fn column_values(rs: &ResultSet) -> Vec<Value> {
        rs.rows(true).unwrap().into_iter().map(|mut r| r.remove(0)).collect()
    }

    fn int_rows(values: &[Option<i64>], columnar: bool) -> ResultSet {
        typed_rows(DataType::BigInt, values, columnar, false)
    }

    fn typed_rows(
        data_type: DataType,
        values: &[Option<i64>],
        columnar: bool,
        compact: bool,
    ) -> ResultSet {
        let mut b =
            ResultSetBuilder::projection(vec![TargetInfo::column(ColumnType::nullable(data_type))]);
        b.columnar(columnar);
        b.compact_slots(compact);
        for v in values {
            b.row(vec![Cell::from(Value::from(*v))]);
        }
        b.build().unwrap()
    }

    #[test]
    fn test_fast_path_nulls_last() {
        let mut rs = int_rows(&[Some(5), None, Some(3), None, Some(1)], true);
        rs.sort(&[OrderEntry::new(1, false, false)], 0, &SortConfig::default())
            .unwrap();
        let null = Value::null(DataType::BigInt);
        assert_eq!(
            column_values(&rs),
            vec![Value::integer(1), Value::integer(3), Value::integer(5), null.clone(), null]
        );
    }

    #[test]
    fn test_general_path_matches_fast_path() {
        let values = [Some(4), None, Some(-2), Some(4), Some(9), None];
        for desc in [false, true] {
            for nulls_first in [false, true] {
                let entries = [OrderEntry::new(1, desc, nulls_first)];
                let mut fast = int_rows(&values, true);
                fast.sort(&entries, 0, &SortConfig::default()).unwrap();
                let mut general = int_rows(&values, false);
                general.sort(&entries, 0, &SortConfig::default()).unwrap();
                assert_eq!(fast.permutation(), general.permutation());
            }
        }
    }

    #[test]
    fn test_fast_path_nulls_for_narrow_integers() {
        let values = [Some(5), None, Some(3), None, Some(1)];
        for data_type in [DataType::Integer, DataType::SmallInt, DataType::TinyInt] {
            for compact in [false, true] {
                for nulls_first in [false, true] {
                    let entries = [OrderEntry::new(1, false, nulls_first)];
                    let mut fast = typed_rows(data_type, &values, true, compact);
                    fast.sort(&entries, 0, &SortConfig::default()).unwrap();
                    let mut general = typed_rows(data_type, &values, false, compact);
                    general.sort(&entries, 0, &SortConfig::default()).unwrap();

                    let expected = if nulls_first { vec![1, 3, 4, 2, 0] } else { vec![4, 2, 0, 1, 3] };
                    assert_eq!(fast.permutation(), expected.as_slice(), "{:?} compact={}", data_type, compact);
                    assert_eq!(fast.permutation(), general.permutation(), "{:?} compact={}", data_type, compact);
                    let firsts = column_values(&fast);
                    assert_eq!(firsts[0].is_null(), nulls_first, "{:?}", data_type);
                }
            }
        }
    }

    #[test]
    fn test_top_n_and_parallel_top() {
        let values: Vec<Option<i64>> = (0..500).map(|i| Some((i * 7919) % 500)).collect();
        let mut serial = int_rows(&values, false);
        serial.sort(&[OrderEntry::new(1, true, false)], 10, &SortConfig::default())
            .unwrap();
        let config = SortConfig {
            parallel_top_min: 100,
            ..SortConfig::default()
        };
        let mut parallel = int_rows(&values, false);
        parallel.sort(&[OrderEntry::new(1, true, false)], 10, &config).unwrap();
        assert_eq!(serial.permutation().len(), 10);
        assert_eq!(serial.permutation(), parallel.permutation());
        assert_eq!(column_values(&serial)[0], Value::integer(499));
    }

    #[test]
    fn test_watchdog() {
        let values: Vec<Option<i64>> = (0..50).map(Some).collect();
        let config = SortConfig {
            watchdog_enabled: true,
            baseline_threshold: 10,
            ..SortConfig::default()
        };
        let mut rs = int_rows(&values, false);
        let err = rs.sort(&[OrderEntry::new(1, false, false)], 0, &config).unwrap_err();
        assert_eq!(err.to_string(), "Sorting the result would be too slow");

        let config = SortConfig {
            watchdog_enabled: true,
            parallel_top_min: 5,
            parallel_top_max: 20,
            ..SortConfig::default()
        };
        assert!(matches!(
            rs.sort(&[OrderEntry::new(1, false, false)], 3, &config),
            Err(Error::Watchdog(_))
        ));
    }

    #[test]
    fn test_rejects_array_keys() {
        let mut rs = ResultSet::empty(vec![TargetInfo::column(ColumnType::nullable(
            DataType::Array,
        ))]);
        // No storage: nothing to sort
        assert!(rs.sort(&[OrderEntry::new(1, false, false)], 0, &SortConfig::default()).is_ok());

        let mut b = ResultSetBuilder::group_by(
            vec![
                TargetInfo::column(ColumnType::bigint()),
                TargetInfo::agg(AggKind::SingleValue, ColumnType::nullable(DataType::Array)),
            ],
            1,
        );
        b.row(vec![Cell::from(1i64), Cell::from(Value::null(DataType::Array))]);
        rs = b.build().unwrap();
        let err = rs.sort(&[OrderEntry::new(2, false, false)], 0, &SortConfig::default());
        assert_eq!(
            err.unwrap_err().to_string(),
            "Columns with array types cannot be used in an ORDER BY clause."
        );
    }

    #[test]
    fn test_make_intervals() {
        assert_eq!(make_intervals(0, 10, 3), vec![(0, 4), (4, 8), (8, 10)]);
        assert_eq!(make_intervals(0, 2, 8), vec![(0, 1), (1, 2)]);
        assert!(make_intervals(0, 0, 4).is_empty());
    }

    #[derive(Debug)]
    struct OomSorter;

    impl DeviceSorter for OomSorter {
        fn sort(&self, _: &QueryMemoryDescriptor, _: &mut [u8], _: &[OrderEntry]) -> Result<()> {
            Err(Error::OutOfGpuMemory)
        }
    }

    #[test]
    fn test_radix_sort_falls_back_to_cpu() {
        let mut b = ResultSetBuilder::group_by(
            vec![
                TargetInfo::column(ColumnType::bigint()),
                TargetInfo::agg(AggKind::Count, ColumnType::bigint()),
            ],
            1,
        );
        b.sort_on_gpu(true)
            .row(vec![Cell::from(1i64), Cell::from(30i64)])
            .empty_entry()
            .row(vec![Cell::from(2i64), Cell::from(10i64)])
            .row(vec![Cell::from(3i64), Cell::from(20i64)]);
        let mut rs = b.build().unwrap().with_device_sorter(Arc::new(OomSorter));
        rs.sort(&[OrderEntry::new(2, true, false)], 0, &SortConfig::default())
            .unwrap();
        assert!(rs.permutation().is_empty());
        let counts: Vec<Value> = rs.rows(true).unwrap().into_iter().map(|r| r[1].clone()).collect();
        assert_eq!(counts, vec![Value::integer(30), Value::integer(20), Value::integer(10)]);
        assert!(rs.is_row_at_empty(3));
    }
}
