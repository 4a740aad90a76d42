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

//! Result Sets
//!
//! A [`ResultSet`] is the output of one execution step. It owns a primary
//! [`ResultSetStorage`] plus any storages appended from other fragments, all
//! sharing one layout. Row order is either the natural entry order (skipping
//! empty entries) or an explicit permutation produced by [`ResultSet::sort`].
//!
//! ## Global entry indices
//!
//! Entries are numbered across storages: the primary storage first, then each
//! appended storage in append order. [`ResultSet::find_storage`] maps a global
//! index back to a storage and a local index.
//!
//! ## Row count
//!
//! The row count is computed lazily and cached. Any mutation (append, sort,
//! limit or offset) invalidates the cache.

pub mod builder;
pub mod columnar;
pub mod comparator;
pub mod descriptor;
pub mod iter;
pub mod sort;
pub mod speculative;
pub mod storage;

use std::fmt;
use std::ops::Range;
use std::sync::atomic::{AtomicI64, Ordering as AtomicOrdering};
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::core::{ColumnType, DataType, Error, ExecutorDeviceType, Result, Value};

pub use builder::{Cell, ResultSetBuilder, VecStringDictionary};
pub use columnar::ColumnChunk;
pub use comparator::ResultSetComparator;
pub use descriptor::{
    target_slot_indices, QueryDescriptionType, QueryMemoryDescriptor, SlotSize, TargetInfo,
};
pub use sort::{OrderEntry, SortConfig};
pub use speculative::{SpeculativeTopNBlacklist, SpeculativeTopNMap};
pub use storage::{AggregateState, QuantileDigest, ResultSetStorage, SlotView};

/// Entries at or above this count use parallel algorithms
pub const PARALLEL_ALGORITHMS_THRESHOLD: usize = 20_000;

const UNINITIALIZED_CACHED_ROW_COUNT: i64 = -1;

/// One decoded output row
pub type ResultRow = Vec<Value>;

// =============================================================================
// Collaborators
// =============================================================================

/// Resolves dictionary-encoded string ids
pub trait StringDictionaryProxy: Send + Sync + fmt::Debug {
    fn get_string(&self, id: i32) -> Option<Arc<str>>;
}

/// Fetches values of lazily materialized columns by row id
pub trait ColumnFetcher: Send + Sync + fmt::Debug {
    fn fetch(&self, local_col_id: usize, row_id: i64) -> Result<Value>;
}

/// Sorts a buffer in place on a device
pub trait DeviceSorter: Send + Sync + fmt::Debug {
    /// Returns [`Error::OutOfGpuMemory`] when the device cannot hold the buffer
    fn sort(
        &self,
        desc: &QueryMemoryDescriptor,
        buffer: &mut [u8],
        order_entries: &[OrderEntry],
    ) -> Result<()>;
}

/// Lazy fetch metadata for one target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ColumnLazyFetchInfo {
    pub is_lazily_fetched: bool,
    pub local_col_id: usize,
}

/// A storage resolved from a global entry index
#[derive(Debug, Clone, Copy)]
pub struct StorageLookupResult<'a> {
    pub storage: &'a ResultSetStorage,
    pub fixedup_entry_idx: usize,
    pub storage_idx: usize,
}

#[derive(Debug, Default)]
pub(crate) struct IterCursor {
    /// Next global entry to inspect (natural order)
    pub(crate) crt_row_buff_idx: usize,
    /// Rows returned so far
    pub(crate) fetched_so_far: usize,
    /// Rows skipped for OFFSET so far (natural order)
    pub(crate) dropped_so_far: usize,
}

fn truncated_row_count(total: usize, limit: usize, offset: usize) -> usize {
    let remaining = total.saturating_sub(offset);
    if limit > 0 {
        remaining.min(limit)
    } else {
        remaining
    }
}

/// Output of one execution step
#[derive(Debug)]
pub struct ResultSet {
    targets: Vec<TargetInfo>,
    device_type: ExecutorDeviceType,
    query_mem_desc: QueryMemoryDescriptor,
    storage: Option<ResultSetStorage>,
    appended_storage: Vec<ResultSetStorage>,
    /// Global start index of every storage, primary first
    storage_offsets: Vec<usize>,
    permutation: Vec<u32>,
    keep_first: usize,
    drop_first: usize,
    cached_row_count: AtomicI64,
    cursor: Mutex<IterCursor>,
    lazy_fetch_info: Vec<ColumnLazyFetchInfo>,
    column_fetcher: Option<Arc<dyn ColumnFetcher>>,
    dictionaries: FxHashMap<i32, Arc<dyn StringDictionaryProxy>>,
    device_sorter: Option<Arc<dyn DeviceSorter>>,
    explanation: Option<String>,
    for_validation_only: bool,
    queue_time_ms: i64,
}

impl ResultSet {
    /// Result set without storage
    pub fn new(
        targets: Vec<TargetInfo>,
        device_type: ExecutorDeviceType,
        query_mem_desc: QueryMemoryDescriptor,
    ) -> Self {
        Self {
            targets,
            device_type,
            query_mem_desc,
            storage: None,
            appended_storage: Vec::new(),
            storage_offsets: Vec::new(),
            permutation: Vec::new(),
            keep_first: 0,
            drop_first: 0,
            cached_row_count: AtomicI64::new(UNINITIALIZED_CACHED_ROW_COUNT),
            cursor: Mutex::new(IterCursor::default()),
            lazy_fetch_info: Vec::new(),
            column_fetcher: None,
            dictionaries: FxHashMap::default(),
            device_sorter: None,
            explanation: None,
            for_validation_only: false,
            queue_time_ms: 0,
        }
    }

    /// Result set over a filled storage
    pub fn with_storage(
        targets: Vec<TargetInfo>,
        device_type: ExecutorDeviceType,
        storage: ResultSetStorage,
    ) -> Result<Self> {
        let slots: usize = targets.iter().map(TargetInfo::slot_count).sum();
        if slots != storage.desc().slot_count() {
            return Err(Error::LayoutMismatch(format!(
                "{} target slot(s) for a buffer with {} slot(s)",
                slots,
                storage.desc().slot_count()
            )));
        }
        let mut rs = Self::new(targets, device_type, storage.desc().clone());
        rs.storage_offsets.push(0);
        rs.storage = Some(storage);
        Ok(rs)
    }

    /// One-row result carrying an EXPLAIN text
    pub fn explain(explanation: impl Into<String>) -> Self {
        let mut rs = Self::new(
            vec![TargetInfo::column(ColumnType::not_null(DataType::Text))],
            ExecutorDeviceType::Cpu,
            QueryMemoryDescriptor::projection(0, &[]),
        );
        rs.explanation = Some(explanation.into());
        rs
    }

    /// Empty projection result with the given output types
    pub fn empty(targets: Vec<TargetInfo>) -> Self {
        let slots: Vec<SlotSize> = targets
            .iter()
            .flat_map(|t| std::iter::repeat(SlotSize::full()).take(t.slot_count()))
            .collect();
        Self::new(
            targets,
            ExecutorDeviceType::Cpu,
            QueryMemoryDescriptor::projection(0, &slots),
        )
    }

    pub fn with_lazy_fetch_info(mut self, info: Vec<ColumnLazyFetchInfo>) -> Self {
        self.lazy_fetch_info = info;
        self
    }

    pub fn with_column_fetcher(mut self, fetcher: Arc<dyn ColumnFetcher>) -> Self {
        self.column_fetcher = Some(fetcher);
        self
    }

    pub fn with_dictionary(mut self, dict_id: i32, proxy: Arc<dyn StringDictionaryProxy>) -> Self {
        self.dictionaries.insert(dict_id, proxy);
        self
    }

    pub fn with_device_sorter(mut self, sorter: Arc<dyn DeviceSorter>) -> Self {
        self.device_sorter = Some(sorter);
        self
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn targets(&self) -> &[TargetInfo] {
        &self.targets
    }

    pub fn col_count(&self) -> usize {
        if self.is_explain() {
            1
        } else {
            self.targets.len()
        }
    }

    /// Output type of a column; AVG reports DOUBLE
    pub fn col_type(&self, col_idx: usize) -> Result<ColumnType> {
        if self.is_explain() {
            return Ok(ColumnType::not_null(DataType::Text));
        }
        let target = self
            .targets
            .get(col_idx)
            .ok_or(Error::ColumnIndexOutOfBounds { index: col_idx })?;
        Ok(if target.is_avg() {
            ColumnType::double()
        } else {
            target.sql_type
        })
    }

    pub fn device_type(&self) -> ExecutorDeviceType {
        self.device_type
    }

    pub fn query_mem_desc(&self) -> &QueryMemoryDescriptor {
        &self.query_mem_desc
    }

    pub fn storage(&self) -> Option<&ResultSetStorage> {
        self.storage.as_ref()
    }

    pub fn appended_storage(&self) -> &[ResultSetStorage] {
        &self.appended_storage
    }

    /// Entries across all storages, empty ones included
    pub fn entry_count(&self) -> usize {
        self.query_mem_desc.entry_count()
    }

    pub fn permutation(&self) -> &[u32] {
        &self.permutation
    }

    pub fn lazy_fetch_info(&self) -> &[ColumnLazyFetchInfo] {
        &self.lazy_fetch_info
    }

    pub(crate) fn is_lazily_fetched(&self, target_idx: usize) -> bool {
        self.lazy_fetch_info
            .get(target_idx)
            .map(|info| info.is_lazily_fetched)
            .unwrap_or(false)
    }

    pub(crate) fn column_fetcher(&self) -> Option<&Arc<dyn ColumnFetcher>> {
        self.column_fetcher.as_ref()
    }

    pub fn dictionary(&self, dict_id: i32) -> Option<&Arc<dyn StringDictionaryProxy>> {
        self.dictionaries.get(&dict_id)
    }

    pub(crate) fn device_sorter(&self) -> Option<&Arc<dyn DeviceSorter>> {
        self.device_sorter.as_ref()
    }

    pub fn is_explain(&self) -> bool {
        self.explanation.is_some()
    }

    pub fn explanation(&self) -> Option<&str> {
        self.explanation.as_deref()
    }

    pub fn set_validation_only(&mut self) {
        self.for_validation_only = true;
    }

    pub fn is_validation_only(&self) -> bool {
        self.for_validation_only
    }

    pub fn set_queue_time(&mut self, queue_time_ms: i64) {
        self.queue_time_ms = queue_time_ms;
    }

    pub fn queue_time(&self) -> i64 {
        self.queue_time_ms
    }

    // =========================================================================
    // LIMIT / OFFSET
    // =========================================================================

    /// LIMIT; setting the same value again is a no-op
    pub fn keep_first_n(&mut self, n: usize) {
        self.invalidate_cached_row_count();
        self.keep_first = n;
    }

    /// OFFSET; setting the same value again is a no-op
    pub fn drop_first_n(&mut self, n: usize) {
        self.invalidate_cached_row_count();
        self.drop_first = n;
    }

    pub fn get_limit(&self) -> usize {
        self.keep_first
    }

    pub fn get_offset(&self) -> usize {
        self.drop_first
    }

    pub fn is_truncated(&self) -> bool {
        self.keep_first + self.drop_first > 0
    }

    // =========================================================================
    // Storage lookup
    // =========================================================================

    /// Resolve a global entry index to its storage
    pub fn find_storage(&self, entry_idx: usize) -> Option<StorageLookupResult<'_>> {
        let primary = self.storage.as_ref()?;
        let storage_idx = self
            .storage_offsets
            .partition_point(|&start| start <= entry_idx)
            .checked_sub(1)?;
        let storage = if storage_idx == 0 {
            primary
        } else {
            self.appended_storage.get(storage_idx - 1)?
        };
        let fixedup_entry_idx = entry_idx - self.storage_offsets[storage_idx];
        if fixedup_entry_idx >= storage.entry_count() {
            return None;
        }
        Some(StorageLookupResult {
            storage,
            fixedup_entry_idx,
            storage_idx,
        })
    }

    /// True if the global entry holds no row
    /// Global entry range of each storage, primary first
    pub fn fragment_entry_ranges(&self) -> Vec<Range<usize>> {
        self.storage_offsets
            .iter()
            .enumerate()
            .map(|(i, &start)| {
                let end = self
                    .storage_offsets
                    .get(i + 1)
                    .copied()
                    .unwrap_or_else(|| self.entry_count());
                start..end
            })
            .collect()
    }

    pub fn is_row_at_empty(&self, entry_idx: usize) -> bool {
        match self.find_storage(entry_idx) {
            Some(lookup) => lookup.storage.is_empty_entry(lookup.fixedup_entry_idx),
            None => true,
        }
    }

    // =========================================================================
    // Append
    // =========================================================================

    /// Take over the storages of `that`, keeping this result's layout
    pub fn append(&mut self, that: ResultSet) -> Result<()> {
        self.invalidate_cached_row_count();
        let ResultSet {
            storage: that_storage,
            appended_storage: that_appended,
            ..
        } = that;
        let Some(that_storage) = that_storage else {
            return Ok(());
        };
        let incoming: Vec<ResultSetStorage> =
            std::iter::once(that_storage).chain(that_appended).collect();
        for storage in &incoming {
            if !storage.desc().same_layout(&self.query_mem_desc) {
                return Err(Error::LayoutMismatch(format!(
                    "cannot append {:?}{} storage to {:?}{} result",
                    storage.desc().query_type(),
                    if storage.desc().did_output_columnar() { " columnar" } else { "" },
                    self.query_mem_desc.query_type(),
                    if self.query_mem_desc.did_output_columnar() { " columnar" } else { "" },
                )));
            }
        }
        for storage in incoming {
            let entries = storage.entry_count();
            if self.storage.is_none() {
                self.storage_offsets = vec![0];
                self.query_mem_desc.set_entry_count(entries);
                self.storage = Some(storage);
                continue;
            }
            self.storage_offsets.push(self.entry_count());
            self.query_mem_desc
                .set_entry_count(self.entry_count() + entries);
            self.appended_storage.push(storage);
        }
        Ok(())
    }

    // =========================================================================
    // Row count
    // =========================================================================

    pub fn invalidate_cached_row_count(&self) {
        self.cached_row_count
            .store(UNINITIALIZED_CACHED_ROW_COUNT, AtomicOrdering::Release);
    }

    pub fn set_cached_row_count(&self, row_count: usize) {
        self.cached_row_count
            .store(row_count as i64, AtomicOrdering::Release);
    }

    /// Number of rows iteration yields, LIMIT and OFFSET applied
    pub fn row_count(&self, force_parallel: bool) -> usize {
        let cached = self.cached_row_count.load(AtomicOrdering::Acquire);
        if cached != UNINITIALIZED_CACHED_ROW_COUNT && !force_parallel {
            return cached as usize;
        }
        let count = self.row_count_impl(force_parallel);
        self.set_cached_row_count(count);
        count
    }

    fn row_count_impl(&self, force_parallel: bool) -> usize {
        if self.is_explain() {
            return 1;
        }
        if !self.permutation.is_empty() {
            return truncated_row_count(self.permutation.len(), self.keep_first, self.drop_first);
        }
        if self.storage.is_none() {
            return 0;
        }
        if self.query_mem_desc.query_type() == QueryDescriptionType::Projection {
            return self.bin_search_row_count();
        }
        if force_parallel || self.entry_count() >= PARALLEL_ALGORITHMS_THRESHOLD {
            return self.parallel_row_count();
        }
        let _guard = self.cursor.lock();
        let non_empty = (0..self.entry_count())
            .filter(|&i| !self.is_row_at_empty(i))
            .count();
        truncated_row_count(non_empty, self.keep_first, self.drop_first)
    }

    fn bin_search_row_count(&self) -> usize {
        let Some(storage) = &self.storage else {
            return 0;
        };
        let total = storage.bin_search_row_count()
            + self
                .appended_storage
                .iter()
                .map(ResultSetStorage::bin_search_row_count)
                .sum::<usize>();
        truncated_row_count(total, self.keep_first, self.drop_first)
    }

    fn parallel_row_count(&self) -> usize {
        #[cfg(feature = "parallel")]
        let non_empty = {
            use rayon::prelude::*;
            (0..self.entry_count())
                .into_par_iter()
                .with_min_len(1024)
                .filter(|&i| !self.is_row_at_empty(i))
                .count()
        };
        #[cfg(not(feature = "parallel"))]
        let non_empty = (0..self.entry_count())
            .filter(|&i| !self.is_row_at_empty(i))
            .count();
        truncated_row_count(non_empty, self.keep_first, self.drop_first)
    }

    pub fn is_empty(&self) -> bool {
        self.row_count(false) == 0
    }

    /// True when no storage was ever produced
    pub fn definitely_has_no_rows(&self) -> bool {
        self.storage.is_none() && !self.is_explain()
    }

    // =========================================================================
    // Layout helpers
    // =========================================================================

    /// First slot of each target
    pub fn slot_indices_for_target_indices(&self) -> Vec<usize> {
        target_slot_indices(&self.targets)
    }

    /// Targets that occupy exactly one fixed-width slot, and their count
    pub fn single_slot_target_bitmap(&self) -> (Vec<bool>, usize) {
        let bitmap: Vec<bool> = self
            .targets
            .iter()
            .map(|t| t.slot_count() == 1 && !t.sql_type.is_varlen())
            .collect();
        let count = bitmap.iter().filter(|b| **b).count();
        (bitmap, count)
    }

    pub(crate) fn set_permutation(&mut self, permutation: Vec<u32>) {
        self.permutation = permutation;
    }

    pub(crate) fn storage_mut(&mut self) -> Option<&mut ResultSetStorage> {
        self.storage.as_mut()
    }

    pub(crate) fn cursor(&self) -> &Mutex<IterCursor> {
        &self.cursor
    }

    pub fn summary_to_string(&self) -> String {
        let desc = &self.query_mem_desc;
        let mut out = String::from("Result Set Info\n");
        out.push_str(&format!("\tLayout: {:?}\n", desc.query_type()));
        out.push_str(&format!(
            "\tColumnar: {}\n",
            if desc.did_output_columnar() { "true" } else { "false" }
        ));
        out.push_str(&format!("\tColumns: {}\n", self.col_count()));
        out.push_str(&format!("\tRows: {}\n", self.row_count(false)));
        out.push_str(&format!("\tEntry count: {}\n", self.entry_count()));
        out.push_str(&format!("\tStorages: {}\n", self.storage_offsets.len()));
        out.push_str(&format!("\tPermutation size: {}\n", self.permutation.len()));
        out.push_str(&format!("\tLimit: {}\n", self.keep_first));
        out.push_str(&format!("\tOffset: {}\n", self.drop_first));
        out
    }
}

/// LIMIT and OFFSET prevent splitting the work across threads
pub fn can_use_parallel_algorithms(rows: &ResultSet) -> bool {
    !rows.is_truncated()
}

pub fn use_parallel_algorithms(rows: &ResultSet) -> bool {
    can_use_parallel_algorithms(rows) && rows.entry_count() >= PARALLEL_ALGORITHMS_THRESHOLD
}
