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

//! Executor configuration
//!
//! Process-wide knobs of the driver. Every field has a `DEFAULT_*` constant
//! that is the single source of truth for its default.

use crate::plan::{TranslatorOptions, DEFAULT_HLL_PRECISION_BITS};
use crate::result_set::sort::{
    DEFAULT_BASELINE_THRESHOLD, DEFAULT_PARALLEL_TOP_MAX, DEFAULT_PARALLEL_TOP_MIN,
};
use crate::result_set::SortConfig;

pub const DEFAULT_BIG_GROUP_THRESHOLD: usize = 20_000;
pub const DEFAULT_MAX_GROUPS_BUFFER_ENTRY_GUESS: usize = 16_384;
pub const DEFAULT_ESTIMATOR_FAILURE_MAX_GROUPBY_SIZE: usize = 256_000_000;
pub const DEFAULT_COLUMNAR_LARGE_PROJECTIONS_THRESHOLD: usize = 1_000_000;
pub const DEFAULT_PARALLEL_ROW_COUNT_THRESHOLD: usize = 20_000;
pub const DEFAULT_MAX_CARDINALITY_CACHE_ENTRIES: usize = 10_000;

/// Scan limits above this are treated as unknown when sizing projections
pub const HIGH_SCAN_LIMIT: usize = 32_000_000;

/// Configuration of a [`RelAlgExecutor`](super::RelAlgExecutor)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorConfig {
    /// Rerun a query on CPU when the GPU cannot run it (default: true)
    pub allow_cpu_retry: bool,
    /// Rerun a single step on CPU instead of the whole query (default: true)
    pub allow_query_step_cpu_retry: bool,
    /// Retry native codegen failures through the extern path (default: false)
    pub enable_interop: bool,
    /// Refuse work that would run too long (default: false)
    pub watchdog_enabled: bool,
    /// Minimum entry count for parallel top-N (default: 100,000)
    pub parallel_top_min: usize,
    /// Watchdog limit for parallel top-N (default: 20,000,000)
    pub parallel_top_max: usize,
    /// Watchdog limit for a serial sort (default: 1,000,000)
    pub baseline_threshold: usize,
    /// Group counts up to this are trusted without estimation (default: 20,000)
    pub big_group_threshold: usize,
    /// Initial output buffer entry count (default: 16,384)
    pub default_max_groups_buffer_entry_guess: usize,
    /// Buffer size used when distinct value estimation fails (default: 256,000,000)
    pub estimator_failure_max_groupby_size: usize,
    /// Emit large projections in columnar layout (default: true)
    pub columnar_large_projections: bool,
    /// Row count from which a projection is large (default: 1,000,000)
    pub columnar_large_projections_threshold: usize,
    /// Reorder inner join inputs by size (default: true)
    pub from_table_reordering: bool,
    /// Reuse the row count of the previous step as a projection's scan limit (default: true)
    pub skip_intermediate_count: bool,
    /// Let GPU projections grow their output buffer on demand (default: false)
    pub enable_bump_allocator: bool,
    /// Allow the single column sort fast path (default: true)
    pub enable_direct_columnarization: bool,
    /// Row count from which result sets are counted in parallel (default: 20,000)
    pub parallel_row_count_threshold: usize,
    /// Capacity of the in-memory cardinality cache (default: 10,000)
    pub max_cardinality_cache_entries: usize,
    /// Precision of approximate distinct counts (default: 11)
    pub approx_count_distinct_bitmap_bits: u32,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            allow_cpu_retry: true,
            allow_query_step_cpu_retry: true,
            enable_interop: false,
            watchdog_enabled: false,
            parallel_top_min: DEFAULT_PARALLEL_TOP_MIN,
            parallel_top_max: DEFAULT_PARALLEL_TOP_MAX,
            baseline_threshold: DEFAULT_BASELINE_THRESHOLD,
            big_group_threshold: DEFAULT_BIG_GROUP_THRESHOLD,
            default_max_groups_buffer_entry_guess: DEFAULT_MAX_GROUPS_BUFFER_ENTRY_GUESS,
            estimator_failure_max_groupby_size: DEFAULT_ESTIMATOR_FAILURE_MAX_GROUPBY_SIZE,
            columnar_large_projections: true,
            columnar_large_projections_threshold: DEFAULT_COLUMNAR_LARGE_PROJECTIONS_THRESHOLD,
            from_table_reordering: true,
            skip_intermediate_count: true,
            enable_bump_allocator: false,
            enable_direct_columnarization: true,
            parallel_row_count_threshold: DEFAULT_PARALLEL_ROW_COUNT_THRESHOLD,
            max_cardinality_cache_entries: DEFAULT_MAX_CARDINALITY_CACHE_ENTRIES,
            approx_count_distinct_bitmap_bits: DEFAULT_HLL_PRECISION_BITS,
        }
    }
}

impl ExecutorConfig {
    /// Configuration with every retry disabled
    pub fn no_retry() -> Self {
        Self {
            allow_cpu_retry: false,
            allow_query_step_cpu_retry: false,
            ..Default::default()
        }
    }

    /// Sort knobs handed to [`ResultSet::sort`](crate::result_set::ResultSet::sort)
    pub fn sort_config(&self) -> SortConfig {
        SortConfig {
            watchdog_enabled: self.watchdog_enabled,
            parallel_top_min: self.parallel_top_min,
            parallel_top_max: self.parallel_top_max,
            baseline_threshold: self.baseline_threshold,
            enable_direct_columnarization: self.enable_direct_columnarization,
        }
    }

    pub fn translator_options(&self) -> TranslatorOptions {
        TranslatorOptions {
            from_table_reordering: self.from_table_reordering,
            default_max_groups_buffer_entry_guess: self.default_max_groups_buffer_entry_guess,
            ..TranslatorOptions::default()
        }
    }

    /// Row counts at or above the threshold are counted in parallel
    #[inline]
    pub fn should_count_in_parallel(&self, entry_count: usize) -> bool {
        entry_count >= self.parallel_row_count_threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ExecutorConfig::default();
        assert!(config.allow_cpu_retry);
        assert!(config.allow_query_step_cpu_retry);
        assert!(!config.enable_interop);
        assert_eq!(config.parallel_top_min, 100_000);
        assert_eq!(config.parallel_top_max, 20_000_000);
        assert_eq!(config.baseline_threshold, 1_000_000);
        assert_eq!(config.big_group_threshold, 20_000);
        assert_eq!(config.default_max_groups_buffer_entry_guess, 16_384);
        assert_eq!(config.approx_count_distinct_bitmap_bits, 11);
    }

    #[test]
    fn test_derived_options() {
        let config = ExecutorConfig {
            watchdog_enabled: true,
            from_table_reordering: false,
            ..ExecutorConfig::no_retry()
        };
        assert!(!config.allow_cpu_retry);
        assert!(config.sort_config().watchdog_enabled);
        assert!(!config.translator_options().from_table_reordering);
        assert!(config.should_count_in_parallel(20_000));
        assert!(!config.should_count_in_parallel(19_999));
    }
}
