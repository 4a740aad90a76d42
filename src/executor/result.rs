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

//! Step and query results

use std::sync::Arc;

use crate::ir::TargetMetaInfo;
use crate::result_set::ResultSet;

/// Selectivity of one filter, reported when looking for push-down candidates
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushedDownFilterInfo {
    pub input_prev: Vec<usize>,
    pub input_start: Vec<usize>,
    pub input_next: Vec<usize>,
}

/// Output of a query or of one of its steps
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    rows: Option<Arc<ResultSet>>,
    targets_meta: Vec<TargetMetaInfo>,
    pushed_down_filter_info: Vec<PushedDownFilterInfo>,
    filter_push_down_enabled: bool,
    success: bool,
    queue_time_ms: i64,
}

impl ExecutionResult {
    pub fn new(rows: ResultSet, targets_meta: Vec<TargetMetaInfo>) -> Self {
        Self::from_shared(Arc::new(rows), targets_meta)
    }

    pub fn from_shared(rows: Arc<ResultSet>, targets_meta: Vec<TargetMetaInfo>) -> Self {
        Self {
            rows: Some(rows),
            targets_meta,
            pushed_down_filter_info: Vec::new(),
            filter_push_down_enabled: false,
            success: true,
            queue_time_ms: 0,
        }
    }

    /// Push-down candidates returned instead of rows
    pub fn push_down(filters: Vec<PushedDownFilterInfo>, enabled: bool) -> Self {
        Self {
            rows: None,
            targets_meta: Vec::new(),
            pushed_down_filter_info: filters,
            filter_push_down_enabled: enabled,
            success: true,
            queue_time_ms: 0,
        }
    }

    pub fn rows(&self) -> Option<&Arc<ResultSet>> {
        self.rows.as_ref()
    }

    /// Mutable rows, available while nothing else shares them
    pub fn rows_mut(&mut self) -> Option<&mut ResultSet> {
        self.rows.as_mut().and_then(Arc::get_mut)
    }

    pub fn targets_meta(&self) -> &[TargetMetaInfo] {
        &self.targets_meta
    }

    pub fn pushed_down_filter_info(&self) -> &[PushedDownFilterInfo] {
        &self.pushed_down_filter_info
    }

    pub fn is_filter_push_down_enabled(&self) -> bool {
        self.filter_push_down_enabled
    }

    pub fn explanation(&self) -> Option<&str> {
        self.rows.as_deref().and_then(ResultSet::explanation)
    }

    pub fn success(&self) -> bool {
        self.success
    }

    pub fn set_success(&mut self, success: bool) {
        self.success = success;
    }

    pub fn queue_time_ms(&self) -> i64 {
        self.queue_time_ms
    }

    pub fn set_queue_time(&mut self, queue_time_ms: i64) {
        self.queue_time_ms = queue_time_ms;
        if let Some(rows) = self.rows_mut() {
            rows.set_queue_time(queue_time_ms);
        }
    }
}
