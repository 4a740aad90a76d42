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

//! Temporary tables
//!
//! Results of finished steps, keyed by `-node_id`, so that later steps can read
//! them as input tables. Each key is written once by the step that owns it.

use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::core::{Error, Result};
use crate::ir::NodeId;
use crate::result_set::ResultSet;

/// Key of the temporary table produced by `node`
#[inline]
pub fn temporary_table_key(node: NodeId) -> i32 {
    -(node as i32)
}

/// One or more fragments of a step result
#[derive(Debug, Clone, Default)]
pub struct TemporaryTable {
    fragments: Vec<Arc<ResultSet>>,
}

impl TemporaryTable {
    pub fn single(rows: Arc<ResultSet>) -> Self {
        Self {
            fragments: vec![rows],
        }
    }

    pub fn push(&mut self, rows: Arc<ResultSet>) {
        self.fragments.push(rows);
    }

    pub fn frag_count(&self) -> usize {
        self.fragments.len()
    }

    pub fn result_set(&self, frag_idx: usize) -> Option<&Arc<ResultSet>> {
        self.fragments.get(frag_idx)
    }

    /// Rows over all fragments
    pub fn row_count(&self) -> usize {
        self.fragments.iter().map(|rs| rs.row_count(false)).sum()
    }

    /// LIMIT of the first fragment, 0 when unlimited
    pub fn limit(&self) -> usize {
        self.fragments.first().map(|rs| rs.get_limit()).unwrap_or(0)
    }
}

/// Temporary tables of one query
#[derive(Debug, Default)]
pub struct TemporaryTables {
    tables: FxHashMap<i32, TemporaryTable>,
}

impl TemporaryTables {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `table` under `key`; keys are single-writer
    pub fn add(&mut self, key: i32, table: TemporaryTable) -> Result<()> {
        if self.tables.contains_key(&key) {
            return Err(Error::TemporaryTableExists(key));
        }
        self.tables.insert(key, table);
        Ok(())
    }

    pub fn get(&self, key: i32) -> Result<&TemporaryTable> {
        self.tables
            .get(&key)
            .ok_or(Error::TemporaryTableNotFound(key))
    }

    pub fn contains(&self, key: i32) -> bool {
        self.tables.contains_key(&key)
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub fn clear(&mut self) {
        self.tables.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ColumnType;
    use crate::result_set::{Cell, ResultSetBuilder, TargetInfo};

    fn rows(values: &[i64]) -> Arc<ResultSet> {
        let mut b = ResultSetBuilder::projection(vec![TargetInfo::column(ColumnType::bigint())]);
        for v in values {
            b.row(vec![Cell::from(*v)]);
        }
        Arc::new(b.build().unwrap())
    }

    #[test]
    fn test_single_writer() {
        let mut tables = TemporaryTables::new();
        tables
            .add(temporary_table_key(3), TemporaryTable::single(rows(&[1, 2])))
            .unwrap();
        assert_eq!(
            tables.add(-3, TemporaryTable::single(rows(&[1]))),
            Err(Error::TemporaryTableExists(-3))
        );
        assert_eq!(tables.get(-3).unwrap().row_count(), 2);
        assert!(matches!(tables.get(-4), Err(Error::TemporaryTableNotFound(-4))));
        tables.clear();
        assert!(tables.is_empty());
    }

    #[test]
    fn test_fragments() {
        let mut table = TemporaryTable::single(rows(&[1, 2, 3]));
        table.push(rows(&[4]));
        assert_eq!(table.frag_count(), 2);
        assert_eq!(table.row_count(), 4);
        assert_eq!(table.limit(), 0);
        assert!(table.result_set(2).is_none());
    }
}
