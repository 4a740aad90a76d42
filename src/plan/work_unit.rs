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

//! Execution units
//!
//! An [`ExecutionUnit`] is the physical description of one step: which tables
//! and columns it reads, its predicates, its group-by keys and targets, and how
//! its output is sorted. Units are plain values; retry variants are clones.

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use compact_str::CompactString;

use crate::ir::expr::hash_expr_structure;
use crate::ir::{Expr, JoinType, NodeId, QueryHint, TargetMetaInfo};
use crate::core::ColumnType;
use crate::result_set::OrderEntry;

/// Where an input table comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InputSourceType {
    /// A base table
    Table,
    /// The temporary table of an earlier step
    Result,
}

/// One input table of a unit, bound to a nest level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InputDescriptor {
    /// Base table id, or `-node_id` for a temporary table
    pub table_id: i32,
    pub nest_level: usize,
}

impl InputDescriptor {
    pub fn new(table_id: i32, nest_level: usize) -> Self {
        Self { table_id, nest_level }
    }

    pub fn source_type(&self) -> InputSourceType {
        if self.table_id > 0 {
            InputSourceType::Table
        } else {
            InputSourceType::Result
        }
    }
}

/// One input column read by a unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InputColDescriptor {
    pub table_id: i32,
    pub column_id: usize,
    pub nest_level: usize,
    pub ty: ColumnType,
}

impl InputColDescriptor {
    pub fn new(table_id: i32, column_id: usize, nest_level: usize, ty: ColumnType) -> Self {
        Self {
            table_id,
            column_id,
            nest_level,
            ty,
        }
    }

    /// Ordering key for deterministic unit layout
    pub fn sort_key(&self) -> (usize, usize, i32) {
        (self.nest_level, self.column_id, self.table_id)
    }
}

/// How the driver orders the output of a Sort step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SortAlgorithm {
    #[default]
    Default,
    /// Per-fragment truncation with exactness check
    SpeculativeTopN,
    /// Projection with a bounded heap
    StreamingTopN,
}

/// ORDER BY, LIMIT and OFFSET of a unit
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct SortInfo {
    pub order_entries: Vec<OrderEntry>,
    pub algorithm: SortAlgorithm,
    /// 0 means no limit
    pub limit: usize,
    pub offset: usize,
}

impl SortInfo {
    pub fn new(order_entries: Vec<OrderEntry>, algorithm: SortAlgorithm, limit: usize, offset: usize) -> Self {
        Self {
            order_entries,
            algorithm,
            limit,
            offset,
        }
    }

    /// No ordering at all
    pub fn none() -> Self {
        Self::default()
    }
}

/// Join predicates of one nest level
#[derive(Debug, Clone, PartialEq)]
pub struct JoinCondition {
    pub quals: Vec<Arc<Expr>>,
    pub join_type: JoinType,
}

/// Physical description of one execution step
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionUnit {
    pub input_descs: Vec<InputDescriptor>,
    /// Deduplicated, ordered by (nest level, column id, table id)
    pub input_col_descs: Vec<InputColDescriptor>,
    /// Conjuncts over a single column and constants
    pub simple_quals: Vec<Arc<Expr>>,
    pub quals: Vec<Arc<Expr>>,
    /// One entry per nest level above 0
    pub join_quals: Vec<JoinCondition>,
    /// A single `None` entry marks a projection
    pub groupby_exprs: Vec<Option<Arc<Expr>>>,
    pub target_exprs: Vec<Arc<Expr>>,
    pub sort_info: SortInfo,
    /// Upper bound on output rows, 0 when unknown
    pub scan_limit: usize,
    pub query_hint: QueryHint,
    /// Fingerprint of the plan below this unit, when extractable
    pub query_plan_dag: Option<u64>,
    /// Set for UNION ALL units
    pub union_all: Option<bool>,
    pub use_bump_allocator: bool,
}

impl ExecutionUnit {
    pub fn new(input_descs: Vec<InputDescriptor>, input_col_descs: Vec<InputColDescriptor>) -> Self {
        Self {
            input_descs,
            input_col_descs,
            simple_quals: Vec::new(),
            quals: Vec::new(),
            join_quals: Vec::new(),
            groupby_exprs: vec![None],
            target_exprs: Vec::new(),
            sort_info: SortInfo::none(),
            scan_limit: 0,
            query_hint: QueryHint::default(),
            query_plan_dag: None,
            union_all: None,
            use_bump_allocator: false,
        }
    }

    /// One row per input row, no grouping
    pub fn is_projection(&self) -> bool {
        self.groupby_exprs.len() == 1 && self.groupby_exprs[0].is_none()
    }

    pub fn has_quals(&self) -> bool {
        !(self.quals.is_empty() && self.simple_quals.is_empty() && self.join_quals.is_empty())
    }

    /// Any target is an aggregate
    pub fn has_agg_targets(&self) -> bool {
        self.target_exprs.iter().any(|t| t.is_agg())
    }

    /// Cache key for cardinality lookups
    ///
    /// Covers inputs, predicates, grouping and targets. Scan limit, hints and
    /// sort info do not change the number of groups and are left out.
    pub fn cache_key(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.input_descs.hash(&mut hasher);
        self.input_col_descs.hash(&mut hasher);
        for qual in self.simple_quals.iter().chain(&self.quals) {
            hash_expr_structure(qual, &mut hasher);
        }
        for join in &self.join_quals {
            join.join_type.hash(&mut hasher);
            for qual in &join.quals {
                hash_expr_structure(qual, &mut hasher);
            }
        }
        for key in &self.groupby_exprs {
            match key {
                Some(expr) => hash_expr_structure(expr, &mut hasher),
                None => 0u8.hash(&mut hasher),
            }
        }
        for target in &self.target_exprs {
            hash_expr_structure(target, &mut hasher);
        }
        hasher.finish()
    }
}

impl fmt::Display for ExecutionUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "inputs=[")?;
        for (i, input) in self.input_descs.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}@{}", input.table_id, input.nest_level)?;
        }
        write!(f, "] targets=[")?;
        for (i, target) in self.target_exprs.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", target)?;
        }
        write!(f, "]")?;
        if !self.is_projection() {
            write!(f, " group_by={}", self.groupby_exprs.len())?;
        }
        if self.has_quals() {
            write!(
                f,
                " quals={}",
                self.simple_quals.len() + self.quals.len() + self.join_quals.len()
            )?;
        }
        if self.scan_limit > 0 {
            write!(f, " scan_limit={}", self.scan_limit)?;
        }
        Ok(())
    }
}

/// An execution unit together with its plan node and sizing guess
#[derive(Debug, Clone, PartialEq)]
pub struct WorkUnit {
    pub exe_unit: ExecutionUnit,
    pub body: NodeId,
    /// Initial output buffer entry count; 0 lets the engine pick
    pub max_groups_buffer_entry_guess: usize,
    /// Join input order chosen by table reordering, empty when unchanged
    pub input_permutation: Vec<usize>,
    /// Column counts of the left-deep join inputs, in input order
    pub left_deep_join_input_sizes: Vec<usize>,
}

impl WorkUnit {
    pub fn new(exe_unit: ExecutionUnit, body: NodeId, max_groups_buffer_entry_guess: usize) -> Self {
        Self {
            exe_unit,
            body,
            max_groups_buffer_entry_guess,
            input_permutation: Vec::new(),
            left_deep_join_input_sizes: Vec::new(),
        }
    }
}

/// Physical description of a table function call
#[derive(Debug, Clone, PartialEq)]
pub struct TableFunctionExecutionUnit {
    pub input_descs: Vec<InputDescriptor>,
    pub input_col_descs: Vec<InputColDescriptor>,
    pub name: CompactString,
    pub input_exprs: Vec<Arc<Expr>>,
    pub outputs: Vec<TargetMetaInfo>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TableFunctionWorkUnit {
    pub exe_unit: TableFunctionExecutionUnit,
    pub body: NodeId,
}
