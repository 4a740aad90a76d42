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

//! # raexec - Relational-algebra execution driver
//!
//! raexec turns an optimized relational-algebra plan into a sequence of
//! executable steps, hands each step to a compiled-execution backend and
//! collects the output into result sets that can be sorted, truncated and
//! iterated.
//!
//! ## Key Features
//!
//! - **Execution sequences** - Topological step ordering with sort and join folding
//! - **Work units** - Backend-neutral descriptions of each step
//! - **Retry state machine** - CPU fallback, cardinality estimation and OOM growth
//! - **Result sets** - Row-wise and columnar layouts with lazy LIMIT/OFFSET
//! - **Sorting** - Full sort, parallel top-N and speculative top-N with a blacklist
//!
//! ## Quick Start
//!
//! ```rust
//! use raexec::core::ColumnType;
//! use raexec::ir::{QueryDagBuilder, RexExpr, TargetMetaInfo};
//! use raexec::plan::ExecutionSequence;
//!
//! let mut b = QueryDagBuilder::new();
//! let scan = b.scan(1, "t", vec![TargetMetaInfo::new("a", ColumnType::bigint())]);
//! let project = b.project(scan, vec![RexExpr::input(scan, 0)]);
//! let dag = b.build(project).unwrap();
//!
//! let seq = ExecutionSequence::new(&dag).unwrap();
//! assert_eq!(seq.size(), 1);
//! ```
//!
//! ## Modules
//!
//! - [`core`] - Core types ([`DataType`], [`ColumnType`], [`Value`], [`Error`])
//! - [`ir`] - Relational-algebra plan ([`ir::QueryDag`])
//! - [`plan`] - Execution sequences and work units
//! - [`executor`] - Execution driver ([`executor::RelAlgExecutor`])
//! - [`result_set`] - Result sets and the sort engine ([`result_set::ResultSet`])

pub mod core;
pub mod executor;
pub mod ir;
pub mod plan;
pub mod result_set;

// Re-export main types for convenience
pub use core::{ColumnType, DataType, Error, ErrorCode, ExecutorDeviceType, Result, Value};

// Re-export plan types
pub use ir::{QueryDag, QueryDagBuilder, RelNode};
pub use plan::{ExecutionSequence, ExecutionUnit, WorkUnit, WorkUnitTranslator};

// Re-export executor types
pub use executor::{
    Attempt, CompilationOptions, CompiledExecutor, ExecutionOptions, ExecutionResult,
    ExecutorConfig, RelAlgExecutor, RetryReason,
};

// Re-export result set types
pub use result_set::{OrderEntry, ResultSet, ResultSetBuilder, SortConfig, TargetInfo};
