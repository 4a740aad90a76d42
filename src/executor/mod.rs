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

//! Query execution driver
//!
//! The driver runs a query plan step by step against a compiled-execution
//! backend and recovers from the failures the backend reports.
//!
//! # Architecture
//!
//! ```text
//! QueryDag
//!   ↓
//! ExecutionSequence (one step per materialized node)
//!   ↓
//! WorkUnitTranslator (step -> ExecutionUnit)
//!   ↓
//! CompiledExecutor (backend, returns Attempt<ResultSet>)
//!   ↓
//! retry: CPU fallback, extern path, cardinality estimation, OOM growth
//!   ↓
//! TemporaryTables (step result, readable as table -node_id)
//! ```
//!
//! # Components
//!
//! - [`RelAlgExecutor`] - Runs a plan and owns the retry state machine
//! - [`CompiledExecutor`] - Backend seam used for every work unit
//! - [`RetryReason`] / [`Attempt`] - Recoverable failures of a backend call
//! - [`ExecutorConfig`] - Retry, sizing and sort knobs
//! - [`ExecutionResult`] - Rows plus output metadata of a query or step

pub mod backend;
pub mod cardinality;
pub mod config;
pub mod context;
pub mod driver;
pub mod explain;
pub mod options;
pub mod result;
pub mod retry;
pub mod temporary_tables;

mod streaming;

pub use backend::{
    CardinalityCache, CompiledExecutor, ExecutionRequest, ExpressionTranslator, FragmentsPerTable,
    NdvEstimator, PlanDagExtractor, QueryRewriter, StreamingKernel, TableInfoProvider,
};
pub use cardinality::InMemoryCardinalityCache;
pub use config::{
    ExecutorConfig, DEFAULT_BIG_GROUP_THRESHOLD, DEFAULT_COLUMNAR_LARGE_PROJECTIONS_THRESHOLD,
    DEFAULT_ESTIMATOR_FAILURE_MAX_GROUPBY_SIZE, DEFAULT_MAX_CARDINALITY_CACHE_ENTRIES,
    DEFAULT_MAX_GROUPS_BUFFER_ENTRY_GUESS, DEFAULT_PARALLEL_ROW_COUNT_THRESHOLD, HIGH_SCAN_LIMIT,
};
pub use context::{InterruptHandle, QueryContext};
pub use driver::{PostExecutionCallback, RelAlgExecutor};
pub use explain::render_plan;
pub use options::{CompilationOptions, ExecutionOptions, ExecutorType, ExplainType};
pub use result::{ExecutionResult, PushedDownFilterInfo};
pub use retry::{Attempt, RetryReason};
pub use temporary_tables::{temporary_table_key, TemporaryTable, TemporaryTables};
