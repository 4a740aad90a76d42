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

//! Collaborators of the driver
//!
//! Code generation, kernels and the cost model live outside this crate. The
//! driver reaches them through these traits:
//!
//! - [`CompiledExecutor`]: runs one execution unit on a device
//! - [`StreamingKernel`]: a unit prepared for batch-at-a-time execution
//! - [`CardinalityCache`]: output sizes remembered per plan fingerprint
//! - [`NdvEstimator`]: distinct value estimation for group-by sizing
//!
//! The translator collaborators are re-exported here for convenience.

use rustc_hash::FxHashMap;

use crate::core::{Error, Result};
use crate::ir::NodeId;
use crate::plan::{ExecutionUnit, TableFunctionExecutionUnit, WorkUnit};
use crate::result_set::ResultSet;

use super::options::{CompilationOptions, ExecutionOptions};
use super::result::PushedDownFilterInfo;
use super::retry::Attempt;
use super::temporary_tables::TemporaryTables;

pub use crate::plan::{ExpressionTranslator, PlanDagExtractor, QueryRewriter, TableInfoProvider};

/// Fragment ids to process, per table id
pub type FragmentsPerTable = FxHashMap<i32, Vec<usize>>;

/// Everything the backend needs to run one unit
#[derive(Debug, Clone, Copy)]
pub struct ExecutionRequest<'a> {
    pub unit: &'a ExecutionUnit,
    pub body: NodeId,
    pub max_groups_buffer_entry_guess: usize,
    /// The unit aggregates (grouped or not)
    pub is_agg: bool,
    /// The entry guess comes from an estimate and can be trusted
    pub has_cardinality_estimation: bool,
    pub co: &'a CompilationOptions,
    pub eo: &'a ExecutionOptions,
    /// Results of earlier steps, readable through negative table ids
    pub temporary_tables: &'a TemporaryTables,
}

/// The compiled-execution engine
///
/// Recoverable failures come back as [`RetryReason`](super::RetryReason)
/// variants; the driver decides whether to retry.
pub trait CompiledExecutor: Send + Sync {
    fn execute_work_unit(&self, request: &ExecutionRequest<'_>) -> Attempt<ResultSet>;

    fn execute_table_function(
        &self,
        _unit: &TableFunctionExecutionUnit,
        _co: &CompilationOptions,
        _eo: &ExecutionOptions,
        _temporary_tables: &TemporaryTables,
    ) -> Attempt<ResultSet> {
        Err(Error::unsupported("Table functions are not supported by this executor").into())
    }

    /// Filters of `work_unit` worth pushing down, with their selectivity
    fn select_filters_to_push_down(
        &self,
        _work_unit: &WorkUnit,
        _co: &CompilationOptions,
        _eo: &ExecutionOptions,
    ) -> Attempt<Vec<PushedDownFilterInfo>> {
        Ok(Vec::new())
    }

    /// Compile `unit` once for batch execution
    fn prepare_streaming(
        &self,
        _unit: &ExecutionUnit,
        _co: &CompilationOptions,
        _eo: &ExecutionOptions,
        _is_agg: bool,
    ) -> Result<Box<dyn StreamingKernel>> {
        Err(Error::unsupported(
            "that query type is not supported in streaming mode",
        ))
    }
}

/// A unit compiled for streaming
pub trait StreamingKernel: Send {
    /// Process the given fragments and return their partial result
    fn run_on_batch(&mut self, fragments: &FragmentsPerTable) -> Result<ResultSet>;

    /// Reduce all batches seen so far
    fn finish(self: Box<Self>) -> Result<ResultSet>;
}

/// Output sizes keyed by plan fingerprint
pub trait CardinalityCache: Send + Sync {
    fn get(&self, key: u64) -> Option<usize>;
    fn put(&self, key: u64, cardinality: usize);
}

/// Estimates the number of distinct groups of a unit
pub trait NdvEstimator: Send + Sync {
    /// `range` is the value range reported by the failed attempt
    fn estimate_ndv(
        &self,
        unit: &ExecutionUnit,
        range: i64,
        is_agg: bool,
        co: &CompilationOptions,
        eo: &ExecutionOptions,
    ) -> Attempt<usize>;
}
