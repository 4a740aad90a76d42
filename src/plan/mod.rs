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

//! Physical planning
//!
//! - [`ExecutionSequence`]: steps of a plan in dependency order
//! - [`ExecutionUnit`] and [`WorkUnit`]: physical description of one step
//! - [`WorkUnitTranslator`]: builds work units from plan nodes

pub mod sequence;
pub mod translator;
pub mod work_unit;

pub use sequence::{ExecutionDescriptor, ExecutionSequence};
pub use translator::{
    decide_approx_count_distinct_implementation, speculative_top_n_key, table_id_of,
    DefaultExpressionTranslator, ExpressionRange, ExpressionTranslator, IdentityRewriter,
    PlanDagExtractor, PlanDagInfo, QueryRewriter, StaticTableInfo, StructuralPlanDagExtractor,
    TableInfoProvider, TranslationContext, TranslatorOptions, WorkUnitTranslator,
    DEFAULT_HLL_PRECISION_BITS,
};
pub use work_unit::{
    ExecutionUnit, InputColDescriptor, InputDescriptor, InputSourceType, JoinCondition,
    SortAlgorithm, SortInfo, TableFunctionExecutionUnit, TableFunctionWorkUnit, WorkUnit,
};
