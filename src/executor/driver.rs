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

//! Relational-algebra execution driver
//!
//! [`RelAlgExecutor`] walks the [`ExecutionSequence`] of a plan, turns every
//! step into a work unit and hands it to the [`CompiledExecutor`]. All retry
//! decisions are taken here:
//!
//! - `QueryMustRunOnCpu`: rerun the step (or the whole query) on CPU
//! - `NativeExecutionError`: rerun a non-aggregating step on the extern path
//! - negative error codes: estimate the group count and rerun with a sized buffer
//! - GPU out-of-memory: disable multifragment kernels, then grow the buffer on CPU
//! - speculative top-N failure: blacklist the shape and sort the exact result
//!
//! Every successful step is registered as a temporary table under `-node_id`.

use std::ops::Range;
use std::sync::Arc;
use std::time::Instant;

use rustc_hash::FxHashMap;
use tracing::{debug, error, info, warn};

use crate::core::{
    error_message_from_code, ColumnType, DataType, Error, ErrorCode, ExecutorDeviceType, Result,
    Value,
};
use crate::ir::{
    AggKind, Expr, LogicalUnionNode, LogicalValuesNode, NodeId, ProjectNode, QueryDag, RelNode,
    SortNode, TableFunctionNode, TargetMetaInfo,
};
use crate::plan::{
    decide_approx_count_distinct_implementation, speculative_top_n_key, ExecutionSequence,
    ExecutionUnit, ExpressionRange, SortAlgorithm, SortInfo, WorkUnit, WorkUnitTranslator,
};
use crate::result_set::{
    Cell, ResultSet, ResultSetBuilder, SpeculativeTopNBlacklist, SpeculativeTopNMap, TargetInfo,
};

use super::backend::{
    CardinalityCache, CompiledExecutor, ExecutionRequest, ExpressionTranslator, NdvEstimator,
    PlanDagExtractor, QueryRewriter, TableInfoProvider,
};
use super::cardinality::InMemoryCardinalityCache;
use super::config::{ExecutorConfig, HIGH_SCAN_LIMIT};
use super::context::{InterruptHandle, QueryContext};
use super::explain::render_plan;
use super::options::{CompilationOptions, ExecutionOptions, ExecutorType, ExplainType};
use super::result::ExecutionResult;
use super::retry::{Attempt, RetryReason};
use super::streaming::StreamingState;
use super::temporary_tables::{temporary_table_key, TemporaryTable, TemporaryTables};

/// Closure invoked after every step and after the whole query
pub type PostExecutionCallback = Box<dyn Fn() + Send + Sync>;

/// Table statistics of the catalog plus the row counts of finished steps
struct DriverTableInfo<'t> {
    tables: &'t dyn TableInfoProvider,
    temporary_tables: &'t TemporaryTables,
}

impl TableInfoProvider for DriverTableInfo<'_> {
    fn num_tuples(&self, table_id: i32) -> Option<usize> {
        if table_id < 0 {
            self.temporary_tables
                .get(table_id)
                .ok()
                .map(TemporaryTable::row_count)
        } else {
            self.tables.num_tuples(table_id)
        }
    }

    fn expression_range(&self, expr: &Expr) -> ExpressionRange {
        self.tables.expression_range(expr)
    }
}

/// Drives the execution of one query plan
pub struct RelAlgExecutor<'a> {
    dag: &'a QueryDag,
    backend: Arc<dyn CompiledExecutor>,
    tables: Arc<dyn TableInfoProvider>,
    config: ExecutorConfig,
    blacklist: Arc<SpeculativeTopNBlacklist>,
    cardinality_cache: Arc<dyn CardinalityCache>,
    ndv_estimator: Option<Arc<dyn NdvEstimator>>,
    expression_translator: Option<Arc<dyn ExpressionTranslator>>,
    rewriter: Option<Arc<dyn QueryRewriter>>,
    plan_extractor: Option<Arc<dyn PlanDagExtractor>>,
    context: QueryContext,
    temporary_tables: TemporaryTables,
    step_results: FxHashMap<NodeId, ExecutionResult>,
    subquery_values: FxHashMap<NodeId, Value>,
    post_execution_callback: Option<PostExecutionCallback>,
    pub(super) streaming: Option<StreamingState>,
}

impl<'a> RelAlgExecutor<'a> {
    pub fn new(
        dag: &'a QueryDag,
        backend: Arc<dyn CompiledExecutor>,
        tables: Arc<dyn TableInfoProvider>,
    ) -> Self {
        let config = ExecutorConfig::default();
        let cardinality_cache = Arc::new(InMemoryCardinalityCache::with_max_entries(
            config.max_cardinality_cache_entries,
        ));
        Self {
            dag,
            backend,
            tables,
            config,
            blacklist: Arc::new(SpeculativeTopNBlacklist::new()),
            cardinality_cache,
            ndv_estimator: None,
            expression_translator: None,
            rewriter: None,
            plan_extractor: None,
            context: QueryContext::new(),
            temporary_tables: TemporaryTables::new(),
            step_results: FxHashMap::default(),
            subquery_values: FxHashMap::default(),
            post_execution_callback: None,
            streaming: None,
        }
    }

    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    /// Share a speculative top-N blacklist across executors
    pub fn with_blacklist(mut self, blacklist: Arc<SpeculativeTopNBlacklist>) -> Self {
        self.blacklist = blacklist;
        self
    }

    pub fn with_cardinality_cache(mut self, cache: Arc<dyn CardinalityCache>) -> Self {
        self.cardinality_cache = cache;
        self
    }

    pub fn with_ndv_estimator(mut self, estimator: Arc<dyn NdvEstimator>) -> Self {
        self.ndv_estimator = Some(estimator);
        self
    }

    pub fn with_expression_translator(mut self, translator: Arc<dyn ExpressionTranslator>) -> Self {
        self.expression_translator = Some(translator);
        self
    }

    pub fn with_rewriter(mut self, rewriter: Arc<dyn QueryRewriter>) -> Self {
        self.rewriter = Some(rewriter);
        self
    }

    pub fn with_plan_extractor(mut self, extractor: Arc<dyn PlanDagExtractor>) -> Self {
        self.plan_extractor = Some(extractor);
        self
    }

    pub fn with_context(mut self, context: QueryContext) -> Self {
        self.context = context;
        self
    }

    pub fn with_post_execution_callback(mut self, callback: PostExecutionCallback) -> Self {
        self.post_execution_callback = Some(callback);
        self
    }

    pub fn dag(&self) -> &'a QueryDag {
        self.dag
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn blacklist(&self) -> &Arc<SpeculativeTopNBlacklist> {
        &self.blacklist
    }

    pub fn temporary_tables(&self) -> &TemporaryTables {
        &self.temporary_tables
    }

    /// Result of an executed step
    pub fn step_result(&self, body: NodeId) -> Option<&ExecutionResult> {
        self.step_results.get(&body)
    }

    pub fn interrupt_handle(&self) -> InterruptHandle {
        self.context.interrupt_handle()
    }

    pub(super) fn backend(&self) -> &Arc<dyn CompiledExecutor> {
        &self.backend
    }

    pub(super) fn context(&self) -> &QueryContext {
        &self.context
    }

    // =========================================================================
    // Collaborators
    // =========================================================================

    fn table_info(&self) -> DriverTableInfo<'_> {
        DriverTableInfo {
            tables: self.tables.as_ref(),
            temporary_tables: &self.temporary_tables,
        }
    }

    /// Run `f` with a translator bound to the current temporary tables
    pub(super) fn with_translator<T>(
        &self,
        f: impl FnOnce(&WorkUnitTranslator<'_>) -> Result<T>,
    ) -> Result<T> {
        let tables = self.table_info();
        let mut translator = WorkUnitTranslator::new(self.dag, &tables)
            .with_subquery_values(&self.subquery_values)
            .with_options(self.config.translator_options());
        if let Some(exprs) = &self.expression_translator {
            translator = translator.with_expression_translator(exprs.as_ref());
        }
        if let Some(rewriter) = &self.rewriter {
            translator = translator.with_rewriter(rewriter.as_ref());
        }
        if let Some(extractor) = &self.plan_extractor {
            translator = translator.with_plan_extractor(extractor.as_ref());
        }
        f(&translator)
    }

    /// Exact COUNT(DISTINCT) where the bitmap is no larger than the HLL sketch
    pub(super) fn decide_approx_count_distinct(&self, unit: &ExecutionUnit) -> ExecutionUnit {
        decide_approx_count_distinct_implementation(
            unit,
            &self.table_info(),
            self.config.approx_count_distinct_bitmap_bits,
        )
    }

    /// Same collaborators, fresh per-query state
    fn subquery_executor(&self) -> RelAlgExecutor<'a> {
        RelAlgExecutor {
            dag: self.dag,
            backend: Arc::clone(&self.backend),
            tables: Arc::clone(&self.tables),
            config: self.config.clone(),
            blacklist: Arc::clone(&self.blacklist),
            cardinality_cache: Arc::clone(&self.cardinality_cache),
            ndv_estimator: self.ndv_estimator.clone(),
            expression_translator: self.expression_translator.clone(),
            rewriter: self.rewriter.clone(),
            plan_extractor: self.plan_extractor.clone(),
            context: self.context.clone(),
            temporary_tables: TemporaryTables::new(),
            step_results: FxHashMap::default(),
            subquery_values: self.subquery_values.clone(),
            post_execution_callback: None,
            streaming: None,
        }
    }

    fn fire_post_execution_callback(&self) {
        if let Some(callback) = &self.post_execution_callback {
            callback();
        }
    }

    // =========================================================================
    // Query
    // =========================================================================

    /// Execute the whole plan
    ///
    /// When a step cannot run on the GPU and per-step retry is disabled, the
    /// whole query is rerun on CPU if the configuration allows it.
    pub fn execute_relalg_query(
        &mut self,
        co: &CompilationOptions,
        eo: &ExecutionOptions,
    ) -> Result<ExecutionResult> {
        let start = Instant::now();
        info!(
            root = self.dag.root(),
            device = ?co.device_type,
            just_explain = eo.just_explain,
            "executing query"
        );
        let result = match self.execute_relalg_query_no_retry(co, eo) {
            Err(RetryReason::QueryMustRunOnCpu) if self.config.allow_cpu_retry => {
                warn!("query unable to run in GPU mode, retrying on CPU");
                self.execute_relalg_query_no_retry(&co.make_cpu_only(), eo)?
            }
            other => other?,
        };
        self.fire_post_execution_callback();
        info!(
            steps = self.step_results.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "query finished"
        );
        Ok(result)
    }

    fn execute_relalg_query_no_retry(
        &mut self,
        co: &CompilationOptions,
        eo: &ExecutionOptions,
    ) -> Attempt<ExecutionResult> {
        if eo.with_dynamic_watchdog || co.with_dynamic_watchdog {
            self.context.reset_interrupt();
        }
        self.context.check_interrupted()?;
        let queue_time_ms = self.context.queue_time_ms();

        let seq = ExecutionSequence::new(self.dag)?;
        debug!(steps = seq.size(), "execution sequence built");
        if eo.just_explain && eo.explain_type == ExplainType::Plan {
            let plan = render_plan(self.dag, &seq)?;
            return Ok(ExecutionResult::new(ResultSet::explain(plan), Vec::new()));
        }
        if !eo.just_explain {
            self.execute_subqueries(co, eo)?;
        }
        self.execute_relalg_seq(&seq, co, eo, queue_time_ms, false)
    }

    /// Execute every scalar subquery and remember its value
    fn execute_subqueries(&mut self, co: &CompilationOptions, eo: &ExecutionOptions) -> Attempt<()> {
        for &root in self.dag.subqueries() {
            if self.subquery_values.contains_key(&root) {
                continue;
            }
            debug!(root, "executing subquery");
            let seq = ExecutionSequence::with_sink(self.dag, root, true)?;
            let mut child = self.subquery_executor();
            let result = child.execute_relalg_seq(&seq, co, eo, 0, false)?;
            let value = scalar_subquery_value(&result)?;
            self.subquery_values.insert(root, value);
        }
        Ok(())
    }

    // =========================================================================
    // Sequences
    // =========================================================================

    /// Execute the steps of `seq` in order
    ///
    /// EXPLAIN only runs the first step, or the first two when the first one
    /// materializes literal rows.
    pub fn execute_relalg_seq(
        &mut self,
        seq: &ExecutionSequence,
        co: &CompilationOptions,
        eo: &ExecutionOptions,
        queue_time_ms: i64,
        with_existing_temp_tables: bool,
    ) -> Attempt<ExecutionResult> {
        if !with_existing_temp_tables {
            self.temporary_tables.clear();
            self.step_results.clear();
        }
        let first = seq
            .get_descriptor(0)
            .ok_or_else(|| Error::internal("empty execution sequence"))?;
        let starts_with_values = matches!(self.dag.node(first.body())?, RelNode::LogicalValues(_));
        let exec_desc_count = if eo.just_explain {
            if starts_with_values {
                seq.size().min(2)
            } else {
                1
            }
        } else {
            seq.size()
        };

        for i in 0..exec_desc_count {
            self.context.check_interrupted()?;
            let mut eo_step = eo.clone();
            if eo.just_explain && starts_with_values && i == 0 {
                eo_step.just_explain = false;
            }
            let body = self.execute_step_with_retry(seq, i, co, &eo_step, queue_time_ms)?;
            self.fire_post_execution_callback();
            if let Some(result) = self.step_results.get(&body) {
                if result.is_filter_push_down_enabled() {
                    return Ok(result.clone());
                }
            }
        }

        let last = seq
            .get_descriptor(exec_desc_count - 1)
            .ok_or_else(|| Error::internal("execution sequence index out of range"))?;
        self.step_results
            .get(&last.body())
            .cloned()
            .ok_or_else(|| Error::internal(format!("no result for step {}", last.body())).into())
    }

    /// Execute the steps in `interval` without clearing earlier results
    pub fn execute_relalg_sub_seq(
        &mut self,
        seq: &ExecutionSequence,
        interval: Range<usize>,
        co: &CompilationOptions,
        eo: &ExecutionOptions,
        queue_time_ms: i64,
    ) -> Result<ExecutionResult> {
        let mut last = None;
        for i in interval {
            self.context.check_interrupted()?;
            let body = match self.execute_relalg_step(seq, i, co, eo, queue_time_ms) {
                Err(RetryReason::QueryMustRunOnCpu) if self.config.allow_query_step_cpu_retry => {
                    warn!(step = i, "step unable to run in GPU mode, retrying on CPU");
                    self.execute_relalg_step(seq, i, &co.make_cpu_only(), eo, queue_time_ms)?
                }
                other => other?,
            };
            last = Some(body);
        }
        let body = last.ok_or_else(|| Error::invalid_argument("empty step interval"))?;
        self.step_results
            .get(&body)
            .cloned()
            .ok_or_else(|| Error::internal(format!("no result for step {}", body)))
    }

    fn execute_step_with_retry(
        &mut self,
        seq: &ExecutionSequence,
        i: usize,
        co: &CompilationOptions,
        eo: &ExecutionOptions,
        queue_time_ms: i64,
    ) -> Attempt<NodeId> {
        match self.execute_relalg_step(seq, i, co, eo, queue_time_ms) {
            Err(RetryReason::QueryMustRunOnCpu) => {
                if !self.config.allow_query_step_cpu_retry {
                    return Err(RetryReason::QueryMustRunOnCpu);
                }
                warn!(step = i, "step unable to run in GPU mode, retrying on CPU");
                self.execute_relalg_step(seq, i, &co.make_cpu_only(), eo, queue_time_ms)
            }
            Err(RetryReason::NativeExecutionError(message)) => {
                if !self.config.enable_interop {
                    return Err(RetryReason::NativeExecutionError(message));
                }
                let body = seq
                    .get_descriptor(i)
                    .ok_or_else(|| Error::internal("execution sequence index out of range"))?
                    .body();
                if is_grouping_step(self.dag.node(body)?) {
                    info!(step = i, "aggregate step cannot use the extern path");
                    return Err(RetryReason::NativeExecutionError(message));
                }
                warn!(step = i, reason = %message, "native execution failed, retrying on the extern path");
                let mut eo_extern = eo.clone();
                eo_extern.executor_type = ExecutorType::Extern;
                self.execute_relalg_step(seq, i, co, &eo_extern, queue_time_ms)
            }
            other => other,
        }
    }

    // =========================================================================
    // Steps
    // =========================================================================

    fn execute_relalg_step(
        &mut self,
        seq: &ExecutionSequence,
        i: usize,
        co: &CompilationOptions,
        eo: &ExecutionOptions,
        queue_time_ms: i64,
    ) -> Attempt<NodeId> {
        let desc = seq
            .get_descriptor(i)
            .ok_or_else(|| Error::internal("execution sequence index out of range"))?;
        let body = desc.body();
        let dag = self.dag;
        let node = dag.node(body)?;
        debug!(step = i, node = body, kind = node.kind().as_str(), device = ?co.device_type, "executing step");

        if let RelNode::Aggregate(aggregate) = node {
            let input_key = temporary_table_key(aggregate.input);
            if aggregate.pass_through && self.temporary_tables.contains(input_key) {
                let rows = self
                    .temporary_tables
                    .get(input_key)?
                    .result_set(0)
                    .cloned()
                    .ok_or(Error::TemporaryTableNotFound(input_key))?;
                debug!(node = body, "skipping pass-through aggregate");
                let result = ExecutionResult::from_shared(rows, dag.output_meta(body)?);
                self.register_step_result(body, result)?;
                return Ok(body);
            }
        }

        let mut eo_step = eo.clone();
        eo_step.with_watchdog = eo.with_watchdog && (i == 0 || matches!(node, RelNode::Project(_)));
        if i > 0 {
            eo_step.outer_fragment_indices.clear();
        }
        eo_step.multifrag_result = eo.allow_multifrag && i + 1 < seq.size();
        let (co_hinted, eo_hinted) = self.handle_hint(node, co, &eo_step);

        let result = match node {
            RelNode::Compound(compound) => {
                let work_unit = self.with_translator(|t| {
                    t.create_compound_work_unit(compound, SortInfo::none(), eo_hinted.just_explain)
                })?;
                self.execute_work_unit(
                    &work_unit,
                    dag.output_meta(body)?,
                    compound.is_agg,
                    &co_hinted,
                    &eo_hinted,
                    queue_time_ms,
                    None,
                )?
            }
            RelNode::Project(project) => {
                self.execute_project(project, seq, i, &co_hinted, &eo_hinted, queue_time_ms)?
            }
            RelNode::Aggregate(aggregate) => {
                let work_unit = self.with_translator(|t| {
                    t.create_aggregate_work_unit(aggregate, SortInfo::none(), eo_hinted.just_explain)
                })?;
                self.execute_work_unit(
                    &work_unit,
                    dag.output_meta(body)?,
                    true,
                    &co_hinted,
                    &eo_hinted,
                    queue_time_ms,
                    None,
                )?
            }
            RelNode::Filter(filter) => {
                let work_unit = self.with_translator(|t| {
                    t.create_filter_work_unit(filter, SortInfo::none(), eo_hinted.just_explain)
                })?;
                self.execute_work_unit(
                    &work_unit,
                    dag.output_meta(body)?,
                    false,
                    &co_hinted,
                    &eo_hinted,
                    queue_time_ms,
                    None,
                )?
            }
            RelNode::Sort(sort) => self.execute_sort(sort, &co_hinted, &eo_hinted, queue_time_ms)?,
            RelNode::LogicalValues(values) => self.execute_logical_values(values, &eo_hinted)?,
            RelNode::LogicalUnion(union) => {
                let eo_union = eo_hinted.clone().with_preserve_order(true);
                self.execute_union(union, co, &eo_union, queue_time_ms)?
            }
            RelNode::TableFunction(table_func) => {
                self.execute_table_function(table_func, &co_hinted, &eo_hinted, queue_time_ms)?
            }
            other => {
                return Err(Error::internal(format!("Unhandled body type: {}", other)).into());
            }
        };

        if result.is_filter_push_down_enabled() {
            self.step_results.insert(body, result);
        } else {
            self.register_step_result(body, result)?;
        }
        Ok(body)
    }

    fn register_step_result(&mut self, body: NodeId, result: ExecutionResult) -> Result<()> {
        if let Some(rows) = result.rows() {
            self.temporary_tables.add(
                temporary_table_key(body),
                TemporaryTable::single(Arc::clone(rows)),
            )?;
        }
        self.step_results.insert(body, result);
        Ok(())
    }

    /// Apply the hints registered for the step; a Sort uses its input's hints
    fn handle_hint(
        &self,
        node: &RelNode,
        co: &CompilationOptions,
        eo: &ExecutionOptions,
    ) -> (CompilationOptions, ExecutionOptions) {
        let target = match node {
            RelNode::Sort(sort) => sort.input,
            other => other.id(),
        };
        let mut co = *co;
        let mut eo = eo.clone();
        if let Some(hint) = self.dag.hint(target) {
            if hint.cpu_mode {
                debug!(node = target, "cpu mode hint");
                co.device_type = ExecutorDeviceType::Cpu;
            }
            if hint.columnar_output {
                eo.output_columnar_hint = true;
            } else if hint.rowwise_output {
                eo.output_columnar_hint = false;
            }
        }
        (co, eo)
    }

    fn execute_project(
        &self,
        project: &ProjectNode,
        seq: &ExecutionSequence,
        i: usize,
        co: &CompilationOptions,
        eo: &ExecutionOptions,
        queue_time_ms: i64,
    ) -> Attempt<ExecutionResult> {
        let dag = self.dag;
        let mut previous_count = None;
        if self.config.skip_intermediate_count && !eo.just_explain && i > 0 {
            if let Some((_, prev)) = seq.get_descriptor_by_body_id(project.input, i - 1) {
                if matches!(
                    dag.node(prev.body())?,
                    RelNode::Compound(_) | RelNode::LogicalValues(_)
                ) {
                    previous_count = self
                        .step_results
                        .get(&prev.body())
                        .and_then(ExecutionResult::rows)
                        .map(|rows| rows.row_count(false));
                }
            }
        }

        let mut work_unit = self.with_translator(|t| {
            t.create_project_work_unit(project, SortInfo::none(), eo.just_explain)
        })?;
        let mut co_project = *co;
        if project.is_simple() && dag.node(project.input)?.is_sort() {
            co_project.device_type = ExecutorDeviceType::Cpu;
            let input = self
                .temporary_tables
                .get(temporary_table_key(project.input))?;
            let row_count = input.row_count();
            work_unit.exe_unit.scan_limit = match input.limit() {
                0 => row_count,
                limit => limit.min(row_count),
            };
        }
        self.execute_work_unit(
            &work_unit,
            dag.output_meta(project.id)?,
            false,
            &co_project,
            eo,
            queue_time_ms,
            previous_count,
        )
    }

    fn execute_union(
        &self,
        union: &LogicalUnionNode,
        co: &CompilationOptions,
        eo: &ExecutionOptions,
        queue_time_ms: i64,
    ) -> Attempt<ExecutionResult> {
        if !union.is_all {
            return Err(Error::unsupported("UNION without ALL is not supported yet.").into());
        }
        let dag = self.dag;
        let mut inputs = union.inputs.iter();
        let first = inputs
            .next()
            .ok_or_else(|| Error::internal("union without inputs"))?;
        let meta = dag.output_meta(*first)?;
        for input in inputs {
            let other = dag.output_meta(*input)?;
            let matching = other.len() == meta.len()
                && meta
                    .iter()
                    .zip(&other)
                    .all(|(a, b)| a.ty.data_type == b.ty.data_type);
            if !matching {
                return Err(Error::type_error(
                    "Subqueries of a UNION must have matching data types.",
                )
                .into());
            }
        }
        for consumer in dag.consumers_of(union.id) {
            if !matches!(
                dag.node(consumer)?,
                RelNode::Project(_) | RelNode::LogicalUnion(_) | RelNode::Aggregate(_)
            ) {
                return Err(Error::unsupported("UNION ALL not yet supported in this context.").into());
            }
        }

        let work_unit = self.with_translator(|t| {
            t.create_union_work_unit(union, SortInfo::none(), eo.just_explain)
        })?;
        self.execute_work_unit(
            &work_unit,
            meta,
            false,
            &co.make_cpu_only(),
            eo,
            queue_time_ms,
            None,
        )
    }

    fn execute_logical_values(
        &self,
        values: &LogicalValuesNode,
        eo: &ExecutionOptions,
    ) -> Attempt<ExecutionResult> {
        if eo.just_explain {
            return Err(Error::unsupported("EXPLAIN not supported for LogicalValues").into());
        }
        let mut tuple_type = values.tuple_type.clone();
        for meta in tuple_type.iter_mut() {
            if meta.ty.is_string() || meta.ty.is_array() {
                return Err(
                    Error::unsupported("Variable length types not supported in VALUES yet.").into(),
                );
            }
            if meta.ty.data_type == DataType::Null {
                meta.ty = ColumnType::not_null(DataType::BigInt);
            }
        }
        let targets = tuple_type
            .iter()
            .map(|meta| TargetInfo::column(meta.ty))
            .collect();
        let mut builder = ResultSetBuilder::projection(targets);
        for row in &values.rows {
            if row.len() != tuple_type.len() {
                return Err(Error::TargetArityMismatch {
                    node: values.id,
                    expected: tuple_type.len(),
                    got: row.len(),
                }
                .into());
            }
            builder.row(row.iter().cloned().map(Cell::Value).collect());
        }
        let rows = builder.device_type(ExecutorDeviceType::Cpu).build()?;
        Ok(ExecutionResult::new(rows, tuple_type))
    }

    fn execute_table_function(
        &self,
        table_func: &TableFunctionNode,
        co: &CompilationOptions,
        eo: &ExecutionOptions,
        queue_time_ms: i64,
    ) -> Attempt<ExecutionResult> {
        let work_unit = self.with_translator(|t| {
            t.create_table_function_work_unit(table_func, eo.just_explain)
        })?;
        let co_cpu = co.make_cpu_only();
        let rows = match self.backend.execute_table_function(
            &work_unit.exe_unit,
            &co_cpu,
            eo,
            &self.temporary_tables,
        ) {
            Err(RetryReason::ExecutionError { code, .. }) => {
                self.handle_persistent_error(code)?;
                return Err(Error::QueryExecution {
                    code,
                    message: "Table function ran out of memory during execution".to_string(),
                }
                .into());
            }
            other => other?,
        };
        let mut result = ExecutionResult::new(rows, table_func.outputs.clone());
        result.set_queue_time(queue_time_ms);
        Ok(result)
    }

    // =========================================================================
    // Sort
    // =========================================================================

    /// Execute the input of `sort` with its ordering, then order and truncate
    ///
    /// A failed speculative top-N blacklists the group key and direction and
    /// runs the step once more through the exact path.
    fn execute_sort(
        &self,
        sort: &SortNode,
        co: &CompilationOptions,
        eo: &ExecutionOptions,
        queue_time_ms: i64,
    ) -> Attempt<ExecutionResult> {
        let mut last_failure = None;
        for _ in 0..2 {
            let mut shape = None;
            match self.execute_sort_query(sort, co, eo, queue_time_ms, &mut shape) {
                Err(RetryReason::Fatal(Error::SpeculativeTopNFailed(reason))) => {
                    let Some((fingerprint, desc)) = shape else {
                        return Err(Error::SpeculativeTopNFailed(reason).into());
                    };
                    warn!(
                        node = sort.id,
                        reason = %reason,
                        "speculative top-n failed, retrying with a full sort"
                    );
                    self.blacklist.add(fingerprint, desc);
                    last_failure = Some(reason);
                }
                other => return other,
            }
        }
        Err(Error::SpeculativeTopNFailed(last_failure.unwrap_or_default()).into())
    }

    fn execute_sort_query(
        &self,
        sort: &SortNode,
        co: &CompilationOptions,
        eo: &ExecutionOptions,
        queue_time_ms: i64,
        shape: &mut Option<(u64, bool)>,
    ) -> Attempt<ExecutionResult> {
        let dag = self.dag;
        let source = dag.node(sort.input)?;
        let work_unit = self.with_translator(|t| {
            t.create_sort_input_work_unit(sort, eo.just_explain, &self.blacklist)
        })?;
        *shape = speculative_top_n_key(&work_unit.exe_unit);

        let mut eo_source = eo.clone();
        eo_source.just_validate = eo.just_validate || sort.limit == Some(0);
        eo_source.outer_fragment_indices.clear();
        let mut result = self.execute_work_unit(
            &work_unit,
            dag.output_meta(sort.input)?,
            source.is_aggregate(),
            co,
            &eo_source,
            queue_time_ms,
            None,
        )?;
        if result.is_filter_push_down_enabled() || eo.just_explain {
            return Ok(result);
        }

        let limit = sort.limit.unwrap_or(0);
        let offset = sort.offset;
        let order_entries = &work_unit.exe_unit.sort_info.order_entries;
        if !sort.collation.is_empty() {
            if use_speculative_top_n(&work_unit.exe_unit, limit) {
                let rows = result
                    .rows()
                    .ok_or_else(|| Error::internal("sort input produced no rows"))?;
                let n = limit + offset;
                let desc = order_entries.first().map(|e| e.is_desc).unwrap_or(false);
                let top = SpeculativeTopNMap::from_result_set(rows, n, desc)?.to_result_set(
                    rows.targets().to_vec(),
                    n,
                    desc,
                )?;
                debug!(node = sort.id, n, "speculative top-n succeeded");
                result = ExecutionResult::new(top, result.targets_meta().to_vec());
                result.set_queue_time(queue_time_ms);
            } else {
                self.context.check_interrupted()?;
                let sort_config = self.config.sort_config();
                let rows = result
                    .rows_mut()
                    .ok_or_else(|| Error::internal("sort input rows are shared"))?;
                if !rows.definitely_has_no_rows() {
                    let top_n = if limit == 0 { 0 } else { limit + offset };
                    rows.sort(order_entries, top_n, &sort_config)?;
                }
            }
        }
        if limit > 0 || offset > 0 {
            let rows = result
                .rows_mut()
                .ok_or_else(|| Error::internal("sort input rows are shared"))?;
            rows.drop_first_n(offset);
            if limit > 0 {
                rows.keep_first_n(limit);
            }
        }
        Ok(result)
    }

    // =========================================================================
    // Work units
    // =========================================================================

    #[allow(clippy::too_many_arguments)]
    fn execute_work_unit(
        &self,
        work_unit: &WorkUnit,
        targets_meta: Vec<TargetMetaInfo>,
        is_agg: bool,
        co: &CompilationOptions,
        eo: &ExecutionOptions,
        queue_time_ms: i64,
        previous_count: Option<usize>,
    ) -> Attempt<ExecutionResult> {
        if eo.find_push_down_candidates && !eo.just_explain {
            let filters = self.backend.select_filters_to_push_down(work_unit, co, eo)?;
            if !filters.is_empty() {
                debug!(node = work_unit.body, candidates = filters.len(), "filter push-down candidates found");
                return Ok(ExecutionResult::push_down(filters, true));
            }
        }

        let mut unit = self.decide_approx_count_distinct(&work_unit.exe_unit);
        let mut eo = eo.clone();

        if compute_output_buffer_size(&unit) {
            match previous_count {
                Some(count) if !unit.has_quals() => unit.scan_limit = count,
                _ => {
                    if self.can_use_bump_allocator(&unit, co, &eo) {
                        unit.scan_limit = 0;
                        unit.use_bump_allocator = true;
                    } else if eo.executor_type == ExecutorType::Extern {
                        unit.scan_limit = 0;
                    } else if !eo.just_explain {
                        if let Some(count) = self.filtered_count_all(&unit, work_unit.body, co, &eo)? {
                            unit.scan_limit = count.max(1);
                        }
                    }
                }
            }
        }

        if can_output_columnar(&unit) {
            if !eo.output_columnar_hint
                && !unit.query_hint.has_layout_hint()
                && self.should_output_columnar(&unit)
            {
                debug!(node = work_unit.body, scan_limit = unit.scan_limit, "large projection, using columnar output");
                eo.output_columnar_hint = true;
            }
        } else {
            eo.output_columnar_hint = false;
        }

        let upper_bound = groups_approx_upper_bound(&unit, &self.table_info());
        let cache_key = unit.query_plan_dag;
        let cached = cache_key.and_then(|key| self.cardinality_cache.get(key));
        let first_attempt = match cached {
            Some(cardinality) => {
                self.execute_and_handle_errors(&unit, work_unit.body, cardinality, true, is_agg, co, &eo)
            }
            None => self.execute_and_handle_errors(
                &unit,
                work_unit.body,
                work_unit.max_groups_buffer_entry_guess,
                upper_bound <= self.config.big_group_threshold,
                is_agg,
                co,
                &eo,
            ),
        };

        let rows = match first_attempt {
            Err(RetryReason::CardinalityEstimationRequired { range }) => {
                match cache_key.and_then(|key| self.cardinality_cache.get(key)) {
                    Some(cardinality) => self.execute_and_handle_errors(
                        &unit,
                        work_unit.body,
                        cardinality,
                        true,
                        is_agg,
                        co,
                        &eo,
                    )?,
                    None => {
                        let ndv = match &self.ndv_estimator {
                            Some(estimator) => estimator.estimate_ndv(&unit, range, is_agg, co, &eo)?,
                            None => 0,
                        };
                        let estimate = if ndv > 0 {
                            ndv.saturating_mul(2)
                        } else {
                            upper_bound.min(self.config.estimator_failure_max_groupby_size)
                        }
                        .max(1);
                        warn!(
                            node = work_unit.body,
                            ndv,
                            entry_guess = estimate,
                            "output buffer too small, retrying with estimated group count"
                        );
                        let rows = self.execute_and_handle_errors(
                            &unit,
                            work_unit.body,
                            estimate,
                            true,
                            is_agg,
                            co,
                            &eo,
                        )?;
                        if !(eo.just_validate || eo.just_explain) {
                            if let Some(key) = cache_key {
                                self.cardinality_cache.put(key, estimate);
                            }
                        }
                        rows
                    }
                }
            }
            other => other?,
        };

        let mut result = ExecutionResult::new(rows, targets_meta);
        result.set_queue_time(queue_time_ms);
        Ok(result)
    }

    #[allow(clippy::too_many_arguments)]
    fn execute_and_handle_errors(
        &self,
        unit: &ExecutionUnit,
        body: NodeId,
        max_groups_buffer_entry_guess: usize,
        has_cardinality_estimation: bool,
        is_agg: bool,
        co: &CompilationOptions,
        eo: &ExecutionOptions,
    ) -> Attempt<ResultSet> {
        let request = ExecutionRequest {
            unit,
            body,
            max_groups_buffer_entry_guess,
            is_agg,
            has_cardinality_estimation,
            co,
            eo,
            temporary_tables: &self.temporary_tables,
        };
        debug!(
            node = body,
            device = ?co.device_type,
            entry_guess = max_groups_buffer_entry_guess,
            "executing work unit"
        );
        match self.backend.execute_work_unit(&request) {
            Err(RetryReason::ExecutionError {
                code,
                was_multifrag_kernel_launch,
            }) => {
                if !has_cardinality_estimation && code < 0 {
                    return Err(RetryReason::CardinalityEstimationRequired { range: 0 });
                }
                self.handle_persistent_error(code)?;
                self.handle_out_of_memory_retry(
                    unit,
                    body,
                    max_groups_buffer_entry_guess,
                    is_agg,
                    co,
                    eo,
                    was_multifrag_kernel_launch,
                )
            }
            other => other,
        }
    }

    /// Fatal unless the code is a GPU out-of-memory that may move to CPU
    fn handle_persistent_error(&self, code: i32) -> Attempt<()> {
        let message = error_message_from_code(code);
        error!(code, message = %message, "query execution failed");
        if code == ErrorCode::OutOfGpuMem.code() {
            if !self.config.allow_cpu_retry {
                return Err(Error::OutOfGpuMemory.into());
            }
            info!("query ran out of GPU memory, attempting punt to CPU");
            return Ok(());
        }
        Err(Error::query_execution(code).into())
    }

    /// Retry a unit that ran out of memory
    ///
    /// Disables the bump allocator, retries once with multifragment kernels
    /// disabled when the failed launch used them, then retries on CPU with a
    /// growing output buffer.
    #[allow(clippy::too_many_arguments)]
    fn handle_out_of_memory_retry(
        &self,
        unit: &ExecutionUnit,
        body: NodeId,
        max_groups_buffer_entry_guess: usize,
        is_agg: bool,
        co: &CompilationOptions,
        eo: &ExecutionOptions,
        was_multifrag_kernel_launch: bool,
    ) -> Attempt<ResultSet> {
        let mut unit = unit.clone();
        unit.use_bump_allocator = false;
        let mut eo_no_multifrag = eo.clone();
        eo_no_multifrag.allow_multifrag = false;
        eo_no_multifrag.just_explain = false;
        eo_no_multifrag.find_push_down_candidates = false;

        if was_multifrag_kernel_launch {
            warn!(node = body, "multifragment kernel ran out of memory, retrying with multifragment kernels disabled");
            let request = ExecutionRequest {
                unit: &unit,
                body,
                max_groups_buffer_entry_guess,
                is_agg,
                has_cardinality_estimation: true,
                co,
                eo: &eo_no_multifrag,
                temporary_tables: &self.temporary_tables,
            };
            match self.backend.execute_work_unit(&request) {
                Ok(rows) => return Ok(rows),
                Err(RetryReason::ExecutionError { code, .. }) => {
                    self.handle_persistent_error(code)?;
                    warn!(node = body, "kernel per fragment query ran out of memory, retrying on CPU");
                }
                Err(other) => return Err(other),
            }
        }

        let co_cpu = co.make_cpu_only();
        let mut guess = 0usize;
        let mut growth = 0usize;
        loop {
            self.context.check_interrupted()?;
            let request = ExecutionRequest {
                unit: &unit,
                body,
                max_groups_buffer_entry_guess: guess,
                is_agg,
                has_cardinality_estimation: true,
                co: &co_cpu,
                eo: &eo_no_multifrag,
                temporary_tables: &self.temporary_tables,
            };
            match self.backend.execute_work_unit(&request) {
                Ok(rows) => return Ok(rows),
                Err(reason)
                    if reason.is_out_of_slots()
                        || matches!(reason, RetryReason::CardinalityEstimationRequired { .. }) =>
                {
                    if self.config.watchdog_enabled && growth >= 2 {
                        return Err(Error::OutOfOutputSlots.into());
                    }
                    guess = if guess == 0 {
                        self.config.default_max_groups_buffer_entry_guess.max(1)
                    } else {
                        guess.checked_mul(2).ok_or(Error::OutOfOutputSlots)?
                    };
                    growth += 1;
                    warn!(
                        node = body,
                        entry_guess = guess,
                        "query ran out of slots in the output buffer, retrying with a larger entry guess"
                    );
                }
                Err(RetryReason::ExecutionError { code, .. }) => {
                    self.handle_persistent_error(code)?;
                    return Err(Error::query_execution(code).into());
                }
                Err(other) => return Err(other),
            }
        }
    }

    fn can_use_bump_allocator(&self, unit: &ExecutionUnit, co: &CompilationOptions, eo: &ExecutionOptions) -> bool {
        self.config.enable_bump_allocator
            && co.device_type == ExecutorDeviceType::Gpu
            && !eo.output_columnar_hint
            && !eo.with_watchdog
            && unit.sort_info.order_entries.is_empty()
    }

    fn should_output_columnar(&self, unit: &ExecutionUnit) -> bool {
        self.config.columnar_large_projections
            && unit.is_projection()
            && unit.sort_info.order_entries.is_empty()
            && unit.scan_limit >= self.config.columnar_large_projections_threshold
    }

    /// Row count of the unit's filtered input, used to size a projection
    fn filtered_count_all(
        &self,
        unit: &ExecutionUnit,
        body: NodeId,
        co: &CompilationOptions,
        eo: &ExecutionOptions,
    ) -> Attempt<Option<usize>> {
        let mut count_unit = unit.clone();
        count_unit.groupby_exprs = vec![None];
        count_unit.target_exprs = vec![Expr::agg(
            AggKind::Count,
            None,
            false,
            None,
            ColumnType::not_null(DataType::BigInt),
        )];
        count_unit.sort_info = SortInfo::none();
        count_unit.scan_limit = 0;
        count_unit.use_bump_allocator = false;
        let request = ExecutionRequest {
            unit: &count_unit,
            body,
            max_groups_buffer_entry_guess: 1,
            is_agg: true,
            has_cardinality_estimation: false,
            co,
            eo,
            temporary_tables: &self.temporary_tables,
        };
        let rows = match self.backend.execute_work_unit(&request) {
            Ok(rows) => rows,
            Err(RetryReason::QueryMustRunOnCpu) => return Err(RetryReason::QueryMustRunOnCpu),
            Err(other) => {
                warn!(node = body, error = %other, "failed to run pre-flight filtered count");
                return Ok(None);
            }
        };
        let count = rows
            .rows(false)?
            .first()
            .and_then(|row| row.first())
            .and_then(Value::as_int64);
        match count {
            Some(count) if count >= 0 => Ok(Some(count as usize)),
            _ => {
                warn!(node = body, "pre-flight filtered count returned no value");
                Ok(None)
            }
        }
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Compound or Aggregate steps that group or aggregate
fn is_grouping_step(node: &RelNode) -> bool {
    match node {
        RelNode::Compound(compound) => compound.group_key_count > 0 || compound.is_agg,
        RelNode::Aggregate(_) => true,
        _ => false,
    }
}

/// Projections without a usable scan limit need their output sized
fn compute_output_buffer_size(unit: &ExecutionUnit) -> bool {
    if unit.has_agg_targets() {
        return false;
    }
    unit.is_projection() && (unit.scan_limit == 0 || unit.scan_limit > HIGH_SCAN_LIMIT)
}

/// Columnar projections cannot carry variable length values
fn can_output_columnar(unit: &ExecutionUnit) -> bool {
    if !unit.is_projection() {
        return true;
    }
    !unit.target_exprs.iter().any(|t| t.ty.is_varlen())
}

/// Largest input of the unit; unknown inputs make the bound unknown
fn groups_approx_upper_bound(unit: &ExecutionUnit, tables: &dyn TableInfoProvider) -> usize {
    let mut bound = 0usize;
    for desc in &unit.input_descs {
        match tables.num_tuples(desc.table_id) {
            Some(n) => bound = bound.max(n),
            None => return usize::MAX,
        }
    }
    bound
}

/// `SELECT k, COUNT(*) ... GROUP BY k ORDER BY 2 LIMIT n` over integer keys
fn use_speculative_top_n(unit: &ExecutionUnit, limit: usize) -> bool {
    if unit.sort_info.algorithm != SortAlgorithm::SpeculativeTopN || limit == 0 {
        return false;
    }
    if !matches!(unit.groupby_exprs.as_slice(), [Some(_)]) || unit.target_exprs.len() != 2 {
        return false;
    }
    let key = &unit.target_exprs[0];
    let count = &unit.target_exprs[1];
    let integer_key = key.ty.data_type.is_integer() || key.ty.data_type == DataType::DictText;
    integer_key
        && count.agg_kind() == Some(AggKind::Count)
        && !count.is_distinct_agg()
        && matches!(unit.sort_info.order_entries.first(), Some(entry) if entry.target_idx() == 1)
}

/// The single value of a scalar subquery result
fn scalar_subquery_value(result: &ExecutionResult) -> Result<Value> {
    let rows = result
        .rows()
        .ok_or_else(|| Error::internal("Scalar sub-query produced no result"))?;
    if rows.col_count() != 1 {
        return Err(Error::internal(format!(
            "Scalar sub-query returned {} columns",
            rows.col_count()
        )));
    }
    let mut values = rows.rows(true)?;
    match values.len() {
        0 => Ok(Value::null(rows.col_type(0)?.data_type)),
        1 => values
            .pop()
            .and_then(|mut row| row.pop())
            .ok_or_else(|| Error::internal("Scalar sub-query returned an empty row")),
        _ => Err(Error::internal("Scalar sub-query returned multiple rows")),
    }
}
