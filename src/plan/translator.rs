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

//! Work-unit translation
//!
//! Turns one plan node into an [`ExecutionUnit`]. Every node kind goes through
//! the same steps:
//!
//! 1. Bind the inputs of the node's data sink to nest levels. A node reading a
//!    join binds the join's inputs; every other node binds its own inputs.
//!    Left-deep joins without LEFT joins may have their inputs reordered so the
//!    largest table is scanned in the outer loop.
//! 2. Translate planner expressions against that binding.
//! 3. Collect the input columns the unit reads, deduplicated and ordered by
//!    (nest level, column id, table id).
//! 4. Let the [`QueryRewriter`] fold the unit.
//! 5. Attach a plan fingerprint when the [`PlanDagExtractor`] produced a valid one.
//!
//! A Sort never becomes a unit of its own.
//! [`WorkUnitTranslator::create_sort_input_work_unit`] builds the unit of the
//! sort's source and carries the ordering in its [`SortInfo`].

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::debug;

use crate::core::{DataType, Error, Result, Value};
use crate::ir::{
    AggKind, AggregateNode, CompoundNode, Expr, ExprKind, FilterNode, JoinType, LogicalUnionNode,
    NodeId, ProjectNode, QueryDag, QueryHint, RelNode, RexExpr, SortNode, TableFunctionNode,
};
use crate::result_set::{OrderEntry, SpeculativeTopNBlacklist};

use super::work_unit::{
    ExecutionUnit, InputColDescriptor, InputDescriptor, JoinCondition, SortAlgorithm, SortInfo,
    TableFunctionExecutionUnit, TableFunctionWorkUnit, WorkUnit,
};

/// Default number of precision bits of an approximate distinct count
pub const DEFAULT_HLL_PRECISION_BITS: u32 = 11;

// =============================================================================
// Collaborators
// =============================================================================

/// Binds planner expressions to the nest levels of a unit
pub trait ExpressionTranslator: Send + Sync {
    fn translate(&self, expr: &RexExpr, ctx: &TranslationContext<'_>) -> Result<Arc<Expr>>;
}

/// Structural translation with no constant folding
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultExpressionTranslator;

impl ExpressionTranslator for DefaultExpressionTranslator {
    fn translate(&self, expr: &RexExpr, ctx: &TranslationContext<'_>) -> Result<Arc<Expr>> {
        match expr {
            RexExpr::Input { source, index } => ctx.resolve_input(*source, *index),
            RexExpr::Literal { value, ty } => Ok(Expr::constant(value.clone(), *ty)),
            RexExpr::Operator { op, operands, ty } => {
                let args = operands
                    .iter()
                    .map(|operand| self.translate(operand, ctx))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Expr::function(op.clone(), args, *ty))
            }
            RexExpr::Agg(agg) => {
                let arg = match &agg.operand {
                    Some(operand) => Some(self.translate(operand, ctx)?),
                    None => None,
                };
                Ok(Expr::agg(agg.kind, arg, agg.distinct, agg.quantile, agg.ty))
            }
            RexExpr::ScalarSubquery { root, ty } => match ctx.subquery_value(*root) {
                Some(value) => Ok(Expr::constant(value.clone(), *ty)),
                // EXPLAIN never runs subqueries
                None if ctx.just_explain() => Ok(Expr::constant(Value::null(ty.data_type), *ty)),
                None => Err(Error::internal(format!(
                    "scalar subquery {} has not been executed",
                    root
                ))),
            },
        }
    }
}

/// Simplifies a freshly built unit
pub trait QueryRewriter: Send + Sync {
    fn rewrite(&self, unit: ExecutionUnit) -> Result<ExecutionUnit>;
}

/// Returns units unchanged
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityRewriter;

impl QueryRewriter for IdentityRewriter {
    fn rewrite(&self, unit: ExecutionUnit) -> Result<ExecutionUnit> {
        Ok(unit)
    }
}

/// Plan fingerprint of a unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PlanDagInfo {
    pub fingerprint: Option<u64>,
    pub contains_unsupported_node: bool,
}

impl PlanDagInfo {
    /// Only complete, non-empty fingerprints may key a cache
    pub fn is_valid(&self) -> bool {
        !self.contains_unsupported_node && matches!(self.fingerprint, Some(f) if f != 0)
    }
}

/// Extracts a cache fingerprint of the plan below a node
pub trait PlanDagExtractor: Send + Sync {
    fn extract(&self, dag: &QueryDag, node: NodeId, unit: &ExecutionUnit) -> PlanDagInfo;
}

/// Hashes the kinds and base tables of the subtree plus the unit's own cache key
///
/// Table functions have no stable identity and make the fingerprint invalid.
#[derive(Debug, Default, Clone, Copy)]
pub struct StructuralPlanDagExtractor;

impl PlanDagExtractor for StructuralPlanDagExtractor {
    fn extract(&self, dag: &QueryDag, node: NodeId, unit: &ExecutionUnit) -> PlanDagInfo {
        let mut hasher = DefaultHasher::new();
        let mut info = PlanDagInfo::default();
        let mut visited = FxHashSet::default();
        let mut stack = vec![node];
        while let Some(id) = stack.pop() {
            if !visited.insert(id) {
                continue;
            }
            let Ok(current) = dag.node(id) else {
                info.contains_unsupported_node = true;
                continue;
            };
            current.kind().as_str().hash(&mut hasher);
            match current {
                RelNode::Scan(scan) => scan.table_id.hash(&mut hasher),
                RelNode::TableFunction(_) => info.contains_unsupported_node = true,
                _ => {}
            }
            stack.extend(current.inputs());
        }
        unit.cache_key().hash(&mut hasher);
        info.fingerprint = Some(hasher.finish());
        info
    }
}

/// Value range of an expression, used to size distinct-count bitmaps
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ExpressionRange {
    Integer { min: i64, max: i64 },
    Float { min: f64, max: f64 },
    Invalid,
}

/// Table statistics consumed by translation and buffer sizing
pub trait TableInfoProvider: Send + Sync {
    /// Upper bound on the rows of a base table (`id > 0`) or temporary table
    fn num_tuples(&self, table_id: i32) -> Option<usize>;

    fn expression_range(&self, _expr: &Expr) -> ExpressionRange {
        ExpressionRange::Invalid
    }
}

/// Fixed statistics, handy for embedding and tests
#[derive(Debug, Clone, Default)]
pub struct StaticTableInfo {
    tuples: FxHashMap<i32, usize>,
    column_ranges: FxHashMap<(i32, usize), ExpressionRange>,
}

impl StaticTableInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(mut self, table_id: i32, num_tuples: usize) -> Self {
        self.tuples.insert(table_id, num_tuples);
        self
    }

    pub fn with_column_range(mut self, table_id: i32, column_id: usize, range: ExpressionRange) -> Self {
        self.column_ranges.insert((table_id, column_id), range);
        self
    }
}

impl TableInfoProvider for StaticTableInfo {
    fn num_tuples(&self, table_id: i32) -> Option<usize> {
        self.tuples.get(&table_id).copied()
    }

    fn expression_range(&self, expr: &Expr) -> ExpressionRange {
        match &expr.kind {
            ExprKind::Column {
                table_id,
                column_id,
                ..
            } => self
                .column_ranges
                .get(&(*table_id, *column_id))
                .copied()
                .unwrap_or(ExpressionRange::Invalid),
            _ => ExpressionRange::Invalid,
        }
    }
}

// =============================================================================
// Translation context
// =============================================================================

/// Nest-level binding handed to the [`ExpressionTranslator`]
#[derive(Debug)]
pub struct TranslationContext<'a> {
    dag: &'a QueryDag,
    node: NodeId,
    sink: NodeId,
    sink_inputs: &'a [NodeId],
    nest_levels: &'a FxHashMap<NodeId, usize>,
    subquery_values: Option<&'a FxHashMap<NodeId, Value>>,
    just_explain: bool,
}

impl<'a> TranslationContext<'a> {
    pub fn dag(&self) -> &'a QueryDag {
        self.dag
    }

    /// Node the unit is built for
    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn nest_level(&self, source: NodeId) -> Option<usize> {
        self.nest_levels.get(&source).copied()
    }

    pub fn just_explain(&self) -> bool {
        self.just_explain
    }

    pub fn subquery_value(&self, root: NodeId) -> Option<&'a Value> {
        self.subquery_values.and_then(|values| values.get(&root))
    }

    /// Column `index` of the output of `source`, bound to its nest level
    ///
    /// A column of the join being read is resolved to the join input that
    /// produced it.
    pub fn resolve_input(&self, source: NodeId, index: usize) -> Result<Arc<Expr>> {
        if let Some(level) = self.nest_level(source) {
            let input = self.dag.node(source)?;
            let meta = self.dag.output_meta(source)?;
            let ty = meta
                .get(index)
                .map(|m| m.ty)
                .ok_or(Error::ColumnIndexOutOfBounds { index })?;
            return Ok(Expr::column(table_id_of(input), index, level, ty));
        }
        if source == self.sink && self.sink != self.node {
            let mut offset = index;
            for input in self.sink_inputs {
                let width = self.dag.output_meta(*input)?.len();
                if offset < width {
                    return self.resolve_input(*input, offset);
                }
                offset -= width;
            }
            return Err(Error::ColumnIndexOutOfBounds { index });
        }
        Err(Error::unsupported("Bushy joins not supported"))
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Base table id of a scan, `-id` for any other node
pub fn table_id_of(node: &RelNode) -> i32 {
    match node {
        RelNode::Scan(scan) => scan.table_id,
        other => -(other.id() as i32),
    }
}

/// The node whose inputs get nest levels
fn data_sink<'d>(dag: &'d QueryDag, node: &'d RelNode) -> Result<&'d RelNode> {
    match node {
        RelNode::TableFunction(_) | RelNode::Join(_) | RelNode::LogicalUnion(_) => Ok(node),
        _ => {
            let inputs = node.inputs();
            if inputs.len() != 1 {
                return Err(Error::InputCountMismatch {
                    node: node.id(),
                    kind: node.kind().as_str(),
                    expected: 1,
                    got: inputs.len(),
                });
            }
            let source = dag.node(inputs[0])?;
            Ok(if source.is_join() { source } else { node })
        }
    }
}

fn collect_columns(expr: &Expr, out: &mut FxHashSet<InputColDescriptor>) {
    match &expr.kind {
        ExprKind::Column {
            table_id,
            column_id,
            nest_level,
        } => {
            out.insert(InputColDescriptor::new(
                *table_id,
                *column_id,
                *nest_level,
                expr.ty,
            ));
        }
        ExprKind::Constant(_) => {}
        ExprKind::Function { args, .. } => {
            for arg in args {
                collect_columns(arg, out);
            }
        }
        ExprKind::Agg { arg, .. } => {
            if let Some(arg) = arg {
                collect_columns(arg, out);
            }
        }
    }
}

fn ordered_col_descs(cols: FxHashSet<InputColDescriptor>) -> Vec<InputColDescriptor> {
    let mut out: Vec<InputColDescriptor> = cols.into_iter().collect();
    out.sort_by_key(|c| c.sort_key());
    out
}

/// Columns read by any expression of the unit
fn used_input_columns(unit: &ExecutionUnit) -> Vec<InputColDescriptor> {
    let mut cols = FxHashSet::default();
    let join_quals = unit.join_quals.iter().flat_map(|j| j.quals.iter());
    let group_keys = unit.groupby_exprs.iter().flatten();
    for expr in unit
        .simple_quals
        .iter()
        .chain(&unit.quals)
        .chain(join_quals)
        .chain(group_keys)
        .chain(&unit.target_exprs)
    {
        collect_columns(expr, &mut cols);
    }
    ordered_col_descs(cols)
}

/// A conjunct over exactly one column and constants
fn is_simple_qual(expr: &Expr) -> bool {
    if !matches!(expr.kind, ExprKind::Function { .. }) {
        return false;
    }
    let mut first = None;
    let mut simple = true;
    expr.for_each_column(&mut |table_id, column_id, level| {
        let current = (table_id, column_id, level);
        if let Some(seen) = first {
            simple &= seen == current;
        } else {
            first = Some(current);
        }
    });
    simple && first.is_some()
}

fn is_true_literal(expr: &Expr) -> bool {
    matches!(expr.kind, ExprKind::Constant(Value::Boolean(true)))
}

fn order_entries(sort: &SortNode) -> Vec<OrderEntry> {
    sort.collation
        .iter()
        .map(|field| OrderEntry::new(field.field + 1, field.descending, field.nulls_first))
        .collect()
}

fn first_entry_is_desc(entries: &[OrderEntry]) -> bool {
    entries.first().is_some_and(|e| e.is_desc)
}

/// Grouped sources produce all their groups regardless of LIMIT
fn scan_limit_for(source: &RelNode, limit: usize) -> usize {
    if source.is_aggregate() {
        0
    } else {
        limit
    }
}

/// Bytes of a bitmap of `bits` bits, padded to 8 bytes
fn bitmap_padded_bytes(bits: u64) -> u64 {
    bits.div_ceil(8).next_multiple_of(8)
}

/// Replace APPROX_COUNT_DISTINCT by an exact COUNT(DISTINCT) whenever the exact
/// bitmap over the argument's value range is no larger than the approximate one
pub fn decide_approx_count_distinct_implementation(
    unit: &ExecutionUnit,
    tables: &dyn TableInfoProvider,
    hll_precision_bits: u32,
) -> ExecutionUnit {
    let mut unit = unit.clone();
    for target in unit.target_exprs.iter_mut() {
        if target.agg_kind() != Some(AggKind::ApproxCountDistinct) {
            continue;
        }
        let Some(arg) = target.agg_arg().cloned() else {
            continue;
        };
        let data_type = arg.ty.data_type;
        let has_range = data_type.is_number()
            || matches!(
                data_type,
                DataType::Boolean | DataType::Date | DataType::Timestamp | DataType::DictText
            );
        if !has_range {
            continue;
        }
        let ExpressionRange::Integer { min, max } = tables.expression_range(&arg) else {
            continue;
        };
        if max < min {
            continue;
        }
        let precise_bits = (max as i128 - min as i128 + 1).min(u64::MAX as i128) as u64;
        let approx_bytes = 1u64 << hll_precision_bits.min(63);
        if approx_bytes.next_multiple_of(8) >= bitmap_padded_bytes(precise_bits) {
            debug!(
                range_min = min,
                range_max = max,
                "approximate distinct count replaced by an exact one"
            );
            *target = Expr::agg(AggKind::Count, Some(arg), true, None, target.ty);
        }
    }
    unit
}

// =============================================================================
// Translator
// =============================================================================

/// Knobs of the translator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TranslatorOptions {
    /// Reorder left-deep join inputs by size
    pub from_table_reordering: bool,
    pub default_max_groups_buffer_entry_guess: usize,
    /// Hint used for nodes without a registered one
    pub default_hint: QueryHint,
}

impl Default for TranslatorOptions {
    fn default() -> Self {
        Self {
            from_table_reordering: true,
            default_max_groups_buffer_entry_guess: 16_384,
            default_hint: QueryHint::default(),
        }
    }
}

/// Inputs of a data sink bound to nest levels
#[derive(Debug)]
struct InputBinding {
    sink: NodeId,
    sink_inputs: Vec<NodeId>,
    permutation: Vec<usize>,
    nest_levels: FxHashMap<NodeId, usize>,
    input_descs: Vec<InputDescriptor>,
}

static DEFAULT_EXPRESSIONS: DefaultExpressionTranslator = DefaultExpressionTranslator;
static IDENTITY_REWRITER: IdentityRewriter = IdentityRewriter;
static STRUCTURAL_EXTRACTOR: StructuralPlanDagExtractor = StructuralPlanDagExtractor;

/// Builds work units for the nodes of one plan
pub struct WorkUnitTranslator<'a> {
    dag: &'a QueryDag,
    tables: &'a dyn TableInfoProvider,
    exprs: &'a dyn ExpressionTranslator,
    rewriter: &'a dyn QueryRewriter,
    plan_extractor: &'a dyn PlanDagExtractor,
    subquery_values: Option<&'a FxHashMap<NodeId, Value>>,
    options: TranslatorOptions,
}

impl<'a> WorkUnitTranslator<'a> {
    pub fn new(dag: &'a QueryDag, tables: &'a dyn TableInfoProvider) -> Self {
        Self {
            dag,
            tables,
            exprs: &DEFAULT_EXPRESSIONS,
            rewriter: &IDENTITY_REWRITER,
            plan_extractor: &STRUCTURAL_EXTRACTOR,
            subquery_values: None,
            options: TranslatorOptions::default(),
        }
    }

    pub fn with_expression_translator(mut self, exprs: &'a dyn ExpressionTranslator) -> Self {
        self.exprs = exprs;
        self
    }

    pub fn with_rewriter(mut self, rewriter: &'a dyn QueryRewriter) -> Self {
        self.rewriter = rewriter;
        self
    }

    pub fn with_plan_extractor(mut self, extractor: &'a dyn PlanDagExtractor) -> Self {
        self.plan_extractor = extractor;
        self
    }

    /// Values of already executed scalar subqueries
    pub fn with_subquery_values(mut self, values: &'a FxHashMap<NodeId, Value>) -> Self {
        self.subquery_values = Some(values);
        self
    }

    pub fn with_options(mut self, options: TranslatorOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> &TranslatorOptions {
        &self.options
    }

    // =========================================================================
    // Input binding
    // =========================================================================

    fn bind_inputs(&self, node: &RelNode, permutation: Vec<usize>) -> Result<InputBinding> {
        let sink = data_sink(self.dag, node)?;
        let sink_inputs: Vec<NodeId> = sink.inputs().into_iter().collect();
        let is_union = matches!(node, RelNode::LogicalUnion(_));

        let mut nest_levels = FxHashMap::default();
        let mut input_descs = Vec::with_capacity(sink_inputs.len());
        for input_idx in 0..sink_inputs.len() {
            let node_idx = permutation.get(input_idx).copied().unwrap_or(input_idx);
            let input_id = *sink_inputs
                .get(node_idx)
                .ok_or(Error::ColumnIndexOutOfBounds { index: node_idx })?;
            let level = if is_union { 0 } else { input_idx };
            if nest_levels.insert(input_id, level).is_some() {
                return Err(Error::unsupported("Self joins not supported yet"));
            }
            if !permutation.is_empty() {
                debug!(input = input_id, nest_level = input_idx, "assigned input");
            }
            let input = self.dag.node(input_id)?;
            input_descs.push(InputDescriptor::new(table_id_of(input), input_idx));
        }

        Ok(InputBinding {
            sink: sink.id(),
            sink_inputs,
            permutation,
            nest_levels,
            input_descs,
        })
    }

    /// Binding of a node that may read a left-deep join, with join input
    /// reordering applied, plus the join input column counts
    fn bind_join_inputs(&self, node: &RelNode) -> Result<(InputBinding, Vec<usize>)> {
        let binding = self.bind_inputs(node, Vec::new())?;
        let RelNode::LeftDeepInnerJoin(join) = self.dag.node(binding.sink)? else {
            return Ok((binding, Vec::new()));
        };
        let input_sizes = join
            .inputs
            .iter()
            .map(|input| Ok(self.dag.output_meta(*input)?.len()))
            .collect::<Result<Vec<_>>>()?;
        if !self.options.from_table_reordering || join.has_left_joins() {
            return Ok((binding, input_sizes));
        }
        let permutation = self.table_permutation(&binding.sink_inputs)?;
        if permutation.is_empty() {
            return Ok((binding, input_sizes));
        }
        Ok((self.bind_inputs(node, permutation)?, input_sizes))
    }

    /// Largest inputs first; empty when the order does not change
    fn table_permutation(&self, inputs: &[NodeId]) -> Result<Vec<usize>> {
        let sizes = inputs
            .iter()
            .map(|id| {
                let node = self.dag.node(*id)?;
                Ok(self.tables.num_tuples(table_id_of(node)).unwrap_or(0))
            })
            .collect::<Result<Vec<usize>>>()?;
        let mut permutation: Vec<usize> = (0..inputs.len()).collect();
        permutation.sort_by(|a, b| sizes[*b].cmp(&sizes[*a]));
        if permutation.iter().enumerate().all(|(i, p)| i == *p) {
            return Ok(Vec::new());
        }
        Ok(permutation)
    }

    fn context<'b>(&'b self, node: NodeId, binding: &'b InputBinding, just_explain: bool) -> TranslationContext<'b> {
        TranslationContext {
            dag: self.dag,
            node,
            sink: binding.sink,
            sink_inputs: &binding.sink_inputs,
            nest_levels: &binding.nest_levels,
            subquery_values: self.subquery_values,
            just_explain,
        }
    }

    // =========================================================================
    // Expressions
    // =========================================================================

    fn translate(&self, expr: &RexExpr, ctx: &TranslationContext<'_>) -> Result<Arc<Expr>> {
        self.exprs.translate(expr, ctx)
    }

    fn translate_all(&self, exprs: &[RexExpr], ctx: &TranslationContext<'_>) -> Result<Vec<Arc<Expr>>> {
        exprs.iter().map(|e| self.translate(e, ctx)).collect()
    }

    fn translate_conjuncts(&self, condition: &RexExpr, ctx: &TranslationContext<'_>) -> Result<Vec<Arc<Expr>>> {
        let mut out = Vec::new();
        for conjunct in condition.conjuncts() {
            let expr = self.translate(conjunct, ctx)?;
            if !is_true_literal(&expr) {
                out.push(expr);
            }
        }
        Ok(out)
    }

    /// Split a filter into simple and general conjuncts
    fn translate_quals(
        &self,
        condition: &RexExpr,
        ctx: &TranslationContext<'_>,
    ) -> Result<(Vec<Arc<Expr>>, Vec<Arc<Expr>>)> {
        Ok(self
            .translate_conjuncts(condition, ctx)?
            .into_iter()
            .partition(|expr| is_simple_qual(expr)))
    }

    /// Join predicates per nest level above 0
    fn translate_join_quals(&self, sink: &RelNode, ctx: &TranslationContext<'_>) -> Result<Vec<JoinCondition>> {
        match sink {
            RelNode::LeftDeepInnerJoin(join) => {
                let inner = self.translate_conjuncts(&join.condition, ctx)?;
                let mut visited = vec![false; inner.len()];
                let mut out = Vec::with_capacity(join.inputs.len().saturating_sub(1));
                for level in 1..join.inputs.len() {
                    if let Some(Some(outer)) = join.outer_conditions.get(level - 1) {
                        out.push(JoinCondition {
                            quals: self.translate_conjuncts(outer, ctx)?,
                            join_type: JoinType::Left,
                        });
                        continue;
                    }
                    let mut quals = Vec::new();
                    for (qual, seen) in inner.iter().zip(visited.iter_mut()) {
                        let max_level = qual.nest_levels().into_iter().max().unwrap_or(0);
                        if !*seen && max_level <= level {
                            *seen = true;
                            quals.push(qual.clone());
                        }
                    }
                    out.push(JoinCondition {
                        quals,
                        join_type: JoinType::Inner,
                    });
                }
                Ok(out)
            }
            RelNode::Join(join) => Ok(vec![JoinCondition {
                quals: self.translate_conjuncts(&join.condition, ctx)?,
                join_type: join.join_type,
            }]),
            _ => Ok(Vec::new()),
        }
    }

    /// Every column of every bound input
    fn all_input_columns(&self, binding: &InputBinding) -> Result<Vec<InputColDescriptor>> {
        let mut cols = FxHashSet::default();
        for (input_id, level) in &binding.nest_levels {
            let input = self.dag.node(*input_id)?;
            let table_id = table_id_of(input);
            for (column_id, meta) in self.dag.output_meta(*input_id)?.iter().enumerate() {
                cols.insert(InputColDescriptor::new(table_id, column_id, *level, meta.ty));
            }
        }
        Ok(ordered_col_descs(cols))
    }

    fn hint_for(&self, node: NodeId) -> QueryHint {
        self.dag
            .hint(node)
            .copied()
            .unwrap_or(self.options.default_hint)
    }

    fn attach_plan_dag(&self, unit: &mut ExecutionUnit, node: NodeId) {
        let info = self.plan_extractor.extract(self.dag, node, unit);
        if info.is_valid() {
            unit.query_plan_dag = info.fingerprint;
        }
    }

    fn check_arity(unit: &ExecutionUnit, node: NodeId, expected: usize) -> Result<()> {
        if unit.target_exprs.len() != expected {
            return Err(Error::TargetArityMismatch {
                node,
                expected,
                got: unit.target_exprs.len(),
            });
        }
        Ok(())
    }

    fn work_unit(&self, unit: ExecutionUnit, body: NodeId) -> WorkUnit {
        WorkUnit::new(
            unit,
            body,
            self.options.default_max_groups_buffer_entry_guess,
        )
    }

    // =========================================================================
    // Work units
    // =========================================================================

    /// Unit of a Compound, Project, Aggregate, Filter or LogicalUnion node
    pub fn create_work_unit(&self, node: NodeId, sort_info: SortInfo, just_explain: bool) -> Result<WorkUnit> {
        match self.dag.node(node)? {
            RelNode::Compound(compound) => self.create_compound_work_unit(compound, sort_info, just_explain),
            RelNode::Project(project) => self.create_project_work_unit(project, sort_info, just_explain),
            RelNode::Aggregate(aggregate) => {
                self.create_aggregate_work_unit(aggregate, sort_info, just_explain)
            }
            RelNode::Filter(filter) => self.create_filter_work_unit(filter, sort_info, just_explain),
            RelNode::LogicalUnion(union) => self.create_union_work_unit(union, sort_info, just_explain),
            other => Err(Error::internal(format!("Unhandled node type: {}", other))),
        }
    }

    pub fn create_compound_work_unit(
        &self,
        compound: &CompoundNode,
        sort_info: SortInfo,
        just_explain: bool,
    ) -> Result<WorkUnit> {
        let node = self.dag.node(compound.id)?;
        let (binding, left_deep_join_input_sizes) = self.bind_join_inputs(node)?;
        let ctx = self.context(compound.id, &binding, just_explain);
        let sink = self.dag.node(binding.sink)?;

        let targets = self.translate_all(&compound.targets, &ctx)?;
        if compound.group_key_count > targets.len() {
            return Err(Error::TargetArityMismatch {
                node: compound.id,
                expected: compound.group_key_count,
                got: targets.len(),
            });
        }
        let mut unit = ExecutionUnit::new(binding.input_descs.clone(), Vec::new());
        if compound.group_key_count > 0 {
            unit.groupby_exprs = targets[..compound.group_key_count]
                .iter()
                .cloned()
                .map(Some)
                .collect();
        }
        if let Some(filter) = &compound.filter {
            let (simple_quals, quals) = self.translate_quals(filter, &ctx)?;
            unit.simple_quals = simple_quals;
            unit.quals = quals;
        }
        unit.join_quals = self.translate_join_quals(sink, &ctx)?;
        unit.target_exprs = targets;
        unit.sort_info = sort_info;
        unit.query_hint = self.hint_for(compound.id);
        unit.input_col_descs = used_input_columns(&unit);

        let mut unit = self.rewriter.rewrite(unit)?;
        Self::check_arity(&unit, compound.id, compound.targets.len())?;
        self.attach_plan_dag(&mut unit, compound.id);

        let mut work_unit = self.work_unit(unit, compound.id);
        work_unit.input_permutation = binding.permutation;
        work_unit.left_deep_join_input_sizes = left_deep_join_input_sizes;
        Ok(work_unit)
    }

    pub fn create_project_work_unit(
        &self,
        project: &ProjectNode,
        sort_info: SortInfo,
        just_explain: bool,
    ) -> Result<WorkUnit> {
        let node = self.dag.node(project.id)?;
        let (binding, left_deep_join_input_sizes) = self.bind_join_inputs(node)?;
        let ctx = self.context(project.id, &binding, just_explain);
        let sink = self.dag.node(binding.sink)?;

        let mut unit = ExecutionUnit::new(binding.input_descs.clone(), Vec::new());
        unit.join_quals = self.translate_join_quals(sink, &ctx)?;
        unit.target_exprs = self.translate_all(&project.exprs, &ctx)?;
        unit.sort_info = sort_info;
        unit.query_hint = self.hint_for(project.id);
        unit.input_col_descs = used_input_columns(&unit);

        let mut unit = self.rewriter.rewrite(unit)?;
        Self::check_arity(&unit, project.id, project.exprs.len())?;
        self.attach_plan_dag(&mut unit, project.id);

        let mut work_unit = self.work_unit(unit, project.id);
        work_unit.input_permutation = binding.permutation;
        work_unit.left_deep_join_input_sizes = left_deep_join_input_sizes;
        Ok(work_unit)
    }

    pub fn create_aggregate_work_unit(
        &self,
        aggregate: &AggregateNode,
        sort_info: SortInfo,
        just_explain: bool,
    ) -> Result<WorkUnit> {
        let node = self.dag.node(aggregate.id)?;
        let binding = self.bind_inputs(node, Vec::new())?;
        let ctx = self.context(aggregate.id, &binding, just_explain);

        let mut targets = (0..aggregate.group_key_count)
            .map(|i| ctx.resolve_input(aggregate.input, i))
            .collect::<Result<Vec<_>>>()?;
        let mut unit = ExecutionUnit::new(binding.input_descs.clone(), Vec::new());
        if !targets.is_empty() {
            unit.groupby_exprs = targets.iter().cloned().map(Some).collect();
        }
        for agg in &aggregate.aggs {
            targets.push(self.translate(&RexExpr::Agg(agg.clone()), &ctx)?);
        }
        unit.target_exprs = targets;
        unit.sort_info = sort_info;
        unit.query_hint = self.hint_for(aggregate.id);
        unit.input_col_descs = used_input_columns(&unit);
        Self::check_arity(
            &unit,
            aggregate.id,
            aggregate.group_key_count + aggregate.aggs.len(),
        )?;
        self.attach_plan_dag(&mut unit, aggregate.id);
        Ok(self.work_unit(unit, aggregate.id))
    }

    /// A filter forwards every input column
    pub fn create_filter_work_unit(
        &self,
        filter: &FilterNode,
        sort_info: SortInfo,
        just_explain: bool,
    ) -> Result<WorkUnit> {
        let node = self.dag.node(filter.id)?;
        let binding = self.bind_inputs(node, Vec::new())?;
        let ctx = self.context(filter.id, &binding, just_explain);
        let sink = self.dag.node(binding.sink)?;

        let mut targets = Vec::new();
        for input in &binding.sink_inputs {
            let width = self.dag.output_meta(*input)?.len();
            for i in 0..width {
                targets.push(ctx.resolve_input(*input, i)?);
            }
        }
        let mut unit = ExecutionUnit::new(binding.input_descs.clone(), Vec::new());
        unit.quals = vec![self.translate(&filter.condition, &ctx)?];
        unit.join_quals = self.translate_join_quals(sink, &ctx)?;
        unit.target_exprs = targets;
        unit.sort_info = sort_info;
        unit.query_hint = self.hint_for(filter.id);
        unit.input_col_descs = self.all_input_columns(&binding)?;
        self.attach_plan_dag(&mut unit, filter.id);
        Ok(self.work_unit(unit, filter.id))
    }

    /// UNION ALL reads every input column at nest level 0
    pub fn create_union_work_unit(
        &self,
        union: &LogicalUnionNode,
        sort_info: SortInfo,
        _just_explain: bool,
    ) -> Result<WorkUnit> {
        let node = self.dag.node(union.id)?;
        let Some(&first_id) = union.inputs.first() else {
            return Err(Error::InputCountMismatch {
                node: union.id,
                kind: "LogicalUnion",
                expected: 2,
                got: 0,
            });
        };
        let first = self.dag.node(first_id)?;
        match first {
            RelNode::Compound(_)
            | RelNode::Project(_)
            | RelNode::LogicalUnion(_)
            | RelNode::Aggregate(_)
            | RelNode::Scan(_)
            | RelNode::Filter(_) => {}
            RelNode::Sort(_) => {
                return Err(Error::unsupported(
                    "LIMIT and OFFSET are not currently supported with UNION.",
                ))
            }
            other => {
                return Err(Error::unsupported(format!(
                    "Unsupported input type: {}",
                    other
                )))
            }
        }

        let binding = self.bind_inputs(node, Vec::new())?;
        let first_table = table_id_of(first);
        let mut unit = ExecutionUnit::new(binding.input_descs.clone(), Vec::new());
        unit.target_exprs = self
            .dag
            .output_meta(first_id)?
            .iter()
            .enumerate()
            .map(|(i, meta)| Expr::column(first_table, i, 0, meta.ty))
            .collect();
        unit.input_col_descs = self.all_input_columns(&binding)?;
        unit.scan_limit = binding
            .input_descs
            .iter()
            .filter_map(|desc| self.tables.num_tuples(desc.table_id))
            .max()
            .unwrap_or(0);
        unit.sort_info = sort_info;
        unit.query_hint = self.options.default_hint;
        unit.union_all = Some(union.is_all);

        let unit = self.rewriter.rewrite(unit)?;
        if unit.input_col_descs.is_empty() {
            return Err(Error::internal(format!(
                "no output columns found for union input {}",
                first
            )));
        }
        Ok(self.work_unit(unit, union.id))
    }

    pub fn create_table_function_work_unit(
        &self,
        table_func: &TableFunctionNode,
        just_explain: bool,
    ) -> Result<TableFunctionWorkUnit> {
        let node = self.dag.node(table_func.id)?;
        let binding = self.bind_inputs(node, Vec::new())?;
        let ctx = self.context(table_func.id, &binding, just_explain);

        let input_exprs = self.translate_all(&table_func.args, &ctx)?;
        let mut cols = FxHashSet::default();
        for expr in &input_exprs {
            collect_columns(expr, &mut cols);
        }
        Ok(TableFunctionWorkUnit {
            exe_unit: TableFunctionExecutionUnit {
                input_descs: binding.input_descs,
                input_col_descs: ordered_col_descs(cols),
                name: table_func.name.clone(),
                input_exprs,
                outputs: table_func.outputs.clone(),
            },
            body: table_func.id,
        })
    }

    /// Unit of the source of `sort`, carrying the sort's ordering and limits
    ///
    /// The returned body is the source node. Speculative top-N is chosen for
    /// grouped sources unless the group key and direction are blacklisted;
    /// projections use the streaming top-N.
    pub fn create_sort_input_work_unit(
        &self,
        sort: &SortNode,
        just_explain: bool,
        blacklist: &SpeculativeTopNBlacklist,
    ) -> Result<WorkUnit> {
        let source = self.dag.node(sort.input)?;
        if source.is_sort() {
            return Err(Error::unsupported(
                "Sort node not supported as input to another sort",
            ));
        }
        let limit = sort.limit.unwrap_or(0);
        let offset = sort.offset;
        let scan_limit = if sort.collation.is_empty() {
            scan_limit_for(source, limit)
        } else {
            0
        };
        let scan_total_limit = if scan_limit > 0 {
            scan_limit_for(source, scan_limit + offset)
        } else {
            0
        };
        let max_groups_buffer_entry_guess = if scan_total_limit > 0 {
            scan_total_limit
        } else {
            self.options.default_max_groups_buffer_entry_guess
        };

        let entries = order_entries(sort);
        let sort_info = SortInfo::new(
            entries.clone(),
            SortAlgorithm::SpeculativeTopN,
            limit,
            offset,
        );
        let mut work_unit = self.create_work_unit(sort.input, sort_info, just_explain)?;

        for entry in &entries {
            let target = work_unit
                .exe_unit
                .target_exprs
                .get(entry.target_idx())
                .ok_or(Error::ColumnIndexOutOfBounds {
                    index: entry.target_idx(),
                })?;
            if target.ty.is_array() {
                return Err(Error::unsupported(
                    "Columns with array types cannot be used in an ORDER BY clause.",
                ));
            }
        }

        let mut algorithm = SortAlgorithm::SpeculativeTopN;
        if let [key] = work_unit.exe_unit.groupby_exprs.as_slice() {
            match key {
                None => algorithm = SortAlgorithm::StreamingTopN,
                Some(key) => {
                    if blacklist.contains(key.fingerprint(), first_entry_is_desc(&entries)) {
                        algorithm = SortAlgorithm::Default;
                    }
                }
            }
        }

        work_unit.exe_unit.sort_info = SortInfo::new(entries, algorithm, limit, offset);
        work_unit.exe_unit.scan_limit = scan_total_limit;
        work_unit.max_groups_buffer_entry_guess = max_groups_buffer_entry_guess;
        Ok(work_unit)
    }
}

/// Group key fingerprint and direction identifying a speculative top-N shape
pub fn speculative_top_n_key(unit: &ExecutionUnit) -> Option<(u64, bool)> {
    match unit.groupby_exprs.as_slice() {
        [Some(key)] => Some((
            key.fingerprint(),
            first_entry_is_desc(&unit.sort_info.order_entries),
        )),
        _ => None,
    }
}
