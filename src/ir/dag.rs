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

//! Query DAG
//!
//! [`QueryDag`] owns every node of one query plan, keyed by id, together with
//! the per-node hint registry and the roots of scalar subqueries. The DAG is
//! immutable once built; execution state lives in the driver.

use compact_str::{format_compact, CompactString};
use rustc_hash::FxHashMap;

use super::expr::{RexAgg, RexExpr};
use super::node::*;
use crate::core::{ColumnType, DataType, Error, Result, Value};

/// Per-node execution hints supplied by the planner
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryHint {
    /// Force CPU execution
    pub cpu_mode: bool,
    /// Force columnar output
    pub columnar_output: bool,
    /// Force row-wise output
    pub rowwise_output: bool,
}

impl QueryHint {
    pub fn cpu() -> Self {
        Self {
            cpu_mode: true,
            ..Default::default()
        }
    }

    pub fn columnar() -> Self {
        Self {
            columnar_output: true,
            ..Default::default()
        }
    }

    pub fn rowwise() -> Self {
        Self {
            rowwise_output: true,
            ..Default::default()
        }
    }

    /// True when the hint pins the output layout
    pub fn has_layout_hint(&self) -> bool {
        self.columnar_output || self.rowwise_output
    }
}

/// An immutable relational-algebra plan
#[derive(Debug, Clone)]
pub struct QueryDag {
    nodes: FxHashMap<NodeId, RelNode>,
    root: NodeId,
    hints: FxHashMap<NodeId, QueryHint>,
    subqueries: Vec<NodeId>,
}

impl QueryDag {
    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn root_node(&self) -> Result<&RelNode> {
        self.node(self.root)
    }

    pub fn node(&self, id: NodeId) -> Result<&RelNode> {
        self.nodes.get(&id).ok_or(Error::NodeNotFound(id))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Node ids in ascending order
    pub fn node_ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.nodes.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn hint(&self, id: NodeId) -> Option<&QueryHint> {
        self.hints.get(&id)
    }

    /// Scalar subquery roots, in execution order
    pub fn subqueries(&self) -> &[NodeId] {
        &self.subqueries
    }

    /// Nodes that read `id` as an input
    pub fn consumers_of(&self, id: NodeId) -> Vec<NodeId> {
        let mut out: Vec<NodeId> = self
            .nodes
            .values()
            .filter(|n| n.inputs().contains(&id))
            .map(RelNode::id)
            .collect();
        out.sort_unstable();
        out
    }

    /// Output columns of a node
    pub fn output_meta(&self, id: NodeId) -> Result<Vec<TargetMetaInfo>> {
        let node = self.node(id)?;
        Ok(match node {
            RelNode::Scan(scan) => scan.columns.clone(),
            RelNode::Filter(f) => self.output_meta(f.input)?,
            RelNode::Sort(s) => self.output_meta(s.input)?,
            RelNode::Project(p) => p
                .exprs
                .iter()
                .zip(&p.fields)
                .map(|(e, name)| Ok(TargetMetaInfo::new(name.clone(), self.rex_type(e)?)))
                .collect::<Result<_>>()?,
            RelNode::Aggregate(agg) => {
                let input = self.output_meta(agg.input)?;
                if input.len() < agg.group_key_count {
                    return Err(Error::InputCountMismatch {
                        node: agg.id,
                        kind: "Aggregate",
                        expected: agg.group_key_count,
                        got: input.len(),
                    });
                }
                let keys = input.into_iter().take(agg.group_key_count);
                let aggs = agg.aggs.iter().map(|a| TargetMetaInfo::new("", a.ty));
                keys.chain(aggs)
                    .zip(&agg.fields)
                    .map(|(meta, name)| TargetMetaInfo::new(name.clone(), meta.ty))
                    .collect()
            }
            RelNode::Join(j) => {
                let mut meta = self.output_meta(j.left)?;
                meta.extend(self.output_meta(j.right)?);
                meta
            }
            RelNode::LeftDeepInnerJoin(j) => {
                let mut meta = Vec::new();
                for input in &j.inputs {
                    meta.extend(self.output_meta(*input)?);
                }
                meta
            }
            RelNode::Compound(c) => c
                .targets
                .iter()
                .zip(&c.fields)
                .map(|(e, name)| Ok(TargetMetaInfo::new(name.clone(), self.rex_type(e)?)))
                .collect::<Result<_>>()?,
            RelNode::TableFunction(tf) => tf.outputs.clone(),
            RelNode::LogicalUnion(u) => match u.inputs.first() {
                Some(first) => self.output_meta(*first)?,
                None => Vec::new(),
            },
            RelNode::LogicalValues(v) => v.tuple_type.clone(),
        })
    }

    /// Type of a planner expression
    pub fn rex_type(&self, expr: &RexExpr) -> Result<ColumnType> {
        match expr {
            RexExpr::Input { source, index } => {
                let meta = self.output_meta(*source)?;
                meta.get(*index)
                    .map(|m| m.ty)
                    .ok_or(Error::ColumnIndexOutOfBounds { index: *index })
            }
            RexExpr::Literal { ty, .. } => Ok(*ty),
            RexExpr::Operator { ty, .. } => Ok(*ty),
            RexExpr::Agg(agg) => Ok(agg.ty),
            RexExpr::ScalarSubquery { ty, .. } => Ok(*ty),
        }
    }
}

/// Builds a [`QueryDag`], assigning ids from 1
#[derive(Debug, Default)]
pub struct QueryDagBuilder {
    next_id: NodeId,
    nodes: FxHashMap<NodeId, RelNode>,
    hints: FxHashMap<NodeId, QueryHint>,
    subqueries: Vec<NodeId>,
}

fn default_fields(count: usize) -> Vec<CompactString> {
    (0..count).map(|i| format_compact!("EXPR${}", i)).collect()
}

fn named_fields(names: &[&str], count: usize) -> Vec<CompactString> {
    let mut fields = default_fields(count);
    for (field, name) in fields.iter_mut().zip(names) {
        *field = CompactString::new(name);
    }
    fields
}

impl QueryDagBuilder {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            ..Default::default()
        }
    }

    fn add(&mut self, make: impl FnOnce(NodeId) -> RelNode) -> NodeId {
        let id = self.next_id.max(1);
        self.next_id = id + 1;
        self.nodes.insert(id, make(id));
        id
    }

    pub fn scan(&mut self, table_id: i32, table_name: &str, columns: Vec<TargetMetaInfo>) -> NodeId {
        self.add(|id| {
            RelNode::Scan(ScanNode {
                id,
                table_id,
                table_name: CompactString::new(table_name),
                columns,
            })
        })
    }

    pub fn filter(&mut self, input: NodeId, condition: RexExpr) -> NodeId {
        self.add(|id| RelNode::Filter(FilterNode { id, input, condition }))
    }

    pub fn project(&mut self, input: NodeId, exprs: Vec<RexExpr>) -> NodeId {
        self.project_named(input, exprs, &[])
    }

    pub fn project_named(&mut self, input: NodeId, exprs: Vec<RexExpr>, names: &[&str]) -> NodeId {
        let fields = named_fields(names, exprs.len());
        self.add(|id| {
            RelNode::Project(ProjectNode {
                id,
                input,
                exprs,
                fields,
            })
        })
    }

    pub fn aggregate(&mut self, input: NodeId, group_key_count: usize, aggs: Vec<RexAgg>) -> NodeId {
        let fields = default_fields(group_key_count + aggs.len());
        self.add(|id| {
            RelNode::Aggregate(AggregateNode {
                id,
                input,
                group_key_count,
                aggs,
                fields,
                pass_through: false,
            })
        })
    }

    pub fn join(&mut self, left: NodeId, right: NodeId, condition: RexExpr, join_type: JoinType) -> NodeId {
        self.add(|id| {
            RelNode::Join(JoinNode {
                id,
                left,
                right,
                condition,
                join_type,
            })
        })
    }

    pub fn left_deep_join(
        &mut self,
        inputs: Vec<NodeId>,
        condition: RexExpr,
        outer_conditions: Vec<Option<RexExpr>>,
    ) -> NodeId {
        self.add(|id| {
            RelNode::LeftDeepInnerJoin(LeftDeepInnerJoinNode {
                id,
                inputs,
                condition,
                outer_conditions,
            })
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn compound(
        &mut self,
        input: NodeId,
        filter: Option<RexExpr>,
        group_key_count: usize,
        targets: Vec<RexExpr>,
        names: &[&str],
        is_agg: bool,
    ) -> NodeId {
        let fields = named_fields(names, targets.len());
        self.add(|id| {
            RelNode::Compound(CompoundNode {
                id,
                input,
                filter,
                group_key_count,
                targets,
                fields,
                is_agg,
            })
        })
    }

    pub fn sort(
        &mut self,
        input: NodeId,
        collation: Vec<SortField>,
        limit: Option<usize>,
        offset: usize,
    ) -> NodeId {
        self.add(|id| {
            RelNode::Sort(SortNode {
                id,
                input,
                collation,
                limit,
                offset,
            })
        })
    }

    pub fn table_function(
        &mut self,
        inputs: Vec<NodeId>,
        name: &str,
        args: Vec<RexExpr>,
        outputs: Vec<TargetMetaInfo>,
    ) -> NodeId {
        self.add(|id| {
            RelNode::TableFunction(TableFunctionNode {
                id,
                inputs,
                name: CompactString::new(name),
                args,
                outputs,
            })
        })
    }

    pub fn union(&mut self, inputs: Vec<NodeId>, is_all: bool) -> NodeId {
        self.add(|id| RelNode::LogicalUnion(LogicalUnionNode { id, inputs, is_all }))
    }

    pub fn values(&mut self, tuple_type: Vec<TargetMetaInfo>, rows: Vec<Vec<Value>>) -> NodeId {
        self.add(|id| {
            RelNode::LogicalValues(LogicalValuesNode {
                id,
                tuple_type,
                rows,
            })
        })
    }

    /// Mark an aggregate as forwarding its input unchanged
    pub fn set_pass_through(&mut self, id: NodeId) -> Result<()> {
        match self.nodes.get_mut(&id) {
            Some(RelNode::Aggregate(agg)) => {
                agg.pass_through = true;
                Ok(())
            }
            Some(other) => Err(Error::invalid_argument(format!(
                "{} is not an aggregate",
                other
            ))),
            None => Err(Error::NodeNotFound(id)),
        }
    }

    pub fn hint(&mut self, id: NodeId, hint: QueryHint) -> &mut Self {
        self.hints.insert(id, hint);
        self
    }

    /// Register a scalar subquery rooted at `root`
    pub fn subquery(&mut self, root: NodeId) -> &mut Self {
        self.subqueries.push(root);
        self
    }

    /// Validate references and freeze the plan
    pub fn build(self, root: NodeId) -> Result<QueryDag> {
        if !self.nodes.contains_key(&root) {
            return Err(Error::NodeNotFound(root));
        }
        for node in self.nodes.values() {
            for input in node.inputs() {
                if !self.nodes.contains_key(&input) {
                    return Err(Error::NodeNotFound(input));
                }
            }
            validate_arity(node)?;
        }
        for sub in &self.subqueries {
            if !self.nodes.contains_key(sub) {
                return Err(Error::NodeNotFound(*sub));
            }
        }
        Ok(QueryDag {
            nodes: self.nodes,
            root,
            hints: self.hints,
            subqueries: self.subqueries,
        })
    }
}

fn validate_arity(node: &RelNode) -> Result<()> {
    match node {
        RelNode::LogicalUnion(u) if u.inputs.len() < 2 => Err(Error::InputCountMismatch {
            node: u.id,
            kind: "LogicalUnion",
            expected: 2,
            got: u.inputs.len(),
        }),
        RelNode::LeftDeepInnerJoin(j) if j.inputs.len() < 2 => Err(Error::InputCountMismatch {
            node: j.id,
            kind: "LeftDeepInnerJoin",
            expected: 2,
            got: j.inputs.len(),
        }),
        RelNode::LeftDeepInnerJoin(j) if j.outer_conditions.len() + 1 != j.inputs.len() => {
            Err(Error::InputCountMismatch {
                node: j.id,
                kind: "LeftDeepInnerJoin",
                expected: j.inputs.len() - 1,
                got: j.outer_conditions.len(),
            })
        }
        RelNode::LogicalValues(v) => {
            for row in &v.rows {
                if row.len() != v.tuple_type.len() {
                    return Err(Error::TargetArityMismatch {
                        node: v.id,
                        expected: v.tuple_type.len(),
                        got: row.len(),
                    });
                }
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

/// Boolean literal, used for trivially true join conditions
pub fn rex_true() -> RexExpr {
    RexExpr::literal(true, ColumnType::not_null(DataType::Boolean))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::expr::AggKind;

    fn two_col_scan(b: &mut QueryDagBuilder) -> NodeId {
        b.scan(
            10,
            "t",
            vec![
                TargetMetaInfo::new("a", ColumnType::bigint()),
                TargetMetaInfo::new("b", ColumnType::double()),
            ],
        )
    }

    #[test]
    fn test_builder_assigns_ids_and_meta() {
        let mut b = QueryDagBuilder::new();
        let scan = two_col_scan(&mut b);
        let agg = b.aggregate(
            scan,
            1,
            vec![RexAgg::new(AggKind::Sum, Some(RexExpr::input(scan, 1)), ColumnType::double())],
        );
        let dag = b.build(agg).unwrap();
        assert_eq!(scan, 1);
        assert_eq!(agg, 2);
        let meta = dag.output_meta(agg).unwrap();
        assert_eq!(meta.len(), 2);
        assert_eq!(meta[0].ty, ColumnType::bigint());
        assert_eq!(meta[1].name, "EXPR$1");
        assert_eq!(dag.consumers_of(scan), vec![agg]);
    }

    #[test]
    fn test_build_rejects_dangling_input() {
        let mut b = QueryDagBuilder::new();
        let f = b.filter(42, rex_true());
        assert_eq!(b.build(f).unwrap_err(), Error::NodeNotFound(42));
    }

    #[test]
    fn test_union_needs_two_inputs() {
        let mut b = QueryDagBuilder::new();
        let scan = two_col_scan(&mut b);
        let u = b.union(vec![scan], true);
        assert!(matches!(
            b.build(u),
            Err(Error::InputCountMismatch { kind: "LogicalUnion", .. })
        ));
    }

    #[test]
    fn test_hints_and_pass_through() {
        let mut b = QueryDagBuilder::new();
        let scan = two_col_scan(&mut b);
        let agg = b.aggregate(scan, 2, vec![]);
        b.set_pass_through(agg).unwrap();
        assert!(b.set_pass_through(scan).is_err());
        b.hint(agg, QueryHint::cpu());
        let dag = b.build(agg).unwrap();
        assert!(dag.hint(agg).map(|h| h.cpu_mode).unwrap_or(false));
        assert!(matches!(dag.node(agg).unwrap(), RelNode::Aggregate(a) if a.pass_through));
    }
}
