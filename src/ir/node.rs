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

//! Relational-algebra nodes
//!
//! Nodes form a closed sum type. Every node has a stable [`NodeId`] and reads
//! its inputs by id from the owning [`QueryDag`](super::QueryDag).

use std::fmt;

use compact_str::CompactString;
use smallvec::SmallVec;

use super::expr::{RexAgg, RexExpr};
use crate::core::{ColumnType, Value};

/// Stable identifier of a node within one DAG
pub type NodeId = u32;

/// Inline storage for node inputs; most nodes have one or two
pub type NodeInputs = SmallVec<[NodeId; 2]>;

/// Name and type of one output column
#[derive(Debug, Clone, PartialEq)]
pub struct TargetMetaInfo {
    pub name: CompactString,
    pub ty: ColumnType,
}

impl TargetMetaInfo {
    pub fn new(name: impl Into<CompactString>, ty: ColumnType) -> Self {
        Self {
            name: name.into(),
            ty,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum JoinType {
    #[default]
    Inner,
    Left,
}

impl fmt::Display for JoinType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JoinType::Inner => write!(f, "INNER"),
            JoinType::Left => write!(f, "LEFT"),
        }
    }
}

/// One ORDER BY key of a Sort node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SortField {
    /// Zero-based output column of the sort's input
    pub field: usize,
    pub descending: bool,
    pub nulls_first: bool,
}

impl SortField {
    pub fn asc(field: usize) -> Self {
        Self {
            field,
            descending: false,
            nulls_first: false,
        }
    }

    pub fn desc(field: usize) -> Self {
        Self {
            field,
            descending: true,
            nulls_first: false,
        }
    }

    pub fn with_nulls_first(mut self, nulls_first: bool) -> Self {
        self.nulls_first = nulls_first;
        self
    }
}

// =============================================================================
// Node payloads
// =============================================================================

/// Base table leaf
#[derive(Debug, Clone, PartialEq)]
pub struct ScanNode {
    pub id: NodeId,
    pub table_id: i32,
    pub table_name: CompactString,
    pub columns: Vec<TargetMetaInfo>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FilterNode {
    pub id: NodeId,
    pub input: NodeId,
    pub condition: RexExpr,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProjectNode {
    pub id: NodeId,
    pub input: NodeId,
    pub exprs: Vec<RexExpr>,
    pub fields: Vec<CompactString>,
}

impl ProjectNode {
    /// A projection that only forwards input columns
    pub fn is_simple(&self) -> bool {
        self.exprs.iter().all(|e| matches!(e, RexExpr::Input { .. }))
    }
}

/// Group-by aggregate; the first `group_key_count` input columns are the keys
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateNode {
    pub id: NodeId,
    pub input: NodeId,
    pub group_key_count: usize,
    pub aggs: Vec<RexAgg>,
    pub fields: Vec<CompactString>,
    /// Set by the planner when the aggregate only forwards an already grouped input
    pub pass_through: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JoinNode {
    pub id: NodeId,
    pub left: NodeId,
    pub right: NodeId,
    pub condition: RexExpr,
    pub join_type: JoinType,
}

/// A coalesced chain of joins evaluated as one step
#[derive(Debug, Clone, PartialEq)]
pub struct LeftDeepInnerJoinNode {
    pub id: NodeId,
    pub inputs: Vec<NodeId>,
    /// Inner join predicate over all inputs
    pub condition: RexExpr,
    /// LEFT join predicate per nesting level `1..inputs.len()`
    pub outer_conditions: Vec<Option<RexExpr>>,
}

impl LeftDeepInnerJoinNode {
    pub fn has_left_joins(&self) -> bool {
        self.outer_conditions.iter().any(Option::is_some)
    }
}

/// Filter, projection and optional aggregation fused by the planner
#[derive(Debug, Clone, PartialEq)]
pub struct CompoundNode {
    pub id: NodeId,
    pub input: NodeId,
    pub filter: Option<RexExpr>,
    pub group_key_count: usize,
    pub targets: Vec<RexExpr>,
    pub fields: Vec<CompactString>,
    pub is_agg: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SortNode {
    pub id: NodeId,
    pub input: NodeId,
    pub collation: Vec<SortField>,
    pub limit: Option<usize>,
    pub offset: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TableFunctionNode {
    pub id: NodeId,
    pub inputs: Vec<NodeId>,
    pub name: CompactString,
    pub args: Vec<RexExpr>,
    pub outputs: Vec<TargetMetaInfo>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogicalUnionNode {
    pub id: NodeId,
    pub inputs: Vec<NodeId>,
    pub is_all: bool,
}

/// Literal rows
#[derive(Debug, Clone, PartialEq)]
pub struct LogicalValuesNode {
    pub id: NodeId,
    pub tuple_type: Vec<TargetMetaInfo>,
    pub rows: Vec<Vec<Value>>,
}

// =============================================================================
// RelNode
// =============================================================================

/// Node kind tag, used for logging and error messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelNodeKind {
    Scan,
    Filter,
    Project,
    Aggregate,
    Join,
    LeftDeepInnerJoin,
    Compound,
    Sort,
    TableFunction,
    LogicalUnion,
    LogicalValues,
}

impl RelNodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelNodeKind::Scan => "Scan",
            RelNodeKind::Filter => "Filter",
            RelNodeKind::Project => "Project",
            RelNodeKind::Aggregate => "Aggregate",
            RelNodeKind::Join => "Join",
            RelNodeKind::LeftDeepInnerJoin => "LeftDeepInnerJoin",
            RelNodeKind::Compound => "Compound",
            RelNodeKind::Sort => "Sort",
            RelNodeKind::TableFunction => "TableFunction",
            RelNodeKind::LogicalUnion => "LogicalUnion",
            RelNodeKind::LogicalValues => "LogicalValues",
        }
    }
}

impl fmt::Display for RelNodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A relational-algebra operator
#[derive(Debug, Clone, PartialEq)]
pub enum RelNode {
    Scan(ScanNode),
    Filter(FilterNode),
    Project(ProjectNode),
    Aggregate(AggregateNode),
    Join(JoinNode),
    LeftDeepInnerJoin(LeftDeepInnerJoinNode),
    Compound(CompoundNode),
    Sort(SortNode),
    TableFunction(TableFunctionNode),
    LogicalUnion(LogicalUnionNode),
    LogicalValues(LogicalValuesNode),
}

impl RelNode {
    pub fn id(&self) -> NodeId {
        match self {
            RelNode::Scan(n) => n.id,
            RelNode::Filter(n) => n.id,
            RelNode::Project(n) => n.id,
            RelNode::Aggregate(n) => n.id,
            RelNode::Join(n) => n.id,
            RelNode::LeftDeepInnerJoin(n) => n.id,
            RelNode::Compound(n) => n.id,
            RelNode::Sort(n) => n.id,
            RelNode::TableFunction(n) => n.id,
            RelNode::LogicalUnion(n) => n.id,
            RelNode::LogicalValues(n) => n.id,
        }
    }

    pub fn kind(&self) -> RelNodeKind {
        match self {
            RelNode::Scan(_) => RelNodeKind::Scan,
            RelNode::Filter(_) => RelNodeKind::Filter,
            RelNode::Project(_) => RelNodeKind::Project,
            RelNode::Aggregate(_) => RelNodeKind::Aggregate,
            RelNode::Join(_) => RelNodeKind::Join,
            RelNode::LeftDeepInnerJoin(_) => RelNodeKind::LeftDeepInnerJoin,
            RelNode::Compound(_) => RelNodeKind::Compound,
            RelNode::Sort(_) => RelNodeKind::Sort,
            RelNode::TableFunction(_) => RelNodeKind::TableFunction,
            RelNode::LogicalUnion(_) => RelNodeKind::LogicalUnion,
            RelNode::LogicalValues(_) => RelNodeKind::LogicalValues,
        }
    }

    /// Input node ids, in operand order
    pub fn inputs(&self) -> NodeInputs {
        match self {
            RelNode::Scan(_) | RelNode::LogicalValues(_) => NodeInputs::new(),
            RelNode::Filter(n) => smallvec::smallvec![n.input],
            RelNode::Project(n) => smallvec::smallvec![n.input],
            RelNode::Aggregate(n) => smallvec::smallvec![n.input],
            RelNode::Compound(n) => smallvec::smallvec![n.input],
            RelNode::Sort(n) => smallvec::smallvec![n.input],
            RelNode::Join(n) => smallvec::smallvec![n.left, n.right],
            RelNode::LeftDeepInnerJoin(n) => n.inputs.iter().copied().collect(),
            RelNode::TableFunction(n) => n.inputs.iter().copied().collect(),
            RelNode::LogicalUnion(n) => n.inputs.iter().copied().collect(),
        }
    }

    pub fn input_count(&self) -> usize {
        self.inputs().len()
    }

    pub fn is_scan(&self) -> bool {
        matches!(self, RelNode::Scan(_))
    }

    /// Binary or coalesced join
    pub fn is_join(&self) -> bool {
        matches!(self, RelNode::Join(_) | RelNode::LeftDeepInnerJoin(_))
    }

    pub fn is_sort(&self) -> bool {
        matches!(self, RelNode::Sort(_))
    }

    /// Nodes whose work unit produces grouped output
    pub fn is_aggregate(&self) -> bool {
        match self {
            RelNode::Aggregate(_) => true,
            RelNode::Compound(c) => c.is_agg,
            _ => false,
        }
    }
}

impl fmt::Display for RelNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.kind(), self.id())
    }
}
