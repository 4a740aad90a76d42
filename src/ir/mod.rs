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

//! Relational-algebra plan representation
//!
//! - [`RelNode`] - closed set of plan operators
//! - [`RexExpr`] - planner expressions attached to nodes
//! - [`Expr`] - translated expressions stored in execution units
//! - [`QueryDag`] - an immutable plan with hints and subqueries

pub mod dag;
pub mod expr;
pub mod node;

pub use dag::{rex_true, QueryDag, QueryDagBuilder, QueryHint};
pub use expr::{AggKind, Expr, ExprKind, RexAgg, RexExpr};
pub use node::{
    AggregateNode, CompoundNode, FilterNode, JoinNode, JoinType, LeftDeepInnerJoinNode,
    LogicalUnionNode, LogicalValuesNode, NodeId, NodeInputs, ProjectNode, RelNode, RelNodeKind,
    ScanNode, SortField, SortNode, TableFunctionNode, TargetMetaInfo,
};
