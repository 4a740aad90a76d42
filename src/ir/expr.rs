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

//! Expressions
//!
//! Two expression forms exist:
//!
//! - [`RexExpr`] is what the planner attaches to relational-algebra nodes. Column
//!   references name the node that produces the column.
//! - [`Expr`] is the translated form stored in an execution unit. Column
//!   references are bound to a (table id, column id, nest level) triple.

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use compact_str::CompactString;
use smallvec::SmallVec;

use super::node::NodeId;
use crate::core::{ColumnType, DataType, Value};

/// Aggregate function kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AggKind {
    Avg,
    Min,
    Max,
    Sum,
    Count,
    ApproxCountDistinct,
    ApproxQuantile,
    Sample,
    SingleValue,
}

impl AggKind {
    pub fn name(&self) -> &'static str {
        match self {
            AggKind::Avg => "AVG",
            AggKind::Min => "MIN",
            AggKind::Max => "MAX",
            AggKind::Sum => "SUM",
            AggKind::Count => "COUNT",
            AggKind::ApproxCountDistinct => "APPROX_COUNT_DISTINCT",
            AggKind::ApproxQuantile => "APPROX_QUANTILE",
            AggKind::Sample => "SAMPLE",
            AggKind::SingleValue => "SINGLE_VALUE",
        }
    }
}

impl fmt::Display for AggKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// =============================================================================
// Planner expressions
// =============================================================================

/// An aggregate call attached to an Aggregate or Compound node
#[derive(Debug, Clone, PartialEq)]
pub struct RexAgg {
    pub kind: AggKind,
    pub distinct: bool,
    pub operand: Option<Box<RexExpr>>,
    /// Quantile for APPROX_QUANTILE
    pub quantile: Option<f64>,
    pub ty: ColumnType,
}

impl RexAgg {
    pub fn new(kind: AggKind, operand: Option<RexExpr>, ty: ColumnType) -> Self {
        Self {
            kind,
            distinct: false,
            operand: operand.map(Box::new),
            quantile: None,
            ty,
        }
    }

    /// COUNT(*)
    pub fn count_star() -> Self {
        Self::new(AggKind::Count, None, ColumnType::not_null(DataType::BigInt))
    }

    pub fn with_distinct(mut self, distinct: bool) -> Self {
        self.distinct = distinct;
        self
    }

    pub fn with_quantile(mut self, quantile: f64) -> Self {
        self.quantile = Some(quantile);
        self
    }
}

/// Planner-side expression
#[derive(Debug, Clone, PartialEq)]
pub enum RexExpr {
    /// Column `index` of the output of node `source`
    Input { source: NodeId, index: usize },
    Literal { value: Value, ty: ColumnType },
    Operator {
        op: CompactString,
        operands: Vec<RexExpr>,
        ty: ColumnType,
    },
    Agg(RexAgg),
    /// Single value produced by a previously executed subquery
    ScalarSubquery { root: NodeId, ty: ColumnType },
}

impl RexExpr {
    pub fn input(source: NodeId, index: usize) -> Self {
        RexExpr::Input { source, index }
    }

    pub fn literal(value: impl Into<Value>, ty: ColumnType) -> Self {
        RexExpr::Literal {
            value: value.into(),
            ty,
        }
    }

    pub fn op(op: &str, operands: Vec<RexExpr>, ty: ColumnType) -> Self {
        RexExpr::Operator {
            op: CompactString::new(op),
            operands,
            ty,
        }
    }

    /// Boolean binary comparison
    pub fn cmp(op: &str, lhs: RexExpr, rhs: RexExpr) -> Self {
        Self::op(op, vec![lhs, rhs], ColumnType::nullable(DataType::Boolean))
    }

    /// Conjunction of all terms
    pub fn and(terms: Vec<RexExpr>) -> Self {
        Self::op("AND", terms, ColumnType::nullable(DataType::Boolean))
    }

    /// Split a predicate into its top-level AND terms
    pub fn conjuncts(&self) -> Vec<&RexExpr> {
        let mut out = Vec::new();
        self.collect_conjuncts(&mut out);
        out
    }

    fn collect_conjuncts<'a>(&'a self, out: &mut Vec<&'a RexExpr>) {
        match self {
            RexExpr::Operator { op, operands, .. } if op.eq_ignore_ascii_case("AND") => {
                for operand in operands {
                    operand.collect_conjuncts(out);
                }
            }
            other => out.push(other),
        }
    }

    /// Nodes whose output this expression reads
    pub fn input_sources(&self) -> SmallVec<[NodeId; 4]> {
        let mut out = SmallVec::new();
        self.collect_sources(&mut out);
        out
    }

    fn collect_sources(&self, out: &mut SmallVec<[NodeId; 4]>) {
        match self {
            RexExpr::Input { source, .. } => {
                if !out.contains(source) {
                    out.push(*source);
                }
            }
            RexExpr::Operator { operands, .. } => {
                for operand in operands {
                    operand.collect_sources(out);
                }
            }
            RexExpr::Agg(agg) => {
                if let Some(operand) = &agg.operand {
                    operand.collect_sources(out);
                }
            }
            RexExpr::Literal { .. } | RexExpr::ScalarSubquery { .. } => {}
        }
    }

    pub fn is_agg(&self) -> bool {
        matches!(self, RexExpr::Agg(_))
    }
}

// =============================================================================
// Translated expressions
// =============================================================================

/// Translated expression node
#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    Column {
        table_id: i32,
        column_id: usize,
        nest_level: usize,
    },
    Constant(Value),
    Function {
        op: CompactString,
        args: Vec<Arc<Expr>>,
    },
    Agg {
        kind: AggKind,
        arg: Option<Arc<Expr>>,
        distinct: bool,
        quantile: Option<f64>,
    },
}

/// Typed expression bound to nest levels
#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    pub kind: ExprKind,
    pub ty: ColumnType,
}

impl Expr {
    pub fn column(table_id: i32, column_id: usize, nest_level: usize, ty: ColumnType) -> Arc<Self> {
        Arc::new(Self {
            kind: ExprKind::Column {
                table_id,
                column_id,
                nest_level,
            },
            ty,
        })
    }

    pub fn constant(value: Value, ty: ColumnType) -> Arc<Self> {
        Arc::new(Self {
            kind: ExprKind::Constant(value),
            ty,
        })
    }

    pub fn function(op: impl Into<CompactString>, args: Vec<Arc<Expr>>, ty: ColumnType) -> Arc<Self> {
        Arc::new(Self {
            kind: ExprKind::Function {
                op: op.into(),
                args,
            },
            ty,
        })
    }

    pub fn agg(
        kind: AggKind,
        arg: Option<Arc<Expr>>,
        distinct: bool,
        quantile: Option<f64>,
        ty: ColumnType,
    ) -> Arc<Self> {
        Arc::new(Self {
            kind: ExprKind::Agg {
                kind,
                arg,
                distinct,
                quantile,
            },
            ty,
        })
    }

    /// Aggregate kind when this is a top-level aggregate
    pub fn agg_kind(&self) -> Option<AggKind> {
        match &self.kind {
            ExprKind::Agg { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    pub fn is_agg(&self) -> bool {
        self.agg_kind().is_some()
    }

    pub fn is_distinct_agg(&self) -> bool {
        matches!(&self.kind, ExprKind::Agg { distinct: true, .. })
            || self.agg_kind() == Some(AggKind::ApproxCountDistinct)
    }

    /// Argument of a top-level aggregate
    pub fn agg_arg(&self) -> Option<&Arc<Expr>> {
        match &self.kind {
            ExprKind::Agg { arg, .. } => arg.as_ref(),
            _ => None,
        }
    }

    /// Visit every column reference as (table_id, column_id, nest_level)
    pub fn for_each_column(&self, f: &mut impl FnMut(i32, usize, usize)) {
        match &self.kind {
            ExprKind::Column {
                table_id,
                column_id,
                nest_level,
            } => f(*table_id, *column_id, *nest_level),
            ExprKind::Constant(_) => {}
            ExprKind::Function { args, .. } => {
                for arg in args {
                    arg.for_each_column(f);
                }
            }
            ExprKind::Agg { arg, .. } => {
                if let Some(arg) = arg {
                    arg.for_each_column(f);
                }
            }
        }
    }

    /// Distinct nest levels this expression reads
    pub fn nest_levels(&self) -> SmallVec<[usize; 4]> {
        let mut levels: SmallVec<[usize; 4]> = SmallVec::new();
        self.for_each_column(&mut |_, _, level| {
            if !levels.contains(&level) {
                levels.push(level);
            }
        });
        levels
    }

    /// Structural hash, stable across runs of the same plan
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        hash_expr_structure(self, &mut hasher);
        hasher.finish()
    }
}

/// Hash the structure of an expression, literals included
pub(crate) fn hash_expr_structure(expr: &Expr, hasher: &mut DefaultHasher) {
    std::mem::discriminant(&expr.kind).hash(hasher);
    expr.ty.hash(hasher);
    match &expr.kind {
        ExprKind::Column {
            table_id,
            column_id,
            nest_level,
        } => {
            table_id.hash(hasher);
            column_id.hash(hasher);
            nest_level.hash(hasher);
        }
        ExprKind::Constant(value) => value.hash(hasher),
        ExprKind::Function { op, args } => {
            op.hash(hasher);
            args.len().hash(hasher);
            for arg in args {
                hash_expr_structure(arg, hasher);
            }
        }
        ExprKind::Agg {
            kind,
            arg,
            distinct,
            quantile,
        } => {
            kind.hash(hasher);
            distinct.hash(hasher);
            quantile.map(f64::to_bits).hash(hasher);
            match arg {
                Some(arg) => hash_expr_structure(arg, hasher),
                None => 0u8.hash(hasher),
            }
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ExprKind::Column {
                table_id,
                column_id,
                nest_level,
            } => write!(f, "$t{}.c{}@{}", table_id, column_id, nest_level),
            ExprKind::Constant(Value::Text(s)) => write!(f, "'{}'", s),
            ExprKind::Constant(value) => write!(f, "{}", value),
            ExprKind::Function { op, args } => {
                write!(f, "{}(", op)?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", arg)?;
                }
                write!(f, ")")
            }
            ExprKind::Agg {
                kind,
                arg,
                distinct,
                quantile,
            } => {
                write!(f, "{}(", kind)?;
                if *distinct {
                    write!(f, "DISTINCT ")?;
                }
                match arg {
                    Some(arg) => write!(f, "{}", arg)?,
                    None => write!(f, "*")?,
                }
                if let Some(q) = quantile {
                    write!(f, ", {}", q)?;
                }
                write!(f, ")")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int_col(column_id: usize, nest_level: usize) -> Arc<Expr> {
        Expr::column(1, column_id, nest_level, ColumnType::bigint())
    }

    #[test]
    fn test_conjunct_split() {
        let a = RexExpr::cmp("=", RexExpr::input(1, 0), RexExpr::literal(1i64, ColumnType::bigint()));
        let b = RexExpr::cmp(">", RexExpr::input(1, 1), RexExpr::literal(2i64, ColumnType::bigint()));
        let c = RexExpr::cmp("<", RexExpr::input(2, 0), RexExpr::input(1, 1));
        let pred = RexExpr::and(vec![a.clone(), RexExpr::and(vec![b.clone(), c.clone()])]);
        let terms = pred.conjuncts();
        assert_eq!(terms, vec![&a, &b, &c]);
        assert_eq!(c.input_sources().as_slice(), &[2, 1]);
    }

    #[test]
    fn test_fingerprint_is_structural() {
        let lhs = Expr::function(">", vec![int_col(0, 0), Expr::constant(Value::integer(3), ColumnType::bigint())], ColumnType::nullable(DataType::Boolean));
        let same = Expr::function(">", vec![int_col(0, 0), Expr::constant(Value::integer(3), ColumnType::bigint())], ColumnType::nullable(DataType::Boolean));
        let other = Expr::function(">", vec![int_col(1, 0), Expr::constant(Value::integer(3), ColumnType::bigint())], ColumnType::nullable(DataType::Boolean));
        assert_eq!(lhs.fingerprint(), same.fingerprint());
        assert_ne!(lhs.fingerprint(), other.fingerprint());
    }

    #[test]
    fn test_nest_levels_and_display() {
        let expr = Expr::function("=", vec![int_col(0, 0), int_col(2, 1)], ColumnType::nullable(DataType::Boolean));
        assert_eq!(expr.nest_levels().as_slice(), &[0, 1]);
        assert_eq!(expr.to_string(), "=($t1.c0@0, $t1.c2@1)");

        let count = Expr::agg(AggKind::Count, Some(int_col(0, 0)), true, None, ColumnType::bigint());
        assert!(count.is_distinct_agg());
        assert_eq!(count.to_string(), "COUNT(DISTINCT $t1.c0@0)");
    }
}
