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

//! EXPLAIN rendering of an execution sequence
//!
//! Steps are listed from the sink down, one per line, each indented one tab
//! deeper than the previous one:
//!
//! ```text
//! 2 : Sort#4
//!   : Compound#3
//! 	1 : Compound#3
//! ```

use std::fmt::Write;

use crate::core::Result;
use crate::ir::{QueryDag, RelNode};
use crate::plan::ExecutionSequence;

/// Render the steps of `seq` and the subqueries of `dag`
pub fn render_plan(dag: &QueryDag, seq: &ExecutionSequence) -> Result<String> {
    let mut out = String::new();
    let mut tabs = String::new();
    let mut index = seq.size();
    for descriptor in seq.descriptors().iter().rev() {
        let node = dag.node(descriptor.body())?;
        // Writing to a String cannot fail
        let _ = writeln!(out, "{}{} : {}", tabs, index, node);
        match node {
            RelNode::Sort(sort) => {
                let _ = writeln!(out, "{}  : {}", tabs, dag.node(sort.input)?);
            }
            RelNode::Project(project) => {
                write_join_input(&mut out, &tabs, dag, project.input)?;
            }
            RelNode::Compound(compound) => {
                write_join_input(&mut out, &tabs, dag, compound.input)?;
            }
            _ => {}
        }
        tabs.push('\t');
        index = index.saturating_sub(1);
    }

    let subqueries = dag.subqueries();
    if !subqueries.is_empty() {
        out.push_str("Subqueries: \n");
        for root in subqueries {
            let _ = writeln!(out, "\t{}", dag.node(*root)?);
        }
    }
    Ok(out)
}

fn write_join_input(out: &mut String, tabs: &str, dag: &QueryDag, input: u32) -> Result<()> {
    let node = dag.node(input)?;
    if let RelNode::LeftDeepInnerJoin(join) = node {
        let _ = write!(out, "{}  : {} [", tabs, node);
        for (i, inner) in join.inputs.iter().enumerate() {
            if i > 0 {
                out.push_str(", ");
            }
            let _ = write!(out, "{}", dag.node(*inner)?);
        }
        out.push_str("]\n");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ColumnType;
    use crate::ir::{QueryDagBuilder, RexExpr, SortField, TargetMetaInfo};

    fn cols() -> Vec<TargetMetaInfo> {
        vec![
            TargetMetaInfo::new("a", ColumnType::bigint()),
            TargetMetaInfo::new("b", ColumnType::bigint()),
        ]
    }

    #[test]
    fn test_render_single_step() {
        let mut b = QueryDagBuilder::new();
        let scan = b.scan(1, "t", cols());
        let project = b.project_named(scan, vec![RexExpr::input(scan, 0)], &["a"]);
        let dag = b.build(project).unwrap();
        let seq = ExecutionSequence::new(&dag).unwrap();
        let text = render_plan(&dag, &seq).unwrap();
        assert_eq!(text, format!("1 : {}\n", dag.node(project).unwrap()));
    }

    #[test]
    fn test_render_indents_each_step() {
        let mut b = QueryDagBuilder::new();
        let scan = b.scan(1, "t", cols());
        let project = b.project_named(scan, vec![RexExpr::input(scan, 0)], &["a"]);
        let agg = b.aggregate(project, 1, Vec::new());
        let sort = b.sort(agg, vec![SortField::asc(0)], Some(5), 0);
        let dag = b.build(sort).unwrap();
        let seq = ExecutionSequence::new(&dag).unwrap();
        let text = render_plan(&dag, &seq).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3, "{}", text);
        assert!(lines[0].starts_with("2 : Sort#"), "{}", text);
        assert!(lines[1].starts_with("  : Aggregate#"), "{}", text);
        assert!(lines[2].starts_with("\t1 : Project#"), "{}", text);
    }
}
