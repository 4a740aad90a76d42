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

//! Execution sequence
//!
//! Orders the nodes reachable from a sink so that every node comes after its
//! inputs, then drops the nodes that never become steps of their own:
//!
//! - scans, which are read directly by their consumer
//! - joins, which are folded into the step that consumes them
//! - the input of a Sort, which the Sort step executes itself
//!
//! The resulting [`ExecutionSequence`] is walked with a cursor. Descriptors
//! carry only the node id; step results live in the driver.

use rustc_hash::{FxHashMap, FxHashSet};

use crate::core::{Error, Result};
use crate::ir::{NodeId, NodeInputs, QueryDag, RelNode, RelNodeKind};

/// One step of an execution sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionDescriptor {
    body: NodeId,
    kind: RelNodeKind,
}

impl ExecutionDescriptor {
    /// Node executed by this step
    pub fn body(&self) -> NodeId {
        self.body
    }

    pub fn kind(&self) -> RelNodeKind {
        self.kind
    }
}

#[derive(Debug, Clone)]
struct Vertex {
    kind: RelNodeKind,
    inputs: NodeInputs,
}

/// Steps of one query in dependency order
#[derive(Debug, Clone)]
pub struct ExecutionSequence {
    vertices: FxHashMap<NodeId, Vertex>,
    /// Source-to-sink order with merged sort inputs removed
    ordering: Vec<NodeId>,
    /// Joins folded into their consumer
    joins: FxHashSet<NodeId>,
    descs: Vec<ExecutionDescriptor>,
    current_vertex: usize,
    scan_count: usize,
}

impl ExecutionSequence {
    /// Build the full sequence for the DAG root
    pub fn new(dag: &QueryDag) -> Result<Self> {
        Self::with_sink(dag, dag.root(), true)
    }

    /// Build a sequence rooted at `sink`; with `build_sequence` unset the
    /// cursor starts before the first step
    pub fn with_sink(dag: &QueryDag, sink: NodeId, build_sequence: bool) -> Result<Self> {
        let sink_node = dag.node(sink)?;
        if matches!(
            sink_node,
            RelNode::Scan(_) | RelNode::Join(_) | RelNode::LeftDeepInnerJoin(_)
        ) {
            return Err(Error::unsupported("Query not supported yet"));
        }

        let (vertices, ordering) = topological_order(dag, sink)?;
        let mut seq = Self {
            vertices,
            ordering,
            joins: FxHashSet::default(),
            descs: Vec::new(),
            current_vertex: 0,
            scan_count: 0,
        };
        let out_degrees = seq.out_degrees();
        seq.merge_sort_with_input(dag, &out_degrees)?;
        seq.joins = seq.join_vertices(&out_degrees)?;

        if build_sequence {
            while seq.next().is_some() {}
        }
        Ok(seq)
    }

    fn out_degrees(&self) -> FxHashMap<NodeId, usize> {
        let mut degrees = FxHashMap::default();
        for vertex in self.vertices.values() {
            for input in &vertex.inputs {
                *degrees.entry(*input).or_insert(0) += 1;
            }
        }
        degrees
    }

    fn kind_of(&self, id: NodeId) -> Option<RelNodeKind> {
        self.vertices.get(&id).map(|v| v.kind)
    }

    /// Remove each Sort's input from the ordering; the Sort step runs it
    fn merge_sort_with_input(&mut self, dag: &QueryDag, out_degrees: &FxHashMap<NodeId, usize>) -> Result<()> {
        let mut merged = FxHashSet::default();
        for id in &self.ordering {
            let RelNode::Sort(sort) = dag.node(*id)? else {
                continue;
            };
            if sort_source_is_scan(dag, sort.input)? {
                return Err(Error::unsupported("Standalone sort not supported yet"));
            }
            if out_degrees.get(&sort.input).copied().unwrap_or(0) > 1 {
                return Err(Error::unsupported(
                    "Sort's input node used by others not supported yet",
                ));
            }
            merged.insert(sort.input);
        }
        self.ordering.retain(|id| !merged.contains(id));
        Ok(())
    }

    fn join_vertices(&self, out_degrees: &FxHashMap<NodeId, usize>) -> Result<FxHashSet<NodeId>> {
        let mut joins = FxHashSet::default();
        for id in &self.ordering {
            let Some(vertex) = self.vertices.get(id) else {
                continue;
            };
            match vertex.kind {
                RelNodeKind::LeftDeepInnerJoin => {
                    joins.insert(*id);
                }
                RelNodeKind::Join => {
                    if out_degrees.get(id).copied().unwrap_or(0) > 1 {
                        return Err(Error::unsupported(
                            "Join used more than once not supported yet",
                        ));
                    }
                    if let Some(right) = vertex.inputs.get(1) {
                        if self.kind_of(*right) == Some(RelNodeKind::Join) {
                            return Err(Error::unsupported("Bushy joins not supported"));
                        }
                    }
                    joins.insert(*id);
                }
                _ => {}
            }
        }
        Ok(joins)
    }

    // =========================================================================
    // Cursor
    // =========================================================================

    /// Advance to the next step
    pub fn next(&mut self) -> Option<ExecutionDescriptor> {
        while self.current_vertex < self.ordering.len() {
            let id = self.ordering[self.current_vertex];
            self.current_vertex += 1;
            if self.joins.contains(&id) {
                continue;
            }
            let kind = self.kind_of(id)?;
            if kind == RelNodeKind::Scan {
                self.scan_count += 1;
                continue;
            }
            let desc = ExecutionDescriptor { body: id, kind };
            self.descs.push(desc);
            return Some(desc);
        }
        None
    }

    /// The step before the most recent one
    pub fn prev(&self) -> Option<ExecutionDescriptor> {
        if self.descs.len() < 2 {
            return None;
        }
        self.descs.get(self.descs.len() - 2).copied()
    }

    pub fn has_next(&self) -> bool {
        self.ordering[self.current_vertex..]
            .iter()
            .any(|id| !self.joins.contains(id) && self.kind_of(*id) != Some(RelNodeKind::Scan))
    }

    /// Rewind the cursor and forget visited steps
    pub fn reset(&mut self) {
        self.descs.clear();
        self.current_vertex = 0;
        self.scan_count = 0;
    }

    /// Steps visited so far
    pub fn size(&self) -> usize {
        self.descs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descs.is_empty()
    }

    pub fn get_descriptor(&self, idx: usize) -> Option<ExecutionDescriptor> {
        self.descs.get(idx).copied()
    }

    pub fn descriptors(&self) -> &[ExecutionDescriptor] {
        &self.descs
    }

    /// Scans skipped by the cursor so far
    pub fn scan_count(&self) -> usize {
        self.scan_count
    }

    /// Search backwards from `start_idx` for the step executing `body`
    pub fn get_descriptor_by_body_id(&self, body: NodeId, start_idx: usize) -> Option<(usize, ExecutionDescriptor)> {
        if start_idx >= self.descs.len() {
            return None;
        }
        self.descs[..=start_idx]
            .iter()
            .enumerate()
            .rev()
            .find(|(_, d)| d.body == body)
            .map(|(i, d)| (i, *d))
    }

    /// Index of the next step, or of the first step after the next barrier
    pub fn next_step_id(&self, after_broadcast: bool) -> Option<usize> {
        if self.current_vertex == self.ordering.len() {
            return None;
        }
        if after_broadcast {
            Some(self.descs.len() + self.steps_to_next_broadcast())
        } else {
            Some(self.descs.len())
        }
    }

    /// True when the remaining steps need no further barrier
    pub fn execution_finished(&self) -> bool {
        if self.current_vertex == self.ordering.len() {
            return true;
        }
        match self.next_step_id(true) {
            None => true,
            Some(next) => next == self.total_descriptors_count(),
        }
    }

    /// Number of steps in the whole sequence, visited or not
    pub fn total_descriptors_count(&self) -> usize {
        self.ordering
            .iter()
            .filter(|id| !self.joins.contains(id) && self.kind_of(**id) != Some(RelNodeKind::Scan))
            .count()
    }

    /// Steps from the cursor that can run before one reads a base table again
    pub fn steps_to_next_broadcast(&self) -> usize {
        let mut steps = 0;
        let mut crt = self.current_vertex;
        while crt < self.ordering.len() {
            let id = self.ordering[crt];
            crt += 1;
            let Some(vertex) = self.vertices.get(&id) else {
                return steps;
            };
            if self.joins.contains(&id) {
                if vertex
                    .inputs
                    .iter()
                    .any(|input| self.kind_of(*input) == Some(RelNodeKind::Scan))
                {
                    return steps;
                }
                if crt < self.ordering.len() - 1 {
                    // the join's consumer runs in the same phase
                    steps += 1;
                    crt += 1;
                    continue;
                }
                return steps + 1;
            }
            let mut vertex = vertex;
            if vertex.kind == RelNodeKind::Sort {
                match vertex.inputs.first().and_then(|input| self.vertices.get(input)) {
                    Some(input) => vertex = input,
                    None => return steps,
                }
            }
            if vertex.kind == RelNodeKind::Scan {
                return steps;
            }
            if vertex
                .inputs
                .iter()
                .any(|input| self.kind_of(*input) == Some(RelNodeKind::Scan))
            {
                return steps;
            }
            steps += 1;
        }
        steps
    }
}

/// Resolve a Sort's input through filters and report whether it ends at a scan
fn sort_source_is_scan(dag: &QueryDag, input: NodeId) -> Result<bool> {
    let mut node = dag.node(input)?;
    while let RelNode::Filter(filter) = node {
        node = dag.node(filter.input)?;
    }
    Ok(node.is_scan())
}

/// Postorder DFS from the sink: every node after all of its inputs
fn topological_order(dag: &QueryDag, sink: NodeId) -> Result<(FxHashMap<NodeId, Vertex>, Vec<NodeId>)> {
    let mut vertices: FxHashMap<NodeId, Vertex> = FxHashMap::default();
    let mut ordering = Vec::new();
    let mut visited = FxHashSet::default();
    // (node, next input to visit)
    let mut stack: Vec<(NodeId, usize)> = vec![(sink, 0)];
    visited.insert(sink);

    while let Some((id, next_input)) = stack.pop() {
        if !vertices.contains_key(&id) {
            let node = dag.node(id)?;
            // scans are leaves even when the planner attached inputs
            let inputs = if node.is_scan() {
                NodeInputs::new()
            } else {
                node.inputs()
            };
            vertices.insert(
                id,
                Vertex {
                    kind: node.kind(),
                    inputs,
                },
            );
        }
        let inputs = &vertices[&id].inputs;
        if next_input < inputs.len() {
            let input = inputs[next_input];
            stack.push((id, next_input + 1));
            if visited.insert(input) {
                stack.push((input, 0));
            }
        } else {
            ordering.push(id);
        }
    }
    Ok((vertices, ordering))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ColumnType;
    use crate::ir::{rex_true, JoinType, QueryDagBuilder, RexAgg, RexExpr, SortField, TargetMetaInfo};

    fn scan(b: &mut QueryDagBuilder, table_id: i32) -> NodeId {
        b.scan(
            table_id,
            "t",
            vec![
                TargetMetaInfo::new("a", ColumnType::bigint()),
                TargetMetaInfo::new("b", ColumnType::bigint()),
            ],
        )
    }

    fn bodies(seq: &ExecutionSequence) -> Vec<NodeId> {
        seq.descriptors().iter().map(|d| d.body()).collect()
    }

    #[test]
    fn test_sort_over_filtered_scan_rejected() {
        let mut b = QueryDagBuilder::new();
        let s = scan(&mut b, 1);
        let f = b.filter(s, rex_true());
        let sort = b.sort(f, vec![SortField::asc(0)], None, 0);
        let dag = b.build(sort).unwrap();
        let err = ExecutionSequence::new(&dag).unwrap_err();
        assert_eq!(err, Error::unsupported("Standalone sort not supported yet"));
    }

    #[test]
    fn test_bare_scan_and_join_sinks_rejected() {
        let mut b = QueryDagBuilder::new();
        let s1 = scan(&mut b, 1);
        let s2 = scan(&mut b, 2);
        let j = b.join(s1, s2, rex_true(), JoinType::Inner);
        let dag = b.build(j).unwrap();
        assert_eq!(
            ExecutionSequence::new(&dag).unwrap_err(),
            Error::unsupported("Query not supported yet")
        );
        assert!(ExecutionSequence::with_sink(&dag, s1, true).is_err());
    }

    #[test]
    fn test_sort_merges_its_input() {
        let mut b = QueryDagBuilder::new();
        let s = scan(&mut b, 1);
        let agg = b.aggregate(s, 1, vec![RexAgg::count_star()]);
        let sort = b.sort(agg, vec![SortField::desc(1)], Some(10), 0);
        let dag = b.build(sort).unwrap();
        let seq = ExecutionSequence::new(&dag).unwrap();
        assert_eq!(bodies(&seq), vec![sort]);
        assert_eq!(seq.scan_count(), 1);
        assert_eq!(seq.total_descriptors_count(), 1);
    }

    #[test]
    fn test_shared_sort_input_rejected() {
        let mut b = QueryDagBuilder::new();
        let s = scan(&mut b, 1);
        let p = b.project(s, vec![RexExpr::input(s, 0)]);
        let sort = b.sort(p, vec![SortField::asc(0)], None, 0);
        let u = b.union(vec![sort, p], true);
        let dag = b.build(u).unwrap();
        assert_eq!(
            ExecutionSequence::new(&dag).unwrap_err(),
            Error::unsupported("Sort's input node used by others not supported yet")
        );
    }

    #[test]
    fn test_joins_fold_into_consumer() {
        let mut b = QueryDagBuilder::new();
        let s1 = scan(&mut b, 1);
        let s2 = scan(&mut b, 2);
        let s3 = scan(&mut b, 3);
        let j1 = b.join(s1, s2, rex_true(), JoinType::Inner);
        let j2 = b.join(j1, s3, rex_true(), JoinType::Inner);
        let p = b.project(j2, vec![RexExpr::input(j2, 0)]);
        let dag = b.build(p).unwrap();
        let seq = ExecutionSequence::new(&dag).unwrap();
        assert_eq!(bodies(&seq), vec![p]);
    }

    #[test]
    fn test_bushy_and_shared_joins_rejected() {
        let mut b = QueryDagBuilder::new();
        let s1 = scan(&mut b, 1);
        let s2 = scan(&mut b, 2);
        let s3 = scan(&mut b, 3);
        let inner = b.join(s2, s3, rex_true(), JoinType::Inner);
        let outer = b.join(s1, inner, rex_true(), JoinType::Inner);
        let p = b.project(outer, vec![RexExpr::input(outer, 0)]);
        let dag = b.build(p).unwrap();
        assert_eq!(
            ExecutionSequence::new(&dag).unwrap_err(),
            Error::unsupported("Bushy joins not supported")
        );

        let mut b = QueryDagBuilder::new();
        let s1 = scan(&mut b, 1);
        let s2 = scan(&mut b, 2);
        let j = b.join(s1, s2, rex_true(), JoinType::Inner);
        let p1 = b.project(j, vec![RexExpr::input(j, 0)]);
        let p2 = b.project(j, vec![RexExpr::input(j, 1)]);
        let u = b.union(vec![p1, p2], true);
        let dag = b.build(u).unwrap();
        assert_eq!(
            ExecutionSequence::new(&dag).unwrap_err(),
            Error::unsupported("Join used more than once not supported yet")
        );
    }

    #[test]
    fn test_cursor_walk() {
        let mut b = QueryDagBuilder::new();
        let s = scan(&mut b, 1);
        let c = b.compound(s, None, 1, vec![RexExpr::input(s, 0)], &["a"], true);
        let p = b.project(c, vec![RexExpr::input(c, 0)]);
        let agg = b.aggregate(p, 1, vec![]);
        let dag = b.build(agg).unwrap();

        let mut seq = ExecutionSequence::with_sink(&dag, agg, false).unwrap();
        assert!(seq.is_empty());
        assert!(seq.has_next());
        assert_eq!(seq.total_descriptors_count(), 3);
        // the compound reads a scan, so nothing runs before the barrier
        assert_eq!(seq.next_step_id(true), Some(0));

        assert_eq!(seq.next().map(|d| d.body()), Some(c));
        assert_eq!(seq.prev(), None);
        assert_eq!(seq.steps_to_next_broadcast(), 2);
        assert!(seq.execution_finished());
        assert_eq!(seq.next().map(|d| d.kind()), Some(RelNodeKind::Project));
        assert_eq!(seq.prev().map(|d| d.body()), Some(c));
        assert_eq!(seq.next().map(|d| d.body()), Some(agg));
        assert!(seq.next().is_none());
        assert!(!seq.has_next());
        assert_eq!(seq.next_step_id(false), None);

        assert_eq!(seq.get_descriptor_by_body_id(c, 2).map(|(i, _)| i), Some(0));
        assert_eq!(seq.get_descriptor_by_body_id(agg, 1), None);
        assert_eq!(seq.get_descriptor_by_body_id(c, 9), None);

        seq.reset();
        assert_eq!(seq.size(), 0);
        assert_eq!(seq.next().map(|d| d.body()), Some(c));
    }

    #[test]
    fn test_shared_input_visited_once() {
        let mut b = QueryDagBuilder::new();
        let s = scan(&mut b, 1);
        let p = b.project(s, vec![RexExpr::input(s, 0)]);
        let left = b.project(p, vec![RexExpr::input(p, 0)]);
        let right = b.project(p, vec![RexExpr::input(p, 0)]);
        let u = b.union(vec![left, right], true);
        let dag = b.build(u).unwrap();
        let seq = ExecutionSequence::new(&dag).unwrap();
        let order = bodies(&seq);
        assert_eq!(order.len(), 4);
        assert_eq!(order[0], p);
        assert_eq!(order[3], u);
    }
}
