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

//! Streaming execution
//!
//! A single-step query is compiled once and then fed fragment batches. Each
//! batch returns its partial result; `finish_streaming_execution` returns the
//! reduction of all batches.

use tracing::{debug, info};

use crate::core::{Error, Result};
use crate::ir::{NodeId, RelNode, TargetMetaInfo};
use crate::plan::{ExecutionSequence, SortInfo};
use crate::result_set::ResultSet;

use super::backend::{FragmentsPerTable, StreamingKernel};
use super::driver::RelAlgExecutor;
use super::options::{CompilationOptions, ExecutionOptions};

/// A prepared streaming query
pub(super) struct StreamingState {
    kernel: Box<dyn StreamingKernel>,
    body: NodeId,
    targets_meta: Vec<TargetMetaInfo>,
}

impl RelAlgExecutor<'_> {
    /// Compile the query for batch execution
    pub fn prepare_streaming_execution(
        &mut self,
        co: &CompilationOptions,
        eo: &ExecutionOptions,
    ) -> Result<()> {
        let dag = self.dag();
        if !dag.subqueries().is_empty() {
            return Err(Error::unsupported(
                "Streaming queries with subqueries are not supported yet",
            ));
        }
        let seq = ExecutionSequence::new(dag)?;
        if seq.size() != 1 {
            return Err(Error::unsupported(
                "Multistep streaming queries are not supported yet",
            ));
        }
        let body = seq
            .get_descriptor(0)
            .ok_or_else(|| Error::internal("empty execution sequence"))?
            .body();
        let is_agg = match dag.node(body)? {
            RelNode::Compound(compound) => compound.is_agg,
            RelNode::Aggregate(_) => true,
            RelNode::Project(_) | RelNode::Filter(_) => false,
            _ => {
                return Err(Error::unsupported(
                    "that query type is not supported in streaming mode",
                ))
            }
        };

        let work_unit =
            self.with_translator(|t| t.create_work_unit(body, SortInfo::none(), eo.just_explain))?;
        let unit = self.decide_approx_count_distinct(&work_unit.exe_unit);
        let kernel = self.backend().prepare_streaming(&unit, co, eo, is_agg)?;
        info!(node = body, is_agg, "streaming query prepared");
        self.streaming = Some(StreamingState {
            kernel,
            body,
            targets_meta: dag.output_meta(body)?,
        });
        Ok(())
    }

    pub fn is_streaming_prepared(&self) -> bool {
        self.streaming.is_some()
    }

    /// Output columns of the prepared query
    pub fn streaming_targets_meta(&self) -> Option<&[TargetMetaInfo]> {
        self.streaming.as_ref().map(|s| s.targets_meta.as_slice())
    }

    /// Run the prepared query over one batch of fragments
    pub fn run_on_batch(&mut self, fragments: &FragmentsPerTable) -> Result<ResultSet> {
        self.context().check_interrupted()?;
        let state = self.streaming.as_mut().ok_or_else(|| {
            Error::invalid_argument("streaming execution was not prepared")
        })?;
        debug!(node = state.body, tables = fragments.len(), "running streaming batch");
        state.kernel.run_on_batch(fragments)
    }

    /// Reduce all batches and release the prepared query
    pub fn finish_streaming_execution(&mut self) -> Result<ResultSet> {
        let state = self.streaming.take().ok_or_else(|| {
            Error::invalid_argument("streaming execution was not prepared")
        })?;
        debug!(node = state.body, "finishing streaming execution");
        state.kernel.finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;
    use crate::core::{ColumnType, Value};
    use crate::executor::{Attempt, CompiledExecutor, ExecutionRequest};
    use crate::ir::{QueryDagBuilder, RexAgg, RexExpr, SortField};
    use crate::plan::{ExecutionUnit, StaticTableInfo};
    use crate::result_set::{Cell, ResultSetBuilder, TargetInfo};

    /// Counts the fragments of every batch
    struct CountingKernel {
        total: i64,
    }

    impl CountingKernel {
        fn result(total: i64) -> Result<ResultSet> {
            let mut b = ResultSetBuilder::non_grouped(vec![TargetInfo::agg(
                crate::ir::AggKind::Count,
                ColumnType::bigint(),
            )]);
            b.row(vec![Cell::from(total)]);
            b.build()
        }
    }

    impl StreamingKernel for CountingKernel {
        fn run_on_batch(&mut self, fragments: &FragmentsPerTable) -> Result<ResultSet> {
            let batch: usize = fragments.values().map(Vec::len).sum();
            self.total += batch as i64;
            Self::result(batch as i64)
        }

        fn finish(self: Box<Self>) -> Result<ResultSet> {
            Self::result(self.total)
        }
    }

    #[derive(Default)]
    struct StreamingEngine {
        prepared: Mutex<Vec<bool>>,
    }

    impl CompiledExecutor for StreamingEngine {
        fn execute_work_unit(&self, _request: &ExecutionRequest<'_>) -> Attempt<ResultSet> {
            Err(Error::internal("not used").into())
        }

        fn prepare_streaming(
            &self,
            _unit: &ExecutionUnit,
            _co: &CompilationOptions,
            _eo: &ExecutionOptions,
            is_agg: bool,
        ) -> Result<Box<dyn StreamingKernel>> {
            self.prepared.lock().push(is_agg);
            Ok(Box::new(CountingKernel { total: 0 }))
        }
    }

    fn cols() -> Vec<TargetMetaInfo> {
        vec![TargetMetaInfo::new("a", ColumnType::bigint())]
    }

    fn tables() -> Arc<StaticTableInfo> {
        Arc::new(StaticTableInfo::new().with_table(1, 100))
    }

    #[test]
    fn test_batches_then_finish() {
        let mut b = QueryDagBuilder::new();
        let s = b.scan(1, "t", cols());
        let a = b.aggregate(s, 0, vec![RexAgg::count_star()]);
        let dag = b.build(a).unwrap();
        let engine = Arc::new(StreamingEngine::default());
        let mut executor = RelAlgExecutor::new(&dag, engine.clone(), tables());

        let batch = FragmentsPerTable::from_iter([(1, vec![0, 1, 2])]);
        assert!(matches!(executor.run_on_batch(&batch), Err(Error::InvalidArgument(_))));

        executor
            .prepare_streaming_execution(&CompilationOptions::default(), &ExecutionOptions::default())
            .unwrap();
        assert!(executor.is_streaming_prepared());
        assert_eq!(*engine.prepared.lock(), vec![true]);
        assert_eq!(executor.streaming_targets_meta().unwrap().len(), 1);

        let first = executor.run_on_batch(&batch).unwrap();
        assert_eq!(first.rows(false).unwrap(), vec![vec![Value::integer(3)]]);
        executor
            .run_on_batch(&FragmentsPerTable::from_iter([(1, vec![3, 4])]))
            .unwrap();
        let total = executor.finish_streaming_execution().unwrap();
        assert_eq!(total.rows(false).unwrap(), vec![vec![Value::integer(5)]]);
        assert!(!executor.is_streaming_prepared());
    }

    #[test]
    fn test_rejects_multistep_and_subqueries() {
        let mut b = QueryDagBuilder::new();
        let s = b.scan(1, "t", cols());
        let p = b.project(s, vec![RexExpr::input(s, 0)]);
        let sort = b.sort(p, vec![SortField::asc(0)], None, 0);
        let outer = b.project(sort, vec![RexExpr::input(sort, 0)]);
        let dag = b.build(outer).unwrap();
        let mut executor = RelAlgExecutor::new(&dag, Arc::new(StreamingEngine::default()), tables());
        let err = executor
            .prepare_streaming_execution(&CompilationOptions::default(), &ExecutionOptions::default())
            .unwrap_err();
        assert_eq!(
            err,
            Error::unsupported("Multistep streaming queries are not supported yet")
        );

        let mut b = QueryDagBuilder::new();
        let s = b.scan(1, "t", cols());
        let sub = b.aggregate(s, 0, vec![RexAgg::count_star()]);
        let p = b.project(s, vec![RexExpr::input(s, 0)]);
        b.subquery(sub);
        let dag = b.build(p).unwrap();
        let mut executor = RelAlgExecutor::new(&dag, Arc::new(StreamingEngine::default()), tables());
        let err = executor
            .prepare_streaming_execution(&CompilationOptions::default(), &ExecutionOptions::default())
            .unwrap_err();
        assert_eq!(
            err,
            Error::unsupported("Streaming queries with subqueries are not supported yet")
        );
    }

    #[test]
    fn test_default_backend_rejects_streaming() {
        struct Plain;
        impl CompiledExecutor for Plain {
            fn execute_work_unit(&self, _request: &ExecutionRequest<'_>) -> Attempt<ResultSet> {
                Err(Error::internal("not used").into())
            }
        }
        let mut b = QueryDagBuilder::new();
        let s = b.scan(1, "t", cols());
        let p = b.project(s, vec![RexExpr::input(s, 0)]);
        let dag = b.build(p).unwrap();
        let mut executor = RelAlgExecutor::new(&dag, Arc::new(Plain), tables());
        let err = executor
            .prepare_streaming_execution(&CompilationOptions::default(), &ExecutionOptions::default())
            .unwrap_err();
        assert_eq!(
            err,
            Error::unsupported("that query type is not supported in streaming mode")
        );
        assert!(!executor.is_streaming_prepared());
    }
}
