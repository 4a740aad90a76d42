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

//! Driver Tests
//!
//! End-to-end plans against an in-memory backend that evaluates work units
//! over small tables and reports the same failures a compiled engine does.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;

use raexec::core::{ColumnType, DataType, ExecutorDeviceType, Value};
use raexec::executor::{
    temporary_table_key, CompiledExecutor, ExecutionRequest, InMemoryCardinalityCache,
};
use raexec::ir::{AggKind, Expr, ExprKind, QueryDag, QueryDagBuilder, RexAgg, RexExpr, SortField, TargetMetaInfo};
use raexec::plan::{SortAlgorithm, StaticTableInfo};
use raexec::result_set::Cell;
use raexec::{
    Attempt, CompilationOptions, Error, ExecutionOptions, ExecutionUnit, ExecutorConfig,
    RelAlgExecutor, ResultSet, ResultSetBuilder, RetryReason, TargetInfo,
};

type Row = Vec<Option<i64>>;

#[derive(Debug, Clone, PartialEq)]
struct Call {
    device: ExecutorDeviceType,
    guess: usize,
    has_card: bool,
    count_all: bool,
}

/// Evaluates units over in-memory tables
///
/// Group-by output is capped at the entry guess (or `default_entry_guess`
/// when the guess is zero); overflowing it reports an out-of-slots error.
/// With `fragment_rows` set, a speculative top-N unit groups each chunk of
/// that many input rows on its own and appends the partial results, the way
/// per-fragment kernels return them unreduced.
struct TableEngine {
    tables: HashMap<i32, Vec<Row>>,
    gpu_row_limit: usize,
    fragment_rows: Option<usize>,
    default_entry_guess: usize,
    failures: Mutex<VecDeque<RetryReason>>,
    calls: Mutex<Vec<Call>>,
}

impl TableEngine {
    fn new() -> Self {
        Self {
            tables: HashMap::new(),
            gpu_row_limit: usize::MAX,
            fragment_rows: None,
            default_entry_guess: 4,
            failures: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    fn with_table(mut self, table_id: i32, rows: Vec<Row>) -> Self {
        self.tables.insert(table_id, rows);
        self
    }

    fn with_gpu_row_limit(mut self, limit: usize) -> Self {
        self.gpu_row_limit = limit;
        self
    }

    fn with_fragment_rows(mut self, rows: usize) -> Self {
        self.fragment_rows = Some(rows);
        self
    }

    fn fail_with(self, reasons: Vec<RetryReason>) -> Self {
        self.failures.lock().extend(reasons);
        self
    }

    fn work_calls(&self) -> Vec<Call> {
        self.calls.lock().iter().filter(|c| !c.count_all).cloned().collect()
    }

    fn input_rows(&self, request: &ExecutionRequest<'_>) -> Attempt<Vec<Row>> {
        let desc = request
            .unit
            .input_descs
            .first()
            .ok_or_else(|| Error::internal("unit without inputs"))?;
        if desc.table_id < 0 {
            let table = request.temporary_tables.get(desc.table_id)?;
            let mut rows = Vec::new();
            for frag in 0..table.frag_count() {
                if let Some(rs) = table.result_set(frag) {
                    for row in rs.rows(false)? {
                        rows.push(row.iter().map(Value::as_int64).collect());
                    }
                }
            }
            return Ok(rows);
        }
        let rows = self
            .tables
            .get(&desc.table_id)
            .ok_or_else(|| Error::internal(format!("unknown table {}", desc.table_id)))?;
        Ok(rows.clone())
    }
}

fn eval(expr: &Expr, row: &[Option<i64>]) -> Option<i64> {
    match &expr.kind {
        ExprKind::Column { column_id, .. } => row.get(*column_id).copied().flatten(),
        ExprKind::Constant(value) => value.as_int64(),
        ExprKind::Function { op, args } => {
            let values: Vec<Option<i64>> = args.iter().map(|a| eval(a, row)).collect();
            let truth = match (op.as_str(), values.as_slice()) {
                ("AND", _) => values.iter().all(|v| matches!(v, Some(v) if *v != 0)),
                ("=", [Some(a), Some(b)]) => a == b,
                ("<", [Some(a), Some(b)]) => a < b,
                (">", [Some(a), Some(b)]) => a > b,
                ("<=", [Some(a), Some(b)]) => a <= b,
                (">=", [Some(a), Some(b)]) => a >= b,
                _ => return None,
            };
            Some(truth as i64)
        }
        ExprKind::Agg { .. } => None,
    }
}

fn aggregate(expr: &Expr, group: &[&Row]) -> Option<i64> {
    match &expr.kind {
        ExprKind::Agg {
            kind: AggKind::Count,
            arg: None,
            ..
        } => Some(group.len() as i64),
        ExprKind::Agg {
            kind,
            arg: Some(arg),
            ..
        } => {
            let values = group.iter().filter_map(|row| eval(arg, row));
            match kind {
                AggKind::Count => Some(values.count() as i64),
                AggKind::Sum => values.reduce(|a, b| a + b),
                AggKind::Min => values.min(),
                AggKind::Max => values.max(),
                _ => None,
            }
        }
        _ => group.first().and_then(|row| eval(expr, row)),
    }
}

fn group_fragment(
    unit: &ExecutionUnit,
    key: &Expr,
    rows: &[Row],
    targets: Vec<TargetInfo>,
    capacity: usize,
) -> Attempt<ResultSet> {
    let mut groups: BTreeMap<Option<i64>, Vec<&Row>> = BTreeMap::new();
    for row in rows {
        groups.entry(eval(key, row)).or_default().push(row);
    }
    if groups.len() > capacity {
        return Err(RetryReason::execution_error(-1));
    }
    let mut b = ResultSetBuilder::group_by(targets, 1);
    for group in groups.values() {
        b.row(unit.target_exprs.iter().map(|t| cell(aggregate(t, group))).collect());
    }
    Ok(b.build()?)
}

fn passes(unit: &ExecutionUnit, row: &[Option<i64>]) -> bool {
    unit.simple_quals
        .iter()
        .chain(unit.quals.iter())
        .all(|q| matches!(eval(q, row), Some(v) if v != 0))
}

fn cell(value: Option<i64>) -> Cell {
    match value {
        Some(v) => Cell::from(v),
        None => Cell::Value(Value::null(DataType::BigInt)),
    }
}

fn targets_of(unit: &ExecutionUnit) -> Vec<TargetInfo> {
    unit.target_exprs
        .iter()
        .map(|t| match t.agg_kind() {
            Some(kind) => TargetInfo::agg(kind, t.ty),
            None => TargetInfo::column(t.ty),
        })
        .collect()
}

fn is_count_all(unit: &ExecutionUnit) -> bool {
    unit.is_projection()
        && matches!(unit.target_exprs.as_slice(), [t] if t.agg_kind() == Some(AggKind::Count) && t.agg_arg().is_none())
}

impl CompiledExecutor for TableEngine {
    fn execute_work_unit(&self, request: &ExecutionRequest<'_>) -> Attempt<ResultSet> {
        let unit = request.unit;
        let count_all = is_count_all(unit);
        self.calls.lock().push(Call {
            device: request.co.device_type,
            guess: request.max_groups_buffer_entry_guess,
            has_card: request.has_cardinality_estimation,
            count_all,
        });
        let rows: Vec<Row> = self
            .input_rows(request)?
            .into_iter()
            .filter(|row| passes(unit, row))
            .collect();
        if request.co.device_type == ExecutorDeviceType::Gpu && rows.len() > self.gpu_row_limit {
            return Err(RetryReason::QueryMustRunOnCpu);
        }
        if !count_all {
            if let Some(reason) = self.failures.lock().pop_front() {
                return Err(reason);
            }
        }

        let targets = targets_of(unit);
        match unit.groupby_exprs.as_slice() {
            [None] if !unit.has_agg_targets() => {
                let mut b = ResultSetBuilder::projection(targets);
                let take = if unit.scan_limit > 0 { unit.scan_limit } else { rows.len() };
                for row in rows.iter().take(take) {
                    b.row(unit.target_exprs.iter().map(|t| cell(eval(t, row))).collect());
                }
                Ok(b.build()?)
            }
            [None] => {
                let all: Vec<&Row> = rows.iter().collect();
                let mut b = ResultSetBuilder::non_grouped(targets);
                b.row(unit.target_exprs.iter().map(|t| cell(aggregate(t, &all))).collect());
                Ok(b.build()?)
            }
            [Some(key)] => {
                let capacity = match request.max_groups_buffer_entry_guess {
                    0 => self.default_entry_guess,
                    guess => guess,
                };
                let chunk = match self.fragment_rows {
                    Some(n) if unit.sort_info.algorithm == SortAlgorithm::SpeculativeTopN => n,
                    _ => rows.len(),
                }
                .max(1);
                let mut fragments = rows.chunks(chunk);
                let first = fragments.next().unwrap_or(&[]);
                let mut out = group_fragment(unit, key, first, targets.clone(), capacity)?;
                for fragment in fragments {
                    out.append(group_fragment(unit, key, fragment, targets.clone(), capacity)?)?;
                }
                Ok(out)
            }
            _ => Err(Error::unsupported("multi-key group by").into()),
        }
    }
}

// =============================================================================
// Fixtures
// =============================================================================

/// (k, v) pairs; group sizes are k1:5 k2:3 k3:7 k4:1 k5:3
fn sales() -> Vec<Row> {
    let mut rows = Vec::new();
    for (k, n) in [(1i64, 5i64), (2, 3), (3, 7), (4, 1), (5, 3)] {
        for i in 0..n {
            rows.push(vec![Some(k), Some(i + 1)]);
        }
    }
    rows
}

fn sales_columns() -> Vec<TargetMetaInfo> {
    vec![
        TargetMetaInfo::new("k", ColumnType::bigint()),
        TargetMetaInfo::new("v", ColumnType::bigint()),
    ]
}

fn tables(num_tuples: usize) -> Arc<StaticTableInfo> {
    Arc::new(StaticTableInfo::new().with_table(1, num_tuples))
}

fn ints(rs: &ResultSet) -> Vec<Vec<Option<i64>>> {
    rs.rows(false)
        .unwrap()
        .iter()
        .map(|row| row.iter().map(Value::as_int64).collect())
        .collect()
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("raexec=debug")
        .with_test_writer()
        .try_init();
}

fn run(executor: &mut RelAlgExecutor<'_>, co: &CompilationOptions) -> Vec<Vec<Option<i64>>> {
    init_tracing();
    let result = executor
        .execute_relalg_query(co, &ExecutionOptions::default())
        .unwrap();
    ints(result.rows().unwrap())
}

/// SELECT k, COUNT(*) FROM sales GROUP BY k ORDER BY 2 <dir> LIMIT n
fn top_keys(desc: bool, limit: usize) -> QueryDag {
    let mut b = QueryDagBuilder::new();
    let scan = b.scan(1, "sales", sales_columns());
    let agg = b.aggregate(scan, 1, vec![RexAgg::count_star()]);
    let field = if desc { SortField::desc(1) } else { SortField::asc(1) };
    let sort = b.sort(agg, vec![field], Some(limit), 0);
    b.build(sort).unwrap()
}

/// SELECT k, SUM(v) FROM sales GROUP BY k
fn sum_by_key() -> QueryDag {
    let mut b = QueryDagBuilder::new();
    let scan = b.scan(1, "sales", sales_columns());
    let agg = b.aggregate(
        scan,
        1,
        vec![RexAgg::new(
            AggKind::Sum,
            Some(RexExpr::input(scan, 1)),
            ColumnType::bigint(),
        )],
    );
    b.build(agg).unwrap()
}

fn row(values: &[i64]) -> Vec<Option<i64>> {
    values.iter().copied().map(Some).collect()
}

// =============================================================================
// Tests
// =============================================================================

#[test]
fn test_descending_top_n_is_answered_speculatively() {
    let dag = top_keys(true, 2);
    let engine = Arc::new(TableEngine::new().with_table(1, sales()));
    let mut executor = RelAlgExecutor::new(&dag, engine.clone(), tables(19));

    let rows = run(&mut executor, &CompilationOptions::default());
    assert_eq!(rows, vec![row(&[3, 7]), row(&[1, 5])]);
    assert!(executor.blacklist().is_empty());
    assert_eq!(engine.work_calls().len(), 1);
}

#[test]
fn test_ascending_top_n_falls_back_and_is_remembered() {
    let dag = top_keys(false, 2);
    let engine = Arc::new(TableEngine::new().with_table(1, sales()));
    let mut executor = RelAlgExecutor::new(&dag, engine.clone(), tables(19));

    let rows = run(&mut executor, &CompilationOptions::default());
    assert_eq!(rows, vec![row(&[4, 1]), row(&[2, 3])]);
    assert_eq!(executor.blacklist().len(), 1);
    assert_eq!(engine.work_calls().len(), 2);

    // a second query of the same shape goes straight to the full sort
    let blacklist = executor.blacklist().clone();
    let engine = Arc::new(TableEngine::new().with_table(1, sales()));
    let mut executor =
        RelAlgExecutor::new(&dag, engine.clone(), tables(19)).with_blacklist(blacklist);
    let rows = run(&mut executor, &CompilationOptions::default());
    assert_eq!(rows, vec![row(&[4, 1]), row(&[2, 3])]);
    assert_eq!(engine.work_calls().len(), 1);
}

#[test]
fn test_descending_top_n_over_fragments_is_reduced() {
    let dag = top_keys(true, 2);
    let engine = Arc::new(
        TableEngine::new()
            .with_table(1, sales())
            .with_fragment_rows(8),
    );
    let mut executor = RelAlgExecutor::new(&dag, engine.clone(), tables(19));

    // fragments hold k1:5 k2:3 | k3:7 k4:1 | k5:3
    let rows = run(&mut executor, &CompilationOptions::default());
    assert_eq!(rows, vec![row(&[3, 7]), row(&[1, 5])]);
    assert!(executor.blacklist().is_empty());
    assert_eq!(engine.work_calls().len(), 1);
}

#[test]
fn test_descending_top_n_fails_when_fragments_disagree() {
    // each fragment's heaviest key is the other's runner-up
    let mut skewed = Vec::new();
    for (k, n) in [(1i64, 10), (2, 9), (2, 10), (3, 9)] {
        skewed.extend((0..n).map(|i| vec![Some(k), Some(i)]));
    }
    let dag = top_keys(true, 1);
    let engine = Arc::new(
        TableEngine::new()
            .with_table(1, skewed)
            .with_fragment_rows(19),
    );
    let mut executor = RelAlgExecutor::new(&dag, engine.clone(), tables(38));

    let rows = run(&mut executor, &CompilationOptions::default());
    assert_eq!(rows, vec![row(&[2, 19])]);
    assert_eq!(executor.blacklist().len(), 1);
    assert_eq!(engine.work_calls().len(), 2);
}

#[test]
fn test_cpu_retry_matches_cpu_only_run() {
    let dag = sum_by_key();

    let gpu_engine = Arc::new(TableEngine::new().with_table(1, sales()).with_gpu_row_limit(5));
    let mut executor = RelAlgExecutor::new(&dag, gpu_engine.clone(), tables(19));
    let retried = run(&mut executor, &CompilationOptions::default());

    let cpu_engine = Arc::new(TableEngine::new().with_table(1, sales()));
    let mut executor = RelAlgExecutor::new(&dag, cpu_engine.clone(), tables(19));
    let cpu_only = run(
        &mut executor,
        &CompilationOptions::default_for(ExecutorDeviceType::Cpu),
    );

    assert_eq!(retried, cpu_only);
    assert_eq!(
        retried,
        vec![row(&[1, 15]), row(&[2, 6]), row(&[3, 28]), row(&[4, 1]), row(&[5, 6])]
    );
    let devices: Vec<_> = gpu_engine.work_calls().iter().map(|c| c.device).collect();
    assert_eq!(devices, vec![ExecutorDeviceType::Gpu, ExecutorDeviceType::Cpu]);
}

#[test]
fn test_gpu_only_query_fails_without_cpu_retry() {
    let dag = sum_by_key();
    let engine = Arc::new(TableEngine::new().with_table(1, sales()).with_gpu_row_limit(5));
    let mut executor =
        RelAlgExecutor::new(&dag, engine, tables(19)).with_config(ExecutorConfig::no_retry());
    init_tracing();
    let err = executor
        .execute_relalg_query(&CompilationOptions::default(), &ExecutionOptions::default())
        .unwrap_err();
    assert!(matches!(err, Error::RetryNotAllowed(_)));
}

#[test]
fn test_out_of_slots_triggers_cardinality_estimation() {
    let dag = sum_by_key();
    let config = ExecutorConfig {
        default_max_groups_buffer_entry_guess: 2,
        ..ExecutorConfig::default()
    };
    let cache = Arc::new(InMemoryCardinalityCache::new());

    // a large table makes the group count untrusted
    let engine = Arc::new(TableEngine::new().with_table(1, sales()));
    let mut executor = RelAlgExecutor::new(&dag, engine.clone(), tables(1_000_000))
        .with_config(config.clone())
        .with_cardinality_cache(cache.clone());
    let rows = run(&mut executor, &CompilationOptions::default());
    assert_eq!(rows.len(), 5);

    let calls = engine.work_calls();
    assert_eq!(calls.len(), 2);
    assert_eq!((calls[0].guess, calls[0].has_card), (2, false));
    assert_eq!((calls[1].guess, calls[1].has_card), (1_000_000, true));
    assert_eq!(cache.len(), 1);

    // the cached estimate is used on the first attempt next time
    let engine = Arc::new(TableEngine::new().with_table(1, sales()));
    let mut executor = RelAlgExecutor::new(&dag, engine.clone(), tables(1_000_000))
        .with_config(config)
        .with_cardinality_cache(cache);
    run(&mut executor, &CompilationOptions::default());
    let calls = engine.work_calls();
    assert_eq!(calls.len(), 1);
    assert_eq!((calls[0].guess, calls[0].has_card), (1_000_000, true));
}

#[test]
fn test_gpu_out_of_memory_grows_cpu_buffer() {
    let dag = sum_by_key();
    let config = ExecutorConfig {
        default_max_groups_buffer_entry_guess: 2,
        ..ExecutorConfig::default()
    };
    let engine = Arc::new(
        TableEngine::new()
            .with_table(1, sales())
            .fail_with(vec![RetryReason::execution_error(2)]),
    );
    let mut executor = RelAlgExecutor::new(&dag, engine.clone(), tables(19)).with_config(config);
    let rows = run(&mut executor, &CompilationOptions::default());
    assert_eq!(rows.len(), 5);

    // GPU attempt, then CPU with the engine default (4 slots), then 2, 4, 8
    let calls = engine.work_calls();
    let guesses: Vec<usize> = calls.iter().map(|c| c.guess).collect();
    assert_eq!(guesses, vec![2, 0, 2, 4, 8]);
    assert_eq!(calls[0].device, ExecutorDeviceType::Gpu);
    assert!(calls[1..].iter().all(|c| c.device == ExecutorDeviceType::Cpu && c.has_card));
}

#[test]
fn test_watchdog_caps_buffer_growth() {
    let dag = sum_by_key();
    let config = ExecutorConfig {
        default_max_groups_buffer_entry_guess: 1,
        watchdog_enabled: true,
        ..ExecutorConfig::default()
    };
    let mut engine = TableEngine::new()
        .with_table(1, sales())
        .fail_with(vec![RetryReason::execution_error(2)]);
    engine.default_entry_guess = 1;
    let engine = Arc::new(engine);
    let mut executor = RelAlgExecutor::new(&dag, engine.clone(), tables(19)).with_config(config);
    let err = executor
        .execute_relalg_query(&CompilationOptions::default(), &ExecutionOptions::default())
        .unwrap_err();
    assert_eq!(err, Error::OutOfOutputSlots);
    assert_eq!(engine.work_calls().len(), 4);
}

#[test]
fn test_multi_step_plan_reads_temporary_tables() {
    // SELECT c, k FROM (SELECT k, COUNT(*) c FROM sales GROUP BY k)
    // ORDER BY c DESC, k LIMIT 2 OFFSET 1
    let mut b = QueryDagBuilder::new();
    let scan = b.scan(1, "sales", sales_columns());
    let agg = b.aggregate(scan, 1, vec![RexAgg::count_star()]);
    let project = b.project(agg, vec![RexExpr::input(agg, 1), RexExpr::input(agg, 0)]);
    let sort = b.sort(project, vec![SortField::desc(0), SortField::asc(1)], Some(2), 1);
    let dag = b.build(sort).unwrap();

    let engine = Arc::new(TableEngine::new().with_table(1, sales()));
    let mut executor = RelAlgExecutor::new(&dag, engine.clone(), tables(19));
    let rows = run(&mut executor, &CompilationOptions::default());
    assert_eq!(rows, vec![row(&[5, 1]), row(&[3, 2])]);
    assert!(executor
        .temporary_tables()
        .contains(temporary_table_key(agg)));
    assert!(executor.step_result(agg).is_some());
}

#[test]
fn test_filter_step_feeds_projection() {
    // SELECT v FROM sales WHERE k = 3 AND v > 4
    let mut b = QueryDagBuilder::new();
    let scan = b.scan(1, "sales", sales_columns());
    let filter = b.filter(
        scan,
        RexExpr::and(vec![
            RexExpr::cmp(
                "=",
                RexExpr::input(scan, 0),
                RexExpr::literal(3i64, ColumnType::bigint()),
            ),
            RexExpr::cmp(
                ">",
                RexExpr::input(scan, 1),
                RexExpr::literal(4i64, ColumnType::bigint()),
            ),
        ]),
    );
    let project = b.project(filter, vec![RexExpr::input(filter, 1)]);
    let dag = b.build(project).unwrap();

    let engine = Arc::new(TableEngine::new().with_table(1, sales()));
    let mut executor = RelAlgExecutor::new(&dag, engine.clone(), tables(19));
    let rows = run(&mut executor, &CompilationOptions::default());
    assert_eq!(rows, vec![row(&[5]), row(&[6]), row(&[7])]);
}

#[test]
fn test_sort_directly_over_filtered_scan_is_rejected() {
    let mut b = QueryDagBuilder::new();
    let scan = b.scan(1, "sales", sales_columns());
    let filter = b.filter(
        scan,
        RexExpr::cmp(
            ">",
            RexExpr::input(scan, 1),
            RexExpr::literal(1i64, ColumnType::bigint()),
        ),
    );
    let sort = b.sort(filter, vec![SortField::asc(0)], None, 0);
    let project = b.project(sort, vec![RexExpr::input(sort, 0)]);
    let dag = b.build(project).unwrap();

    let engine = Arc::new(TableEngine::new().with_table(1, sales()));
    let mut executor = RelAlgExecutor::new(&dag, engine.clone(), tables(19));
    let err = executor
        .execute_relalg_query(&CompilationOptions::default(), &ExecutionOptions::default())
        .unwrap_err();
    assert_eq!(err, Error::unsupported("Standalone sort not supported yet"));
    assert!(engine.calls.lock().is_empty());
}
