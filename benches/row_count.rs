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

//! Row counting over sparse group-by buffers and projections
//!
//! Run with: cargo bench --bench row_count

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use raexec::core::ColumnType;
use raexec::ir::AggKind;
use raexec::result_set::Cell;
use raexec::{ResultSet, ResultSetBuilder, TargetInfo};

fn targets() -> Vec<TargetInfo> {
    vec![
        TargetInfo::column(ColumnType::bigint()),
        TargetInfo::agg(AggKind::Count, ColumnType::bigint()),
    ]
}

/// Group-by buffer where every third entry is empty
fn sparse_group_by(entries: usize) -> ResultSet {
    let mut b = ResultSetBuilder::group_by(targets(), 1);
    for i in 0..entries {
        if i % 3 == 0 {
            b.empty_entry();
        } else {
            b.row(vec![Cell::from(i as i64), Cell::from(1i64)]);
        }
    }
    b.build().unwrap()
}

fn projection(rows: usize) -> ResultSet {
    let mut b = ResultSetBuilder::projection(targets());
    for i in 0..rows {
        b.row(vec![Cell::from(i as i64), Cell::from(1i64)]);
    }
    b.extra_capacity(rows / 2);
    b.build().unwrap()
}

fn bench_group_by_row_count(c: &mut Criterion) {
    let mut group = c.benchmark_group("Group-by row count");

    for entries in [10_000usize, 1_000_000] {
        let rs = sparse_group_by(entries);

        group.bench_with_input(BenchmarkId::new("default", entries), &rs, |b, rs| {
            b.iter(|| {
                rs.invalidate_cached_row_count();
                black_box(rs.row_count(false));
            });
        });

        group.bench_with_input(BenchmarkId::new("forced parallel", entries), &rs, |b, rs| {
            b.iter(|| black_box(rs.row_count(true)));
        });
    }

    group.finish();
}

fn bench_projection_row_count(c: &mut Criterion) {
    let mut group = c.benchmark_group("Projection row count");

    let mut rs = projection(1_000_000);
    group.bench_function("binary search", |b| {
        b.iter(|| {
            rs.invalidate_cached_row_count();
            black_box(rs.row_count(false));
        });
    });

    rs.drop_first_n(1_000);
    rs.keep_first_n(10_000);
    group.bench_function("binary search with limit", |b| {
        b.iter(|| {
            rs.invalidate_cached_row_count();
            black_box(rs.row_count(false));
        });
    });

    group.finish();
}

criterion_group!(benches, bench_group_by_row_count, bench_projection_row_count);
criterion_main!(benches);
