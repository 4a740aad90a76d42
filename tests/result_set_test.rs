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

//! Result Set Tests
//!
//! Row counting, LIMIT/OFFSET, append and sorting across buffer layouts

use raexec::core::{ColumnType, DataType, Value};
use raexec::ir::AggKind;
use raexec::result_set::{Cell, ResultSet, ResultSetBuilder, SortConfig, TargetInfo};
use raexec::OrderEntry;

fn null() -> Cell {
    Cell::Value(Value::null(DataType::BigInt))
}

fn key_count_targets() -> Vec<TargetInfo> {
    vec![
        TargetInfo::column(ColumnType::bigint()),
        TargetInfo::agg(AggKind::Count, ColumnType::bigint()),
    ]
}

/// The same six groups in five buffer layouts
fn layouts() -> Vec<(&'static str, ResultSet)> {
    let groups: Vec<(i64, i64)> = vec![(1, 10), (2, 20), (3, 30), (4, 40), (5, 50), (6, 60)];
    let fill = |b: &mut ResultSetBuilder, with_holes: bool| {
        for (i, (k, c)) in groups.iter().enumerate() {
            if with_holes && i % 2 == 1 {
                b.empty_entry();
            }
            b.row(vec![Cell::from(*k), Cell::from(*c)]);
        }
    };

    let mut out = Vec::new();

    let mut b = ResultSetBuilder::projection(key_count_targets());
    fill(&mut b, false);
    b.extra_capacity(3);
    out.push(("projection", b.build().unwrap()));

    let mut b = ResultSetBuilder::projection(key_count_targets());
    fill(&mut b, false);
    b.columnar(true);
    out.push(("columnar projection", b.build().unwrap()));

    let mut b = ResultSetBuilder::group_by(key_count_targets(), 1);
    fill(&mut b, true);
    out.push(("group by", b.build().unwrap()));

    let mut b = ResultSetBuilder::group_by(key_count_targets(), 1);
    fill(&mut b, true);
    b.columnar(true);
    out.push(("columnar group by", b.build().unwrap()));

    let mut b = ResultSetBuilder::group_by(key_count_targets(), 1);
    fill(&mut b, true);
    b.compact_slots(true);
    out.push(("compact group by", b.build().unwrap()));

    out
}

fn ints(rs: &ResultSet, col: usize) -> Vec<Option<i64>> {
    rs.rows(false)
        .unwrap()
        .iter()
        .map(|row| row[col].as_int64())
        .collect()
}

#[test]
fn test_row_count_matches_iteration_in_every_layout() {
    for (name, rs) in layouts() {
        let iterated = rs.rows(false).unwrap().len();
        assert_eq!(rs.row_count(false), 6, "{}", name);
        assert_eq!(rs.row_count(true), 6, "{} (parallel)", name);
        assert_eq!(iterated, 6, "{}", name);
    }
}

#[test]
fn test_row_count_matches_iteration_after_sort() {
    let by_count = [OrderEntry::new(2, true, false)];
    for (name, mut rs) in layouts() {
        rs.sort(&by_count, 0, &SortConfig::default()).unwrap();
        assert!(!rs.permutation().is_empty(), "{}", name);
        rs.invalidate_cached_row_count();
        assert_eq!(rs.row_count(false), 6, "{} (sorted)", name);
        assert_eq!(rs.row_count(true), 6, "{} (sorted, parallel)", name);
        assert_eq!(rs.rows(false).unwrap().len(), 6, "{} (sorted)", name);

        rs.drop_first_n(1);
        rs.keep_first_n(4);
        assert_eq!(rs.row_count(false), 4, "{} (sorted, limited)", name);
        assert_eq!(rs.row_count(true), 4, "{} (sorted, limited, parallel)", name);
        assert_eq!(ints(&rs, 1), vec![Some(50), Some(40), Some(30), Some(20)], "{}", name);

        // a top-n permutation only holds the first rows
        let mut top = layouts().into_iter().find(|(n, _)| *n == name).unwrap().1;
        top.sort(&by_count, 3, &SortConfig::default()).unwrap();
        assert_eq!(top.row_count(false), 3, "{} (top-n)", name);
        assert_eq!(top.row_count(true), 3, "{} (top-n, parallel)", name);
        assert_eq!(top.rows(false).unwrap().len(), 3, "{} (top-n)", name);
    }
}

#[test]
fn test_limit_offset_in_every_layout() {
    for (name, mut rs) in layouts() {
        rs.drop_first_n(2);
        rs.keep_first_n(3);
        assert_eq!(rs.row_count(false), 3, "{}", name);
        assert_eq!(ints(&rs, 0), vec![Some(3), Some(4), Some(5)], "{}", name);

        // setting the same values again changes nothing
        rs.drop_first_n(2);
        rs.keep_first_n(3);
        assert_eq!(rs.row_count(false), 3, "{}", name);

        rs.drop_first_n(10);
        assert_eq!(rs.row_count(false), 0, "{}", name);
        assert!(rs.rows(false).unwrap().is_empty(), "{}", name);
    }
}

#[test]
fn test_sort_permutation_excludes_empty_entries() {
    for (name, mut rs) in layouts() {
        rs.sort(&[OrderEntry::new(2, true, false)], 0, &SortConfig::default())
            .unwrap();
        assert_eq!(rs.permutation().len(), 6, "{}", name);
        assert_eq!(
            ints(&rs, 1),
            vec![Some(60), Some(50), Some(40), Some(30), Some(20), Some(10)],
            "{}",
            name
        );
    }
}

#[test]
fn test_top_n_keeps_first_rows_of_full_sort() {
    let build = || {
        let mut b = ResultSetBuilder::projection(vec![TargetInfo::column(ColumnType::bigint())]);
        for v in [9i64, 2, 7, 4, 5, 1, 8, 3, 6, 0] {
            b.row(vec![Cell::from(v)]);
        }
        b.build().unwrap()
    };
    let asc = [OrderEntry::new(1, false, false)];

    let mut full = build();
    full.sort(&asc, 0, &SortConfig::default()).unwrap();
    let mut top = build();
    top.sort(&asc, 4, &SortConfig::default()).unwrap();
    assert_eq!(ints(&top, 0), ints(&full, 0)[..4].to_vec());

    // parallel top-n once the entry count passes the threshold
    let config = SortConfig {
        parallel_top_min: 2,
        ..SortConfig::default()
    };
    let mut parallel = build();
    parallel.sort(&asc, 4, &config).unwrap();
    assert_eq!(ints(&parallel, 0), vec![Some(0), Some(1), Some(2), Some(3)]);
}

#[test]
fn test_sort_is_stable_on_ties() {
    let mut b = ResultSetBuilder::projection(vec![
        TargetInfo::column(ColumnType::bigint()),
        TargetInfo::column(ColumnType::bigint()),
    ]);
    for (k, tag) in [(1i64, 0i64), (0, 1), (1, 2), (0, 3), (1, 4)] {
        b.row(vec![Cell::from(k), Cell::from(tag)]);
    }
    let mut rs = b.build().unwrap();
    rs.sort(&[OrderEntry::new(1, false, false)], 0, &SortConfig::default())
        .unwrap();
    assert_eq!(
        ints(&rs, 1),
        vec![Some(1), Some(3), Some(0), Some(2), Some(4)]
    );
}

#[test]
fn test_nulls_sort_last_ascending() {
    // columnar output takes the single column fast path
    for columnar in [false, true] {
        let mut b = ResultSetBuilder::projection(vec![TargetInfo::column(ColumnType::bigint())]);
        for cell in [Cell::from(5i64), null(), Cell::from(3i64), null(), Cell::from(1i64)] {
            b.row(vec![cell]);
        }
        b.columnar(columnar);
        let mut rs = b.build().unwrap();
        rs.sort(&[OrderEntry::new(1, false, false)], 0, &SortConfig::default())
            .unwrap();
        assert_eq!(ints(&rs, 0), vec![Some(1), Some(3), Some(5), None, None], "columnar={}", columnar);

        rs.sort(&[OrderEntry::new(1, false, true)], 0, &SortConfig::default())
            .unwrap();
        assert_eq!(ints(&rs, 0), vec![None, None, Some(1), Some(3), Some(5)], "columnar={}", columnar);
    }
}

#[test]
fn test_append_sums_row_counts() {
    let part = |values: &[i64]| {
        let mut b = ResultSetBuilder::projection(vec![TargetInfo::column(ColumnType::bigint())]);
        for v in values {
            b.row(vec![Cell::from(*v)]);
        }
        b.build().unwrap()
    };
    let mut rs = part(&[1, 2, 3]);
    let before = rs.row_count(false);
    rs.append(part(&[4, 5])).unwrap();
    rs.append(part(&[])).unwrap();
    rs.append(part(&[6])).unwrap();
    assert_eq!(before, 3);
    assert_eq!(rs.row_count(false), 6);
    assert_eq!(
        ints(&rs, 0),
        (1..=6).map(Some).collect::<Vec<_>>()
    );

    rs.sort(&[OrderEntry::new(1, true, false)], 0, &SortConfig::default())
        .unwrap();
    assert_eq!(ints(&rs, 0).first(), Some(&Some(6)));
}

#[test]
fn test_watchdog_refuses_large_serial_sort() {
    let mut b = ResultSetBuilder::projection(vec![TargetInfo::column(ColumnType::bigint())]);
    for v in 0..16i64 {
        b.row(vec![Cell::from(v)]);
    }
    let mut rs = b.build().unwrap();
    let config = SortConfig {
        watchdog_enabled: true,
        baseline_threshold: 8,
        ..SortConfig::default()
    };
    let err = rs
        .sort(&[OrderEntry::new(1, false, false)], 0, &config)
        .unwrap_err();
    assert!(matches!(err, raexec::Error::Watchdog(_)));
}
