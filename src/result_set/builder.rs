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

//! Building result sets from decoded rows
//!
//! Used to materialize VALUES lists and by backends that produce rows rather
//! than raw buffers.

use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::{FxHashMap, FxHashSet};

use super::descriptor::{QueryDescriptionType, QueryMemoryDescriptor, SlotSize, TargetInfo};
use super::storage::{QuantileDigest, ResultSetStorage, NO_HANDLE};
use super::{ResultSet, StringDictionaryProxy};
use crate::core::types::{inline_int_null, NULL_DOUBLE, NULL_FLOAT, NULL_INT, NULL_TINYINT};
use crate::core::{ColumnType, DataType, Error, ExecutorDeviceType, Result, Value};

/// In-memory string dictionary
#[derive(Debug, Default)]
pub struct VecStringDictionary {
    inner: RwLock<DictionaryInner>,
}

#[derive(Debug, Default)]
struct DictionaryInner {
    strings: Vec<Arc<str>>,
    ids: FxHashMap<Arc<str>, i32>,
}

impl VecStringDictionary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Id of `s`, adding it if unseen
    pub fn get_or_add(&self, s: &str) -> i32 {
        if let Some(id) = self.inner.read().ids.get(s) {
            return *id;
        }
        let mut inner = self.inner.write();
        if let Some(id) = inner.ids.get(s) {
            return *id;
        }
        let id = inner.strings.len() as i32;
        let s: Arc<str> = Arc::from(s);
        inner.strings.push(s.clone());
        inner.ids.insert(s, id);
        id
    }

    pub fn len(&self) -> usize {
        self.inner.read().strings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl StringDictionaryProxy for VecStringDictionary {
    fn get_string(&self, id: i32) -> Option<Arc<str>> {
        if id < 0 {
            return None;
        }
        self.inner.read().strings.get(id as usize).cloned()
    }
}

/// One input cell
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Value(Value),
    /// AVG state
    Avg { sum: f64, count: i64 },
    /// Values seen by a COUNT(DISTINCT)
    Distinct(Vec<i64>),
    /// Samples seen by an APPROX_QUANTILE
    Digest(Vec<f64>),
}

impl From<Value> for Cell {
    fn from(v: Value) -> Self {
        Cell::Value(v)
    }
}

impl From<i64> for Cell {
    fn from(v: i64) -> Self {
        Cell::Value(Value::integer(v))
    }
}

impl From<f64> for Cell {
    fn from(v: f64) -> Self {
        Cell::Value(Value::float(v))
    }
}

/// Builds a single-storage [`ResultSet`] from rows
#[derive(Debug)]
pub struct ResultSetBuilder {
    targets: Vec<TargetInfo>,
    query_type: QueryDescriptionType,
    key_count: usize,
    columnar: bool,
    compact: bool,
    sort_on_gpu: bool,
    device_type: ExecutorDeviceType,
    extra_capacity: usize,
    rows: Vec<Option<Vec<Cell>>>,
    dictionaries: FxHashMap<i32, Arc<VecStringDictionary>>,
}

impl ResultSetBuilder {
    fn with_type(targets: Vec<TargetInfo>, query_type: QueryDescriptionType, key_count: usize) -> Self {
        Self {
            targets,
            query_type,
            key_count,
            columnar: false,
            compact: false,
            sort_on_gpu: false,
            device_type: ExecutorDeviceType::Cpu,
            extra_capacity: 0,
            rows: Vec::new(),
            dictionaries: FxHashMap::default(),
        }
    }

    pub fn projection(targets: Vec<TargetInfo>) -> Self {
        Self::with_type(targets, QueryDescriptionType::Projection, 1)
    }

    /// Group-by layout; the first `key_count` targets are the group keys
    pub fn group_by(targets: Vec<TargetInfo>, key_count: usize) -> Self {
        Self::with_type(targets, QueryDescriptionType::GroupByBaselineHash, key_count)
    }

    pub fn non_grouped(targets: Vec<TargetInfo>) -> Self {
        Self::with_type(targets, QueryDescriptionType::NonGroupedAggregate, 0)
    }

    pub fn columnar(&mut self, columnar: bool) -> &mut Self {
        self.columnar = columnar;
        self
    }

    /// Size slots to their type instead of 8 bytes
    pub fn compact_slots(&mut self, compact: bool) -> &mut Self {
        self.compact = compact;
        self
    }

    pub fn sort_on_gpu(&mut self, sort_on_gpu: bool) -> &mut Self {
        self.sort_on_gpu = sort_on_gpu;
        self
    }

    pub fn device_type(&mut self, device_type: ExecutorDeviceType) -> &mut Self {
        self.device_type = device_type;
        self
    }

    /// Trailing unused entries
    pub fn extra_capacity(&mut self, entries: usize) -> &mut Self {
        self.extra_capacity = entries;
        self
    }

    pub fn dictionary(&mut self, dict_id: i32, dict: Arc<VecStringDictionary>) -> &mut Self {
        self.dictionaries.insert(dict_id, dict);
        self
    }

    pub fn row(&mut self, cells: Vec<Cell>) -> &mut Self {
        self.rows.push(Some(cells));
        self
    }

    pub fn rows<I: IntoIterator<Item = Vec<Cell>>>(&mut self, rows: I) -> &mut Self {
        for row in rows {
            self.row(row);
        }
        self
    }

    /// An unused entry at the current position
    pub fn empty_entry(&mut self) -> &mut Self {
        self.rows.push(None);
        self
    }

    fn slot_size(&self, target: &TargetInfo) -> Result<SmallSlots> {
        if target.sql_type.is_varlen() && !target.is_agg {
            return Err(Error::type_error(format!(
                "{} values cannot be stored inline",
                target.sql_type
            )));
        }
        if target.is_avg() {
            return Ok(SmallSlots::Two(SlotSize::full(), SlotSize::full()));
        }
        if target.is_distinct_target() || target.is_approx_quantile() || !self.compact {
            return Ok(SmallSlots::One(SlotSize::full()));
        }
        let width = match target.sql_type.size() {
            0 => 8,
            w => w as u8,
        };
        Ok(SmallSlots::One(SlotSize::new(width, width)))
    }

    pub fn build(&mut self) -> Result<ResultSet> {
        let mut slots = Vec::new();
        for target in &self.targets {
            match self.slot_size(target)? {
                SmallSlots::One(s) => slots.push(s),
                SmallSlots::Two(a, b) => {
                    slots.push(a);
                    slots.push(b);
                }
            }
        }
        let entry_count = match self.query_type {
            QueryDescriptionType::NonGroupedAggregate => 1,
            _ => self.rows.len() + self.extra_capacity,
        };
        let desc = match self.query_type {
            QueryDescriptionType::Projection => QueryMemoryDescriptor::projection(entry_count, &slots),
            QueryDescriptionType::NonGroupedAggregate => QueryMemoryDescriptor::non_grouped(&slots),
            other => QueryMemoryDescriptor::group_by(other, entry_count, self.key_count, 8, &slots),
        }
        .with_columnar(self.columnar)
        .with_sort_on_gpu(self.sort_on_gpu);

        let mut storage = ResultSetStorage::new(desc);
        let slot_indices = super::target_slot_indices(&self.targets);

        let targets = self.targets.clone();
        for (entry, row) in self.rows.iter().enumerate() {
            if entry >= entry_count {
                break;
            }
            let Some(cells) = row else { continue };
            if cells.len() != self.targets.len() {
                return Err(Error::TargetArityMismatch {
                    node: 0,
                    expected: self.targets.len(),
                    got: cells.len(),
                });
            }
            match self.query_type {
                QueryDescriptionType::Projection => storage.write_key(entry, 0, entry as i64),
                QueryDescriptionType::NonGroupedAggregate | QueryDescriptionType::Estimator => {}
                _ => {
                    for key_idx in 0..self.key_count {
                        let key = match cells.get(key_idx) {
                            Some(Cell::Value(v)) => key_value(v),
                            _ => NO_HANDLE,
                        };
                        storage.write_key(entry, key_idx, key);
                    }
                }
            }
            for (target_idx, cell) in cells.iter().enumerate() {
                let slot_idx = slot_indices[target_idx];
                write_cell(
                    &mut self.dictionaries,
                    &mut storage,
                    entry,
                    slot_idx,
                    &targets[target_idx],
                    cell,
                )?;
            }
        }

        let mut rs = ResultSet::with_storage(targets, self.device_type, storage)?;
        for (dict_id, dict) in &self.dictionaries {
            rs = rs.with_dictionary(*dict_id, dict.clone());
        }
        Ok(rs)
    }
}

fn dictionary_for(
    dictionaries: &mut FxHashMap<i32, Arc<VecStringDictionary>>,
    ty: ColumnType,
) -> Arc<VecStringDictionary> {
    let dict_id = ty.dict_id.unwrap_or(0);
    dictionaries
        .entry(dict_id)
        .or_insert_with(|| Arc::new(VecStringDictionary::new()))
        .clone()
}

fn write_cell(
    dictionaries: &mut FxHashMap<i32, Arc<VecStringDictionary>>,
    storage: &mut ResultSetStorage,
    entry: usize,
    slot_idx: usize,
    target: &TargetInfo,
    cell: &Cell,
) -> Result<()> {
    let ty = target.sql_type;
    match cell {
        Cell::Avg { sum, count } => {
            storage.write_slot(entry, slot_idx, sum.to_bits() as i64);
            storage.write_slot(entry, slot_idx + 1, *count);
        }
        Cell::Distinct(values) => {
            let set: FxHashSet<i64> = values.iter().copied().collect();
            let handle = storage.agg_state_mut().add_count_distinct_set(set);
            storage.write_slot(entry, slot_idx, handle);
        }
        Cell::Digest(samples) => {
            let handle = storage
                .agg_state_mut()
                .add_quantile_digest(QuantileDigest::new(samples.clone()));
            storage.write_slot(entry, slot_idx, handle);
        }
        Cell::Value(value) if target.is_avg() => {
            // A plain value for AVG is a single-row average
            match value.as_float64() {
                Some(v) => {
                    storage.write_slot(entry, slot_idx, v.to_bits() as i64);
                    storage.write_slot(entry, slot_idx + 1, 1);
                }
                None => storage.write_slot(entry, slot_idx + 1, 0),
            }
        }
        Cell::Value(value) if target.is_distinct_target() || target.is_approx_quantile() => {
            if !value.is_null() {
                return Err(Error::type_error(format!(
                    "aggregate state expected for {:?}",
                    target.agg_kind
                )));
            }
            storage.write_slot(entry, slot_idx, NO_HANDLE);
        }
        Cell::Value(value) => {
            let padded = storage.desc().padded_slot_width(slot_idx);
            let raw = if ty.data_type.is_fp() {
                let as_f32 = ty.is_fp32() && padded == 4;
                match (value.as_float64(), as_f32) {
                    (None, true) => NULL_FLOAT.to_bits() as i64,
                    (None, false) => NULL_DOUBLE.to_bits() as i64,
                    (Some(v), true) => (v as f32).to_bits() as i64,
                    (Some(v), false) => v.to_bits() as i64,
                }
            } else {
                match (ty.data_type, value) {
                    (DataType::DictText, Value::Text(s)) => {
                        dictionary_for(dictionaries, ty).get_or_add(s) as i64
                    }
                    (DataType::DictText, Value::Null(_)) => NULL_INT,
                    (DataType::Boolean, Value::Null(_)) => NULL_TINYINT,
                    (_, Value::Null(_)) => inline_int_null(ty.size()),
                    (_, Value::Text(_)) => {
                        return Err(Error::type_error(format!(
                            "text value for {} column",
                            ty
                        )))
                    }
                    (_, v) => v.as_int64().unwrap_or(0),
                }
            };
            storage.write_slot(entry, slot_idx, raw);
        }
    }
    Ok(())
}

enum SmallSlots {
    One(SlotSize),
    Two(SlotSize, SlotSize),
}

/// Group key encoding for a decoded value
fn key_value(value: &Value) -> i64 {
    match value {
        Value::Null(_) => NO_HANDLE,
        Value::Float(f) => f.to_bits() as i64,
        other => other.as_int64().unwrap_or(NO_HANDLE),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dictionary_ids_are_stable() {
        let dict = VecStringDictionary::new();
        assert_eq!(dict.get_or_add("x"), 0);
        assert_eq!(dict.get_or_add("y"), 1);
        assert_eq!(dict.get_or_add("x"), 0);
        assert_eq!(dict.get_string(1).as_deref(), Some("y"));
        assert_eq!(dict.get_string(5), None);
        assert_eq!(dict.len(), 2);
    }

    #[test]
    fn test_build_compact_columnar_projection() {
        let mut b = ResultSetBuilder::projection(vec![
            TargetInfo::column(ColumnType::nullable(DataType::SmallInt)),
            TargetInfo::column(ColumnType::nullable(DataType::Float)),
        ]);
        b.columnar(true)
            .compact_slots(true)
            .extra_capacity(2)
            .row(vec![Cell::from(4i64), Cell::from(1.5f64)])
            .row(vec![Cell::from(Value::null(DataType::SmallInt)), Cell::from(Value::null(DataType::Float))]);
        let rs = b.build().unwrap();
        assert_eq!(rs.entry_count(), 4);
        assert_eq!(rs.query_mem_desc().padded_slot_width(0), 2);
        assert_eq!(rs.query_mem_desc().padded_slot_width(1), 4);
        assert_eq!(rs.row_count(false), 2);
        let rows = rs.rows(true).unwrap();
        assert_eq!(rows[0], vec![Value::integer(4), Value::float(1.5)]);
        assert!(rows[1][0].is_null() && rows[1][1].is_null());
    }

    #[test]
    fn test_build_rejects_varlen_and_bad_arity() {
        let mut b = ResultSetBuilder::projection(vec![TargetInfo::column(ColumnType::nullable(DataType::Text))]);
        assert!(b.build().is_err());

        let mut b = ResultSetBuilder::projection(vec![TargetInfo::column(ColumnType::bigint())]);
        b.row(vec![Cell::from(1i64), Cell::from(2i64)]);
        assert!(matches!(b.build(), Err(Error::TargetArityMismatch { .. })));
    }
}
