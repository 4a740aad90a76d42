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

//! Multi-key entry comparator
//!
//! Compares two global entry indices of a [`ResultSet`] by a list of
//! [`OrderEntry`] keys. Keys whose values cannot be read straight from the
//! buffer (COUNT(DISTINCT) set sizes, quantile estimates, lazily fetched
//! columns) are materialized once, for the entries of the permutation being
//! sorted, before any comparison runs.
//!
//! Ties on every key are broken by entry index, which keeps the resulting order
//! identical to a stable sort over the initial permutation.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::core::types::{inline_int_null, NULL_DOUBLE, NULL_FLOAT, NULL_INT};
use crate::core::{DataType, Error, Result, Value};

use super::sort::OrderEntry;
use super::{ResultSet, StringDictionaryProxy};

/// A value as seen by the comparator
#[derive(Debug, Clone)]
enum SortValue {
    Null,
    Int(i64),
    Float(f64),
    Text(Arc<str>),
}

impl SortValue {
    fn from_value(value: &Value) -> Self {
        match value {
            Value::Null(_) => SortValue::Null,
            Value::Integer(v) => SortValue::Int(*v),
            Value::Float(v) => SortValue::Float(*v),
            Value::Boolean(b) => SortValue::Int(i64::from(*b)),
            Value::Text(s) => SortValue::Text(s.clone()),
        }
    }

    /// Both sides non-null
    fn cmp_non_null(&self, other: &Self) -> Ordering {
        match (self, other) {
            (SortValue::Int(a), SortValue::Int(b)) => a.cmp(b),
            (SortValue::Float(a), SortValue::Float(b)) => a.total_cmp(b),
            (SortValue::Int(a), SortValue::Float(b)) => (*a as f64).total_cmp(b),
            (SortValue::Float(a), SortValue::Int(b)) => a.total_cmp(&(*b as f64)),
            (SortValue::Text(a), SortValue::Text(b)) => a.cmp(b),
            // Unresolved dictionary ids sort before resolved strings
            (SortValue::Int(_), SortValue::Text(_)) => Ordering::Less,
            (SortValue::Text(_), SortValue::Int(_)) => Ordering::Greater,
            _ => Ordering::Equal,
        }
    }
}

/// How one order key is read
#[derive(Debug)]
enum KeySource {
    /// Inline integer with a width-specific null sentinel
    Int { slot_idx: usize, null: i64 },
    F32 { slot_idx: usize },
    F64 { slot_idx: usize },
    /// Sum and count slots
    Avg { slot_idx: usize },
    /// Dictionary id resolved on every comparison
    Dict {
        slot_idx: usize,
        proxy: Option<Arc<dyn StringDictionaryProxy>>,
    },
    /// Values computed up front, indexed by global entry
    Materialized(Vec<SortValue>),
}

/// Compares global entries of one result set
#[derive(Debug)]
pub struct ResultSetComparator<'a> {
    rows: &'a ResultSet,
    order_entries: Vec<OrderEntry>,
    keys: Vec<KeySource>,
}

impl<'a> ResultSetComparator<'a> {
    /// Builds the comparator, materializing keys for the entries in
    /// `permutation`. `single_threaded` keeps materialization on the calling
    /// thread, for use inside an already parallel top-N pass.
    pub fn new(
        rows: &'a ResultSet,
        order_entries: &[OrderEntry],
        permutation: &[u32],
        single_threaded: bool,
    ) -> Result<Self> {
        let slot_indices = rows.slot_indices_for_target_indices();
        let mut keys = Vec::with_capacity(order_entries.len());
        for order_entry in order_entries {
            let target_idx = order_entry.target_idx();
            let target = rows
                .targets()
                .get(target_idx)
                .ok_or(Error::ColumnIndexOutOfBounds { index: target_idx })?;
            let slot_idx = slot_indices[target_idx];
            let ty = target.sql_type;

            let key = if target.is_distinct_target() {
                let sizes = materialize(rows, permutation, single_threaded, |entry| {
                    let Some(lookup) = rows.find_storage(entry) else {
                        return SortValue::Null;
                    };
                    let handle = lookup.storage.slot_view(slot_idx).get(lookup.fixedup_entry_idx);
                    SortValue::Int(lookup.storage.agg_state().count_distinct_size(handle))
                });
                KeySource::Materialized(sizes)
            } else if target.is_approx_quantile() {
                let q = target.quantile.unwrap_or(0.5);
                let quantiles = materialize(rows, permutation, single_threaded, |entry| {
                    let Some(lookup) = rows.find_storage(entry) else {
                        return SortValue::Null;
                    };
                    let handle = lookup.storage.slot_view(slot_idx).get(lookup.fixedup_entry_idx);
                    match lookup.storage.agg_state().quantile(handle, q) {
                        Some(v) => SortValue::Float(v),
                        None => SortValue::Null,
                    }
                });
                KeySource::Materialized(quantiles)
            } else if rows.is_lazily_fetched(target_idx) {
                KeySource::Materialized(materialize_lazy(rows, permutation, target_idx, slot_idx)?)
            } else if target.is_avg() {
                KeySource::Avg { slot_idx }
            } else if ty.data_type.is_fp() {
                if rows.stored_as_f32(target_idx, slot_idx) {
                    KeySource::F32 { slot_idx }
                } else {
                    KeySource::F64 { slot_idx }
                }
            } else if ty.data_type == DataType::DictText {
                KeySource::Dict {
                    slot_idx,
                    proxy: ty.dict_id.and_then(|id| rows.dictionary(id)).cloned(),
                }
            } else if ty.data_type.is_array() {
                return Err(Error::unsupported(
                    "Columns with array types cannot be used in an ORDER BY clause.",
                ));
            } else if ty.data_type == DataType::Text {
                return Err(Error::type_error("none-encoded text cannot be sorted inline"));
            } else {
                KeySource::Int {
                    slot_idx,
                    null: inline_int_null(ty.size()),
                }
            };
            keys.push(key);
        }
        Ok(Self {
            rows,
            order_entries: order_entries.to_vec(),
            keys,
        })
    }

    fn value_at(&self, key: &KeySource, entry: u32) -> SortValue {
        if let KeySource::Materialized(values) = key {
            return values.get(entry as usize).cloned().unwrap_or(SortValue::Null);
        }
        let Some(lookup) = self.rows.find_storage(entry as usize) else {
            return SortValue::Null;
        };
        let storage = lookup.storage;
        let local = lookup.fixedup_entry_idx;
        match key {
            KeySource::Int { slot_idx, null } => {
                let v = storage.slot_view(*slot_idx).get(local);
                if v == *null {
                    SortValue::Null
                } else {
                    SortValue::Int(v)
                }
            }
            KeySource::F32 { slot_idx } => {
                let v = storage.slot_view(*slot_idx).get_f32(local);
                if v == NULL_FLOAT {
                    SortValue::Null
                } else {
                    SortValue::Float(v as f64)
                }
            }
            KeySource::F64 { slot_idx } => {
                let v = storage.slot_view(*slot_idx).get_f64(local);
                if v == NULL_DOUBLE {
                    SortValue::Null
                } else {
                    SortValue::Float(v)
                }
            }
            KeySource::Avg { slot_idx } => {
                let count = storage.slot_view(*slot_idx + 1).get(local);
                if count == 0 {
                    SortValue::Null
                } else {
                    SortValue::Float(storage.slot_view(*slot_idx).get_f64(local) / count as f64)
                }
            }
            KeySource::Dict { slot_idx, proxy } => {
                let id = storage.slot_view(*slot_idx).get(local);
                if id == NULL_INT {
                    return SortValue::Null;
                }
                match proxy.as_ref().and_then(|p| p.get_string(id as i32)) {
                    Some(s) => SortValue::Text(s),
                    None => SortValue::Int(id),
                }
            }
            KeySource::Materialized(_) => SortValue::Null,
        }
    }

    /// Total order over entries: keys in sequence, then entry index
    pub fn compare(&self, lhs: u32, rhs: u32) -> Ordering {
        for (order_entry, key) in self.order_entries.iter().zip(&self.keys) {
            let lhs_v = self.value_at(key, lhs);
            let rhs_v = self.value_at(key, rhs);
            match (&lhs_v, &rhs_v) {
                (SortValue::Null, SortValue::Null) => continue,
                (SortValue::Null, _) => {
                    return if order_entry.nulls_first {
                        Ordering::Less
                    } else {
                        Ordering::Greater
                    }
                }
                (_, SortValue::Null) => {
                    return if order_entry.nulls_first {
                        Ordering::Greater
                    } else {
                        Ordering::Less
                    }
                }
                _ => {}
            }
            let ord = lhs_v.cmp_non_null(&rhs_v);
            if ord != Ordering::Equal {
                return if order_entry.is_desc { ord.reverse() } else { ord };
            }
        }
        lhs.cmp(&rhs)
    }
}

/// Per-entry values for the permutation, indexed by global entry
fn materialize<F>(
    rows: &ResultSet,
    permutation: &[u32],
    #[cfg_attr(not(feature = "parallel"), allow(unused_variables))] single_threaded: bool,
    compute: F,
) -> Vec<SortValue>
where
    F: Fn(usize) -> SortValue + Sync + Send,
{
    let mut out = vec![SortValue::Null; rows.entry_count()];
    #[cfg(feature = "parallel")]
    if !single_threaded {
        use rayon::prelude::*;
        let computed: Vec<(u32, SortValue)> = permutation
            .par_iter()
            .with_min_len(1024)
            .map(|&entry| (entry, compute(entry as usize)))
            .collect();
        for (entry, value) in computed {
            out[entry as usize] = value;
        }
        return out;
    }
    for &entry in permutation {
        out[entry as usize] = compute(entry as usize);
    }
    out
}

fn materialize_lazy(
    rows: &ResultSet,
    permutation: &[u32],
    target_idx: usize,
    slot_idx: usize,
) -> Result<Vec<SortValue>> {
    let mut out = vec![SortValue::Null; rows.entry_count()];
    for &entry in permutation {
        let Some(lookup) = rows.find_storage(entry as usize) else {
            continue;
        };
        let value =
            rows.decode_target(lookup.storage, lookup.fixedup_entry_idx, target_idx, slot_idx, true)?;
        out[entry as usize] = SortValue::from_value(&value);
    }
    Ok(out)
}
