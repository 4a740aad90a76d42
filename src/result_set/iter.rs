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

//! Row iteration
//!
//! Streaming iteration keeps its position in a cursor guarded by the result
//! set's mutex, so concurrent readers see each row once. Random access through
//! [`ResultSet::get_row_at`] does not touch the cursor.

use crate::core::types::{inline_int_null, NULL_DOUBLE, NULL_FLOAT, NULL_INT, NULL_TINYINT};
use crate::core::{DataType, Error, Result, Value};

use super::storage::ResultSetStorage;
use super::{ResultRow, ResultSet};

impl ResultSet {
    /// True when a float target is stored in 4 bytes
    pub(crate) fn stored_as_f32(&self, target_idx: usize, slot_idx: usize) -> bool {
        let Some(target) = self.targets().get(target_idx) else {
            return false;
        };
        if !target.sql_type.is_fp32() || self.query_mem_desc().padded_slot_width(slot_idx) != 4 {
            return false;
        }
        if self.query_mem_desc().did_output_columnar() {
            !self.is_lazily_fetched(target_idx)
        } else {
            true
        }
    }

    /// Decode target `target_idx` of a local entry
    pub(crate) fn decode_target(
        &self,
        storage: &ResultSetStorage,
        entry: usize,
        target_idx: usize,
        slot_idx: usize,
        translate_strings: bool,
    ) -> Result<Value> {
        let target = self
            .targets()
            .get(target_idx)
            .ok_or(Error::ColumnIndexOutOfBounds { index: target_idx })?;
        let ty = target.sql_type;

        if target.is_avg() {
            let sum = storage.slot_view(slot_idx).get_f64(entry);
            let count = storage.slot_view(slot_idx + 1).get(entry);
            return Ok(if count == 0 {
                Value::null(DataType::Double)
            } else {
                Value::float(sum / count as f64)
            });
        }
        if target.is_distinct_target() {
            let handle = storage.slot_view(slot_idx).get(entry);
            return Ok(Value::integer(
                storage.agg_state().count_distinct_size(handle),
            ));
        }
        if target.is_approx_quantile() {
            let handle = storage.slot_view(slot_idx).get(entry);
            let q = target.quantile.unwrap_or(0.5);
            return Ok(match storage.agg_state().quantile(handle, q) {
                Some(v) => Value::float(v),
                None => Value::null(DataType::Double),
            });
        }

        let view = storage.slot_view(slot_idx);
        if self.is_lazily_fetched(target_idx) {
            let row_id = view.get(entry);
            let fetcher = self.column_fetcher().ok_or_else(|| {
                Error::internal(format!(
                    "column {} is lazily fetched but no fetcher is attached",
                    target_idx
                ))
            })?;
            let local_col_id = self.lazy_fetch_info()[target_idx].local_col_id;
            return fetcher.fetch(local_col_id, row_id);
        }

        if ty.data_type.is_fp() {
            return Ok(if self.stored_as_f32(target_idx, slot_idx) {
                let v = view.get_f32(entry);
                if v == NULL_FLOAT {
                    Value::null(ty.data_type)
                } else {
                    Value::float(v as f64)
                }
            } else {
                let v = view.get_f64(entry);
                if v == NULL_DOUBLE {
                    Value::null(ty.data_type)
                } else {
                    Value::float(v)
                }
            });
        }

        let raw = view.get(entry);
        Ok(match ty.data_type {
            DataType::Boolean => {
                if raw == NULL_TINYINT {
                    Value::null(DataType::Boolean)
                } else {
                    Value::boolean(raw != 0)
                }
            }
            DataType::DictText => {
                if raw == NULL_INT {
                    Value::null(DataType::DictText)
                } else if translate_strings {
                    let proxy = ty.dict_id.and_then(|id| self.dictionary(id));
                    match proxy.and_then(|p| p.get_string(raw as i32)) {
                        Some(s) => Value::Text(s),
                        None => Value::integer(raw),
                    }
                } else {
                    Value::integer(raw)
                }
            }
            DataType::Text | DataType::Array => {
                return Err(Error::type_error(format!(
                    "{} values are not stored inline",
                    ty.data_type
                )))
            }
            other => {
                if raw == inline_int_null(other.size()) {
                    Value::null(other)
                } else {
                    Value::integer(raw)
                }
            }
        })
    }

    /// Decode all targets of a global entry; `None` for an empty entry
    pub fn entry_values(&self, entry_idx: usize, translate_strings: bool) -> Result<Option<ResultRow>> {
        let Some(lookup) = self.find_storage(entry_idx) else {
            return Ok(None);
        };
        let storage = lookup.storage;
        let entry = lookup.fixedup_entry_idx;
        if storage.is_empty_entry(entry) {
            return Ok(None);
        }
        let slots = self.slot_indices_for_target_indices();
        let mut row = Vec::with_capacity(slots.len());
        for (target_idx, slot_idx) in slots.into_iter().enumerate() {
            row.push(self.decode_target(storage, entry, target_idx, slot_idx, translate_strings)?);
        }
        Ok(Some(row))
    }

    fn explain_row(&self) -> ResultRow {
        vec![Value::text(self.explanation().unwrap_or_default())]
    }

    /// Rewind streaming iteration
    pub fn move_to_begin(&self) {
        let mut cursor = self.cursor().lock();
        cursor.crt_row_buff_idx = 0;
        cursor.fetched_so_far = 0;
        cursor.dropped_so_far = 0;
    }

    /// Next row of streaming iteration, LIMIT and OFFSET applied
    pub fn get_next_row(&self, translate_strings: bool) -> Result<Option<ResultRow>> {
        let mut cursor = self.cursor().lock();
        if self.is_explain() {
            if cursor.fetched_so_far > 0 {
                return Ok(None);
            }
            cursor.fetched_so_far = 1;
            return Ok(Some(self.explain_row()));
        }
        let limit = self.get_limit();
        if limit > 0 && cursor.fetched_so_far >= limit {
            return Ok(None);
        }
        let permutation = self.permutation();
        if !permutation.is_empty() {
            let pos = self.get_offset() + cursor.fetched_so_far;
            let Some(&entry) = permutation.get(pos) else {
                return Ok(None);
            };
            cursor.fetched_so_far += 1;
            return self.entry_values(entry as usize, translate_strings);
        }
        let entry_count = self.entry_count();
        while cursor.crt_row_buff_idx < entry_count {
            let entry = cursor.crt_row_buff_idx;
            cursor.crt_row_buff_idx += 1;
            if self.is_row_at_empty(entry) {
                continue;
            }
            if cursor.dropped_so_far < self.get_offset() {
                cursor.dropped_so_far += 1;
                continue;
            }
            cursor.fetched_so_far += 1;
            return self.entry_values(entry, translate_strings);
        }
        Ok(None)
    }

    /// Row at a logical position, LIMIT and OFFSET applied
    pub fn get_row_at(&self, row_idx: usize, translate_strings: bool) -> Result<Option<ResultRow>> {
        if self.is_explain() {
            return Ok((row_idx == 0).then(|| self.explain_row()));
        }
        let limit = self.get_limit();
        if limit > 0 && row_idx >= limit {
            return Ok(None);
        }
        let logical = row_idx + self.get_offset();
        let permutation = self.permutation();
        if !permutation.is_empty() {
            return match permutation.get(logical) {
                Some(&entry) => self.entry_values(entry as usize, translate_strings),
                None => Ok(None),
            };
        }
        let entry = (0..self.entry_count())
            .filter(|&i| !self.is_row_at_empty(i))
            .nth(logical);
        match entry {
            Some(entry) => self.entry_values(entry, translate_strings),
            None => Ok(None),
        }
    }

    /// All rows in iteration order, without touching the streaming cursor
    pub fn rows(&self, translate_strings: bool) -> Result<Vec<ResultRow>> {
        if self.is_explain() {
            return Ok(vec![self.explain_row()]);
        }
        let limit = self.get_limit();
        let offset = self.get_offset();
        let entries: Box<dyn Iterator<Item = usize> + '_> = if self.permutation().is_empty() {
            Box::new((0..self.entry_count()).filter(|&i| !self.is_row_at_empty(i)))
        } else {
            Box::new(self.permutation().iter().map(|&i| i as usize))
        };
        let entries = entries.skip(offset);
        let entries: Box<dyn Iterator<Item = usize> + '_> = if limit > 0 {
            Box::new(entries.take(limit))
        } else {
            Box::new(entries)
        };
        let mut out = Vec::new();
        for entry in entries {
            if let Some(row) = self.entry_values(entry, translate_strings)? {
                out.push(row);
            }
        }
        Ok(out)
    }
}
