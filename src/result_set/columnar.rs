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

//! Columnar extraction
//!
//! A columnar projection stores every slot as one contiguous run, so a column
//! can be handed out as a borrowed byte slice with no copy. The chunked variant
//! returns one slice per storage when appended fragments are present.

use crate::core::{Error, Result, Value};

use super::descriptor::QueryDescriptionType;
use super::ResultSet;

/// One fragment of a column: raw little-endian values and their row count
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnChunk<'a> {
    pub bytes: &'a [u8],
    pub row_count: usize,
    /// Bytes per value
    pub width: usize,
}

impl ResultSet {
    /// Columnar output in a layout with one run per column
    pub fn is_direct_columnar_conversion_possible(&self) -> bool {
        let desc = self.query_mem_desc();
        desc.did_output_columnar()
            && matches!(
                desc.query_type(),
                QueryDescriptionType::Projection
                    | QueryDescriptionType::GroupByPerfectHash
                    | QueryDescriptionType::GroupByBaselineHash
            )
    }

    fn is_zero_copy_column(&self, column_idx: usize) -> bool {
        let desc = self.query_mem_desc();
        desc.did_output_columnar()
            && desc.query_type() == QueryDescriptionType::Projection
            && self.permutation().is_empty()
            && self.storage().is_some()
            && column_idx < self.col_count()
            && !self.is_lazily_fetched(column_idx)
            && self.targets()[column_idx].slot_count() == 1
    }

    /// A single storage column can be borrowed as is
    pub fn is_zero_copy_columnar_conversion_possible(&self, column_idx: usize) -> bool {
        self.appended_storage().is_empty() && self.is_zero_copy_column(column_idx)
    }

    /// Every storage's column can be borrowed as is
    pub fn is_chunked_zero_copy_columnar_conversion_possible(&self, column_idx: usize) -> bool {
        self.is_zero_copy_column(column_idx)
    }

    /// Raw values of a column, one per row
    pub fn get_columnar_buffer(&self, column_idx: usize) -> Result<&[u8]> {
        if !self.is_zero_copy_columnar_conversion_possible(column_idx) {
            return Err(Error::ColumnarConversionNotPossible(column_idx));
        }
        let mut chunks = self.get_chunked_columnar_buffer(column_idx)?;
        match chunks.pop() {
            Some(chunk) => Ok(chunk.bytes),
            None => Ok(&[]),
        }
    }

    /// Raw values of a column, one chunk per storage
    pub fn get_chunked_columnar_buffer(&self, column_idx: usize) -> Result<Vec<ColumnChunk<'_>>> {
        if !self.is_chunked_zero_copy_columnar_conversion_possible(column_idx) {
            return Err(Error::ColumnarConversionNotPossible(column_idx));
        }
        let slot_idx = self.slot_indices_for_target_indices()[column_idx];
        let storages = self.storage().into_iter().chain(self.appended_storage());
        Ok(storages
            .map(|storage| {
                let row_count = storage.bin_search_row_count();
                let (base, _) = storage.desc().slot_layout(slot_idx);
                let width = storage.desc().padded_slot_width(slot_idx);
                ColumnChunk {
                    bytes: &storage.buffer()[base..base + row_count * width],
                    row_count,
                    width,
                }
            })
            .collect())
    }

    /// Decoded values of one column in iteration order; copies when zero-copy
    /// access is not possible
    pub fn column_values(&self, column_idx: usize, translate_strings: bool) -> Result<Vec<Value>> {
        if column_idx >= self.col_count() {
            return Err(Error::ColumnIndexOutOfBounds { index: column_idx });
        }
        Ok(self
            .rows(translate_strings)?
            .into_iter()
            .filter_map(|mut row| (column_idx < row.len()).then(|| row.swap_remove(column_idx)))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ColumnType;
    use crate::result_set::{Cell, OrderEntry, ResultSetBuilder, SortConfig, TargetInfo};

    fn columnar(values: &[i64], compact: bool) -> ResultSet {
        let mut b = ResultSetBuilder::projection(vec![
            TargetInfo::column(ColumnType::not_null(crate::core::DataType::Integer)),
            TargetInfo::column(ColumnType::bigint()),
        ]);
        b.columnar(true).compact_slots(compact).extra_capacity(3);
        for v in values {
            b.row(vec![Cell::from(*v), Cell::from(*v * 10)]);
        }
        b.build().unwrap()
    }

    #[test]
    fn test_zero_copy_buffer() {
        let rs = columnar(&[1, 2, 3], true);
        assert!(rs.is_direct_columnar_conversion_possible());
        let bytes = rs.get_columnar_buffer(0).unwrap();
        assert_eq!(bytes.len(), 3 * 4);
        assert_eq!(i32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]), 2);
        let bytes = rs.get_columnar_buffer(1).unwrap();
        assert_eq!(bytes.len(), 3 * 8);
    }

    #[test]
    fn test_permutation_blocks_zero_copy() {
        let mut rs = columnar(&[3, 1], false);
        rs.sort(&[OrderEntry::new(1, false, false)], 0, &SortConfig::default())
            .unwrap();
        assert!(!rs.is_zero_copy_columnar_conversion_possible(0));
        assert!(matches!(
            rs.get_columnar_buffer(0),
            Err(Error::ColumnarConversionNotPossible(0))
        ));
        assert_eq!(
            rs.column_values(0, true).unwrap(),
            vec![Value::integer(1), Value::integer(3)]
        );
    }

    #[test]
    fn test_chunked_buffer_across_fragments() {
        let mut rs = columnar(&[1, 2], false);
        rs.append(columnar(&[3], false)).unwrap();
        assert!(!rs.is_zero_copy_columnar_conversion_possible(1));
        let chunks = rs.get_chunked_columnar_buffer(1).unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks.iter().map(|c| c.row_count).collect::<Vec<_>>(), vec![2, 1]);
        assert_eq!(chunks[1].bytes, &30i64.to_le_bytes()[..]);
    }

    #[test]
    fn test_row_wise_not_direct() {
        let mut b = ResultSetBuilder::projection(vec![TargetInfo::column(ColumnType::bigint())]);
        b.row(vec![Cell::from(1i64)]);
        let rs = b.build().unwrap();
        assert!(!rs.is_direct_columnar_conversion_possible());
        assert!(rs.get_chunked_columnar_buffer(0).is_err());
    }
}
