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

//! Query memory descriptor
//!
//! Describes the byte layout of a result buffer. The layout is a private
//! contract with the compiled engine that fills the buffer.
//!
//! Row-wise layout, one row per entry:
//!
//! ```text
//! | key 0 | key 1 | .. | pad to 8 | slot 0 | slot 1 | .. | pad to 8 |
//! ```
//!
//! Columnar layout, one run per key and per slot, each run 8-byte aligned:
//!
//! ```text
//! | key 0 x entry_count | key 1 x entry_count | slot 0 x entry_count | ..
//! ```
//!
//! Projections carry a single 8-byte row-index key used only to mark empty
//! entries. Targets always live in slots; AVG takes two consecutive slots.

use smallvec::SmallVec;

use crate::core::{ColumnType, Error, Result};
use crate::ir::AggKind;

/// Shape of the query that produced a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryDescriptionType {
    Projection,
    GroupByPerfectHash,
    GroupByBaselineHash,
    NonGroupedAggregate,
    Estimator,
}

impl QueryDescriptionType {
    pub fn is_group_by(&self) -> bool {
        matches!(
            self,
            QueryDescriptionType::GroupByPerfectHash | QueryDescriptionType::GroupByBaselineHash
        )
    }
}

/// Width of one slot: bytes reserved in the buffer and bytes of payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotSize {
    pub padded: u8,
    pub logical: u8,
}

impl SlotSize {
    pub const fn new(padded: u8, logical: u8) -> Self {
        Self { padded, logical }
    }

    pub const fn full() -> Self {
        Self::new(8, 8)
    }
}

#[inline]
pub(crate) fn align_to_8(n: usize) -> usize {
    (n + 7) & !7
}

/// Physical layout of a result buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryMemoryDescriptor {
    query_type: QueryDescriptionType,
    entry_count: usize,
    output_columnar: bool,
    key_count: usize,
    key_width: usize,
    slots: SmallVec<[SlotSize; 8]>,
    sort_on_gpu: bool,
}

impl QueryMemoryDescriptor {
    /// Projection buffer with a row-index key
    pub fn projection(entry_count: usize, slots: &[SlotSize]) -> Self {
        Self {
            query_type: QueryDescriptionType::Projection,
            entry_count,
            output_columnar: false,
            key_count: 1,
            key_width: 8,
            slots: slots.iter().copied().collect(),
            sort_on_gpu: false,
        }
    }

    /// Group-by buffer keyed by `key_count` group keys of `key_width` bytes
    pub fn group_by(
        query_type: QueryDescriptionType,
        entry_count: usize,
        key_count: usize,
        key_width: usize,
        slots: &[SlotSize],
    ) -> Self {
        Self {
            query_type,
            entry_count,
            output_columnar: false,
            key_count,
            key_width,
            slots: slots.iter().copied().collect(),
            sort_on_gpu: false,
        }
    }

    /// Single-entry aggregate without keys
    pub fn non_grouped(slots: &[SlotSize]) -> Self {
        Self {
            query_type: QueryDescriptionType::NonGroupedAggregate,
            entry_count: 1,
            output_columnar: false,
            key_count: 0,
            key_width: 8,
            slots: slots.iter().copied().collect(),
            sort_on_gpu: false,
        }
    }

    pub fn with_columnar(mut self, columnar: bool) -> Self {
        self.output_columnar = columnar;
        self
    }

    pub fn with_sort_on_gpu(mut self, sort_on_gpu: bool) -> Self {
        self.sort_on_gpu = sort_on_gpu;
        self
    }

    pub fn with_entry_count(mut self, entry_count: usize) -> Self {
        self.entry_count = entry_count;
        self
    }

    pub fn query_type(&self) -> QueryDescriptionType {
        self.query_type
    }

    pub fn entry_count(&self) -> usize {
        self.entry_count
    }

    pub(crate) fn set_entry_count(&mut self, entry_count: usize) {
        self.entry_count = entry_count;
    }

    pub fn did_output_columnar(&self) -> bool {
        self.output_columnar
    }

    pub fn key_count(&self) -> usize {
        self.key_count
    }

    pub fn key_width(&self) -> usize {
        self.key_width
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn slot(&self, idx: usize) -> Option<SlotSize> {
        self.slots.get(idx).copied()
    }

    pub fn padded_slot_width(&self, idx: usize) -> usize {
        self.slots.get(idx).map(|s| s.padded as usize).unwrap_or(0)
    }

    pub fn logical_slot_width(&self, idx: usize) -> usize {
        self.slots.get(idx).map(|s| s.logical as usize).unwrap_or(0)
    }

    pub fn sort_on_gpu(&self) -> bool {
        self.sort_on_gpu
    }

    /// True when both descriptors place the same slots the same way
    pub fn same_layout(&self, other: &Self) -> bool {
        self.query_type == other.query_type
            && self.output_columnar == other.output_columnar
            && self.key_count == other.key_count
            && self.key_width == other.key_width
            && self.slots == other.slots
    }

    // =========================================================================
    // Row-wise geometry
    // =========================================================================

    fn key_bytes(&self) -> usize {
        align_to_8(self.key_count * self.key_width)
    }

    /// Bytes of one row in row-wise layout
    pub fn row_size(&self) -> usize {
        let slots: usize = self.slots.iter().map(|s| s.padded as usize).sum();
        align_to_8(self.key_bytes() + slots)
    }

    fn slot_offset_in_row(&self, slot_idx: usize) -> usize {
        self.key_bytes()
            + self.slots[..slot_idx]
                .iter()
                .map(|s| s.padded as usize)
                .sum::<usize>()
    }

    // =========================================================================
    // Columnar geometry
    // =========================================================================

    fn key_column_offset(&self, key_idx: usize) -> usize {
        key_idx * align_to_8(self.key_width * self.entry_count)
    }

    /// Byte offset of a slot's run in columnar layout
    pub fn col_off_in_bytes(&self, slot_idx: usize) -> usize {
        let keys = self.key_count * align_to_8(self.key_width * self.entry_count);
        keys + self.slots[..slot_idx]
            .iter()
            .map(|s| align_to_8(s.padded as usize * self.entry_count))
            .sum::<usize>()
    }

    // =========================================================================
    // Addressing
    // =========================================================================

    /// Total buffer size in bytes
    pub fn buffer_size(&self) -> usize {
        if self.output_columnar {
            self.col_off_in_bytes(self.slots.len())
        } else {
            self.row_size() * self.entry_count
        }
    }

    /// (base offset, stride) of key `key_idx`; entry `i` lives at `base + i * stride`
    pub fn key_layout(&self, key_idx: usize) -> (usize, usize) {
        if self.output_columnar {
            (self.key_column_offset(key_idx), self.key_width)
        } else {
            (key_idx * self.key_width, self.row_size())
        }
    }

    /// (base offset, stride) of slot `slot_idx`
    pub fn slot_layout(&self, slot_idx: usize) -> (usize, usize) {
        if self.output_columnar {
            (
                self.col_off_in_bytes(slot_idx),
                self.padded_slot_width(slot_idx),
            )
        } else {
            (self.slot_offset_in_row(slot_idx), self.row_size())
        }
    }

    /// Validate that a buffer of `len` bytes matches this layout
    pub fn check_buffer(&self, len: usize) -> Result<()> {
        let expected = self.buffer_size();
        if len != expected {
            return Err(Error::LayoutMismatch(format!(
                "buffer has {} bytes, descriptor requires {}",
                len, expected
            )));
        }
        for slot in &self.slots {
            if !matches!(slot.padded, 1 | 2 | 4 | 8) || slot.logical > slot.padded {
                return Err(Error::LayoutMismatch(format!(
                    "invalid slot width {}/{}",
                    slot.padded, slot.logical
                )));
            }
        }
        Ok(())
    }
}

/// Description of one output column of a result set
#[derive(Debug, Clone, PartialEq)]
pub struct TargetInfo {
    pub is_agg: bool,
    pub agg_kind: Option<AggKind>,
    pub sql_type: ColumnType,
    pub is_distinct: bool,
    /// Quantile for APPROX_QUANTILE targets
    pub quantile: Option<f64>,
}

impl TargetInfo {
    /// Plain projected column
    pub fn column(sql_type: ColumnType) -> Self {
        Self {
            is_agg: false,
            agg_kind: None,
            sql_type,
            is_distinct: false,
            quantile: None,
        }
    }

    pub fn agg(kind: AggKind, sql_type: ColumnType) -> Self {
        Self {
            is_agg: true,
            agg_kind: Some(kind),
            sql_type,
            is_distinct: kind == AggKind::ApproxCountDistinct,
            quantile: None,
        }
    }

    pub fn count_distinct(sql_type: ColumnType) -> Self {
        Self {
            is_distinct: true,
            ..Self::agg(AggKind::Count, sql_type)
        }
    }

    pub fn approx_quantile(q: f64, sql_type: ColumnType) -> Self {
        Self {
            quantile: Some(q),
            ..Self::agg(AggKind::ApproxQuantile, sql_type)
        }
    }

    /// COUNT(DISTINCT) and APPROX_COUNT_DISTINCT keep a set per entry
    pub fn is_distinct_target(&self) -> bool {
        self.is_agg
            && self.is_distinct
            && matches!(
                self.agg_kind,
                Some(AggKind::Count) | Some(AggKind::ApproxCountDistinct)
            )
    }

    pub fn is_approx_quantile(&self) -> bool {
        self.agg_kind == Some(AggKind::ApproxQuantile)
    }

    pub fn is_avg(&self) -> bool {
        self.agg_kind == Some(AggKind::Avg)
    }

    /// Number of buffer slots this target occupies
    pub fn slot_count(&self) -> usize {
        if self.is_avg() {
            2
        } else {
            1
        }
    }
}

/// First slot index of every target
pub fn target_slot_indices(targets: &[TargetInfo]) -> Vec<usize> {
    let mut out = Vec::with_capacity(targets.len());
    let mut slot = 0;
    for target in targets {
        out.push(slot);
        slot += target.slot_count();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rowwise_geometry() {
        let desc = QueryMemoryDescriptor::group_by(
            QueryDescriptionType::GroupByBaselineHash,
            10,
            1,
            8,
            &[SlotSize::full(), SlotSize::new(4, 4)],
        );
        // 8 key + 8 + 4, aligned to 24
        assert_eq!(desc.row_size(), 24);
        assert_eq!(desc.buffer_size(), 240);
        assert_eq!(desc.slot_layout(1), (16, 24));
        assert_eq!(desc.key_layout(0), (0, 24));
    }

    #[test]
    fn test_columnar_geometry() {
        let desc = QueryMemoryDescriptor::projection(5, &[SlotSize::new(4, 4), SlotSize::full()])
            .with_columnar(true);
        // key run 40, slot0 run 20 -> 24, slot1 run 40
        assert_eq!(desc.col_off_in_bytes(0), 40);
        assert_eq!(desc.col_off_in_bytes(1), 64);
        assert_eq!(desc.buffer_size(), 104);
        assert_eq!(desc.slot_layout(0), (40, 4));
        assert!(desc.check_buffer(104).is_ok());
        assert!(desc.check_buffer(100).is_err());
    }

    #[test]
    fn test_target_slots() {
        let targets = vec![
            TargetInfo::column(ColumnType::bigint()),
            TargetInfo::agg(AggKind::Avg, ColumnType::double()),
            TargetInfo::count_distinct(ColumnType::bigint()),
        ];
        assert_eq!(target_slot_indices(&targets), vec![0, 1, 3]);
        assert!(targets[2].is_distinct_target());
        assert!(!targets[1].is_distinct_target());
    }
}
