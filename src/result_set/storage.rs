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

//! Result buffer storage
//!
//! [`ResultSetStorage`] owns one contiguous buffer laid out by a
//! [`QueryMemoryDescriptor`]. Callers never compute byte offsets themselves:
//! they ask for a [`SlotView`] over a key or slot and index it by entry.

use rustc_hash::FxHashSet;

use super::descriptor::{QueryDescriptionType, QueryMemoryDescriptor};
use crate::core::types::{empty_key, NULL_BIGINT};
use crate::core::{Error, Result};

// =============================================================================
// Raw slot access
// =============================================================================

#[inline]
pub(crate) fn read_int(bytes: &[u8], off: usize, width: usize) -> i64 {
    match width {
        1 => bytes[off] as i8 as i64,
        2 => i16::from_le_bytes([bytes[off], bytes[off + 1]]) as i64,
        4 => {
            let mut b = [0u8; 4];
            b.copy_from_slice(&bytes[off..off + 4]);
            i32::from_le_bytes(b) as i64
        }
        _ => {
            let mut b = [0u8; 8];
            b.copy_from_slice(&bytes[off..off + 8]);
            i64::from_le_bytes(b)
        }
    }
}

#[inline]
pub(crate) fn write_int(bytes: &mut [u8], off: usize, width: usize, value: i64) {
    match width {
        1 => bytes[off] = value as i8 as u8,
        2 => bytes[off..off + 2].copy_from_slice(&(value as i16).to_le_bytes()),
        4 => bytes[off..off + 4].copy_from_slice(&(value as i32).to_le_bytes()),
        _ => bytes[off..off + 8].copy_from_slice(&value.to_le_bytes()),
    }
}

/// Read-only view over one key or slot across all entries of a buffer
#[derive(Debug, Clone, Copy)]
pub struct SlotView<'a> {
    bytes: &'a [u8],
    base: usize,
    stride: usize,
    width: usize,
}

impl<'a> SlotView<'a> {
    pub(crate) fn new(bytes: &'a [u8], base: usize, stride: usize, width: usize) -> Self {
        Self {
            bytes,
            base,
            stride,
            width,
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    #[inline]
    fn offset(&self, entry: usize) -> usize {
        self.base + entry * self.stride
    }

    /// Integer at `entry`, sign-extended from the slot width
    #[inline]
    pub fn get(&self, entry: usize) -> i64 {
        read_int(self.bytes, self.offset(entry), self.width)
    }

    #[inline]
    pub fn get_f32(&self, entry: usize) -> f32 {
        f32::from_bits(read_int(self.bytes, self.offset(entry), 4) as u32)
    }

    #[inline]
    pub fn get_f64(&self, entry: usize) -> f64 {
        f64::from_bits(read_int(self.bytes, self.offset(entry), 8) as u64)
    }

    /// Raw bytes of the slot at `entry`
    pub fn raw(&self, entry: usize) -> &'a [u8] {
        let off = self.offset(entry);
        &self.bytes[off..off + self.width]
    }
}

// =============================================================================
// Aggregate state
// =============================================================================

/// Samples backing an APPROX_QUANTILE target
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QuantileDigest {
    samples: Vec<f64>,
}

impl QuantileDigest {
    pub fn new(samples: Vec<f64>) -> Self {
        Self { samples }
    }

    pub fn add(&mut self, value: f64) {
        self.samples.push(value);
    }

    /// Linearly interpolated quantile, `None` when no samples were seen
    pub fn quantile(&self, q: f64) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        let mut sorted = self.samples.clone();
        sorted.sort_by(f64::total_cmp);
        let pos = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
        let lo = pos.floor() as usize;
        let hi = pos.ceil() as usize;
        let frac = pos - lo as f64;
        Some(sorted[lo] + (sorted[hi] - sorted[lo]) * frac)
    }
}

/// Out-of-line state referenced by handle from count-distinct and quantile slots
#[derive(Debug, Clone, Default)]
pub struct AggregateState {
    count_distinct_sets: Vec<FxHashSet<i64>>,
    quantile_digests: Vec<QuantileDigest>,
}

impl AggregateState {
    /// Register a distinct set and return the handle to store in the slot
    pub fn add_count_distinct_set(&mut self, set: FxHashSet<i64>) -> i64 {
        self.count_distinct_sets.push(set);
        (self.count_distinct_sets.len() - 1) as i64
    }

    pub fn add_quantile_digest(&mut self, digest: QuantileDigest) -> i64 {
        self.quantile_digests.push(digest);
        (self.quantile_digests.len() - 1) as i64
    }

    /// Cardinality of the set behind `handle`, 0 for a missing set
    pub fn count_distinct_size(&self, handle: i64) -> i64 {
        if handle < 0 {
            return 0;
        }
        self.count_distinct_sets
            .get(handle as usize)
            .map(|s| s.len() as i64)
            .unwrap_or(0)
    }

    pub fn quantile(&self, handle: i64, q: f64) -> Option<f64> {
        if handle < 0 {
            return None;
        }
        self.quantile_digests
            .get(handle as usize)
            .and_then(|d| d.quantile(q))
    }
}

// =============================================================================
// ResultSetStorage
// =============================================================================

/// One contiguous result buffer plus its aggregate side state
#[derive(Debug, Clone)]
pub struct ResultSetStorage {
    desc: QueryMemoryDescriptor,
    buffer: Vec<u8>,
    agg_state: AggregateState,
}

impl ResultSetStorage {
    /// Allocate a buffer with every entry marked empty
    pub fn new(desc: QueryMemoryDescriptor) -> Self {
        let buffer = vec![0u8; desc.buffer_size()];
        let mut storage = Self {
            desc,
            buffer,
            agg_state: AggregateState::default(),
        };
        storage.mark_all_empty();
        storage
    }

    /// Wrap a buffer filled by the compiled engine
    pub fn from_buffer(desc: QueryMemoryDescriptor, buffer: Vec<u8>) -> Result<Self> {
        desc.check_buffer(buffer.len())?;
        Ok(Self {
            desc,
            buffer,
            agg_state: AggregateState::default(),
        })
    }

    pub fn with_agg_state(mut self, agg_state: AggregateState) -> Self {
        self.agg_state = agg_state;
        self
    }

    fn mark_all_empty(&mut self) {
        if self.desc.key_count() == 0 {
            return;
        }
        let width = self.desc.key_width();
        let marker = empty_key(width);
        let (base, stride) = self.desc.key_layout(0);
        for entry in 0..self.desc.entry_count() {
            write_int(&mut self.buffer, base + entry * stride, width, marker);
        }
    }

    pub fn desc(&self) -> &QueryMemoryDescriptor {
        &self.desc
    }

    pub fn entry_count(&self) -> usize {
        self.desc.entry_count()
    }

    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    pub(crate) fn buffer_mut(&mut self) -> &mut [u8] {
        &mut self.buffer
    }

    pub fn agg_state(&self) -> &AggregateState {
        &self.agg_state
    }

    pub(crate) fn agg_state_mut(&mut self) -> &mut AggregateState {
        &mut self.agg_state
    }

    pub fn key_view(&self, key_idx: usize) -> SlotView<'_> {
        let (base, stride) = self.desc.key_layout(key_idx);
        SlotView::new(&self.buffer, base, stride, self.desc.key_width())
    }

    pub fn slot_view(&self, slot_idx: usize) -> SlotView<'_> {
        let (base, stride) = self.desc.slot_layout(slot_idx);
        SlotView::new(
            &self.buffer,
            base,
            stride,
            self.desc.padded_slot_width(slot_idx),
        )
    }

    pub(crate) fn write_key(&mut self, entry: usize, key_idx: usize, value: i64) {
        let (base, stride) = self.desc.key_layout(key_idx);
        let width = self.desc.key_width();
        write_int(&mut self.buffer, base + entry * stride, width, value);
    }

    pub(crate) fn write_slot(&mut self, entry: usize, slot_idx: usize, value: i64) {
        let (base, stride) = self.desc.slot_layout(slot_idx);
        let width = self.desc.padded_slot_width(slot_idx);
        write_int(&mut self.buffer, base + entry * stride, width, value);
    }

    /// True if `entry` holds no row
    pub fn is_empty_entry(&self, entry: usize) -> bool {
        match self.desc.query_type() {
            QueryDescriptionType::NonGroupedAggregate | QueryDescriptionType::Estimator => false,
            _ if self.desc.key_count() == 0 => false,
            _ => self.key_view(0).get(entry) == empty_key(self.desc.key_width()),
        }
    }

    /// Row count of a projection buffer whose rows fill a prefix of the entries
    pub fn bin_search_row_count(&self) -> usize {
        let entry_count = self.entry_count();
        if entry_count == 0 {
            return 0;
        }
        if self.desc.key_count() == 0 {
            return entry_count;
        }
        let (mut lo, mut hi) = (0usize, entry_count);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.is_empty_entry(mid) {
                hi = mid;
            } else {
                lo = mid + 1;
            }
        }
        lo
    }

    /// Physically reorder entries so that new entry `i` is old entry `order[i]`
    pub(crate) fn permute_entries(&mut self, order: &[u32]) -> Result<()> {
        if order.len() != self.entry_count() {
            return Err(Error::internal(format!(
                "permutation of {} entries applied to {} entries",
                order.len(),
                self.entry_count()
            )));
        }
        let old = self.buffer.clone();
        if self.desc.did_output_columnar() {
            let keys = (0..self.desc.key_count())
                .map(|k| (self.desc.key_layout(k), self.desc.key_width()));
            let slots = (0..self.desc.slot_count())
                .map(|s| (self.desc.slot_layout(s), self.desc.padded_slot_width(s)));
            let columns: Vec<((usize, usize), usize)> = keys.chain(slots).collect();
            for ((base, stride), width) in columns {
                for (new_idx, &old_idx) in order.iter().enumerate() {
                    let src = base + old_idx as usize * stride;
                    let dst = base + new_idx * stride;
                    self.buffer[dst..dst + width].copy_from_slice(&old[src..src + width]);
                }
            }
        } else {
            let row = self.desc.row_size();
            for (new_idx, &old_idx) in order.iter().enumerate() {
                let src = old_idx as usize * row;
                let dst = new_idx * row;
                self.buffer[dst..dst + row].copy_from_slice(&old[src..src + row]);
            }
        }
        Ok(())
    }
}

/// Inline NULL marker for an absent aggregate handle
pub(crate) const NO_HANDLE: i64 = NULL_BIGINT;
