//! Fixed layout parameters of an opened store.

use crate::error::StoreError;
use crate::layout::{self, QUEUE_ENTRY_SIZE};
use crate::region::Region;
use serde::{Deserialize, Serialize};
use std::fmt;

/// How a record id maps to a slot of the record array.
///
/// Chosen when the store is created and recorded in its header; readers
/// take it from there.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdAddressing {
    /// Slot index is `id - base_id`.
    #[default]
    BaseOffset,
    /// Slot index is `id`.
    Direct,
}

impl IdAddressing {
    pub(crate) const fn to_raw(self) -> u32 {
        match self {
            IdAddressing::BaseOffset => 0,
            IdAddressing::Direct => 1,
        }
    }

    pub(crate) const fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(IdAddressing::BaseOffset),
            1 => Some(IdAddressing::Direct),
            _ => None,
        }
    }
}

/// Immutable description of an opened store, read once from its header.
///
/// Offsets are byte offsets from the start of the mapped region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreMetadata {
    queue_capacity: usize,
    queue_mask: u64,
    record_size: usize,
    value_size: usize,
    value_offset: usize,
    base_id: i64,
    max_id: i64,
    record_count: usize,
    queue_head_offset: usize,
    queue_offset: usize,
    record_array_offset: usize,
    mmap_size: usize,
    owner_pid: u32,
    version: u16,
    created_time: i64,
    description: String,
    addressing: IdAddressing,
}

fn field(region: &Region, offset: usize, name: &str) -> Result<usize, StoreError> {
    usize::try_from(region.read_u64(offset))
        .map_err(|_| StoreError::corrupt(format!("{name} does not fit in memory")))
}

impl StoreMetadata {
    /// Reads and validates the header of `region`.
    ///
    /// # Errors
    ///
    /// - [`StoreError::CorruptStore`] if the region is truncated, the magic
    ///   does not match, or any field is structurally invalid.
    /// - [`StoreError::IncompatibleVersion`] if the layout major version
    ///   differs from this library's.
    pub fn parse(region: &Region) -> Result<Self, StoreError> {
        if region.len() < layout::HEADER_LEN {
            return Err(StoreError::corrupt(format!(
                "store is truncated ({} bytes)",
                region.len()
            )));
        }

        let magic = region.read_u32(layout::MAGIC_OFFSET);
        if magic != layout::MAGIC {
            return Err(StoreError::corrupt(format!("bad magic {magic:#010x}")));
        }

        let version = region.read_u16(layout::VERSION_OFFSET);
        if version >> 8 != layout::VERSION_MAJOR {
            return Err(StoreError::IncompatibleVersion {
                found: version,
                expected: layout::VERSION_MAJOR,
            });
        }

        let mmap_size = field(region, layout::MMAP_SIZE_OFFSET, "mmap_size")?;
        if mmap_size != region.len() {
            return Err(StoreError::corrupt(format!(
                "size mismatch: header says {mmap_size} bytes, mapping has {}",
                region.len()
            )));
        }

        let hdr_size = field(region, layout::HDR_SIZE_OFFSET, "hdr_size")?;
        let record_size = field(region, layout::REC_SIZE_OFFSET, "rec_size")?;
        let value_size = field(region, layout::VAL_SIZE_OFFSET, "val_size")?;
        let value_offset = field(region, layout::VAL_OFFSET_OFFSET, "val_offset")?;
        let base_id = region.read_i64(layout::BASE_ID_OFFSET);
        let max_id = region.read_i64(layout::MAX_ID_OFFSET);
        let queue_mask = region.read_u64(layout::Q_MASK_OFFSET);
        let queue_head_offset = field(region, layout::Q_HEAD_INDEX_OFFSET, "q_head_index")?;
        let queue_offset = field(region, layout::Q_START_INDEX_OFFSET, "q_start_index")?;
        let raw_addressing = region.read_u32(layout::ADDRESSING_OFFSET);
        let addressing = IdAddressing::from_raw(raw_addressing).ok_or_else(|| {
            StoreError::corrupt(format!("unknown id addressing mode {raw_addressing}"))
        })?;

        let queue_capacity = queue_mask
            .checked_add(1)
            .and_then(|c| usize::try_from(c).ok())
            .filter(|c| *c >= 2 && c.is_power_of_two())
            .ok_or_else(|| {
                StoreError::corrupt(format!(
                    "queue mask {queue_mask:#x} is not a power of two minus one"
                ))
            })?;

        if base_id < 0 || max_id < base_id {
            return Err(StoreError::corrupt(format!(
                "invalid id range {base_id}..={max_id}"
            )));
        }
        let record_count = layout::slot_count(base_id, max_id, addressing)
            .ok_or_else(|| StoreError::corrupt("id range too large"))?;

        if record_size == 0 || record_size % 8 != 0 {
            return Err(StoreError::corrupt(format!(
                "record size {record_size} is not a positive multiple of 8"
            )));
        }
        if value_offset < layout::RECORD_TIMESTAMP_OFFSET + 8
            || value_offset
                .checked_add(value_size)
                .is_none_or(|end| end > record_size)
        {
            return Err(StoreError::corrupt(format!(
                "value region {value_offset}+{value_size} does not fit record size {record_size}"
            )));
        }
        if queue_head_offset % 8 != 0
            || queue_head_offset < layout::DESCRIPTION_OFFSET + layout::DESCRIPTION_LEN
            || queue_head_offset.saturating_add(8) > queue_offset
        {
            return Err(StoreError::corrupt(format!(
                "queue head offset {queue_head_offset} is misplaced"
            )));
        }
        let queue_end = queue_capacity
            .checked_mul(QUEUE_ENTRY_SIZE)
            .and_then(|n| n.checked_add(queue_offset));
        if queue_offset % 8 != 0 || queue_end.is_none_or(|end| end > hdr_size) {
            return Err(StoreError::corrupt(format!(
                "queue of {queue_capacity} entries at {queue_offset} overruns header of {hdr_size} bytes"
            )));
        }
        let records_end = record_size
            .checked_mul(record_count)
            .and_then(|n| n.checked_add(hdr_size));
        if hdr_size % 8 != 0 || records_end.is_none_or(|end| end > mmap_size) {
            return Err(StoreError::corrupt(format!(
                "record array of {record_count} x {record_size} bytes overruns store of {mmap_size} bytes"
            )));
        }

        let raw = region.read_array::<{ layout::DESCRIPTION_LEN }>(layout::DESCRIPTION_OFFSET);
        let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
        let description = String::from_utf8_lossy(&raw[..end]).into_owned();

        Ok(Self {
            queue_capacity,
            queue_mask,
            record_size,
            value_size,
            value_offset,
            base_id,
            max_id,
            record_count,
            queue_head_offset,
            queue_offset,
            record_array_offset: hdr_size,
            mmap_size,
            owner_pid: region.read_u32(layout::OWNER_PID_OFFSET),
            version,
            created_time: region.read_i64(layout::CREATED_TIME_OFFSET),
            description,
            addressing,
        })
    }

    #[inline(always)]
    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity
    }

    #[inline(always)]
    pub fn queue_mask(&self) -> u64 {
        self.queue_mask
    }

    #[inline(always)]
    pub fn record_size(&self) -> usize {
        self.record_size
    }

    #[inline(always)]
    pub fn value_size(&self) -> usize {
        self.value_size
    }

    #[inline(always)]
    pub fn value_offset(&self) -> usize {
        self.value_offset
    }

    #[inline(always)]
    pub fn base_id(&self) -> i64 {
        self.base_id
    }

    /// Highest valid record id (inclusive).
    #[inline(always)]
    pub fn max_id(&self) -> i64 {
        self.max_id
    }

    /// Number of slots in the record array.
    #[inline(always)]
    pub fn record_count(&self) -> usize {
        self.record_count
    }

    #[inline(always)]
    pub fn queue_head_offset(&self) -> usize {
        self.queue_head_offset
    }

    #[inline(always)]
    pub fn queue_offset(&self) -> usize {
        self.queue_offset
    }

    #[inline(always)]
    pub fn record_array_offset(&self) -> usize {
        self.record_array_offset
    }

    pub fn mmap_size(&self) -> usize {
        self.mmap_size
    }

    pub fn owner_pid(&self) -> u32 {
        self.owner_pid
    }

    pub fn version(&self) -> u16 {
        self.version
    }

    /// Wall-clock creation time of the store, in microseconds.
    pub fn created_time(&self) -> i64 {
        self.created_time
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn addressing(&self) -> IdAddressing {
        self.addressing
    }

    /// Whether `id` lies in `[base_id, max_id]`.
    #[inline(always)]
    pub fn is_valid_id(&self, id: i64) -> bool {
        id >= self.base_id && id <= self.max_id
    }

    /// Byte offset of the slot holding `id`, or `None` when the id is
    /// outside the store's range.
    #[inline(always)]
    pub fn record_offset(&self, id: i64) -> Option<usize> {
        if !self.is_valid_id(id) {
            return None;
        }
        let index = match self.addressing {
            IdAddressing::BaseOffset => id - self.base_id,
            IdAddressing::Direct => id,
        } as usize;
        (index < self.record_count).then(|| self.record_array_offset + index * self.record_size)
    }

    /// Byte offset of the queue entry for logical position `position`.
    #[inline(always)]
    pub fn queue_entry_offset(&self, position: u64) -> usize {
        self.queue_offset + (position & self.queue_mask) as usize * QUEUE_ENTRY_SIZE
    }
}

impl fmt::Display for StoreMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "StoreMetadata [description={:?}, version={:#06x}, queueCapacity={}, recordSize={}, \
             valueSize={}, valueOffset={}, ids={}..={}, addressing={:?}, queueHead@{}, queue@{}, \
             records@{}, size={}]",
            self.description,
            self.version,
            self.queue_capacity,
            self.record_size,
            self.value_size,
            self.value_offset,
            self.base_id,
            self.max_id,
            self.addressing,
            self.queue_head_offset,
            self.queue_offset,
            self.record_array_offset,
            self.mmap_size,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::Geometry;
    use crate::test_support::{scratch_store, scratch_store_with, TestStore};
    use crate::StoreLayout;
    use std::sync::atomic::Ordering;

    #[test]
    fn parse_reads_writer_geometry() {
        let ts = scratch_store(100, 199, 24, 128);
        let md = ts.store.metadata();
        let g = Geometry::compute(
            100,
            199,
            24,
            128,
            IdAddressing::BaseOffset,
            crate::layout::page_size(),
        )
        .unwrap();
        assert_eq!(md.queue_capacity(), 128);
        assert_eq!(md.queue_mask(), 127);
        assert_eq!(md.record_size(), g.record_size);
        assert_eq!(md.value_size(), 24);
        assert_eq!(md.value_offset(), layout::RECORD_VALUE_OFFSET);
        assert_eq!(md.base_id(), 100);
        assert_eq!(md.max_id(), 199);
        assert_eq!(md.record_count(), 100);
        assert_eq!(md.record_array_offset(), g.hdr_size);
        assert_eq!(md.mmap_size(), g.mmap_size);
        assert_eq!(md.description(), "test store");
        assert_eq!(md.owner_pid(), std::process::id());
        assert_eq!(md.addressing(), IdAddressing::BaseOffset);
    }

    #[test]
    fn record_offsets_follow_addressing() {
        let ts = scratch_store(100, 199, 24, 8);
        let md = ts.store.metadata();
        let first = md.record_array_offset();
        assert_eq!(md.record_offset(100), Some(first));
        assert_eq!(md.record_offset(101), Some(first + md.record_size()));
        assert_eq!(md.record_offset(199), Some(first + 99 * md.record_size()));
        assert_eq!(md.record_offset(99), None);
        assert_eq!(md.record_offset(200), None);
        assert_eq!(md.record_offset(-1), None);

        let ts = scratch_store_with(
            StoreLayout::new(100, 199, 24)
                .with_queue_capacity(8)
                .with_addressing(IdAddressing::Direct),
        );
        let md = ts.store.metadata();
        let first = md.record_array_offset();
        assert_eq!(md.addressing(), IdAddressing::Direct);
        assert_eq!(md.record_count(), 200);
        assert_eq!(md.record_offset(100), Some(first + 100 * md.record_size()));
        assert_eq!(md.record_offset(199), Some(first + 199 * md.record_size()));
        assert_eq!(md.record_offset(99), None);
        assert_eq!(md.record_offset(200), None);
    }

    #[test]
    fn unknown_addressing_mode_is_corrupt() {
        let err = corrupt_and_open(|ts| {
            ts.writer
                .region()
                .write_bytes(layout::ADDRESSING_OFFSET, &7u32.to_le_bytes())
        });
        assert!(matches!(err, StoreError::CorruptStore { ref reason } if reason.contains("addressing")));
    }

    #[test]
    fn queue_entry_offsets_wrap() {
        let ts = scratch_store(0, 9, 8, 8);
        let md = ts.store.metadata();
        assert_eq!(md.queue_entry_offset(0), md.queue_offset());
        assert_eq!(md.queue_entry_offset(9), md.queue_offset() + 8);
        assert_eq!(md.queue_entry_offset(8), md.queue_offset());
    }

    fn corrupt_and_open(patch: impl FnOnce(&TestStore)) -> StoreError {
        let ts = scratch_store(0, 9, 8, 8);
        patch(&ts);
        crate::Store::open(&ts.path).unwrap_err()
    }

    #[test]
    fn bad_magic_is_corrupt_store() {
        let err = corrupt_and_open(|ts| ts.writer.region().write_bytes(0, &[0, 0, 0, 0]));
        assert!(matches!(err, StoreError::CorruptStore { ref reason } if reason.contains("magic")));
    }

    #[test]
    fn major_version_mismatch_is_rejected() {
        let err = corrupt_and_open(|ts| {
            ts.writer
                .region()
                .write_bytes(layout::VERSION_OFFSET, &0x0200u16.to_le_bytes())
        });
        assert!(matches!(
            err,
            StoreError::IncompatibleVersion {
                found: 0x0200,
                expected: 1
            }
        ));
    }

    #[test]
    fn non_power_of_two_queue_is_corrupt() {
        let err = corrupt_and_open(|ts| {
            ts.writer
                .region()
                .store_u64(layout::Q_MASK_OFFSET, 5, Ordering::Relaxed)
        });
        assert!(matches!(err, StoreError::CorruptStore { ref reason } if reason.contains("queue mask")));
    }

    #[test]
    fn size_mismatch_is_corrupt() {
        let err = corrupt_and_open(|ts| {
            ts.writer
                .region()
                .store_u64(layout::MMAP_SIZE_OFFSET, 1 << 40, Ordering::Relaxed)
        });
        assert!(matches!(err, StoreError::CorruptStore { ref reason } if reason.contains("size mismatch")));
    }

    #[test]
    fn inverted_id_range_is_corrupt() {
        let err = corrupt_and_open(|ts| {
            ts.writer
                .region()
                .store_i64(layout::MAX_ID_OFFSET, -5, Ordering::Relaxed)
        });
        assert!(matches!(err, StoreError::CorruptStore { ref reason } if reason.contains("id range")));
    }

    #[test]
    fn truncated_file_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short");
        std::fs::write(&path, [0u8; 16]).unwrap();
        let err = crate::Store::open(path.to_str().unwrap()).unwrap_err();
        assert!(matches!(err, StoreError::CorruptStore { ref reason } if reason.contains("truncated")));
    }
}
