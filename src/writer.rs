//! The single writer of a store.
//!
//! Creating a store lays out the header, the change queue and a zeroed
//! record array. Every record update follows the record lock protocol:
//!
//! 1. store `sequence | i64::MIN` (negative: locked),
//! 2. write timestamp and value,
//! 3. store `(sequence + 1) & i64::MAX` with release ordering.
//!
//! Notifications are published by writing the id into the queue slot at
//! `head & mask` and then advancing the head with release ordering, so a
//! reader that observes the new head also observes the entry.
//!
//! Only one `StoreWriter` may exist per store at a time. Nothing enforces
//! this across processes.

use crate::error::StoreError;
use crate::layout::{self, Geometry};
use crate::metadata::{IdAddressing, StoreMetadata};
use crate::mmap::{self, Access};
use crate::region::Region;
use crate::utils::{mono_time_ns, wall_time_us};
use std::sync::atomic::{Ordering, fence};
use tracing::{debug, info};

/// Creation parameters of a store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreLayout {
    pub base_id: i64,
    /// Highest valid id, inclusive.
    pub max_id: i64,
    pub value_size: usize,
    /// Change-queue entries; a power of two, at least 2.
    pub queue_capacity: usize,
    /// Free text stored in the header, truncated to 63 bytes.
    pub description: String,
    /// Recorded in the header. [`IdAddressing::Direct`] sizes the record
    /// array for ids `0..=max_id`.
    pub addressing: IdAddressing,
}

impl StoreLayout {
    pub fn new(base_id: i64, max_id: i64, value_size: usize) -> Self {
        Self {
            base_id,
            max_id,
            value_size,
            ..Self::default()
        }
    }

    pub fn with_queue_capacity(mut self, queue_capacity: usize) -> Self {
        self.queue_capacity = queue_capacity;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_addressing(mut self, addressing: IdAddressing) -> Self {
        self.addressing = addressing;
        self
    }
}

impl Default for StoreLayout {
    fn default() -> Self {
        Self {
            base_id: 0,
            max_id: 1023,
            value_size: 64,
            queue_capacity: 1024,
            description: String::new(),
            addressing: IdAddressing::default(),
        }
    }
}

/// Read-write handle to a store.
#[derive(Debug)]
pub struct StoreWriter {
    region: Region,
    metadata: StoreMetadata,
    location: String,
    head: u64,
}

impl StoreWriter {
    /// Creates the store at `location`, replacing any existing content.
    ///
    /// # Errors
    ///
    /// - [`StoreError::InvalidLayout`] if `layout` is unusable.
    /// - [`StoreError::OpenFailure`] if the location cannot be created or
    ///   mapped.
    pub fn create(location: &str, layout: &StoreLayout) -> Result<Self, StoreError> {
        let geometry = Geometry::compute(
            layout.base_id,
            layout.max_id,
            layout.value_size,
            layout.queue_capacity,
            layout.addressing,
            layout::page_size(),
        )?;
        let file = mmap::create(location, geometry.mmap_size)?;
        let ptr = mmap::map_shared(location, &file, geometry.mmap_size, Access::ReadWrite)?;
        drop(file);
        let region = unsafe { Region::from_mapping(ptr, geometry.mmap_size, Access::ReadWrite) };

        write_header(&region, &geometry, &layout.description);
        let metadata = StoreMetadata::parse(&region)?;
        info!(location, %metadata, "created store");
        Ok(Self {
            region,
            metadata,
            location: location.to_owned(),
            head: 0,
        })
    }

    /// Reopens an existing store for writing, continuing its queue.
    ///
    /// # Errors
    ///
    /// [`StoreError::ReadOnly`] if the location is not writable by this
    /// process, otherwise as [`Store::open`](crate::Store::open).
    pub fn open(location: &str) -> Result<Self, StoreError> {
        let (file, len) =
            mmap::open_existing(location, Access::ReadWrite).map_err(|err| match err {
                StoreError::OpenFailure { ref source, .. }
                    if source.kind() == std::io::ErrorKind::PermissionDenied =>
                {
                    StoreError::ReadOnly
                }
                err => err,
            })?;
        if len < layout::HEADER_LEN {
            return Err(StoreError::corrupt(format!("store is truncated ({len} bytes)")));
        }
        let ptr = mmap::map_shared(location, &file, len, Access::ReadWrite)?;
        drop(file);
        let region = unsafe { Region::from_mapping(ptr, len, Access::ReadWrite) };
        let metadata = StoreMetadata::parse(&region)?;
        region.write_bytes(
            layout::OWNER_PID_OFFSET,
            &std::process::id().to_le_bytes(),
        );
        let head = region.load_u64(metadata.queue_head_offset(), Ordering::Acquire);
        info!(location, head, %metadata, "reopened store for writing");
        Ok(Self {
            region,
            metadata,
            location: location.to_owned(),
            head,
        })
    }

    #[inline(always)]
    pub fn metadata(&self) -> &StoreMetadata {
        &self.metadata
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    #[inline(always)]
    pub(crate) fn region(&self) -> &Region {
        &self.region
    }

    /// Number of notifications published so far.
    #[inline(always)]
    pub fn queue_head(&self) -> u64 {
        self.head
    }

    /// Takes the record lock of `id`.
    ///
    /// Readers spin until the returned guard is dropped.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidId`] if `id` is outside the store.
    pub fn lock_record(&mut self, id: i64) -> Result<RecordWriteGuard<'_>, StoreError> {
        let offset = self
            .metadata
            .record_offset(id)
            .ok_or(StoreError::InvalidId {
                id,
                base_id: self.metadata.base_id(),
                max_id: self.metadata.max_id(),
            })?;
        let seq_at = offset + layout::RECORD_SEQUENCE_OFFSET;
        // A negative value here is a lock left behind by a dead writer.
        let sequence = self.region.load_i64(seq_at, Ordering::Relaxed) & i64::MAX;
        self.region
            .store_i64(seq_at, sequence | i64::MIN, Ordering::Relaxed);
        fence(Ordering::Release);
        Ok(RecordWriteGuard {
            region: &self.region,
            metadata: &self.metadata,
            offset,
            sequence,
        })
    }

    /// Overwrites the value of `id` (zero-padded to the value size) and
    /// stamps it with the current monotonic time.
    ///
    /// Returns the record's new sequence. Does not publish a notification.
    ///
    /// # Errors
    ///
    /// - [`StoreError::InvalidId`] if `id` is outside the store.
    /// - [`StoreError::ValueTooLarge`] if `value` exceeds the value size.
    pub fn write_record(&mut self, id: i64, value: &[u8]) -> Result<i64, StoreError> {
        let value_size = self.metadata.value_size();
        if value.len() > value_size {
            return Err(StoreError::ValueTooLarge {
                len: value.len(),
                value_size,
            });
        }
        let mut guard = self.lock_record(id)?;
        guard.write_value(value);
        guard.set_timestamp(mono_time_ns() as i64);
        Ok(guard.finish())
    }

    /// Appends `id` to the change queue.
    ///
    /// Returns the logical queue position it was written at.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidId`] if `id` is outside the store.
    pub fn publish(&mut self, id: i64) -> Result<u64, StoreError> {
        if !self.metadata.is_valid_id(id) {
            return Err(StoreError::InvalidId {
                id,
                base_id: self.metadata.base_id(),
                max_id: self.metadata.max_id(),
            });
        }
        let position = self.publish_raw(id);
        let high_water = self
            .region
            .load_i64(layout::HIGH_WATER_ID_OFFSET, Ordering::Relaxed);
        if id > high_water {
            self.region
                .store_i64(layout::HIGH_WATER_ID_OFFSET, id, Ordering::Release);
        }
        Ok(position)
    }

    /// Appends the gap marker to the change queue.
    pub fn publish_gap(&mut self) -> u64 {
        self.publish_raw(layout::GAP_ID)
    }

    /// Appends `id` to the change queue without validating it.
    ///
    /// Readers count ids outside the store as gaps.
    pub fn publish_raw(&mut self, id: i64) -> u64 {
        let position = self.head;
        self.region.store_i64(
            self.metadata.queue_entry_offset(position),
            id,
            Ordering::Relaxed,
        );
        self.head = position.wrapping_add(1);
        self.region.store_u64(
            self.metadata.queue_head_offset(),
            self.head,
            Ordering::Release,
        );
        position
    }

    /// Writes `value` to `id` and publishes it.
    ///
    /// # Errors
    ///
    /// Same as [`write_record`](Self::write_record).
    pub fn update(&mut self, id: i64, value: &[u8]) -> Result<u64, StoreError> {
        self.write_record(id, value)?;
        self.publish(id)
    }

    /// Refreshes the writer heartbeat with the current wall-clock time.
    pub fn touch(&mut self) {
        self.touch_at(wall_time_us());
    }

    /// Sets the writer heartbeat to `time_us`.
    pub fn touch_at(&mut self, time_us: i64) {
        self.region
            .store_i64(layout::TOUCHED_TIME_OFFSET, time_us, Ordering::Release);
    }

    /// Unmaps and deletes the store.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::OpenFailure`] if the location cannot be removed.
    pub fn remove(self) -> Result<(), StoreError> {
        let location = self.location.clone();
        drop(self);
        debug!(location, "removing store");
        mmap::unlink(&location)
    }
}

/// Exclusive write access to one record, released on drop.
///
/// Dropping the guard publishes the write by bumping the sequence.
#[derive(Debug)]
pub struct RecordWriteGuard<'a> {
    region: &'a Region,
    metadata: &'a StoreMetadata,
    offset: usize,
    sequence: i64,
}

impl RecordWriteGuard<'_> {
    /// Writes `value` at the start of the value payload, zero-filling the
    /// remainder.
    ///
    /// # Panics
    ///
    /// Panics if `value` is longer than the store's value size.
    pub fn write_value(&mut self, value: &[u8]) {
        let value_size = self.metadata.value_size();
        assert!(
            value.len() <= value_size,
            "value of {} bytes exceeds value size {value_size}",
            value.len()
        );
        let at = self.offset + self.metadata.value_offset();
        self.region.write_bytes(at, value);
        if value.len() < value_size {
            self.region
                .write_bytes(at + value.len(), &vec![0u8; value_size - value.len()]);
        }
    }

    /// Writes `bytes` at `offset` within the value payload.
    ///
    /// # Panics
    ///
    /// Panics if the range exceeds the value size.
    pub fn write_at(&mut self, offset: usize, bytes: &[u8]) {
        assert!(
            offset + bytes.len() <= self.metadata.value_size(),
            "write of {} bytes at {offset} exceeds value size {}",
            bytes.len(),
            self.metadata.value_size()
        );
        self.region
            .write_bytes(self.offset + self.metadata.value_offset() + offset, bytes);
    }

    pub fn set_timestamp(&mut self, nanos: i64) {
        self.region
            .write_bytes(self.offset + layout::RECORD_TIMESTAMP_OFFSET, &nanos.to_le_bytes());
    }

    fn next_sequence(&self) -> i64 {
        match self.sequence.wrapping_add(1) & i64::MAX {
            0 => 1,
            n => n,
        }
    }

    /// Releases the lock and returns the new sequence.
    pub fn finish(self) -> i64 {
        let next = self.next_sequence();
        drop(self);
        next
    }
}

impl Drop for RecordWriteGuard<'_> {
    fn drop(&mut self) {
        self.region.store_i64(
            self.offset + layout::RECORD_SEQUENCE_OFFSET,
            self.next_sequence(),
            Ordering::Release,
        );
    }
}

fn write_header(region: &Region, g: &Geometry, description: &str) {
    let put_u64 = |offset: usize, v: u64| region.write_bytes(offset, &v.to_le_bytes());
    let now = wall_time_us();

    region.write_bytes(layout::OWNER_PID_OFFSET, &std::process::id().to_le_bytes());
    put_u64(layout::MMAP_SIZE_OFFSET, g.mmap_size as u64);
    put_u64(layout::HDR_SIZE_OFFSET, g.hdr_size as u64);
    put_u64(layout::REC_SIZE_OFFSET, g.record_size as u64);
    put_u64(layout::VAL_SIZE_OFFSET, g.value_size as u64);
    put_u64(layout::VAL_OFFSET_OFFSET, g.value_offset as u64);
    region.write_bytes(layout::BASE_ID_OFFSET, &g.base_id.to_le_bytes());
    region.write_bytes(layout::MAX_ID_OFFSET, &g.max_id.to_le_bytes());
    region.write_bytes(layout::HIGH_WATER_ID_OFFSET, &(g.base_id - 1).to_le_bytes());
    put_u64(layout::Q_MASK_OFFSET, g.queue_capacity as u64 - 1);
    put_u64(layout::Q_HEAD_INDEX_OFFSET, layout::QUEUE_HEAD_OFFSET as u64);
    put_u64(layout::Q_START_INDEX_OFFSET, layout::QUEUE_START_OFFSET as u64);
    region.write_bytes(layout::VERSION_OFFSET, &layout::VERSION.to_le_bytes());
    region.write_bytes(layout::CREATED_TIME_OFFSET, &now.to_le_bytes());
    region.write_bytes(layout::TOUCHED_TIME_OFFSET, &now.to_le_bytes());
    region.write_bytes(
        layout::ADDRESSING_OFFSET,
        &g.addressing.to_raw().to_le_bytes(),
    );

    let mut text = [0u8; layout::DESCRIPTION_LEN];
    let n = description.len().min(layout::DESCRIPTION_LEN - 1);
    text[..n].copy_from_slice(&description.as_bytes()[..n]);
    region.write_bytes(layout::DESCRIPTION_OFFSET, &text);

    // Magic goes last: a reader that sees it sees a complete header.
    fence(Ordering::Release);
    region.write_bytes(layout::MAGIC_OFFSET, &layout::MAGIC.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Store;

    fn location(dir: &tempfile::TempDir) -> String {
        dir.path().join("store").to_str().unwrap().to_owned()
    }

    #[test]
    fn create_rejects_bad_layout() {
        let dir = tempfile::tempdir().unwrap();
        let err = StoreWriter::create(
            &location(&dir),
            &StoreLayout::new(0, 9, 8).with_queue_capacity(100),
        )
        .unwrap_err();
        assert!(matches!(err, StoreError::InvalidLayout(_)));
    }

    #[test]
    fn write_record_bumps_sequence_and_zero_pads() {
        let dir = tempfile::tempdir().unwrap();
        let path = location(&dir);
        let mut writer = StoreWriter::create(&path, &StoreLayout::new(0, 9, 16)).unwrap();
        assert_eq!(writer.write_record(2, &[0xff; 16]).unwrap(), 1);
        assert_eq!(writer.write_record(2, &[1, 2]).unwrap(), 2);

        let store = Store::open(&path).unwrap();
        let rec = store.record(2).unwrap();
        assert_eq!(rec.sequence(), 2);
        let mut expected = vec![0u8; 16];
        expected[..2].copy_from_slice(&[1, 2]);
        assert_eq!(rec.read_bytes_consistent(), expected);
    }

    #[test]
    fn write_record_validates_input() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = StoreWriter::create(&location(&dir), &StoreLayout::new(5, 9, 8)).unwrap();
        assert!(matches!(
            writer.write_record(4, &[0; 8]),
            Err(StoreError::InvalidId { id: 4, .. })
        ));
        assert!(matches!(
            writer.write_record(5, &[0; 9]),
            Err(StoreError::ValueTooLarge { len: 9, value_size: 8 })
        ));
        assert!(matches!(writer.publish(10), Err(StoreError::InvalidId { .. })));
    }

    #[test]
    fn lock_guard_marks_record_locked_until_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let path = location(&dir);
        let mut writer = StoreWriter::create(&path, &StoreLayout::new(0, 9, 8)).unwrap();
        let store = Store::open(&path).unwrap();

        let mut guard = writer.lock_record(1).unwrap();
        assert!(store.record(1).unwrap().is_locked());
        guard.write_at(0, &7u64.to_le_bytes());
        drop(guard);

        let rec = store.record(1).unwrap();
        assert!(!rec.is_locked());
        assert_eq!(rec.sequence(), 1);
        assert_eq!(rec.get_u64(0), 7);
    }

    #[test]
    fn stale_lock_is_recovered() {
        let dir = tempfile::tempdir().unwrap();
        let path = location(&dir);
        let mut writer = StoreWriter::create(&path, &StoreLayout::new(0, 9, 8)).unwrap();
        writer.write_record(3, &[1; 8]).unwrap();
        let guard = writer.lock_record(3).unwrap();
        std::mem::forget(guard);

        assert_eq!(writer.write_record(3, &[2; 8]).unwrap(), 2);
    }

    #[test]
    fn publish_wraps_queue_and_tracks_high_water() {
        let dir = tempfile::tempdir().unwrap();
        let path = location(&dir);
        let layout = StoreLayout::new(0, 99, 8).with_queue_capacity(4);
        let mut writer = StoreWriter::create(&path, &layout).unwrap();
        let store = Store::open(&path).unwrap();
        assert_eq!(store.high_water_id(), -1);

        for id in [3, 1, 4, 1, 5, 9] {
            writer.publish(id).unwrap();
        }
        assert_eq!(writer.queue_head(), 6);
        assert_eq!(store.queue_head(), 6);
        assert_eq!(store.read_queue(4), 5);
        assert_eq!(store.read_queue(5), 9);
        assert_eq!(store.read_queue(2), 4);
        assert_eq!(store.high_water_id(), 9);
    }

    #[test]
    fn reopen_continues_queue() {
        let dir = tempfile::tempdir().unwrap();
        let path = location(&dir);
        let layout = StoreLayout::new(0, 9, 8).with_description("reopen");
        let mut writer = StoreWriter::create(&path, &layout).unwrap();
        writer.update(1, &[1; 8]).unwrap();
        drop(writer);

        let mut writer = StoreWriter::open(&path).unwrap();
        assert_eq!(writer.queue_head(), 1);
        assert_eq!(writer.update(1, &[2; 8]).unwrap(), 1);
        assert_eq!(writer.metadata().description(), "reopen");
        writer.remove().unwrap();
        assert!(!std::path::Path::new(&path).exists());
    }

    #[test]
    fn direct_addressing_accepts_whole_id_range() {
        let dir = tempfile::tempdir().unwrap();
        let path = location(&dir);
        let layout = StoreLayout::new(100, 199, 8).with_addressing(IdAddressing::Direct);
        let mut writer = StoreWriter::create(&path, &layout).unwrap();
        for id in [100, 150, 199] {
            writer.update(id, &(id as u64).to_le_bytes()).unwrap();
        }
        assert!(matches!(writer.write_record(99, &[0; 8]), Err(StoreError::InvalidId { .. })));

        let store = Store::open(&path).unwrap();
        assert_eq!(store.metadata().addressing(), IdAddressing::Direct);
        assert_eq!(store.record(150).unwrap().get_u64(0), 150);
        assert_eq!(store.record(199).unwrap().get_u64(0), 199);

        let reopened = StoreWriter::open(&path).unwrap();
        assert_eq!(reopened.metadata().addressing(), IdAddressing::Direct);
        assert_eq!(reopened.queue_head(), 3);
    }

    #[test]
    fn long_description_is_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let path = location(&dir);
        let layout = StoreLayout::new(0, 9, 8).with_description("x".repeat(200));
        let writer = StoreWriter::create(&path, &layout).unwrap();
        assert_eq!(writer.metadata().description().len(), layout::DESCRIPTION_LEN - 1);
    }
}
