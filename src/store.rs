use crate::error::StoreError;
use crate::layout;
use crate::metadata::{IdAddressing, StoreMetadata};
use crate::mmap::{self, Access};
use crate::record::RecordAccessor;
use crate::region::Region;
use std::sync::atomic::Ordering;
use tracing::{debug, info};

/// A read-only handle to an opened store.
///
/// The handle owns the mapping; dropping it (or calling [`close`](Self::close))
/// unmaps the store exactly once. It never writes to the mapped memory.
///
/// `Store` is `Send + Sync`: the change-queue consumer and the new-record
/// discovery loop share one handle by reference.
#[derive(Debug)]
pub struct Store {
    region: Region,
    metadata: StoreMetadata,
    location: String,
}

impl Store {
    /// Opens the store at `location`.
    ///
    /// `location` is a filesystem path, or `shm:/NAME` for a POSIX
    /// shared-memory object. Id addressing is taken from the header.
    ///
    /// # Errors
    ///
    /// - [`StoreError::OpenFailure`] if the location cannot be opened or mapped.
    /// - [`StoreError::CorruptStore`] / [`StoreError::IncompatibleVersion`]
    ///   if the header fails validation.
    pub fn open(location: &str) -> Result<Self, StoreError> {
        debug!(location, "opening store");
        let (file, len) = mmap::open_existing(location, Access::ReadOnly)?;
        if len < layout::HEADER_LEN {
            return Err(StoreError::corrupt(format!("store is truncated ({len} bytes)")));
        }
        let ptr = mmap::map_shared(location, &file, len, Access::ReadOnly)?;
        drop(file);
        let region = unsafe { Region::from_mapping(ptr, len, Access::ReadOnly) };
        let metadata = StoreMetadata::parse(&region)?;
        info!(location, %metadata, "opened store");
        Ok(Self {
            region,
            metadata,
            location: location.to_owned(),
        })
    }

    /// Opens the store at `location`, requiring it to use `addressing`.
    ///
    /// # Errors
    ///
    /// [`StoreError::AddressingMismatch`] if the store was created with
    /// another mode, otherwise as [`Store::open`].
    pub fn open_with(location: &str, addressing: IdAddressing) -> Result<Self, StoreError> {
        let store = Self::open(location)?;
        store.expect_addressing(addressing)?;
        Ok(store)
    }

    pub(crate) fn expect_addressing(&self, expected: IdAddressing) -> Result<(), StoreError> {
        let found = self.metadata.addressing();
        if found != expected {
            return Err(StoreError::AddressingMismatch { found, expected });
        }
        Ok(())
    }

    /// Unmaps the store.
    ///
    /// Equivalent to dropping the handle; consuming `self` makes a second
    /// close impossible.
    pub fn close(self) {
        debug!(location = %self.location, "closing store");
    }

    #[inline(always)]
    pub fn metadata(&self) -> &StoreMetadata {
        &self.metadata
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    /// Raw view of the mapped memory.
    #[inline(always)]
    pub fn region(&self) -> &Region {
        &self.region
    }

    /// Logical number of notifications ever appended to the change queue.
    #[inline(always)]
    pub fn queue_head(&self) -> u64 {
        self.region
            .load_u64(self.metadata.queue_head_offset(), Ordering::Acquire)
    }

    /// Id stored at logical queue position `position`.
    ///
    /// The entry may already have been overwritten if `position` is more
    /// than one capacity behind the head.
    #[inline(always)]
    pub fn read_queue(&self, position: u64) -> i64 {
        self.region
            .load_i64(self.metadata.queue_entry_offset(position), Ordering::Acquire)
    }

    /// Highest id the writer reports having written (advisory).
    pub fn high_water_id(&self) -> i64 {
        self.region
            .load_i64(layout::HIGH_WATER_ID_OFFSET, Ordering::Acquire)
    }

    /// Wall-clock time of the writer's last heartbeat, in microseconds.
    pub fn touched_time(&self) -> i64 {
        self.region
            .load_i64(layout::TOUCHED_TIME_OFFSET, Ordering::Acquire)
    }

    /// Wall-clock creation time as currently recorded in the header.
    ///
    /// Differs from [`StoreMetadata::created_time`] once the store has been
    /// recreated in place.
    pub fn created_time(&self) -> i64 {
        self.region.read_i64(layout::CREATED_TIME_OFFSET)
    }

    /// Accessor for the record `id`, or `None` if the id is outside the store.
    #[inline(always)]
    pub fn record(&self, id: i64) -> Option<RecordAccessor<'_>> {
        let offset = self.metadata.record_offset(id)?;
        Some(RecordAccessor::new(&self.region, &self.metadata, id, offset))
    }

    /// Accessor for the record `id`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidId`] if the id is outside the store.
    pub fn try_record(&self, id: i64) -> Result<RecordAccessor<'_>, StoreError> {
        self.record(id).ok_or(StoreError::InvalidId {
            id,
            base_id: self.metadata.base_id(),
            max_id: self.metadata.max_id(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{scratch_store, scratch_store_with};
    use crate::StoreLayout;

    #[test]
    fn open_missing_store_fails() {
        let err = Store::open("/definitely/not/here.store").unwrap_err();
        assert!(err.is_fatal());
        assert!(matches!(err, StoreError::OpenFailure { .. }));
    }

    #[test]
    fn queue_head_and_entries_track_writer() {
        let mut ts = scratch_store(0, 99, 8, 8);
        assert_eq!(ts.store.queue_head(), 0);
        ts.writer.publish(5).unwrap();
        ts.writer.publish_gap();
        ts.writer.publish(7).unwrap();
        assert_eq!(ts.store.queue_head(), 3);
        assert_eq!(ts.store.read_queue(0), 5);
        assert_eq!(ts.store.read_queue(1), layout::GAP_ID);
        assert_eq!(ts.store.read_queue(2), 7);
        assert_eq!(ts.store.high_water_id(), 7);
    }

    #[test]
    fn record_lookup_respects_id_range() {
        let ts = scratch_store(10, 19, 8, 8);
        assert!(ts.store.record(9).is_none());
        assert!(ts.store.record(20).is_none());
        assert_eq!(ts.store.record(10).unwrap().id(), 10);
        let err = ts.store.try_record(42).unwrap_err();
        assert!(matches!(err, StoreError::InvalidId { id: 42, base_id: 10, max_id: 19 }));
    }

    #[test]
    fn touched_and_created_times_are_visible() {
        let mut ts = scratch_store(0, 9, 8, 8);
        let created = ts.store.metadata().created_time();
        assert!(created > 0);
        assert_eq!(ts.store.created_time(), created);
        ts.writer.touch_at(created + 5);
        assert_eq!(ts.store.touched_time(), created + 5);
    }

    #[test]
    fn open_with_checks_recorded_addressing() {
        let ts = scratch_store_with(
            StoreLayout::new(100, 199, 8)
                .with_queue_capacity(8)
                .with_addressing(IdAddressing::Direct),
        );
        let store = Store::open_with(&ts.path, IdAddressing::Direct).unwrap();
        assert_eq!(store.record(150).unwrap().id(), 150);

        let err = Store::open_with(&ts.path, IdAddressing::BaseOffset).unwrap_err();
        assert!(matches!(
            err,
            StoreError::AddressingMismatch {
                found: IdAddressing::Direct,
                expected: IdAddressing::BaseOffset
            }
        ));
    }

    #[test]
    fn close_releases_mapping() {
        let ts = scratch_store(0, 9, 8, 8);
        let reopened = Store::open(&ts.path).unwrap();
        reopened.close();
        // The original handle is unaffected.
        assert_eq!(ts.store.queue_head(), 0);
    }
}
