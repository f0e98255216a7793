//! Record accessor and the consistent-read (seqlock) engine.
//!
//! ## Protocol
//!
//! Byte 0 of every record slot holds a signed 64-bit sequence:
//!
//! - **sequence < 0**: the writer holds the record lock, a write is in
//!   progress.
//! - **sequence = 0**: the slot has never been written.
//! - **sequence > 0**: generation of the last completed write; it only
//!   grows.
//!
//! A reader samples the sequence, spins while it is negative, decodes the
//! value, then samples again. Two equal non-negative samples bracketing the
//! decode prove the value was not mutated meanwhile; otherwise the decoded
//! candidate is discarded and the read restarts.
//!
//! The retry loop has no upper bound and never sleeps. Use
//! [`RecordAccessor::read_consistent_until`] to thread a
//! [`CancellationToken`] through it. Accessors handed to listeners by a
//! running reader carry the reader's token, and the `try_read_*` methods
//! give up once it is cancelled, so a writer that died holding a record
//! lock cannot block shutdown.

use crate::cancel::CancellationToken;
use crate::decoder::RecordDecoder;
use crate::layout;
use crate::metadata::StoreMetadata;
use crate::region::Region;
use std::sync::atomic::{Ordering, fence};
use tracing::trace;

/// View of a single record slot.
///
/// The typed getters read the value region directly and may observe a
/// write in progress; call them from a [`RecordDecoder`] passed to
/// [`read_consistent`](Self::read_consistent) to get a validated result.
///
/// Getter offsets are relative to the start of the value payload.
#[derive(Debug, Clone, Copy)]
pub struct RecordAccessor<'a> {
    region: &'a Region,
    metadata: &'a StoreMetadata,
    id: i64,
    offset: usize,
    cancel: Option<&'a CancellationToken>,
}

impl<'a> RecordAccessor<'a> {
    #[inline(always)]
    pub(crate) fn new(
        region: &'a Region,
        metadata: &'a StoreMetadata,
        id: i64,
        offset: usize,
    ) -> Self {
        Self {
            region,
            metadata,
            id,
            offset,
            cancel: None,
        }
    }

    /// Attaches `cancel`; the `try_read_*` methods give up once it is
    /// cancelled.
    #[inline(always)]
    pub fn with_cancellation(self, cancel: &'a CancellationToken) -> Self {
        Self {
            cancel: Some(cancel),
            ..self
        }
    }

    /// Token attached with [`with_cancellation`](Self::with_cancellation).
    #[inline(always)]
    pub fn cancellation(&self) -> Option<&'a CancellationToken> {
        self.cancel
    }

    #[inline(always)]
    pub fn id(&self) -> i64 {
        self.id
    }

    /// Store metadata this record belongs to.
    #[inline(always)]
    pub fn metadata(&self) -> &'a StoreMetadata {
        self.metadata
    }

    /// Current value of the slot's sequence field.
    #[inline(always)]
    pub fn sequence(&self) -> i64 {
        self.region
            .load_i64(self.offset + layout::RECORD_SEQUENCE_OFFSET, Ordering::Acquire)
    }

    /// Whether a write is in progress right now.
    #[inline(always)]
    pub fn is_locked(&self) -> bool {
        self.sequence() < 0
    }

    /// Whether the slot has been written at least once.
    #[inline(always)]
    pub fn has_been_written(&self) -> bool {
        self.sequence() != 0
    }

    /// Monotonic timestamp (ns) the writer attached to the last write.
    ///
    /// Unvalidated, like the value getters.
    #[inline(always)]
    pub fn timestamp(&self) -> i64 {
        self.region
            .read_i64(self.offset + layout::RECORD_TIMESTAMP_OFFSET)
    }

    #[inline(always)]
    fn value_at(&self, offset: usize, len: usize) -> usize {
        assert!(
            offset + len <= self.metadata.value_size(),
            "record value access out of bounds: offset {offset} + {len} > {}",
            self.metadata.value_size()
        );
        self.offset + self.metadata.value_offset() + offset
    }

    #[inline(always)]
    fn bytes<const N: usize>(&self, offset: usize) -> [u8; N] {
        self.region.read_array(self.value_at(offset, N))
    }

    /// # Panics
    ///
    /// The value getters panic if `offset + size_of::<T>()` exceeds the
    /// store's value size.
    #[inline(always)]
    pub fn get_u8(&self, offset: usize) -> u8 {
        self.bytes::<1>(offset)[0]
    }

    #[inline(always)]
    pub fn get_i8(&self, offset: usize) -> i8 {
        i8::from_le_bytes(self.bytes(offset))
    }

    #[inline(always)]
    pub fn get_u16(&self, offset: usize) -> u16 {
        u16::from_le_bytes(self.bytes(offset))
    }

    #[inline(always)]
    pub fn get_i16(&self, offset: usize) -> i16 {
        i16::from_le_bytes(self.bytes(offset))
    }

    #[inline(always)]
    pub fn get_u32(&self, offset: usize) -> u32 {
        u32::from_le_bytes(self.bytes(offset))
    }

    #[inline(always)]
    pub fn get_i32(&self, offset: usize) -> i32 {
        i32::from_le_bytes(self.bytes(offset))
    }

    #[inline(always)]
    pub fn get_u64(&self, offset: usize) -> u64 {
        u64::from_le_bytes(self.bytes(offset))
    }

    #[inline(always)]
    pub fn get_i64(&self, offset: usize) -> i64 {
        i64::from_le_bytes(self.bytes(offset))
    }

    #[inline(always)]
    pub fn get_f32(&self, offset: usize) -> f32 {
        f32::from_le_bytes(self.bytes(offset))
    }

    #[inline(always)]
    pub fn get_f64(&self, offset: usize) -> f64 {
        f64::from_le_bytes(self.bytes(offset))
    }

    /// Copies `dst.len()` bytes of the value starting at `offset`.
    pub fn get_bytes(&self, offset: usize, dst: &mut [u8]) {
        let at = self.value_at(offset, dst.len());
        self.region.read_into(at, dst);
    }

    /// Spins until the sequence is non-negative and returns it.
    #[inline(always)]
    fn stable_sequence(&self) -> i64 {
        loop {
            let seq = self.sequence();
            if seq >= 0 {
                return seq;
            }
            core::hint::spin_loop();
        }
    }

    /// Re-reads the sequence after a decode.
    ///
    /// The fence keeps the value loads of the decode from being reordered
    /// past this load.
    #[inline(always)]
    fn recheck_sequence(&self) -> i64 {
        fence(Ordering::Acquire);
        self.region
            .load_i64(self.offset + layout::RECORD_SEQUENCE_OFFSET, Ordering::Relaxed)
    }

    /// Decodes the record so that the result reflects a single completed
    /// write.
    ///
    /// `decoder` may run several times; it must not have side effects. This
    /// spins without bound while the writer keeps mutating the record.
    #[inline]
    pub fn read_consistent<D: RecordDecoder + ?Sized>(&self, decoder: &D) -> D::Output {
        let mut retries: u32 = 0;
        loop {
            let s1 = self.stable_sequence();
            let candidate = decoder.decode(self);
            let s2 = self.recheck_sequence();
            if s1 == s2 {
                if retries > 0 {
                    trace!(id = self.id, retries, "consistent read retried");
                }
                return candidate;
            }
            retries = retries.wrapping_add(1);
            core::hint::spin_loop();
        }
    }

    /// Closure form of [`read_consistent`](Self::read_consistent).
    #[inline]
    pub fn read_with<T>(&self, f: impl Fn(&RecordAccessor<'_>) -> T) -> T {
        self.read_consistent(&f)
    }

    /// Like [`read_consistent`](Self::read_consistent), but gives up and
    /// returns `None` once `cancel` is cancelled.
    pub fn read_consistent_until<D: RecordDecoder + ?Sized>(
        &self,
        decoder: &D,
        cancel: &CancellationToken,
    ) -> Option<D::Output> {
        loop {
            if cancel.is_cancelled() {
                return None;
            }
            let s1 = self.sequence();
            if s1 < 0 {
                core::hint::spin_loop();
                continue;
            }
            let candidate = decoder.decode(self);
            if self.recheck_sequence() == s1 {
                return Some(candidate);
            }
            core::hint::spin_loop();
        }
    }

    /// [`read_consistent`](Self::read_consistent) bounded by the attached
    /// token, if any.
    ///
    /// Returns `None` only when the token is cancelled before a consistent
    /// value was read. Listeners should prefer this over `read_consistent`.
    #[inline]
    pub fn try_read_consistent<D: RecordDecoder + ?Sized>(
        &self,
        decoder: &D,
    ) -> Option<D::Output> {
        match self.cancel {
            Some(cancel) => self.read_consistent_until(decoder, cancel),
            None => Some(self.read_consistent(decoder)),
        }
    }

    /// Closure form of [`try_read_consistent`](Self::try_read_consistent).
    #[inline]
    pub fn try_read_with<T>(&self, f: impl Fn(&RecordAccessor<'_>) -> T) -> Option<T> {
        self.try_read_consistent(&f)
    }

    /// [`read_bytes_consistent`](Self::read_bytes_consistent) bounded by the
    /// attached token, if any.
    pub fn try_read_bytes_consistent(&self) -> Option<Vec<u8>> {
        let Some(cancel) = self.cancel else {
            return Some(self.read_bytes_consistent());
        };
        let mut buf = vec![0u8; self.metadata.value_size()];
        let at = self.value_at(0, buf.len());
        loop {
            if cancel.is_cancelled() {
                return None;
            }
            let s1 = self.sequence();
            if s1 < 0 {
                core::hint::spin_loop();
                continue;
            }
            self.region.read_into(at, &mut buf);
            if self.recheck_sequence() == s1 {
                return Some(buf);
            }
            core::hint::spin_loop();
        }
    }

    /// Consistent snapshot of the whole value payload.
    pub fn read_bytes_consistent(&self) -> Vec<u8> {
        let mut buf = vec![0u8; self.metadata.value_size()];
        self.read_bytes_consistent_into(&mut buf);
        buf
    }

    /// Consistent snapshot of the first `dst.len()` bytes of the value
    /// payload, returning the sequence it was taken at.
    ///
    /// # Panics
    ///
    /// Panics if `dst` is longer than the store's value size.
    pub fn read_bytes_consistent_into(&self, dst: &mut [u8]) -> i64 {
        let at = self.value_at(0, dst.len());
        loop {
            let s1 = self.stable_sequence();
            self.region.read_into(at, dst);
            if self.recheck_sequence() == s1 {
                return s1;
            }
            core::hint::spin_loop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::scratch_store;
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    fn encode(a: i64, b: f64) -> [u8; 16] {
        let mut v = [0u8; 16];
        v[..8].copy_from_slice(&a.to_le_bytes());
        v[8..].copy_from_slice(&b.to_le_bytes());
        v
    }

    #[test]
    fn fresh_record_is_unwritten() {
        let ts = scratch_store(0, 9, 16, 8);
        let rec = ts.store.record(3).unwrap();
        assert_eq!(rec.sequence(), 0);
        assert!(!rec.has_been_written());
        assert!(!rec.is_locked());
        assert_eq!(rec.read_bytes_consistent(), vec![0u8; 16]);
    }

    #[test]
    fn typed_getters_read_value_payload() {
        let mut ts = scratch_store(0, 9, 16, 8);
        ts.writer.write_record(2, &encode(-42, 1.5)).unwrap();
        let rec = ts.store.record(2).unwrap();
        assert_eq!(rec.sequence(), 1);
        assert!(rec.has_been_written());
        assert_eq!(rec.get_i64(0), -42);
        assert_eq!(rec.get_f64(8), 1.5);
        assert_eq!(rec.get_u8(0), 0xd6);
        assert_eq!(rec.get_i32(0), -42);
        assert!(rec.timestamp() > 0);

        let mut tail = [0u8; 8];
        rec.get_bytes(8, &mut tail);
        assert_eq!(f64::from_le_bytes(tail), 1.5);
    }

    #[test]
    #[should_panic(expected = "record value access out of bounds")]
    fn getter_past_value_size_panics() {
        let ts = scratch_store(0, 9, 16, 8);
        let _ = ts.store.record(0).unwrap().get_i64(12);
    }

    #[test]
    fn sequence_advances_per_write() {
        let mut ts = scratch_store(0, 9, 16, 8);
        for n in 1..=5 {
            ts.writer.write_record(1, &encode(n, 0.0)).unwrap();
        }
        let rec = ts.store.record(1).unwrap();
        assert_eq!(rec.sequence(), 5);
        assert_eq!(rec.read_with(|r| r.get_i64(0)), 5);
    }

    #[test]
    fn consistent_read_waits_for_writer_lock() {
        let mut ts = scratch_store(0, 9, 16, 8);
        ts.writer.write_record(4, &encode(1, 1.0)).unwrap();

        let store = Arc::new(crate::Store::open(&ts.path).unwrap());
        let started = Arc::new(AtomicBool::new(false));

        let mut guard = ts.writer.lock_record(4).unwrap();
        guard.write_value(&encode(2, 2.0));
        assert!(store.record(4).unwrap().is_locked());

        let reader = {
            let store = Arc::clone(&store);
            let started = Arc::clone(&started);
            std::thread::spawn(move || {
                started.store(true, Ordering::Release);
                let rec = store.record(4).unwrap();
                rec.read_with(|r| (r.get_i64(0), r.get_f64(8)))
            })
        };
        while !started.load(Ordering::Acquire) {
            std::thread::yield_now();
        }
        std::thread::sleep(Duration::from_millis(20));
        drop(guard);

        assert_eq!(reader.join().unwrap(), (2, 2.0));
        assert_eq!(store.record(4).unwrap().sequence(), 2);
    }

    #[test]
    fn read_until_returns_none_when_cancelled_while_locked() {
        let mut ts = scratch_store(0, 9, 16, 8);
        let store = crate::Store::open(&ts.path).unwrap();
        let _guard = ts.writer.lock_record(0).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let rec = store.record(0).unwrap();
        assert!(rec.read_consistent_until(&|r: &RecordAccessor<'_>| r.get_i64(0), &cancel).is_none());
    }

    #[test]
    fn read_until_succeeds_without_contention() {
        let mut ts = scratch_store(0, 9, 16, 8);
        ts.writer.write_record(0, &encode(9, 0.25)).unwrap();
        let cancel = CancellationToken::new();
        let rec = ts.store.record(0).unwrap();
        let got = rec.read_consistent_until(&|r: &RecordAccessor<'_>| r.get_f64(8), &cancel);
        assert_eq!(got, Some(0.25));
    }

    #[test]
    fn try_reads_honor_attached_token() {
        let mut ts = scratch_store(0, 9, 16, 8);
        ts.writer.write_record(5, &encode(6, 0.5)).unwrap();
        let store = crate::Store::open(&ts.path).unwrap();
        let cancel = CancellationToken::new();

        let rec = store.record(5).unwrap();
        assert!(rec.cancellation().is_none());
        assert_eq!(rec.try_read_with(|r| r.get_i64(0)), Some(6));

        let rec = rec.with_cancellation(&cancel);
        assert_eq!(rec.try_read_with(|r| r.get_f64(8)), Some(0.5));
        assert_eq!(rec.try_read_bytes_consistent(), Some(encode(6, 0.5).to_vec()));

        std::mem::forget(ts.writer.lock_record(5).unwrap());
        let started = std::time::Instant::now();
        std::thread::scope(|s| {
            s.spawn(|| {
                std::thread::sleep(Duration::from_millis(20));
                cancel.cancel();
            });
            assert_eq!(rec.try_read_with(|r| r.get_i64(0)), None);
        });
        assert_eq!(rec.try_read_bytes_consistent(), None);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn raw_snapshot_returns_sequence() {
        let mut ts = scratch_store(0, 9, 16, 8);
        ts.writer.write_record(7, &encode(3, 3.0)).unwrap();
        ts.writer.write_record(7, &encode(4, 4.0)).unwrap();
        let rec = ts.store.record(7).unwrap();
        let mut head = [0u8; 8];
        assert_eq!(rec.read_bytes_consistent_into(&mut head), 2);
        assert_eq!(i64::from_le_bytes(head), 4);
        assert_eq!(rec.read_bytes_consistent(), encode(4, 4.0).to_vec());
    }
}
