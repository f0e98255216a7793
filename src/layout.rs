//! Persisted layout of a store.
//!
//! A store is a single mapped region:
//!
//! ```text
//! +----------------------+  0
//! | header fields        |
//! +----------------------+  QUEUE_HEAD_OFFSET (own cache line)
//! | queue head (u64)     |
//! +----------------------+  QUEUE_START_OFFSET
//! | queue entries        |  i64 x capacity
//! +----------------------+  hdr_size
//! | record array         |  rec_size x slot count
//! +----------------------+  mmap_size (page aligned)
//! ```
//!
//! The slot count depends on the id addressing mode recorded in the
//! header: `max_id - base_id + 1` when ids are offset by `base_id`,
//! `max_id + 1` when they index the array directly (slots below `base_id`
//! are never used).
//!
//! Every multi-byte field is little-endian. Each record slot starts with
//! an `i64` sequence field, followed by an `i64` timestamp and the value
//! payload.

use crate::error::StoreError;
use crate::metadata::IdAddressing;

/// Byte order of every multi-byte field in the store.
pub const BYTE_ORDER: ByteOrder = ByteOrder::LittleEndian;

/// Byte orders a layout can declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    LittleEndian,
    BigEndian,
}

/// Header sentinel ("HCST").
pub const MAGIC: u32 = 0x4843_5354;

pub const VERSION_MAJOR: u16 = 1;
pub const VERSION_MINOR: u16 = 1;
pub const VERSION: u16 = (VERSION_MAJOR << 8) | VERSION_MINOR;

pub const MAGIC_OFFSET: usize = 0;
pub const OWNER_PID_OFFSET: usize = 4;
pub const MMAP_SIZE_OFFSET: usize = 8;
pub const HDR_SIZE_OFFSET: usize = 16;
pub const REC_SIZE_OFFSET: usize = 24;
pub const VAL_SIZE_OFFSET: usize = 32;
pub const VAL_OFFSET_OFFSET: usize = 40;
pub const BASE_ID_OFFSET: usize = 48;
pub const MAX_ID_OFFSET: usize = 56;
pub const HIGH_WATER_ID_OFFSET: usize = 64;
pub const Q_MASK_OFFSET: usize = 72;
pub const Q_HEAD_INDEX_OFFSET: usize = 80;
pub const Q_START_INDEX_OFFSET: usize = 88;
pub const VERSION_OFFSET: usize = 96;
pub const CREATED_TIME_OFFSET: usize = 104;
pub const TOUCHED_TIME_OFFSET: usize = 112;
pub const DESCRIPTION_OFFSET: usize = 120;
pub const DESCRIPTION_LEN: usize = 64;
/// `u32` id addressing mode; zero in stores written before version 1.1.
pub const ADDRESSING_OFFSET: usize = 184;

/// Byte offset of the queue head counter.
pub const QUEUE_HEAD_OFFSET: usize = 192;
/// Byte offset of the first queue entry.
pub const QUEUE_START_OFFSET: usize = 256;
/// Width of one queue entry (a signed record id).
pub const QUEUE_ENTRY_SIZE: usize = 8;
/// Id written into a queue entry that carries no record.
pub const GAP_ID: i64 = -1;

/// Smallest region that can hold a header.
pub const HEADER_LEN: usize = QUEUE_START_OFFSET;

pub const RECORD_SEQUENCE_OFFSET: usize = 0;
pub const RECORD_TIMESTAMP_OFFSET: usize = 8;
pub const RECORD_VALUE_OFFSET: usize = 16;

const ALIGNMENT: usize = 8;
const CACHE_LINE: usize = 64;

#[inline(always)]
pub(crate) const fn align_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}

/// Sizes and offsets derived from the creation parameters of a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub base_id: i64,
    pub max_id: i64,
    pub value_size: usize,
    pub value_offset: usize,
    pub record_size: usize,
    pub record_count: usize,
    pub queue_capacity: usize,
    pub hdr_size: usize,
    pub mmap_size: usize,
    pub addressing: IdAddressing,
}

/// Number of record slots needed to address `base_id..=max_id`.
///
/// `None` if the range is empty, negative or does not fit in memory.
pub(crate) fn slot_count(base_id: i64, max_id: i64, addressing: IdAddressing) -> Option<usize> {
    if base_id < 0 || max_id < base_id {
        return None;
    }
    let last_index = match addressing {
        IdAddressing::BaseOffset => max_id - base_id,
        IdAddressing::Direct => max_id,
    };
    usize::try_from(last_index).ok()?.checked_add(1)
}

impl Geometry {
    /// Computes the layout for a new store.
    ///
    /// `queue_capacity` must be a power of two and at least `2`; `max_id`
    /// is inclusive.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidLayout`] when any parameter is unusable.
    pub fn compute(
        base_id: i64,
        max_id: i64,
        value_size: usize,
        queue_capacity: usize,
        addressing: IdAddressing,
        page_size: usize,
    ) -> Result<Self, StoreError> {
        if base_id < 0 {
            return Err(StoreError::InvalidLayout(format!(
                "base_id {base_id} is negative"
            )));
        }
        if max_id < base_id {
            return Err(StoreError::InvalidLayout(format!(
                "max_id {max_id} is below base_id {base_id}"
            )));
        }
        if value_size == 0 {
            return Err(StoreError::InvalidLayout("value_size is zero".into()));
        }
        if queue_capacity < 2 || !queue_capacity.is_power_of_two() {
            return Err(StoreError::InvalidLayout(format!(
                "queue capacity {queue_capacity} is not a power of two >= 2"
            )));
        }
        let record_count = slot_count(base_id, max_id, addressing)
            .ok_or_else(|| StoreError::InvalidLayout("id range too large".into()))?;
        let record_size = align_up(RECORD_VALUE_OFFSET + value_size, ALIGNMENT);
        let hdr_size = align_up(
            QUEUE_START_OFFSET + queue_capacity * QUEUE_ENTRY_SIZE,
            CACHE_LINE,
        );
        let records_len = record_size
            .checked_mul(record_count)
            .ok_or_else(|| StoreError::InvalidLayout("record array too large".into()))?;
        let mmap_size = align_up(hdr_size + records_len, page_size.max(ALIGNMENT));
        Ok(Self {
            base_id,
            max_id,
            value_size,
            value_offset: RECORD_VALUE_OFFSET,
            record_size,
            record_count,
            queue_capacity,
            hdr_size,
            mmap_size,
            addressing,
        })
    }
}

/// Returns the system page size.
pub(crate) fn page_size() -> usize {
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if sz <= 0 { 4096 } else { sz as usize }
}
