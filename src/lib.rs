//! # HFT Cache
//!
//! Reader side of a single-writer, multi-reader record cache living in
//! shared memory (a file mapping or a POSIX shared-memory object).
//!
//! One writer process owns a store: a fixed header, a circular **change
//! queue** of record ids, and an array of fixed-size **record slots**.
//! Any number of readers map the same store read-only and:
//!
//! - read records **consistently** while the writer may be updating them,
//!   using the sequence (seqlock) field at the start of every slot;
//! - drain the change queue to learn which records changed, counting
//!   notifications lost to overflow (**drops**) and empty entries
//!   (**gaps**);
//! - watch the record array for **newly written** ids.
//!
//! ## Spin-Wait Behavior
//!
//! The consistent read never sleeps: while the writer holds a record's
//! lock, the reader spins. Reads are therefore bounded by memory latency
//! rather than by the scheduler, at the price of burning a core under
//! sustained contention. The change-queue consumer backs off for a few
//! microseconds when idle; the discovery loop sleeps for hundreds of
//! milliseconds.
//!
//! Records handed to listeners carry the reader's [`CancellationToken`];
//! the `try_read_*` methods of [`RecordAccessor`] stop spinning once it is
//! cancelled.
//!
//! Readers never write to the mapped memory and take no locks.
//!
//! ## Modules
//!
//! - [`Store`] and [`StoreMetadata`]: open and validate a store.
//! - [`RecordAccessor`]: consistent reads of one record, decoded by a
//!   [`RecordDecoder`].
//! - [`ChangeQueueConsumer`] and [`NewRecordDiscovery`]: the two polling
//!   loops; [`CacheReader`] runs both.
//! - [`StoreWriter`]: the writer side, for tools and tests.
//! - [`layout`]: the persisted format.
//!
//! ## License
//!
//! Copyright © 2005–2025
//! IKH Software, Inc.
//!
//! Licensed under the terms of the **GNU Lesser General Public License**,
//! version 3.0, or (at your option) any later version.
//!
//! See <https://www.gnu.org/licenses/lgpl-3.0.html> for details.

#[cfg(not(unix))]
compile_error!("This crate only supports Unix-like operating systems.");

mod cancel;
mod config;
mod consumer;
mod decoder;
mod discovery;
mod error;
pub mod layout;
mod listener;
mod metadata;
mod mmap;
mod reader;
mod record;
mod region;
mod store;
mod utils;
mod writer;

pub use cancel::CancellationToken;
pub use config::{ReaderConfig, StartPosition};
pub use consumer::{ChangeQueueConsumer, ConsumerMetrics, DrainReport, MetricsHandle, PollOutcome};
pub use decoder::{Quote, QuoteDecoder, RecordDecoder};
pub use discovery::NewRecordDiscovery;
pub use error::{ConfigError, ReaderError, StoreError};
pub use listener::{DecodingListener, NewRecordListener, StatusListener, StatusSignal, UpdateListener};
pub use metadata::{IdAddressing, StoreMetadata};
pub use reader::{CacheReader, ReaderSummary};
pub use record::RecordAccessor;
pub use region::Region;
pub use store::Store;
pub use utils::{Trials, mono_time_ns, wall_time_us};
pub use writer::{RecordWriteGuard, StoreLayout, StoreWriter};

#[cfg(test)]
pub(crate) mod test_support {
    use crate::{Store, StoreLayout, StoreWriter};

    /// A writer and a reader handle over one store in a temporary directory.
    pub(crate) struct TestStore {
        // Held for its Drop.
        #[allow(dead_code)]
        pub dir: tempfile::TempDir,
        pub path: String,
        pub writer: StoreWriter,
        pub store: Store,
    }

    pub(crate) fn scratch_store(
        base_id: i64,
        max_id: i64,
        value_size: usize,
        queue_capacity: usize,
    ) -> TestStore {
        scratch_store_with(
            StoreLayout::new(base_id, max_id, value_size).with_queue_capacity(queue_capacity),
        )
    }

    pub(crate) fn scratch_store_with(layout: StoreLayout) -> TestStore {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store").to_str().unwrap().to_owned();
        let layout = layout.with_description("test store");
        let writer = StoreWriter::create(&path, &layout).unwrap();
        let store = Store::open(&path).unwrap();
        TestStore {
            dir,
            path,
            writer,
            store,
        }
    }
}
