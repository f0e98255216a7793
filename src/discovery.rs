//! New-record discovery loop.
//!
//! The writer allocates ids in increasing order and the first write to a
//! slot makes its sequence nonzero. The loop keeps a watermark, the highest
//! id it has reported, starting one below `base_id`, and probes the slot
//! right above it:
//!
//! - nonzero sequence: the id is new. Advance the watermark, notify the
//!   listeners and probe the next id at once;
//! - zero: nothing new, sleep for the idle interval.
//!
//! A record may be discovered before or after its first change-queue
//! notification is drained; the two loops are not ordered.

use crate::cancel::CancellationToken;
use crate::listener::NewRecordListener;
use crate::record::RecordAccessor;
use crate::store::Store;
use std::time::Duration;
use tracing::{debug, info};

pub struct NewRecordDiscovery<'s> {
    store: &'s Store,
    highest_record_id_seen: i64,
    idle: Duration,
    listeners: Vec<Box<dyn NewRecordListener>>,
    discovered: u64,
    cancel: Option<CancellationToken>,
}

impl<'s> NewRecordDiscovery<'s> {
    pub fn new(store: &'s Store, idle: Duration) -> Self {
        Self {
            store,
            highest_record_id_seen: store.metadata().base_id() - 1,
            idle,
            listeners: Vec::new(),
            discovered: 0,
            cancel: None,
        }
    }

    pub fn add_listener(&mut self, listener: impl NewRecordListener + 'static) -> &mut Self {
        self.listeners.push(Box::new(listener));
        self
    }

    /// Registers a closure as a new-record listener.
    pub fn on_new_record<F>(&mut self, f: F) -> &mut Self
    where
        F: FnMut(&RecordAccessor<'_>) + Send + 'static,
    {
        self.add_listener(f)
    }

    pub(crate) fn set_listeners(&mut self, listeners: Vec<Box<dyn NewRecordListener>>) {
        self.listeners = listeners;
    }

    /// Attaches `cancel` to every record handed to the listeners.
    ///
    /// [`run`](Self::run) attaches its own token.
    pub fn set_cancellation(&mut self, cancel: CancellationToken) {
        self.cancel = Some(cancel);
    }

    /// Highest id reported so far; `base_id - 1` before the first.
    pub fn highest_record_id_seen(&self) -> i64 {
        self.highest_record_id_seen
    }

    /// Total ids reported so far.
    pub fn discovered(&self) -> u64 {
        self.discovered
    }

    /// Reports every new id above the watermark, in increasing order.
    ///
    /// Returns how many were found.
    pub fn poll(&mut self) -> usize {
        let max_id = self.store.metadata().max_id();
        let mut found = 0;
        while self.highest_record_id_seen < max_id {
            let next = self.highest_record_id_seen + 1;
            let Some(record) = self.store.record(next) else {
                break;
            };
            if !record.has_been_written() {
                break;
            }
            let record = match &self.cancel {
                Some(token) => record.with_cancellation(token),
                None => record,
            };
            self.highest_record_id_seen = next;
            for listener in self.listeners.iter_mut() {
                listener.on_new_record(&record);
            }
            found += 1;
        }
        if found > 0 {
            self.discovered += found as u64;
            debug!(found, highest = self.highest_record_id_seen, "discovered new records");
        }
        found
    }

    /// Polls until `cancel` is cancelled, sleeping on it while idle.
    pub fn run(&mut self, cancel: &CancellationToken) {
        self.cancel = Some(cancel.clone());
        info!(
            location = self.store.location(),
            from = self.highest_record_id_seen + 1,
            idle_ms = self.idle.as_millis() as u64,
            "new-record discovery started"
        );
        while !cancel.is_cancelled() {
            if self.poll() == 0 && cancel.wait_timeout(self.idle) {
                break;
            }
        }
        info!(
            discovered = self.discovered,
            highest = self.highest_record_id_seen,
            "new-record discovery stopped"
        );
    }
}

impl std::fmt::Debug for NewRecordDiscovery<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NewRecordDiscovery")
            .field("highest_record_id_seen", &self.highest_record_id_seen)
            .field("idle", &self.idle)
            .field("listeners", &self.listeners.len())
            .field("discovered", &self.discovered)
            .finish()
    }
}
