//! Change-queue consumer: the main polling loop of a reader.
//!
//! The consumer owns a private cursor, `last_head`, the logical queue
//! position up to which it has drained. Each poll compares it with the
//! writer's head:
//!
//! - equal: idle, back off and poll again;
//! - more than one capacity behind: the oldest entries were overwritten.
//!   The difference beyond capacity is counted as dropped and the cursor
//!   jumps to `head - capacity`, the oldest entry still in the queue;
//! - otherwise every position up to the head is drained in order. Ids
//!   outside the store (the writer's gap marker among them) are counted as
//!   gaps and skipped; every other id is handed to the update listeners.
//!
//! The ids of a drain are copied out of the queue before any listener
//! runs, then the head is read again. Entries the writer overwrote in the
//! meantime are counted as dropped instead of being dispatched with the
//! wrong id.
//!
//! Drops and gaps are never errors. They are aggregated into a
//! [`StatusSignal`] every `status_interval` drain cycles and into the
//! running totals exposed by [`MetricsHandle`].

use crate::cancel::CancellationToken;
use crate::config::{ReaderConfig, StartPosition};
use crate::listener::{StatusListener, StatusSignal, UpdateListener};
use crate::record::RecordAccessor;
use crate::store::Store;
use crate::utils::wall_time_us;
use crossbeam_utils::CachePadded;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Result of a single [`ChangeQueueConsumer::poll`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// The head has not moved.
    Idle,
    Drained(DrainReport),
}

/// What one drain cycle did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DrainReport {
    /// First logical position drained.
    pub from: u64,
    /// Head observed by the poll, or where a cancelled drain stopped;
    /// positions `from..to` were drained.
    pub to: u64,
    /// Entries handed to the update listeners.
    pub dispatched: u64,
    /// Entries overwritten before they could be drained.
    pub dropped: u64,
    /// Entries skipped because their id is outside the store.
    pub gaps: u64,
}

/// Running totals of a consumer.
#[derive(Debug, Default)]
struct ConsumerStats {
    polls: CachePadded<AtomicU64>,
    drain_cycles: CachePadded<AtomicU64>,
    dispatched: CachePadded<AtomicU64>,
    dropped: CachePadded<AtomicU64>,
    gaps: CachePadded<AtomicU64>,
    last_head: CachePadded<AtomicU64>,
}

/// Point-in-time copy of a consumer's totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerMetrics {
    pub polls: u64,
    pub drain_cycles: u64,
    pub dispatched: u64,
    pub dropped: u64,
    pub gaps: u64,
    pub last_head: u64,
}

/// Read side of a consumer's totals, usable from any thread.
#[derive(Debug, Clone, Default)]
pub struct MetricsHandle {
    stats: Arc<ConsumerStats>,
}

impl MetricsHandle {
    pub fn snapshot(&self) -> ConsumerMetrics {
        let s = &self.stats;
        ConsumerMetrics {
            polls: s.polls.load(Ordering::Relaxed),
            drain_cycles: s.drain_cycles.load(Ordering::Relaxed),
            dispatched: s.dispatched.load(Ordering::Relaxed),
            dropped: s.dropped.load(Ordering::Relaxed),
            gaps: s.gaps.load(Ordering::Relaxed),
            last_head: s.last_head.load(Ordering::Relaxed),
        }
    }
}

pub struct ChangeQueueConsumer<'s> {
    store: &'s Store,
    last_head: u64,
    window_dropped: u64,
    window_gaps: u64,
    window_cycles: u64,
    status_interval: u64,
    poll_backoff: Duration,
    orphan_timeout: Option<Duration>,
    update_listeners: Vec<Box<dyn UpdateListener>>,
    status_listeners: Vec<Box<dyn StatusListener>>,
    stats: Arc<ConsumerStats>,
    cancel: Option<CancellationToken>,
    pending: Vec<i64>,
}

impl<'s> ChangeQueueConsumer<'s> {
    /// Creates a consumer positioned per `config.start_position`.
    pub fn new(store: &'s Store, config: &ReaderConfig) -> Self {
        let last_head = match config.start_position {
            StartPosition::Beginning => 0,
            StartPosition::Latest => store.queue_head(),
        };
        let stats = Arc::new(ConsumerStats::default());
        stats.last_head.store(last_head, Ordering::Relaxed);
        Self {
            store,
            last_head,
            window_dropped: 0,
            window_gaps: 0,
            window_cycles: 0,
            status_interval: config.status_interval.max(1),
            poll_backoff: config.poll_backoff(),
            orphan_timeout: config.orphan_timeout(),
            update_listeners: Vec::new(),
            status_listeners: Vec::new(),
            stats,
            cancel: None,
            pending: Vec::with_capacity(store.metadata().queue_capacity()),
        }
    }

    pub fn add_update_listener(&mut self, listener: impl UpdateListener + 'static) -> &mut Self {
        self.update_listeners.push(Box::new(listener));
        self
    }

    /// Registers a closure as an update listener.
    pub fn on_update<F>(&mut self, f: F) -> &mut Self
    where
        F: FnMut(&RecordAccessor<'_>) + Send + 'static,
    {
        self.add_update_listener(f)
    }

    pub fn add_status_listener(&mut self, listener: impl StatusListener + 'static) -> &mut Self {
        self.status_listeners.push(Box::new(listener));
        self
    }

    pub(crate) fn set_listeners(
        &mut self,
        update: Vec<Box<dyn UpdateListener>>,
        status: Vec<Box<dyn StatusListener>>,
    ) {
        self.update_listeners = update;
        self.status_listeners = status;
    }

    /// Reports into `handle` instead of this consumer's own totals.
    pub(crate) fn attach_metrics(&mut self, handle: &MetricsHandle) {
        handle.stats.last_head.store(self.last_head, Ordering::Relaxed);
        self.stats = Arc::clone(&handle.stats);
    }

    /// Attaches `cancel` to every record handed to the update listeners and
    /// stops a drain in progress once it is cancelled.
    ///
    /// [`run`](Self::run) attaches its own token.
    pub fn set_cancellation(&mut self, cancel: CancellationToken) {
        self.cancel = Some(cancel);
    }

    /// Logical queue position the next poll drains from.
    pub fn last_head(&self) -> u64 {
        self.last_head
    }

    pub fn metrics(&self) -> MetricsHandle {
        MetricsHandle {
            stats: Arc::clone(&self.stats),
        }
    }

    /// Polls the queue head once and drains whatever is new.
    pub fn poll(&mut self) -> PollOutcome {
        let head = self.store.queue_head();
        self.stats.polls.fetch_add(1, Ordering::Relaxed);
        if head == self.last_head {
            return PollOutcome::Idle;
        }
        if head < self.last_head {
            // Only a store recreated in place moves the head backwards.
            warn!(
                head,
                last_head = self.last_head,
                "change-queue head moved backwards, resynchronizing"
            );
            self.set_last_head(head);
            return PollOutcome::Idle;
        }

        let capacity = self.store.metadata().queue_capacity() as u64;
        let mut report = DrainReport {
            from: self.last_head,
            to: head,
            ..DrainReport::default()
        };
        let behind = head - self.last_head;
        if behind > capacity {
            report.dropped = behind - capacity;
            report.from = head - capacity;
            debug!(
                dropped = report.dropped,
                resume = report.from,
                "change queue overflowed"
            );
        }

        let first = report.from;
        self.pending.clear();
        self.pending
            .extend((first..head).map(|position| self.store.read_queue(position)));
        let oldest = self.store.queue_head().saturating_sub(capacity);
        if oldest > first {
            let lapped = oldest.min(head) - first;
            report.dropped += lapped;
            report.from = first + lapped;
            debug!(lapped, "writer lapped the consumer while reading the queue");
        }

        let cancel = self.cancel.as_ref();
        let ids = &self.pending[(report.from - first) as usize..];
        for (position, &id) in (report.from..head).zip(ids) {
            if cancel.is_some_and(CancellationToken::is_cancelled) {
                report.to = position;
                break;
            }
            match self.store.record(id) {
                Some(record) => {
                    let record = match cancel {
                        Some(token) => record.with_cancellation(token),
                        None => record,
                    };
                    trace!(position, id, "dispatching update");
                    for listener in self.update_listeners.iter_mut() {
                        listener.on_update(&record);
                    }
                    report.dispatched += 1;
                }
                None => {
                    trace!(position, id, "gap in change queue");
                    report.gaps += 1;
                }
            }
        }

        self.set_last_head(report.to);
        self.account(&report);
        PollOutcome::Drained(report)
    }

    fn set_last_head(&mut self, head: u64) {
        self.last_head = head;
        self.stats.last_head.store(head, Ordering::Relaxed);
    }

    fn account(&mut self, report: &DrainReport) {
        let stats = &self.stats;
        stats.drain_cycles.fetch_add(1, Ordering::Relaxed);
        stats.dispatched.fetch_add(report.dispatched, Ordering::Relaxed);
        stats.dropped.fetch_add(report.dropped, Ordering::Relaxed);
        stats.gaps.fetch_add(report.gaps, Ordering::Relaxed);

        self.window_dropped += report.dropped;
        self.window_gaps += report.gaps;
        self.window_cycles += 1;
        if self.window_cycles >= self.status_interval {
            self.emit_status();
        }
    }

    fn emit_status(&mut self) {
        let signal = if self.window_dropped > 0 {
            StatusSignal::Dropped(self.window_dropped)
        } else if self.window_gaps > 0 {
            StatusSignal::Gaps(self.window_gaps)
        } else {
            StatusSignal::Clean
        };
        match signal {
            StatusSignal::Dropped(n) => warn!(dropped = n, "change-queue notifications dropped"),
            StatusSignal::Gaps(n) => debug!(gaps = n, "change-queue gaps detected"),
            StatusSignal::Clean => trace!("change queue clean"),
        }
        for listener in self.status_listeners.iter_mut() {
            listener.on_status(signal);
        }
        self.window_dropped = 0;
        self.window_gaps = 0;
        self.window_cycles = 0;
        self.check_orphaned();
    }

    fn check_orphaned(&self) {
        let Some(timeout) = self.orphan_timeout else {
            return;
        };
        let age_us = wall_time_us().saturating_sub(self.store.touched_time());
        if age_us > timeout.as_micros() as i64 {
            warn!(
                location = self.store.location(),
                owner_pid = self.store.metadata().owner_pid(),
                heartbeat_age_ms = age_us / 1000,
                "store writer heartbeat is stale, store may be orphaned"
            );
        }
    }

    #[inline]
    fn back_off(&self) {
        if self.poll_backoff.is_zero() {
            std::thread::yield_now();
        } else {
            std::thread::sleep(self.poll_backoff);
        }
    }

    /// Polls until `cancel` is cancelled.
    pub fn run(&mut self, cancel: &CancellationToken) {
        self.cancel = Some(cancel.clone());
        info!(
            location = self.store.location(),
            start = self.last_head,
            listeners = self.update_listeners.len(),
            "change-queue consumer started"
        );
        while !cancel.is_cancelled() {
            if let PollOutcome::Idle = self.poll() {
                self.back_off();
            }
        }
        let m = self.metrics().snapshot();
        info!(
            drain_cycles = m.drain_cycles,
            dispatched = m.dispatched,
            dropped = m.dropped,
            gaps = m.gaps,
            "change-queue consumer stopped"
        );
    }
}

impl std::fmt::Debug for ChangeQueueConsumer<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeQueueConsumer")
            .field("location", &self.store.location())
            .field("last_head", &self.last_head)
            .field("update_listeners", &self.update_listeners.len())
            .field("status_listeners", &self.status_listeners.len())
            .finish_non_exhaustive()
    }
}
