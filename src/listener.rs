//! Callbacks invoked by the reader loops.
//!
//! Listeners are registered on a [`CacheReader`](crate::CacheReader) before
//! it runs. Each listener kind is owned by exactly one loop thread:
//!
//! - update and status listeners by the change-queue consumer,
//! - new-record listeners by the discovery loop.
//!
//! A listener is therefore only required to be `Send`, and it may keep
//! mutable state. Callbacks run on the polling thread; a slow callback
//! delays the loop and can cause change-queue overflow.

use crate::decoder::RecordDecoder;
use crate::record::RecordAccessor;
use std::fmt;
use tracing::trace;

/// Called once per change-queue notification for a valid id.
pub trait UpdateListener: Send {
    fn on_update(&mut self, record: &RecordAccessor<'_>);
}

impl<F> UpdateListener for F
where
    F: FnMut(&RecordAccessor<'_>) + Send,
{
    #[inline(always)]
    fn on_update(&mut self, record: &RecordAccessor<'_>) {
        self(record)
    }
}

/// Called once per newly discovered record id.
pub trait NewRecordListener: Send {
    fn on_new_record(&mut self, record: &RecordAccessor<'_>);
}

impl<F> NewRecordListener for F
where
    F: FnMut(&RecordAccessor<'_>) + Send,
{
    #[inline(always)]
    fn on_new_record(&mut self, record: &RecordAccessor<'_>) {
        self(record)
    }
}

/// Periodic health summary of the change-queue consumer.
///
/// Emitted every `status_interval` drain cycles; dropped notifications take
/// precedence over gaps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusSignal {
    /// The consumer fell behind and lost this many notifications.
    Dropped(u64),
    /// This many entries carried ids outside the store.
    Gaps(u64),
    Clean,
}

impl StatusSignal {
    /// Single-character progress marker.
    pub const fn marker(&self) -> char {
        match self {
            StatusSignal::Dropped(_) => '*',
            StatusSignal::Gaps(_) => '!',
            StatusSignal::Clean => '.',
        }
    }

    pub const fn is_clean(&self) -> bool {
        matches!(self, StatusSignal::Clean)
    }
}

impl fmt::Display for StatusSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusSignal::Dropped(n) => write!(f, "dropped {n}"),
            StatusSignal::Gaps(n) => write!(f, "gaps {n}"),
            StatusSignal::Clean => f.write_str("clean"),
        }
    }
}

/// Receives [`StatusSignal`]s.
pub trait StatusListener: Send {
    fn on_status(&mut self, signal: StatusSignal);
}

impl<F> StatusListener for F
where
    F: FnMut(StatusSignal) + Send,
{
    #[inline(always)]
    fn on_status(&mut self, signal: StatusSignal) {
        self(signal)
    }
}

/// Adapts a [`RecordDecoder`] and a value callback into a listener.
///
/// Each notification is decoded with a consistent read and the decoded
/// value handed to `sink` together with the record id. The read gives up
/// when the record's cancellation token fires, and nothing is delivered.
/// Works as both an update and a new-record listener.
pub struct DecodingListener<D, F> {
    decoder: D,
    sink: F,
}

impl<D, F> DecodingListener<D, F>
where
    D: RecordDecoder,
    F: FnMut(i64, D::Output),
{
    pub fn new(decoder: D, sink: F) -> Self {
        Self { decoder, sink }
    }

    #[inline]
    fn deliver(&mut self, record: &RecordAccessor<'_>) {
        match record.try_read_consistent(&self.decoder) {
            Some(value) => (self.sink)(record.id(), value),
            None => trace!(id = record.id(), "read abandoned on cancellation"),
        }
    }
}

impl<D, F> UpdateListener for DecodingListener<D, F>
where
    D: RecordDecoder + Send,
    F: FnMut(i64, D::Output) + Send,
{
    fn on_update(&mut self, record: &RecordAccessor<'_>) {
        self.deliver(record);
    }
}

impl<D, F> NewRecordListener for DecodingListener<D, F>
where
    D: RecordDecoder + Send,
    F: FnMut(i64, D::Output) + Send,
{
    fn on_new_record(&mut self, record: &RecordAccessor<'_>) {
        self.deliver(record);
    }
}

impl<D: fmt::Debug, F> fmt::Debug for DecodingListener<D, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecodingListener")
            .field("decoder", &self.decoder)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancellationToken;
    use crate::decoder::{Quote, QuoteDecoder};
    use crate::test_support::scratch_store;

    #[test]
    fn markers() {
        assert_eq!(StatusSignal::Dropped(3).marker(), '*');
        assert_eq!(StatusSignal::Gaps(1).marker(), '!');
        assert_eq!(StatusSignal::Clean.marker(), '.');
        assert!(StatusSignal::Clean.is_clean());
        assert_eq!(StatusSignal::Dropped(3).to_string(), "dropped 3");
    }

    #[test]
    fn closures_are_listeners() {
        let mut ts = scratch_store(0, 9, 8, 8);
        ts.writer.write_record(1, &5u64.to_le_bytes()).unwrap();
        let rec = ts.store.record(1).unwrap();

        let mut seen = Vec::new();
        {
            let mut listener = |r: &RecordAccessor<'_>| seen.push(r.get_u64(0));
            UpdateListener::on_update(&mut listener, &rec);
            NewRecordListener::on_new_record(&mut listener, &rec);
        }
        assert_eq!(seen, vec![5, 5]);

        let mut signals = Vec::new();
        let mut status = |s: StatusSignal| signals.push(s);
        status.on_status(StatusSignal::Gaps(2));
        assert_eq!(signals, vec![StatusSignal::Gaps(2)]);
    }

    #[test]
    fn decoding_listener_hands_decoded_values_to_sink() {
        let mut ts = scratch_store(0, 9, Quote::SIZE, 8);
        let quote = Quote {
            bid: 1.0,
            ask: 2.0,
            bid_qty: 3,
            ask_qty: 4,
        };
        ts.writer.write_record(6, &quote.encode()).unwrap();
        let rec = ts.store.record(6).unwrap();

        let mut out = Vec::new();
        let mut listener = DecodingListener::new(QuoteDecoder, |id, q| out.push((id, q)));
        listener.on_update(&rec);
        listener.on_new_record(&rec);
        drop(listener);
        assert_eq!(out, vec![(6, quote), (6, quote)]);
    }

    #[test]
    fn decoding_listener_skips_delivery_once_cancelled() {
        let mut ts = scratch_store(0, 9, Quote::SIZE, 8);
        ts.writer.write_record(2, &Quote::default().encode()).unwrap();
        std::mem::forget(ts.writer.lock_record(2).unwrap());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let rec = ts.store.record(2).unwrap().with_cancellation(&cancel);

        let mut out = Vec::new();
        let mut listener = DecodingListener::new(QuoteDecoder, |id, q| out.push((id, q)));
        listener.on_update(&rec);
        drop(listener);
        assert!(out.is_empty());
    }
}
