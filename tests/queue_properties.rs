use hft_cache::{
    ChangeQueueConsumer, NewRecordDiscovery, PollOutcome, ReaderConfig, Store, StoreLayout,
    StoreWriter,
};
use proptest::prelude::*;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const CAPACITY: usize = 32;
const MAX_ID: i64 = 999;

fn fresh(dir: &tempfile::TempDir) -> (StoreWriter, Store) {
    let path = dir.path().join("store").to_str().unwrap().to_owned();
    let layout = StoreLayout::new(0, MAX_ID, 8).with_queue_capacity(CAPACITY);
    let writer = StoreWriter::create(&path, &layout).unwrap();
    let store = Store::open(&path).unwrap();
    (writer, store)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Batches never larger than the capacity: every position is drained
    /// exactly once, in order.
    #[test]
    fn prop_drain_is_complete_without_overflow(
        batches in prop::collection::vec(0usize..=CAPACITY, 1..20),
    ) {
        let dir = tempfile::tempdir().unwrap();
        let (mut writer, store) = fresh(&dir);
        let mut consumer = ChangeQueueConsumer::new(&store, &ReaderConfig::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        consumer.on_update(move |r| sink.lock().unwrap().push(r.id()));

        let mut published = Vec::new();
        for batch in batches {
            for _ in 0..batch {
                let id = (published.len() as i64 * 7) % (MAX_ID + 1);
                writer.publish(id).unwrap();
                published.push(id);
            }
            match consumer.poll() {
                PollOutcome::Idle => prop_assert_eq!(batch, 0),
                PollOutcome::Drained(report) => {
                    prop_assert_eq!(report.dropped, 0);
                    prop_assert_eq!(report.dispatched, batch as u64);
                }
            }
        }
        let seen = seen.lock().unwrap().clone();
        prop_assert_eq!(seen, published);
        prop_assert_eq!(consumer.metrics().snapshot().dropped, 0);
    }

    /// Advancing the head by `capacity + k` counts exactly `k` drops and
    /// drains the newest `capacity` entries.
    #[test]
    fn prop_drop_accounting(
        backlog in 0usize..=CAPACITY,
        k in 1usize..200,
    ) {
        let dir = tempfile::tempdir().unwrap();
        let (mut writer, store) = fresh(&dir);
        for id in 0..backlog as i64 {
            writer.publish(id).unwrap();
        }
        let mut consumer = ChangeQueueConsumer::new(&store, &ReaderConfig::default());
        consumer.poll();
        let start = consumer.last_head();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        consumer.on_update(move |r| sink.lock().unwrap().push(r.id()));

        let advance = CAPACITY + k;
        for n in 0..advance as i64 {
            writer.publish(n % (MAX_ID + 1)).unwrap();
        }
        let PollOutcome::Drained(report) = consumer.poll() else {
            return Err(TestCaseError::fail("expected a drain"));
        };
        prop_assert_eq!(report.dropped, k as u64);
        prop_assert_eq!(report.from, start + k as u64);
        prop_assert_eq!(report.dispatched, CAPACITY as u64);
        let expected: Vec<i64> = (k as i64..advance as i64).map(|n| n % (MAX_ID + 1)).collect();
        let seen = seen.lock().unwrap().clone();
        prop_assert_eq!(seen, expected);
    }

    /// Gap markers are skipped and never counted as drops.
    #[test]
    fn prop_gaps_are_skipped(entries in prop::collection::vec(any::<bool>(), 1..=CAPACITY)) {
        let dir = tempfile::tempdir().unwrap();
        let (mut writer, store) = fresh(&dir);
        let mut consumer = ChangeQueueConsumer::new(&store, &ReaderConfig::default());
        let calls = Arc::new(Mutex::new(0u64));
        let sink = Arc::clone(&calls);
        consumer.on_update(move |_| *sink.lock().unwrap() += 1);

        for (i, is_gap) in entries.iter().enumerate() {
            if *is_gap {
                writer.publish_gap();
            } else {
                writer.publish(i as i64).unwrap();
            }
        }
        let gaps = entries.iter().filter(|g| **g).count() as u64;
        let PollOutcome::Drained(report) = consumer.poll() else {
            return Err(TestCaseError::fail("expected a drain"));
        };
        prop_assert_eq!(report.gaps, gaps);
        prop_assert_eq!(report.dropped, 0);
        let calls = *calls.lock().unwrap();
        prop_assert_eq!(calls, entries.len() as u64 - gaps);
    }

    /// The discovery watermark never decreases and every written id below
    /// it is reported exactly once.
    #[test]
    fn prop_discovery_is_monotonic(rounds in prop::collection::vec(0i64..10, 1..15)) {
        let dir = tempfile::tempdir().unwrap();
        let (mut writer, store) = fresh(&dir);
        let mut discovery = NewRecordDiscovery::new(&store, Duration::from_millis(1));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        discovery.on_new_record(move |r| sink.lock().unwrap().push(r.id()));

        let mut next_id = 0i64;
        let mut last = discovery.highest_record_id_seen();
        for burst in rounds {
            for _ in 0..burst {
                if next_id <= MAX_ID {
                    writer.write_record(next_id, &[1; 8]).unwrap();
                    next_id += 1;
                }
            }
            discovery.poll();
            prop_assert!(discovery.highest_record_id_seen() >= last);
            last = discovery.highest_record_id_seen();
            prop_assert_eq!(last, next_id - 1);
        }
        let seen = seen.lock().unwrap().clone();
        prop_assert_eq!(seen, (0..next_id).collect::<Vec<_>>());
    }
}
