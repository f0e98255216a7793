//! A complete reader: the change-queue consumer on the caller's thread and
//! new-record discovery on a background thread, over one store.

use crate::cancel::CancellationToken;
use crate::config::ReaderConfig;
use crate::consumer::{ChangeQueueConsumer, ConsumerMetrics, MetricsHandle};
use crate::discovery::NewRecordDiscovery;
use crate::error::ReaderError;
use crate::listener::{NewRecordListener, StatusListener, StatusSignal, UpdateListener};
use crate::record::RecordAccessor;
use crate::store::Store;
use std::thread;
use tracing::{info, warn};

const DISCOVERY_THREAD_NAME: &str = "new-record-discovery";

/// Totals of a finished [`CacheReader::run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaderSummary {
    pub consumer: ConsumerMetrics,
    /// Ids reported to new-record listeners.
    pub discovered: u64,
    pub highest_record_id_seen: i64,
}

/// Reader over one store.
///
/// Listeners are registered before [`run`](Self::run); `run` takes the
/// reader by value, so the set is fixed for its whole lifetime. Stop a
/// running reader through its [`cancellation_token`](Self::cancellation_token).
/// Records handed to listeners carry that token; listeners reading them
/// with the `try_read_*` methods of [`RecordAccessor`] return promptly on
/// cancellation even if the writer died holding a record lock.
///
/// ```no_run
/// use hft_cache::{CacheReader, QuoteDecoder, ReaderConfig};
///
/// let mut reader = CacheReader::open("/dev/shm/quotes", ReaderConfig::default())?;
/// reader.on_update(|record| {
///     if let Some(quote) = record.try_read_consistent(&QuoteDecoder) {
///         println!("{} {quote}", record.id());
///     }
/// });
/// let summary = reader.run()?;
/// println!("dropped {}", summary.consumer.dropped);
/// # Ok::<(), hft_cache::ReaderError>(())
/// ```
pub struct CacheReader {
    store: Store,
    config: ReaderConfig,
    cancel: CancellationToken,
    metrics: MetricsHandle,
    update_listeners: Vec<Box<dyn UpdateListener>>,
    new_record_listeners: Vec<Box<dyn NewRecordListener>>,
    status_listeners: Vec<Box<dyn StatusListener>>,
}

impl CacheReader {
    /// Validates `config` and opens the store at `location`.
    ///
    /// # Errors
    ///
    /// [`ReaderError::Config`] for an invalid configuration,
    /// [`ReaderError::Store`] if the store cannot be opened or does not use
    /// `config.id_addressing`.
    pub fn open(location: &str, config: ReaderConfig) -> Result<Self, ReaderError> {
        config.validate()?;
        let store = Store::open(location)?;
        Self::from_store(store, config)
    }

    /// Builds a reader over an already opened store.
    ///
    /// # Errors
    ///
    /// [`ReaderError::Config`] for an invalid configuration,
    /// [`ReaderError::Store`] if the store does not use
    /// `config.id_addressing`.
    pub fn from_store(store: Store, config: ReaderConfig) -> Result<Self, ReaderError> {
        config.validate()?;
        if let Some(addressing) = config.id_addressing {
            store.expect_addressing(addressing)?;
        }
        Ok(Self {
            store,
            config,
            cancel: CancellationToken::new(),
            metrics: MetricsHandle::default(),
            update_listeners: Vec::new(),
            new_record_listeners: Vec::new(),
            status_listeners: Vec::new(),
        })
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn config(&self) -> &ReaderConfig {
        &self.config
    }

    /// Token that stops [`run`](Self::run) when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Live totals of the change-queue consumer.
    pub fn metrics(&self) -> MetricsHandle {
        self.metrics.clone()
    }

    pub fn add_update_listener(&mut self, listener: impl UpdateListener + 'static) -> &mut Self {
        self.update_listeners.push(Box::new(listener));
        self
    }

    pub fn on_update<F>(&mut self, f: F) -> &mut Self
    where
        F: FnMut(&RecordAccessor<'_>) + Send + 'static,
    {
        self.add_update_listener(f)
    }

    pub fn add_new_record_listener(
        &mut self,
        listener: impl NewRecordListener + 'static,
    ) -> &mut Self {
        self.new_record_listeners.push(Box::new(listener));
        self
    }

    pub fn on_new_record<F>(&mut self, f: F) -> &mut Self
    where
        F: FnMut(&RecordAccessor<'_>) + Send + 'static,
    {
        self.add_new_record_listener(f)
    }

    pub fn add_status_listener(&mut self, listener: impl StatusListener + 'static) -> &mut Self {
        self.status_listeners.push(Box::new(listener));
        self
    }

    pub fn on_status<F>(&mut self, f: F) -> &mut Self
    where
        F: FnMut(StatusSignal) + Send + 'static,
    {
        self.add_status_listener(f)
    }

    /// Runs both loops until the cancellation token is cancelled, then
    /// closes the store.
    ///
    /// The change-queue consumer runs on the calling thread. A panic in
    /// either loop cancels the other.
    ///
    /// # Errors
    ///
    /// [`ReaderError::Spawn`] if the discovery thread cannot be started,
    /// [`ReaderError::DiscoveryPanicked`] if a new-record listener
    /// panicked.
    pub fn run(self) -> Result<ReaderSummary, ReaderError> {
        let CacheReader {
            store,
            config,
            cancel,
            metrics,
            update_listeners,
            new_record_listeners,
            status_listeners,
        } = self;

        let mut consumer = ChangeQueueConsumer::new(&store, &config);
        consumer.set_listeners(update_listeners, status_listeners);
        consumer.attach_metrics(&metrics);

        let no_discovery = (0, store.metadata().base_id() - 1);
        let (discovered, highest_record_id_seen) = thread::scope(|s| -> Result<_, ReaderError> {
            let discovery = if config.discovery_enabled {
                let mut discovery = NewRecordDiscovery::new(&store, config.discovery_idle());
                discovery.set_listeners(new_record_listeners);
                let token = cancel.clone();
                let handle = thread::Builder::new()
                    .name(DISCOVERY_THREAD_NAME.into())
                    .spawn_scoped(s, move || {
                        let _stop = CancelOnDrop(&token);
                        discovery.run(&token);
                        (discovery.discovered(), discovery.highest_record_id_seen())
                    })
                    .map_err(ReaderError::Spawn)?;
                Some(handle)
            } else {
                if !new_record_listeners.is_empty() {
                    warn!(
                        listeners = new_record_listeners.len(),
                        "discovery disabled, new-record listeners will not be called"
                    );
                }
                None
            };

            {
                let _stop = CancelOnDrop(&cancel);
                consumer.run(&cancel);
            }

            match discovery {
                Some(handle) => handle.join().map_err(|_| ReaderError::DiscoveryPanicked),
                None => Ok(no_discovery),
            }
        })?;

        let summary = ReaderSummary {
            consumer: metrics.snapshot(),
            discovered,
            highest_record_id_seen,
        };
        drop(consumer);
        info!(
            location = store.location(),
            dispatched = summary.consumer.dispatched,
            dropped = summary.consumer.dropped,
            gaps = summary.consumer.gaps,
            discovered,
            "reader stopped"
        );
        store.close();
        Ok(summary)
    }

    /// Closes the store without running.
    pub fn close(self) {
        self.store.close();
    }
}

impl std::fmt::Debug for CacheReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheReader")
            .field("location", &self.store.location())
            .field("config", &self.config)
            .field("update_listeners", &self.update_listeners.len())
            .field("new_record_listeners", &self.new_record_listeners.len())
            .field("status_listeners", &self.status_listeners.len())
            .finish_non_exhaustive()
    }
}

/// Cancels the token when dropped, including during unwinding.
struct CancelOnDrop<'a>(&'a CancellationToken);

impl Drop for CancelOnDrop<'_> {
    fn drop(&mut self) {
        self.0.cancel();
    }
}
