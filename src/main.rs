use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hft_cache::{
    CacheReader, CancellationToken, Quote, QuoteDecoder, ReaderConfig, RecordAccessor,
    StatusSignal, Store, StoreLayout, StoreWriter, Trials, mono_time_ns,
};
use std::io::Write;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Shared-memory record cache tools
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Log level when RUST_LOG is unset
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Follow a store: print status markers and new records
    Read {
        /// Store path, or shm:/NAME
        location: String,
        /// Reader configuration (TOML)
        #[arg(short, long)]
        config: Option<String>,
        /// Collect publish-to-dispatch latency and print quantiles on exit
        #[arg(long)]
        stats: bool,
        /// Print every update and log at debug level
        #[arg(short, long)]
        verbose: bool,
    },
    /// Create a store and publish synthetic quotes into it
    Write {
        /// Store path, or shm:/NAME
        location: String,
        #[arg(long, default_value_t = 0)]
        base_id: i64,
        #[arg(long, default_value_t = 1023)]
        max_id: i64,
        /// Change-queue entries (power of two)
        #[arg(long, default_value_t = 1024)]
        queue_capacity: usize,
        #[arg(long, default_value_t = Quote::SIZE)]
        value_size: usize,
        /// Pause between updates, in µs
        #[arg(long, default_value_t = 100)]
        interval_us: u64,
        /// Number of updates; 0 runs until interrupted
        #[arg(long, default_value_t = 0)]
        count: u64,
    },
    /// Print a store's header
    Inspect {
        /// Store path, or shm:/NAME
        location: String,
    },
}

static STOP: AtomicBool = AtomicBool::new(false);

extern "C" fn on_signal(_: libc::c_int) {
    STOP.store(true, Ordering::Relaxed);
}

fn install_signal_handlers() -> std::io::Result<()> {
    for signal in [libc::SIGINT, libc::SIGTERM, libc::SIGHUP] {
        unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = on_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
            libc::sigemptyset(&mut action.sa_mask);
            if libc::sigaction(signal, &action, std::ptr::null_mut()) == -1 {
                return Err(std::io::Error::last_os_error());
            }
        }
    }
    Ok(())
}

/// Forwards a received signal to `cancel`.
fn spawn_signal_watcher(cancel: CancellationToken) -> std::io::Result<()> {
    std::thread::Builder::new()
        .name("signal-watcher".into())
        .spawn(move || {
            while !STOP.load(Ordering::Relaxed) {
                if cancel.wait_timeout(Duration::from_millis(10)) {
                    return;
                }
            }
            info!("signal received, stopping");
            cancel.cancel();
        })?;
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let level = match cli.command {
        Command::Read { verbose: true, .. } => "debug",
        _ => cli.log_level.as_str(),
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("hft_cache={level}").into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let result = match cli.command {
        Command::Read {
            location,
            config,
            stats,
            verbose,
        } => read(&location, config.as_deref(), stats, verbose),
        Command::Write {
            location,
            base_id,
            max_id,
            queue_capacity,
            value_size,
            interval_us,
            count,
        } => {
            let layout = StoreLayout::new(base_id, max_id, value_size)
                .with_queue_capacity(queue_capacity)
                .with_description(format!("hft-cache write pid {}", std::process::id()));
            write(&location, &layout, Duration::from_micros(interval_us), count)
        }
        Command::Inspect { location } => inspect(&location),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// `None` if the reader was cancelled before a consistent value was read.
fn describe(record: &RecordAccessor<'_>) -> Option<String> {
    if record.metadata().value_size() >= Quote::SIZE {
        record
            .try_read_consistent(&QuoteDecoder)
            .map(|quote| quote.to_string())
    } else {
        record.try_read_bytes_consistent().map(|bytes| hex(&bytes))
    }
}

/// Latency samples kept by `read --stats`.
const LATENCY_SAMPLES: usize = 1 << 20;

fn read(location: &str, config: Option<&str>, stats: bool, verbose: bool) -> Result<()> {
    let config = match config {
        Some(path) => ReaderConfig::from_file(path)?,
        None => ReaderConfig::default(),
    };
    let mut reader = CacheReader::open(location, config)?;
    println!("{}", reader.store().metadata());

    reader.on_status(|signal: StatusSignal| {
        let mut out = std::io::stdout().lock();
        let _ = write!(out, "{}", signal.marker());
        let _ = out.flush();
    });
    reader.on_new_record(|record| {
        if let Some(text) = describe(record) {
            println!("\nnew record {}: {text}", record.id());
        }
    });
    if verbose {
        reader.on_update(|record| {
            if let Some(text) = describe(record) {
                println!("update {}: {text}", record.id());
            }
        });
    }
    let latencies = stats.then(|| Arc::new(Mutex::new(Trials::<u64>::bounded(LATENCY_SAMPLES))));
    if let Some(latencies) = &latencies {
        let sink = Arc::clone(latencies);
        reader.on_update(move |record| {
            let Some(stamped) = record.try_read_with(|r| r.timestamp()) else {
                return;
            };
            let latency = mono_time_ns().saturating_sub(stamped as u64);
            if let Ok(mut trials) = sink.lock() {
                trials.push(latency);
            }
        });
    }

    install_signal_handlers().context("installing signal handlers")?;
    spawn_signal_watcher(reader.cancellation_token()).context("spawning signal watcher")?;

    let summary = reader.run()?;
    println!();
    info!(
        polls = summary.consumer.polls,
        drain_cycles = summary.consumer.drain_cycles,
        dispatched = summary.consumer.dispatched,
        dropped = summary.consumer.dropped,
        gaps = summary.consumer.gaps,
        discovered = summary.discovered,
        "reader summary"
    );

    if let Some(latencies) = latencies {
        let mut trials = latencies
            .lock()
            .map_err(|_| anyhow::anyhow!("latency collector poisoned"))?;
        info!(
            samples = trials.seen(),
            retained = trials.len(),
            "update latency"
        );
        trials.sort();
        trials.print_csv("update_latency_ns");
    }
    Ok(())
}

fn write(location: &str, layout: &StoreLayout, interval: Duration, count: u64) -> Result<()> {
    let mut writer = StoreWriter::create(location, layout)?;
    install_signal_handlers().context("installing signal handlers")?;
    println!("{}", writer.metadata());

    let ids = (layout.max_id - layout.base_id + 1) as u64;
    let value_size = writer.metadata().value_size();
    let mut n: u64 = 0;
    while !STOP.load(Ordering::Relaxed) && (count == 0 || n < count) {
        let id = layout.base_id + (n % ids) as i64;
        if value_size >= Quote::SIZE {
            let quote = Quote {
                bid: 100.0 + (n % 100) as f64 * 0.01,
                ask: 100.01 + (n % 100) as f64 * 0.01,
                bid_qty: (n % 1000) as i32,
                ask_qty: (n % 700) as i32,
            };
            writer.update(id, &quote.encode())?;
        } else {
            let bytes = n.to_le_bytes();
            writer.update(id, &bytes[..value_size.min(bytes.len())])?;
        }
        n += 1;
        if n % 1024 == 0 {
            writer.touch();
        }
        if !interval.is_zero() {
            std::thread::sleep(interval);
        }
    }
    if STOP.load(Ordering::Relaxed) {
        warn!(updates = n, "interrupted");
    }
    info!(updates = n, head = writer.queue_head(), "writer finished");
    Ok(())
}

fn inspect(location: &str) -> Result<()> {
    let store = Store::open(location)?;
    let md = store.metadata();
    println!("{md}");
    println!("owner pid     : {}", md.owner_pid());
    println!("version       : {:#06x}", md.version());
    println!("addressing    : {:?}", md.addressing());
    println!("queue head    : {}", store.queue_head());
    println!("high water id : {}", store.high_water_id());
    println!("created (µs)  : {}", store.created_time());
    println!("touched (µs)  : {}", store.touched_time());
    store.close();
    Ok(())
}
