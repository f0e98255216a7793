use libc::{CLOCK_MONOTONIC, CLOCK_REALTIME, clock_gettime, clockid_t, timespec};

#[inline(always)]
fn clock(id: clockid_t) -> timespec {
    let mut ts = timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe {
        clock_gettime(id, &mut ts);
    }
    ts
}

/// Returns monotonic timestamp in ns
#[inline(never)]
pub fn mono_time_ns() -> u64 {
    let ts = clock(CLOCK_MONOTONIC);
    (ts.tv_sec as u64) * 1_000_000_000 + (ts.tv_nsec as u64)
}

/// Returns wall-clock time in µs since the Unix epoch
pub fn wall_time_us() -> i64 {
    let ts = clock(CLOCK_REALTIME);
    ts.tv_sec as i64 * 1_000_000 + ts.tv_nsec as i64 / 1_000
}

/// Latency samples, e.g. publish-to-dispatch delays in ns.
///
/// A [`bounded`](Self::bounded) set keeps only the most recent `limit`
/// samples, so a collector that runs until interrupted stays within a
/// fixed footprint.
#[derive(Debug, Clone, Default)]
pub struct Trials<T> {
    trials: Vec<T>,
    limit: Option<usize>,
    next: usize,
    seen: u64,
}

impl<T> Trials<T>
where
    T: std::cmp::Ord + std::fmt::Display,
{
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            trials: Vec::with_capacity(capacity),
            limit: None,
            next: 0,
            seen: 0,
        }
    }

    /// Keeps at most `limit` samples; once full, each push replaces the
    /// oldest one.
    pub fn bounded(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Self::with_capacity(limit)
        }
    }

    pub fn push(&mut self, value: T) {
        self.seen += 1;
        match self.limit {
            Some(0) => {}
            Some(limit) if self.trials.len() == limit => {
                self.trials[self.next] = value;
                self.next = (self.next + 1) % limit;
            }
            _ => self.trials.push(value),
        }
    }

    /// Samples pushed so far, including those no longer retained.
    pub fn seen(&self) -> u64 {
        self.seen
    }

    pub fn len(&self) -> usize {
        self.trials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trials.is_empty()
    }

    pub fn sort(&mut self) {
        self.trials.sort();
    }

    /// Smallest sample; call [`sort`](Self::sort) first.
    pub fn min(&self) -> Option<&T> {
        self.trials.first()
    }

    pub fn max(&self) -> Option<&T> {
        self.trials.last()
    }

    /// Nearest-rank quantile of the sorted samples, `None` when empty.
    ///
    /// # Panics
    ///
    /// Panics if `p` is outside `0.0..=1.0`.
    pub fn quantile(&self, p: f64) -> Option<&T> {
        assert!((0.0..=1.0).contains(&p), "quantile {p} outside 0..=1");
        let n = self.trials.len();
        if n == 0 {
            return None;
        }
        let idx = ((n - 1) as f64 * p).round() as usize;
        self.trials.get(idx)
    }

    pub fn print_csv(&self, title: &str) {
        const QUANTILES: [f64; 9] = [0.1, 0.5, 0.75, 0.9, 0.95, 0.99, 0.999, 0.9999, 0.99999];
        let cell = |v: Option<&T>| v.map(ToString::to_string).unwrap_or_default();
        println!("name,n,min,max,0.1,0.5,0.75,0.9,0.95,0.99,0.999,0.9999,0.99999");
        let mut row = format!("{},{},{},{}", title, self.len(), cell(self.min()), cell(self.max()));
        for q in QUANTILES {
            row.push(',');
            row.push_str(&cell(self.quantile(q)));
        }
        println!("{row}");
    }
}
