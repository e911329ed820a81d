//! Adaptive limit on the number of range requests in flight.
//!
//! The limit is held as semaphore permits. It grows by one permit when the throughput measured
//! over the last window rose, and is halved on errors. It shrinks by one when throughput
//! collapses or a window passes with requests outstanding and nothing completed. Shrinking while
//! permits are held is recorded as debt: the next permits that are returned are forgotten instead.
//!
//! Time with no request in flight does not count towards a window.
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Mutex;
use tokio::sync::{watch, Semaphore, SemaphorePermit};
use tokio::time::{Duration, Instant, MissedTickBehavior};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencyOptions {
    pub initial: usize,
    pub min: usize,
    pub max: usize,

    /// Length of the throughput measurement window.
    pub window_ms: u64,
}

impl Default for ConcurrencyOptions {
    fn default() -> Self {
        ConcurrencyOptions {
            initial: 6,
            min: 1,
            max: 32,
            window_ms: 500,
        }
    }
}

/// Snapshot of the I/O done through one reader since it was opened.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamingStats {
    pub total_bytes: u64,
    pub total_requests: u64,
    pub failed_requests: u64,
    pub elapsed_ms: u64,

    /// Throughput over the last completed window.
    pub current_mbps: f64,

    /// Throughput since open.
    pub avg_mbps: f64,

    /// Current limit on requests in flight.
    pub concurrency: usize,
}

#[derive(Debug)]
struct State {
    target: usize,
    debt: usize,
    in_flight: usize,

    /// Since when nothing has been in flight.
    idle_since: Option<Instant>,

    started: Instant,
    window_start: Instant,
    window_bytes: u64,
    window_requests: u64,
    last_mbps: f64,

    stats: StreamingStats,
}

pub struct ConcurrencyController {
    opts: ConcurrencyOptions,
    sem: Semaphore,
    state: Mutex<State>,
    tx: watch::Sender<StreamingStats>,
}

/// A slot for one request. Returned to the controller on drop.
pub struct Permit<'a> {
    permit: Option<SemaphorePermit<'a>>,
    ctl: &'a ConcurrencyController,
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if let Ok(mut st) = self.ctl.state.lock() {
            st.in_flight = st.in_flight.saturating_sub(1);
            if st.in_flight == 0 {
                st.idle_since = Some(Instant::now());
            }

            if st.debt > 0 {
                st.debt -= 1;
                if let Some(p) = self.permit.take() {
                    p.forget();
                }
            }
        }
    }
}

fn mbps(bytes: u64, d: Duration) -> f64 {
    let secs = d.as_secs_f64();
    if secs > 0. {
        bytes as f64 * 8. / 1e6 / secs
    } else {
        0.
    }
}

impl ConcurrencyController {
    pub fn new(opts: ConcurrencyOptions) -> ConcurrencyController {
        let min = opts.min.max(1);
        let opts = ConcurrencyOptions {
            min,
            max: opts.max.max(min),
            initial: opts.initial.clamp(min, opts.max.max(min)),
            ..opts
        };

        let now = Instant::now();
        let stats = StreamingStats {
            concurrency: opts.initial,
            ..Default::default()
        };
        let (tx, _) = watch::channel(stats);

        ConcurrencyController {
            sem: Semaphore::new(opts.initial),
            state: Mutex::new(State {
                target: opts.initial,
                debt: 0,
                in_flight: 0,
                idle_since: Some(now),
                started: now,
                window_start: now,
                window_bytes: 0,
                window_requests: 0,
                last_mbps: 0.,
                stats,
            }),
            opts,
            tx,
        }
    }

    pub fn options(&self) -> &ConcurrencyOptions {
        &self.opts
    }

    /// Wait for a free request slot.
    pub async fn acquire(&self) -> Permit<'_> {
        // The semaphore is never closed.
        let permit = self.sem.acquire().await.ok();

        if let Ok(mut st) = self.state.lock() {
            if let Some(t) = st.idle_since.take() {
                // Move the window past the idle time.
                let now = Instant::now();
                let idle = now.saturating_duration_since(t.max(st.window_start));
                st.window_start += idle;
            }
            st.in_flight += 1;
        }

        Permit { permit, ctl: self }
    }

    /// Drive `request` to completion, closing measurement windows while it is outstanding. A
    /// request that stalls for a window shrinks the limit.
    pub async fn supervise<F: Future>(&self, request: F) -> F::Output {
        let window = Duration::from_millis(self.opts.window_ms.max(1));
        let mut ticks = tokio::time::interval_at(Instant::now() + window, window);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(request);

        loop {
            tokio::select! {
                r = &mut request => return r,
                _ = ticks.tick() => self.tick(),
            }
        }
    }

    pub fn limit(&self) -> usize {
        self.state.lock().map(|st| st.target).unwrap_or(self.opts.min)
    }

    pub fn stats(&self) -> StreamingStats {
        let mut stats = *self.tx.borrow();
        if let Ok(st) = self.state.lock() {
            stats.elapsed_ms = st.started.elapsed().as_millis() as u64;
            stats.avg_mbps = mbps(stats.total_bytes, st.started.elapsed());
        }
        stats
    }

    pub fn subscribe(&self) -> watch::Receiver<StreamingStats> {
        self.tx.subscribe()
    }

    /// Start over: zero all counters and return to the initial limit.
    pub fn reset(&self) {
        if let Ok(mut st) = self.state.lock() {
            while st.target < self.opts.initial {
                self.grow(&mut st);
            }
            while st.target > self.opts.initial {
                self.shrink(&mut st);
            }

            let now = Instant::now();
            st.idle_since = (st.in_flight == 0).then_some(now);
            st.started = now;
            st.window_start = now;
            st.window_bytes = 0;
            st.window_requests = 0;
            st.last_mbps = 0.;
            st.stats = StreamingStats {
                concurrency: st.target,
                ..Default::default()
            };
            self.tx.send_replace(st.stats);
        }
    }

    /// A request completed with `bytes`.
    pub fn completed(&self, bytes: u64) {
        self.observe(bytes, Instant::now());
    }

    /// A request failed.
    pub fn failed(&self) {
        if let Ok(mut st) = self.state.lock() {
            st.stats.failed_requests += 1;

            let half = (st.target / 2).max(self.opts.min);
            while st.target > half {
                self.shrink(&mut st);
            }

            log::debug!("request failed, concurrency: {}", st.target);
            self.publish(&mut st, Instant::now());
        }
    }

    pub(crate) fn observe(&self, bytes: u64, now: Instant) {
        let Ok(mut st) = self.state.lock() else {
            return;
        };

        st.stats.total_bytes += bytes;
        st.stats.total_requests += 1;
        st.window_bytes += bytes;
        st.window_requests += 1;

        self.close_window(&mut st, now);
    }

    /// Close the current window if it has run its length.
    pub fn tick(&self) {
        self.tick_at(Instant::now());
    }

    pub(crate) fn tick_at(&self, now: Instant) {
        if let Ok(mut st) = self.state.lock() {
            self.close_window(&mut st, now);
        }
    }

    fn close_window(&self, st: &mut State, now: Instant) {
        let window = Duration::from_millis(self.opts.window_ms);
        let spent = now.saturating_duration_since(st.window_start);

        if spent >= window {
            let current = mbps(st.window_bytes, spent);

            if st.window_requests == 0 {
                if st.in_flight > 0 {
                    // Stalled.
                    self.shrink(st);
                }
            } else if current > st.last_mbps * 1.05 {
                self.grow(st);
            } else if current < st.last_mbps * 0.5 {
                self.shrink(st);
            }

            log::trace!(
                "window: {:.2} Mbps (previous {:.2}), concurrency: {}",
                current,
                st.last_mbps,
                st.target
            );

            st.last_mbps = current;
            st.stats.current_mbps = current;
            st.window_start = now;
            st.window_bytes = 0;
            st.window_requests = 0;
        }

        self.publish(st, now);
    }

    fn publish(&self, st: &mut State, now: Instant) {
        let elapsed = now.saturating_duration_since(st.started);
        st.stats.elapsed_ms = elapsed.as_millis() as u64;
        st.stats.avg_mbps = mbps(st.stats.total_bytes, elapsed);
        st.stats.concurrency = st.target;

        self.tx.send_replace(st.stats);
    }

    fn grow(&self, st: &mut State) {
        if st.target >= self.opts.max {
            return;
        }

        st.target += 1;
        if st.debt > 0 {
            st.debt -= 1;
        } else {
            self.sem.add_permits(1);
        }
    }

    fn shrink(&self, st: &mut State) {
        if st.target <= self.opts.min {
            return;
        }

        st.target -= 1;
        match self.sem.try_acquire() {
            Ok(p) => p.forget(),
            Err(_) => st.debt += 1,
        }
    }
}
