//! Hashed timing wheel.
//!
//! All timers share one driver task ticking at a fixed interval. A timer lands
//! in slot `(cursor + ticks) % slots` and carries the number of full
//! revolutions still to wait, so scheduling and cancelling are O(1) no matter
//! how many timers are pending.

use crate::config::CorrelationConfig;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Handle to a scheduled timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

type Callback = Box<dyn FnOnce() + Send>;

struct Entry {
    id: u64,
    rounds: u64,
    callback: Callback,
}

struct WheelState {
    slots: Vec<Vec<Entry>>,
    cursor: usize,
    /// Timer id -> slot index, for O(1) cancel.
    index: HashMap<u64, usize>,
    stopped: bool,
}

impl WheelState {
    /// Advances one tick and removes the entries now due.
    fn advance(&mut self) -> Vec<Entry> {
        self.cursor = (self.cursor + 1) % self.slots.len();
        let slot = std::mem::take(&mut self.slots[self.cursor]);

        let mut due = Vec::new();
        for mut entry in slot {
            if entry.rounds == 0 {
                self.index.remove(&entry.id);
                due.push(entry);
            } else {
                entry.rounds -= 1;
                self.slots[self.cursor].push(entry);
            }
        }
        due
    }
}

/// Delay scheduler shared by request timeouts and reconnect attempts.
pub struct TimeWheel {
    tick: Duration,
    state: Arc<Mutex<WheelState>>,
    next_id: AtomicU64,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl TimeWheel {
    /// Creates a wheel and starts its driver on the current runtime.
    pub fn new(tick: Duration, slots: usize) -> Self {
        let tick = tick.max(Duration::from_millis(1));
        let slots = slots.max(1);
        let state = Arc::new(Mutex::new(WheelState {
            slots: (0..slots).map(|_| Vec::new()).collect(),
            cursor: 0,
            index: HashMap::new(),
            stopped: false,
        }));

        let driver = tokio::spawn(drive(state.clone(), tick));
        tracing::debug!("Time wheel started: tick={:?} slots={}", tick, slots);

        Self {
            tick,
            state,
            next_id: AtomicU64::new(1),
            driver: Mutex::new(Some(driver)),
        }
    }

    /// Creates a wheel from the correlation section of the configuration.
    pub fn from_config(config: &CorrelationConfig) -> Self {
        Self::new(config.wheel_tick(), config.wheel_slots)
    }

    pub fn tick(&self) -> Duration {
        self.tick
    }

    pub fn slots(&self) -> usize {
        self.state.lock().slots.len()
    }

    /// Runs `callback` once `delay` has elapsed, rounded up to whole ticks.
    ///
    /// Returns `None` and drops `callback` unrun once the wheel has been shut
    /// down. Callbacks run on the driver task and must not block.
    pub fn after<F>(&self, delay: Duration, callback: F) -> Option<TimerId>
    where
        F: FnOnce() + Send + 'static,
    {
        let ticks = (delay.as_nanos().div_ceil(self.tick.as_nanos()) as u64).max(1);

        let mut state = self.state.lock();
        if state.stopped {
            return None;
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let slots = state.slots.len() as u64;
        let slot = ((state.cursor as u64 + ticks) % slots) as usize;
        state.slots[slot].push(Entry {
            id,
            rounds: (ticks - 1) / slots,
            callback: Box::new(callback),
        });
        state.index.insert(id, slot);

        Some(TimerId(id))
    }

    /// Cancels a pending timer.
    ///
    /// Returns `false` when the timer already fired or was cancelled. Firing
    /// and cancelling take the same lock, so exactly one of them wins.
    pub fn cancel(&self, timer: TimerId) -> bool {
        let mut state = self.state.lock();
        let Some(slot) = state.index.remove(&timer.0) else {
            return false;
        };
        let entries = &mut state.slots[slot];
        match entries.iter().position(|e| e.id == timer.0) {
            Some(pos) => {
                entries.swap_remove(pos);
                true
            }
            None => false,
        }
    }

    /// Number of timers waiting to fire.
    pub fn pending(&self) -> usize {
        self.state.lock().index.len()
    }

    /// Whether [`shutdown`](Self::shutdown) has run.
    pub fn is_stopped(&self) -> bool {
        self.state.lock().stopped
    }

    /// Stops the driver and drops every pending callback unrun. Later
    /// [`after`](Self::after) calls are refused.
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        state.stopped = true;
        if let Some(driver) = self.driver.lock().take() {
            driver.abort();
        }
        state.index.clear();
        for slot in state.slots.iter_mut() {
            slot.clear();
        }
        tracing::debug!("Time wheel stopped");
    }
}

impl Drop for TimeWheel {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.get_mut().take() {
            driver.abort();
        }
    }
}

impl std::fmt::Debug for TimeWheel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeWheel")
            .field("tick", &self.tick)
            .field("pending", &self.pending())
            .finish()
    }
}

async fn drive(state: Arc<Mutex<WheelState>>, tick: Duration) {
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + tick, tick);
    interval.set_missed_tick_behavior(MissedTickBehavior::Burst);

    loop {
        interval.tick().await;
        let due = state.lock().advance();
        // Run outside the lock so callbacks can schedule or cancel timers.
        for entry in due {
            if std::panic::catch_unwind(AssertUnwindSafe(entry.callback)).is_err() {
                tracing::error!("Timer {} callback panicked", entry.id);
            }
        }
    }
}
