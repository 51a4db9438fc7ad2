//! Request/response correlation by opaque ID.
//!
//! A request carries an opaque ID in its sequence field. The sender attaches
//! a waiter under that ID; the matching response detaches it and delivers the
//! value. Entries are spread over independently locked shards
//! (`id % shards`), and an optional time-wheel timer bounds each wait.

use crate::config::CorrelationConfig;
use crate::error::CorrelationError;
use crate::wheel::{TimeWheel, TimerId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;

type Outcome<T> = Result<T, CorrelationError>;

/// Sending half of a single-slot wait, stored in the registry.
#[derive(Debug)]
pub struct Responder<T> {
    tx: oneshot::Sender<Outcome<T>>,
}

/// Receiving half of a single-slot wait, held by the caller.
#[derive(Debug)]
pub struct Waiter<T> {
    rx: oneshot::Receiver<Outcome<T>>,
}

/// Creates a connected responder/waiter pair.
pub fn waiter<T>() -> (Responder<T>, Waiter<T>) {
    let (tx, rx) = oneshot::channel();
    (Responder { tx }, Waiter { rx })
}

impl<T> Responder<T> {
    fn resolve(self, outcome: Outcome<T>) {
        // The caller may have stopped waiting.
        let _ = self.tx.send(outcome);
    }
}

impl<T> Waiter<T> {
    /// Waits for the response, a timeout or cancellation.
    pub async fn wait(self) -> Outcome<T> {
        self.rx.await.unwrap_or(Err(CorrelationError::Cancelled))
    }
}

struct Entry<T> {
    responder: Responder<T>,
    timer: Option<TimerId>,
}

type Shard<T> = Mutex<HashMap<u32, Entry<T>>>;

/// Sharded opaque-ID registry.
pub struct Correlator<T> {
    shards: Vec<Shard<T>>,
    next_id: AtomicU32,
    max_opaque: u32,
    wheel: Arc<TimeWheel>,
}

impl<T: Send + 'static> Correlator<T> {
    /// Creates a registry with `shards` locks over IDs `0..max_opaque`.
    pub fn new(shards: usize, max_opaque: u32, wheel: Arc<TimeWheel>) -> Self {
        let shards = shards.max(1);
        Self {
            shards: (0..shards).map(|_| Mutex::new(HashMap::new())).collect(),
            next_id: AtomicU32::new(0),
            max_opaque: max_opaque.max(1),
            wheel,
        }
    }

    /// Creates a registry sized by the correlation section of the
    /// configuration.
    pub fn from_config(config: &CorrelationConfig, wheel: Arc<TimeWheel>) -> Self {
        Self::new(config.shards, config.max_opaque, wheel)
    }

    fn shard(&self, id: u32) -> &Shard<T> {
        &self.shards[id as usize % self.shards.len()]
    }

    /// Returns the next ID in the cyclic space `0..max_opaque`.
    ///
    /// The ID may still be outstanding; use [`register`](Self::register) to
    /// get one that is known to be free.
    pub fn next_opaque_id(&self) -> u32 {
        let max = self.max_opaque;
        let advance = |id: u32| Some((id + 1) % max);
        match self
            .next_id
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, advance)
        {
            Ok(prev) | Err(prev) => (prev + 1) % max,
        }
    }

    /// Registers `responder` under `id`.
    ///
    /// Fails with [`CorrelationError::IdInUse`] if `id` already has a waiter;
    /// the existing waiter is left untouched.
    pub fn attach(&self, id: u32, responder: Responder<T>) -> Result<(), CorrelationError> {
        self.insert(id, responder, None)
    }

    fn insert(
        &self,
        id: u32,
        responder: Responder<T>,
        timer: Option<TimerId>,
    ) -> Result<(), CorrelationError> {
        let mut shard = self.shard(id).lock();
        if shard.contains_key(&id) {
            return Err(CorrelationError::IdInUse(id));
        }
        shard.insert(id, Entry { responder, timer });
        Ok(())
    }

    /// Registers `responder` under `id` and expires it after `timeout`.
    pub fn attach_with_timeout(
        self: &Arc<Self>,
        id: u32,
        responder: Responder<T>,
        timeout: Duration,
    ) -> Result<(), CorrelationError> {
        let mut shard = self.shard(id).lock();
        if shard.contains_key(&id) {
            return Err(CorrelationError::IdInUse(id));
        }
        let timer = self.schedule_expiry(id, timeout)?;
        shard.insert(
            id,
            Entry {
                responder,
                timer: Some(timer),
            },
        );
        Ok(())
    }

    /// Arms the timeout for `id`. Fails if the wheel can no longer fire it,
    /// which would leave the waiter unbounded.
    fn schedule_expiry(self: &Arc<Self>, id: u32, timeout: Duration) -> Result<TimerId, CorrelationError> {
        let weak: Weak<Self> = Arc::downgrade(self);
        self.wheel
            .after(timeout, move || {
                if let Some(correlator) = weak.upgrade() {
                    correlator.expire(id);
                }
            })
            .ok_or(CorrelationError::WheelStopped)
    }

    /// Allocates a free ID, attaches a fresh waiter and arms its timeout.
    ///
    /// IDs still outstanding are skipped. Fails with
    /// [`CorrelationError::Exhausted`] after one full cycle of the ID space.
    pub fn register(self: &Arc<Self>, timeout: Duration) -> Result<(u32, Waiter<T>), CorrelationError> {
        for _ in 0..self.max_opaque {
            let id = self.next_opaque_id();
            let mut shard = self.shard(id).lock();
            if shard.contains_key(&id) {
                continue;
            }
            let (responder, waiter) = waiter();
            let timer = self.schedule_expiry(id, timeout)?;
            shard.insert(
                id,
                Entry {
                    responder,
                    timer: Some(timer),
                },
            );
            return Ok((id, waiter));
        }
        Err(CorrelationError::Exhausted)
    }

    /// Delivers `value` to the waiter for `id`.
    ///
    /// Gives `value` back if nothing waits on `id`, for example because the
    /// request already timed out.
    pub fn try_detach(&self, id: u32, value: T) -> Result<(), T> {
        let entry = self.shard(id).lock().remove(&id);
        match entry {
            Some(entry) => {
                if let Some(timer) = entry.timer {
                    self.wheel.cancel(timer);
                }
                entry.responder.resolve(Ok(value));
                Ok(())
            }
            None => Err(value),
        }
    }

    /// Delivers `value` to the waiter for `id`; a no-op for unknown IDs.
    ///
    /// Returns whether a waiter received the value.
    pub fn detach(&self, id: u32, value: T) -> bool {
        self.try_detach(id, value).is_ok()
    }

    /// Resolves the waiter for `id` with a timeout.
    pub fn expire(&self, id: u32) -> bool {
        self.fail(id, CorrelationError::Timeout)
    }

    /// Resolves the waiter for `id` as cancelled.
    pub fn cancel(&self, id: u32) -> bool {
        self.fail(id, CorrelationError::Cancelled)
    }

    fn fail(&self, id: u32, error: CorrelationError) -> bool {
        let entry = self.shard(id).lock().remove(&id);
        match entry {
            Some(entry) => {
                if let Some(timer) = entry.timer {
                    self.wheel.cancel(timer);
                }
                tracing::debug!("Opaque id {} resolved with: {}", id, error);
                entry.responder.resolve(Err(error));
                true
            }
            None => false,
        }
    }

    /// Cancels every outstanding waiter.
    pub fn cancel_all(&self) -> usize {
        let mut cancelled = 0;
        for shard in &self.shards {
            let entries: Vec<Entry<T>> = shard.lock().drain().map(|(_, e)| e).collect();
            for entry in entries {
                if let Some(timer) = entry.timer {
                    self.wheel.cancel(timer);
                }
                entry.responder.resolve(Err(CorrelationError::Cancelled));
                cancelled += 1;
            }
        }
        cancelled
    }

    pub fn is_pending(&self, id: u32) -> bool {
        self.shard(id).lock().contains_key(&id)
    }

    /// Number of outstanding waiters.
    pub fn pending(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }

    pub fn max_opaque(&self) -> u32 {
        self.max_opaque
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn correlator<T: Send + 'static>(shards: usize, max_opaque: u32) -> Arc<Correlator<T>> {
        let wheel = Arc::new(TimeWheel::new(Duration::from_millis(5), 64));
        Arc::new(Correlator::new(shards, max_opaque, wheel))
    }

    #[tokio::test]
    async fn test_attach_detach() {
        let c = correlator::<&'static str>(4, 100);
        let (responder, waiter) = waiter();
        c.attach(5, responder).unwrap();
        assert!(c.is_pending(5));

        assert!(c.detach(5, "x"));
        assert_eq!(waiter.wait().await, Ok("x"));
        // Delivered exactly once.
        assert!(!c.detach(5, "y"));
        assert_eq!(c.pending(), 0);
    }

    #[tokio::test]
    async fn test_detach_unknown_is_noop() {
        let c = correlator::<u32>(4, 100);
        assert!(!c.detach(42, 1));
        assert_eq!(c.try_detach(42, 7), Err(7));
    }

    #[tokio::test]
    async fn test_attach_rejects_live_id() {
        let c = correlator::<u32>(4, 100);
        let (first, first_waiter) = waiter();
        let (second, _second_waiter) = waiter();
        c.attach(9, first).unwrap();
        assert_eq!(c.attach(9, second), Err(CorrelationError::IdInUse(9)));

        // The first waiter still gets its response.
        assert!(c.detach(9, 1));
        assert_eq!(first_waiter.wait().await, Ok(1));
    }

    #[tokio::test]
    async fn test_timeout_then_late_detach() {
        let c = correlator::<u32>(4, 100);
        let (responder, waiter) = waiter();
        c.attach_with_timeout(3, responder, Duration::from_millis(20))
            .unwrap();

        assert_eq!(waiter.wait().await, Err(CorrelationError::Timeout));
        assert!(!c.is_pending(3));
        assert!(!c.detach(3, 1));
    }

    #[tokio::test]
    async fn test_detach_cancels_timer() {
        let c = correlator::<u32>(4, 100);
        let (responder, waiter) = waiter();
        c.attach_with_timeout(3, responder, Duration::from_secs(30))
            .unwrap();
        assert_eq!(c.wheel.pending(), 1);

        assert!(c.detach(3, 11));
        assert_eq!(c.wheel.pending(), 0);
        assert_eq!(waiter.wait().await, Ok(11));
    }

    #[tokio::test]
    async fn test_opaque_ids_cycle() {
        let c = correlator::<u32>(2, 4);
        let ids: Vec<u32> = (0..6).map(|_| c.next_opaque_id()).collect();
        assert_eq!(ids, vec![1, 2, 3, 0, 1, 2]);
    }

    #[tokio::test]
    async fn test_register_skips_outstanding() {
        let c = correlator::<u32>(2, 4);
        let (id_a, _a) = c.register(Duration::from_secs(30)).unwrap();
        let (id_b, _b) = c.register(Duration::from_secs(30)).unwrap();
        assert_ne!(id_a, id_b);

        // Rewind the counter so the next candidate collides with id_a.
        c.next_id.store(id_a.wrapping_sub(1) % 4, Ordering::Relaxed);
        let (id_c, _c) = c.register(Duration::from_secs(30)).unwrap();
        assert_ne!(id_c, id_a);
        assert_ne!(id_c, id_b);
    }

    #[tokio::test]
    async fn test_register_exhausted() {
        let c = correlator::<u32>(2, 3);
        let mut waiters = Vec::new();
        for _ in 0..3 {
            waiters.push(c.register(Duration::from_secs(30)).unwrap());
        }
        assert!(matches!(
            c.register(Duration::from_secs(30)),
            Err(CorrelationError::Exhausted)
        ));

        let (id, _) = &waiters[0];
        assert!(c.detach(*id, 0));
        assert!(c.register(Duration::from_secs(30)).is_ok());
    }

    #[tokio::test]
    async fn test_cancel_and_cancel_all() {
        let c = correlator::<u32>(4, 100);
        let (id, waiter) = c.register(Duration::from_secs(30)).unwrap();
        assert!(c.cancel(id));
        assert_eq!(waiter.wait().await, Err(CorrelationError::Cancelled));

        let (_, w1) = c.register(Duration::from_secs(30)).unwrap();
        let (_, w2) = c.register(Duration::from_secs(30)).unwrap();
        assert_eq!(c.cancel_all(), 2);
        assert_eq!(w1.wait().await, Err(CorrelationError::Cancelled));
        assert_eq!(w2.wait().await, Err(CorrelationError::Cancelled));
        assert_eq!(c.wheel.pending(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_requests() {
        let c = correlator::<u32>(8, 10_000);
        let mut tasks = Vec::new();
        for n in 0..100u32 {
            let c = c.clone();
            tasks.push(tokio::spawn(async move {
                let (id, waiter) = c.register(Duration::from_secs(5)).unwrap();
                let responder = c.clone();
                tokio::spawn(async move {
                    responder.detach(id, n);
                });
                waiter.wait().await
            }));
        }
        for (n, task) in tasks.into_iter().enumerate() {
            assert_eq!(task.await.unwrap(), Ok(n as u32));
        }
        assert_eq!(c.pending(), 0);
    }

    #[tokio::test]
    async fn test_register_on_stopped_wheel() {
        let c = correlator::<u32>(4, 100);
        c.wheel.shutdown();

        assert!(matches!(
            c.register(Duration::from_secs(1)),
            Err(CorrelationError::WheelStopped)
        ));
        let (responder, _waiter) = waiter();
        assert_eq!(
            c.attach_with_timeout(7, responder, Duration::from_secs(1)),
            Err(CorrelationError::WheelStopped)
        );
        assert_eq!(c.pending(), 0);
    }

    #[tokio::test]
    async fn test_from_config() {
        let config = CorrelationConfig {
            shards: 8,
            max_opaque: 64,
            ..Default::default()
        };
        let wheel = Arc::new(TimeWheel::from_config(&config));
        let c = Correlator::<u32>::from_config(&config, wheel);
        assert_eq!(c.shard_count(), 8);
        assert_eq!(c.max_opaque(), 64);
    }

    #[tokio::test]
    async fn test_dropped_responder_cancels() {
        let (responder, waiter) = waiter::<u32>();
        drop(responder);
        assert_eq!(waiter.wait().await, Err(CorrelationError::Cancelled));
    }
}
