//! Timed reconnection of dropped clients.

use crate::error::ClientError;
use futures::future::BoxFuture;
use gantry_session::{ReconnectConfig, TimeWheel, TimerId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Something that can re-establish its connection.
pub trait Reconnect: Send + Sync + 'static {
    fn peer_addr(&self) -> SocketAddr;

    fn reconnect(&self) -> BoxFuture<'_, Result<(), ClientError>>;
}

type GiveUp = Box<dyn FnOnce(SocketAddr) + Send>;

struct Task {
    target: Arc<dyn Reconnect>,
    generation: u64,
    attempts: u32,
    timer: Option<TimerId>,
    on_give_up: Option<GiveUp>,
}

/// Retries failed connections on the time wheel.
///
/// At most one task runs per peer address. Each attempt is scheduled
/// `interval` after the previous failure; after `max_retries` further
/// failures the give-up hook runs and the task is dropped.
pub struct Reconnector {
    wheel: Arc<TimeWheel>,
    interval: Duration,
    max_retries: u32,
    enabled: bool,
    tasks: Mutex<HashMap<SocketAddr, Task>>,
    stopped: AtomicBool,
    next_generation: AtomicU64,
}

impl Reconnector {
    pub fn new(wheel: Arc<TimeWheel>, interval: Duration, max_retries: u32) -> Self {
        Self {
            wheel,
            interval,
            max_retries,
            enabled: true,
            tasks: Mutex::new(HashMap::new()),
            stopped: AtomicBool::new(false),
            next_generation: AtomicU64::new(1),
        }
    }

    pub fn from_config(config: &ReconnectConfig, wheel: Arc<TimeWheel>) -> Self {
        let mut reconnector = Self::new(wheel, config.interval(), config.max_retries);
        reconnector.enabled = config.enabled;
        reconnector
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Starts retrying `target`.
    ///
    /// Returns `false` if reconnection is disabled, stopped, or a task for the
    /// same address is already running.
    pub fn submit(
        self: &Arc<Self>,
        target: Arc<dyn Reconnect>,
        on_give_up: impl FnOnce(SocketAddr) + Send + 'static,
    ) -> bool {
        if !self.enabled || self.stopped.load(Ordering::Acquire) {
            return false;
        }
        let addr = target.peer_addr();
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);

        let mut tasks = self.tasks.lock();
        if tasks.contains_key(&addr) {
            tracing::debug!("[{}] Reconnect already pending", addr);
            return false;
        }
        tasks.insert(
            addr,
            Task {
                target,
                generation,
                attempts: 0,
                timer: None,
                on_give_up: Some(Box::new(on_give_up)),
            },
        );
        if !self.schedule(&mut tasks, addr, generation) {
            tasks.remove(&addr);
            tracing::warn!("[{}] Time wheel stopped, reconnect not scheduled", addr);
            return false;
        }
        tracing::info!("[{}] Reconnect scheduled every {:?}", addr, self.interval);
        true
    }

    /// Arms the next attempt. Returns `false` if the wheel is stopped.
    fn schedule(self: &Arc<Self>, tasks: &mut HashMap<SocketAddr, Task>, addr: SocketAddr, generation: u64) -> bool {
        let this = Arc::downgrade(self);
        let timer = self.wheel.after(self.interval, move || {
            if let Some(this) = this.upgrade() {
                tokio::spawn(async move { this.attempt(addr, generation).await });
            }
        });
        let Some(timer) = timer else {
            return false;
        };
        if let Some(task) = tasks.get_mut(&addr) {
            task.timer = Some(timer);
        }
        true
    }

    async fn attempt(self: Arc<Self>, addr: SocketAddr, generation: u64) {
        let (target, attempt) = {
            let mut tasks = self.tasks.lock();
            let Some(task) = tasks.get_mut(&addr) else {
                return;
            };
            if task.generation != generation || self.stopped.load(Ordering::Acquire) {
                return;
            }
            task.attempts += 1;
            task.timer = None;
            (task.target.clone(), task.attempts)
        };

        tracing::debug!("[{}] Reconnect attempt {}", addr, attempt);
        match target.reconnect().await {
            Ok(()) => {
                self.finish(addr, generation);
                tracing::info!("[{}] Reconnected after {} attempt(s)", addr, attempt);
            }
            Err(e) => {
                tracing::warn!("[{}] Reconnect attempt {} failed: {}", addr, attempt, e);
                let mut tasks = self.tasks.lock();
                let current = tasks
                    .get(&addr)
                    .is_some_and(|task| task.generation == generation);
                if !current {
                    return;
                }
                if self.stopped.load(Ordering::Acquire) {
                    return;
                }
                if attempt > self.max_retries || !self.schedule(&mut tasks, addr, generation) {
                    let hook = tasks.remove(&addr).and_then(|mut task| task.on_give_up.take());
                    drop(tasks);
                    tracing::error!("[{}] Giving up after {} attempts", addr, attempt);
                    if let Some(hook) = hook {
                        hook(addr);
                    }
                }
            }
        }
    }

    fn finish(&self, addr: SocketAddr, generation: u64) {
        let mut tasks = self.tasks.lock();
        if tasks.get(&addr).is_some_and(|task| task.generation == generation) {
            tasks.remove(&addr);
        }
    }

    /// Cancels the task for `addr` without running its give-up hook.
    pub fn cancel(&self, addr: SocketAddr) -> bool {
        let task = self.tasks.lock().remove(&addr);
        match task {
            Some(task) => {
                if let Some(timer) = task.timer {
                    self.wheel.cancel(timer);
                }
                true
            }
            None => false,
        }
    }

    /// Cancels all tasks and refuses new ones.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        let tasks: Vec<Task> = self.tasks.lock().drain().map(|(_, task)| task).collect();
        for task in tasks {
            if let Some(timer) = task.timer {
                self.wheel.cancel(timer);
            }
        }
    }

    pub fn is_pending(&self, addr: &SocketAddr) -> bool {
        self.tasks.lock().contains_key(addr)
    }

    pub fn pending(&self) -> usize {
        self.tasks.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use tokio::sync::oneshot;

    struct FakeTarget {
        addr: SocketAddr,
        attempts: AtomicU32,
        succeed_on: Option<u32>,
    }

    impl FakeTarget {
        fn new(succeed_on: Option<u32>) -> Arc<Self> {
            Arc::new(Self {
                addr: "127.0.0.1:9".parse().unwrap(),
                attempts: AtomicU32::new(0),
                succeed_on,
            })
        }
    }

    impl Reconnect for FakeTarget {
        fn peer_addr(&self) -> SocketAddr {
            self.addr
        }

        fn reconnect(&self) -> BoxFuture<'_, Result<(), ClientError>> {
            let n = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            let ok = self.succeed_on == Some(n);
            let addr = self.addr;
            Box::pin(async move {
                if ok {
                    Ok(())
                } else {
                    Err(ClientError::ConnectTimeout(addr))
                }
            })
        }
    }

    fn reconnector(max_retries: u32) -> Arc<Reconnector> {
        let wheel = Arc::new(TimeWheel::new(Duration::from_millis(2), 16));
        Arc::new(Reconnector::new(wheel, Duration::from_millis(5), max_retries))
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let reconnector = reconnector(3);
        let target = FakeTarget::new(None);
        let (tx, rx) = oneshot::channel();

        assert!(reconnector.submit(target.clone(), move |addr| {
            let _ = tx.send(addr);
        }));
        let addr = tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(addr, target.addr);
        assert_eq!(target.attempts.load(Ordering::SeqCst), 4);
        assert!(!reconnector.is_pending(&addr));
    }

    #[tokio::test]
    async fn test_success_ends_task() {
        let reconnector = reconnector(10);
        let target = FakeTarget::new(Some(2));
        assert!(reconnector.submit(target.clone(), |_| panic!("gave up")));

        for _ in 0..500 {
            if reconnector.pending() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(reconnector.pending(), 0);
        assert_eq!(target.attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_one_task_per_address() {
        let reconnector = reconnector(100);
        let target = FakeTarget::new(None);
        assert!(reconnector.submit(target.clone(), |_| {}));
        assert!(!reconnector.submit(target.clone(), |_| {}));
        assert_eq!(reconnector.pending(), 1);

        assert!(reconnector.cancel(target.addr));
        assert!(!reconnector.cancel(target.addr));
        assert!(reconnector.submit(target, |_| {}));
    }

    #[tokio::test]
    async fn test_stop_refuses_new_tasks() {
        let reconnector = reconnector(100);
        let target = FakeTarget::new(None);
        assert!(reconnector.submit(target.clone(), |_| {}));

        reconnector.stop();
        assert_eq!(reconnector.pending(), 0);
        assert!(!reconnector.submit(target.clone(), |_| {}));

        let seen = target.attempts.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(target.attempts.load(Ordering::SeqCst) <= seen + 1);
    }

    #[tokio::test]
    async fn test_stopped_wheel_refuses_submit() {
        let wheel = Arc::new(TimeWheel::new(Duration::from_millis(2), 16));
        let reconnector = Arc::new(Reconnector::new(wheel.clone(), Duration::from_millis(5), 3));
        wheel.shutdown();

        assert!(!reconnector.submit(FakeTarget::new(None), |_| {}));
        assert_eq!(reconnector.pending(), 0);
    }

    #[tokio::test]
    async fn test_disabled() {
        let wheel = Arc::new(TimeWheel::new(Duration::from_millis(2), 16));
        let config = ReconnectConfig {
            enabled: false,
            ..Default::default()
        };
        let reconnector = Arc::new(Reconnector::from_config(&config, wheel));
        assert!(!reconnector.is_enabled());
        assert!(!reconnector.submit(FakeTarget::new(None), |_| {}));
    }
}
