//! Registry of live clients and the sentinel that revives closed ones.

use crate::client::Client;
use crate::reconnect::Reconnector;
use gantry_session::{ReconnectConfig, TimeWheel};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Clients keyed by peer address.
pub struct ClientRegistry {
    clients: RwLock<HashMap<SocketAddr, Arc<Client>>>,
    reconnector: Arc<Reconnector>,
    sentinel: Mutex<Option<JoinHandle<()>>>,
}

impl ClientRegistry {
    pub fn new(reconnector: Arc<Reconnector>) -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            reconnector,
            sentinel: Mutex::new(None),
        }
    }

    /// Builds a registry whose reconnector follows `config` and starts the
    /// sentinel at the configured interval. Must run inside a runtime.
    pub fn from_config(config: &ReconnectConfig, wheel: Arc<TimeWheel>) -> Arc<Self> {
        let reconnector = Arc::new(Reconnector::from_config(config, wheel));
        let registry = Arc::new(Self::new(reconnector));
        registry.start_sentinel(config.sentinel_interval());
        registry
    }

    pub fn has_sentinel(&self) -> bool {
        self.sentinel
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Registers `client`, replacing and shutting down any previous client
    /// for the same peer.
    pub fn join(&self, client: Arc<Client>) {
        let addr = client.remote_addr();
        let previous = self.clients.write().insert(addr, client);
        if let Some(previous) = previous {
            self.reconnector.cancel(addr);
            previous.shutdown();
        }
        tracing::debug!("[{}] Joined registry", addr);
    }

    /// Removes and shuts down the client for `addr`.
    pub fn remove(&self, addr: &SocketAddr) -> Option<Arc<Client>> {
        let client = self.clients.write().remove(addr)?;
        self.reconnector.cancel(*addr);
        client.shutdown();
        tracing::debug!("[{}] Removed from registry", addr);
        Some(client)
    }

    /// Returns the client for `addr` if its session is open.
    pub fn lookup(&self, addr: &SocketAddr) -> Option<Arc<Client>> {
        self.clients
            .read()
            .get(addr)
            .filter(|client| !client.is_closed())
            .cloned()
    }

    /// Copy of the current entries, safe to iterate while others mutate.
    pub fn snapshot(&self) -> Vec<Arc<Client>> {
        self.clients.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.clients.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.read().is_empty()
    }

    /// Submits a reconnect task for every closed client.
    ///
    /// Returns how many tasks were started. A client that exhausts its
    /// retries is removed from the registry.
    pub fn sweep(self: &Arc<Self>) -> usize {
        self.snapshot()
            .into_iter()
            .filter(|client| client.is_closed())
            .filter(|client| self.submit_reconnect(client.clone()))
            .count()
    }

    fn submit_reconnect(self: &Arc<Self>, client: Arc<Client>) -> bool {
        let addr = client.remote_addr();
        if !self.reconnector.is_enabled() {
            tracing::info!("[{}] Closed and reconnect disabled, removing", addr);
            self.remove(&addr);
            return false;
        }
        let registry = Arc::downgrade(self);
        self.reconnector.submit(client, move |addr| {
            if let Some(registry) = registry.upgrade() {
                registry.remove(&addr);
            }
        })
    }

    /// Starts the periodic sweep. Replaces a sentinel already running.
    pub fn start_sentinel(self: &Arc<Self>, every: Duration) {
        let registry = Arc::downgrade(self);
        let handle = tokio::spawn(sentinel(registry, every));
        if let Some(old) = self.sentinel.lock().replace(handle) {
            old.abort();
        }
        tracing::info!("Sentinel started, sweeping every {:?}", every);
    }

    /// Stops the sentinel and reconnects, then shuts down every client.
    pub fn shutdown(&self) {
        if let Some(sentinel) = self.sentinel.lock().take() {
            sentinel.abort();
        }
        self.reconnector.stop();
        let clients: Vec<Arc<Client>> = self.clients.write().drain().map(|(_, c)| c).collect();
        for client in &clients {
            client.shutdown();
        }
        tracing::info!("Registry shut down, {} clients closed", clients.len());
    }
}

impl Drop for ClientRegistry {
    fn drop(&mut self) {
        if let Some(sentinel) = self.sentinel.get_mut().take() {
            sentinel.abort();
        }
    }
}

async fn sentinel(registry: Weak<ClientRegistry>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    interval.tick().await;

    loop {
        interval.tick().await;
        let Some(registry) = registry.upgrade() else {
            return;
        };
        let started = registry.sweep();
        if started > 0 {
            tracing::info!("Sentinel started {} reconnect(s)", started);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientOptions;
    use bytes::Bytes;
    use gantry_protocol::{Frame, FrameCodec};
    use gantry_session::{
        AdmissionPool, Correlator, DiscardHandler, EchoHandler, Pipeline, Server, ServerConfig,
        SessionOptions, SocketOptions,
    };

    struct Fixture {
        wheel: Arc<TimeWheel>,
        correlator: Arc<Correlator<Frame>>,
    }

    impl Fixture {
        fn new() -> Self {
            let wheel = Arc::new(TimeWheel::new(Duration::from_millis(2), 64));
            let correlator = Arc::new(Correlator::new(4, 1000, wheel.clone()));
            Self { wheel, correlator }
        }

        fn registry(&self, max_retries: u32) -> Arc<ClientRegistry> {
            let reconnector = Arc::new(Reconnector::new(
                self.wheel.clone(),
                Duration::from_millis(10),
                max_retries,
            ));
            Arc::new(ClientRegistry::new(reconnector))
        }

        async fn client(&self, addr: SocketAddr) -> Arc<Client> {
            let options = ClientOptions::default().with_connect_timeout(Duration::from_secs(1));
            Arc::new(
                Client::connect(addr, options, self.correlator.clone(), DiscardHandler)
                    .await
                    .unwrap(),
            )
        }
    }

    async fn start_server(addr: SocketAddr) -> Arc<Server> {
        let pipeline = Arc::new(Pipeline::new(
            FrameCodec::default(),
            SessionOptions::default(),
            AdmissionPool::new(16),
            EchoHandler,
        ));
        let server = Arc::new(Server::new(ServerConfig::default(), pipeline));
        let listener = SocketOptions::default().bind(addr).unwrap();
        let running = server.clone();
        tokio::spawn(async move { running.serve(listener).await });
        server
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..500 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_join_lookup_remove() {
        let fixture = Fixture::new();
        let server = start_server("127.0.0.1:0".parse().unwrap()).await;
        wait_until(|| server.local_addr().is_some()).await;
        let addr = server.local_addr().unwrap();

        let registry = fixture.registry(3);
        let client = fixture.client(addr).await;
        registry.join(client.clone());

        assert_eq!(registry.len(), 1);
        assert!(registry.lookup(&addr).is_some());
        assert_eq!(registry.snapshot().len(), 1);

        let removed = registry.remove(&addr).unwrap();
        assert!(removed.is_closed());
        assert!(registry.lookup(&addr).is_none());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_lookup_skips_closed() {
        let fixture = Fixture::new();
        let server = start_server("127.0.0.1:0".parse().unwrap()).await;
        wait_until(|| server.local_addr().is_some()).await;
        let addr = server.local_addr().unwrap();

        let registry = fixture.registry(3);
        let client = fixture.client(addr).await;
        registry.join(client.clone());

        client.session().close();
        assert!(registry.lookup(&addr).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_sweep_reconnects_closed_client() {
        let fixture = Fixture::new();
        let server = start_server("127.0.0.1:0".parse().unwrap()).await;
        wait_until(|| server.local_addr().is_some()).await;
        let addr = server.local_addr().unwrap();

        let registry = fixture.registry(20);
        let client = fixture.client(addr).await;
        registry.join(client.clone());

        wait_until(|| server.session_count() == 1).await;
        assert_eq!(server.close_all(), 1);
        wait_until(|| client.is_closed()).await;

        assert_eq!(registry.sweep(), 1);
        wait_until(|| !client.is_closed()).await;
        wait_until(|| registry.reconnector.pending() == 0).await;

        let response = client
            .request(Frame::new(1, Bytes::from_static(b"back")), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(response.body.as_ref(), b"back");
    }

    #[tokio::test]
    async fn test_sentinel_removes_unreachable_peer() {
        let fixture = Fixture::new();
        let server = start_server("127.0.0.1:0".parse().unwrap()).await;
        wait_until(|| server.local_addr().is_some()).await;
        let addr = server.local_addr().unwrap();

        let registry = fixture.registry(2);
        let client = fixture.client(addr).await;
        registry.join(client.clone());

        wait_until(|| server.session_count() == 1).await;

        // Stop the server for good; every reconnect is refused.
        server.shutdown();
        wait_until(|| client.is_closed()).await;
        wait_until(|| !server.is_running()).await;

        registry.start_sentinel(Duration::from_millis(20));
        wait_until(|| registry.is_empty()).await;
        registry.shutdown();
    }

    #[tokio::test]
    async fn test_from_config_starts_sentinel() {
        let fixture = Fixture::new();
        let server = start_server("127.0.0.1:0".parse().unwrap()).await;
        wait_until(|| server.local_addr().is_some()).await;
        let addr = server.local_addr().unwrap();

        let config = ReconnectConfig {
            interval_ms: 10,
            sentinel_interval_secs: 1,
            ..Default::default()
        };
        let registry = ClientRegistry::from_config(&config, fixture.wheel.clone());
        assert!(registry.has_sentinel());
        assert_eq!(registry.reconnector.max_retries(), config.max_retries);

        let client = fixture.client(addr).await;
        registry.join(client.clone());
        wait_until(|| server.session_count() == 1).await;
        assert_eq!(server.close_all(), 1);
        wait_until(|| client.is_closed()).await;

        // No manual sweep: the sentinel notices the closed client on its own.
        wait_until(|| !client.is_closed()).await;
        assert_eq!(registry.len(), 1);

        registry.shutdown();
        assert!(!registry.has_sentinel());
    }

    #[tokio::test]
    async fn test_shutdown_closes_clients() {
        let fixture = Fixture::new();
        let server = start_server("127.0.0.1:0".parse().unwrap()).await;
        wait_until(|| server.local_addr().is_some()).await;
        let addr = server.local_addr().unwrap();

        let registry = fixture.registry(3);
        let client = fixture.client(addr).await;
        registry.join(client.clone());
        registry.start_sentinel(Duration::from_millis(20));

        registry.shutdown();
        assert!(registry.is_empty());
        assert!(client.is_closed());
        assert!(client.reconnect().await.is_err());
    }
}
