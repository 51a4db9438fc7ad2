//! TCP server implementation.

use crate::admission::AdmissionPool;
use crate::config::Config;
use crate::error::SessionError;
use crate::handler::FrameHandler;
use crate::session::{Pipeline, Session};
use crate::socket::SocketOptions;
use dashmap::DashMap;
use gantry_protocol::DEFAULT_PORT;
use parking_lot::Mutex;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Options for the listener and accepted sockets.
    pub socket: SocketOptions,
    /// How often idle sessions are swept; `None` disables sweeping.
    pub idle_sweep: Option<Duration>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_PORT)),
            max_connections: 1000,
            socket: SocketOptions::default(),
            idle_sweep: Some(Duration::from_secs(30)),
        }
    }
}

impl ServerConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            ..Default::default()
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self {
            bind_addr: config.network.bind_addr,
            max_connections: config.network.max_connections,
            socket: config.network.socket_options(),
            idle_sweep: config.session.idle_sweep_interval(),
        }
    }
}

/// Server statistics.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub connections_total: AtomicU64,
    pub connections_active: AtomicU64,
    pub connections_rejected: AtomicU64,
    pub idle_closed: AtomicU64,
}

/// TCP server running one [`Session`] per accepted connection.
pub struct Server {
    config: ServerConfig,
    pipeline: Arc<Pipeline>,
    sessions: Arc<DashMap<u64, Arc<Session>>>,
    stats: Arc<ServerStats>,
    shutdown: watch::Sender<bool>,
    running: AtomicBool,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl Server {
    /// Creates a new server.
    pub fn new(config: ServerConfig, pipeline: Arc<Pipeline>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            pipeline,
            sessions: Arc::new(DashMap::new()),
            stats: Arc::new(ServerStats::default()),
            shutdown: shutdown_tx,
            running: AtomicBool::new(false),
            local_addr: Mutex::new(None),
        }
    }

    /// Creates a server and its pipeline from a loaded configuration.
    pub fn from_config(config: &Config, handler: impl FrameHandler) -> Self {
        let pipeline = Pipeline::new(
            config.framing.codec(),
            config.session.options(),
            AdmissionPool::new(config.session.max_in_flight),
            handler,
        );
        Self::new(ServerConfig::from_config(config), Arc::new(pipeline))
    }

    /// Binds the configured address and runs the server.
    pub async fn run(&self) -> Result<(), SessionError> {
        let listener = self.config.socket.bind(self.config.bind_addr)?;
        self.serve(listener).await
    }

    /// Runs the server on an already bound listener until shutdown.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), SessionError> {
        let local = listener.local_addr()?;
        *self.local_addr.lock() = Some(local);
        self.running.store(true, Ordering::SeqCst);
        tracing::info!("Server listening on {}", local);

        let sweeper = self.config.idle_sweep.map(|every| {
            tokio::spawn(sweep_idle(
                self.sessions.clone(),
                self.stats.clone(),
                every,
                self.shutdown.subscribe(),
            ))
        });

        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            if self.sessions.len() >= self.config.max_connections {
                                tracing::warn!("Connection limit reached, rejecting {}", addr);
                                self.stats.connections_rejected.fetch_add(1, Ordering::Relaxed);
                                continue;
                            }
                            if let Err(e) = self.config.socket.apply(&stream) {
                                tracing::warn!("[{}] Failed to apply socket options: {}", addr, e);
                            }
                            let local_addr = stream.local_addr().unwrap_or(local);

                            self.stats.connections_total.fetch_add(1, Ordering::Relaxed);
                            self.stats.connections_active.fetch_add(1, Ordering::Relaxed);
                            tracing::info!("Client connected: {}", addr);

                            let session = Session::spawn(stream, local_addr, addr, self.pipeline.clone());
                            self.sessions.insert(session.id(), session.clone());

                            let sessions = self.sessions.clone();
                            let stats = self.stats.clone();
                            tokio::spawn(async move {
                                session.closed().await;
                                sessions.remove(&session.id());
                                stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                                tracing::info!("Client disconnected: {}", addr);
                            });
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.wait_for(|stop| *stop) => {
                    tracing::info!("Server shutting down");
                    break;
                }
            }
        }

        if let Some(sweeper) = sweeper {
            sweeper.abort();
        }
        let closed = self.close_all();
        tracing::info!("Closed {} sessions", closed);
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Closes every live session and returns how many were closed.
    pub fn close_all(&self) -> usize {
        self.sessions().iter().filter(|s| s.close()).count()
    }

    /// Initiates server shutdown.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Returns whether the server is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Address the server is listening on, once bound.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Returns server statistics.
    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Snapshot of the live sessions.
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.sessions.iter().map(|e| e.value().clone()).collect()
    }
}

async fn sweep_idle(
    sessions: Arc<DashMap<u64, Arc<Session>>>,
    stats: Arc<ServerStats>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(every);
    interval.tick().await;

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.wait_for(|stop| *stop) => return,
        }

        let idle: Vec<Arc<Session>> = sessions
            .iter()
            .filter(|e| e.value().idle())
            .map(|e| e.value().clone())
            .collect();
        for session in idle {
            tracing::debug!(
                "[{}] Idle for {:?}, closing",
                session.remote_addr(),
                session.idle_duration()
            );
            if session.close() {
                stats.idle_closed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}
