//! Dialing client with request/response on top of a session.

use crate::error::ClientError;
use crate::reconnect::Reconnect;
use futures::future::BoxFuture;
use futures::FutureExt;
use gantry_protocol::{Buffer, Frame, FrameCodec, OP_PING};
use gantry_session::{
    AdmissionPool, Config, Correlator, FrameHandler, Pipeline, Session, SessionOptions,
    SocketOptions,
};
use parking_lot::RwLock;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub connect_timeout: Duration,
    pub socket: SocketOptions,
    pub session: SessionOptions,
    pub codec: FrameCodec,
    /// Maximum inbound handler tasks admitted at once.
    pub max_in_flight: usize,
    /// Deadline applied by [`Client::call`].
    pub request_timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            socket: SocketOptions::default(),
            session: SessionOptions::default(),
            codec: FrameCodec::default(),
            max_in_flight: 1000,
            request_timeout: Duration::from_secs(5),
        }
    }
}

impl ClientOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            connect_timeout: config.network.connect_timeout(),
            socket: config.network.socket_options(),
            session: config.session.options(),
            codec: config.framing.codec(),
            max_in_flight: config.session.max_in_flight,
            request_timeout: config.correlation.request_timeout(),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_codec(mut self, codec: FrameCodec) -> Self {
        self.codec = codec;
        self
    }
}

/// Sends responses to their waiters and everything else to the application.
struct ResponseRouter {
    correlator: Arc<Correlator<Frame>>,
    app: Arc<dyn FrameHandler>,
}

impl FrameHandler for ResponseRouter {
    fn handle(&self, session: Arc<Session>, frame: Frame) -> BoxFuture<'static, ()> {
        let sequence = frame.sequence();
        match self.correlator.try_detach(sequence, frame) {
            Ok(()) => async {}.boxed(),
            Err(frame) => self.app.handle(session, frame),
        }
    }
}

/// A connection to one peer.
///
/// Inbound frames whose sequence matches an outstanding request complete
/// that request; all others go to the application handler.
pub struct Client {
    peer: SocketAddr,
    options: ClientOptions,
    pipeline: Arc<Pipeline>,
    session: RwLock<Arc<Session>>,
    correlator: Arc<Correlator<Frame>>,
    heartbeat: AtomicI64,
    shut_down: AtomicBool,
}

impl Client {
    /// Dials `peer` and starts a session.
    pub async fn connect(
        peer: SocketAddr,
        options: ClientOptions,
        correlator: Arc<Correlator<Frame>>,
        handler: impl FrameHandler,
    ) -> Result<Client, ClientError> {
        let router = ResponseRouter {
            correlator: correlator.clone(),
            app: Arc::new(handler),
        };
        let pipeline = Arc::new(Pipeline::new(
            options.codec,
            options.session.clone(),
            AdmissionPool::new(options.max_in_flight),
            router,
        ));
        let session = dial(peer, &options, &pipeline).await?;
        tracing::info!("Client connected: {} <-> {}", session.local_addr(), peer);

        Ok(Self {
            peer,
            options,
            pipeline,
            session: RwLock::new(session),
            correlator,
            heartbeat: AtomicI64::new(0),
            shut_down: AtomicBool::new(false),
        })
    }

    /// The current session.
    pub fn session(&self) -> Arc<Session> {
        self.session.read().clone()
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.session().local_addr()
    }

    pub fn is_closed(&self) -> bool {
        self.session().is_closed()
    }

    pub fn idle(&self) -> bool {
        self.session().idle()
    }

    /// Queues `frame` without waiting for a response.
    pub fn send(&self, frame: Frame) -> Result<(), ClientError> {
        self.session().write(frame)?;
        Ok(())
    }

    /// Sends `frame` under a fresh opaque ID and waits for the response.
    ///
    /// The frame's sequence is overwritten with the allocated ID.
    pub async fn request(&self, frame: Frame, timeout: Duration) -> Result<Frame, ClientError> {
        let (id, waiter) = self.correlator.register(timeout)?;
        if let Err(e) = self.session().write(frame.with_sequence(id)) {
            self.correlator.cancel(id);
            return Err(e.into());
        }
        tracing::debug!("[{}] Request {} sent", self.peer, id);
        Ok(waiter.wait().await?)
    }

    /// [`Client::request`] with the configured request timeout.
    pub async fn call(&self, frame: Frame) -> Result<Frame, ClientError> {
        self.request(frame, self.options.request_timeout).await
    }

    /// Sends a heartbeat request and records the version carried by the pong.
    pub async fn ping(&self, frame: Frame, timeout: Duration) -> Result<i64, ClientError> {
        let pong = self.request(frame, timeout).await?;
        let mut buf = Buffer::from_vec(pong.body.to_vec());
        let version = buf
            .read_varint()
            .map_err(|e| ClientError::InvalidPong(e.to_string()))?;
        self.update_heartbeat(version);
        Ok(version)
    }

    /// Records `version` if it is newer than the last one seen.
    pub fn update_heartbeat(&self, version: i64) {
        self.heartbeat.fetch_max(version, Ordering::AcqRel);
    }

    /// Highest heartbeat version seen.
    pub fn heartbeat(&self) -> i64 {
        self.heartbeat.load(Ordering::Acquire)
    }

    /// Re-dials the peer and replaces the session.
    pub async fn reconnect(&self) -> Result<(), ClientError> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(gantry_session::SessionError::Closed.into());
        }
        let session = dial(self.peer, &self.options, &self.pipeline).await?;
        tracing::info!("[{}] Reconnected as {}", self.peer, session.local_addr());
        let old = std::mem::replace(&mut *self.session.write(), session);
        old.close();
        Ok(())
    }

    /// Closes the session for good; later reconnects fail.
    pub fn shutdown(&self) {
        self.shut_down.store(true, Ordering::Release);
        self.session().close();
        tracing::info!("[{}] Client shut down", self.peer);
    }
}

impl Reconnect for Client {
    fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    fn reconnect(&self) -> BoxFuture<'_, Result<(), ClientError>> {
        Box::pin(Client::reconnect(self))
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("peer", &self.peer)
            .field("session", &self.session())
            .field("heartbeat", &self.heartbeat())
            .finish()
    }
}

async fn dial(
    peer: SocketAddr,
    options: &ClientOptions,
    pipeline: &Arc<Pipeline>,
) -> Result<Arc<Session>, ClientError> {
    let stream = options
        .socket
        .connect(peer, options.connect_timeout)
        .await
        .map_err(|e| {
            tracing::debug!("[{}] Connection failed: {}", peer, e);
            if e.kind() == io::ErrorKind::TimedOut {
                ClientError::ConnectTimeout(peer)
            } else {
                ClientError::Io(e)
            }
        })?;
    let local = stream.local_addr()?;
    Ok(Session::spawn(stream, local, peer, pipeline.clone()))
}

/// Builds the answer to a ping: same sequence, body carrying `version`.
pub fn pong(ping: &Frame, version: i64) -> Frame {
    let mut body = Buffer::new();
    body.write_varint(version);
    Frame::new(ping.operation(), body.as_slice().to_vec()).with_sequence(ping.sequence())
}

/// A heartbeat request frame.
pub fn ping_frame() -> Frame {
    Frame::new(OP_PING, Vec::<u8>::new())
}
