//! Session engine.
//!
//! Each session runs three tasks over one connection:
//!
//! ```text
//!  socket --read loop--> inbound queue --dispatch loop--> handler tasks
//!                                                             |
//!  socket <--write loop-- outbound queue <--- Session::write -+
//! ```
//!
//! The dispatch loop takes an admission slot before spawning each handler
//! task. When the pool is saturated it stops pulling from the inbound queue,
//! the queue fills, and the read loop stops reading the socket.

use crate::admission::AdmissionPool;
use crate::error::SessionError;
use crate::handler::FrameHandler;
use futures::FutureExt;
use gantry_protocol::{Buffer, Frame, FrameCodec};
use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};

/// Initial scratch buffer size for each loop.
const SCRATCH_BUFFER_SIZE: usize = 1024;

/// Per-session tuning.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Size of the buffered reader over the socket.
    pub read_buffer_size: usize,
    /// Size of the buffered writer over the socket.
    pub write_buffer_size: usize,
    /// Decoded frames waiting for dispatch.
    pub read_queue_capacity: usize,
    /// Frames waiting to be written.
    pub write_queue_capacity: usize,
    /// Inactivity threshold for [`Session::idle`].
    pub idle_timeout: Duration,
    /// Upper bound on flushing queued frames once the session is closed.
    /// Frames still queued after it are dropped with the connection.
    pub close_linger: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            read_buffer_size: 64 * 1024,
            write_buffer_size: 64 * 1024,
            read_queue_capacity: 100,
            write_queue_capacity: 100,
            idle_timeout: Duration::from_secs(60),
            close_linger: Duration::from_secs(1),
        }
    }
}

/// State shared by every session a server or client spawns.
pub struct Pipeline {
    codec: FrameCodec,
    options: SessionOptions,
    admission: AdmissionPool,
    handler: Arc<dyn FrameHandler>,
    next_session_id: AtomicU64,
}

impl Pipeline {
    pub fn new(
        codec: FrameCodec,
        options: SessionOptions,
        admission: AdmissionPool,
        handler: impl FrameHandler,
    ) -> Self {
        Self::with_handler(codec, options, admission, Arc::new(handler))
    }

    pub fn with_handler(
        codec: FrameCodec,
        options: SessionOptions,
        admission: AdmissionPool,
        handler: Arc<dyn FrameHandler>,
    ) -> Self {
        Self {
            codec,
            options,
            admission,
            handler,
            next_session_id: AtomicU64::new(1),
        }
    }

    pub fn codec(&self) -> &FrameCodec {
        &self.codec
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    pub fn admission(&self) -> &AdmissionPool {
        &self.admission
    }

    fn next_session_id(&self) -> u64 {
        self.next_session_id.fetch_add(1, Ordering::Relaxed)
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("codec", &self.codec)
            .field("options", &self.options)
            .field("admission", &self.admission)
            .finish()
    }
}

/// Session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Open = 0,
    /// Release sequence in progress.
    Closing = 1,
    Closed = 2,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::Open,
            1 => SessionState::Closing,
            _ => SessionState::Closed,
        }
    }
}

type Attribute = Arc<dyn Any + Send + Sync>;

/// One connection and its pipeline.
pub struct Session {
    id: u64,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    idle_timeout: Duration,
    state: AtomicU8,
    outbound: Mutex<Option<mpsc::Sender<Frame>>>,
    closed_tx: watch::Sender<bool>,
    created_at: Instant,
    last_activity: Mutex<Instant>,
    attributes: Mutex<HashMap<String, Attribute>>,
}

impl Session {
    /// Starts the read, dispatch and write loops over `stream`.
    pub fn spawn<S>(
        stream: S,
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
        pipeline: Arc<Pipeline>,
    ) -> Arc<Session>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let options = pipeline.options();
        let (inbound_tx, inbound_rx) = mpsc::channel(options.read_queue_capacity.max(1));
        let (outbound_tx, outbound_rx) = mpsc::channel(options.write_queue_capacity.max(1));
        let (closed_tx, _) = watch::channel(false);

        let now = Instant::now();
        let session = Arc::new(Session {
            id: pipeline.next_session_id(),
            local_addr,
            remote_addr,
            idle_timeout: options.idle_timeout,
            state: AtomicU8::new(SessionState::Open as u8),
            outbound: Mutex::new(Some(outbound_tx)),
            closed_tx,
            created_at: now,
            last_activity: Mutex::new(now),
            attributes: Mutex::new(HashMap::new()),
        });

        let (read_half, write_half) = tokio::io::split(stream);
        let reader = BufReader::with_capacity(options.read_buffer_size.max(1), read_half);
        let writer = BufWriter::with_capacity(options.write_buffer_size.max(1), write_half);
        let codec = *pipeline.codec();

        tokio::spawn(guarded(
            session.clone(),
            "read",
            read_loop(session.clone(), reader, codec, inbound_tx),
        ));
        tokio::spawn(guarded(
            session.clone(),
            "dispatch",
            dispatch_loop(session.clone(), inbound_rx, pipeline.clone()),
        ));
        tokio::spawn(guarded(
            session.clone(),
            "write",
            write_loop(session.clone(), writer, codec, outbound_rx, options.close_linger),
        ));

        tracing::info!("[{}] Session {} opened", remote_addr, session.id);
        session
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_closed(&self) -> bool {
        self.state() != SessionState::Open
    }

    /// Queues `frame` for writing without waiting.
    ///
    /// Fails with [`SessionError::QueueFull`] when the outbound queue is at
    /// capacity and with [`SessionError::Closed`] once the session is closing.
    pub fn write(&self, frame: Frame) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        let outbound = self.outbound.lock();
        let tx = outbound.as_ref().ok_or(SessionError::Closed)?;
        tx.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => SessionError::QueueFull,
            TrySendError::Closed(_) => SessionError::Closed,
        })
    }

    /// Closes the session.
    ///
    /// Safe to call any number of times from any task; only the first call
    /// runs the release sequence and returns `true`. Frames already queued are
    /// still flushed before the connection shuts down.
    pub fn close(&self) -> bool {
        if self
            .state
            .compare_exchange(
                SessionState::Open as u8,
                SessionState::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return false;
        }

        drop(self.outbound.lock().take());
        self.closed_tx.send_replace(true);
        self.state
            .store(SessionState::Closed as u8, Ordering::Release);

        tracing::info!(
            "[{}] Session {} closed after {:?}",
            self.remote_addr,
            self.id,
            self.created_at.elapsed()
        );
        true
    }

    /// Resolves once the session has been closed.
    pub async fn closed(&self) {
        let mut rx = self.closed_tx.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Returns whether the session has been inactive longer than its idle
    /// threshold.
    pub fn idle(&self) -> bool {
        self.idle_duration() > self.idle_timeout
    }

    pub fn idle_duration(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    pub fn last_activity(&self) -> Instant {
        *self.last_activity.lock()
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    /// Stores an application value on the session.
    pub fn set_attribute<T>(&self, name: impl Into<String>, value: T)
    where
        T: Any + Send + Sync,
    {
        self.attributes.lock().insert(name.into(), Arc::new(value));
    }

    /// Returns the value stored under `name` if it has type `T`.
    pub fn attribute<T>(&self, name: &str) -> Option<Arc<T>>
    where
        T: Any + Send + Sync,
    {
        let value = self.attributes.lock().get(name).cloned()?;
        value.downcast::<T>().ok()
    }

    pub fn remove_attribute(&self, name: &str) -> bool {
        self.attributes.lock().remove(name).is_some()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("local_addr", &self.local_addr)
            .field("remote_addr", &self.remote_addr)
            .field("state", &self.state())
            .finish()
    }
}

/// Runs one loop, turning a panic into a logged close.
async fn guarded<F>(session: Arc<Session>, name: &'static str, fut: F)
where
    F: Future<Output = ()> + Send,
{
    if let Err(panic) = AssertUnwindSafe(fut).catch_unwind().await {
        tracing::error!(
            "[{}] {} loop panicked: {}",
            session.remote_addr,
            name,
            panic_message(panic.as_ref())
        );
    }
    session.close();
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        *msg
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.as_str()
    } else {
        "unknown panic"
    }
}

async fn read_loop<R>(
    session: Arc<Session>,
    mut reader: R,
    codec: FrameCodec,
    inbound: mpsc::Sender<Frame>,
) where
    R: AsyncRead + Unpin,
{
    let addr = session.remote_addr;
    let mut buf = Buffer::with_capacity(SCRATCH_BUFFER_SIZE);

    loop {
        let result = tokio::select! {
            _ = session.closed() => return,
            result = codec.read(&mut reader, &mut buf) => result,
        };

        match result {
            Ok(Some(frame)) => {
                session.touch();
                tracing::debug!(
                    "[{}] Received frame op={} seq={} ({} bytes)",
                    addr,
                    frame.operation(),
                    frame.sequence(),
                    frame.body.len()
                );
                tokio::select! {
                    _ = session.closed() => return,
                    sent = inbound.send(frame) => {
                        if sent.is_err() {
                            return;
                        }
                    }
                }
            }
            Ok(None) => {
                session.touch();
                tracing::trace!("[{}] Heartbeat", addr);
            }
            Err(e) if e.is_eof() => {
                tracing::debug!("[{}] Connection closed by peer", addr);
                return;
            }
            Err(e) if e.is_framing() => {
                tracing::warn!("[{}] Protocol error, closing: {}", addr, e);
                return;
            }
            Err(e) => {
                tracing::warn!("[{}] Read error: {}", addr, e);
                return;
            }
        }
    }
}

async fn dispatch_loop(
    session: Arc<Session>,
    mut inbound: mpsc::Receiver<Frame>,
    pipeline: Arc<Pipeline>,
) {
    loop {
        let frame = tokio::select! {
            _ = session.closed() => return,
            frame = inbound.recv() => match frame {
                Some(frame) => frame,
                None => return,
            },
        };

        let admission = tokio::select! {
            _ = session.closed() => return,
            admission = pipeline.admission.acquire() => match admission {
                Some(admission) => admission,
                None => return,
            },
        };

        let handler = pipeline.handler.clone();
        let session = session.clone();
        tokio::spawn(async move {
            let fut = handler.handle(session.clone(), frame);
            if let Err(panic) = AssertUnwindSafe(fut).catch_unwind().await {
                tracing::error!(
                    "[{}] Handler panicked: {}",
                    session.remote_addr,
                    panic_message(panic.as_ref())
                );
                session.close();
            }
            drop(admission);
        });
    }
}

async fn write_loop<W>(
    session: Arc<Session>,
    mut writer: W,
    codec: FrameCodec,
    mut outbound: mpsc::Receiver<Frame>,
    linger: Duration,
) where
    W: AsyncWrite + Unpin,
{
    let addr = session.remote_addr;
    let mut buf = Buffer::with_capacity(SCRATCH_BUFFER_SIZE);

    // The sender is dropped on close, so draining ends once the frames
    // already queued are written. A peer that stopped reading gets `linger`.
    let flushed = {
        let drain = drain_queue(&session, &mut writer, &codec, &mut buf, &mut outbound);
        tokio::pin!(drain);
        tokio::select! {
            flushed = &mut drain => flushed,
            _ = session.closed() => match tokio::time::timeout(linger, &mut drain).await {
                Ok(flushed) => flushed,
                Err(_) => {
                    tracing::warn!("[{}] Flush on close timed out after {:?}", addr, linger);
                    false
                }
            },
        }
    };

    if flushed {
        match tokio::time::timeout(linger, writer.shutdown()).await {
            Ok(Err(e)) => tracing::debug!("[{}] Shutdown error: {}", addr, e),
            Err(_) => tracing::debug!("[{}] Shutdown timed out", addr),
            Ok(Ok(())) => {}
        }
    }
}

/// Writes queued frames until the queue closes. Returns `false` on a write error.
async fn drain_queue<W>(
    session: &Session,
    writer: &mut W,
    codec: &FrameCodec,
    buf: &mut Buffer,
    outbound: &mut mpsc::Receiver<Frame>,
) -> bool
where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = outbound.recv().await {
        if let Err(e) = codec.write(writer, buf, &frame).await {
            if e.is_disconnect() {
                tracing::debug!("[{}] Connection lost while writing: {}", session.remote_addr, e);
            } else {
                tracing::warn!("[{}] Write error: {}", session.remote_addr, e);
            }
            return false;
        }
        session.touch();
    }
    true
}
