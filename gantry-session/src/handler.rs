//! Application handler capability.

use crate::session::Session;
use futures::future::BoxFuture;
use gantry_protocol::Frame;
use std::future::Future;
use std::sync::Arc;

/// Handles one inbound frame.
///
/// Invoked on its own task while holding an admission slot, so it may call
/// [`Session::write`] freely but should not wait indefinitely.
pub trait FrameHandler: Send + Sync + 'static {
    fn handle(&self, session: Arc<Session>, frame: Frame) -> BoxFuture<'static, ()>;
}

impl<F, Fut> FrameHandler for F
where
    F: Fn(Arc<Session>, Frame) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn handle(&self, session: Arc<Session>, frame: Frame) -> BoxFuture<'static, ()> {
        Box::pin(self(session, frame))
    }
}

/// Writes every frame straight back to its sender.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoHandler;

impl FrameHandler for EchoHandler {
    fn handle(&self, session: Arc<Session>, frame: Frame) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            if let Err(e) = session.write(frame) {
                tracing::debug!("[{}] Echo dropped: {}", session.remote_addr(), e);
            }
        })
    }
}

/// Drops every frame.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiscardHandler;

impl FrameHandler for DiscardHandler {
    fn handle(&self, _session: Arc<Session>, _frame: Frame) -> BoxFuture<'static, ()> {
        Box::pin(async {})
    }
}
