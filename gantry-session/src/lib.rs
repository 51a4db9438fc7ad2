//! # gantry-session
//!
//! Session engine for gantry.
//!
//! This crate provides:
//! - Per-connection sessions running read, dispatch and write loops over
//!   bounded queues
//! - Server-wide admission control for handler tasks
//! - Opaque-ID request/response correlation with time-wheel timeouts
//! - Socket setup, configuration loading and a TCP server

pub mod admission;
pub mod config;
pub mod correlation;
pub mod error;
pub mod handler;
pub mod server;
pub mod session;
pub mod socket;
pub mod wheel;

pub use admission::{Admission, AdmissionPool};
pub use config::{
    Config, ConfigError, CorrelationConfig, FramingConfig, NetworkConfig, ReconnectConfig,
    SessionConfig,
};
pub use correlation::{waiter, Correlator, Responder, Waiter};
pub use error::{CorrelationError, SessionError};
pub use handler::{DiscardHandler, EchoHandler, FrameHandler};
pub use server::{Server, ServerConfig, ServerStats};
pub use session::{Pipeline, Session, SessionOptions, SessionState};
pub use socket::SocketOptions;
pub use wheel::{TimeWheel, TimerId};
