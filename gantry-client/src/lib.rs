//! # gantry-client
//!
//! Client side of gantry.
//!
//! This crate provides:
//! - A dialing [`Client`] with fire-and-forget sends, correlated requests and
//!   heartbeat pings
//! - A [`Reconnector`] that retries dropped peers on the time wheel
//! - A [`ClientRegistry`] with a sentinel sweep that revives closed clients

pub mod client;
pub mod error;
pub mod reconnect;
pub mod registry;

pub use client::{ping_frame, pong, Client, ClientOptions};
pub use error::ClientError;
pub use reconnect::{Reconnect, Reconnector};
pub use registry::ClientRegistry;
