//! Broker connection management.
//!
//! This module provides:
//! - `Broker`: the single connection, its control channel, reconnect supervision
//!   and the worker registry
//! - `ChannelPool`: fixed-capacity pool of prefetch=1 consumption channels

pub mod connection;
pub mod pool;

pub use connection::Broker;
pub use pool::{ChannelPool, PooledChannel};
