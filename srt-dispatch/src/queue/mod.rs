//! Queue module for RabbitMQ operations.
//!
//! This module provides:
//! - Message types for the work queue and the reply queues
//! - The publisher, with a synchronous request/reply mode
//!
//! ## Architecture
//!
//! ```text
//! HTTP → Publisher → srt_conversions queue → Worker → reply queue → Publisher
//! ```

pub mod publisher;
pub mod reply;
pub mod types;

pub use publisher::Publisher;
pub use reply::{await_reply, Reply, Waited};
pub use types::{
    ConversionMessage, ConversionParams, LambdaBody, LambdaResponse, ACCEPTED_MESSAGE,
    RETRY_LATER_MESSAGE, STATUS_ACCEPTED, STATUS_FAILED, STATUS_OK,
};
