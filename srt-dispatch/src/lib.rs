//! SmartSRT dispatch - queue-backed execution of subtitle conversions.
//!
//! This library provides shared modules for the two binaries:
//! - `srt-web`: HTTP front that publishes jobs and waits for their result
//! - `srt-worker`: worker pool that runs jobs through the conversion function
//!
//! ## Architecture
//!
//! ```text
//! HTTP → Publisher → srt_conversions → Worker Pool → reply queue → Publisher
//!                                          ↓ (timed-out callers)
//!                                       Notifier
//! ```

pub mod broker;
pub mod config;
pub mod consumer;
pub mod error;
pub mod notify;
pub mod processor;
pub mod queue;
pub mod web;

// Re-export commonly used types
pub use broker::{Broker, ChannelPool};
pub use config::Config;
pub use error::DispatchError;
pub use notify::{LogNotifier, Notifier, ResendNotifier};
pub use processor::{HttpProcessor, NotifyingProcessor, Processor};
pub use queue::{ConversionMessage, ConversionParams, LambdaResponse, Publisher};
pub use web::AppState;
