//! Web server module for the synchronous conversion endpoint.
//!
//! This module provides a thin HTTP front that:
//! - Validates the upload parameters
//! - Publishes the job and waits for its result, bounded by the RPC timeout
//! - Answers 202 when the job outlives the wait
//!
//! The conversion itself happens in the worker pool.

pub mod handlers;
pub mod params;

pub use handlers::{convert, health, AppState, HealthResponse, MessageResponse};
pub use params::{validate, ConvertQuery, ValidConvert};
