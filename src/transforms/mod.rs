//! Upstream stream handling.
//!
//! This module provides:
//! - `sse`: Incremental server-sent-event frame decoder
//! - `streaming`: Completion SSE to plain text delta transcoding

pub mod sse;
pub mod streaming;

pub use streaming::transcode;
