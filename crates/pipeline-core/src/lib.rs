//! Pipeline assembly for the rstream media toolkit.
//!
//! This crate wires the packet-domain and audio-domain stages into complete
//! sender and receiver pipelines: per-remote-peer sessions, endpoint slots,
//! and the cooperative [`PipelineLoop`](pipeline_loop::PipelineLoop) that
//! interleaves real-time frame processing with administrative tasks.

pub mod config;
pub mod endpoint;
pub mod error;
pub mod metrics;
pub mod pipeline_loop;
pub mod receiver;
pub mod sender;

pub use config::{ReceiverConfig, SenderConfig, TaskConfig};
pub use error::{Error, Result};
pub use pipeline_loop::{PipelineLoop, TaskScheduler};
