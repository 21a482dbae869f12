//! Audio-domain core for the rstream media toolkit.
//!
//! This crate implements the frame side of the pipeline: sample and channel
//! algebra, frames over borrowed sample storage, the gap-filling
//! depacketizer, channel mapping, asynchronous resampling with closed-loop
//! latency control, mixing and fan-out, packetization, and the session
//! watchdog.
//!
//! The packet side lives in `rstream-rtp-core`; pipeline assembly and
//! scheduling live in `rstream-pipeline-core`.

pub mod channel;
pub mod channel_mapper;
pub mod depacketizer;
pub mod error;
pub mod fanout;
pub mod frame;
pub mod freq_estimator;
pub mod latency_monitor;
pub mod mixer;
pub mod packetizer;
pub mod resampler;
pub mod sample;
pub mod watchdog;

pub use channel::{ChannelLayout, ChannelSet};
pub use error::{Error, Result};
pub use frame::{Frame, FrameFlags, FrameReader, FrameWriter};
pub use sample::SampleSpec;

/// Audio sample: 32-bit float, nominal range `[-1.0; 1.0]`.
pub type Sample = f32;

/// Maximum sample value.
pub const SAMPLE_MAX: Sample = 1.0;

/// Minimum sample value.
pub const SAMPLE_MIN: Sample = -1.0;
