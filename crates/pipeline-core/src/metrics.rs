//! Pipeline metrics.

use rstream_media_core::latency_monitor::LatencyMetrics;

/// Metrics of one receiver slot.
#[derive(Debug, Clone, Default)]
pub struct ReceiverSlotMetrics {
    /// Slot id.
    pub slot_id: usize,
    /// True once a configuration call failed.
    pub is_broken: bool,
    /// Number of live sessions.
    pub num_sessions: usize,
    /// Latency measurements per session.
    pub sessions: Vec<LatencyMetrics>,
}

/// Metrics of a receiver pipeline.
#[derive(Debug, Clone, Default)]
pub struct ReceiverMetrics {
    /// Per-slot metrics, live slots only.
    pub slots: Vec<ReceiverSlotMetrics>,
}

/// Metrics of one sender slot.
#[derive(Debug, Clone, Default)]
pub struct SenderSlotMetrics {
    /// Slot id.
    pub slot_id: usize,
    /// True once a configuration call failed.
    pub is_broken: bool,
    /// True once the slot's endpoint set is complete and the transport
    /// pipeline exists.
    pub is_complete: bool,
}

/// Metrics of a sender pipeline.
#[derive(Debug, Clone, Default)]
pub struct SenderMetrics {
    /// Per-slot metrics, live slots only.
    pub slots: Vec<SenderSlotMetrics>,
}
