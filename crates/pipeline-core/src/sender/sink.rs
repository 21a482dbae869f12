//! Sender sink: the frame surface the audio device writes into.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, info};

use rstream_media_core::fanout::Fanout;
use rstream_media_core::{Frame, FrameWriter};
use rstream_rtp_core::format::{Format, FormatRegistry};
use rstream_rtp_core::packet::PacketWriter;
use rstream_rtp_core::Nanoseconds;

use crate::config::SenderConfig;
use crate::endpoint::{Interface, Protocol};
use crate::error::Error;
use crate::metrics::{SenderMetrics, SenderSlotMetrics};
use crate::pipeline_loop::{MonotonicClock, PipelineBackend, PipelineClock, PipelineLoop, TaskScheduler};
use crate::sender::slot::SenderSlot;

fn unix_now() -> Nanoseconds {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as Nanoseconds)
        .unwrap_or(0)
}

/// Administrative operations on a sender, executed as pipeline tasks.
pub enum SenderTask {
    /// Create a slot; `slot_id` receives the new slot's id.
    CreateSlot {
        /// Filled with the created slot id.
        slot_id: Option<usize>,
    },
    /// Remove a slot.
    DeleteSlot {
        /// Slot to remove.
        slot_id: usize,
    },
    /// Add an endpoint to a slot.
    AddEndpoint {
        /// Target slot.
        slot_id: usize,
        /// Endpoint interface.
        iface: Interface,
        /// Endpoint protocol.
        proto: Protocol,
        /// Remote address.
        dst_addr: SocketAddr,
        /// Writer provided by the network loop; consumed by the task.
        writer: Option<Box<dyn PacketWriter + Send>>,
    },
    /// Query sender metrics.
    QueryMetrics {
        /// Filled with the current metrics.
        metrics: Option<SenderMetrics>,
    },
}

/// Sender pipeline state: slots and the fan-out.
///
/// Implements [`PipelineBackend`]; wrap it in a [`PipelineLoop`] (see
/// [`SenderLoop`]) to drive it from the real-time thread.
pub struct SenderSink {
    config: SenderConfig,
    format: Format,
    clock: Arc<dyn PipelineClock>,

    slots: Vec<Option<SenderSlot>>,
    fanout: Fanout,
}

impl SenderSink {
    /// Create a sender. Fails if the configured payload type is unknown.
    pub fn new(config: SenderConfig, clock: Arc<dyn PipelineClock>) -> crate::Result<Self> {
        Self::with_registry(config, &FormatRegistry::new(), clock)
    }

    /// Create a sender resolving the payload type from a caller-populated
    /// registry.
    pub fn with_registry(
        config: SenderConfig,
        registry: &FormatRegistry,
        clock: Arc<dyn PipelineClock>,
    ) -> crate::Result<Self> {
        let format = registry
            .find_by_pt(config.payload_type)
            .copied()
            .ok_or_else(|| {
                Error::InvalidArgument(format!(
                    "sender: unknown payload type: {}",
                    config.payload_type
                ))
            })?;

        Ok(SenderSink {
            config,
            format,
            clock,
            slots: Vec::new(),
            fanout: Fanout::new(),
        })
    }

    /// Create a slot.
    pub fn create_slot(&mut self) -> usize {
        let slot = SenderSlot::new(self.config.clone(), self.format);

        let slot_id = match self.slots.iter_mut().position(|s| s.is_none()) {
            Some(free) => {
                self.slots[free] = Some(slot);
                free
            }
            None => {
                self.slots.push(Some(slot));
                self.slots.len() - 1
            }
        };

        info!(slot_id, "sender: slot created");
        slot_id
    }

    /// Remove a slot.
    pub fn delete_slot(&mut self, slot_id: usize) -> bool {
        match self.slots.get_mut(slot_id) {
            Some(slot) if slot.is_some() => {
                *slot = None;
                info!(slot_id, "sender: slot deleted");
                true
            }
            _ => false,
        }
    }

    /// Access a slot by id.
    pub fn slot_mut(&mut self, slot_id: usize) -> Option<&mut SenderSlot> {
        self.slots.get_mut(slot_id).and_then(|slot| slot.as_mut())
    }

    /// Current sender metrics.
    pub fn metrics(&self) -> SenderMetrics {
        SenderMetrics {
            slots: self
                .slots
                .iter()
                .enumerate()
                .filter_map(|(slot_id, slot)| {
                    slot.as_ref().map(|slot| SenderSlotMetrics {
                        slot_id,
                        is_broken: slot.is_broken(),
                        is_complete: slot.is_complete(),
                    })
                })
                .collect(),
        }
    }

    /// Write one frame into every configured slot and drive RTCP.
    pub fn write_frame(&mut self, frame: &Frame<'_>) {
        let now = self.clock.timestamp();
        let report_time = unix_now();

        let mut writers: Vec<&mut dyn FrameWriter> = Vec::new();
        for slot in self.slots.iter_mut().flatten() {
            writers.push(slot);
        }
        self.fanout.write_frame(frame, &mut writers);

        for slot in self.slots.iter_mut().flatten() {
            slot.refresh(now, report_time);
        }
    }
}

impl PipelineBackend for SenderSink {
    type Task = SenderTask;

    fn process_subframe(&mut self, frame: &mut Frame<'_>) -> bool {
        if self.config.enable_auto_cts && frame.capture_timestamp() == 0 {
            frame.set_capture_timestamp(unix_now());
        }

        self.write_frame(frame);
        true
    }

    fn process_task(&mut self, task: &mut SenderTask) -> bool {
        match task {
            SenderTask::CreateSlot { slot_id } => {
                *slot_id = Some(self.create_slot());
                true
            }
            SenderTask::DeleteSlot { slot_id } => self.delete_slot(*slot_id),
            SenderTask::AddEndpoint {
                slot_id,
                iface,
                proto,
                dst_addr,
                writer,
            } => match (self.slot_mut(*slot_id), writer.take()) {
                (Some(slot), Some(writer)) => {
                    match slot.add_endpoint(*iface, *proto, *dst_addr, writer) {
                        Ok(()) => true,
                        Err(err) => {
                            debug!(%err, "sender: add endpoint task failed");
                            false
                        }
                    }
                }
                _ => false,
            },
            SenderTask::QueryMetrics { metrics } => {
                *metrics = Some(self.metrics());
                true
            }
        }
    }
}

/// A sender sink driven by the cooperative pipeline loop.
pub type SenderLoop = PipelineLoop<SenderSink>;

/// Build a sender loop with the default monotonic clock.
pub fn new_sender_loop(
    config: SenderConfig,
    scheduler: Box<dyn TaskScheduler>,
) -> crate::Result<SenderLoop> {
    let clock: Arc<dyn PipelineClock> = Arc::new(MonotonicClock::default());
    let tasks = config.tasks.clone();
    let sample_spec = config.input_sample_spec;
    let sink = SenderSink::new(config, clock.clone())?;

    struct ArcClock(Arc<dyn PipelineClock>);
    impl PipelineClock for ArcClock {
        fn timestamp(&self) -> Nanoseconds {
            self.0.timestamp()
        }
    }

    Ok(PipelineLoop::new(
        sink,
        tasks,
        sample_spec,
        Box::new(ArcClock(clock)),
        scheduler,
    ))
}
