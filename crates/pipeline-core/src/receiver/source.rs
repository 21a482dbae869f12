//! Receiver source: the frame surface the audio device reads from.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, info};

use rstream_media_core::mixer::Mixer;
use rstream_media_core::{Frame, FrameReader};
use rstream_rtp_core::format::FormatRegistry;
use rstream_rtp_core::packet::PacketWriter;
use rstream_rtp_core::Nanoseconds;

use crate::config::ReceiverConfig;
use crate::endpoint::{InboundQueue, Interface, Protocol};
use crate::metrics::{ReceiverMetrics, ReceiverSlotMetrics};
use crate::pipeline_loop::{MonotonicClock, PipelineBackend, PipelineClock, PipelineLoop, TaskScheduler};
use crate::receiver::slot::ReceiverSlot;

/// Wall-clock time, nanoseconds since the Unix epoch.
fn unix_now() -> Nanoseconds {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as Nanoseconds)
        .unwrap_or(0)
}

/// Administrative operations on a receiver, executed as pipeline tasks.
///
/// Output fields are filled by the task and read back by the completer (or
/// the `schedule_and_wait` caller).
pub enum ReceiverTask {
    /// Create a slot; `slot_id` receives the new slot's id.
    CreateSlot {
        /// Filled with the created slot id.
        slot_id: Option<usize>,
    },
    /// Remove a slot and all its sessions.
    DeleteSlot {
        /// Slot to remove.
        slot_id: usize,
    },
    /// Add an endpoint to a slot; `queue` receives the inbound queue.
    AddEndpoint {
        /// Target slot.
        slot_id: usize,
        /// Endpoint interface.
        iface: Interface,
        /// Endpoint protocol.
        proto: Protocol,
        /// Filled with the queue the network loop feeds.
        queue: Option<InboundQueue>,
    },
    /// Attach an outbound control writer to a slot (for receiver reports).
    SetControlOutput {
        /// Target slot.
        slot_id: usize,
        /// Remote control address.
        dst_addr: std::net::SocketAddr,
        /// Writer provided by the network loop; consumed by the task.
        writer: Option<Box<dyn PacketWriter + Send>>,
    },
    /// Query receiver metrics.
    QueryMetrics {
        /// Filled with the current metrics.
        metrics: Option<ReceiverMetrics>,
    },
}

/// Receiver pipeline state: slots, sessions, and the mixer.
///
/// Implements [`PipelineBackend`]; wrap it in a [`PipelineLoop`] (see
/// [`ReceiverLoop`]) to drive it from the real-time thread.
pub struct ReceiverSource {
    config: ReceiverConfig,
    registry: Arc<FormatRegistry>,
    clock: Arc<dyn PipelineClock>,

    slots: Vec<Option<ReceiverSlot>>,
    mixer: Mixer,
}

impl ReceiverSource {
    /// Create a receiver with the default payload formats registered.
    pub fn new(config: ReceiverConfig, clock: Arc<dyn PipelineClock>) -> Self {
        Self::with_registry(config, Arc::new(FormatRegistry::new()), clock)
    }

    /// Create a receiver with a caller-populated format registry.
    pub fn with_registry(
        config: ReceiverConfig,
        registry: Arc<FormatRegistry>,
        clock: Arc<dyn PipelineClock>,
    ) -> Self {
        let mixer = Mixer::new(config.common.enable_timestamps);

        ReceiverSource {
            config,
            registry,
            clock,
            slots: Vec::new(),
            mixer,
        }
    }

    /// Create a slot.
    pub fn create_slot(&mut self) -> usize {
        let slot = ReceiverSlot::new(
            self.config.default_session.clone(),
            self.config.common.clone(),
            self.registry.clone(),
        );

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

        info!(slot_id, "receiver: slot created");
        slot_id
    }

    /// Remove a slot with all its endpoints and sessions.
    pub fn delete_slot(&mut self, slot_id: usize) -> bool {
        match self.slots.get_mut(slot_id) {
            Some(slot) if slot.is_some() => {
                *slot = None;
                info!(slot_id, "receiver: slot deleted");
                true
            }
            _ => false,
        }
    }

    /// Access a slot by id.
    pub fn slot_mut(&mut self, slot_id: usize) -> Option<&mut ReceiverSlot> {
        self.slots.get_mut(slot_id).and_then(|slot| slot.as_mut())
    }

    /// Total number of live sessions across all slots.
    pub fn num_sessions(&self) -> usize {
        self.slots
            .iter()
            .flatten()
            .map(|slot| slot.group().num_sessions())
            .sum()
    }

    /// Current receiver metrics.
    pub fn metrics(&self) -> ReceiverMetrics {
        ReceiverMetrics {
            slots: self
                .slots
                .iter()
                .enumerate()
                .filter_map(|(slot_id, slot)| {
                    slot.as_ref().map(|slot| ReceiverSlotMetrics {
                        slot_id,
                        is_broken: slot.is_broken(),
                        num_sessions: slot.group().num_sessions(),
                        sessions: slot.group().session_metrics(),
                    })
                })
                .collect(),
        }
    }

    /// Read the next mixed frame. Drives endpoint draining, session
    /// lifecycle and RTCP on the way.
    pub fn read_frame(&mut self, frame: &mut Frame<'_>) -> bool {
        let now = self.clock.timestamp();

        for slot in self.slots.iter_mut().flatten() {
            slot.refresh(now);
        }

        let mut readers: Vec<&mut dyn FrameReader> = Vec::new();
        for slot in self.slots.iter_mut().flatten() {
            slot.collect_readers(&mut readers);
        }

        let ok = self.mixer.read_frame(frame, &mut readers);

        if self.config.common.enable_auto_reclock {
            let playback = unix_now();
            for slot in self.slots.iter_mut().flatten() {
                slot.reclock_sessions(playback);
            }
        }

        ok
    }

    /// Update the end-to-end latency of all sessions from the playback time
    /// of the last delivered frame.
    pub fn reclock(&mut self, playback_ts: Nanoseconds) {
        for slot in self.slots.iter_mut().flatten() {
            slot.reclock_sessions(playback_ts);
        }
    }
}

impl PipelineBackend for ReceiverSource {
    type Task = ReceiverTask;

    fn process_subframe(&mut self, frame: &mut Frame<'_>) -> bool {
        self.read_frame(frame)
    }

    fn process_task(&mut self, task: &mut ReceiverTask) -> bool {
        match task {
            ReceiverTask::CreateSlot { slot_id } => {
                *slot_id = Some(self.create_slot());
                true
            }
            ReceiverTask::DeleteSlot { slot_id } => self.delete_slot(*slot_id),
            ReceiverTask::AddEndpoint {
                slot_id,
                iface,
                proto,
                queue,
            } => match self.slot_mut(*slot_id) {
                Some(slot) => match slot.add_endpoint(*iface, *proto) {
                    Ok(inbound) => {
                        *queue = Some(inbound);
                        true
                    }
                    Err(err) => {
                        debug!(%err, "receiver: add endpoint task failed");
                        false
                    }
                },
                None => false,
            },
            ReceiverTask::SetControlOutput {
                slot_id,
                dst_addr,
                writer,
            } => match (self.slot_mut(*slot_id), writer.take()) {
                (Some(slot), Some(writer)) => {
                    slot.set_control_output(*dst_addr, writer);
                    true
                }
                _ => false,
            },
            ReceiverTask::QueryMetrics { metrics } => {
                *metrics = Some(self.metrics());
                true
            }
        }
    }
}

/// A receiver source driven by the cooperative pipeline loop.
pub type ReceiverLoop = PipelineLoop<ReceiverSource>;

/// Build a receiver loop with the default monotonic clock.
pub fn new_receiver_loop(
    config: ReceiverConfig,
    scheduler: Box<dyn TaskScheduler>,
) -> ReceiverLoop {
    let clock: Arc<dyn PipelineClock> = Arc::new(MonotonicClock::default());
    let tasks = config.tasks.clone();
    let sample_spec = config.common.output_sample_spec;
    let source = ReceiverSource::new(config, clock.clone());

    struct ArcClock(Arc<dyn PipelineClock>);
    impl PipelineClock for ArcClock {
        fn timestamp(&self) -> Nanoseconds {
            self.0.timestamp()
        }
    }

    PipelineLoop::new(
        source,
        tasks,
        sample_spec,
        Box::new(ArcClock(clock)),
        scheduler,
    )
}
