//! Pipeline configuration.

use rstream_media_core::channel::{ChannelSet, MASK_STEREO};
use rstream_media_core::latency_monitor::LatencyMonitorConfig;
use rstream_media_core::resampler::{ResamplerBackend, ResamplerProfile};
use rstream_media_core::watchdog::WatchdogConfig;
use rstream_media_core::SampleSpec;
use rstream_rtp_core::fec::{FecReaderConfig, FecScheme, FecWriterConfig};
use rstream_rtp_core::format::PAYLOAD_TYPE_L16_STEREO;
use rstream_rtp_core::rtcp::RtcpConfig;
use rstream_rtp_core::validator::ValidatorConfig;
use rstream_rtp_core::{Nanoseconds, MICROSECOND, MILLISECOND};

/// Default sample rate, Hz.
pub const DEFAULT_SAMPLE_RATE: u32 = 44100;

/// Default sample spec: stereo at the default rate.
pub fn default_sample_spec() -> SampleSpec {
    SampleSpec::new(
        DEFAULT_SAMPLE_RATE,
        ChannelSet::surround(MASK_STEREO).expect("stereo mask is valid"),
    )
    .expect("default spec is valid")
}

/// Default packet length.
///
/// 2.5 ms keeps a 2-channel 16-bit PCM packet under 508 bytes of UDP
/// payload, the size that typically avoids fragmentation on the Internet.
pub const DEFAULT_PACKET_LENGTH: Nanoseconds = 2500 * MICROSECOND;

/// Default target latency. Works on most Wi-Fi networks without being too
/// annoying; many networks allow much less.
pub const DEFAULT_LATENCY: Nanoseconds = 200 * MILLISECOND;

/// Who drives the pipeline's frame clock.
///
/// The pipeline itself is always pulled from outside; this setting tells the
/// embedding pump whether to pace reads/writes with a CPU timer or to rely
/// on the audio device's own blocking cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClockSource {
    /// Pace the pipeline with a CPU timer at the nominal sample rate.
    Internal,
    /// The audio device (or other external driver) paces the pipeline.
    #[default]
    External,
}

/// Task processing parameters of the pipeline loop.
#[derive(Debug, Clone)]
pub struct TaskConfig {
    /// Enable precise task scheduling (default). The remaining settings
    /// apply only when this is set. When enabled, the loop processes tasks
    /// in dedicated intervals between sub-frames and between frames, keeping
    /// task work away from frame deadlines.
    pub enable_precise_task_scheduling: bool,

    /// Minimum processed frame duration between task batches. In-frame task
    /// processing waits until at least this many samples went through. Zero
    /// allows task processing between frames of any size.
    pub min_frame_length_between_tasks: Nanoseconds,

    /// Maximum frame duration processed in one piece. Larger frames are
    /// split into sub-frames so tasks can run in between. Zero disables
    /// splitting.
    pub max_frame_length_between_tasks: Nanoseconds,

    /// Maximum duration of task processing right after a sub-frame. When it
    /// expires with tasks still pending, asynchronous processing is
    /// scheduled instead.
    pub max_inframe_task_processing: Nanoseconds,

    /// Width of the interval around the next frame deadline during which no
    /// task may start. Covers thread switch overhead and scheduler jitter.
    pub task_processing_prohibited_interval: Nanoseconds,
}

impl Default for TaskConfig {
    fn default() -> Self {
        TaskConfig {
            enable_precise_task_scheduling: true,
            min_frame_length_between_tasks: 200 * MICROSECOND,
            max_frame_length_between_tasks: 1 * MILLISECOND,
            max_inframe_task_processing: 20 * MICROSECOND,
            task_processing_prohibited_interval: 200 * MICROSECOND,
        }
    }
}

/// Sender pipeline parameters.
#[derive(Debug, Clone)]
pub struct SenderConfig {
    /// Task processing parameters.
    pub tasks: TaskConfig,

    /// Resampler backend.
    pub resampler_backend: ResamplerBackend,

    /// Resampler profile.
    pub resampler_profile: ResamplerProfile,

    /// FEC writer parameters.
    pub fec_writer: FecWriterConfig,

    /// FEC scheme for new slots, unless the endpoint protocol overrides it.
    pub fec_scheme: FecScheme,

    /// Sample spec of frames written into the sender.
    pub input_sample_spec: SampleSpec,

    /// Nominal duration of emitted packets.
    pub packet_length: Nanoseconds,

    /// RTP payload type for audio packets.
    pub payload_type: u8,

    /// Spread packets pseudo-randomly within a FEC block before sending.
    pub enable_interleaving: bool,

    /// Fill capture timestamps of written frames with the invocation time.
    pub enable_auto_cts: bool,

    /// Who paces the sender's frame clock.
    pub clock_source: ClockSource,

    /// RTCP session parameters.
    pub rtcp: RtcpConfig,
}

impl Default for SenderConfig {
    fn default() -> Self {
        SenderConfig {
            tasks: TaskConfig::default(),
            resampler_backend: ResamplerBackend::default(),
            resampler_profile: ResamplerProfile::default(),
            fec_writer: FecWriterConfig::default(),
            fec_scheme: FecScheme::None,
            input_sample_spec: default_sample_spec(),
            packet_length: DEFAULT_PACKET_LENGTH,
            payload_type: PAYLOAD_TYPE_L16_STEREO,
            enable_interleaving: false,
            enable_auto_cts: false,
            clock_source: ClockSource::default(),
            rtcp: RtcpConfig::default(),
        }
    }
}

/// Per-session receiver parameters.
#[derive(Debug, Clone)]
pub struct ReceiverSessionConfig {
    /// Desired in-queue latency; playback starts once this much is buffered.
    pub target_latency: Nanoseconds,

    /// FEC reader parameters.
    pub fec_reader: FecReaderConfig,

    /// RTP validator parameters.
    pub rtp_validator: ValidatorConfig,

    /// Latency monitor parameters.
    pub latency_monitor: LatencyMonitorConfig,

    /// Watchdog parameters.
    pub watchdog: WatchdogConfig,

    /// Resampler backend.
    pub resampler_backend: ResamplerBackend,

    /// Resampler profile.
    pub resampler_profile: ResamplerProfile,
}

impl Default for ReceiverSessionConfig {
    fn default() -> Self {
        let mut latency_monitor = LatencyMonitorConfig::default();
        latency_monitor.deduce_latency_bounds(DEFAULT_LATENCY);

        ReceiverSessionConfig {
            target_latency: DEFAULT_LATENCY,
            fec_reader: FecReaderConfig::default(),
            rtp_validator: ValidatorConfig::default(),
            latency_monitor,
            watchdog: WatchdogConfig::default(),
            resampler_backend: ResamplerBackend::default(),
            resampler_profile: ResamplerProfile::default(),
        }
    }
}

impl ReceiverSessionConfig {
    /// Keep the derived latency and watchdog settings consistent after
    /// changing the target latency.
    pub fn set_target_latency(&mut self, target_latency: Nanoseconds) {
        self.target_latency = target_latency;
        self.latency_monitor.deduce_latency_bounds(target_latency);
    }
}

/// Receiver parameters common to all sessions.
#[derive(Debug, Clone)]
pub struct ReceiverCommonConfig {
    /// Sample spec of frames read from the receiver.
    pub output_sample_spec: SampleSpec,

    /// Reclock sessions automatically with the invocation time of each read.
    pub enable_auto_reclock: bool,

    /// Insert audible beeps instead of silence on packet loss.
    pub enable_beeping: bool,

    /// Include capture timestamps in output frames.
    pub enable_timestamps: bool,

    /// Who paces the receiver's frame clock.
    pub clock_source: ClockSource,

    /// RTCP session parameters.
    pub rtcp: RtcpConfig,
}

impl Default for ReceiverCommonConfig {
    fn default() -> Self {
        ReceiverCommonConfig {
            output_sample_spec: default_sample_spec(),
            enable_auto_reclock: false,
            enable_beeping: false,
            enable_timestamps: true,
            clock_source: ClockSource::default(),
            rtcp: RtcpConfig::default(),
        }
    }
}

/// Receiver pipeline parameters.
#[derive(Debug, Clone, Default)]
pub struct ReceiverConfig {
    /// Defaults for sessions created on packet arrival.
    pub default_session: ReceiverSessionConfig,

    /// Parameters common to all sessions.
    pub common: ReceiverCommonConfig,

    /// Task processing parameters.
    pub tasks: TaskConfig,
}
