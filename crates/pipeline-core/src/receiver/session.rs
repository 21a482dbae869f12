//! Per-remote-sender receiver session.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use rstream_media_core::channel::{ChannelSet, MASK_MONO, MASK_STEREO};
use rstream_media_core::channel_mapper::ChannelMapperReader;
use rstream_media_core::depacketizer::Depacketizer;
use rstream_media_core::latency_monitor::{LatencyMetrics, LatencyMonitor};
use rstream_media_core::resampler::{new_resampler, ResamplerReader};
use rstream_media_core::watchdog::Watchdog;
use rstream_media_core::{Frame, FrameReader, SampleSpec};
use rstream_rtp_core::fec::{BlockReader, FecScheme};
use rstream_rtp_core::format::Format;
use rstream_rtp_core::packet::queue::{shared_queue, SharedQueue};
use rstream_rtp_core::packet::{
    DelayedReader, Packet, PacketFlags, PacketReader, PacketWriter, Router,
};
use rstream_rtp_core::populator::Populator;
use rstream_rtp_core::timestamps::{MappingUpdater, TimestampInjector};
use rstream_rtp_core::validator::Validator;
use rstream_rtp_core::{units, Nanoseconds, SourceId};

use crate::config::{ReceiverCommonConfig, ReceiverSessionConfig};
use crate::error::{Error, Result};

type PacketChain = Box<dyn PacketReader + Send>;
type SharedDepacketizer = Arc<Mutex<Depacketizer<PacketChain>>>;
type SharedWatchdog = Arc<Mutex<Watchdog<SharedDepacketizer>>>;
type FrameChain = Box<dyn FrameReader + Send>;

/// Channel set implied by a payload format.
pub(crate) fn format_channel_set(format: &Format) -> Result<ChannelSet> {
    let set = match format.channels {
        1 => ChannelSet::surround(MASK_MONO),
        2 => ChannelSet::surround(MASK_STEREO),
        n => ChannelSet::multitrack(n),
    };
    set.map_err(|err| Error::ConstructionFailed(err.to_string()))
}

/// One sender's pipeline inside a receiver slot.
///
/// Assembled on demand when the first packet of an unknown stream arrives;
/// the chain is source queue, validation, population, the initial-latency
/// gate, optional FEC recovery (followed by a second validation pass over
/// restored packets), timestamp injection, depacketization, channel mapping,
/// and resampling under latency control.
pub struct ReceiverSession {
    src_addr: Option<SocketAddr>,
    source_id: SourceId,

    router: Router,
    source_queue: SharedQueue,
    depacketizer: SharedDepacketizer,
    watchdog: SharedWatchdog,
    mapping: MappingUpdater,

    resampler: Option<ResamplerReader<FrameChain>>,
    plain_reader: Option<FrameChain>,
    monitor: LatencyMonitor,

    out_channels: usize,
}

impl ReceiverSession {
    /// Build the session pipeline. Any failing step aborts cleanly.
    pub fn new(
        config: &ReceiverSessionConfig,
        common: &ReceiverCommonConfig,
        format: Format,
        fec_scheme: FecScheme,
        src_addr: Option<SocketAddr>,
        source_id: SourceId,
    ) -> Result<Self> {
        let in_spec = SampleSpec::new(format.clock_rate, format_channel_set(&format)?)?;
        let out_spec = common.output_sample_spec;

        let mut router = Router::new();

        let source_queue = shared_queue(0);
        router.add_route(PacketFlags::AUDIO, Box::new(source_queue.clone()));

        let validator = Validator::new(
            source_queue.clone(),
            config.rtp_validator.clone(),
            format.clock_rate,
        );
        let populator = Populator::new(validator, format);

        let target_ticks = in_spec.ns_to_rtp_timestamp(config.target_latency);
        if target_ticks <= 0 {
            return Err(Error::ConstructionFailed(format!(
                "receiver session: bad target latency: {}",
                config.target_latency
            )));
        }
        let delayed = DelayedReader::new(populator, target_ticks as u32);

        let mut preader: PacketChain = Box::new(delayed);

        if fec_scheme != FecScheme::None {
            let repair_queue = shared_queue(0);
            router.add_route(PacketFlags::REPAIR, Box::new(repair_queue.clone()));

            let fec_reader = BlockReader::new(
                preader,
                repair_queue,
                fec_scheme,
                config.fec_reader.clone(),
            );

            // Restored packets did not pass the first validation pass.
            let fec_validator = Validator::new(
                fec_reader,
                config.rtp_validator.clone(),
                format.clock_rate,
            );
            let fec_populator = Populator::new(fec_validator, format);
            preader = Box::new(fec_populator);
        }

        let injector = TimestampInjector::new(preader, format.clock_rate);
        let mapping = injector.mapping_updater();

        let depacketizer = Arc::new(Mutex::new(Depacketizer::new(
            Box::new(injector) as PacketChain,
            format.new_decoder(),
            in_spec,
            common.enable_beeping,
        )));

        let watchdog = Arc::new(Mutex::new(Watchdog::new(
            depacketizer.clone(),
            in_spec,
            &config.watchdog,
        )));

        let mut areader: FrameChain = Box::new(watchdog.clone());

        if in_spec.channel_set() != out_spec.channel_set() {
            let mapped_spec = SampleSpec::new(format.clock_rate, out_spec.channel_set())?;
            areader = Box::new(ChannelMapperReader::new(areader, in_spec, mapped_spec));
        }

        let monitor =
            LatencyMonitor::new(config.latency_monitor.clone(), config.target_latency, in_spec)?;

        let needs_resampler = config.latency_monitor.fe_enable
            || in_spec.sample_rate() != out_spec.sample_rate();

        let (resampler, plain_reader) = if needs_resampler {
            let resampler_in = SampleSpec::new(format.clock_rate, out_spec.channel_set())?;
            let backend = new_resampler(
                config.resampler_backend,
                config.resampler_profile,
                &resampler_in,
                &out_spec,
            );
            (
                Some(ResamplerReader::new(areader, backend, resampler_in, out_spec)),
                None,
            )
        } else {
            (None, Some(areader))
        };

        debug!(
            source_id,
            payload_type = format.payload_type,
            fec = %fec_scheme,
            "receiver session: created"
        );

        Ok(ReceiverSession {
            src_addr,
            source_id,
            router,
            source_queue,
            depacketizer,
            watchdog,
            mapping,
            resampler,
            plain_reader,
            monitor,
            out_channels: out_spec.num_channels(),
        })
    }

    /// Primary (source stream) SSRC of the session.
    pub fn source_id(&self) -> SourceId {
        self.source_id
    }

    /// Route a packet into the session, if it belongs here.
    ///
    /// Packets match by transport source address when available, falling
    /// back to stream id routing otherwise.
    pub fn handle_packet(&mut self, packet: &Packet) -> bool {
        match (&packet.udp, self.src_addr) {
            (Some(udp), Some(addr)) => {
                if udp.src_addr != addr {
                    return false;
                }
            }
            _ => {
                if !self.router.accepts(packet.flags(), packet.source()) {
                    return false;
                }
            }
        }

        self.router.write_packet(packet.clone());
        true
    }

    /// True while the watchdog and the latency monitor consider the session
    /// usable.
    pub fn is_alive(&self) -> bool {
        self.watchdog.lock().unwrap().is_alive() && self.monitor.is_alive()
    }

    /// Install an RTCP capture-time mapping.
    pub fn update_mapping(&mut self, capture_ts: Nanoseconds, rtp_ts: u32) {
        self.mapping.update_mapping(capture_ts, rtp_ts);
    }

    /// Update the end-to-end latency from the playback time of the last
    /// returned frame.
    pub fn reclock(&mut self, playback_ts: Nanoseconds) {
        self.monitor.reclock(playback_ts);
    }

    /// Latency measurements of the session.
    pub fn metrics(&self) -> LatencyMetrics {
        self.monitor.metrics()
    }

    fn niq_latency(&self) -> Option<i32> {
        let depacketizer = self.depacketizer.lock().unwrap();
        if !depacketizer.is_started() {
            return None;
        }
        let head = depacketizer.next_timestamp();
        drop(depacketizer);

        let queue = self.source_queue.lock().unwrap();
        let tail = queue.latest()?.end();

        Some(units::timestamp_diff(tail, head))
    }
}

impl FrameReader for ReceiverSession {
    fn read_frame(&mut self, frame: &mut Frame<'_>) -> bool {
        if !self.monitor.is_alive() {
            return false;
        }

        if let Some(scaling) = self.monitor.update(self.niq_latency()) {
            if let Some(resampler) = self.resampler.as_mut() {
                if !resampler.set_scaling(scaling) {
                    warn!(scaling, "receiver session: resampler rejected scaling");
                    self.monitor.kill();
                    return false;
                }
            }
        }

        let ok = match (self.resampler.as_mut(), self.plain_reader.as_mut()) {
            (Some(resampler), _) => resampler.read_frame(frame),
            (None, Some(reader)) => reader.read_frame(frame),
            (None, None) => false,
        };
        if !ok {
            return false;
        }

        self.monitor.advance_stream(
            frame.num_samples() / self.out_channels,
            frame.capture_timestamp(),
        );

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_sample_spec;
    use rstream_media_core::frame::FrameFlags;
    use rstream_rtp_core::format::PAYLOAD_TYPE_L16_STEREO;
    use rstream_rtp_core::packet::Rtp;

    fn format() -> Format {
        Format {
            payload_type: PAYLOAD_TYPE_L16_STEREO,
            clock_rate: 44100,
            channels: 2,
        }
    }

    fn session_config(latency_samples: u32) -> ReceiverSessionConfig {
        let mut config = ReceiverSessionConfig::default();
        config.set_target_latency(
            latency_samples as i64 * rstream_rtp_core::SECOND / 44100,
        );
        config
    }

    fn make_packet(seqnum: u16, timestamp: u32, n_samples: usize) -> Packet {
        let mut encoder = format().new_encoder();
        encoder.begin(n_samples);
        let samples = vec![0.5f32; n_samples * 2];
        encoder.write(&samples);
        let payload = encoder.end();

        let mut packet = Packet::new();
        packet.rtp = Some(Rtp {
            source: 0xabc,
            seqnum,
            timestamp,
            payload_type: PAYLOAD_TYPE_L16_STEREO,
            payload,
            ..Default::default()
        });
        packet.add_flags(PacketFlags::RTP | PacketFlags::AUDIO);
        packet
    }

    fn read(session: &mut ReceiverSession, n_samples: usize) -> (Vec<f32>, FrameFlags) {
        let mut buf = vec![0.0f32; n_samples];
        let mut frame = Frame::new(&mut buf);
        assert!(session.read_frame(&mut frame));
        let flags = frame.flags();
        (buf, flags)
    }

    #[test]
    fn test_plays_after_latency_gate() {
        let common = ReceiverCommonConfig {
            output_sample_spec: default_sample_spec(),
            ..Default::default()
        };
        let mut session = ReceiverSession::new(
            &session_config(200),
            &common,
            format(),
            FecScheme::None,
            None,
            0xabc,
        )
        .unwrap();

        // 100 samples buffered: gate still closed, output is silent.
        assert!(session.handle_packet(&make_packet(0, 1000, 100)));
        let (samples, _) = read(&mut session, 200);
        assert!(samples.iter().all(|&s| s == 0.0));

        // Another 100 samples open the gate; keep feeding roughly as fast
        // as we read, and the packet audio must surface in the output.
        let mut next_sn = 1u16;
        let mut next_ts = 1100u32;
        let mut found = false;
        for _ in 0..10 {
            for _ in 0..2 {
                assert!(session.handle_packet(&make_packet(next_sn, next_ts, 100)));
                next_sn += 1;
                next_ts += 100;
            }

            let (samples, flags) = read(&mut session, 400);
            if flags.contains(FrameFlags::NONBLANK)
                && samples.iter().any(|&s| (s - 0.5).abs() < 1e-2)
            {
                found = true;
                break;
            }
        }
        assert!(found, "decoded audio never reached the output");
    }

    #[test]
    fn test_rejects_foreign_stream() {
        let common = ReceiverCommonConfig::default();
        let mut session = ReceiverSession::new(
            &session_config(100),
            &common,
            format(),
            FecScheme::None,
            None,
            0xabc,
        )
        .unwrap();

        assert!(session.handle_packet(&make_packet(0, 0, 100)));

        let mut foreign = make_packet(1, 100, 100);
        foreign.rtp.as_mut().unwrap().source = 0xdef;
        assert!(!session.handle_packet(&foreign));
    }
}
