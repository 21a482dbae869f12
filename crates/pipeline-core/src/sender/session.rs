//! Sender transport pipeline.

use std::sync::{Arc, Mutex};

use tracing::debug;

use rstream_media_core::channel_mapper::ChannelMapperWriter;
use rstream_media_core::packetizer::Packetizer;
use rstream_media_core::resampler::{new_resampler, ResamplerWriter};
use rstream_media_core::{Frame, FrameWriter, SampleSpec};
use rstream_rtp_core::fec::{BlockWriter, FecScheme, FecWriterConfig};
use rstream_rtp_core::format::Format;
use rstream_rtp_core::packet::{Interleaver, PacketFlags, PacketWriter, Router};
use rstream_rtp_core::rtcp::{ReportBlock, SenderHooks, SendingMetrics};
use rstream_rtp_core::timestamps::TimestampExtractor;
use rstream_rtp_core::Nanoseconds;

use crate::config::SenderConfig;
use crate::error::Result;
use crate::receiver::session::format_channel_set;

type PacketSink = Box<dyn PacketWriter + Send>;
type SharedExtractor = Arc<Mutex<TimestampExtractor<PacketSink>>>;
type FrameSink = Box<dyn FrameWriter + Send>;

/// The sender's frame-to-packets pipeline for one slot.
///
/// Frames flow through optional resampling and channel mapping into the
/// packetizer; packets then pass the capture-time extractor, the FEC writer
/// (with optional interleaving), and a router that fans source and repair
/// streams out to their endpoints.
pub struct SenderSession {
    writer: FrameSink,
    extractor: SharedExtractor,
}

impl SenderSession {
    /// Build the pipeline writing into the given endpoints.
    pub fn new(
        config: &SenderConfig,
        format: Format,
        fec_scheme: FecScheme,
        source_endpoint: PacketSink,
        repair_endpoint: Option<PacketSink>,
    ) -> Result<Self> {
        let format_spec = SampleSpec::new(format.clock_rate, format_channel_set(&format)?)?;
        let input_spec = config.input_sample_spec;

        let mut router = Router::new();
        router.add_route(PacketFlags::AUDIO, source_endpoint);
        let has_repair = repair_endpoint.is_some();
        if let Some(repair_endpoint) = repair_endpoint {
            router.add_route(PacketFlags::REPAIR, repair_endpoint);
        }

        let mut pwriter: PacketSink = Box::new(router);

        if has_repair && fec_scheme != FecScheme::None {
            if config.enable_interleaving {
                let window = config.fec_writer.n_source_packets
                    + config.fec_writer.n_repair_packets;
                pwriter = Box::new(Interleaver::new(pwriter, window));
            }

            let fec_config = FecWriterConfig {
                repair_payload_type: repair_payload_type(fec_scheme),
                ..config.fec_writer.clone()
            };
            pwriter = Box::new(BlockWriter::new(pwriter, fec_scheme, fec_config)?);
        }

        let extractor = Arc::new(Mutex::new(TimestampExtractor::new(
            pwriter,
            format.clock_rate,
        )));
        let pwriter: PacketSink = Box::new(extractor.clone());

        let packetizer = Packetizer::new(
            pwriter,
            format.new_encoder(),
            format_spec,
            config.packet_length,
            format.payload_type,
        )?;

        let mut awriter: FrameSink = Box::new(packetizer);

        if input_spec.channel_set() != format_spec.channel_set() {
            let mapper_in = SampleSpec::new(format.clock_rate, input_spec.channel_set())?;
            awriter = Box::new(ChannelMapperWriter::new(awriter, mapper_in, format_spec));
        }

        if input_spec.sample_rate() != format_spec.sample_rate() {
            let resampler_out =
                SampleSpec::new(format.clock_rate, input_spec.channel_set())?;
            let backend = new_resampler(
                config.resampler_backend,
                config.resampler_profile,
                &input_spec,
                &resampler_out,
            );
            awriter = Box::new(ResamplerWriter::new(
                awriter,
                backend,
                input_spec,
                resampler_out,
            ));
        }

        debug!(
            payload_type = format.payload_type,
            fec = %fec_scheme,
            has_repair,
            "sender session: transport pipeline created"
        );

        Ok(SenderSession {
            writer: awriter,
            extractor,
        })
    }

    /// True once outgoing packets established a capture-time anchor.
    pub fn has_mapping(&self) -> bool {
        self.extractor.lock().unwrap().has_mapping()
    }
}

impl FrameWriter for SenderSession {
    fn write_frame(&mut self, frame: &Frame<'_>) {
        self.writer.write_frame(frame);
    }
}

impl SenderHooks for SenderSession {
    fn query_sending_metrics(&mut self, report_time: Nanoseconds) -> Option<SendingMetrics> {
        let origin_rtp = self.extractor.lock().unwrap().mapping_at(report_time)?;
        Some(SendingMetrics {
            origin_time: report_time,
            origin_rtp,
        })
    }

    fn notify_reception_report(&mut self, report: ReportBlock) {
        debug!(
            ssrc = report.ssrc,
            fraction_lost = report.fraction_lost,
            "sender session: reception report"
        );
    }
}

fn repair_payload_type(scheme: FecScheme) -> u8 {
    match scheme {
        FecScheme::LdpcStaircase => rstream_rtp_core::fec::PAYLOAD_TYPE_LDPC_REPAIR,
        _ => rstream_rtp_core::fec::PAYLOAD_TYPE_RS8M_REPAIR,
    }
}
