//! RTCP session: periodic report exchange.

use bytes::Bytes;
use rand::Rng;
use tracing::{debug, warn};

use super::{
    CompoundPacket, NtpTimestamp, ReceiverReport, ReportBlock, SenderReport,
    SendingMetrics, SourceDescription,
};
use crate::packet::{Packet, PacketFlags, Rtcp};
use crate::{Nanoseconds, SourceId};

/// RTCP session parameters.
#[derive(Debug, Clone)]
pub struct RtcpConfig {
    /// Interval between generated reports, nanoseconds.
    pub report_interval: Nanoseconds,

    /// CNAME included in outgoing source descriptions.
    pub cname: String,
}

impl Default for RtcpConfig {
    fn default() -> Self {
        RtcpConfig {
            report_interval: crate::SECOND,
            cname: "rstream".to_string(),
        }
    }
}

/// Hooks the receiver pipeline exposes to its RTCP session.
pub trait ReceiverHooks {
    /// A sender report delivered a capture-time anchor for a stream.
    fn notify_sending_metrics(&mut self, ssrc: SourceId, metrics: SendingMetrics);

    /// Reception statistics for outgoing receiver reports.
    fn query_reception_reports(&mut self) -> Vec<ReportBlock>;
}

/// Hooks the sender pipeline exposes to its RTCP session.
pub trait SenderHooks {
    /// Capture-time anchor for an outgoing sender report.
    fn query_sending_metrics(&mut self, report_time: Nanoseconds)
        -> Option<SendingMetrics>;

    /// A receiver report arrived for our stream.
    fn notify_reception_report(&mut self, report: ReportBlock);
}

/// Periodic SR/RR/SDES exchange for one slot.
///
/// The session is passive: the owning pipeline asks for the next generation
/// deadline, calls a `generate_*` method when it passes, and feeds incoming
/// control packets to a `process_*` method. Reports carry wall-clock time;
/// deadlines use the pipeline's monotonic clock.
pub struct RtcpSession {
    config: RtcpConfig,
    ssrc: SourceId,
    next_deadline: Nanoseconds,
    n_generated: u64,
    n_processed: u64,
    n_malformed: u64,
}

impl RtcpSession {
    /// Create a session with a random reporting SSRC.
    pub fn new(config: RtcpConfig) -> Self {
        RtcpSession {
            config,
            ssrc: rand::thread_rng().gen(),
            next_deadline: 0,
            n_generated: 0,
            n_processed: 0,
            n_malformed: 0,
        }
    }

    /// SSRC used in generated reports.
    pub fn ssrc(&self) -> SourceId {
        self.ssrc
    }

    /// Monotonic time at which the next report should be generated.
    pub fn generation_deadline(&self, now: Nanoseconds) -> Nanoseconds {
        if self.next_deadline == 0 {
            now
        } else {
            self.next_deadline
        }
    }

    /// Number of malformed control packets seen.
    pub fn num_malformed(&self) -> u64 {
        self.n_malformed
    }

    /// Generate a receiver report compound packet (RR + SDES).
    pub fn generate_receiver_report(
        &mut self,
        now: Nanoseconds,
        hooks: &mut dyn ReceiverHooks,
    ) -> Packet {
        let compound = CompoundPacket {
            receiver_report: Some(ReceiverReport {
                ssrc: self.ssrc,
                reports: hooks.query_reception_reports(),
            }),
            sdes: Some(self.sdes()),
            ..Default::default()
        };

        self.finish_generation(now);
        self.into_packet(compound.compose())
    }

    /// Generate a sender report compound packet (SR + SDES), if the sender
    /// pipeline has a capture-time anchor yet.
    pub fn generate_sender_report(
        &mut self,
        now: Nanoseconds,
        report_time: Nanoseconds,
        hooks: &mut dyn SenderHooks,
    ) -> Option<Packet> {
        let metrics = hooks.query_sending_metrics(report_time)?;

        let compound = CompoundPacket {
            sender_report: Some(SenderReport {
                ssrc: self.ssrc,
                ntp_timestamp: NtpTimestamp::from_unix_ns(metrics.origin_time),
                rtp_timestamp: metrics.origin_rtp,
                packet_count: 0,
                octet_count: 0,
                reports: vec![],
            }),
            sdes: Some(self.sdes()),
            ..Default::default()
        };

        self.finish_generation(now);
        Some(self.into_packet(compound.compose()))
    }

    /// Process an incoming control packet on the receiver side.
    pub fn process_receiver_packet(
        &mut self,
        packet: &Packet,
        hooks: &mut dyn ReceiverHooks,
    ) {
        let Some(compound) = self.parse(packet) else {
            return;
        };

        if let Some(sr) = compound.sender_report {
            hooks.notify_sending_metrics(
                sr.ssrc,
                SendingMetrics {
                    origin_time: sr.ntp_timestamp.to_unix_ns(),
                    origin_rtp: sr.rtp_timestamp,
                },
            );
        }
    }

    /// Process an incoming control packet on the sender side.
    pub fn process_sender_packet(&mut self, packet: &Packet, hooks: &mut dyn SenderHooks) {
        let Some(compound) = self.parse(packet) else {
            return;
        };

        if let Some(rr) = compound.receiver_report {
            for report in rr.reports {
                hooks.notify_reception_report(report);
            }
        }
    }

    fn parse(&mut self, packet: &Packet) -> Option<CompoundPacket> {
        let data = match &packet.rtcp {
            Some(rtcp) => &rtcp.data,
            None => {
                warn!("rtcp session: dropping packet without rtcp view");
                self.n_malformed += 1;
                return None;
            }
        };

        match CompoundPacket::parse(data) {
            Ok(compound) => {
                self.n_processed += 1;
                Some(compound)
            }
            Err(err) => {
                warn!(%err, "rtcp session: dropping malformed compound packet");
                self.n_malformed += 1;
                None
            }
        }
    }

    fn sdes(&self) -> SourceDescription {
        SourceDescription {
            ssrc: self.ssrc,
            cname: self.config.cname.clone(),
        }
    }

    fn finish_generation(&mut self, now: Nanoseconds) {
        self.next_deadline = now + self.config.report_interval;
        self.n_generated += 1;
        if self.n_generated == 1 {
            debug!(ssrc = self.ssrc, "rtcp session: first report generated");
        }
    }

    fn into_packet(&self, data: Bytes) -> Packet {
        let mut packet = Packet::new();
        packet.rtcp = Some(Rtcp { data: data.clone() });
        packet.add_flags(PacketFlags::RTCP | PacketFlags::CONTROL | PacketFlags::COMPOSED);
        packet.set_data(data);
        packet
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestReceiver {
        metrics: Vec<(SourceId, SendingMetrics)>,
    }

    impl ReceiverHooks for TestReceiver {
        fn notify_sending_metrics(&mut self, ssrc: SourceId, metrics: SendingMetrics) {
            self.metrics.push((ssrc, metrics));
        }

        fn query_reception_reports(&mut self) -> Vec<ReportBlock> {
            vec![ReportBlock {
                ssrc: 0x7777,
                fraction_lost: 12,
                ..Default::default()
            }]
        }
    }

    struct TestSender {
        anchor: Option<SendingMetrics>,
        reports: Vec<ReportBlock>,
    }

    impl SenderHooks for TestSender {
        fn query_sending_metrics(
            &mut self,
            _report_time: Nanoseconds,
        ) -> Option<SendingMetrics> {
            self.anchor
        }

        fn notify_reception_report(&mut self, report: ReportBlock) {
            self.reports.push(report);
        }
    }

    #[test]
    fn test_deadline_advances() {
        let mut session = RtcpSession::new(RtcpConfig::default());
        assert_eq!(session.generation_deadline(1000), 1000);

        let mut hooks = TestReceiver { metrics: vec![] };
        session.generate_receiver_report(1000, &mut hooks);
        assert_eq!(session.generation_deadline(2000), 1000 + crate::SECOND);
    }

    #[test]
    fn test_sr_feeds_receiver_hooks() {
        let mut sender_session = RtcpSession::new(RtcpConfig::default());
        let mut sender_hooks = TestSender {
            anchor: Some(SendingMetrics {
                origin_time: 1_700_000_000 * crate::SECOND,
                origin_rtp: 4242,
            }),
            reports: vec![],
        };
        let packet = sender_session
            .generate_sender_report(10, 1_700_000_000 * crate::SECOND, &mut sender_hooks)
            .unwrap();

        let mut receiver_session = RtcpSession::new(RtcpConfig::default());
        let mut receiver_hooks = TestReceiver { metrics: vec![] };
        receiver_session.process_receiver_packet(&packet, &mut receiver_hooks);

        assert_eq!(receiver_hooks.metrics.len(), 1);
        let (ssrc, metrics) = receiver_hooks.metrics[0];
        assert_eq!(ssrc, sender_session.ssrc());
        assert_eq!(metrics.origin_rtp, 4242);
        assert!(
            (metrics.origin_time - 1_700_000_000 * crate::SECOND).abs() < 2,
            "ntp conversion drift"
        );
    }

    #[test]
    fn test_rr_feeds_sender_hooks() {
        let mut receiver_session = RtcpSession::new(RtcpConfig::default());
        let mut receiver_hooks = TestReceiver { metrics: vec![] };
        let packet = receiver_session.generate_receiver_report(0, &mut receiver_hooks);

        let mut sender_session = RtcpSession::new(RtcpConfig::default());
        let mut sender_hooks = TestSender {
            anchor: None,
            reports: vec![],
        };
        sender_session.process_sender_packet(&packet, &mut sender_hooks);

        assert_eq!(sender_hooks.reports.len(), 1);
        assert_eq!(sender_hooks.reports[0].fraction_lost, 12);
    }

    #[test]
    fn test_sr_requires_anchor() {
        let mut session = RtcpSession::new(RtcpConfig::default());
        let mut hooks = TestSender {
            anchor: None,
            reports: vec![],
        };
        assert!(session.generate_sender_report(0, 0, &mut hooks).is_none());
    }

    #[test]
    fn test_malformed_counted() {
        let mut session = RtcpSession::new(RtcpConfig::default());
        let mut hooks = TestReceiver { metrics: vec![] };

        let mut packet = Packet::new();
        packet.rtcp = Some(Rtcp {
            data: Bytes::from_static(&[0x80, 200, 0, 99]),
        });
        packet.add_flags(PacketFlags::RTCP);

        session.process_receiver_packet(&packet, &mut hooks);
        assert_eq!(session.num_malformed(), 1);
        assert!(hooks.metrics.is_empty());
    }
}
