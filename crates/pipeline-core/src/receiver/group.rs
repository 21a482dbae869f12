//! Session group: session lifecycle for one receiver slot.

use std::sync::Arc;

use tracing::{debug, info, warn};

use rstream_media_core::latency_monitor::LatencyMetrics;
use rstream_media_core::FrameReader;
use rstream_rtp_core::fec::FecScheme;
use rstream_rtp_core::format::FormatRegistry;
use rstream_rtp_core::packet::{Packet, PacketFlags};
use rstream_rtp_core::rtcp::{
    ReceiverHooks, ReportBlock, RtcpSession, SendingMetrics,
};
use rstream_rtp_core::{Nanoseconds, SourceId};

use crate::config::{ReceiverCommonConfig, ReceiverSessionConfig};
use crate::receiver::session::ReceiverSession;

/// Owns the sessions of one receiver slot and its RTCP session.
///
/// Transport packets are routed to the session that accepts them; a source
/// packet nobody accepts creates a new session. Control packets feed the
/// RTCP session, which distributes capture-time mappings to all sessions.
pub struct SessionGroup {
    session_config: ReceiverSessionConfig,
    common_config: ReceiverCommonConfig,
    registry: Arc<FormatRegistry>,
    fec_scheme: FecScheme,

    sessions: Vec<ReceiverSession>,
    rtcp: RtcpSession,
}

struct GroupHooks<'a> {
    sessions: &'a mut Vec<ReceiverSession>,
}

impl ReceiverHooks for GroupHooks<'_> {
    fn notify_sending_metrics(&mut self, _ssrc: SourceId, metrics: SendingMetrics) {
        // The SR's SSRC belongs to the RTCP session, which is not always the
        // media SSRC; distribute the mapping to every session of the slot.
        for session in self.sessions.iter_mut() {
            session.update_mapping(metrics.origin_time, metrics.origin_rtp);
        }
    }

    fn query_reception_reports(&mut self) -> Vec<ReportBlock> {
        self.sessions
            .iter()
            .map(|session| ReportBlock {
                ssrc: session.source_id(),
                ..Default::default()
            })
            .collect()
    }
}

impl SessionGroup {
    /// Create an empty group.
    pub fn new(
        session_config: ReceiverSessionConfig,
        common_config: ReceiverCommonConfig,
        registry: Arc<FormatRegistry>,
        fec_scheme: FecScheme,
    ) -> Self {
        let rtcp = RtcpSession::new(common_config.rtcp.clone());

        SessionGroup {
            session_config,
            common_config,
            registry,
            fec_scheme,
            sessions: Vec::new(),
            rtcp,
        }
    }

    /// Number of live sessions.
    pub fn num_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Latency measurements of every live session.
    pub fn session_metrics(&self) -> Vec<LatencyMetrics> {
        self.sessions.iter().map(|s| s.metrics()).collect()
    }

    /// Route one packet: control packets to RTCP, transport packets to the
    /// accepting session, unknown source packets to a new session.
    pub fn route_packet(&mut self, packet: Packet) {
        if packet.rtcp.is_some() {
            let mut hooks = GroupHooks {
                sessions: &mut self.sessions,
            };
            self.rtcp.process_receiver_packet(&packet, &mut hooks);
            return;
        }

        for session in self.sessions.iter_mut() {
            if session.handle_packet(&packet) {
                return;
            }
        }

        if packet.has_flags(PacketFlags::REPAIR) {
            debug!("session group: ignoring repair packet for unknown session");
            return;
        }

        self.create_session(packet);
    }

    /// Drive session lifecycle; removes sessions whose watchdog or latency
    /// monitor gave up. Returns an RTCP receiver report when one is due.
    pub fn refresh(&mut self, now: Nanoseconds) -> Option<Packet> {
        let before = self.sessions.len();
        self.sessions.retain(|session| {
            let alive = session.is_alive();
            if !alive {
                info!(source_id = session.source_id(), "session group: removing session");
            }
            alive
        });
        if before != self.sessions.len() {
            debug!(
                removed = before - self.sessions.len(),
                left = self.sessions.len(),
                "session group: sessions removed"
            );
        }

        if now >= self.rtcp.generation_deadline(now) {
            let mut hooks = GroupHooks {
                sessions: &mut self.sessions,
            };
            return Some(self.rtcp.generate_receiver_report(now, &mut hooks));
        }

        None
    }

    /// Update the end-to-end latency of every session from the playback
    /// time of the last delivered frame.
    pub fn reclock_sessions(&mut self, playback_ts: Nanoseconds) {
        for session in self.sessions.iter_mut() {
            session.reclock(playback_ts);
        }
    }

    /// Collect the frame readers of live sessions for mixing.
    pub fn collect_readers<'a>(&'a mut self, readers: &mut Vec<&'a mut dyn FrameReader>) {
        for session in self.sessions.iter_mut() {
            readers.push(session);
        }
    }

    fn create_session(&mut self, packet: Packet) {
        let Some(rtp) = packet.rtp.as_ref() else {
            warn!("session group: can't create session from non-rtp packet");
            return;
        };

        let Some(format) = self.registry.find_by_pt(rtp.payload_type).copied() else {
            warn!(
                payload_type = rtp.payload_type,
                "session group: no format for payload type"
            );
            return;
        };

        // The endpoint's scheme wins, but a packet carrying a FEC view can
        // only be handled with its own scheme.
        let fec_scheme = packet
            .fec
            .as_ref()
            .map(|fec| fec.scheme)
            .unwrap_or(self.fec_scheme);

        let src_addr = packet.udp.as_ref().map(|udp| udp.src_addr);

        info!(
            source_id = rtp.source,
            payload_type = rtp.payload_type,
            "session group: creating session"
        );

        let session = match ReceiverSession::new(
            &self.session_config,
            &self.common_config,
            format,
            fec_scheme,
            src_addr,
            rtp.source,
        ) {
            Ok(session) => session,
            Err(err) => {
                warn!(%err, "session group: can't create session");
                return;
            }
        };

        self.sessions.push(session);

        let session = self.sessions.last_mut().unwrap();
        if !session.handle_packet(&packet) {
            warn!("session group: new session rejected its first packet");
            self.sessions.pop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ReceiverCommonConfig, ReceiverSessionConfig};
    use bytes::Bytes;
    use rstream_rtp_core::format::PAYLOAD_TYPE_L16_STEREO;
    use rstream_rtp_core::packet::Rtp;

    fn group() -> SessionGroup {
        SessionGroup::new(
            ReceiverSessionConfig::default(),
            ReceiverCommonConfig::default(),
            Arc::new(FormatRegistry::new()),
            FecScheme::None,
        )
    }

    fn source_packet(source: u32, seqnum: u16, flags: PacketFlags) -> Packet {
        let mut packet = Packet::new();
        packet.rtp = Some(Rtp {
            source,
            seqnum,
            timestamp: seqnum as u32 * 100,
            payload_type: PAYLOAD_TYPE_L16_STEREO,
            payload: Bytes::from(vec![0u8; 400]),
            ..Default::default()
        });
        packet.add_flags(PacketFlags::RTP | flags);
        packet
    }

    #[test]
    fn test_session_created_on_first_packet() {
        let mut group = group();
        assert_eq!(group.num_sessions(), 0);

        group.route_packet(source_packet(1, 0, PacketFlags::AUDIO));
        assert_eq!(group.num_sessions(), 1);

        // Same stream: no second session.
        group.route_packet(source_packet(1, 1, PacketFlags::AUDIO));
        assert_eq!(group.num_sessions(), 1);

        // A different stream gets its own session.
        group.route_packet(source_packet(2, 0, PacketFlags::AUDIO));
        assert_eq!(group.num_sessions(), 2);
    }

    #[test]
    fn test_repair_packet_never_creates_session() {
        let mut group = group();
        group.route_packet(source_packet(1, 0, PacketFlags::REPAIR));
        assert_eq!(group.num_sessions(), 0);
    }

    #[test]
    fn test_unknown_payload_type_ignored() {
        let mut group = group();
        let mut packet = source_packet(1, 0, PacketFlags::AUDIO);
        packet.rtp.as_mut().unwrap().payload_type = 99;
        group.route_packet(packet);
        assert_eq!(group.num_sessions(), 0);
    }
}
