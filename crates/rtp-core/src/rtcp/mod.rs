//! RTCP control protocol (RFC 3550).
//!
//! The pipeline consumes sender reports (to learn capture-time mappings) and
//! emits receiver reports plus a minimal SDES carrying only a CNAME. Packets
//! travel as compound packets: SR/RR first, then SDES.

mod ntp;
mod session;

pub use ntp::NtpTimestamp;
pub use session::{ReceiverHooks, RtcpConfig, RtcpSession, SenderHooks};

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::{Nanoseconds, RtpTimestamp, SourceId};

const RTCP_VERSION: u8 = 2;

/// Packet type: sender report.
const PT_SR: u8 = 200;
/// Packet type: receiver report.
const PT_RR: u8 = 201;
/// Packet type: source description.
const PT_SDES: u8 = 202;

/// SDES item type: canonical name.
const SDES_CNAME: u8 = 1;

/// Reception statistics for one remote stream (RFC 3550 report block).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReportBlock {
    /// Stream the report is about.
    pub ssrc: SourceId,
    /// Fraction of packets lost since the previous report, in 1/256 units.
    pub fraction_lost: u8,
    /// Cumulative number of packets lost, 24-bit signed.
    pub cumulative_lost: i32,
    /// Extended highest sequence number received.
    pub ext_highest_seqnum: u32,
    /// Interarrival jitter in timestamp units.
    pub jitter: u32,
    /// Middle 32 bits of the last SR's NTP timestamp.
    pub last_sr: u32,
    /// Delay since the last SR, in 1/65536 s units.
    pub delay_since_last_sr: u32,
}

/// Sender report.
#[derive(Debug, Clone, Default)]
pub struct SenderReport {
    /// Sender's stream id.
    pub ssrc: SourceId,
    /// Wall-clock time of the report.
    pub ntp_timestamp: NtpTimestamp,
    /// RTP timestamp corresponding to `ntp_timestamp`.
    pub rtp_timestamp: RtpTimestamp,
    /// Total packets sent.
    pub packet_count: u32,
    /// Total payload octets sent.
    pub octet_count: u32,
    /// Reception reports piggybacked on the SR.
    pub reports: Vec<ReportBlock>,
}

/// Receiver report.
#[derive(Debug, Clone, Default)]
pub struct ReceiverReport {
    /// Reporter's stream id.
    pub ssrc: SourceId,
    /// Reception reports, one per remote stream.
    pub reports: Vec<ReportBlock>,
}

/// Source description (CNAME only).
#[derive(Debug, Clone, Default)]
pub struct SourceDescription {
    /// Described stream id.
    pub ssrc: SourceId,
    /// Canonical endpoint name.
    pub cname: String,
}

/// A parsed RTCP compound packet.
#[derive(Debug, Clone, Default)]
pub struct CompoundPacket {
    /// Sender report, if present.
    pub sender_report: Option<SenderReport>,
    /// Receiver report, if present.
    pub receiver_report: Option<ReceiverReport>,
    /// Source description, if present.
    pub sdes: Option<SourceDescription>,
}

/// Capture-time anchor delivered by a sender report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendingMetrics {
    /// Wall-clock origin time, nanoseconds since Unix epoch.
    pub origin_time: Nanoseconds,
    /// RTP timestamp corresponding to `origin_time`.
    pub origin_rtp: RtpTimestamp,
}

fn put_header(buf: &mut BytesMut, count: u8, packet_type: u8, length_words: u16) {
    buf.put_u8(RTCP_VERSION << 6 | (count & 0x1f));
    buf.put_u8(packet_type);
    buf.put_u16(length_words);
}

fn put_report_block(buf: &mut BytesMut, block: &ReportBlock) {
    buf.put_u32(block.ssrc);
    buf.put_u8(block.fraction_lost);
    let lost = block.cumulative_lost.clamp(-(1 << 23), (1 << 23) - 1);
    buf.put_u8((lost >> 16) as u8);
    buf.put_u16(lost as u16);
    buf.put_u32(block.ext_highest_seqnum);
    buf.put_u32(block.jitter);
    buf.put_u32(block.last_sr);
    buf.put_u32(block.delay_since_last_sr);
}

fn get_u32(data: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
}

fn get_report_block(data: &[u8], at: usize) -> ReportBlock {
    let mut lost =
        ((data[at + 4] as i32) << 16) | ((data[at + 5] as i32) << 8) | data[at + 6] as i32;
    if lost & (1 << 23) != 0 {
        lost -= 1 << 24;
    }
    ReportBlock {
        ssrc: get_u32(data, at),
        fraction_lost: data[at + 4],
        cumulative_lost: lost,
        ext_highest_seqnum: get_u32(data, at + 8),
        jitter: get_u32(data, at + 12),
        last_sr: get_u32(data, at + 16),
        delay_since_last_sr: get_u32(data, at + 20),
    }
}

impl CompoundPacket {
    /// Serialize the compound packet.
    pub fn compose(&self) -> Bytes {
        let mut buf = BytesMut::new();

        if let Some(sr) = &self.sender_report {
            let count = sr.reports.len().min(31) as u8;
            put_header(&mut buf, count, PT_SR, 6 + count as u16 * 6);
            buf.put_u32(sr.ssrc);
            buf.put_u64(sr.ntp_timestamp.to_u64());
            buf.put_u32(sr.rtp_timestamp);
            buf.put_u32(sr.packet_count);
            buf.put_u32(sr.octet_count);
            for block in sr.reports.iter().take(31) {
                put_report_block(&mut buf, block);
            }
        }

        if let Some(rr) = &self.receiver_report {
            let count = rr.reports.len().min(31) as u8;
            put_header(&mut buf, count, PT_RR, 1 + count as u16 * 6);
            buf.put_u32(rr.ssrc);
            for block in rr.reports.iter().take(31) {
                put_report_block(&mut buf, block);
            }
        }

        if let Some(sdes) = &self.sdes {
            let cname = sdes.cname.as_bytes();
            let cname_len = cname.len().min(255);
            // Chunk: ssrc, item type, item length, text, null terminator,
            // padded to a word boundary.
            let chunk_len = 4 + 2 + cname_len + 1;
            let padded = (chunk_len + 3) / 4 * 4;

            put_header(&mut buf, 1, PT_SDES, (padded / 4) as u16);
            buf.put_u32(sdes.ssrc);
            buf.put_u8(SDES_CNAME);
            buf.put_u8(cname_len as u8);
            buf.put_slice(&cname[..cname_len]);
            buf.put_bytes(0, padded - chunk_len + 1);
        }

        buf.freeze()
    }

    /// Parse a compound packet, skipping unknown packet types.
    pub fn parse(data: &[u8]) -> Result<CompoundPacket> {
        let mut compound = CompoundPacket::default();
        let mut at = 0;

        while at + 4 <= data.len() {
            let version = data[at] >> 6;
            if version != RTCP_VERSION {
                return Err(Error::ProtocolError(format!(
                    "rtcp: bad version: version={version}"
                )));
            }

            let count = (data[at] & 0x1f) as usize;
            let packet_type = data[at + 1];
            let length_words = u16::from_be_bytes([data[at + 2], data[at + 3]]) as usize;
            let packet_len = 4 + length_words * 4;

            if at + packet_len > data.len() {
                return Err(Error::ProtocolError(
                    "rtcp: truncated compound packet".to_string(),
                ));
            }

            let body = &data[at + 4..at + packet_len];

            match packet_type {
                PT_SR => {
                    if body.len() < 24 + count * 24 {
                        return Err(Error::ProtocolError("rtcp: truncated sr".to_string()));
                    }
                    let mut sr = SenderReport {
                        ssrc: get_u32(body, 0),
                        ntp_timestamp: NtpTimestamp::from_u64(
                            (get_u32(body, 4) as u64) << 32 | get_u32(body, 8) as u64,
                        ),
                        rtp_timestamp: get_u32(body, 12),
                        packet_count: get_u32(body, 16),
                        octet_count: get_u32(body, 20),
                        reports: Vec::with_capacity(count),
                    };
                    for i in 0..count {
                        sr.reports.push(get_report_block(body, 24 + i * 24));
                    }
                    compound.sender_report = Some(sr);
                }
                PT_RR => {
                    if body.len() < 4 + count * 24 {
                        return Err(Error::ProtocolError("rtcp: truncated rr".to_string()));
                    }
                    let mut rr = ReceiverReport {
                        ssrc: get_u32(body, 0),
                        reports: Vec::with_capacity(count),
                    };
                    for i in 0..count {
                        rr.reports.push(get_report_block(body, 4 + i * 24));
                    }
                    compound.receiver_report = Some(rr);
                }
                PT_SDES => {
                    if count >= 1 && body.len() >= 6 && body[4] == SDES_CNAME {
                        let len = body[5] as usize;
                        if body.len() >= 6 + len {
                            compound.sdes = Some(SourceDescription {
                                ssrc: get_u32(body, 0),
                                cname: String::from_utf8_lossy(&body[6..6 + len])
                                    .into_owned(),
                            });
                        }
                    }
                }
                _ => {}
            }

            at += packet_len;
        }

        Ok(compound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sr_round_trip() {
        let compound = CompoundPacket {
            sender_report: Some(SenderReport {
                ssrc: 0x1234,
                ntp_timestamp: NtpTimestamp::from_unix_ns(1_700_000_000 * crate::SECOND),
                rtp_timestamp: 56789,
                packet_count: 100,
                octet_count: 40000,
                reports: vec![],
            }),
            sdes: Some(SourceDescription {
                ssrc: 0x1234,
                cname: "receiver@host".to_string(),
            }),
            ..Default::default()
        };

        let data = compound.compose();
        let parsed = CompoundPacket::parse(&data).unwrap();

        let sr = parsed.sender_report.unwrap();
        assert_eq!(sr.ssrc, 0x1234);
        assert_eq!(sr.rtp_timestamp, 56789);
        assert_eq!(sr.packet_count, 100);
        assert_eq!(
            sr.ntp_timestamp.to_unix_ns() / crate::SECOND,
            1_700_000_000
        );

        let sdes = parsed.sdes.unwrap();
        assert_eq!(sdes.cname, "receiver@host");
    }

    #[test]
    fn test_rr_round_trip() {
        let block = ReportBlock {
            ssrc: 0xabcd,
            fraction_lost: 25,
            cumulative_lost: -3,
            ext_highest_seqnum: 70000,
            jitter: 42,
            last_sr: 0x5555,
            delay_since_last_sr: 0x100,
        };
        let compound = CompoundPacket {
            receiver_report: Some(ReceiverReport {
                ssrc: 0x9999,
                reports: vec![block],
            }),
            ..Default::default()
        };

        let data = compound.compose();
        let parsed = CompoundPacket::parse(&data).unwrap();

        let rr = parsed.receiver_report.unwrap();
        assert_eq!(rr.ssrc, 0x9999);
        assert_eq!(rr.reports.len(), 1);
        assert_eq!(rr.reports[0], block);
    }

    #[test]
    fn test_parse_rejects_truncation() {
        let compound = CompoundPacket {
            receiver_report: Some(ReceiverReport {
                ssrc: 1,
                reports: vec![],
            }),
            ..Default::default()
        };
        let data = compound.compose();
        assert!(CompoundPacket::parse(&data[..data.len() - 1]).is_err());
    }
}
