//! RTP wire format (RFC 3550).
//!
//! Standard 12-byte header, big-endian fields, no CSRC list, optional
//! padding. When a stream carries FEC, the scheme's payload id is a fixed
//! prefix of the RTP payload (see [`crate::fec`]); the parser strips it into
//! the FEC view and the composer writes it back.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::fec::{self, FecScheme};
use crate::packet::{Packet, PacketFlags, Rtp, Rtcp};

const RTP_VERSION: u8 = 2;
const RTP_HEADER_SIZE: usize = 12;

/// Parser for datagrams of one endpoint.
///
/// The endpoint's protocol decides the shape of every datagram it carries:
/// the FEC scheme (if any) and whether the stream is source audio or repair
/// symbols.
#[derive(Debug, Clone, Copy)]
pub struct Parser {
    scheme: FecScheme,
    repair: bool,
}

impl Parser {
    /// Parser for a source (audio) stream.
    pub fn source(scheme: FecScheme) -> Self {
        Parser {
            scheme,
            repair: false,
        }
    }

    /// Parser for a repair (parity) stream.
    pub fn repair(scheme: FecScheme) -> Self {
        Parser {
            scheme,
            repair: true,
        }
    }

    /// Parse one datagram into a packet with RTP (and possibly FEC) views.
    pub fn parse(&self, data: Bytes) -> Result<Packet> {
        if data.len() < RTP_HEADER_SIZE {
            return Err(Error::ProtocolError(format!(
                "rtp: datagram too short: size={}",
                data.len()
            )));
        }

        let version = data[0] >> 6;
        if version != RTP_VERSION {
            return Err(Error::ProtocolError(format!(
                "rtp: bad version: version={version}"
            )));
        }

        let has_padding = data[0] & 0x20 != 0;
        let has_extension = data[0] & 0x10 != 0;
        let csrc_count = (data[0] & 0x0f) as usize;
        let marker = data[1] & 0x80 != 0;
        let payload_type = data[1] & 0x7f;
        let seqnum = u16::from_be_bytes([data[2], data[3]]);
        let timestamp = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        let source = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);

        let mut payload_begin = RTP_HEADER_SIZE + csrc_count * 4;

        if has_extension {
            if data.len() < payload_begin + 4 {
                return Err(Error::ProtocolError(
                    "rtp: truncated extension header".to_string(),
                ));
            }
            let ext_words = u16::from_be_bytes([
                data[payload_begin + 2],
                data[payload_begin + 3],
            ]) as usize;
            payload_begin += 4 + ext_words * 4;
        }

        let mut payload_end = data.len();
        let mut padding = 0;
        if has_padding {
            if data.is_empty() {
                return Err(Error::ProtocolError("rtp: empty padded packet".to_string()));
            }
            padding = data[data.len() - 1] as usize;
            if padding == 0 || payload_begin + padding > payload_end {
                return Err(Error::ProtocolError(format!(
                    "rtp: bad padding length: padding={padding}"
                )));
            }
            payload_end -= padding;
        }

        if payload_begin > payload_end {
            return Err(Error::ProtocolError(
                "rtp: header overlaps payload".to_string(),
            ));
        }

        let mut packet = Packet::new();
        let mut payload = data.slice(payload_begin..payload_end);
        let mut flags = PacketFlags::RTP;

        if self.scheme != FecScheme::None {
            let (fec, rest) = fec::parse_payload_id(self.scheme, payload)?;
            packet.fec = Some(fec);
            payload = rest;
            flags |= PacketFlags::FEC;
        }

        flags |= if self.repair {
            PacketFlags::REPAIR
        } else {
            PacketFlags::AUDIO
        };

        packet.rtp = Some(Rtp {
            source,
            seqnum,
            timestamp,
            duration: 0,
            capture_timestamp: 0,
            marker,
            payload_type,
            header: data.slice(..payload_begin),
            payload,
            padding,
        });
        packet.add_flags(flags);
        packet.set_data(data);

        Ok(packet)
    }
}

/// Parse a datagram carrying an RTCP compound packet.
pub fn parse_control(data: Bytes) -> Result<Packet> {
    if data.len() < 4 {
        return Err(Error::ProtocolError(format!(
            "rtcp: datagram too short: size={}",
            data.len()
        )));
    }
    if data[0] >> 6 != RTP_VERSION {
        return Err(Error::ProtocolError("rtcp: bad version".to_string()));
    }

    let mut packet = Packet::new();
    packet.rtcp = Some(Rtcp { data: data.clone() });
    packet.add_flags(PacketFlags::RTCP | PacketFlags::CONTROL);
    packet.set_data(data);
    Ok(packet)
}

/// Serialize a packet's views into its byte slice and mark it composed.
///
/// Composed packets are authoritative: their views become read-only and the
/// byte slice is what endpoint writers transmit.
pub fn compose(packet: &mut Packet) -> Result<()> {
    if packet.has_flags(PacketFlags::COMPOSED) {
        return Ok(());
    }

    let rtp = packet
        .rtp
        .as_mut()
        .ok_or_else(|| Error::InvalidState("compose: missing rtp view".to_string()))?;

    if rtp.padding > 255 {
        return Err(Error::InvalidArgument(format!(
            "compose: padding too large: padding={}",
            rtp.padding
        )));
    }

    let fec_size = packet
        .fec
        .as_ref()
        .map(|fec| fec::payload_id_size(fec.scheme))
        .unwrap_or(0);

    let mut buf = BytesMut::with_capacity(
        RTP_HEADER_SIZE + fec_size + rtp.payload.len() + rtp.padding,
    );

    let mut byte0 = RTP_VERSION << 6;
    if rtp.padding > 0 {
        byte0 |= 0x20;
    }
    buf.put_u8(byte0);
    buf.put_u8((rtp.payload_type & 0x7f) | if rtp.marker { 0x80 } else { 0 });
    buf.put_u16(rtp.seqnum);
    buf.put_u32(rtp.timestamp);
    buf.put_u32(rtp.source);

    if let Some(fec) = &packet.fec {
        fec::compose_payload_id(fec, &mut buf);
    }

    buf.put_slice(&rtp.payload);

    if rtp.padding > 0 {
        buf.put_bytes(0, rtp.padding - 1);
        buf.put_u8(rtp.padding as u8);
    }

    let data = buf.freeze();
    rtp.header = data.slice(..RTP_HEADER_SIZE);
    packet.set_data(data);
    packet.add_flags(PacketFlags::COMPOSED);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Fec;

    fn sample_rtp() -> Rtp {
        Rtp {
            source: 0xdeadbeef,
            seqnum: 4660,
            timestamp: 0x01020304,
            marker: true,
            payload_type: 10,
            payload: Bytes::from_static(&[1, 2, 3, 4]),
            ..Default::default()
        }
    }

    #[test]
    fn test_compose_parse_round_trip() {
        let mut packet = Packet::new();
        packet.rtp = Some(sample_rtp());
        packet.add_flags(PacketFlags::RTP | PacketFlags::AUDIO);

        compose(&mut packet).unwrap();
        assert!(packet.has_flags(PacketFlags::COMPOSED));
        assert_eq!(packet.data().len(), 16);

        let parsed = Parser::source(FecScheme::None)
            .parse(packet.data().clone())
            .unwrap();
        assert!(parsed.has_flags(PacketFlags::AUDIO));
        let rtp = parsed.rtp.unwrap();
        assert_eq!(rtp.source, 0xdeadbeef);
        assert_eq!(rtp.seqnum, 4660);
        assert_eq!(rtp.timestamp, 0x01020304);
        assert!(rtp.marker);
        assert_eq!(rtp.payload_type, 10);
        assert_eq!(&rtp.payload[..], &[1, 2, 3, 4]);
    }

    #[test]
    fn test_padding_round_trip() {
        let mut packet = Packet::new();
        let mut rtp = sample_rtp();
        rtp.padding = 6;
        packet.rtp = Some(rtp);
        packet.add_flags(PacketFlags::RTP);

        compose(&mut packet).unwrap();
        assert_eq!(packet.data().len(), 16 + 6);

        let parsed = Parser::source(FecScheme::None)
            .parse(packet.data().clone())
            .unwrap();
        let rtp = parsed.rtp.unwrap();
        assert_eq!(&rtp.payload[..], &[1, 2, 3, 4]);
        assert_eq!(rtp.padding, 6);
    }

    #[test]
    fn test_rejects_bad_version() {
        let data = Bytes::from_static(&[0u8; 12]);
        assert!(Parser::source(FecScheme::None).parse(data).is_err());
    }

    #[test]
    fn test_rejects_short_datagram() {
        let data = Bytes::from_static(&[0x80, 0, 0, 1]);
        assert!(Parser::source(FecScheme::None).parse(data).is_err());
    }

    #[test]
    fn test_fec_prefix_round_trip() {
        let mut packet = Packet::new();
        packet.rtp = Some(sample_rtp());
        packet.fec = Some(Fec {
            scheme: FecScheme::Rs8m,
            encoding_symbol_id: 3,
            source_block_number: 17,
            source_block_length: 10,
            block_length: 15,
            payload: Bytes::new(),
        });
        packet.add_flags(PacketFlags::RTP | PacketFlags::FEC | PacketFlags::AUDIO);

        compose(&mut packet).unwrap();

        let parsed = Parser::source(FecScheme::Rs8m)
            .parse(packet.data().clone())
            .unwrap();
        let fec = parsed.fec.unwrap();
        assert_eq!(fec.encoding_symbol_id, 3);
        assert_eq!(fec.source_block_number, 17);
        assert_eq!(fec.source_block_length, 10);
        assert_eq!(fec.block_length, 15);
        assert_eq!(&parsed.rtp.unwrap().payload[..], &[1, 2, 3, 4]);
    }
}
