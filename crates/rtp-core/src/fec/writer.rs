//! FEC block encoder (sender side).

use bytes::Bytes;
use rand::Rng;
use tracing::{debug, error};

use super::codec::{pack_symbol, BlockCodec};
use super::FecScheme;
use crate::error::Result;
use crate::packet::{Fec, Packet, PacketFlags, PacketWriter, Rtp};
use crate::wire;
use crate::{BlockNum, Seqnum, SourceId};

/// FEC writer parameters.
#[derive(Debug, Clone)]
pub struct FecWriterConfig {
    /// Number of source packets per block.
    pub n_source_packets: usize,

    /// Number of repair packets per block.
    pub n_repair_packets: usize,

    /// Payload type stamped on repair packets.
    pub repair_payload_type: u8,
}

impl Default for FecWriterConfig {
    fn default() -> Self {
        FecWriterConfig {
            n_source_packets: 18,
            n_repair_packets: 10,
            repair_payload_type: super::PAYLOAD_TYPE_RS8M_REPAIR,
        }
    }
}

/// Groups outgoing source packets into blocks and emits repair packets.
///
/// Source packets pass through immediately with their FEC view filled and the
/// packet composed. Once `n_source_packets` have passed, the writer computes
/// `n_repair_packets` parity packets over the composed source bytes and emits
/// them as a separate repair stream (own SSRC and seqnums).
pub struct BlockWriter<W> {
    writer: W,
    codec: BlockCodec,
    scheme: FecScheme,
    config: FecWriterConfig,

    cur_sbn: BlockNum,
    cur_block: Vec<Packet>,
    block_timestamp: u32,

    repair_source: SourceId,
    repair_seqnum: Seqnum,

    n_blocks: u64,
}

impl<W: PacketWriter> BlockWriter<W> {
    /// Create a FEC writer in front of `writer`.
    pub fn new(writer: W, scheme: FecScheme, config: FecWriterConfig) -> Result<Self> {
        let codec =
            BlockCodec::new(scheme, config.n_source_packets, config.n_repair_packets)?;

        let mut rng = rand::thread_rng();

        debug!(
            scheme = %scheme,
            n_source = config.n_source_packets,
            n_repair = config.n_repair_packets,
            "fec writer: initializing"
        );

        Ok(BlockWriter {
            writer,
            codec,
            scheme,
            cur_sbn: rng.gen(),
            cur_block: Vec::with_capacity(config.n_source_packets),
            block_timestamp: 0,
            repair_source: rng.gen(),
            repair_seqnum: rng.gen(),
            config,
            n_blocks: 0,
        })
    }

    /// SSRC of the emitted repair stream.
    pub fn repair_source(&self) -> SourceId {
        self.repair_source
    }

    /// Number of completed blocks.
    pub fn num_blocks(&self) -> u64 {
        self.n_blocks
    }

    fn end_block(&mut self) {
        let symbol_len = self
            .cur_block
            .iter()
            .map(|p| p.data().len())
            .max()
            .unwrap_or(0)
            + 2;

        let symbols: Vec<Vec<u8>> = self
            .cur_block
            .iter()
            .map(|p| pack_symbol(p.data(), symbol_len))
            .collect();
        let refs: Vec<&[u8]> = symbols.iter().map(|s| s.as_slice()).collect();
        let repair = self.codec.encode(&refs);

        for (j, parity) in repair.into_iter().enumerate() {
            let mut packet = Packet::new();
            packet.rtp = Some(Rtp {
                source: self.repair_source,
                seqnum: self.repair_seqnum,
                timestamp: self.block_timestamp,
                payload_type: self.config.repair_payload_type,
                payload: Bytes::from(parity),
                ..Default::default()
            });
            packet.fec = Some(Fec {
                scheme: self.scheme,
                encoding_symbol_id: (self.config.n_source_packets + j) as u16,
                source_block_number: self.cur_sbn,
                source_block_length: self.config.n_source_packets,
                block_length: self.config.n_source_packets
                    + self.config.n_repair_packets,
                payload: Bytes::new(),
            });
            packet.add_flags(PacketFlags::RTP | PacketFlags::FEC | PacketFlags::REPAIR);

            self.repair_seqnum = self.repair_seqnum.wrapping_add(1);

            if let Err(err) = wire::compose(&mut packet) {
                error!(%err, "fec writer: can't compose repair packet");
                continue;
            }
            self.writer.write_packet(packet);
        }

        self.cur_block.clear();
        self.cur_sbn = self.cur_sbn.wrapping_add(1);
        self.n_blocks += 1;
    }
}

impl<W: PacketWriter> PacketWriter for BlockWriter<W> {
    fn write_packet(&mut self, mut packet: Packet) {
        let rtp_timestamp = match &packet.rtp {
            Some(rtp) => rtp.timestamp,
            None => {
                error!("fec writer: dropping non-rtp packet");
                return;
            }
        };

        if self.cur_block.is_empty() {
            self.block_timestamp = rtp_timestamp;
        }

        packet.fec = Some(Fec {
            scheme: self.scheme,
            encoding_symbol_id: self.cur_block.len() as u16,
            source_block_number: self.cur_sbn,
            source_block_length: self.config.n_source_packets,
            block_length: self.config.n_source_packets + self.config.n_repair_packets,
            payload: Bytes::new(),
        });
        packet.add_flags(PacketFlags::FEC);

        if let Err(err) = wire::compose(&mut packet) {
            error!(%err, "fec writer: can't compose source packet");
            return;
        }

        self.cur_block.push(packet.clone());
        self.writer.write_packet(packet);

        if self.cur_block.len() == self.config.n_source_packets {
            self.end_block();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Capture(Arc<Mutex<Vec<Packet>>>);

    impl PacketWriter for Capture {
        fn write_packet(&mut self, packet: Packet) {
            self.0.lock().unwrap().push(packet);
        }
    }

    fn source_packet(seqnum: u16, timestamp: u32) -> Packet {
        let mut packet = Packet::new();
        packet.rtp = Some(Rtp {
            source: 0x1111,
            seqnum,
            timestamp,
            payload_type: 10,
            payload: Bytes::from(vec![seqnum as u8; 20]),
            ..Default::default()
        });
        packet.add_flags(PacketFlags::RTP | PacketFlags::AUDIO);
        packet
    }

    #[test]
    fn test_emits_repair_after_full_block() {
        let capture = Capture::default();
        let config = FecWriterConfig {
            n_source_packets: 4,
            n_repair_packets: 2,
            ..Default::default()
        };
        let mut writer =
            BlockWriter::new(capture.clone(), FecScheme::Rs8m, config).unwrap();

        for sn in 0..4u16 {
            writer.write_packet(source_packet(sn, sn as u32 * 100));
        }

        let sent = capture.0.lock().unwrap().clone();
        assert_eq!(sent.len(), 6);

        // First four are the source packets, in order, composed.
        for (i, packet) in sent[..4].iter().enumerate() {
            assert!(packet.has_flags(PacketFlags::AUDIO | PacketFlags::COMPOSED));
            let fec = packet.fec.as_ref().unwrap();
            assert_eq!(fec.encoding_symbol_id, i as u16);
            assert_eq!(fec.source_block_length, 4);
            assert_eq!(fec.block_length, 6);
        }

        // Last two are repair packets of the same block.
        let sbn = sent[0].fec.as_ref().unwrap().source_block_number;
        for (j, packet) in sent[4..].iter().enumerate() {
            assert!(packet.has_flags(PacketFlags::REPAIR | PacketFlags::COMPOSED));
            let fec = packet.fec.as_ref().unwrap();
            assert_eq!(fec.encoding_symbol_id, (4 + j) as u16);
            assert_eq!(fec.source_block_number, sbn);
            assert_eq!(
                packet.rtp.as_ref().unwrap().timestamp,
                sent[0].rtp.as_ref().unwrap().timestamp
            );
        }
    }

    #[test]
    fn test_block_number_advances() {
        let capture = Capture::default();
        let config = FecWriterConfig {
            n_source_packets: 2,
            n_repair_packets: 1,
            ..Default::default()
        };
        let mut writer =
            BlockWriter::new(capture.clone(), FecScheme::Rs8m, config).unwrap();

        for sn in 0..4u16 {
            writer.write_packet(source_packet(sn, sn as u32 * 100));
        }

        let sent = capture.0.lock().unwrap().clone();
        let sbn0 = sent[0].fec.as_ref().unwrap().source_block_number;
        let sbn1 = sent[3].fec.as_ref().unwrap().source_block_number;
        assert_eq!(sbn1, sbn0.wrapping_add(1));
    }
}
