//! FEC block decoder (receiver side).

use std::collections::VecDeque;

use bytes::Bytes;
use tracing::{debug, warn};

use super::codec::{pack_symbol, unpack_symbol, BlockCodec};
use super::FecScheme;
use crate::packet::{Packet, PacketFlags, PacketReader};
use crate::units;
use crate::wire::Parser;
use crate::BlockNum;

/// FEC reader parameters.
#[derive(Debug, Clone)]
pub struct FecReaderConfig {
    /// Maximum number of blocks held in the sliding window.
    pub max_blocks: usize,

    /// How many blocks ahead of the current one may fill up before the
    /// current block is abandoned and delivered with gaps.
    pub max_block_advance: usize,
}

impl Default for FecReaderConfig {
    fn default() -> Self {
        FecReaderConfig {
            max_blocks: 32,
            max_block_advance: 16,
        }
    }
}

struct Block {
    /// Arrived packets by encoding symbol id; `None` where nothing arrived.
    packets: Vec<Option<Packet>>,
    n_source: usize,
    n_total: usize,
    n_present: usize,
    n_source_present: usize,
}

impl Block {
    fn empty() -> Self {
        Block {
            packets: Vec::new(),
            n_source: 0,
            n_total: 0,
            n_present: 0,
            n_source_present: 0,
        }
    }

    fn has_geometry(&self) -> bool {
        self.n_total != 0
    }

    fn set_geometry(&mut self, n_source: usize, n_total: usize) {
        self.n_source = n_source;
        self.n_total = n_total;
        self.packets.resize_with(n_total, || None);
    }

    fn place(&mut self, esi: usize, packet: Packet) {
        if esi >= self.n_total || self.packets[esi].is_some() {
            return;
        }
        if esi < self.n_source {
            self.n_source_present += 1;
        }
        self.n_present += 1;
        self.packets[esi] = Some(packet);
    }
}

/// Reads a source packet stream with losses recovered from a repair stream.
///
/// Maintains a sliding window of blocks indexed by source block number. Each
/// block is delivered in symbol order as soon as all its source symbols have
/// arrived, or once enough symbols (source plus repair) are present to decode
/// the missing ones. A block that stays incomplete while later blocks fill up
/// past a threshold is abandoned: its arrived packets are delivered and the
/// gap is left for the depacketizer to fill.
pub struct BlockReader<S, R> {
    source_reader: S,
    repair_reader: R,
    scheme: FecScheme,
    config: FecReaderConfig,
    parser: Parser,

    codec: Option<(usize, usize, BlockCodec)>,

    started: bool,
    cur_sbn: BlockNum,
    blocks: VecDeque<Block>,
    pending: VecDeque<Packet>,

    n_restored: u64,
    n_abandoned: u64,
}

impl<S: PacketReader, R: PacketReader> BlockReader<S, R> {
    /// Create a FEC reader combining a source and a repair stream.
    pub fn new(
        source_reader: S,
        repair_reader: R,
        scheme: FecScheme,
        config: FecReaderConfig,
    ) -> Self {
        debug!(scheme = %scheme, "fec reader: initializing");

        BlockReader {
            source_reader,
            repair_reader,
            scheme,
            parser: Parser::source(scheme),
            codec: None,
            started: false,
            cur_sbn: 0,
            blocks: VecDeque::new(),
            pending: VecDeque::new(),
            config,
            n_restored: 0,
            n_abandoned: 0,
        }
    }

    /// Number of source packets reconstructed from repair symbols.
    pub fn num_restored(&self) -> u64 {
        self.n_restored
    }

    /// Number of blocks delivered with unrecovered gaps.
    pub fn num_abandoned(&self) -> u64 {
        self.n_abandoned
    }

    fn fetch(&mut self) {
        loop {
            let packet = match self.source_reader.read_packet() {
                Some(packet) => packet,
                None => break,
            };
            if !self.started {
                if let Some(fec) = &packet.fec {
                    self.started = true;
                    self.cur_sbn = fec.source_block_number;
                    debug!(sbn = self.cur_sbn, "fec reader: anchored on first block");
                }
            }
            self.place(packet);
        }

        loop {
            let packet = match self.repair_reader.read_packet() {
                Some(packet) => packet,
                None => break,
            };
            if !self.started {
                // Nothing to anchor the window on yet.
                continue;
            }
            self.place(packet);
        }
    }

    fn place(&mut self, packet: Packet) {
        let fec = match &packet.fec {
            Some(fec) => fec.clone(),
            None => {
                warn!("fec reader: dropping packet without fec view");
                return;
            }
        };

        let dist = units::blknum_diff(fec.source_block_number, self.cur_sbn);
        if dist < 0 {
            debug!(
                sbn = fec.source_block_number,
                cur = self.cur_sbn,
                "fec reader: dropping symbol of stale block"
            );
            return;
        }
        let index = dist as usize;
        if index >= self.config.max_blocks {
            warn!(
                sbn = fec.source_block_number,
                cur = self.cur_sbn,
                "fec reader: dropping symbol beyond window"
            );
            return;
        }

        while self.blocks.len() <= index {
            self.blocks.push_back(Block::empty());
        }

        let block = &mut self.blocks[index];
        if !block.has_geometry() {
            block.set_geometry(fec.source_block_length, fec.block_length);
        } else if block.n_source != fec.source_block_length
            || block.n_total != fec.block_length
        {
            warn!("fec reader: dropping symbol with mismatched block geometry");
            return;
        }

        block.place(fec.encoding_symbol_id as usize, packet);
    }

    fn blocks_ahead(&self) -> usize {
        self.blocks
            .iter()
            .enumerate()
            .rev()
            .find(|(_, block)| block.n_present != 0)
            .map(|(i, _)| i)
            .unwrap_or(0)
    }

    /// Try to resolve the head block. Returns true if the window advanced.
    fn try_advance(&mut self) -> bool {
        let Some(head) = self.blocks.front() else {
            return false;
        };

        if head.has_geometry() {
            if head.n_source_present == head.n_source {
                self.deliver_head(false);
                return true;
            }
            if head.n_present >= head.n_source {
                self.decode_head();
                self.deliver_head(false);
                return true;
            }
        }

        if self.blocks_ahead() > self.config.max_block_advance {
            debug!(sbn = self.cur_sbn, "fec reader: abandoning incomplete block");
            self.n_abandoned += 1;
            self.deliver_head(true);
            return true;
        }

        false
    }

    fn decode_head(&mut self) {
        let head = self.blocks.front_mut().unwrap();
        let (n_source, n_total) = (head.n_source, head.n_total);

        let codec = match &self.codec {
            Some((k, n, _)) if *k == n_source && *n == n_total - n_source => {
                &self.codec.as_ref().unwrap().2
            }
            _ => {
                match BlockCodec::new(self.scheme, n_source, n_total - n_source) {
                    Ok(codec) => {
                        self.codec = Some((n_source, n_total - n_source, codec));
                        &self.codec.as_ref().unwrap().2
                    }
                    Err(err) => {
                        warn!(%err, "fec reader: can't create codec for block");
                        return;
                    }
                }
            }
        };
        let head = self.blocks.front_mut().unwrap();

        let symbol_len = match head.packets[n_source..]
            .iter()
            .flatten()
            .map(|p| p.rtp.as_ref().map(|rtp| rtp.payload.len()).unwrap_or(0))
            .max()
        {
            Some(len) if len > 0 => len,
            _ => {
                warn!("fec reader: no repair symbols to decode with");
                return;
            }
        };

        let mut symbols: Vec<Option<Vec<u8>>> = head
            .packets
            .iter()
            .enumerate()
            .map(|(esi, slot)| {
                slot.as_ref().map(|packet| {
                    if esi < n_source {
                        pack_symbol(packet.data(), symbol_len)
                    } else {
                        packet
                            .rtp
                            .as_ref()
                            .map(|rtp| rtp.payload.to_vec())
                            .unwrap_or_default()
                    }
                })
            })
            .collect();

        if let Err(err) = codec.decode(&mut symbols) {
            warn!(%err, "fec reader: block decode failed");
            return;
        }

        for esi in 0..n_source {
            if head.packets[esi].is_some() {
                continue;
            }
            let Some(symbol) = &symbols[esi] else { continue };

            let restored = unpack_symbol(symbol)
                .map(|bytes| Bytes::copy_from_slice(bytes))
                .and_then(|bytes| self.parser.parse(bytes));

            match restored {
                Ok(mut packet) => {
                    packet.add_flags(PacketFlags::RESTORED);
                    self.n_restored += 1;
                    head.place(esi, packet);
                }
                Err(err) => {
                    warn!(%err, esi, "fec reader: can't parse restored packet");
                }
            }
        }
    }

    /// Pop the head block into the delivery queue, in symbol order.
    fn deliver_head(&mut self, incomplete: bool) {
        let head = self.blocks.pop_front().unwrap();
        if incomplete && head.has_geometry() {
            debug!(
                present = head.n_source_present,
                expected = head.n_source,
                "fec reader: delivering block with gaps"
            );
        }

        let n_source = head.n_source;
        self.pending
            .extend(head.packets.into_iter().take(n_source).flatten());

        self.cur_sbn = self.cur_sbn.wrapping_add(1);
        if self.blocks.is_empty() {
            self.blocks.push_back(Block::empty());
        }
    }
}

impl<S: PacketReader, R: PacketReader> PacketReader for BlockReader<S, R> {
    fn read_packet(&mut self) -> Option<Packet> {
        loop {
            if let Some(packet) = self.pending.pop_front() {
                return Some(packet);
            }

            self.fetch();

            if !self.started {
                return None;
            }

            if !self.try_advance() {
                return None;
            }
        }
    }
}
