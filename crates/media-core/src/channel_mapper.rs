//! Channel layout conversion.
//!
//! A mapper converts interleaved samples between two channel sets. For
//! surround-to-surround conversions it applies a mixing matrix computed once
//! at construction from a table of known downmix rules (used reversed for
//! upmixing) and normalized so each output channel preserves total energy.
//! Conversions involving multitrack sets copy matching channels and zeroize
//! the rest.

use tracing::debug;

use crate::channel::{
    ChannelLayout, ChannelPosition, ChannelSet, MASK_MONO, MASK_STEREO, MASK_SURROUND_5_1,
    NUM_POSITIONS,
};
use crate::frame::{Frame, FrameFlags, FrameReader, FrameWriter};
use crate::sample::SampleSpec;
use crate::{Sample, SAMPLE_MAX, SAMPLE_MIN};

/// One downmix rule: `out_ch` receives `in_ch` scaled by `coeff`.
struct MapRule {
    out_ch: ChannelPosition,
    in_ch: ChannelPosition,
    coeff: f32,
}

/// A known transformation between two surround mask families.
struct ChannelMap {
    name: &'static str,
    /// Wider (source) mask of the downmix direction.
    in_mask: u64,
    /// Narrower (destination) mask of the downmix direction.
    out_mask: u64,
    rules: &'static [MapRule],
}

use ChannelPosition::*;

const CHANNEL_MAPS: &[ChannelMap] = &[
    ChannelMap {
        name: "stereo<->mono",
        in_mask: MASK_STEREO,
        out_mask: MASK_MONO,
        rules: &[
            MapRule { out_ch: FrontLeft, in_ch: FrontLeft, coeff: 1.0 },
            MapRule { out_ch: FrontLeft, in_ch: FrontRight, coeff: 1.0 },
        ],
    },
    ChannelMap {
        name: "5.1<->stereo",
        in_mask: MASK_SURROUND_5_1,
        out_mask: MASK_STEREO,
        rules: &[
            MapRule { out_ch: FrontLeft, in_ch: FrontLeft, coeff: 1.0 },
            MapRule { out_ch: FrontLeft, in_ch: FrontCenter, coeff: 0.707 },
            MapRule { out_ch: FrontLeft, in_ch: BackLeft, coeff: 0.707 },
            MapRule { out_ch: FrontLeft, in_ch: LowFrequency, coeff: 0.5 },
            MapRule { out_ch: FrontRight, in_ch: FrontRight, coeff: 1.0 },
            MapRule { out_ch: FrontRight, in_ch: FrontCenter, coeff: 0.707 },
            MapRule { out_ch: FrontRight, in_ch: BackRight, coeff: 0.707 },
            MapRule { out_ch: FrontRight, in_ch: LowFrequency, coeff: 0.5 },
        ],
    },
];

/// Converts interleaved samples between two channel sets.
pub struct ChannelMapper {
    in_chans: ChannelSet,
    out_chans: ChannelSet,
    /// `matrix[out_offset][in_offset]`; used for surround-to-surround only.
    matrix: Vec<Vec<f32>>,
}

impl ChannelMapper {
    /// Create a mapper between two channel sets.
    pub fn new(in_chans: ChannelSet, out_chans: ChannelSet) -> Self {
        let mut mapper = ChannelMapper {
            in_chans,
            out_chans,
            matrix: Vec::new(),
        };
        if in_chans.layout() == ChannelLayout::Surround
            && out_chans.layout() == ChannelLayout::Surround
        {
            mapper.build_matrix();
        }
        mapper
    }

    /// Map `n_frames` interleaved frames from `input` to `output`.
    ///
    /// `input` must hold `n_frames * in_channels` samples and `output`
    /// `n_frames * out_channels`.
    pub fn map(&self, input: &[Sample], output: &mut [Sample], n_frames: usize) {
        debug_assert_eq!(input.len(), n_frames * self.in_chans.num_channels());
        debug_assert_eq!(output.len(), n_frames * self.out_chans.num_channels());

        match (self.in_chans.layout(), self.out_chans.layout()) {
            (ChannelLayout::Surround, ChannelLayout::Surround) => {
                self.map_surround(input, output, n_frames)
            }
            _ => self.map_multitrack(input, output, n_frames),
        }
    }

    fn map_surround(&self, input: &[Sample], output: &mut [Sample], n_frames: usize) {
        let n_in = self.in_chans.num_channels();
        let n_out = self.out_chans.num_channels();

        for f in 0..n_frames {
            let in_frame = &input[f * n_in..(f + 1) * n_in];
            for (out_off, out_sample) in
                output[f * n_out..(f + 1) * n_out].iter_mut().enumerate()
            {
                let mut acc = 0.0f32;
                for (in_off, &in_sample) in in_frame.iter().enumerate() {
                    acc += in_sample * self.matrix[out_off][in_off];
                }
                *out_sample = acc.clamp(SAMPLE_MIN, SAMPLE_MAX);
            }
        }
    }

    /// Copy channels present in both sets, zeroize the rest. Tracks are
    /// matched by channel bit.
    fn map_multitrack(&self, input: &[Sample], output: &mut [Sample], n_frames: usize) {
        let n_in = self.in_chans.num_channels();
        let n_out = self.out_chans.num_channels();

        for f in 0..n_frames {
            let in_frame = &input[f * n_in..(f + 1) * n_in];
            let out_frame = &mut output[f * n_out..(f + 1) * n_out];
            out_frame.fill(0.0);

            for ch in self.out_chans.channels() {
                if let (Some(out_off), Some(in_off)) = (
                    self.out_chans.channel_offset(ch),
                    self.in_chans.channel_offset(ch),
                ) {
                    out_frame[out_off] = in_frame[in_off];
                }
            }
        }
    }

    fn build_matrix(&mut self) {
        let n_in = self.in_chans.num_channels();
        let n_out = self.out_chans.num_channels();
        self.matrix = vec![vec![0.0f32; n_in]; n_out];

        // Find a table map covering the transformation, in either direction.
        let mut selected: Option<(&ChannelMap, bool)> = None;
        if self.in_chans != self.out_chans {
            for map in CHANNEL_MAPS {
                if self.out_chans.is_subset_of(map.out_mask)
                    && self.in_chans.is_subset_of(map.in_mask)
                {
                    selected = Some((map, false));
                    break;
                }
                if self.in_chans.is_subset_of(map.out_mask)
                    && self.out_chans.is_subset_of(map.in_mask)
                {
                    selected = Some((map, true));
                    break;
                }
            }
        }

        match selected {
            Some((map, is_reverse)) => {
                debug!(
                    map = map.name,
                    is_reverse,
                    in_chans = %self.in_chans,
                    out_chans = %self.out_chans,
                    "channel mapper: selected mapping"
                );

                for rule in map.rules {
                    let (out_ch, in_ch, coeff) = if is_reverse {
                        (rule.in_ch as usize, rule.out_ch as usize, 1.0 / rule.coeff)
                    } else {
                        (rule.out_ch as usize, rule.in_ch as usize, rule.coeff)
                    };

                    if let (Some(out_off), Some(in_off)) = (
                        self.out_chans.channel_offset(out_ch),
                        self.in_chans.channel_offset(in_ch),
                    ) {
                        self.matrix[out_off][in_off] = coeff;
                    }
                }

                // Normalize each output row to preserve total energy.
                for row in &mut self.matrix {
                    let sum: f32 = row.iter().sum();
                    if sum != 0.0 {
                        for coeff in row.iter_mut() {
                            *coeff /= sum;
                        }
                    }
                }
            }
            None => {
                // Identical sets or no known map: diagonal fallback.
                for ch in 0..NUM_POSITIONS {
                    if let (Some(out_off), Some(in_off)) = (
                        self.out_chans.channel_offset(ch),
                        self.in_chans.channel_offset(ch),
                    ) {
                        self.matrix[out_off][in_off] = 1.0;
                    }
                }
            }
        }
    }
}

/// Number of samples in the conversion scratch buffer.
const SCRATCH_SAMPLES: usize = 4096;

/// Pull-side channel mapper: reads input frames from an inner reader and
/// produces frames in the output channel set.
pub struct ChannelMapperReader<R> {
    reader: R,
    mapper: ChannelMapper,
    in_spec: SampleSpec,
    out_spec: SampleSpec,
    scratch: Vec<Sample>,
}

impl<R: FrameReader> ChannelMapperReader<R> {
    /// Create a mapping reader. Input and output specs must share the rate.
    pub fn new(reader: R, in_spec: SampleSpec, out_spec: SampleSpec) -> Self {
        debug_assert_eq!(in_spec.sample_rate(), out_spec.sample_rate());

        let chunk_frames = SCRATCH_SAMPLES / in_spec.num_channels();
        ChannelMapperReader {
            reader,
            mapper: ChannelMapper::new(in_spec.channel_set(), out_spec.channel_set()),
            in_spec,
            out_spec,
            scratch: vec![0.0; chunk_frames * in_spec.num_channels()],
        }
    }
}

impl<R: FrameReader> FrameReader for ChannelMapperReader<R> {
    fn read_frame(&mut self, frame: &mut Frame<'_>) -> bool {
        let n_out = self.out_spec.num_channels();
        let n_in = self.in_spec.num_channels();
        debug_assert!(frame.num_samples() % n_out == 0);

        let chunk_frames = self.scratch.len() / n_in;
        let total_frames = frame.num_samples() / n_out;

        let mut flags = FrameFlags::empty();
        let mut capture_ts = 0;

        let mut frame_pos = 0;
        while frame_pos < total_frames {
            let n_frames = chunk_frames.min(total_frames - frame_pos);

            let mut in_frame = Frame::new(&mut self.scratch[..n_frames * n_in]);
            if !self.reader.read_frame(&mut in_frame) {
                return false;
            }

            flags |= in_frame.flags();
            if capture_ts == 0 && in_frame.capture_timestamp() != 0 {
                // Translate back to the frame start; sub-reads before this
                // one carried no timestamp.
                capture_ts = in_frame.capture_timestamp()
                    - self
                        .in_spec
                        .samples_per_chan_to_ns(frame_pos);
            }

            let out_begin = frame_pos * n_out;
            self.mapper.map(
                in_frame.samples(),
                &mut frame.samples_mut()[out_begin..out_begin + n_frames * n_out],
                n_frames,
            );

            frame_pos += n_frames;
        }

        frame.set_flags(flags);
        if capture_ts > 0 {
            frame.set_capture_timestamp(capture_ts);
        }
        true
    }
}

/// Push-side channel mapper: maps written frames into the output channel set
/// and forwards them to an inner writer.
pub struct ChannelMapperWriter<W> {
    writer: W,
    mapper: ChannelMapper,
    in_spec: SampleSpec,
    out_spec: SampleSpec,
    scratch: Vec<Sample>,
}

impl<W: FrameWriter> ChannelMapperWriter<W> {
    /// Create a mapping writer. Input and output specs must share the rate.
    pub fn new(writer: W, in_spec: SampleSpec, out_spec: SampleSpec) -> Self {
        debug_assert_eq!(in_spec.sample_rate(), out_spec.sample_rate());

        let chunk_frames = SCRATCH_SAMPLES / out_spec.num_channels();
        ChannelMapperWriter {
            writer,
            mapper: ChannelMapper::new(in_spec.channel_set(), out_spec.channel_set()),
            in_spec,
            out_spec,
            scratch: vec![0.0; chunk_frames * out_spec.num_channels()],
        }
    }
}

impl<W: FrameWriter> FrameWriter for ChannelMapperWriter<W> {
    fn write_frame(&mut self, frame: &Frame<'_>) {
        let n_in = self.in_spec.num_channels();
        let n_out = self.out_spec.num_channels();
        debug_assert!(frame.num_samples() % n_in == 0);

        let chunk_frames = self.scratch.len() / n_out;
        let total_frames = frame.num_samples() / n_in;

        let mut frame_pos = 0;
        while frame_pos < total_frames {
            let n_frames = chunk_frames.min(total_frames - frame_pos);

            let in_begin = frame_pos * n_in;
            self.mapper.map(
                &frame.samples()[in_begin..in_begin + n_frames * n_in],
                &mut self.scratch[..n_frames * n_out],
                n_frames,
            );

            let mut out_frame = Frame::new(&mut self.scratch[..n_frames * n_out]);
            out_frame.set_flags(frame.flags());
            if frame.capture_timestamp() != 0 {
                out_frame.set_capture_timestamp(
                    frame.capture_timestamp()
                        + self.in_spec.samples_per_chan_to_ns(frame_pos),
                );
            }
            self.writer.write_frame(&out_frame);

            frame_pos += n_frames;
        }
    }
}
