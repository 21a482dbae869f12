//! Asynchronous sample-rate conversion.
//!
//! A resampler is a pure sample pipe: input samples are pushed into it, the
//! resampled output is popped out, and the effective ratio can be rescaled at
//! run time by the latency monitor. Timestamps and flags are not interpreted
//! here; the reader/writer adapters snapshot them at push time and restore
//! them proportionally at pop time.

mod builtin;

pub use builtin::BuiltinResampler;

use rstream_rtp_core::Nanoseconds;
use tracing::debug;

use crate::frame::{Frame, FrameFlags, FrameReader, FrameWriter};
use crate::sample::SampleSpec;
use crate::Sample;

/// Resampler quality profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResamplerProfile {
    /// Cheapest: linear interpolation.
    Low,
    /// Default windowed-sinc quality.
    #[default]
    Medium,
    /// Widest interpolation window.
    High,
}

/// Resampler backend selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResamplerBackend {
    /// Built-in polyphase windowed-sinc implementation.
    #[default]
    Builtin,
}

/// Asynchronous sample-rate converter.
///
/// Resampler backends are the extensible seam of the frame pipeline, hence
/// the trait object rather than enum dispatch.
pub trait Resampler: Send {
    /// Update the effective ratio to `(in_rate / out_rate) * multiplier`.
    ///
    /// Returns false, leaving the previous state intact, when the multiplier
    /// is outside the sane window (0.5x to 2.0x nominal) or a rate is zero.
    fn set_scaling(&mut self, in_rate: u32, out_rate: u32, multiplier: f64) -> bool;

    /// Borrow the staging buffer for input samples. The caller fills it and
    /// then calls [`end_push_input`](Resampler::end_push_input).
    fn begin_push_input(&mut self) -> &mut Vec<Sample>;

    /// Append the staged samples to the input ring.
    fn end_push_input(&mut self);

    /// Drain up to `out.len()` resampled samples; may return fewer when the
    /// input side is starved.
    fn pop_output(&mut self, out: &mut [Sample]) -> usize;

    /// Residual buffered input, measured in output-time samples.
    fn n_left_to_process(&self) -> f64;

    /// Current effective ratio (input frames per output frame).
    fn ratio(&self) -> f64;
}

/// Instantiate a resampler backend.
pub fn new_resampler(
    backend: ResamplerBackend,
    profile: ResamplerProfile,
    in_spec: &SampleSpec,
    out_spec: &SampleSpec,
) -> Box<dyn Resampler> {
    debug_assert_eq!(in_spec.num_channels(), out_spec.num_channels());

    match backend {
        ResamplerBackend::Builtin => Box::new(BuiltinResampler::new(
            in_spec.num_channels(),
            in_spec.sample_rate(),
            out_spec.sample_rate(),
            profile,
        )),
    }
}

/// Upper bound on input frames pulled from the inner reader in one round.
const MAX_CHUNK_FRAMES: usize = 4096;

/// Extra input frames pulled beyond the computed demand, covering the
/// interpolation window and ratio rounding.
const CHUNK_MARGIN_FRAMES: usize = 8;

/// Pull-side resampler adapter: reads input frames from an inner reader and
/// produces frames at the output rate.
///
/// Input is pulled on demand, sized to the unfilled part of the output
/// frame, so the adapter never drains the upstream queue further than the
/// output clock requires.
pub struct ResamplerReader<R> {
    reader: R,
    resampler: Box<dyn Resampler>,
    in_spec: SampleSpec,
    out_spec: SampleSpec,

    /// Flags of the samples currently buffered inside the resampler,
    /// refreshed at each pull.
    stream_flags: FrameFlags,
    /// Capture time of the end of all input pushed so far; zero if unknown.
    input_tail_cts: Nanoseconds,
}

impl<R: FrameReader> ResamplerReader<R> {
    /// Create a resampling reader.
    pub fn new(
        reader: R,
        resampler: Box<dyn Resampler>,
        in_spec: SampleSpec,
        out_spec: SampleSpec,
    ) -> Self {
        debug!(
            in_rate = in_spec.sample_rate(),
            out_rate = out_spec.sample_rate(),
            "resampler reader: initializing"
        );

        ResamplerReader {
            reader,
            resampler,
            in_spec,
            out_spec,
            stream_flags: FrameFlags::empty(),
            input_tail_cts: 0,
        }
    }

    /// Rescale the conversion ratio. Returns false if the multiplier is out
    /// of bounds.
    pub fn set_scaling(&mut self, multiplier: f64) -> bool {
        self.resampler.set_scaling(
            self.in_spec.sample_rate(),
            self.out_spec.sample_rate(),
            multiplier,
        )
    }

    fn push_chunk(&mut self, needed_out_frames: usize) -> bool {
        let n_frames = ((needed_out_frames as f64 * self.resampler.ratio()).ceil()
            as usize
            + CHUNK_MARGIN_FRAMES)
            .min(MAX_CHUNK_FRAMES);
        let n_samples = n_frames * self.in_spec.num_channels();

        let staging = self.resampler.begin_push_input();
        staging.resize(n_samples, 0.0);

        let mut in_frame = Frame::new(staging);
        if !self.reader.read_frame(&mut in_frame) {
            self.resampler.end_push_input();
            return false;
        }

        let flags = in_frame.flags();
        let cts = in_frame.capture_timestamp();
        self.resampler.end_push_input();

        self.stream_flags = flags;
        if cts != 0 {
            self.input_tail_cts = cts + self.in_spec.samples_per_chan_to_ns(n_frames);
        }
        true
    }

    /// Capture time of the input sample the resampler will consume next.
    fn current_cts(&self) -> Nanoseconds {
        if self.input_tail_cts == 0 {
            return 0;
        }
        let left_in_frames = self.resampler.n_left_to_process() * self.resampler.ratio()
            / self.in_spec.num_channels() as f64;
        self.input_tail_cts
            - (left_in_frames / self.in_spec.sample_rate() as f64
                * rstream_rtp_core::SECOND as f64) as Nanoseconds
    }
}

impl<R: FrameReader> FrameReader for ResamplerReader<R> {
    fn read_frame(&mut self, frame: &mut Frame<'_>) -> bool {
        let cts = self.current_cts();
        let out_channels = self.out_spec.num_channels();

        let mut flags = self.stream_flags;
        let mut pos = 0;
        while pos < frame.num_samples() {
            let n = self
                .resampler
                .pop_output(&mut frame.samples_mut()[pos..]);
            pos += n;

            if pos < frame.num_samples() {
                let needed = (frame.num_samples() - pos) / out_channels;
                if !self.push_chunk(needed.max(1)) {
                    return false;
                }
                flags |= self.stream_flags;
            }
        }

        frame.set_flags(flags);
        if cts > 0 {
            frame.set_capture_timestamp(cts);
        }
        true
    }
}

/// Push-side resampler adapter: converts written frames to the output rate
/// and forwards them to an inner writer.
pub struct ResamplerWriter<W> {
    writer: W,
    resampler: Box<dyn Resampler>,
    in_spec: SampleSpec,
    out_spec: SampleSpec,
    scratch: Vec<Sample>,
    input_tail_cts: Nanoseconds,
}

impl<W: FrameWriter> ResamplerWriter<W> {
    /// Create a resampling writer.
    pub fn new(
        writer: W,
        resampler: Box<dyn Resampler>,
        in_spec: SampleSpec,
        out_spec: SampleSpec,
    ) -> Self {
        let scratch = vec![0.0; 512 * out_spec.num_channels()];
        ResamplerWriter {
            writer,
            resampler,
            in_spec,
            out_spec,
            scratch,
            input_tail_cts: 0,
        }
    }

    /// Rescale the conversion ratio.
    pub fn set_scaling(&mut self, multiplier: f64) -> bool {
        self.resampler.set_scaling(
            self.in_spec.sample_rate(),
            self.out_spec.sample_rate(),
            multiplier,
        )
    }
}

impl<W: FrameWriter> FrameWriter for ResamplerWriter<W> {
    fn write_frame(&mut self, frame: &Frame<'_>) {
        let staging = self.resampler.begin_push_input();
        staging.extend_from_slice(frame.samples());
        self.resampler.end_push_input();

        if frame.capture_timestamp() != 0 {
            let frames = frame.num_samples() / self.in_spec.num_channels();
            self.input_tail_cts = frame.capture_timestamp()
                + self.in_spec.samples_per_chan_to_ns(frames);
        }

        loop {
            let left_out_frames =
                self.resampler.n_left_to_process() / self.out_spec.num_channels() as f64;

            let n = self.resampler.pop_output(&mut self.scratch);
            if n == 0 {
                break;
            }

            let mut out_frame = Frame::new(&mut self.scratch[..n]);
            out_frame.set_flags(frame.flags());
            if self.input_tail_cts != 0 {
                let cts = self.input_tail_cts
                    - (left_out_frames / self.out_spec.sample_rate() as f64
                        * rstream_rtp_core::SECOND as f64) as Nanoseconds;
                if cts > 0 {
                    out_frame.set_capture_timestamp(cts);
                }
            }
            self.writer.write_frame(&out_frame);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelSet, MASK_MONO};

    fn mono_spec(rate: u32) -> SampleSpec {
        SampleSpec::new(rate, ChannelSet::surround(MASK_MONO).unwrap()).unwrap()
    }

    struct SineReader {
        phase: f64,
        step: f64,
    }

    impl FrameReader for SineReader {
        fn read_frame(&mut self, frame: &mut Frame<'_>) -> bool {
            for sample in frame.samples_mut() {
                *sample = self.phase.sin() as Sample;
                self.phase += self.step;
            }
            frame.set_flags(FrameFlags::NONBLANK);
            true
        }
    }

    #[test]
    fn test_reader_produces_requested_frames() {
        let in_spec = mono_spec(44100);
        let out_spec = mono_spec(48000);
        let resampler = new_resampler(
            ResamplerBackend::Builtin,
            ResamplerProfile::Medium,
            &in_spec,
            &out_spec,
        );

        let inner = SineReader {
            phase: 0.0,
            step: 2.0 * std::f64::consts::PI * 440.0 / 44100.0,
        };
        let mut reader = ResamplerReader::new(inner, resampler, in_spec, out_spec);

        let mut buf = vec![0.0f32; 960];
        let mut frame = Frame::new(&mut buf);
        assert!(reader.read_frame(&mut frame));
        assert!(frame.flags().contains(FrameFlags::NONBLANK));
        assert!(frame.samples().iter().any(|&s| s != 0.0));
    }

    #[test]
    fn test_reader_scaling_rejected_out_of_window() {
        let spec = mono_spec(44100);
        let resampler = new_resampler(
            ResamplerBackend::Builtin,
            ResamplerProfile::Low,
            &spec,
            &spec,
        );
        let inner = SineReader {
            phase: 0.0,
            step: 0.1,
        };
        let mut reader = ResamplerReader::new(inner, resampler, spec, spec);

        assert!(reader.set_scaling(1.01));
        assert!(!reader.set_scaling(3.0));
    }

    struct Capture(std::rc::Rc<std::cell::RefCell<Vec<Sample>>>);

    impl FrameWriter for Capture {
        fn write_frame(&mut self, frame: &Frame<'_>) {
            self.0.borrow_mut().extend_from_slice(frame.samples());
        }
    }

    #[test]
    fn test_writer_converts_rate() {
        let in_spec = mono_spec(48000);
        let out_spec = mono_spec(24000);
        let resampler = new_resampler(
            ResamplerBackend::Builtin,
            ResamplerProfile::Medium,
            &in_spec,
            &out_spec,
        );

        let sink = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
        let mut writer =
            ResamplerWriter::new(Capture(sink.clone()), resampler, in_spec, out_spec);

        let mut buf: Vec<Sample> = (0..4800)
            .map(|i| ((i as f64) * 0.01).sin() as Sample)
            .collect();
        let frame = Frame::new(&mut buf);
        writer.write_frame(&frame);

        let written = sink.borrow().len();
        assert!(
            (written as f64 - 2400.0).abs() < 100.0,
            "unexpected output count {written}"
        );
    }
}
