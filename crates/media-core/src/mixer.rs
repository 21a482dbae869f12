//! Mixing of concurrent frame streams.

use rstream_rtp_core::Nanoseconds;

use crate::frame::{Frame, FrameFlags, FrameReader};
use crate::{Sample, SAMPLE_MAX, SAMPLE_MIN};

/// Samples in the mixing scratch buffer.
const SCRATCH_SAMPLES: usize = 4096;

/// Sums any number of frame streams into one output stream.
///
/// The mixer does not own its inputs; the caller passes the readers of the
/// currently live sessions to every read. An input that fails contributes
/// silence. Summing saturates at the nominal sample range, and output flags
/// are the union of all input flags. When inputs carry capture timestamps,
/// the output carries their average.
pub struct Mixer {
    scratch: Vec<Sample>,
    enable_timestamps: bool,
}

impl Mixer {
    /// Create a mixer. `enable_timestamps` controls whether capture
    /// timestamps are averaged into output frames or zeroed.
    pub fn new(enable_timestamps: bool) -> Self {
        Mixer {
            scratch: vec![0.0; SCRATCH_SAMPLES],
            enable_timestamps,
        }
    }

    /// Mix one frame from all `readers`.
    pub fn read_frame(
        &mut self,
        frame: &mut Frame<'_>,
        readers: &mut [&mut dyn FrameReader],
    ) -> bool {
        // Single-input sessions skip the scratch pass entirely. A failed
        // input contributes silence, same as in the general path.
        if readers.len() == 1 {
            if !readers[0].read_frame(frame) {
                frame.samples_mut().fill(0.0);
                frame.set_flags(FrameFlags::empty());
            }
            if !self.enable_timestamps {
                frame.set_capture_timestamp(0);
            }
            return true;
        }

        let mut flags = FrameFlags::empty();
        let mut capture_ts = 0;

        let total = frame.num_samples();
        let mut pos = 0;
        while pos < total {
            let n_samples = SCRATCH_SAMPLES.min(total - pos);
            self.mix_chunk(
                &mut frame.samples_mut()[pos..pos + n_samples],
                readers,
                &mut flags,
                &mut capture_ts,
            );
            pos += n_samples;
        }

        frame.set_flags(flags);
        if self.enable_timestamps && capture_ts > 0 {
            frame.set_capture_timestamp(capture_ts);
        }
        true
    }

    fn mix_chunk(
        &mut self,
        out: &mut [Sample],
        readers: &mut [&mut dyn FrameReader],
        flags: &mut FrameFlags,
        capture_ts: &mut Nanoseconds,
    ) {
        out.fill(0.0);

        let mut cts_base: Nanoseconds = 0;
        let mut cts_sum = 0.0f64;
        let mut cts_count = 0usize;

        for reader in readers.iter_mut() {
            let mut temp = Frame::new(&mut self.scratch[..out.len()]);
            if !reader.read_frame(&mut temp) {
                continue;
            }

            *flags |= temp.flags();

            for (out_sample, &in_sample) in out.iter_mut().zip(temp.samples().iter()) {
                *out_sample = (*out_sample + in_sample).clamp(SAMPLE_MIN, SAMPLE_MAX);
            }

            let frame_cts = temp.capture_timestamp();
            if self.enable_timestamps && frame_cts != 0 {
                // Accumulate base-subtracted values; inputs are synchronous
                // and close, so the deltas stay small and precise.
                if cts_base == 0 {
                    cts_base = frame_cts;
                }
                cts_sum += (frame_cts - cts_base) as f64;
                cts_count += 1;
            }
        }

        if cts_count != 0 {
            // Average of the inputs that carried a timestamp; inputs without
            // one do not dilute it.
            *capture_ts = cts_base + (cts_sum / cts_count as f64) as Nanoseconds;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ConstReader {
        value: Sample,
        flags: FrameFlags,
        cts: Nanoseconds,
        ok: bool,
    }

    impl ConstReader {
        fn new(value: Sample) -> Self {
            ConstReader {
                value,
                flags: FrameFlags::NONBLANK,
                cts: 0,
                ok: true,
            }
        }
    }

    impl FrameReader for ConstReader {
        fn read_frame(&mut self, frame: &mut Frame<'_>) -> bool {
            if !self.ok {
                return false;
            }
            frame.samples_mut().fill(self.value);
            frame.set_flags(self.flags);
            if self.cts != 0 {
                frame.set_capture_timestamp(self.cts);
            }
            true
        }
    }

    #[test]
    fn test_sums_inputs() {
        let mut mixer = Mixer::new(false);
        let mut a = ConstReader::new(0.25);
        let mut b = ConstReader::new(0.5);

        let mut buf = [0.0f32; 16];
        let mut frame = Frame::new(&mut buf);
        let mut readers: Vec<&mut dyn FrameReader> = vec![&mut a, &mut b];
        assert!(mixer.read_frame(&mut frame, &mut readers));

        assert!(frame.samples().iter().all(|&s| (s - 0.75).abs() < 1e-6));
        assert!(frame.flags().contains(FrameFlags::NONBLANK));
    }

    #[test]
    fn test_saturates_at_extremes() {
        let mut mixer = Mixer::new(false);
        let mut a = ConstReader::new(0.8);
        let mut b = ConstReader::new(0.9);

        let mut buf = [0.0f32; 4];
        let mut frame = Frame::new(&mut buf);
        let mut readers: Vec<&mut dyn FrameReader> = vec![&mut a, &mut b];
        mixer.read_frame(&mut frame, &mut readers);

        assert!(frame.samples().iter().all(|&s| s == SAMPLE_MAX));
    }

    #[test]
    fn test_failed_input_is_silence() {
        let mut mixer = Mixer::new(false);
        let mut a = ConstReader::new(0.25);
        let mut b = ConstReader::new(0.5);
        b.ok = false;

        let mut buf = [0.0f32; 8];
        let mut frame = Frame::new(&mut buf);
        let mut readers: Vec<&mut dyn FrameReader> = vec![&mut a, &mut b];
        assert!(mixer.read_frame(&mut frame, &mut readers));

        assert!(frame.samples().iter().all(|&s| (s - 0.25).abs() < 1e-6));
    }

    #[test]
    fn test_flags_accumulated() {
        let mut mixer = Mixer::new(false);
        let mut a = ConstReader::new(0.1);
        a.flags = FrameFlags::NONBLANK | FrameFlags::DROPS;
        let mut b = ConstReader::new(0.1);
        b.flags = FrameFlags::INCOMPLETE;

        let mut buf = [0.0f32; 4];
        let mut frame = Frame::new(&mut buf);
        let mut readers: Vec<&mut dyn FrameReader> = vec![&mut a, &mut b];
        mixer.read_frame(&mut frame, &mut readers);

        assert!(frame.flags().contains(FrameFlags::NONBLANK));
        assert!(frame.flags().contains(FrameFlags::DROPS));
        assert!(frame.flags().contains(FrameFlags::INCOMPLETE));
    }

    #[test]
    fn test_timestamps_averaged() {
        let mut mixer = Mixer::new(true);
        let mut a = ConstReader::new(0.1);
        a.cts = 1_000_000_000;
        let mut b = ConstReader::new(0.1);
        b.cts = 1_000_000_100;

        let mut buf = [0.0f32; 4];
        let mut frame = Frame::new(&mut buf);
        let mut readers: Vec<&mut dyn FrameReader> = vec![&mut a, &mut b];
        mixer.read_frame(&mut frame, &mut readers);

        assert_eq!(frame.capture_timestamp(), 1_000_000_050);
    }

    #[test]
    fn test_timestamps_average_skips_missing() {
        let mut mixer = Mixer::new(true);
        let mut a = ConstReader::new(0.1);
        a.cts = 1_000_000_000;
        let mut b = ConstReader::new(0.1);
        b.cts = 1_000_000_100;
        // No capture timestamp; must not dilute the average.
        let mut c = ConstReader::new(0.1);

        let mut buf = [0.0f32; 4];
        let mut frame = Frame::new(&mut buf);
        let mut readers: Vec<&mut dyn FrameReader> = vec![&mut a, &mut b, &mut c];
        mixer.read_frame(&mut frame, &mut readers);

        assert_eq!(frame.capture_timestamp(), 1_000_000_050);
    }

    #[test]
    fn test_single_reader_fast_path_zeroes_cts() {
        let mut mixer = Mixer::new(false);
        let mut a = ConstReader::new(0.3);
        a.cts = 42;

        let mut buf = [0.0f32; 4];
        let mut frame = Frame::new(&mut buf);
        let mut readers: Vec<&mut dyn FrameReader> = vec![&mut a];
        mixer.read_frame(&mut frame, &mut readers);

        assert_eq!(frame.capture_timestamp(), 0);
    }

    #[test]
    fn test_single_failed_reader_is_silence() {
        let mut mixer = Mixer::new(false);
        let mut a = ConstReader::new(0.3);
        a.ok = false;

        let mut buf = [1.0f32; 4];
        let mut frame = Frame::new(&mut buf);
        let mut readers: Vec<&mut dyn FrameReader> = vec![&mut a];
        assert!(mixer.read_frame(&mut frame, &mut readers));
        assert!(frame.samples().iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_no_readers_is_silence() {
        let mut mixer = Mixer::new(false);
        let mut buf = [1.0f32; 4];
        let mut frame = Frame::new(&mut buf);
        assert!(mixer.read_frame(&mut frame, &mut []));
        assert!(frame.samples().iter().all(|&s| s == 0.0));
    }
}
