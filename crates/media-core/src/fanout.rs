//! Duplication of one frame stream to several sinks.

use crate::frame::{Frame, FrameWriter};

/// Duplicates written frames to every output writer.
///
/// Like the mixer, the fanout does not own its outputs; the caller passes
/// the writers of the currently configured slots to every write. A failure
/// in one output never short-circuits the others.
#[derive(Default)]
pub struct Fanout;

impl Fanout {
    /// Create a fanout.
    pub fn new() -> Self {
        Fanout
    }

    /// Write one frame to all `writers`.
    pub fn write_frame(&mut self, frame: &Frame<'_>, writers: &mut [&mut dyn FrameWriter]) {
        for writer in writers.iter_mut() {
            writer.write_frame(frame);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Capture {
        frames: usize,
        samples: Vec<f32>,
    }

    impl FrameWriter for Capture {
        fn write_frame(&mut self, frame: &Frame<'_>) {
            self.frames += 1;
            self.samples.extend_from_slice(frame.samples());
        }
    }

    #[test]
    fn test_duplicates_to_all() {
        let mut fanout = Fanout::new();
        let mut a = Capture::default();
        let mut b = Capture::default();

        let mut buf = [0.5f32; 8];
        let frame = Frame::new(&mut buf);
        let mut writers: Vec<&mut dyn FrameWriter> = vec![&mut a, &mut b];
        fanout.write_frame(&frame, &mut writers);

        assert_eq!(a.frames, 1);
        assert_eq!(b.frames, 1);
        assert_eq!(a.samples, b.samples);
    }
}
