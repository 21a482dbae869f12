//! Audio frames over borrowed sample storage.

use rstream_rtp_core::Nanoseconds;

/// Frame flags.
///
/// Flags describe how the frame was produced and are OR-combined as frames
/// travel up the pipeline: a frame assembled from several sub-reads carries
/// the union of the sub-frames' flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameFlags(u8);

impl FrameFlags {
    /// At least one sample comes from decoded audio.
    pub const NONBLANK: FrameFlags = FrameFlags(1 << 0);
    /// The frame is not fully covered by decoded audio.
    pub const INCOMPLETE: FrameFlags = FrameFlags(1 << 1);
    /// Packets were discarded while producing the frame.
    pub const DROPS: FrameFlags = FrameFlags(1 << 2);

    /// Empty flag set.
    pub const fn empty() -> Self {
        FrameFlags(0)
    }

    /// True if all bits of `other` are set in `self`.
    pub fn contains(self, other: FrameFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for FrameFlags {
    type Output = FrameFlags;

    fn bitor(self, rhs: FrameFlags) -> FrameFlags {
        FrameFlags(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for FrameFlags {
    fn bitor_assign(&mut self, rhs: FrameFlags) {
        self.0 |= rhs.0;
    }
}

/// A frame of interleaved samples borrowed from the caller.
///
/// The sample count must be a multiple of the stream's channel count; frames
/// are thin descriptors and must not outlive the read or write call that
/// produced their storage.
pub struct Frame<'a> {
    samples: &'a mut [crate::Sample],
    flags: FrameFlags,
    capture_timestamp: Nanoseconds,
}

impl<'a> Frame<'a> {
    /// Wrap a sample buffer into a frame with empty flags.
    pub fn new(samples: &'a mut [crate::Sample]) -> Self {
        Frame {
            samples,
            flags: FrameFlags::empty(),
            capture_timestamp: 0,
        }
    }

    /// Number of samples, all channels included.
    pub fn num_samples(&self) -> usize {
        self.samples.len()
    }

    /// Sample storage.
    pub fn samples(&self) -> &[crate::Sample] {
        self.samples
    }

    /// Mutable sample storage.
    pub fn samples_mut(&mut self) -> &mut [crate::Sample] {
        self.samples
    }

    /// Frame flags.
    pub fn flags(&self) -> FrameFlags {
        self.flags
    }

    /// Replace the frame flags.
    pub fn set_flags(&mut self, flags: FrameFlags) {
        self.flags = flags;
    }

    /// Add flags to the frame.
    pub fn add_flags(&mut self, flags: FrameFlags) {
        self.flags |= flags;
    }

    /// Wall-clock time when the first sample was captured, nanoseconds since
    /// Unix epoch. Zero means unknown.
    pub fn capture_timestamp(&self) -> Nanoseconds {
        self.capture_timestamp
    }

    /// Set the capture timestamp.
    pub fn set_capture_timestamp(&mut self, cts: Nanoseconds) {
        debug_assert!(cts >= 0, "frame: negative capture timestamp");
        self.capture_timestamp = cts;
    }

    /// Re-borrow a sub-range of the frame as a new frame, inheriting flags
    /// and with the capture timestamp left for the caller to fill.
    pub fn sub_frame(&mut self, begin: usize, end: usize) -> Frame<'_> {
        Frame {
            samples: &mut self.samples[begin..end],
            flags: self.flags,
            capture_timestamp: 0,
        }
    }
}

/// Frame stream source.
///
/// Returns false when the stream is unable to produce a frame (e.g. a dead
/// session); the frame contents are undefined in that case.
pub trait FrameReader {
    /// Fill the frame with the next samples of the stream.
    fn read_frame(&mut self, frame: &mut Frame<'_>) -> bool;
}

/// Frame stream sink.
pub trait FrameWriter {
    /// Write a frame to the stream.
    fn write_frame(&mut self, frame: &Frame<'_>);
}

impl<T: FrameReader + ?Sized> FrameReader for &mut T {
    fn read_frame(&mut self, frame: &mut Frame<'_>) -> bool {
        (**self).read_frame(frame)
    }
}

impl<T: FrameWriter + ?Sized> FrameWriter for &mut T {
    fn write_frame(&mut self, frame: &Frame<'_>) {
        (**self).write_frame(frame)
    }
}

impl<T: FrameReader + ?Sized> FrameReader for Box<T> {
    fn read_frame(&mut self, frame: &mut Frame<'_>) -> bool {
        (**self).read_frame(frame)
    }
}

impl<T: FrameWriter + ?Sized> FrameWriter for Box<T> {
    fn write_frame(&mut self, frame: &Frame<'_>) {
        (**self).write_frame(frame)
    }
}

// Stages that need to stay reachable from outside the chain (e.g. the
// depacketizer, probed for its stream position) are shared behind
// `Arc<Mutex<_>>`; all locking happens under the pipeline lock, so the
// mutexes are uncontended.
impl<T: FrameReader> FrameReader for std::sync::Arc<std::sync::Mutex<T>> {
    fn read_frame(&mut self, frame: &mut Frame<'_>) -> bool {
        self.lock().unwrap().read_frame(frame)
    }
}

impl<T: FrameWriter> FrameWriter for std::sync::Arc<std::sync::Mutex<T>> {
    fn write_frame(&mut self, frame: &Frame<'_>) {
        self.lock().unwrap().write_frame(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_union() {
        let mut flags = FrameFlags::empty();
        flags |= FrameFlags::NONBLANK;
        flags |= FrameFlags::DROPS;
        assert!(flags.contains(FrameFlags::NONBLANK));
        assert!(flags.contains(FrameFlags::DROPS));
        assert!(!flags.contains(FrameFlags::INCOMPLETE));
    }

    #[test]
    fn test_sub_frame_inherits_flags() {
        let mut buf = [0.0f32; 8];
        let mut frame = Frame::new(&mut buf);
        frame.add_flags(FrameFlags::NONBLANK);
        frame.set_capture_timestamp(123);

        let sub = frame.sub_frame(2, 6);
        assert_eq!(sub.num_samples(), 4);
        assert!(sub.flags().contains(FrameFlags::NONBLANK));
        assert_eq!(sub.capture_timestamp(), 0);
    }
}
