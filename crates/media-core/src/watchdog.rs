//! Session watchdog.

use rstream_rtp_core::Nanoseconds;
use tracing::{debug, warn};

use crate::frame::{Frame, FrameFlags, FrameReader};
use crate::sample::SampleSpec;

/// Watchdog parameters.
#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    /// Maximum period during which every frame is blank, nanoseconds. After
    /// this period the session is terminated; detects dead or hanging
    /// senders. Zero disables the check.
    pub no_playback_timeout: Nanoseconds,

    /// Maximum period during which every drop-detection window contains both
    /// an incomplete frame and a frame that caused packet drops,
    /// nanoseconds. Detects continuous stuttering from a sender whose
    /// packets keep arriving a bit late. Zero disables the check.
    pub choppy_playback_timeout: Nanoseconds,

    /// Size of the drop-detection window, nanoseconds.
    pub choppy_playback_window: Nanoseconds,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        WatchdogConfig {
            no_playback_timeout: 2 * rstream_rtp_core::SECOND,
            choppy_playback_timeout: 2 * rstream_rtp_core::SECOND,
            choppy_playback_window: 300 * rstream_rtp_core::MILLISECOND,
        }
    }
}

impl WatchdogConfig {
    /// Derive the drop-detection window from the choppy timeout.
    pub fn deduce_choppy_playback_window(&mut self, timeout: Nanoseconds) {
        self.choppy_playback_window = (300 * rstream_rtp_core::MILLISECOND).min(timeout / 4);
    }
}

/// Terminates a session that stopped playing or plays hopelessly choppily.
pub struct Watchdog<R> {
    reader: R,
    spec: SampleSpec,

    max_blank_duration: u64,
    max_drops_duration: u64,
    drop_detection_window: u64,

    /// Stream position in samples per channel.
    curr_read_pos: u64,
    last_pos_before_blank: u64,
    last_pos_before_drops: u64,

    curr_window_flags: FrameFlags,
    curr_window_start: u64,

    alive: bool,
}

impl<R: FrameReader> Watchdog<R> {
    /// Create a watchdog over an inner reader.
    pub fn new(reader: R, spec: SampleSpec, config: &WatchdogConfig) -> Self {
        let to_ticks = |ns: Nanoseconds| {
            spec.ns_to_samples_per_chan(ns.max(0)).unwrap_or(0) as u64
        };

        debug!(
            no_playback_timeout = config.no_playback_timeout,
            choppy_playback_timeout = config.choppy_playback_timeout,
            "watchdog: initializing"
        );

        Watchdog {
            reader,
            spec,
            max_blank_duration: to_ticks(config.no_playback_timeout),
            max_drops_duration: to_ticks(config.choppy_playback_timeout),
            drop_detection_window: to_ticks(config.choppy_playback_window),
            curr_read_pos: 0,
            last_pos_before_blank: 0,
            last_pos_before_drops: 0,
            curr_window_flags: FrameFlags::empty(),
            curr_window_start: 0,
            alive: true,
        }
    }

    /// False once a timeout expired.
    pub fn is_alive(&self) -> bool {
        self.alive
    }

    fn update_blank_timeout(&mut self, frame_flags: FrameFlags, next_read_pos: u64) {
        if self.max_blank_duration == 0 {
            return;
        }

        if frame_flags.contains(FrameFlags::NONBLANK) {
            self.last_pos_before_blank = next_read_pos;
            return;
        }

        if next_read_pos - self.last_pos_before_blank >= self.max_blank_duration {
            warn!(
                blank_samples = next_read_pos - self.last_pos_before_blank,
                "watchdog: no playback timeout expired"
            );
            self.alive = false;
        }
    }

    fn update_drops_timeout(&mut self, frame_flags: FrameFlags, next_read_pos: u64) {
        if self.max_drops_duration == 0 || self.drop_detection_window == 0 {
            return;
        }

        self.curr_window_flags |= frame_flags;

        if next_read_pos - self.curr_window_start < self.drop_detection_window {
            return;
        }

        // Window complete: a "clean" window resets the choppy period.
        let choppy = self.curr_window_flags.contains(FrameFlags::INCOMPLETE)
            && self.curr_window_flags.contains(FrameFlags::DROPS);
        if !choppy {
            self.last_pos_before_drops = next_read_pos;
        }
        self.curr_window_flags = FrameFlags::empty();
        self.curr_window_start = next_read_pos;

        if next_read_pos - self.last_pos_before_drops >= self.max_drops_duration {
            warn!("watchdog: choppy playback timeout expired");
            self.alive = false;
        }
    }
}

impl<R: FrameReader> FrameReader for Watchdog<R> {
    fn read_frame(&mut self, frame: &mut Frame<'_>) -> bool {
        if !self.alive {
            return false;
        }

        if !self.reader.read_frame(frame) {
            return false;
        }

        let next_read_pos =
            self.curr_read_pos + (frame.num_samples() / self.spec.num_channels()) as u64;

        self.update_blank_timeout(frame.flags(), next_read_pos);
        self.update_drops_timeout(frame.flags(), next_read_pos);

        self.curr_read_pos = next_read_pos;

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelSet, MASK_MONO};
    use rstream_rtp_core::{MILLISECOND, SECOND};

    fn spec() -> SampleSpec {
        SampleSpec::new(1000, ChannelSet::surround(MASK_MONO).unwrap()).unwrap()
    }

    struct FlagReader {
        flags: FrameFlags,
    }

    impl FrameReader for FlagReader {
        fn read_frame(&mut self, frame: &mut Frame<'_>) -> bool {
            frame.set_flags(self.flags);
            true
        }
    }

    fn read_one(watchdog: &mut Watchdog<FlagReader>, n: usize) -> bool {
        let mut buf = vec![0.0f32; n];
        let mut frame = Frame::new(&mut buf);
        watchdog.read_frame(&mut frame)
    }

    #[test]
    fn test_blank_timeout() {
        let config = WatchdogConfig {
            no_playback_timeout: SECOND, // 1000 samples at 1 kHz
            choppy_playback_timeout: 0,
            choppy_playback_window: 0,
        };
        let inner = FlagReader {
            flags: FrameFlags::empty(),
        };
        let mut watchdog = Watchdog::new(inner, spec(), &config);

        for _ in 0..9 {
            assert!(read_one(&mut watchdog, 100));
            assert!(watchdog.is_alive());
        }

        // The tenth blank frame crosses the timeout.
        assert!(read_one(&mut watchdog, 100));
        assert!(!watchdog.is_alive());
        assert!(!read_one(&mut watchdog, 100));
    }

    #[test]
    fn test_nonblank_frames_reset_timeout() {
        let config = WatchdogConfig {
            no_playback_timeout: SECOND,
            choppy_playback_timeout: 0,
            choppy_playback_window: 0,
        };
        let inner = FlagReader {
            flags: FrameFlags::NONBLANK,
        };
        let mut watchdog = Watchdog::new(inner, spec(), &config);

        for _ in 0..50 {
            assert!(read_one(&mut watchdog, 100));
        }
        assert!(watchdog.is_alive());
    }

    #[test]
    fn test_choppy_timeout() {
        let config = WatchdogConfig {
            no_playback_timeout: 0,
            choppy_playback_timeout: 400 * MILLISECOND, // 400 samples
            choppy_playback_window: 100 * MILLISECOND,  // 100 samples
        };
        let inner = FlagReader {
            flags: FrameFlags::NONBLANK | FrameFlags::INCOMPLETE | FrameFlags::DROPS,
        };
        let mut watchdog = Watchdog::new(inner, spec(), &config);

        let mut died_at = None;
        for i in 0..10 {
            if !read_one(&mut watchdog, 100) || !watchdog.is_alive() {
                died_at = Some(i);
                break;
            }
        }
        assert_eq!(died_at, Some(3), "choppy timeout should fire after 400ms");
    }

    #[test]
    fn test_clean_windows_keep_alive() {
        let config = WatchdogConfig {
            no_playback_timeout: 0,
            choppy_playback_timeout: 400 * MILLISECOND,
            choppy_playback_window: 100 * MILLISECOND,
        };
        // Incomplete but no drops: not choppy.
        let inner = FlagReader {
            flags: FrameFlags::NONBLANK | FrameFlags::INCOMPLETE,
        };
        let mut watchdog = Watchdog::new(inner, spec(), &config);

        for _ in 0..20 {
            assert!(read_one(&mut watchdog, 100));
        }
        assert!(watchdog.is_alive());
    }
}
