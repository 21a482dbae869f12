//! Closed-loop latency control.

use rstream_rtp_core::Nanoseconds;
use tracing::{debug, warn};

use crate::freq_estimator::{FreqEstimator, FreqEstimatorProfile};
use crate::sample::SampleSpec;

/// Latency monitor parameters.
#[derive(Debug, Clone)]
pub struct LatencyMonitorConfig {
    /// Enable the frequency estimator (resampler scaling adjustments).
    pub fe_enable: bool,

    /// Frequency estimator profile.
    pub fe_profile: FreqEstimatorProfile,

    /// Interval between scaling updates, nanoseconds. Protects small-frame
    /// pipelines from over-reacting.
    pub fe_update_interval: Nanoseconds,

    /// Latency below this value kills the session, nanoseconds.
    pub min_latency: Nanoseconds,

    /// Latency above this value kills the session, nanoseconds.
    pub max_latency: Nanoseconds,

    /// Maximum deviation of the scaling coefficient from 1.0.
    pub max_scaling_delta: f64,
}

impl Default for LatencyMonitorConfig {
    fn default() -> Self {
        LatencyMonitorConfig {
            fe_enable: true,
            fe_profile: FreqEstimatorProfile::default(),
            fe_update_interval: 5 * rstream_rtp_core::MILLISECOND,
            min_latency: 0,
            max_latency: 0,
            max_scaling_delta: 0.005,
        }
    }
}

impl LatencyMonitorConfig {
    /// Derive latency bounds from a target latency.
    pub fn deduce_latency_bounds(&mut self, target_latency: Nanoseconds) {
        self.min_latency = -target_latency;
        self.max_latency = target_latency * 5;
    }
}

/// Latency measurements of one session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LatencyMetrics {
    /// Samples buffered between the queue tail and the depacketizer head,
    /// nanoseconds.
    pub niq_latency: Nanoseconds,

    /// Capture-to-playback latency established via RTCP, nanoseconds.
    pub e2e_latency: Nanoseconds,
}

/// Tracks a session's latency and steers the resampler toward the target.
///
/// Once per output frame the owning session feeds the current in-queue
/// latency; a rate-limited PI controller turns the error into a scaling
/// multiplier. Latency excursions beyond the configured bounds mark the
/// session dead, which the session group turns into teardown.
pub struct LatencyMonitor {
    config: LatencyMonitorConfig,
    in_spec: SampleSpec,

    target_latency: i32,
    min_latency: i32,
    max_latency: i32,

    update_interval: u32,
    update_pos: u64,
    stream_pos: u64,
    stream_cts: Nanoseconds,

    fe: Option<FreqEstimator>,
    freq_coeff: f64,

    niq_latency: i32,
    e2e_latency: i32,

    alive: bool,
}

impl LatencyMonitor {
    /// Create a monitor. Fails when the target lies outside the configured
    /// bounds or the update interval is not positive.
    pub fn new(
        config: LatencyMonitorConfig,
        target_latency: Nanoseconds,
        in_spec: SampleSpec,
    ) -> crate::Result<Self> {
        if target_latency <= 0
            || target_latency < config.min_latency
            || target_latency > config.max_latency
        {
            return Err(crate::Error::InvalidArgument(format!(
                "latency monitor: target latency out of bounds: \
                 target={target_latency} min={} max={}",
                config.min_latency, config.max_latency
            )));
        }
        if config.fe_enable && config.fe_update_interval <= 0 {
            return Err(crate::Error::InvalidArgument(
                "latency monitor: non-positive update interval".to_string(),
            ));
        }

        let target = in_spec.ns_to_rtp_timestamp(target_latency);

        debug!(
            target_latency,
            target_ticks = target,
            fe_enable = config.fe_enable,
            fe_profile = config.fe_profile.as_str(),
            "latency monitor: initializing"
        );

        let fe = if config.fe_enable {
            Some(FreqEstimator::new(config.fe_profile, target as u32))
        } else {
            None
        };

        Ok(LatencyMonitor {
            target_latency: target,
            min_latency: in_spec.ns_to_rtp_timestamp(config.min_latency),
            max_latency: in_spec.ns_to_rtp_timestamp(config.max_latency),
            update_interval: in_spec.ns_to_rtp_timestamp(config.fe_update_interval) as u32,
            update_pos: 0,
            stream_pos: 0,
            stream_cts: 0,
            fe,
            freq_coeff: 1.0,
            niq_latency: 0,
            e2e_latency: 0,
            alive: true,
            config,
            in_spec,
        })
    }

    /// False once a latency excursion killed the session.
    pub fn is_alive(&self) -> bool {
        self.alive
    }

    /// Target latency in stream timestamp units.
    pub fn target_latency(&self) -> i32 {
        self.target_latency
    }

    /// Current latency measurements.
    pub fn metrics(&self) -> LatencyMetrics {
        LatencyMetrics {
            niq_latency: self.in_spec.rtp_timestamp_to_ns(self.niq_latency),
            e2e_latency: self.in_spec.rtp_timestamp_to_ns(self.e2e_latency),
        }
    }

    /// Feed the in-queue latency measured before reading a frame.
    ///
    /// Returns the scaling multiplier to apply to the resampler, or `None`
    /// when no update is due. After an excursion the monitor reports dead
    /// and stops producing updates.
    pub fn update(&mut self, niq_latency: Option<i32>) -> Option<f64> {
        if !self.alive {
            return None;
        }

        let latency = match niq_latency {
            Some(latency) => {
                self.niq_latency = latency;
                latency
            }
            None => return None,
        };

        if !self.check_bounds(latency) {
            self.alive = false;
            return None;
        }

        let fe = self.fe.as_mut()?;

        if self.stream_pos < self.update_pos {
            return None;
        }

        while self.stream_pos >= self.update_pos {
            fe.update(latency.max(0) as u32);
            self.update_pos += self.update_interval as u64;
        }

        let raw = fe.freq_coeff();
        self.freq_coeff = raw
            .min(1.0 + self.config.max_scaling_delta)
            .max(1.0 - self.config.max_scaling_delta);

        Some(self.freq_coeff)
    }

    /// Account for a frame that left the session pipeline.
    pub fn advance_stream(&mut self, n_samples_per_chan: usize, capture_ts: Nanoseconds) {
        self.stream_pos += n_samples_per_chan as u64;
        self.stream_cts = capture_ts;
    }

    /// The scaling update was rejected by the resampler; the session is
    /// beyond rescue.
    pub fn kill(&mut self) {
        warn!("latency monitor: scaling rejected, marking session dead");
        self.alive = false;
    }

    /// Update the end-to-end latency from the playback time of the last
    /// frame returned to the consumer.
    pub fn reclock(&mut self, playback_timestamp: Nanoseconds) {
        assert!(
            playback_timestamp >= 0,
            "latency monitor: negative playback timestamp"
        );

        if self.stream_cts == 0 {
            return;
        }

        self.e2e_latency = self
            .in_spec
            .ns_to_rtp_timestamp(playback_timestamp - self.stream_cts);
    }

    fn check_bounds(&self, latency: i32) -> bool {
        if latency < self.min_latency {
            warn!(
                latency,
                min = self.min_latency,
                "latency monitor: latency below bound"
            );
            return false;
        }
        if latency > self.max_latency {
            warn!(
                latency,
                max = self.max_latency,
                "latency monitor: latency above bound"
            );
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelSet, MASK_STEREO};
    use rstream_rtp_core::{MILLISECOND, SECOND};

    fn spec() -> SampleSpec {
        SampleSpec::new(44100, ChannelSet::surround(MASK_STEREO).unwrap()).unwrap()
    }

    fn config() -> LatencyMonitorConfig {
        let mut config = LatencyMonitorConfig {
            fe_profile: FreqEstimatorProfile::Responsive,
            ..Default::default()
        };
        config.deduce_latency_bounds(20 * MILLISECOND);
        config
    }

    #[test]
    fn test_rejects_bad_target() {
        assert!(LatencyMonitor::new(config(), 0, spec()).is_err());
        assert!(LatencyMonitor::new(config(), SECOND, spec()).is_err());
        assert!(LatencyMonitor::new(config(), 20 * MILLISECOND, spec()).is_ok());
    }

    #[test]
    fn test_scaling_tracks_latency_error() {
        let mut monitor = LatencyMonitor::new(config(), 20 * MILLISECOND, spec()).unwrap();
        let target = spec().ns_to_rtp_timestamp(20 * MILLISECOND);

        let mut scale = 1.0;
        for _ in 0..2000 {
            monitor.advance_stream(256, 0);
            if let Some(s) = monitor.update(Some(target * 3)) {
                scale = s;
            }
        }
        assert!(monitor.is_alive());
        assert!(scale > 1.0);
        assert!(scale <= 1.005);
    }

    #[test]
    fn test_excursion_kills_session() {
        let mut monitor = LatencyMonitor::new(config(), 20 * MILLISECOND, spec()).unwrap();

        let beyond = spec().ns_to_rtp_timestamp(20 * MILLISECOND * 5) + 1;
        assert!(monitor.update(Some(beyond)).is_none());
        assert!(!monitor.is_alive());

        // Dead monitors stay dead.
        assert!(monitor.update(Some(100)).is_none());
    }

    #[test]
    fn test_e2e_latency_via_reclock() {
        let mut monitor = LatencyMonitor::new(config(), 20 * MILLISECOND, spec()).unwrap();

        let capture = 1_000_000 * MILLISECOND;
        monitor.advance_stream(100, capture);
        monitor.reclock(capture + 15 * MILLISECOND);

        let metrics = monitor.metrics();
        assert!((metrics.e2e_latency - 15 * MILLISECOND).abs() < MILLISECOND / 2);
    }

    #[test]
    fn test_no_update_without_measurement() {
        let mut monitor = LatencyMonitor::new(config(), 20 * MILLISECOND, spec()).unwrap();
        assert!(monitor.update(None).is_none());
        assert!(monitor.is_alive());
    }
}
