//! Frequency estimator: latency error to scaling coefficient.

use tracing::debug;

/// Controller aggressiveness profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FreqEstimatorProfile {
    /// Reacts faster; pairs with the built-in resampler backend.
    Responsive,
    /// Smoother adjustments for high-quality backends.
    #[default]
    Gradual,
}

impl FreqEstimatorProfile {
    /// Profile name for logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            FreqEstimatorProfile::Responsive => "responsive",
            FreqEstimatorProfile::Gradual => "gradual",
        }
    }
}

struct FeConfig {
    p: f64,
    i: f64,
    decimation_factor1: usize,
    decimation_factor2: usize,
}

fn make_config(profile: FreqEstimatorProfile) -> FeConfig {
    match profile {
        FreqEstimatorProfile::Responsive => FeConfig {
            p: 1e-6,
            i: 1e-10,
            decimation_factor1: 10,
            decimation_factor2: 0,
        },
        FreqEstimatorProfile::Gradual => FeConfig {
            p: 1e-6,
            i: 5e-9,
            decimation_factor1: 10,
            decimation_factor2: 10,
        },
    }
}

const DECIM_LEN: usize = 32;
const DECIM_LEN_MASK: usize = DECIM_LEN - 1;

/// PI controller over a decimated latency signal.
///
/// Raw latency samples pass through one or two averaging decimator stages
/// (smoothing out jitter-queue sawtooth) before feeding a
/// proportional-integral controller centered on the target latency. The
/// output is a scaling coefficient around 1.0 for the resampler.
pub struct FreqEstimator {
    config: FeConfig,
    target: f64,

    dec1_buf: [f64; DECIM_LEN],
    dec1_ind: usize,
    dec2_buf: [f64; DECIM_LEN],
    dec2_ind: usize,
    samples_counter: usize,

    accum: f64,
    coeff: f64,
}

impl FreqEstimator {
    /// Create an estimator centered on `target_latency` (in stream timestamp
    /// units).
    pub fn new(profile: FreqEstimatorProfile, target_latency: u32) -> Self {
        let config = make_config(profile);

        debug!(
            profile = profile.as_str(),
            target_latency, "freq estimator: initializing"
        );

        FreqEstimator {
            target: target_latency as f64,
            dec1_buf: [target_latency as f64; DECIM_LEN],
            dec1_ind: 0,
            dec2_buf: [target_latency as f64; DECIM_LEN],
            dec2_ind: 0,
            samples_counter: 0,
            accum: 0.0,
            coeff: 1.0,
            config,
        }
    }

    /// Current scaling coefficient.
    pub fn freq_coeff(&self) -> f64 {
        self.coeff
    }

    /// Feed one latency measurement.
    pub fn update(&mut self, current: u32) {
        if let Some(filtered) = self.run_decimators(current as f64) {
            self.coeff = self.run_controller(filtered);
        }
    }

    fn run_decimators(&mut self, current: f64) -> Option<f64> {
        self.samples_counter += 1;

        self.dec1_buf[self.dec1_ind] = current;

        let mut output = None;
        if self.samples_counter % self.config.decimation_factor1 == 0 {
            self.dec2_buf[self.dec2_ind] = mean(&self.dec1_buf);

            if self.config.decimation_factor2 == 0 {
                output = Some(self.dec2_buf[self.dec2_ind]);
            } else if self.samples_counter
                % (self.config.decimation_factor1 * self.config.decimation_factor2)
                == 0
            {
                self.samples_counter = 0;
                output = Some(mean(&self.dec2_buf));
            }

            self.dec2_ind = (self.dec2_ind + 1) & DECIM_LEN_MASK;
        }

        self.dec1_ind = (self.dec1_ind + 1) & DECIM_LEN_MASK;
        output
    }

    fn run_controller(&mut self, current: f64) -> f64 {
        let error = current - self.target;
        self.accum += error;
        1.0 + self.config.p * error + self.config.i * self.accum
    }
}

fn mean(buf: &[f64; DECIM_LEN]) -> f64 {
    buf.iter().sum::<f64>() / DECIM_LEN as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drive(fe: &mut FreqEstimator, latency: u32, n: usize) {
        for _ in 0..n {
            fe.update(latency);
        }
    }

    #[test]
    fn test_on_target_stays_at_unity() {
        let mut fe = FreqEstimator::new(FreqEstimatorProfile::Responsive, 8000);
        drive(&mut fe, 8000, 1000);
        assert!((fe.freq_coeff() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_excess_latency_speeds_up() {
        let mut fe = FreqEstimator::new(FreqEstimatorProfile::Responsive, 8000);
        drive(&mut fe, 20000, 1000);
        // Queue too long: consume input faster than nominal.
        assert!(fe.freq_coeff() > 1.0);
    }

    #[test]
    fn test_deficit_latency_slows_down() {
        let mut fe = FreqEstimator::new(FreqEstimatorProfile::Responsive, 8000);
        drive(&mut fe, 1000, 1000);
        assert!(fe.freq_coeff() < 1.0);
    }

    #[test]
    fn test_gradual_profile_reacts_slower_initially() {
        let mut responsive = FreqEstimator::new(FreqEstimatorProfile::Responsive, 8000);
        let mut gradual = FreqEstimator::new(FreqEstimatorProfile::Gradual, 8000);

        drive(&mut responsive, 16000, 50);
        drive(&mut gradual, 16000, 50);

        // The second decimation stage delays the first update.
        assert!(responsive.freq_coeff() > 1.0);
        assert!((gradual.freq_coeff() - 1.0).abs() < (responsive.freq_coeff() - 1.0).abs());
    }
}
