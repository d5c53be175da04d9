//! Adaptive retransmission timeout via Jacobson/Karels smoothing.
//!
//! RTTVAR = (1-β)·RTTVAR + β·|sample - SRTT|
//! SRTT   = (1-α)·SRTT   + α·sample
//! RTO    = clamp(SRTT + 4·RTTVAR, 500 ms, 5 s)
//!
//! Samples come only from first acknowledgements of frames that were never
//! retransmitted (Karn's rule); the send window enforces that.

use std::time::Duration;

/// Smoothing gain for the mean.
const ALPHA: f64 = 0.125;
/// Smoothing gain for the deviation.
const BETA: f64 = 0.25;
/// Lower clamp for the retransmission timeout.
const MIN_RTO: Duration = Duration::from_millis(500);
/// Upper clamp for the retransmission timeout.
const MAX_RTO: Duration = Duration::from_secs(5);

/// RTT estimator with the protocol's fixed priors: 1 s smoothed RTT,
/// 0.5 s deviation.
#[derive(Debug, Clone)]
pub struct RttEstimator {
    /// Smoothed round-trip time, seconds.
    srtt: f64,
    /// Mean deviation of the round-trip time, seconds.
    rttvar: f64,
}

impl RttEstimator {
    pub fn new() -> Self {
        Self { srtt: 1.0, rttvar: 0.5 }
    }

    /// Fold one measured sample into the estimate. The deviation is updated
    /// first, against the previous smoothed value.
    pub fn update(&mut self, sample: Duration) {
        let sample = sample.as_secs_f64();
        self.rttvar = (1.0 - BETA) * self.rttvar + BETA * (sample - self.srtt).abs();
        self.srtt = (1.0 - ALPHA) * self.srtt + ALPHA * sample;
    }

    /// Current retransmission timeout.
    pub fn rto(&self) -> Duration {
        Duration::from_secs_f64(self.srtt + 4.0 * self.rttvar).clamp(MIN_RTO, MAX_RTO)
    }

    pub fn srtt(&self) -> Duration {
        Duration::from_secs_f64(self.srtt)
    }

    pub fn rttvar(&self) -> Duration {
        Duration::from_secs_f64(self.rttvar)
    }
}

impl Default for RttEstimator {
    fn default() -> Self {
        Self::new()
    }
}
