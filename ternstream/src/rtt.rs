//! Round-trip time estimation (Jacobson/Karels, RFC 6298).
//!
//! ```text
//!   rttvar = 3/4 rttvar + 1/4 |srtt - sample|
//!   srtt   = 7/8 srtt   + 1/8 sample
//!   rto    = srtt + max(1ms, 4 rttvar)      clamped to [floor, 60s]
//! ```
//!
//! The floor is the configured resend timeout, which is also the RTO until
//! the first sample arrives. Callers feed only samples from segments that
//! were transmitted once.

use std::time::Duration;

const MAX_RTO: Duration = Duration::from_secs(60);
const GRANULARITY: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy)]
struct Smoothed {
    srtt: Duration,
    rttvar: Duration,
}

#[derive(Debug, Clone)]
pub struct RttEstimator {
    smoothed: Option<Smoothed>,
    latest: Option<Duration>,
    min_rtt: Option<Duration>,
    floor: Duration,
}

impl RttEstimator {
    /// An estimator whose RTO starts at, and never drops below, `floor`.
    pub fn with_min_rto(floor: Duration) -> Self {
        Self {
            smoothed: None,
            latest: None,
            min_rtt: None,
            floor: floor.min(MAX_RTO),
        }
    }

    pub fn update(&mut self, sample: Duration) {
        self.latest = Some(sample);
        self.min_rtt = Some(self.min_rtt.map_or(sample, |m| m.min(sample)));
        self.smoothed = Some(match self.smoothed {
            None => Smoothed {
                srtt: sample,
                rttvar: sample / 2,
            },
            Some(Smoothed { srtt, rttvar }) => Smoothed {
                rttvar: (rttvar * 3 + srtt.abs_diff(sample)) / 4,
                srtt: (srtt * 7 + sample) / 8,
            },
        });
    }

    /// Smoothed RTT, once sampled.
    pub fn srtt(&self) -> Option<Duration> {
        self.smoothed.map(|s| s.srtt)
    }

    pub fn rttvar(&self) -> Option<Duration> {
        self.smoothed.map(|s| s.rttvar)
    }

    /// The most recent sample.
    pub fn latest(&self) -> Option<Duration> {
        self.latest
    }

    /// Smallest sample seen.
    pub fn min_rtt(&self) -> Option<Duration> {
        self.min_rtt
    }

    /// Retransmission timeout for a first transmission.
    pub fn rto(&self) -> Duration {
        match self.smoothed {
            None => self.floor,
            Some(Smoothed { srtt, rttvar }) => {
                (srtt + (rttvar * 4).max(GRANULARITY)).clamp(self.floor, MAX_RTO)
            }
        }
    }
}

impl Default for RttEstimator {
    fn default() -> Self {
        Self::with_min_rto(Duration::from_millis(500))
    }
}
