//! CUBIC congestion control (RFC 8312) with a tolerated loss ratio.
//!
//! ```text
//!   slow start:   cwnd += mss per ack
//!   avoidance:    W(t) = C (t - K)^3 + w_max,  K = cbrt(w_max (1 - beta) / C)
//!   on loss:      w_max = cwnd, cwnd = ssthresh = max(beta cwnd, 2 mss)
//! ```
//!
//! Loss only shrinks the window while the lost share of recently sent bytes
//! exceeds the tolerated ratio. The window never grows past the remote's
//! advertised receive window.

use std::time::Instant;

use crate::congestion::CongestionController;

const C: f64 = 0.4;
const BETA: f64 = 0.7;

/// The loss sample decays by half once this many windows have been sent.
const SAMPLE_WINDOWS: usize = 16;

/// Sent and lost byte counts over a decaying horizon.
#[derive(Debug, Default, Clone, Copy)]
struct LossSample {
    sent: usize,
    lost: usize,
}

impl LossSample {
    fn ratio(&self) -> Option<f64> {
        (self.sent > 0).then(|| self.lost as f64 / self.sent as f64)
    }

    fn decay(&mut self) {
        self.sent /= 2;
        self.lost /= 2;
    }
}

/// A congestion-avoidance period, started after slow start or a loss.
#[derive(Debug, Clone, Copy)]
struct Epoch {
    start: Instant,
    /// Seconds until the cubic curve returns to `w_max`.
    k: f64,
}

impl Epoch {
    fn begin(now: Instant, w_max: f64) -> Self {
        Self {
            start: now,
            k: (w_max * (1.0 - BETA) / C).cbrt(),
        }
    }

    fn target(&self, now: Instant, w_max: f64) -> f64 {
        let dt = now.duration_since(self.start).as_secs_f64() - self.k;
        C * dt.powi(3) + w_max
    }
}

#[derive(Debug)]
pub struct Cubic {
    mss: usize,
    /// The remote receive window.
    max_window: usize,
    tolerated_loss: f64,
    cwnd: usize,
    ssthresh: usize,
    /// Window just before the last decrease.
    w_max: f64,
    epoch: Option<Epoch>,
    in_flight: usize,
    /// Acked bytes counted towards the next avoidance step.
    acked: usize,
    sample: LossSample,
}

impl Cubic {
    /// A controller for segments of up to `mss` bytes whose window stays at
    /// or below `max_window`, backing off only once more than
    /// `tolerated_loss` (0..=1) of sent bytes are lost.
    pub fn new(mss: usize, max_window: usize, tolerated_loss: f32) -> Self {
        let mss = mss.max(1);
        let max_window = max_window.max(2 * mss);
        Self {
            mss,
            max_window,
            tolerated_loss: f64::from(tolerated_loss.clamp(0.0, 1.0)),
            cwnd: (10 * mss).min(max_window),
            ssthresh: usize::MAX,
            w_max: 0.0,
            epoch: None,
            in_flight: 0,
            acked: 0,
            sample: LossSample::default(),
        }
    }

    pub fn in_slow_start(&self) -> bool {
        self.cwnd < self.ssthresh
    }

    fn grow(&mut self, bytes: usize) {
        self.cwnd = self.cwnd.saturating_add(bytes).min(self.max_window);
    }

    fn avoid_congestion(&mut self, bytes: usize) {
        let now = Instant::now();
        let w_max = self.w_max;
        let epoch = *self.epoch.get_or_insert_with(|| Epoch::begin(now, w_max));

        self.acked += bytes;
        if self.acked < self.cwnd {
            return;
        }
        self.acked = 0;
        let segments = self.cwnd as f64 / self.mss as f64;
        let target = epoch.target(now, w_max).max(self.cwnd as f64);
        let step = ((target - self.cwnd as f64) / segments).max(1.0) as usize;
        self.grow(step);
    }
}

impl CongestionController for Cubic {
    fn on_packet_sent(&mut self, bytes: usize) {
        self.in_flight += bytes;
        self.sample.sent += bytes;
        if self.sample.sent > SAMPLE_WINDOWS * self.cwnd {
            self.sample.decay();
        }
    }

    fn on_ack(&mut self, bytes: usize) {
        self.in_flight = self.in_flight.saturating_sub(bytes);
        if self.in_slow_start() {
            self.grow(self.mss);
            if !self.in_slow_start() {
                self.epoch = Some(Epoch::begin(Instant::now(), self.w_max));
                self.acked = 0;
            }
        } else {
            self.avoid_congestion(bytes);
        }
    }

    fn on_loss(&mut self, bytes: usize) {
        self.in_flight = self.in_flight.saturating_sub(bytes);
        self.sample.lost += bytes;
        if self
            .sample
            .ratio()
            .is_some_and(|ratio| ratio <= self.tolerated_loss)
        {
            return;
        }

        self.w_max = self.cwnd as f64;
        self.ssthresh = ((self.w_max * BETA) as usize).max(2 * self.mss);
        self.cwnd = self.ssthresh;
        self.epoch = None;
        self.acked = 0;
        self.sample = LossSample::default();
    }

    fn window(&self) -> usize {
        self.cwnd
    }

    fn bytes_in_flight(&self) -> usize {
        self.in_flight
    }
}
