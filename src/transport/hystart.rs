//! HyStart++ slow-start exit (RFC 9406).
//!
//! Rounds are delimited by packet numbers: a round ends once a packet sent at
//! or after the round's start is acknowledged.

const MIN_RTT_THRESH: u64 = 4_000;
const MAX_RTT_THRESH: u64 = 16_000;
const N_RTT_SAMPLE: usize = 8;
pub const CSS_GROWTH_DIVISOR: u64 = 4;
const CSS_ROUNDS: usize = 5;

#[derive(Debug)]
pub struct Hystart {
    enabled: bool,
    window_end: Option<u64>,
    last_round_min_rtt: u64,
    current_round_min_rtt: u64,
    rtt_sample_count: usize,
    css_baseline_min_rtt: u64,
    css_round_count: usize,
    in_css: bool,
}

impl Hystart {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            window_end: None,
            last_round_min_rtt: u64::MAX,
            current_round_min_rtt: u64::MAX,
            rtt_sample_count: 0,
            css_baseline_min_rtt: u64::MAX,
            css_round_count: 0,
            in_css: false,
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// In Conservative Slow Start.
    pub fn in_css(&self) -> bool {
        self.enabled && self.in_css
    }

    fn start_round(&mut self, next_pn: u64) {
        self.window_end = Some(next_pn);
        self.last_round_min_rtt = self.current_round_min_rtt;
        self.current_round_min_rtt = u64::MAX;
        self.rtt_sample_count = 0;
    }

    /// Feed one acknowledged application packet while in slow start.
    ///
    /// `next_pn` is the next packet number the sender will use. Returns true
    /// when slow start should end.
    pub fn on_packet_acked(&mut self, pn: u64, latest_rtt: u64, next_pn: u64) -> bool {
        if !self.enabled {
            return false;
        }

        let round_over = match self.window_end {
            None => {
                self.start_round(next_pn);
                false
            }
            Some(end) => pn >= end,
        };

        self.rtt_sample_count += 1;
        self.current_round_min_rtt = self.current_round_min_rtt.min(latest_rtt);

        let enough_samples = self.rtt_sample_count >= N_RTT_SAMPLE
            && self.current_round_min_rtt != u64::MAX
            && self.last_round_min_rtt != u64::MAX;

        if !self.in_css {
            if enough_samples {
                let thresh = (self.last_round_min_rtt / 8).clamp(MIN_RTT_THRESH, MAX_RTT_THRESH);
                if self.current_round_min_rtt >= self.last_round_min_rtt.saturating_add(thresh) {
                    tracing::trace!(
                        min_rtt = self.current_round_min_rtt,
                        "hystart: entering conservative slow start"
                    );
                    self.in_css = true;
                    self.css_baseline_min_rtt = self.current_round_min_rtt;
                    self.css_round_count = 0;
                }
            }
        } else if enough_samples && self.current_round_min_rtt < self.css_baseline_min_rtt {
            // the delay increase was spurious
            self.in_css = false;
            self.css_baseline_min_rtt = u64::MAX;
        }

        if round_over {
            if self.in_css {
                self.css_round_count += 1;
                if self.css_round_count >= CSS_ROUNDS {
                    self.in_css = false;
                    self.start_round(next_pn);
                    return true;
                }
            }
            self.start_round(next_pn);
        }

        false
    }

    /// Congestion window growth for `acked` bytes.
    pub fn growth(&self, acked: u64) -> u64 {
        if self.in_css() {
            acked / CSS_GROWTH_DIVISOR
        } else {
            acked
        }
    }

    /// Slow start ended by loss; HyStart++ state no longer applies.
    pub fn on_congestion_event(&mut self) {
        self.in_css = false;
        self.window_end = None;
    }
}
