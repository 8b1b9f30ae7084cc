//! NewReno congestion control (RFC 9002 §7) with optional HyStart++.

use core::str::FromStr;

use super::hystart::Hystart;
use super::Instant;
use crate::error::ConfigError;

/// Available congestion control algorithms.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CongestionControlAlgorithm {
    #[default]
    Reno,
}

impl FromStr for CongestionControlAlgorithm {
    type Err = ConfigError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        match name {
            "reno" => Ok(Self::Reno),
            other => Err(ConfigError::UnknownCongestionControl(other.to_owned())),
        }
    }
}

/// Minimal information about an acknowledged packet that the controller
/// needs.
#[derive(Debug, Clone, Copy)]
pub struct Acked {
    pub pn: u64,
    pub size: usize,
    pub time_sent: Instant,
    /// Application-space packet, eligible for HyStart++ rounds.
    pub is_app: bool,
}

#[derive(Debug)]
pub struct CongestionController {
    algorithm: CongestionControlAlgorithm,
    cwnd: u64,
    ssthresh: u64,
    bytes_in_flight: u64,
    /// Packets sent at or before this time do not trigger new reductions.
    recovery_start_time: Option<Instant>,
    /// Partial congestion-avoidance credit.
    bytes_acked: u64,
    max_datagram_size: u64,
    minimum_window: u64,
    hystart: Hystart,
}

impl CongestionController {
    pub fn new(
        algorithm: CongestionControlAlgorithm,
        max_datagram_size: usize,
        hystart: bool,
    ) -> Self {
        let mds = max_datagram_size as u64;
        let initial_window = (10 * mds).min((2 * mds).max(14_720));
        Self {
            algorithm,
            cwnd: initial_window,
            ssthresh: u64::MAX,
            bytes_in_flight: 0,
            recovery_start_time: None,
            bytes_acked: 0,
            max_datagram_size: mds,
            minimum_window: 2 * mds,
            hystart: Hystart::new(hystart),
        }
    }

    pub fn algorithm(&self) -> CongestionControlAlgorithm {
        self.algorithm
    }

    pub fn available_window(&self) -> u64 {
        self.cwnd.saturating_sub(self.bytes_in_flight)
    }

    pub fn on_packet_sent(&mut self, bytes: usize) {
        self.bytes_in_flight += bytes as u64;
    }

    /// `next_app_pn` is the next application packet number to be sent and
    /// `latest_rtt` the most recent RTT sample.
    pub fn on_packet_acked(&mut self, acked: &Acked, latest_rtt: u64, next_app_pn: u64) {
        let bytes = acked.size as u64;
        self.remove_from_flight(bytes);

        if self.in_recovery(acked.time_sent) {
            return;
        }

        if self.in_slow_start() {
            if acked.is_app && self.hystart.on_packet_acked(acked.pn, latest_rtt, next_app_pn) {
                tracing::debug!(cwnd = self.cwnd, "slow start exit");
                self.ssthresh = self.cwnd;
                return;
            }
            self.cwnd += self.hystart.growth(bytes);
        } else {
            self.bytes_acked += bytes;
            if self.bytes_acked >= self.cwnd {
                self.bytes_acked -= self.cwnd;
                self.cwnd += self.max_datagram_size;
            }
        }
    }

    /// A congestion event for a lost packet sent at `sent_time`.
    pub fn on_congestion_event(&mut self, sent_time: Instant, now: Instant) {
        if self.in_recovery(sent_time) {
            return;
        }

        self.recovery_start_time = Some(now);
        self.ssthresh = (self.cwnd / 2).max(self.minimum_window);
        self.cwnd = self.ssthresh;
        self.bytes_acked = 0;
        self.hystart.on_congestion_event();
        tracing::debug!(cwnd = self.cwnd, "congestion event");
    }

    pub fn on_packet_lost(&mut self, bytes: usize) {
        self.remove_from_flight(bytes as u64);
    }

    pub fn on_persistent_congestion(&mut self) {
        self.cwnd = self.minimum_window;
        self.recovery_start_time = None;
        self.bytes_acked = 0;
    }

    /// Forget bytes of a discarded packet number space.
    pub fn on_packet_discarded(&mut self, bytes: usize) {
        self.remove_from_flight(bytes as u64);
    }

    pub fn bytes_in_flight(&self) -> u64 {
        self.bytes_in_flight
    }

    pub fn cwnd(&self) -> u64 {
        self.cwnd
    }

    pub fn ssthresh(&self) -> u64 {
        self.ssthresh
    }

    pub fn in_slow_start(&self) -> bool {
        self.cwnd < self.ssthresh
    }

    pub fn in_recovery(&self, sent_time: Instant) -> bool {
        match self.recovery_start_time {
            Some(start) => sent_time <= start,
            None => false,
        }
    }

    fn remove_from_flight(&mut self, bytes: u64) {
        self.bytes_in_flight = self.bytes_in_flight.saturating_sub(bytes);
    }
}
