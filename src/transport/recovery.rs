//! Loss detection and RTT estimation (RFC 9002 §5-6).
//!
//! Sent packets are tracked per packet number space, keyed by packet number.
//! Each record keeps a summary of the retransmittable frames it carried so
//! that lost or probed data can be queued again against current state.

use std::collections::BTreeMap;

use super::congestion::{Acked, CongestionControlAlgorithm, CongestionController};
use super::Instant;
use crate::error::{Error, TransportError};
use crate::packet::Epoch;

/// Default initial RTT: 333ms (RFC 9002 §6.2.2).
pub const INITIAL_RTT: u64 = 333_000;

/// Timer granularity: 1ms.
pub const GRANULARITY: u64 = 1_000;

/// Reordering threshold in packets (RFC 9002 §6.1.1).
const PACKET_THRESHOLD: u64 = 3;

/// Time threshold: 9/8 of the RTT (RFC 9002 §6.1.2).
const TIME_THRESHOLD_NUM: u64 = 9;
const TIME_THRESHOLD_DEN: u64 = 8;

const PERSISTENT_CONGESTION_THRESHOLD: u64 = 3;

/// Packets whose frames are queued again when a PTO fires.
const PTO_PROBE_PACKETS: usize = 2;

/// Retransmittable content of a sent packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SentFrame {
    Crypto { offset: u64, len: u64 },
    Stream { id: u64, offset: u64, len: u64, fin: bool },
    ResetStream { id: u64 },
    StopSending { id: u64 },
    MaxData,
    MaxStreamData { id: u64 },
    MaxStreams { bidi: bool },
    HandshakeDone,
    Ping,
    /// Never resent, but makes the packet ack-eliciting.
    PathResponse,
}

#[derive(Debug, Clone)]
pub struct SentPacket {
    pub pn: u64,
    pub time_sent: Instant,
    pub size: usize,
    pub ack_eliciting: bool,
    pub in_flight: bool,
    pub frames: Vec<SentFrame>,
    /// Connection-wide delivered bytes when this packet was sent.
    pub delivered: u64,
    pub delivered_time: Instant,
}

impl SentPacket {
    pub fn new(pn: u64, time_sent: Instant, size: usize, frames: Vec<SentFrame>) -> Self {
        let ack_eliciting = !frames.is_empty();
        Self {
            pn,
            time_sent,
            size,
            ack_eliciting,
            in_flight: ack_eliciting,
            frames,
            delivered: 0,
            delivered_time: time_sent,
        }
    }
}

/// RTT estimator (RFC 9002 §5).
#[derive(Debug)]
pub struct RttEstimator {
    latest: u64,
    smoothed: Option<u64>,
    rttvar: u64,
    min: u64,
    max_ack_delay: u64,
}

impl RttEstimator {
    pub fn new(max_ack_delay: u64) -> Self {
        Self {
            latest: 0,
            smoothed: None,
            rttvar: INITIAL_RTT / 2,
            min: u64::MAX,
            max_ack_delay,
        }
    }

    pub fn update(&mut self, latest_rtt: u64, ack_delay: u64, handshake_confirmed: bool) {
        self.latest = latest_rtt;
        self.min = self.min.min(latest_rtt);

        let Some(srtt) = self.smoothed else {
            self.smoothed = Some(latest_rtt);
            self.rttvar = latest_rtt / 2;
            return;
        };

        let ack_delay = if handshake_confirmed {
            ack_delay.min(self.max_ack_delay)
        } else {
            ack_delay
        };
        // never adjust below the minimum observed RTT
        let adjusted = if latest_rtt >= self.min + ack_delay {
            latest_rtt - ack_delay
        } else {
            latest_rtt
        };

        self.rttvar = (3 * self.rttvar + srtt.abs_diff(adjusted)) / 4;
        self.smoothed = Some((7 * srtt + adjusted) / 8);
    }

    pub fn has_sample(&self) -> bool {
        self.smoothed.is_some()
    }

    pub fn smoothed(&self) -> u64 {
        self.smoothed.unwrap_or(INITIAL_RTT)
    }

    pub fn rttvar(&self) -> u64 {
        self.rttvar
    }

    pub fn latest(&self) -> u64 {
        self.latest
    }

    /// Smallest sample so far, or the initial RTT without samples.
    pub fn min(&self) -> u64 {
        if self.min == u64::MAX { INITIAL_RTT } else { self.min }
    }

    pub fn max_ack_delay(&self) -> u64 {
        self.max_ack_delay
    }

    pub fn set_max_ack_delay(&mut self, max_ack_delay: u64) {
        self.max_ack_delay = max_ack_delay;
    }

    /// PTO period without the peer's ack delay or backoff.
    pub fn pto_base(&self) -> u64 {
        self.smoothed() + (4 * self.rttvar).max(GRANULARITY)
    }
}

#[derive(Debug, Default)]
struct Space {
    sent: BTreeMap<u64, SentPacket>,
    largest_acked: Option<u64>,
    largest_sent: Option<u64>,
    loss_time: Option<Instant>,
    time_of_last_ack_eliciting: Option<Instant>,
    ack_eliciting_in_flight: usize,
    discarded: bool,
}

/// What processing an ACK frame produced.
#[derive(Debug, Default)]
pub struct AckOutcome {
    /// Frames carried by newly acknowledged packets.
    pub acked: Vec<SentFrame>,
    /// Frames carried by packets now deemed lost.
    pub lost: Vec<SentFrame>,
    /// Number of newly acknowledged packets.
    pub newly_acked: usize,
}

/// What a loss detection timeout asks the connection to do.
#[derive(Debug, Default)]
pub struct TimeoutOutcome {
    /// Frames to queue again.
    pub retransmit: Vec<SentFrame>,
    /// Space the retransmitted frames were sent in.
    pub epoch: Option<Epoch>,
    /// Space in which to send probe packets, if a PTO fired.
    pub probe: Option<Epoch>,
}

#[derive(Debug)]
pub struct Recovery {
    spaces: [Space; 3],
    pub rtt: RttEstimator,
    pub cc: CongestionController,
    pto_count: u32,
    loss_detection_timer: Option<Instant>,
    handshake_confirmed: bool,
    has_handshake_keys: bool,
    /// The peer has proved it received our packets beyond Initial.
    peer_completed_address_validation: bool,
    delivered: u64,
    delivered_time: Instant,
    delivery_rate: u64,
    pub lost_count: usize,
    pub lost_bytes: u64,
    pub retrans_count: usize,
}

impl Recovery {
    pub fn new(
        is_client: bool,
        algorithm: CongestionControlAlgorithm,
        max_datagram_size: usize,
        hystart: bool,
        max_ack_delay: u64,
    ) -> Self {
        Self {
            spaces: Default::default(),
            rtt: RttEstimator::new(max_ack_delay),
            cc: CongestionController::new(algorithm, max_datagram_size, hystart),
            pto_count: 0,
            loss_detection_timer: None,
            handshake_confirmed: false,
            has_handshake_keys: false,
            peer_completed_address_validation: !is_client,
            delivered: 0,
            delivered_time: 0,
            delivery_rate: 0,
            lost_count: 0,
            lost_bytes: 0,
            retrans_count: 0,
        }
    }

    pub fn on_handshake_keys(&mut self) {
        self.has_handshake_keys = true;
    }

    pub fn on_handshake_confirmed(&mut self, now: Instant) {
        self.handshake_confirmed = true;
        self.peer_completed_address_validation = true;
        self.set_loss_detection_timer(now);
    }

    pub fn pto_count(&self) -> u32 {
        self.pto_count
    }

    pub fn largest_sent(&self, epoch: Epoch) -> Option<u64> {
        self.spaces[epoch.index()].largest_sent
    }

    pub fn largest_acked(&self, epoch: Epoch) -> Option<u64> {
        self.spaces[epoch.index()].largest_acked
    }

    /// Bytes per second, smoothed.
    pub fn delivery_rate(&self) -> u64 {
        self.delivery_rate
    }

    pub fn has_ack_eliciting_in_flight(&self, epoch: Epoch) -> bool {
        self.spaces[epoch.index()].ack_eliciting_in_flight > 0
    }

    /// Full PTO period for the application space with current backoff.
    pub fn pto(&self) -> u64 {
        (self.rtt.pto_base() + self.rtt.max_ack_delay()) << self.pto_count.min(16)
    }

    pub fn loss_detection_timer(&self) -> Option<Instant> {
        self.loss_detection_timer
    }

    pub fn on_packet_sent(&mut self, epoch: Epoch, mut pkt: SentPacket, now: Instant) {
        if self.cc.bytes_in_flight() == 0 {
            self.delivered_time = now;
        }
        pkt.delivered = self.delivered;
        pkt.delivered_time = self.delivered_time;

        let space = &mut self.spaces[epoch.index()];
        space.largest_sent = Some(pkt.pn);
        if pkt.in_flight {
            if pkt.ack_eliciting {
                space.time_of_last_ack_eliciting = Some(now);
                space.ack_eliciting_in_flight += 1;
            }
            self.cc.on_packet_sent(pkt.size);
        }
        space.sent.insert(pkt.pn, pkt);
        self.set_loss_detection_timer(now);
    }

    /// Process the ranges of an ACK frame, given as inclusive `(low, high)`
    /// pairs.
    pub fn on_ack_received(
        &mut self,
        epoch: Epoch,
        ranges: &[(u64, u64)],
        ack_delay: u64,
        now: Instant,
    ) -> Result<AckOutcome, Error> {
        let idx = epoch.index();
        let Some(largest) = ranges.iter().map(|r| r.1).max() else {
            return Ok(AckOutcome::default());
        };

        match self.spaces[idx].largest_sent {
            Some(sent) if largest <= sent => {}
            _ => {
                tracing::debug!(?epoch, largest, "ack for unsent packet");
                return Err(TransportError::ProtocolViolation.into());
            }
        }

        let space = &mut self.spaces[idx];
        space.largest_acked = Some(space.largest_acked.map_or(largest, |l| l.max(largest)));

        let mut newly_acked = Vec::new();
        for &(lo, hi) in ranges {
            let pns: Vec<u64> = space.sent.range(lo..=hi).map(|(pn, _)| *pn).collect();
            for pn in pns {
                if let Some(p) = space.sent.remove(&pn) {
                    newly_acked.push(p);
                }
            }
        }

        let mut outcome = AckOutcome::default();
        if newly_acked.is_empty() {
            return Ok(outcome);
        }
        newly_acked.sort_by_key(|p| p.pn);

        if let Some(last) = newly_acked.last()
            && last.pn == largest
            && newly_acked.iter().any(|p| p.ack_eliciting)
        {
            let latest_rtt = now.saturating_sub(last.time_sent);
            // ack delay is meaningless before 1-RTT
            let ack_delay = if epoch == Epoch::Application { ack_delay } else { 0 };
            self.rtt.update(latest_rtt, ack_delay, self.handshake_confirmed);
        }

        if epoch != Epoch::Initial {
            self.peer_completed_address_validation = true;
        }

        outcome.lost = self.detect_lost_packets(epoch, now);

        let next_app_pn = self.spaces[Epoch::Application.index()]
            .largest_sent
            .map_or(0, |pn| pn + 1);
        let latest_rtt = self.rtt.latest();

        let mut rate_sample = None;
        for p in &newly_acked {
            if p.ack_eliciting {
                let space = &mut self.spaces[idx];
                space.ack_eliciting_in_flight = space.ack_eliciting_in_flight.saturating_sub(1);
            }
            if p.in_flight {
                self.delivered += p.size as u64;
                let acked = Acked {
                    pn: p.pn,
                    size: p.size,
                    time_sent: p.time_sent,
                    is_app: epoch == Epoch::Application,
                };
                self.cc.on_packet_acked(&acked, latest_rtt, next_app_pn);
                rate_sample = Some((p.delivered, p.delivered_time));
            }
        }

        if let Some((delivered, since)) = rate_sample {
            self.delivered_time = now;
            let interval = now.saturating_sub(since);
            if interval > 0 {
                let sample = (self.delivered - delivered).saturating_mul(1_000_000) / interval;
                self.delivery_rate = if self.delivery_rate == 0 {
                    sample
                } else {
                    (7 * self.delivery_rate + sample) / 8
                };
            }
        }

        if self.peer_completed_address_validation {
            self.pto_count = 0;
        }

        outcome.newly_acked = newly_acked.len();
        outcome.acked = newly_acked.into_iter().flat_map(|p| p.frames).collect();

        self.set_loss_detection_timer(now);
        Ok(outcome)
    }

    fn loss_delay(&self) -> u64 {
        let base = self.rtt.latest().max(self.rtt.smoothed());
        (base * TIME_THRESHOLD_NUM / TIME_THRESHOLD_DEN).max(GRANULARITY)
    }

    fn detect_lost_packets(&mut self, epoch: Epoch, now: Instant) -> Vec<SentFrame> {
        let loss_delay = self.loss_delay();
        let lost_send_time = now.saturating_sub(loss_delay);
        let persistent_duration =
            (self.rtt.pto_base() + self.rtt.max_ack_delay()) * PERSISTENT_CONGESTION_THRESHOLD;

        let space = &mut self.spaces[epoch.index()];
        space.loss_time = None;
        let Some(largest_acked) = space.largest_acked else {
            return Vec::new();
        };

        let mut lost_pns = Vec::new();
        for (pn, p) in space.sent.range(..=largest_acked) {
            if p.time_sent <= lost_send_time || largest_acked >= pn + PACKET_THRESHOLD {
                lost_pns.push(*pn);
            } else {
                let t = p.time_sent + loss_delay;
                space.loss_time = Some(space.loss_time.map_or(t, |l| l.min(t)));
            }
        }

        let mut frames = Vec::new();
        let mut largest_lost_time = None;
        let mut span: Option<(Instant, Instant)> = None;
        for pn in lost_pns {
            let Some(p) = space.sent.remove(&pn) else { continue };
            tracing::trace!(?epoch, pn, "packet lost");
            if p.ack_eliciting {
                space.ack_eliciting_in_flight = space.ack_eliciting_in_flight.saturating_sub(1);
                span = Some(match span {
                    None => (p.time_sent, p.time_sent),
                    Some((lo, hi)) => (lo.min(p.time_sent), hi.max(p.time_sent)),
                });
            }
            if p.in_flight {
                self.cc.on_packet_lost(p.size);
                largest_lost_time = Some(p.time_sent);
            }
            self.lost_count += 1;
            self.lost_bytes += p.size as u64;
            if !p.frames.is_empty() {
                self.retrans_count += 1;
            }
            frames.extend(p.frames);
        }

        if let Some(sent_time) = largest_lost_time {
            self.cc.on_congestion_event(sent_time, now);
            if let Some((lo, hi)) = span
                && self.rtt.has_sample()
                && hi - lo > persistent_duration
            {
                tracing::debug!("persistent congestion");
                self.cc.on_persistent_congestion();
            }
        }

        frames
    }

    fn earliest_loss_time(&self) -> Option<(Instant, Epoch)> {
        Epoch::ALL
            .iter()
            .filter_map(|&e| self.spaces[e.index()].loss_time.map(|t| (t, e)))
            .min_by_key(|(t, _)| *t)
    }

    fn no_ack_eliciting_in_flight(&self) -> bool {
        self.spaces.iter().all(|s| s.ack_eliciting_in_flight == 0)
    }

    fn anti_deadlock_epoch(&self) -> Epoch {
        if self.has_handshake_keys { Epoch::Handshake } else { Epoch::Initial }
    }

    fn pto_time_and_space(&self, now: Instant) -> Option<(Instant, Epoch)> {
        let backoff = 1u64 << self.pto_count.min(16);
        let mut duration = self.rtt.pto_base() * backoff;

        if self.no_ack_eliciting_in_flight() {
            if self.peer_completed_address_validation {
                return None;
            }
            // client keeps probing so the server can lift its amplification limit
            return Some((now + duration, self.anti_deadlock_epoch()));
        }

        let mut best: Option<(Instant, Epoch)> = None;
        for epoch in Epoch::ALL {
            let space = &self.spaces[epoch.index()];
            if space.ack_eliciting_in_flight == 0 {
                continue;
            }
            if epoch == Epoch::Application {
                if !self.handshake_confirmed {
                    return best;
                }
                duration += self.rtt.max_ack_delay() * backoff;
            }
            if let Some(last) = space.time_of_last_ack_eliciting {
                let t = last + duration;
                if best.is_none_or(|(b, _)| t < b) {
                    best = Some((t, epoch));
                }
            }
        }
        best
    }

    fn set_loss_detection_timer(&mut self, now: Instant) {
        if let Some((t, _)) = self.earliest_loss_time() {
            self.loss_detection_timer = Some(t);
            return;
        }
        self.loss_detection_timer = self.pto_time_and_space(now).map(|(t, _)| t);
    }

    pub fn on_loss_detection_timeout(&mut self, now: Instant) -> TimeoutOutcome {
        let mut outcome = TimeoutOutcome::default();

        if let Some((_, epoch)) = self.earliest_loss_time() {
            outcome.retransmit = self.detect_lost_packets(epoch, now);
            outcome.epoch = Some(epoch);
            self.set_loss_detection_timer(now);
            return outcome;
        }

        if self.no_ack_eliciting_in_flight() {
            if !self.peer_completed_address_validation {
                outcome.probe = Some(self.anti_deadlock_epoch());
                self.pto_count += 1;
            }
            self.set_loss_detection_timer(now);
            return outcome;
        }

        if let Some((_, epoch)) = self.pto_time_and_space(now) {
            let space = &self.spaces[epoch.index()];
            for p in space
                .sent
                .values()
                .filter(|p| p.ack_eliciting)
                .take(PTO_PROBE_PACKETS)
            {
                outcome.retransmit.extend(p.frames.iter().cloned());
            }
            if !outcome.retransmit.is_empty() {
                self.retrans_count += 1;
            }
            outcome.epoch = Some(epoch);
            outcome.probe = Some(epoch);
            tracing::trace!(?epoch, pto_count = self.pto_count, "probe timeout");
        }

        self.pto_count += 1;
        self.set_loss_detection_timer(now);
        outcome
    }

    /// Drop all state for a packet number space whose keys were discarded.
    pub fn on_space_discarded(&mut self, epoch: Epoch, now: Instant) {
        let space = &mut self.spaces[epoch.index()];
        for p in core::mem::take(&mut space.sent).into_values() {
            if p.in_flight {
                self.cc.on_packet_discarded(p.size);
            }
        }
        space.time_of_last_ack_eliciting = None;
        space.loss_time = None;
        space.ack_eliciting_in_flight = 0;
        space.discarded = true;
        self.pto_count = 0;
        self.set_loss_detection_timer(now);
    }

    /// Forget packets sent in `epoch` without retiring the space, as a client
    /// does for its Initial packets after a Retry or for its 0-RTT packets
    /// after the server refuses early data. Nothing counts as lost; the frames
    /// that were carried are handed back for resending.
    pub fn reset_space(&mut self, epoch: Epoch, now: Instant) -> Vec<SentFrame> {
        let space = &mut self.spaces[epoch.index()];
        let mut frames = Vec::new();
        for p in core::mem::take(&mut space.sent).into_values() {
            if p.in_flight {
                self.cc.on_packet_discarded(p.size);
            }
            frames.extend(p.frames);
        }
        space.time_of_last_ack_eliciting = None;
        space.loss_time = None;
        space.ack_eliciting_in_flight = 0;
        self.pto_count = 0;
        self.set_loss_detection_timer(now);
        frames
    }

    pub fn is_discarded(&self, epoch: Epoch) -> bool {
        self.spaces[epoch.index()].discarded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recovery(is_client: bool) -> Recovery {
        Recovery::new(is_client, CongestionControlAlgorithm::Reno, 1200, false, 25_000)
    }

    fn stream_pkt(pn: u64, t: Instant) -> SentPacket {
        SentPacket::new(
            pn,
            t,
            1200,
            vec![SentFrame::Stream { id: 0, offset: pn * 100, len: 100, fin: false }],
        )
    }

    #[test]
    fn path_response_alone_elicits_an_ack() {
        let pkt = SentPacket::new(3, 0, 60, vec![SentFrame::PathResponse]);
        assert!(pkt.ack_eliciting && pkt.in_flight);
        let ack_only = SentPacket::new(4, 0, 40, Vec::new());
        assert!(!ack_only.ack_eliciting && !ack_only.in_flight);
    }

    #[test]
    fn reset_space_hands_back_frames_without_loss() {
        let mut r = recovery(true);
        r.on_packet_sent(Epoch::Application, stream_pkt(0, 1_000), 1_000);
        r.on_packet_sent(Epoch::Application, stream_pkt(1, 1_000), 1_000);

        let frames = r.reset_space(Epoch::Application, 2_000);
        assert_eq!(
            frames,
            vec![
                SentFrame::Stream { id: 0, offset: 0, len: 100, fin: false },
                SentFrame::Stream { id: 0, offset: 100, len: 100, fin: false },
            ]
        );
        assert_eq!(r.cc.bytes_in_flight(), 0);
        assert_eq!(r.retrans_count, 0);
        assert!(!r.has_ack_eliciting_in_flight(Epoch::Application));
        assert!(!r.is_discarded(Epoch::Application));
    }

    #[test]
    fn rtt_first_sample() {
        let mut rtt = RttEstimator::new(25_000);
        assert_eq!(rtt.smoothed(), INITIAL_RTT);
        rtt.update(100_000, 0, false);
        assert_eq!(rtt.smoothed(), 100_000);
        assert_eq!(rtt.rttvar(), 50_000);
        assert_eq!(rtt.min(), 100_000);
    }

    #[test]
    fn rtt_converges() {
        let mut rtt = RttEstimator::new(25_000);
        rtt.update(200_000, 0, true);
        for _ in 0..64 {
            rtt.update(50_000, 0, true);
        }
        assert!(rtt.smoothed().abs_diff(50_000) < 1_000);
        assert!(rtt.rttvar() < 1_000);
        assert_eq!(rtt.min(), 50_000);
    }

    #[test]
    fn ack_delay_not_subtracted_below_min() {
        let mut rtt = RttEstimator::new(25_000);
        rtt.update(50_000, 0, true);
        rtt.update(60_000, 20_000, true);
        // 60ms - 20ms would undercut min_rtt, so the raw sample is used
        assert_eq!(rtt.smoothed(), (7 * 50_000 + 60_000) / 8);
    }

    #[test]
    fn ack_of_unsent_packet_is_violation() {
        let mut r = recovery(true);
        r.on_packet_sent(Epoch::Initial, stream_pkt(0, 0), 0);
        let err = r.on_ack_received(Epoch::Initial, &[(0, 5)], 0, 10_000).unwrap_err();
        assert_eq!(err, Error::Transport(TransportError::ProtocolViolation));
        assert!(r.on_ack_received(Epoch::Handshake, &[(0, 0)], 0, 10_000).is_err());
    }

    #[test]
    fn ack_returns_frames_and_samples_rtt() {
        let mut r = recovery(false);
        r.on_packet_sent(Epoch::Application, stream_pkt(0, 1_000), 1_000);
        r.on_packet_sent(Epoch::Application, stream_pkt(1, 2_000), 2_000);
        assert_eq!(r.cc.bytes_in_flight(), 2400);

        let out = r.on_ack_received(Epoch::Application, &[(0, 1)], 0, 42_000).unwrap();
        assert_eq!(out.newly_acked, 2);
        assert_eq!(out.acked.len(), 2);
        assert!(out.lost.is_empty());
        assert_eq!(r.rtt.latest(), 40_000);
        assert_eq!(r.cc.bytes_in_flight(), 0);
        assert!(r.delivery_rate() > 0);

        // duplicate ack changes nothing
        let again = r.on_ack_received(Epoch::Application, &[(0, 1)], 0, 50_000).unwrap();
        assert_eq!(again.newly_acked, 0);
    }

    #[test]
    fn packet_threshold_loss() {
        let mut r = recovery(false);
        for pn in 0..5 {
            r.on_packet_sent(Epoch::Application, stream_pkt(pn, pn * 10), pn * 10);
        }
        let out = r.on_ack_received(Epoch::Application, &[(4, 4)], 0, 60).unwrap();
        // 0 and 1 are three or more behind the largest acknowledged
        assert_eq!(
            out.lost,
            vec![
                SentFrame::Stream { id: 0, offset: 0, len: 100, fin: false },
                SentFrame::Stream { id: 0, offset: 100, len: 100, fin: false },
            ]
        );
        assert_eq!(r.lost_count, 2);
        // 2 and 3 wait on the time threshold
        assert!(r.loss_detection_timer().is_some());
    }

    #[test]
    fn pto_requeues_oldest_frames() {
        let mut r = recovery(false);
        r.on_packet_sent(Epoch::Initial, stream_pkt(0, 0), 0);
        let deadline = r.loss_detection_timer().unwrap();
        assert_eq!(deadline, INITIAL_RTT + 4 * (INITIAL_RTT / 2));

        let out = r.on_loss_detection_timeout(deadline);
        assert_eq!(out.probe, Some(Epoch::Initial));
        assert_eq!(out.retransmit.len(), 1);
        assert_eq!(r.pto_count(), 1);
        // backoff doubles the next deadline
        assert_eq!(r.loss_detection_timer(), Some(2 * deadline));
    }

    #[test]
    fn client_arms_anti_deadlock_timer() {
        let mut r = recovery(true);
        r.on_packet_sent(Epoch::Initial, stream_pkt(0, 0), 0);
        r.on_ack_received(Epoch::Initial, &[(0, 0)], 0, 30_000).unwrap();
        // nothing in flight but the server may still be amplification-limited
        assert!(r.loss_detection_timer().is_some());
        let out = r.on_loss_detection_timeout(r.loss_detection_timer().unwrap());
        assert_eq!(out.probe, Some(Epoch::Initial));

        let mut server = recovery(false);
        server.on_packet_sent(Epoch::Initial, stream_pkt(0, 0), 0);
        server.on_ack_received(Epoch::Initial, &[(0, 0)], 0, 30_000).unwrap();
        assert_eq!(server.loss_detection_timer(), None);
    }

    #[test]
    fn discarding_space_clears_flight() {
        let mut r = recovery(true);
        r.on_packet_sent(Epoch::Initial, stream_pkt(0, 0), 0);
        r.on_handshake_keys();
        r.on_space_discarded(Epoch::Initial, 10);
        assert_eq!(r.cc.bytes_in_flight(), 0);
        assert!(r.is_discarded(Epoch::Initial));
        assert!(!r.has_ack_eliciting_in_flight(Epoch::Initial));
    }
}
