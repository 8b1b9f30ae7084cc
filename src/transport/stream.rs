use std::collections::{BTreeMap, BTreeSet};

use super::buffer::{RecvBuf, SendBuf};
use super::flow_control::{RecvWindow, SendCredit};
use crate::error::Error;

// ---------------------------------------------------------------------------
// Stream ID helpers
// ---------------------------------------------------------------------------

pub fn is_client_initiated(stream_id: u64) -> bool {
    stream_id & 0x01 == 0
}

pub fn is_server_initiated(stream_id: u64) -> bool {
    stream_id & 0x01 == 1
}

pub fn is_bidirectional(stream_id: u64) -> bool {
    stream_id & 0x02 == 0
}

pub fn is_unidirectional(stream_id: u64) -> bool {
    stream_id & 0x02 != 0
}

/// Whether `stream_id` was opened by this endpoint.
pub fn is_local(stream_id: u64, is_client: bool) -> bool {
    is_client_initiated(stream_id) == is_client
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamType {
    ClientBidi = 0x00,
    ServerBidi = 0x01,
    ClientUni = 0x02,
    ServerUni = 0x03,
}

impl StreamType {
    pub fn from_id(id: u64) -> Self {
        match id & 0x03 {
            0x00 => StreamType::ClientBidi,
            0x01 => StreamType::ServerBidi,
            0x02 => StreamType::ClientUni,
            _ => StreamType::ServerUni,
        }
    }

    pub fn local(is_client: bool, bidi: bool) -> Self {
        match (is_client, bidi) {
            (true, true) => StreamType::ClientBidi,
            (false, true) => StreamType::ServerBidi,
            (true, false) => StreamType::ClientUni,
            (false, false) => StreamType::ServerUni,
        }
    }

    /// The stream ID for the nth stream of this type (0-indexed).
    pub fn stream_id(self, n: u64) -> u64 {
        n * 4 + self as u64
    }
}

// ---------------------------------------------------------------------------
// Per-stream state
// ---------------------------------------------------------------------------

/// Initial per-stream windows, as carried in transport parameters.
#[derive(Debug, Clone, Copy, Default)]
pub struct StreamLimits {
    pub bidi_local: u64,
    pub bidi_remote: u64,
    pub uni: u64,
}

#[derive(Debug)]
pub struct Stream {
    pub id: u64,
    has_send: bool,
    has_recv: bool,

    pub send: SendBuf,
    pub send_credit: SendCredit,
    pub recv: RecvBuf,
    pub recv_window: RecvWindow,

    /// Error code of a STOP_SENDING from the peer.
    pub stopped: Option<u64>,
    /// Error code of a RESET_STREAM from the peer.
    pub peer_reset: Option<u64>,
    reset_reported: bool,
    /// Read side was shut down locally.
    recv_shutdown: bool,

    /// RESET_STREAM (code, final size) waiting to go out.
    pub reset_pending: Option<(u64, u64)>,
    /// Code used in our RESET_STREAM, kept for retransmission.
    pub local_reset: Option<(u64, u64)>,
    /// STOP_SENDING code waiting to go out.
    pub stop_pending: Option<u64>,
    pub local_stop: Option<u64>,
    pub max_data_pending: bool,
}

impl Stream {
    fn new(id: u64, has_send: bool, has_recv: bool, send_max: u64, recv_window: u64) -> Self {
        Self {
            id,
            has_send,
            has_recv,
            send: SendBuf::new(),
            send_credit: SendCredit::new(send_max),
            recv: RecvBuf::new(),
            recv_window: RecvWindow::new(recv_window),
            stopped: None,
            peer_reset: None,
            reset_reported: false,
            recv_shutdown: false,
            reset_pending: None,
            local_reset: None,
            stop_pending: None,
            local_stop: None,
            max_data_pending: false,
        }
    }

    pub fn has_send(&self) -> bool {
        self.has_send
    }

    pub fn has_recv(&self) -> bool {
        self.has_recv
    }

    /// The send side accepts more data.
    pub fn is_send_open(&self) -> bool {
        self.has_send && !self.send.is_fin() && !self.send.is_reset() && self.stopped.is_none()
    }

    pub fn is_readable(&self) -> bool {
        if !self.has_recv || self.recv_shutdown {
            return false;
        }
        if self.peer_reset.is_some() {
            return !self.reset_reported;
        }
        self.recv.is_readable()
    }

    /// Report a peer reset to the application exactly once.
    pub fn take_reset(&mut self) -> Option<u64> {
        if self.reset_reported {
            return None;
        }
        let code = self.peer_reset?;
        self.reset_reported = true;
        Some(code)
    }

    pub fn shutdown_recv(&mut self) {
        self.recv_shutdown = true;
        self.recv.shutdown();
    }

    pub fn is_recv_shutdown(&self) -> bool {
        self.recv_shutdown
    }

    /// Something needs to be sent on this stream's behalf.
    pub fn has_pending_frames(&self) -> bool {
        self.send.has_pending()
            || self.reset_pending.is_some()
            || self.stop_pending.is_some()
            || self.max_data_pending
    }

    /// Both directions are finished and the stream can be forgotten.
    pub fn is_complete(&self) -> bool {
        let send_done = !self.has_send
            || self.send.is_complete()
            || (self.send.is_reset() && self.reset_pending.is_none());
        let recv_done = !self.has_recv
            || self.recv.is_fin_delivered()
            || (self.peer_reset.is_some() && self.reset_reported)
            || (self.recv_shutdown && self.recv.final_size().is_some());
        send_done && recv_done
    }
}

// ---------------------------------------------------------------------------
// StreamMap
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct StreamMap {
    streams: BTreeMap<u64, Stream>,
    /// IDs below a high-water mark that were jumped over and never created.
    /// Everything else below the mark and absent from `streams` is collected.
    skipped: BTreeSet<u64>,
    is_client: bool,

    /// Windows we grant the peer.
    local_limits: StreamLimits,
    /// Windows the peer grants us.
    peer_limits: StreamLimits,

    next_bidi_local: u64,
    next_uni_local: u64,
    peer_max_streams_bidi: u64,
    peer_max_streams_uni: u64,

    peer_opened_bidi: u64,
    peer_opened_uni: u64,
    local_max_streams_bidi: u64,
    local_max_streams_uni: u64,
    local_max_streams_bidi_next: u64,
    local_max_streams_uni_next: u64,
}

impl StreamMap {
    pub fn new(
        is_client: bool,
        local_limits: StreamLimits,
        max_streams_bidi: u64,
        max_streams_uni: u64,
    ) -> Self {
        Self {
            streams: BTreeMap::new(),
            skipped: BTreeSet::new(),
            is_client,
            local_limits,
            peer_limits: StreamLimits::default(),
            next_bidi_local: 0,
            next_uni_local: 0,
            peer_max_streams_bidi: 0,
            peer_max_streams_uni: 0,
            peer_opened_bidi: 0,
            peer_opened_uni: 0,
            local_max_streams_bidi: max_streams_bidi,
            local_max_streams_uni: max_streams_uni,
            local_max_streams_bidi_next: max_streams_bidi,
            local_max_streams_uni_next: max_streams_uni,
        }
    }

    /// Apply the peer's transport parameters.
    pub fn set_peer_limits(&mut self, limits: StreamLimits, max_bidi: u64, max_uni: u64) {
        self.peer_limits = limits;
        self.update_peer_max_streams(true, max_bidi);
        self.update_peer_max_streams(false, max_uni);

        let is_client = self.is_client;
        for s in self.streams.values_mut() {
            let credit = match (is_local(s.id, is_client), is_bidirectional(s.id)) {
                (true, true) => limits.bidi_remote,
                (false, true) => limits.bidi_local,
                (true, false) => limits.uni,
                (false, false) => continue,
            };
            s.send_credit.update_max(credit);
        }
    }

    pub fn update_peer_max_streams(&mut self, bidi: bool, max: u64) {
        if bidi {
            self.peer_max_streams_bidi = self.peer_max_streams_bidi.max(max);
        } else {
            self.peer_max_streams_uni = self.peer_max_streams_uni.max(max);
        }
    }

    pub fn peer_streams_left_bidi(&self) -> u64 {
        self.peer_max_streams_bidi.saturating_sub(self.next_bidi_local)
    }

    pub fn peer_streams_left_uni(&self) -> u64 {
        self.peer_max_streams_uni.saturating_sub(self.next_uni_local)
    }

    /// Next unused locally-initiated stream ID of the given direction.
    pub fn next_local_id(&self, bidi: bool) -> u64 {
        let n = if bidi { self.next_bidi_local } else { self.next_uni_local };
        StreamType::local(self.is_client, bidi).stream_id(n)
    }

    pub fn get(&self, id: u64) -> Option<&Stream> {
        self.streams.get(&id)
    }

    pub fn get_mut(&mut self, id: u64) -> Option<&mut Stream> {
        self.streams.get_mut(&id)
    }

    pub fn is_collected(&self, id: u64) -> bool {
        (id >> 2) < self.high_water(id) && !self.streams.contains_key(&id) && !self.skipped.contains(&id)
    }

    /// One past the highest sequence number opened in `id`'s class.
    fn high_water(&self, id: u64) -> u64 {
        match (is_local(id, self.is_client), is_bidirectional(id)) {
            (true, true) => self.next_bidi_local,
            (true, false) => self.next_uni_local,
            (false, true) => self.peer_opened_bidi,
            (false, false) => self.peer_opened_uni,
        }
    }

    /// Move the high-water mark of `id`'s class past `id`, remembering any
    /// lower IDs that were jumped over.
    fn open_through(&mut self, id: u64) {
        let seq = id >> 2;
        let mark = match (is_local(id, self.is_client), is_bidirectional(id)) {
            (true, true) => &mut self.next_bidi_local,
            (true, false) => &mut self.next_uni_local,
            (false, true) => &mut self.peer_opened_bidi,
            (false, false) => &mut self.peer_opened_uni,
        };
        if seq < *mark {
            self.skipped.remove(&id);
            return;
        }
        let class = id & 0x3;
        self.skipped.extend((*mark..seq).map(|n| n << 2 | class));
        *mark = seq + 1;
    }

    /// Look up a stream, creating it if it is new.
    ///
    /// `local` says whether the caller is this endpoint acting on its own
    /// behalf (sending) rather than processing a peer frame. Fails with
    /// `Done` for streams that were already collected.
    pub fn get_or_create(&mut self, id: u64, local: bool) -> Result<&mut Stream, Error> {
        if self.streams.contains_key(&id) {
            return self.streams.get_mut(&id).ok_or(Error::Done);
        }
        if self.is_collected(id) {
            return Err(Error::Done);
        }

        let bidi = is_bidirectional(id);
        let ours = is_local(id, self.is_client);
        let seq = id >> 2;

        if local && !ours && !bidi {
            // peer's unidirectional stream has no send side for us
            return Err(Error::InvalidStreamState(id));
        }

        let stream = if ours {
            if !local && !bidi {
                return Err(Error::InvalidStreamState(id));
            }
            let (max, next) = if bidi {
                (self.peer_max_streams_bidi, self.next_bidi_local)
            } else {
                (self.peer_max_streams_uni, self.next_uni_local)
            };
            if seq >= next && !local {
                // peer referenced one of our streams that does not exist yet
                return Err(Error::InvalidStreamState(id));
            }
            if seq >= max {
                return Err(Error::StreamLimit);
            }
            self.open_through(id);
            if bidi {
                Stream::new(id, true, true, self.peer_limits.bidi_remote, self.local_limits.bidi_local)
            } else {
                Stream::new(id, true, false, self.peer_limits.uni, 0)
            }
        } else {
            let max = if bidi { self.local_max_streams_bidi } else { self.local_max_streams_uni };
            if seq >= max {
                tracing::debug!(id, max, "peer exceeded stream limit");
                return Err(Error::StreamLimit);
            }
            self.open_through(id);
            if bidi {
                Stream::new(id, true, true, self.peer_limits.bidi_local, self.local_limits.bidi_remote)
            } else {
                Stream::new(id, false, true, 0, self.local_limits.uni)
            }
        };

        tracing::trace!(id, "stream created");
        Ok(self.streams.entry(id).or_insert(stream))
    }

    /// Forget a finished stream. Completed peer streams free up room for a
    /// new MAX_STREAMS.
    pub fn collect(&mut self, id: u64) {
        if self.streams.remove(&id).is_none() {
            return;
        }
        if !is_local(id, self.is_client) {
            if is_bidirectional(id) {
                self.local_max_streams_bidi_next += 1;
            } else {
                self.local_max_streams_uni_next += 1;
            }
        }
        tracing::trace!(id, "stream collected");
    }

    /// Collect every stream whose both directions are done.
    pub fn collect_complete(&mut self) {
        let done: Vec<u64> = self
            .streams
            .values()
            .filter(|s| s.is_complete())
            .map(|s| s.id)
            .collect();
        for id in done {
            self.collect(id);
        }
    }

    pub fn should_update_max_streams(&self, bidi: bool) -> bool {
        let (max, next, opened) = if bidi {
            (self.local_max_streams_bidi, self.local_max_streams_bidi_next, self.peer_opened_bidi)
        } else {
            (self.local_max_streams_uni, self.local_max_streams_uni_next, self.peer_opened_uni)
        };
        next != max && next / 2 > max - opened
    }

    /// Raise the advertised stream limit; returns the new value.
    pub fn update_max_streams(&mut self, bidi: bool) -> u64 {
        if bidi {
            self.local_max_streams_bidi = self.local_max_streams_bidi_next;
            self.local_max_streams_bidi
        } else {
            self.local_max_streams_uni = self.local_max_streams_uni_next;
            self.local_max_streams_uni
        }
    }

    pub fn local_max_streams(&self, bidi: bool) -> u64 {
        if bidi { self.local_max_streams_bidi } else { self.local_max_streams_uni }
    }

    /// IDs of streams with data or a state change for the application.
    pub fn readable(&self) -> Vec<u64> {
        self.streams.values().filter(|s| s.is_readable()).map(|s| s.id).collect()
    }

    /// IDs of streams that can take more data right now.
    pub fn writable(&self, conn_capacity: u64) -> Vec<u64> {
        if conn_capacity == 0 {
            return Vec::new();
        }
        self.streams
            .values()
            .filter(|s| s.is_send_open() && s.send_credit.capacity() > 0)
            .map(|s| s.id)
            .collect()
    }

    /// IDs of streams that have frames to send.
    pub fn sendable(&self) -> Vec<u64> {
        self.streams.values().filter(|s| s.has_pending_frames()).map(|s| s.id).collect()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Stream> {
        self.streams.values_mut()
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
