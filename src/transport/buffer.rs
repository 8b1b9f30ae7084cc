//! Byte-stream buffers shared by STREAM and CRYPTO data.
//!
//! [`SendBuf`] keeps written bytes until the peer acknowledges them and
//! remembers which ranges must be sent again. [`RecvBuf`] reassembles
//! out-of-order data into an in-order byte stream.

use std::collections::BTreeMap;

use crate::error::Error;

/// Insert `[start, end)` into a map of disjoint `start -> end` ranges,
/// merging with any overlapping or adjacent neighbors.
fn insert_range(ranges: &mut BTreeMap<u64, u64>, mut start: u64, mut end: u64) {
    if start >= end {
        return;
    }
    if let Some((&s, &e)) = ranges.range(..=start).next_back()
        && e >= start
    {
        start = s;
        end = end.max(e);
        ranges.remove(&s);
    }
    while let Some((&s, &e)) = ranges.range(start..=end).next() {
        end = end.max(e);
        ranges.remove(&s);
    }
    ranges.insert(start, end);
}

/// Remove `[start, end)` from a map of disjoint ranges.
fn remove_range(ranges: &mut BTreeMap<u64, u64>, start: u64, end: u64) {
    if start >= end {
        return;
    }
    let overlapping: Vec<(u64, u64)> = ranges
        .range(..end)
        .filter(|&(_, &e)| e > start)
        .map(|(&s, &e)| (s, e))
        .collect();
    for (s, e) in overlapping {
        ranges.remove(&s);
        if s < start {
            ranges.insert(s, start);
        }
        if e > end {
            ranges.insert(end, e);
        }
    }
}

/// A contiguous piece of a [`SendBuf`] ready to go into a frame.
#[derive(Debug, PartialEq, Eq)]
pub struct Chunk<'a> {
    pub offset: u64,
    pub data: &'a [u8],
    pub fin: bool,
}

/// Outgoing byte stream.
#[derive(Debug, Default)]
pub struct SendBuf {
    /// Unacknowledged bytes starting at `base`.
    data: Vec<u8>,
    base: u64,
    /// Next offset that has never been sent.
    emitted: u64,
    /// Ranges to send again.
    retransmit: BTreeMap<u64, u64>,
    /// Acknowledged ranges above `base`.
    acked: BTreeMap<u64, u64>,
    final_size: Option<u64>,
    fin_sent: bool,
    fin_acked: bool,
    reset: bool,
}

impl SendBuf {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total bytes ever written.
    pub fn len(&self) -> u64 {
        self.base + self.data.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Largest offset handed out for transmission.
    pub fn max_sent(&self) -> u64 {
        self.emitted
    }

    pub fn final_size(&self) -> Option<u64> {
        self.final_size
    }

    pub fn is_fin(&self) -> bool {
        self.final_size.is_some()
    }

    pub fn is_reset(&self) -> bool {
        self.reset
    }

    /// Append data, optionally marking the end of the stream.
    pub fn write(&mut self, data: &[u8], fin: bool) -> Result<(), Error> {
        if self.final_size.is_some() {
            if data.is_empty() && fin {
                return Ok(());
            }
            return Err(Error::FinalSize);
        }
        self.data.extend_from_slice(data);
        if fin {
            self.final_size = Some(self.len());
        }
        Ok(())
    }

    /// Something is waiting to be sent.
    pub fn has_pending(&self) -> bool {
        if self.reset {
            return false;
        }
        !self.retransmit.is_empty()
            || self.emitted < self.len()
            || (self.final_size.is_some() && !self.fin_sent)
    }

    /// Bytes of new data not yet sent.
    pub fn unsent(&self) -> u64 {
        self.len() - self.emitted
    }

    /// Take up to `max_len` bytes for transmission, preferring ranges that
    /// must be sent again. `limit` caps the highest offset of new data
    /// (flow control).
    pub fn emit(&mut self, max_len: usize, limit: u64) -> Option<Chunk<'_>> {
        if self.reset {
            return None;
        }

        let (offset, end) = if let Some((&s, &e)) = self.retransmit.iter().next() {
            let s = s.max(self.base);
            let end = e.min(s + max_len as u64).max(s);
            remove_range(&mut self.retransmit, 0, end);
            (s, end)
        } else {
            let end = self.len().min(self.emitted + max_len as u64).min(limit.max(self.emitted));
            (self.emitted, end)
        };

        let at_final = self.final_size == Some(end);
        if offset == end && !(at_final && !self.fin_sent) {
            return None;
        }

        self.emitted = self.emitted.max(end);
        let fin = at_final;
        if fin {
            self.fin_sent = true;
        }

        let lo = (offset - self.base) as usize;
        let hi = (end - self.base) as usize;
        Some(Chunk { offset, data: &self.data[lo..hi], fin })
    }

    /// The peer acknowledged `[offset, offset + len)`.
    pub fn ack(&mut self, offset: u64, len: u64, fin: bool) {
        let end = offset + len;
        if fin {
            self.fin_acked = true;
        }
        if end <= self.base {
            return;
        }
        insert_range(&mut self.acked, offset.max(self.base), end);
        remove_range(&mut self.retransmit, offset, end);

        if let Some((&s, &e)) = self.acked.iter().next()
            && s <= self.base
        {
            let drop = (e - self.base) as usize;
            self.data.drain(..drop.min(self.data.len()));
            self.base = e;
            self.acked.remove(&s);
        }
    }

    /// `[offset, offset + len)` was lost and must be sent again.
    pub fn retransmit(&mut self, offset: u64, len: u64, fin: bool) {
        if self.reset {
            return;
        }
        let start = offset.max(self.base);
        let end = offset + len;
        if start < end {
            insert_range(&mut self.retransmit, start, end);
            // never resend what was already acknowledged
            let acked: Vec<(u64, u64)> = self.acked.iter().map(|(&s, &e)| (s, e)).collect();
            for (s, e) in acked {
                remove_range(&mut self.retransmit, s, e);
            }
        }
        if fin && !self.fin_acked {
            self.fin_sent = false;
        }
    }

    /// Abandon the stream; returns the final size to put in RESET_STREAM.
    pub fn reset(&mut self) -> u64 {
        self.reset = true;
        self.retransmit.clear();
        self.data.clear();
        self.base = self.emitted;
        self.emitted
    }

    /// All data and the FIN have been acknowledged.
    pub fn is_complete(&self) -> bool {
        self.fin_acked && self.final_size == Some(self.base)
    }
}

/// Incoming byte stream with out-of-order reassembly.
#[derive(Debug, Default)]
pub struct RecvBuf {
    /// Disjoint received pieces at or above `read_off`, keyed by offset.
    chunks: BTreeMap<u64, Vec<u8>>,
    read_off: u64,
    /// Highest offset seen.
    max_off: u64,
    final_size: Option<u64>,
    fin_delivered: bool,
}

impl RecvBuf {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offset of the next byte the application will read.
    pub fn read_off(&self) -> u64 {
        self.read_off
    }

    pub fn max_off(&self) -> u64 {
        self.max_off
    }

    pub fn final_size(&self) -> Option<u64> {
        self.final_size
    }

    /// Buffer incoming data. Returns how far the highest received offset
    /// advanced, which is what flow control counts.
    pub fn write(&mut self, offset: u64, data: &[u8], fin: bool) -> Result<u64, Error> {
        let end = offset + data.len() as u64;

        if let Some(final_size) = self.final_size {
            if end > final_size || (fin && end != final_size) {
                return Err(Error::FinalSize);
            }
        }
        if fin {
            if end < self.max_off {
                return Err(Error::FinalSize);
            }
            self.final_size = Some(end);
        }

        let advanced = end.saturating_sub(self.max_off);
        self.max_off = self.max_off.max(end);

        let mut pos = offset.max(self.read_off);
        while pos < end {
            if let Some((&s, c)) = self.chunks.range(..=pos).next_back() {
                let chunk_end = s + c.len() as u64;
                if chunk_end > pos {
                    pos = chunk_end;
                    continue;
                }
            }
            let next = self
                .chunks
                .range(pos..)
                .next()
                .map_or(end, |(&s, _)| s)
                .min(end);
            let lo = (pos - offset) as usize;
            let hi = (next - offset) as usize;
            self.chunks.insert(pos, data[lo..hi].to_vec());
            pos = next;
        }

        Ok(advanced)
    }

    /// Copy in-order data into `out`. Returns bytes copied and whether the
    /// end of the stream was reached.
    pub fn read(&mut self, out: &mut [u8]) -> (usize, bool) {
        let mut copied = 0;
        while copied < out.len() {
            let Some(mut entry) = self.chunks.first_entry() else { break };
            if *entry.key() != self.read_off {
                break;
            }
            let chunk = entry.get_mut();
            let n = chunk.len().min(out.len() - copied);
            out[copied..copied + n].copy_from_slice(&chunk[..n]);
            copied += n;
            self.read_off += n as u64;
            if n == chunk.len() {
                entry.remove();
            } else {
                let rest = chunk.split_off(n);
                entry.remove();
                self.chunks.insert(self.read_off, rest);
            }
        }

        let fin = self.is_fin();
        if fin {
            self.fin_delivered = true;
        }
        (copied, fin)
    }

    /// Drain all contiguous data.
    pub fn read_all(&mut self) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(entry) = self.chunks.first_entry() {
            if *entry.key() != self.read_off {
                break;
            }
            let chunk = entry.remove();
            self.read_off += chunk.len() as u64;
            out.extend_from_slice(&chunk);
        }
        out
    }

    /// In-order data is available, or the FIN has not yet been handed over.
    pub fn is_readable(&self) -> bool {
        self.chunks.keys().next() == Some(&self.read_off) || (self.is_fin() && !self.fin_delivered)
    }

    /// Every byte up to the final size has been read.
    pub fn is_fin(&self) -> bool {
        self.final_size == Some(self.read_off)
    }

    pub fn is_fin_delivered(&self) -> bool {
        self.fin_delivered
    }

    /// Bytes buffered beyond the read offset.
    pub fn buffered(&self) -> u64 {
        self.max_off - self.read_off
    }

    /// Apply a RESET_STREAM. Returns how far the highest offset advanced.
    pub fn reset(&mut self, final_size: u64) -> Result<u64, Error> {
        if let Some(known) = self.final_size
            && known != final_size
        {
            return Err(Error::FinalSize);
        }
        if final_size < self.max_off {
            return Err(Error::FinalSize);
        }
        let advanced = final_size - self.max_off;
        self.max_off = final_size;
        self.final_size = Some(final_size);
        self.chunks.clear();
        self.read_off = final_size;
        Ok(advanced)
    }

    /// Discard everything buffered, as after STOP_SENDING.
    pub fn shutdown(&mut self) {
        self.chunks.clear();
        self.read_off = self.max_off;
    }
}
