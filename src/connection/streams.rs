// Application-facing stream API.

use tracing::debug;

use super::{Connection, ConnectionState};
use crate::error::Error;
use crate::transport::stream::{is_bidirectional, is_local};

/// Direction of a stream to shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shutdown {
    /// Stop receiving; the peer is sent STOP_SENDING.
    Read,
    /// Stop sending; the peer is sent RESET_STREAM.
    Write,
}

/// Snapshot of stream IDs taken when the iterator was created.
#[derive(Debug, Clone, Default)]
pub struct StreamIter {
    ids: std::vec::IntoIter<u64>,
}

impl StreamIter {
    fn new(ids: Vec<u64>) -> Self {
        Self { ids: ids.into_iter() }
    }
}

impl Iterator for StreamIter {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        self.ids.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.ids.size_hint()
    }
}

impl ExactSizeIterator for StreamIter {}

impl Connection {
    /// Queue `buf` on a stream, opening it if needed.
    ///
    /// Accepts as much as stream and connection credit allow and returns
    /// the number of bytes taken, possibly zero. `fin` only takes effect
    /// when all of `buf` was accepted.
    pub fn stream_send(&mut self, stream_id: u64, buf: &[u8], fin: bool) -> Result<usize, Error> {
        if matches!(
            self.state,
            ConnectionState::Closing | ConnectionState::Draining | ConnectionState::Closed
        ) {
            return Err(Error::InvalidState);
        }
        if !is_bidirectional(stream_id) && !is_local(stream_id, !self.is_server) {
            return Err(Error::InvalidStreamState(stream_id));
        }

        let stream = match self.streams.get_or_create(stream_id, true) {
            Err(Error::Done) => return Err(Error::InvalidStreamState(stream_id)),
            other => other?,
        };
        if let Some(code) = stream.stopped {
            return Err(Error::StreamStopped(stream_id, code));
        }
        if stream.send.is_reset() {
            return Err(Error::InvalidStreamState(stream_id));
        }
        if stream.send.is_fin() {
            return if buf.is_empty() && fin { Ok(0) } else { Err(Error::FinalSize) };
        }

        let capacity = stream.send_credit.capacity().min(self.tx_credit.capacity());
        let n = buf.len().min(usize::try_from(capacity).unwrap_or(usize::MAX));
        let fin = fin && n == buf.len();
        if n == 0 && !fin {
            return Ok(0);
        }

        stream.send.write(&buf[..n], fin)?;
        stream.send_credit.consume(n as u64);
        self.tx_credit.consume(n as u64);
        Ok(n)
    }

    /// Read in-order data from a stream into `out`.
    ///
    /// Returns the bytes read and whether the end of the stream was
    /// reached, or `Done` when nothing is ready. A peer reset is reported
    /// once as `StreamReset`.
    pub fn stream_recv(&mut self, stream_id: u64, out: &mut [u8]) -> Result<(usize, bool), Error> {
        if self.streams.is_collected(stream_id) {
            return Err(Error::Done);
        }
        let stream = self
            .streams
            .get_mut(stream_id)
            .ok_or(Error::InvalidStreamState(stream_id))?;
        if !stream.has_recv() {
            return Err(Error::InvalidStreamState(stream_id));
        }

        if let Some(code) = stream.take_reset() {
            if stream.is_complete() {
                self.streams.collect(stream_id);
            }
            return Err(Error::StreamReset(stream_id, code));
        }
        if !stream.is_readable() {
            return Err(Error::Done);
        }

        let (n, fin) = stream.recv.read(out);
        stream.recv_window.on_consumed(n as u64);
        self.rx_data.on_consumed(n as u64);
        if stream.recv.final_size().is_none() && stream.recv_window.should_update() {
            stream.max_data_pending = true;
        }
        if stream.is_complete() {
            self.streams.collect(stream_id);
        }
        Ok((n, fin))
    }

    /// Bytes [`stream_send`](Self::stream_send) would accept right now.
    pub fn stream_capacity(&self, stream_id: u64) -> Result<usize, Error> {
        let stream = self
            .streams
            .get(stream_id)
            .ok_or(Error::InvalidStreamState(stream_id))?;
        if let Some(code) = stream.stopped {
            return Err(Error::StreamStopped(stream_id, code));
        }
        if !stream.is_send_open() {
            return Ok(0);
        }
        let capacity = stream.send_credit.capacity().min(self.tx_credit.capacity());
        Ok(usize::try_from(capacity).unwrap_or(usize::MAX))
    }

    /// Stop one direction of a stream, discarding buffered data, and tell
    /// the peer with error code `err`.
    pub fn stream_shutdown(&mut self, stream_id: u64, direction: Shutdown, err: u64) -> Result<(), Error> {
        let stream = self.streams.get_mut(stream_id).ok_or(Error::Done)?;

        match direction {
            Shutdown::Read => {
                if !stream.has_recv() {
                    return Err(Error::InvalidStreamState(stream_id));
                }
                if stream.is_recv_shutdown() {
                    return Err(Error::Done);
                }
                let unread = stream.recv.max_off() - stream.recv.read_off();
                let all_received = stream.recv.final_size().is_some();
                stream.shutdown_recv();
                stream.recv_window.on_consumed(unread);
                self.rx_data.on_consumed(unread);
                if !all_received {
                    stream.stop_pending = Some(err);
                    stream.local_stop = Some(err);
                }
            }
            Shutdown::Write => {
                if !stream.has_send() {
                    return Err(Error::InvalidStreamState(stream_id));
                }
                if stream.send.is_reset() || stream.send.is_complete() {
                    return Err(Error::Done);
                }
                let final_size = stream.send.len();
                stream.send.reset();
                stream.reset_pending = Some((err, final_size));
                stream.local_reset = Some((err, final_size));
            }
        }

        debug!(trace_id = %self.trace_id, stream_id, ?direction, err, "stream shutdown");
        if stream.is_complete() {
            self.streams.collect(stream_id);
        }
        Ok(())
    }

    /// All data up to the FIN was read, or the peer reset the stream.
    pub fn stream_finished(&self, stream_id: u64) -> bool {
        match self.streams.get(stream_id) {
            Some(s) => s.recv.is_fin_delivered() || s.peer_reset.is_some(),
            None => self.streams.is_collected(stream_id),
        }
    }

    pub fn stream_readable(&self, stream_id: u64) -> bool {
        self.streams.get(stream_id).is_some_and(|s| s.is_readable())
    }

    /// Whether the stream can take `len` bytes right now.
    pub fn stream_writable(&self, stream_id: u64, len: usize) -> Result<bool, Error> {
        Ok(self.stream_capacity(stream_id)? >= len)
    }

    /// Streams with data, a FIN or a reset to report.
    pub fn readable(&self) -> StreamIter {
        StreamIter::new(self.streams.readable())
    }

    /// Streams that can take more data.
    pub fn writable(&self) -> StreamIter {
        StreamIter::new(self.streams.writable(self.tx_credit.capacity()))
    }

    /// Bidirectional streams we may still open.
    pub fn peer_streams_left_bidi(&self) -> u64 {
        self.streams.peer_streams_left_bidi()
    }

    pub fn peer_streams_left_uni(&self) -> u64 {
        self.streams.peer_streams_left_uni()
    }
}
