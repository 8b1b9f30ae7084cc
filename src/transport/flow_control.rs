//! Credit-based flow control (RFC 9000 §4), used both per stream and for the
//! connection as a whole.

use crate::error::Error;

/// Receive side: what we allow the peer to send.
#[derive(Debug)]
pub struct RecvWindow {
    /// Limit currently advertised to the peer.
    max_data: u64,
    window: u64,
    /// Highest offset (or sum of offsets) received.
    received: u64,
    /// Bytes handed to the application.
    consumed: u64,
}

impl RecvWindow {
    pub fn new(window: u64) -> Self {
        Self {
            max_data: window,
            window,
            received: 0,
            consumed: 0,
        }
    }

    pub fn max_data(&self) -> u64 {
        self.max_data
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    /// Account for `bytes` of newly received data.
    pub fn on_received(&mut self, bytes: u64) -> Result<(), Error> {
        let next = self.received + bytes;
        if next > self.max_data {
            tracing::debug!(next, max = self.max_data, "peer exceeded flow control limit");
            return Err(Error::FlowControl);
        }
        self.received = next;
        Ok(())
    }

    pub fn on_consumed(&mut self, bytes: u64) {
        self.consumed += bytes;
    }

    /// Half of the window has been consumed since the last update.
    pub fn should_update(&self) -> bool {
        self.max_data - self.consumed.min(self.max_data) < self.window / 2
    }

    /// Raise the advertised limit; returns the new value.
    pub fn update(&mut self) -> u64 {
        self.max_data = self.max_data.max(self.consumed + self.window);
        self.max_data
    }
}

/// Send side: what the peer allows us to send.
#[derive(Debug, Default)]
pub struct SendCredit {
    max_data: u64,
    used: u64,
}

impl SendCredit {
    pub fn new(max_data: u64) -> Self {
        Self { max_data, used: 0 }
    }

    pub fn capacity(&self) -> u64 {
        self.max_data.saturating_sub(self.used)
    }

    pub fn used(&self) -> u64 {
        self.used
    }

    pub fn max_data(&self) -> u64 {
        self.max_data
    }

    pub fn consume(&mut self, bytes: u64) {
        self.used += bytes;
    }

    /// Apply a MAX_DATA / MAX_STREAM_DATA. Limits never shrink; returns
    /// whether credit grew.
    pub fn update_max(&mut self, max_data: u64) -> bool {
        if max_data > self.max_data {
            self.max_data = max_data;
            true
        } else {
            false
        }
    }
}
