//! Responses waiting on stream capacity.

use std::collections::HashMap;

use super::{Connection, Header};
use crate::error::Error;

/// What is left of a response that did not fit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartialResponse {
    /// Headers not sent yet.
    pub headers: Option<Vec<Header>>,
    pub body: Vec<u8>,
    /// Bytes of `body` already sent.
    pub written: usize,
}

impl PartialResponse {
    pub fn new(headers: Vec<Header>, body: Vec<u8>) -> Self {
        Self { headers: Some(headers), body, written: 0 }
    }

    fn is_complete(&self) -> bool {
        self.headers.is_none() && self.written == self.body.len()
    }
}

/// Blocked responses keyed by stream ID.
///
/// An entry stays until its whole body was written; retry it with
/// [`on_writable`](Self::on_writable) when the stream becomes writable.
#[derive(Debug, Default)]
pub struct PartialResponses {
    pending: HashMap<u64, PartialResponse>,
}

impl PartialResponses {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stash(&mut self, stream_id: u64, response: PartialResponse) {
        self.pending.insert(stream_id, response);
    }

    pub fn get(&self, stream_id: u64) -> Option<&PartialResponse> {
        self.pending.get(&stream_id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Send as much of a response as fits now and stash the rest.
    ///
    /// Returns true when the response went out completely.
    pub fn respond(
        &mut self,
        quic: &mut crate::Connection,
        h3: &mut Connection,
        stream_id: u64,
        headers: Vec<Header>,
        body: Vec<u8>,
    ) -> Result<bool, Error> {
        self.stash(stream_id, PartialResponse::new(headers, body));
        self.on_writable(quic, h3, stream_id)
    }

    /// Continue a stashed response. Returns true once it is fully written
    /// and forgotten, false while some of it is still pending or when the
    /// stream has nothing stashed.
    ///
    /// A hard error drops the entry and is returned.
    pub fn on_writable(
        &mut self,
        quic: &mut crate::Connection,
        h3: &mut Connection,
        stream_id: u64,
    ) -> Result<bool, Error> {
        let Some(resp) = self.pending.get_mut(&stream_id) else {
            return Ok(false);
        };

        match Self::advance(quic, h3, stream_id, resp) {
            Ok(()) if resp.is_complete() => {
                self.pending.remove(&stream_id);
                Ok(true)
            }
            Ok(()) | Err(Error::StreamBlocked) | Err(Error::Done) => Ok(false),
            Err(e) => {
                self.pending.remove(&stream_id);
                Err(e)
            }
        }
    }

    fn advance(
        quic: &mut crate::Connection,
        h3: &mut Connection,
        stream_id: u64,
        resp: &mut PartialResponse,
    ) -> Result<(), Error> {
        if let Some(headers) = &resp.headers {
            h3.send_response(quic, stream_id, headers, false)?;
            resp.headers = None;
        }

        let rest = &resp.body[resp.written..];
        resp.written += h3.send_body(quic, stream_id, rest, true)?;
        Ok(())
    }
}
