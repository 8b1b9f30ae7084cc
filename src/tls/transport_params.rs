//! QUIC transport parameters (RFC 9000 section 18).
//!
//! Encoded as a sequence of (id: varint, length: varint, value: bytes)
//! where integer values are varint-encoded.

use crate::cid::ConnectionId;
use crate::error::{Error, TransportError};
use crate::varint::{push_varint, varint_len};
use crate::wire::Reader;

/// QUIC transport parameters exchanged during the TLS handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportParams {
    /// DCID of the client's first Initial (server only).
    pub original_destination_connection_id: Option<ConnectionId>,
    /// Maximum idle timeout in milliseconds (0 = disabled).
    pub max_idle_timeout: u64,
    /// Server only.
    pub stateless_reset_token: Option<[u8; 16]>,
    pub max_udp_payload_size: u64,
    /// Maximum total data the peer may send (flow control).
    pub initial_max_data: u64,
    /// Initial max data on locally-initiated bidi streams.
    pub initial_max_stream_data_bidi_local: u64,
    /// Initial max data on remotely-initiated bidi streams.
    pub initial_max_stream_data_bidi_remote: u64,
    /// Initial max data on unidirectional streams.
    pub initial_max_stream_data_uni: u64,
    /// Maximum number of bidi streams the peer may open.
    pub initial_max_streams_bidi: u64,
    /// Maximum number of uni streams the peer may open.
    pub initial_max_streams_uni: u64,
    pub ack_delay_exponent: u64,
    /// Maximum ACK delay in milliseconds.
    pub max_ack_delay: u64,
    pub disable_active_migration: bool,
    pub active_connection_id_limit: u64,
    pub initial_source_connection_id: Option<ConnectionId>,
    /// SCID of the Retry the server sent (server only).
    pub retry_source_connection_id: Option<ConnectionId>,
}

// Parameter IDs
/// Largest ack_delay_exponent a peer may announce.
pub const MAX_ACK_DELAY_EXPONENT: u64 = 20;
/// max_ack_delay must stay below this many milliseconds.
pub const MAX_ACK_DELAY_LIMIT: u64 = 1 << 14;

const PARAM_ORIGINAL_DCID: u64 = 0x00;
const PARAM_MAX_IDLE_TIMEOUT: u64 = 0x01;
const PARAM_STATELESS_RESET_TOKEN: u64 = 0x02;
const PARAM_MAX_UDP_PAYLOAD_SIZE: u64 = 0x03;
const PARAM_INITIAL_MAX_DATA: u64 = 0x04;
const PARAM_INITIAL_MAX_STREAM_DATA_BIDI_LOCAL: u64 = 0x05;
const PARAM_INITIAL_MAX_STREAM_DATA_BIDI_REMOTE: u64 = 0x06;
const PARAM_INITIAL_MAX_STREAM_DATA_UNI: u64 = 0x07;
const PARAM_INITIAL_MAX_STREAMS_BIDI: u64 = 0x08;
const PARAM_INITIAL_MAX_STREAMS_UNI: u64 = 0x09;
const PARAM_ACK_DELAY_EXPONENT: u64 = 0x0a;
const PARAM_MAX_ACK_DELAY: u64 = 0x0b;
const PARAM_DISABLE_ACTIVE_MIGRATION: u64 = 0x0c;
const PARAM_ACTIVE_CONNECTION_ID_LIMIT: u64 = 0x0e;
const PARAM_INITIAL_SCID: u64 = 0x0f;
const PARAM_RETRY_SCID: u64 = 0x10;

impl Default for TransportParams {
    /// The values RFC 9000 assumes for absent parameters.
    fn default() -> Self {
        Self {
            original_destination_connection_id: None,
            max_idle_timeout: 0,
            stateless_reset_token: None,
            max_udp_payload_size: 65527,
            initial_max_data: 0,
            initial_max_stream_data_bidi_local: 0,
            initial_max_stream_data_bidi_remote: 0,
            initial_max_stream_data_uni: 0,
            initial_max_streams_bidi: 0,
            initial_max_streams_uni: 0,
            ack_delay_exponent: 3,
            max_ack_delay: 25,
            disable_active_migration: false,
            active_connection_id_limit: 2,
            initial_source_connection_id: None,
            retry_source_connection_id: None,
        }
    }
}

fn param_error() -> Error {
    Error::Transport(TransportError::TransportParameterError)
}

fn put_int(out: &mut Vec<u8>, id: u64, value: u64) {
    push_varint(id, out);
    push_varint(varint_len(value) as u64, out);
    push_varint(value, out);
}

fn put_bytes(out: &mut Vec<u8>, id: u64, value: &[u8]) {
    push_varint(id, out);
    push_varint(value.len() as u64, out);
    out.extend_from_slice(value);
}

impl TransportParams {
    /// Encode for the TLS extension. Integer parameters equal to their
    /// default are still written so the peer never has to guess.
    pub fn encode(&self, is_server: bool) -> Vec<u8> {
        let mut out = Vec::with_capacity(128);

        if is_server {
            if let Some(odcid) = &self.original_destination_connection_id {
                put_bytes(&mut out, PARAM_ORIGINAL_DCID, odcid);
            }
            if let Some(token) = &self.stateless_reset_token {
                put_bytes(&mut out, PARAM_STATELESS_RESET_TOKEN, token);
            }
            if let Some(rscid) = &self.retry_source_connection_id {
                put_bytes(&mut out, PARAM_RETRY_SCID, rscid);
            }
        }

        put_int(&mut out, PARAM_MAX_IDLE_TIMEOUT, self.max_idle_timeout);
        put_int(&mut out, PARAM_MAX_UDP_PAYLOAD_SIZE, self.max_udp_payload_size);
        put_int(&mut out, PARAM_INITIAL_MAX_DATA, self.initial_max_data);
        put_int(
            &mut out,
            PARAM_INITIAL_MAX_STREAM_DATA_BIDI_LOCAL,
            self.initial_max_stream_data_bidi_local,
        );
        put_int(
            &mut out,
            PARAM_INITIAL_MAX_STREAM_DATA_BIDI_REMOTE,
            self.initial_max_stream_data_bidi_remote,
        );
        put_int(&mut out, PARAM_INITIAL_MAX_STREAM_DATA_UNI, self.initial_max_stream_data_uni);
        put_int(&mut out, PARAM_INITIAL_MAX_STREAMS_BIDI, self.initial_max_streams_bidi);
        put_int(&mut out, PARAM_INITIAL_MAX_STREAMS_UNI, self.initial_max_streams_uni);
        put_int(&mut out, PARAM_ACK_DELAY_EXPONENT, self.ack_delay_exponent);
        put_int(&mut out, PARAM_MAX_ACK_DELAY, self.max_ack_delay);
        if self.disable_active_migration {
            put_bytes(&mut out, PARAM_DISABLE_ACTIVE_MIGRATION, &[]);
        }
        put_int(&mut out, PARAM_ACTIVE_CONNECTION_ID_LIMIT, self.active_connection_id_limit);
        if let Some(scid) = &self.initial_source_connection_id {
            put_bytes(&mut out, PARAM_INITIAL_SCID, scid);
        }

        out
    }

    /// Decode parameters sent by the peer. `from_server` says which side
    /// produced them; server-only parameters from a client are an error.
    pub fn decode(buf: &[u8], from_server: bool) -> Result<Self, Error> {
        let mut params = Self::default();
        let mut seen = 0u32;
        let mut r = Reader::new(buf);

        while !r.is_empty() {
            let id = r.get_varint().map_err(|_| param_error())?;
            let value = r.get_bytes_with_varint_length().map_err(|_| param_error())?;

            if id <= 0x10 {
                let bit = 1u32 << id;
                if seen & bit != 0 {
                    return Err(param_error());
                }
                seen |= bit;
            }

            let int = || -> Result<u64, Error> {
                let mut vr = Reader::new(value);
                let v = vr.get_varint().map_err(|_| param_error())?;
                if !vr.is_empty() {
                    return Err(param_error());
                }
                Ok(v)
            };
            let cid = || ConnectionId::from_slice(value).map_err(|_| param_error());

            match id {
                PARAM_ORIGINAL_DCID if from_server => {
                    params.original_destination_connection_id = Some(cid()?)
                }
                PARAM_STATELESS_RESET_TOKEN if from_server => {
                    let token = value.try_into().map_err(|_| param_error())?;
                    params.stateless_reset_token = Some(token);
                }
                PARAM_RETRY_SCID if from_server => {
                    params.retry_source_connection_id = Some(cid()?)
                }
                PARAM_ORIGINAL_DCID | PARAM_STATELESS_RESET_TOKEN | PARAM_RETRY_SCID => {
                    return Err(param_error());
                }
                PARAM_MAX_IDLE_TIMEOUT => params.max_idle_timeout = int()?,
                PARAM_MAX_UDP_PAYLOAD_SIZE => {
                    params.max_udp_payload_size = int()?;
                    if params.max_udp_payload_size < 1200 {
                        return Err(param_error());
                    }
                }
                PARAM_INITIAL_MAX_DATA => params.initial_max_data = int()?,
                PARAM_INITIAL_MAX_STREAM_DATA_BIDI_LOCAL => {
                    params.initial_max_stream_data_bidi_local = int()?
                }
                PARAM_INITIAL_MAX_STREAM_DATA_BIDI_REMOTE => {
                    params.initial_max_stream_data_bidi_remote = int()?
                }
                PARAM_INITIAL_MAX_STREAM_DATA_UNI => params.initial_max_stream_data_uni = int()?,
                PARAM_INITIAL_MAX_STREAMS_BIDI => {
                    params.initial_max_streams_bidi = int()?;
                    if params.initial_max_streams_bidi > 1 << 60 {
                        return Err(param_error());
                    }
                }
                PARAM_INITIAL_MAX_STREAMS_UNI => {
                    params.initial_max_streams_uni = int()?;
                    if params.initial_max_streams_uni > 1 << 60 {
                        return Err(param_error());
                    }
                }
                PARAM_ACK_DELAY_EXPONENT => {
                    params.ack_delay_exponent = int()?;
                    if params.ack_delay_exponent > MAX_ACK_DELAY_EXPONENT {
                        return Err(param_error());
                    }
                }
                PARAM_MAX_ACK_DELAY => {
                    params.max_ack_delay = int()?;
                    if params.max_ack_delay >= MAX_ACK_DELAY_LIMIT {
                        return Err(param_error());
                    }
                }
                PARAM_DISABLE_ACTIVE_MIGRATION => {
                    if !value.is_empty() {
                        return Err(param_error());
                    }
                    params.disable_active_migration = true;
                }
                PARAM_ACTIVE_CONNECTION_ID_LIMIT => {
                    params.active_connection_id_limit = int()?;
                    if params.active_connection_id_limit < 2 {
                        return Err(param_error());
                    }
                }
                PARAM_INITIAL_SCID => params.initial_source_connection_id = Some(cid()?),
                // Unknown and reserved parameters are ignored.
                _ => {}
            }
        }

        Ok(params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::varint::encode_varint;

    fn cid(b: &[u8]) -> Option<ConnectionId> {
        Some(ConnectionId::from_slice(b).unwrap())
    }

    fn sample() -> TransportParams {
        TransportParams {
            original_destination_connection_id: cid(&[1; 8]),
            max_idle_timeout: 30_000,
            stateless_reset_token: Some([0x5a; 16]),
            max_udp_payload_size: 1350,
            initial_max_data: 10_000_000,
            initial_max_stream_data_bidi_local: 1_000_000,
            initial_max_stream_data_bidi_remote: 1_000_000,
            initial_max_stream_data_uni: 1_000_000,
            initial_max_streams_bidi: 100,
            initial_max_streams_uni: 3,
            ack_delay_exponent: 3,
            max_ack_delay: 25,
            disable_active_migration: true,
            active_connection_id_limit: 2,
            initial_source_connection_id: cid(&[2; 20]),
            retry_source_connection_id: cid(&[3; 4]),
        }
    }

    #[test]
    fn server_params_roundtrip() {
        let params = sample();
        let decoded = TransportParams::decode(&params.encode(true), true).unwrap();
        assert_eq!(decoded, params);
    }

    #[test]
    fn client_omits_server_only_params() {
        let params = sample();
        let decoded = TransportParams::decode(&params.encode(false), false).unwrap();
        assert_eq!(decoded.original_destination_connection_id, None);
        assert_eq!(decoded.stateless_reset_token, None);
        assert_eq!(decoded.retry_source_connection_id, None);
        assert_eq!(decoded.initial_max_streams_bidi, 100);
        assert_eq!(decoded.initial_source_connection_id, cid(&[2; 20]));
    }

    #[test]
    fn server_only_param_from_client_rejected() {
        let encoded = sample().encode(true);
        assert_eq!(
            TransportParams::decode(&encoded, false),
            Err(Error::Transport(TransportError::TransportParameterError))
        );
    }

    #[test]
    fn unknown_params_ignored() {
        let mut buf = [0u8; 64];
        let mut off = 0;
        // max_idle_timeout = 1000
        off += encode_varint(0x01, &mut buf[off..]).unwrap();
        off += encode_varint(2, &mut buf[off..]).unwrap();
        off += encode_varint(1000, &mut buf[off..]).unwrap();
        // reserved id 31 * 7 + 27
        off += encode_varint(244, &mut buf[off..]).unwrap();
        off += encode_varint(1, &mut buf[off..]).unwrap();
        buf[off] = 0x42;
        off += 1;

        let params = TransportParams::decode(&buf[..off], false).unwrap();
        assert_eq!(params.max_idle_timeout, 1000);
        assert_eq!(params.ack_delay_exponent, 3);
    }

    #[test]
    fn invalid_values_rejected() {
        let mut out = Vec::new();
        put_int(&mut out, PARAM_ACK_DELAY_EXPONENT, 21);
        assert!(TransportParams::decode(&out, true).is_err());

        let mut out = Vec::new();
        put_int(&mut out, PARAM_MAX_UDP_PAYLOAD_SIZE, 1199);
        assert!(TransportParams::decode(&out, true).is_err());

        let mut out = Vec::new();
        put_int(&mut out, PARAM_MAX_IDLE_TIMEOUT, 5);
        put_int(&mut out, PARAM_MAX_IDLE_TIMEOUT, 6);
        assert!(TransportParams::decode(&out, true).is_err());

        // truncated value
        assert!(TransportParams::decode(&[0x01, 0x04, 0x00], true).is_err());
    }
}
