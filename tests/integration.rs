//! End-to-end tests of the QUIC transport over the public API, with client
//! and server exchanging datagrams in memory.

mod common;

use std::time::Duration;

use common::{Dir, Pipe, base_builder, client_addr, client_config, emit, server_config, server_scid};
use quay::{
    ConnectionState, Error, Header, MICROS_PER_MILLI, Shutdown, SystemRng, TokenMinter,
    TransportError, Type,
};

const ALPN: &[&[u8]] = &[b"quay-test"];

#[test]
fn handshake_establishes_both_sides() {
    let mut pipe = Pipe::new(ALPN);
    assert_eq!(pipe.client.state(), ConnectionState::Handshaking);

    pipe.handshake();

    assert_eq!(pipe.client.application_proto(), b"quay-test");
    assert_eq!(pipe.server.application_proto(), b"quay-test");
    assert_eq!(pipe.server.server_name(), Some("localhost"));
    assert_eq!(pipe.client.destination_id(), &server_scid());
    assert!(pipe.client.peer_transport_params().is_some());
    assert!(pipe.client.timeout(pipe.now).is_some());
}

#[test]
fn stream_data_both_directions() {
    let mut pipe = Pipe::new(ALPN);
    pipe.handshake();

    assert_eq!(pipe.client.stream_send(0, b"ping", true), Ok(4));
    pipe.advance();

    assert_eq!(pipe.server.readable().collect::<Vec<u64>>(), [0u64]);
    let mut buf = [0u8; 64];
    assert_eq!(pipe.server.stream_recv(0, &mut buf), Ok((4, true)));
    assert_eq!(&buf[..4], b"ping");
    assert!(pipe.server.stream_finished(0));

    assert_eq!(pipe.server.stream_send(0, b"pong", true), Ok(4));
    pipe.advance();
    assert_eq!(pipe.client.stream_recv(0, &mut buf), Ok((4, true)));
    assert_eq!(&buf[..4], b"pong");

    // both halves are done, so the stream is gone
    assert_eq!(pipe.client.stream_recv(0, &mut buf), Err(Error::Done));
}

#[test]
fn close_is_idempotent() {
    let mut pipe = Pipe::new(ALPN);
    pipe.handshake();

    assert_eq!(pipe.client.close(true, 0x42, b"bye"), Ok(()));
    assert_eq!(pipe.client.state(), ConnectionState::Closing);
    let error = pipe.client.local_error().cloned();

    assert_eq!(pipe.client.close(false, 0x1, b"again"), Err(Error::Done));
    assert_eq!(pipe.client.state(), ConnectionState::Closing);
    assert_eq!(pipe.client.local_error().cloned(), error);

    pipe.advance();
    let peer = pipe.server.peer_error().expect("server saw CONNECTION_CLOSE");
    assert!(peer.is_app);
    assert_eq!(peer.error_code, 0x42);
    assert_eq!(peer.reason, b"bye");
    assert!(pipe.server.is_draining());

    // the closing period ends after three PTOs
    pipe.sleep(10_000 * MICROS_PER_MILLI);
    assert!(pipe.client.is_closed());
    assert!(pipe.server.is_closed());
    assert_eq!(pipe.client.close(true, 0, b""), Err(Error::Done));
}

#[test]
fn partial_send_resumes_after_max_stream_data() {
    let server = common::server_config(
        common::base_builder(ALPN).initial_max_stream_data_bidi_remote(1000),
    );
    let client = common::client_config(common::base_builder(ALPN));
    let mut pipe = Pipe::with_configs(client, server);
    pipe.handshake();

    let data: Vec<u8> = (0..2000u32).map(|i| i as u8).collect();
    assert_eq!(pipe.client.stream_send(0, &data, false), Ok(1000));
    assert_eq!(pipe.client.stream_capacity(0), Ok(0));
    assert_eq!(pipe.client.stream_send(0, &data[1000..], false), Ok(0));
    pipe.advance();

    let mut buf = [0u8; 4096];
    assert_eq!(pipe.server.stream_recv(0, &mut buf), Ok((1000, false)));
    assert_eq!(&buf[..1000], &data[..1000]);
    pipe.advance();

    assert_eq!(pipe.client.stream_capacity(0), Ok(1000));
    assert_eq!(pipe.client.stream_send(0, &data[1000..], false), Ok(1000));
    pipe.advance();
    assert_eq!(pipe.server.stream_recv(0, &mut buf), Ok((1000, false)));
    assert_eq!(&buf[..1000], &data[1000..]);
}

#[test]
fn sends_never_exceed_granted_credit() {
    let server = common::server_config(
        common::base_builder(ALPN)
            .initial_max_data(3000)
            .initial_max_stream_data_bidi_remote(1500),
    );
    let client = common::client_config(common::base_builder(ALPN));
    let mut pipe = Pipe::with_configs(client, server);
    pipe.handshake();

    let chunk = [7u8; 700];
    let mut sent = [0usize; 3];
    let mut received = [0usize; 3];
    let mut buf = [0u8; 8192];

    for _ in 0..20 {
        for (i, id) in [0u64, 4, 8].into_iter().enumerate() {
            let before = pipe.client.stream_capacity(id).unwrap_or(usize::MAX);
            let n = pipe.client.stream_send(id, &chunk, false).unwrap();
            assert!(n <= before.min(chunk.len()), "accepted {n} with capacity {before}");
            sent[i] += n;
        }
        pipe.advance();

        for (i, id) in [0u64, 4, 8].into_iter().enumerate() {
            while let Ok((n, _)) = pipe.server.stream_recv(id, &mut buf) {
                received[i] += n;
            }
            // nothing is delivered that was not sent
            assert!(received[i] <= sent[i]);
        }
        pipe.advance();
    }

    assert_eq!(received, sent);
    assert!(sent.iter().all(|&s| s > 1500), "credit was renewed: {sent:?}");
}

#[test]
fn out_of_order_packets_are_reassembled() {
    let mut pipe = Pipe::new(ALPN);
    pipe.handshake();

    let data: Vec<u8> = (0..6000u32).map(|i| (i % 251) as u8).collect();
    assert_eq!(pipe.client.stream_send(4, &data, true), Ok(data.len()));

    let mut dgrams = emit(&mut pipe.client, pipe.now);
    assert!(dgrams.len() >= 4);
    dgrams.reverse();

    let mut buf = [0u8; 8192];
    for (i, d) in dgrams.iter().enumerate() {
        pipe.to_server(d).unwrap();
        if i + 1 < dgrams.len() {
            // the head of the stream is still missing
            assert_eq!(pipe.server.stream_recv(4, &mut buf), Err(Error::Done));
        }
    }

    let mut got = Vec::new();
    loop {
        let (n, fin) = pipe.server.stream_recv(4, &mut buf).unwrap();
        got.extend_from_slice(&buf[..n]);
        if fin {
            break;
        }
    }
    assert_eq!(got, data);
}

#[test]
fn smoothed_rtt_converges_on_samples() {
    let mut pipe = Pipe::new(ALPN);
    pipe.handshake();

    let half = 5 * MICROS_PER_MILLI;
    let mut last = pipe.client.stats().rtt;
    for _ in 0..40 {
        pipe.client.stream_send(0, b"x", false).unwrap();
        for d in emit(&mut pipe.client, pipe.now) {
            pipe.now += half;
            pipe.to_server(&d).unwrap();
        }
        for d in emit(&mut pipe.server, pipe.now) {
            pipe.now += half;
            pipe.to_client(&d).unwrap();
        }

        let rtt = pipe.client.stats().rtt;
        assert!(rtt >= last, "rtt moved away from the samples: {last:?} -> {rtt:?}");
        assert!(rtt <= Duration::from_millis(10));
        last = rtt;
    }
    assert!(last >= Duration::from_millis(9), "rtt {last:?}");
}

#[test]
fn unsupported_version_is_negotiated_away() {
    let client = common::client_config(common::base_builder(ALPN).version(0xdead_beef));
    let server = common::server_config(common::base_builder(ALPN));
    let mut pipe = Pipe::with_configs(client, server);

    let initial = emit(&mut pipe.client, pipe.now).remove(0);
    let hdr = Header::from_slice(&initial, 0).unwrap();
    assert_eq!(hdr.ty, Type::Initial);
    assert_eq!(hdr.version, 0xdead_beef);
    assert!(!quay::version_is_supported(hdr.version));

    let mut out = [0u8; 256];
    let n = quay::negotiate_version(&hdr.scid, &hdr.dcid, &mut out).unwrap();
    let vn = Header::from_slice(&out[..n], 0).unwrap();
    assert_eq!(vn.ty, Type::VersionNegotiation);
    assert!(vn.versions.unwrap().contains(&quay::PROTOCOL_VERSION));

    let _ = pipe.to_client(&out[..n]);

    assert_eq!(pipe.client.state(), ConnectionState::Closed);
    assert!(!pipe.client.is_established());
    assert_eq!(
        pipe.client.local_error().map(|e| e.error_code),
        Some(TransportError::VersionNegotiationError.to_code())
    );
    assert!(emit(&mut pipe.client, pipe.now).is_empty());
}

#[test]
fn stateless_retry_round_trip() {
    let mut pipe = Pipe::new(ALPN);
    let minter = TokenMinter::random(&mut SystemRng);

    let first = emit(&mut pipe.client, pipe.now).remove(0);
    let hdr = Header::from_slice(&first, 0).unwrap();
    assert_eq!(hdr.token.as_deref(), Some(&[][..]));

    let token = minter.mint_token(&hdr, &client_addr(), pipe.now, &mut SystemRng);
    let new_scid = server_scid();
    let mut out = [0u8; 512];
    let n = quay::retry(&hdr.scid, &hdr.dcid, &new_scid, &token, hdr.version, &mut out).unwrap();

    let parsed = Header::from_slice(&out[..n], 0).unwrap();
    assert_eq!(parsed.ty, Type::Retry);
    assert_eq!(parsed.token.as_deref(), Some(&token[..]));
    assert_eq!(parsed.dcid, hdr.scid);
    assert_eq!(parsed.scid, new_scid);

    let _ = pipe.to_client(&out[..n]);

    // the client starts over towards the new ID, echoing the token
    let second = emit(&mut pipe.client, pipe.now).remove(0);
    let hdr2 = Header::from_slice(&second, 0).unwrap();
    assert_eq!(hdr2.dcid, new_scid);
    assert_eq!(hdr2.token.as_deref(), Some(&token[..]));

    let odcid = minter.validate_token(&client_addr(), &token).unwrap();
    assert_eq!(odcid, hdr.dcid);

    let config = common::server_config(common::base_builder(ALPN));
    pipe.server = quay::accept(&new_scid, Some(&odcid), client_addr(), config, pipe.now).unwrap();
    pipe.to_server(&second).unwrap();
    pipe.handshake();
}

#[test]
fn tampered_token_is_rejected() {
    let mut pipe = Pipe::new(ALPN);
    let minter = TokenMinter::new(b"server secret");
    let first = emit(&mut pipe.client, pipe.now).remove(0);
    let hdr = Header::from_slice(&first, 0).unwrap();

    let mut token = minter.mint_token(&hdr, &client_addr(), pipe.now, &mut SystemRng);
    assert!(minter.validate_token(&"10.0.0.1:50000".parse().unwrap(), &token).is_none());
    let last = token.len() - 1;
    token[last] ^= 1;
    assert!(minter.validate_token(&client_addr(), &token).is_none());
}

#[test]
fn reset_and_stop_sending_reach_the_peer() {
    let mut pipe = Pipe::new(ALPN);
    pipe.handshake();

    pipe.client.stream_send(0, b"partial", false).unwrap();
    pipe.advance();
    pipe.client.stream_shutdown(0, Shutdown::Write, 7).unwrap();
    pipe.advance();

    let mut buf = [0u8; 64];
    assert_eq!(pipe.server.stream_recv(0, &mut buf), Err(Error::StreamReset(0, 7)));

    pipe.client.stream_send(4, b"more", false).unwrap();
    pipe.advance();
    pipe.server.stream_shutdown(4, Shutdown::Read, 9).unwrap();
    pipe.advance();
    assert_eq!(pipe.client.stream_send(4, b"x", false), Err(Error::StreamStopped(4, 9)));
}

#[test]
fn idle_timeout_closes_quietly() {
    let mut pipe = Pipe::new(ALPN);
    pipe.handshake();

    pipe.sleep(31_000 * MICROS_PER_MILLI);
    assert!(pipe.client.is_closed());
    assert!(pipe.client.is_timed_out());
    assert!(pipe.client.peer_error().is_none());
}

#[test]
fn peer_stream_limit_is_enforced() {
    let server = common::server_config(common::base_builder(ALPN).initial_max_streams_bidi(2));
    let client = common::client_config(common::base_builder(ALPN));
    let mut pipe = Pipe::with_configs(client, server);
    pipe.handshake();

    assert_eq!(pipe.client.peer_streams_left_bidi(), 2);
    pipe.client.stream_send(0, b"a", true).unwrap();
    pipe.client.stream_send(4, b"b", true).unwrap();
    assert_eq!(pipe.client.stream_send(8, b"c", true), Err(Error::StreamLimit));
}

/// Read everything the server has buffered on `id`.
fn server_read(pipe: &mut Pipe, id: u64) -> (Vec<u8>, bool) {
    let mut got = Vec::new();
    let mut fin = false;
    let mut buf = [0u8; 4096];
    while let Ok((n, f)) = pipe.server.stream_recv(id, &mut buf) {
        got.extend_from_slice(&buf[..n]);
        fin |= f;
        if f {
            break;
        }
    }
    (got, fin)
}

/// Run a full connection so the client picks up a session ticket.
fn prime_ticket(client: &std::sync::Arc<quay::Config>, server: &std::sync::Arc<quay::Config>) {
    let mut first = Pipe::with_configs(client.clone(), server.clone());
    assert!(!first.client.is_in_early_data());
    first.handshake();
    first.advance();
}

#[test]
fn resumed_connection_sends_early_data() {
    let client = client_config(base_builder(ALPN).enable_early_data());
    let server = server_config(base_builder(ALPN).enable_early_data());
    prime_ticket(&client, &server);

    let mut pipe = Pipe::with_configs(client, server);
    assert!(pipe.client.is_in_early_data());
    assert_eq!(pipe.client.stream_send(0, b"early hello", true), Ok(11));

    // only the client's first flight, nothing back yet
    for d in emit(&mut pipe.client, pipe.now) {
        let _ = pipe.to_server(&d);
    }
    assert_eq!(server_read(&mut pipe, 0), (b"early hello".to_vec(), true));

    pipe.handshake();
    assert!(!pipe.client.is_in_early_data());
    assert_eq!(pipe.client.stats().lost, 0);
    assert_eq!(pipe.client.stats().retrans, 0);
}

#[test]
fn rejected_early_data_is_resent_at_once() {
    let client = client_config(base_builder(ALPN).enable_early_data());
    let server = server_config(base_builder(ALPN).enable_early_data());
    prime_ticket(&client, &server);

    // a server that never issued the ticket cannot resume it
    let stranger = server_config(base_builder(ALPN).enable_early_data());
    let mut pipe = Pipe::with_configs(client, stranger);
    assert!(pipe.client.is_in_early_data());
    let payload: Vec<u8> = (0..3000u32).map(|i| (i % 251) as u8).collect();
    assert_eq!(pipe.client.stream_send(0, &payload, true), Ok(payload.len()));

    // no timer may fire: the data has to follow the handshake directly
    pipe.handshake();
    assert_eq!(server_read(&mut pipe, 0), (payload, true));

    let stats = pipe.client.stats();
    assert_eq!(stats.lost, 0);
    assert_eq!(stats.lost_bytes, 0);
}

#[test]
fn early_data_is_not_sent_when_disabled() {
    let client = client_config(base_builder(ALPN));
    let server = server_config(base_builder(ALPN).enable_early_data());
    prime_ticket(&client, &server);

    let mut pipe = Pipe::with_configs(client, server);
    assert!(!pipe.client.is_in_early_data());
    pipe.handshake();
}

#[test]
fn tail_loss_is_repaired_by_pto() {
    let mut pipe = Pipe::new(ALPN);
    pipe.handshake();

    pipe.lose_next(Dir::ToServer, 4);
    assert_eq!(pipe.client.stream_send(0, b"are you there", true), Ok(13));
    pipe.advance();
    assert_eq!(pipe.dropped, 1);
    assert!(pipe.server.readable().next().is_none());

    let start = pipe.now;
    for _ in 0..10 {
        if pipe.server.readable().next().is_some() {
            break;
        }
        pipe.sleep_until_timer();
        pipe.advance();
    }
    assert_eq!(server_read(&mut pipe, 0), (b"are you there".to_vec(), true));
    assert_eq!(pipe.dropped, 4);
    assert!(pipe.now > start);
    assert!(pipe.client.stats().retrans >= 1);
    assert!(!pipe.client.is_closed());
}

#[test]
fn reordering_threshold_declares_loss() {
    let mut pipe = Pipe::new(ALPN);
    pipe.handshake();

    // the first data packet vanishes, the ones after it get through
    pipe.lose_next(Dir::ToServer, 1);
    let payload: Vec<u8> = (0..8000u32).map(|i| (i % 199) as u8).collect();
    assert_eq!(pipe.client.stream_send(0, &payload, true), Ok(payload.len()));
    pipe.advance();

    assert_eq!(pipe.dropped, 1);
    assert_eq!(server_read(&mut pipe, 0), (payload, true));
    let stats = pipe.client.stats();
    assert!(stats.lost >= 1);
    assert!(stats.lost_bytes > 0);
    assert!(stats.retrans >= 1);
}

#[test]
fn lost_server_flight_is_recovered() {
    let mut pipe = Pipe::new(ALPN);
    pipe.lose_when(|dir, _| dir == Dir::ToClient);
    pipe.advance();
    assert!(pipe.dropped >= 1);
    assert!(!pipe.client.is_established());

    pipe.stop_losing();
    for _ in 0..10 {
        if pipe.client.is_established() && pipe.server.is_established() {
            break;
        }
        pipe.sleep_until_timer();
        pipe.advance();
    }
    assert!(pipe.client.is_established());
    assert!(pipe.server.is_established());
    assert!(pipe.client.stats().retrans + pipe.server.stats().retrans >= 1);
}

#[test]
fn close_is_repeated_when_the_peer_keeps_talking() {
    let mut pipe = Pipe::new(ALPN);
    pipe.handshake();

    pipe.client.close(true, 0x7, b"done").unwrap();
    pipe.lose_next(Dir::ToServer, 1);
    pipe.advance();
    assert_eq!(pipe.dropped, 1);
    assert!(pipe.server.peer_error().is_none());
    let deadline = pipe.client.timeout(pipe.now);

    // the server never heard the close and carries on
    assert_eq!(pipe.server.stream_send(1, b"still here", false), Ok(10));
    pipe.advance();

    let peer = pipe.server.peer_error().expect("close was repeated");
    assert!(peer.is_app);
    assert_eq!(peer.error_code, 0x7);
    assert!(pipe.server.is_draining());
    // repeating the close does not stretch the closing period
    assert_eq!(pipe.client.timeout(pipe.now), deadline);
}

#[test]
fn close_repeats_back_off() {
    let mut pipe = Pipe::new(ALPN);
    pipe.handshake();

    pipe.client.close(false, 0x0, b"").unwrap();
    assert_eq!(emit(&mut pipe.client, pipe.now).len(), 1);

    let mut answered = Vec::new();
    for _ in 0..8 {
        pipe.server.stream_send(1, b"x", false).unwrap();
        let out = emit(&mut pipe.server, pipe.now);
        assert_eq!(out.len(), 1);
        pipe.to_client(&out[0]).unwrap();
        answered.push(emit(&mut pipe.client, pipe.now).len());
    }
    assert_eq!(answered, [1, 1, 0, 1, 0, 0, 0, 1]);
    assert_eq!(pipe.client.state(), ConnectionState::Closing);
}
