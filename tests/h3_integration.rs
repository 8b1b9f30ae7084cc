//! HTTP/3 request/response flows over an in-memory QUIC pipe.

#![cfg(feature = "h3")]

mod common;

use common::Pipe;
use quay::h3::{self, Event, Header, PartialResponses};
use quay::{Error, H3Error};

struct H3Pipe {
    pipe: Pipe,
    client: h3::Connection,
    server: h3::Connection,
}

impl H3Pipe {
    fn new() -> H3Pipe {
        Self::with_pipe(Pipe::new(&h3::H3_ALPN), &h3::Config::new(), &h3::Config::new())
    }

    fn with_pipe(mut pipe: Pipe, client: &h3::Config, server: &h3::Config) -> H3Pipe {
        pipe.handshake();
        assert_eq!(pipe.client.application_proto(), b"h3");

        let client = h3::Connection::with_transport(&mut pipe.client, client).unwrap();
        let server = h3::Connection::with_transport(&mut pipe.server, server).unwrap();
        let mut p = H3Pipe { pipe, client, server };

        // exchange and process SETTINGS
        p.pipe.advance();
        assert_eq!(p.poll_client(), Err(Error::Done));
        assert_eq!(p.poll_server(), Err(Error::Done));
        p
    }

    fn poll_client(&mut self) -> Result<(u64, Event), Error> {
        self.client.poll(&mut self.pipe.client)
    }

    fn poll_server(&mut self) -> Result<(u64, Event), Error> {
        self.server.poll(&mut self.pipe.server)
    }

    /// Read everything buffered for `stream_id` on the client.
    fn client_body(&mut self, stream_id: u64, body: &mut Vec<u8>) {
        let mut buf = [0u8; 512];
        while let Ok(n) = self.client.recv_body(&mut self.pipe.client, stream_id, &mut buf) {
            body.extend_from_slice(&buf[..n]);
        }
    }
}

fn get_request() -> Vec<Header> {
    vec![
        Header::new(b":method", b"GET"),
        Header::new(b":scheme", b"https"),
        Header::new(b":authority", b"localhost"),
        Header::new(b":path", b"/"),
        Header::new(b"user-agent", b"quay-test"),
    ]
}

fn ok_response(len: usize) -> Vec<Header> {
    vec![
        Header::new(b":status", b"200"),
        Header::new(b"content-length", len.to_string().as_bytes()),
    ]
}

#[test]
fn settings_are_exchanged() {
    let p = H3Pipe::new();
    assert!(p.client.peer_settings_raw().is_some());
    assert!(p.server.peer_settings_raw().is_some());
}

#[test]
fn get_request_and_response() {
    let mut p = H3Pipe::new();

    let id = p.client.send_request(&mut p.pipe.client, &get_request(), true).unwrap();
    assert_eq!(id, 0);
    p.pipe.advance();

    let (sid, ev) = p.poll_server().unwrap();
    assert_eq!(sid, id);
    let Event::Headers { list, has_body } = ev else {
        panic!("expected headers, got {ev:?}");
    };
    assert!(!has_body);
    assert_eq!(list, get_request());
    assert_eq!(p.poll_server(), Ok((id, Event::Finished)));
    assert_eq!(p.poll_server(), Err(Error::Done));

    let body = b"Hello world";
    p.server.send_response(&mut p.pipe.server, id, &ok_response(body.len()), false).unwrap();
    assert_eq!(p.server.send_body(&mut p.pipe.server, id, body, true), Ok(body.len()));
    p.pipe.advance();

    let (sid, ev) = p.poll_client().unwrap();
    assert_eq!(sid, id);
    assert_eq!(ev, Event::Headers { list: ok_response(body.len()), has_body: true });
    assert_eq!(p.poll_client(), Ok((id, Event::Data)));

    let mut got = Vec::new();
    p.client_body(id, &mut got);
    assert_eq!(got, b"Hello world");

    assert_eq!(p.poll_client(), Ok((id, Event::Finished)));
    assert_eq!(p.poll_client(), Err(Error::Done));
}

#[test]
fn request_body_is_delivered() {
    let mut p = H3Pipe::new();

    let post = vec![
        Header::new(b":method", b"POST"),
        Header::new(b":scheme", b"https"),
        Header::new(b":authority", b"localhost"),
        Header::new(b":path", b"/upload"),
    ];
    let id = p.client.send_request(&mut p.pipe.client, &post, false).unwrap();
    let payload: Vec<u8> = (0..10_000u32).map(|i| i as u8).collect();
    let mut sent = 0;
    while sent < payload.len() {
        sent += p.client.send_body(&mut p.pipe.client, id, &payload[sent..], true).unwrap();
    }
    p.pipe.advance();

    let mut events = Vec::new();
    let mut got = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        match p.poll_server() {
            Ok((_, Event::Data)) => {
                while let Ok(n) = p.server.recv_body(&mut p.pipe.server, id, &mut buf) {
                    got.extend_from_slice(&buf[..n]);
                }
                events.push(Event::Data);
            }
            Ok((_, ev)) => events.push(ev),
            Err(Error::Done) => break,
            Err(e) => panic!("poll failed: {e:?}"),
        }
    }

    assert!(matches!(events.first(), Some(Event::Headers { has_body: true, .. })));
    assert_eq!(events.last(), Some(&Event::Finished));
    assert_eq!(got, payload);
}

#[test]
fn fin_arriving_after_headers_means_no_body() {
    let mut p = H3Pipe::new();

    let id = p.client.send_request(&mut p.pipe.client, &get_request(), false).unwrap();
    p.pipe.advance();
    // the fields alone cannot say whether a body follows
    assert_eq!(p.poll_server(), Err(Error::Done));

    p.pipe.client.stream_send(id, b"", true).unwrap();
    p.pipe.advance();
    assert_eq!(
        p.poll_server(),
        Ok((id, Event::Headers { list: get_request(), has_body: false }))
    );
    assert_eq!(p.poll_server(), Ok((id, Event::Finished)));
    assert_eq!(p.poll_server(), Err(Error::Done));
}

#[test]
fn body_arriving_after_headers_is_announced() {
    let mut p = H3Pipe::new();

    let id = p.client.send_request(&mut p.pipe.client, &get_request(), false).unwrap();
    p.pipe.advance();
    assert_eq!(p.poll_server(), Err(Error::Done));

    assert_eq!(p.client.send_body(&mut p.pipe.client, id, b"late", true), Ok(4));
    p.pipe.advance();
    assert_eq!(
        p.poll_server(),
        Ok((id, Event::Headers { list: get_request(), has_body: true }))
    );
    assert_eq!(p.poll_server(), Ok((id, Event::Data)));
    let mut buf = [0u8; 16];
    assert_eq!(p.server.recv_body(&mut p.pipe.server, id, &mut buf), Ok(4));
    assert_eq!(&buf[..4], b"late");
    assert_eq!(p.poll_server(), Ok((id, Event::Finished)));
}

#[test]
fn blocked_response_resumes_when_writable() {
    let client = common::client_config(
        common::base_builder(&h3::H3_ALPN).initial_max_stream_data_bidi_local(256),
    );
    let server = common::server_config(common::base_builder(&h3::H3_ALPN));
    let pipe = Pipe::with_configs(client, server);
    let mut p = H3Pipe::with_pipe(pipe, &h3::Config::new(), &h3::Config::new());

    let id = p.client.send_request(&mut p.pipe.client, &get_request(), true).unwrap();
    p.pipe.advance();
    assert!(matches!(p.poll_server(), Ok((0, Event::Headers { .. }))));

    let body: Vec<u8> = (0..3000u32).map(|i| (i % 97) as u8).collect();
    let mut pending = PartialResponses::new();
    let done = pending
        .respond(&mut p.pipe.server, &mut p.server, id, ok_response(body.len()), body.clone())
        .unwrap();
    assert!(!done);
    assert_eq!(pending.len(), 1);
    assert!(pending.get(id).is_some_and(|r| r.headers.is_none() && r.written < body.len()));

    let mut got = Vec::new();
    let mut finished = false;
    for _ in 0..100 {
        p.pipe.advance();
        loop {
            match p.poll_client() {
                Ok((_, Event::Data)) => p.client_body(id, &mut got),
                Ok((_, Event::Finished)) => finished = true,
                Ok(_) => {}
                Err(_) => break,
            }
        }
        p.pipe.advance();
        if pending.on_writable(&mut p.pipe.server, &mut p.server, id).unwrap() {
            assert!(pending.is_empty());
        }
        if finished {
            break;
        }
    }

    assert!(finished);
    assert!(pending.is_empty());
    assert_eq!(got, body);
}

#[test]
fn body_without_headers_is_rejected() {
    let mut p = H3Pipe::new();
    p.client.send_request(&mut p.pipe.client, &get_request(), true).unwrap();
    p.pipe.advance();

    assert_eq!(
        p.server.send_body(&mut p.pipe.server, 0, b"early", true),
        Err(Error::Http3(H3Error::FrameUnexpected))
    );
}

#[test]
fn oversized_field_section_is_refused_locally() {
    let mut small = h3::Config::new();
    small.set_max_field_section_size(128);
    let mut p = H3Pipe::with_pipe(Pipe::new(&h3::H3_ALPN), &small, &h3::Config::new());

    let id = p.client.send_request(&mut p.pipe.client, &get_request(), true).unwrap();
    p.pipe.advance();
    assert!(matches!(p.poll_server(), Ok((_, Event::Headers { .. }))));

    let mut headers = ok_response(0);
    headers.push(Header::new(b"x-padding", &[b'a'; 200]));
    assert_eq!(
        p.server.send_response(&mut p.pipe.server, id, &headers, true),
        Err(Error::Http3(H3Error::ExcessiveLoad))
    );
    p.server.send_response(&mut p.pipe.server, id, &ok_response(0), true).unwrap();
}

#[test]
fn goaway_stops_new_requests() {
    let mut p = H3Pipe::new();

    p.client.send_request(&mut p.pipe.client, &get_request(), true).unwrap();
    p.pipe.advance();
    p.server.send_goaway(&mut p.pipe.server, 4).unwrap();
    p.pipe.advance();

    let mut saw_goaway = false;
    while let Ok((id, ev)) = p.poll_client() {
        if ev == Event::GoAway {
            assert_eq!(id, 4);
            saw_goaway = true;
        }
    }
    assert!(saw_goaway);

    assert_eq!(
        p.client.send_request(&mut p.pipe.client, &get_request(), true),
        Err(Error::Http3(H3Error::RequestRejected))
    );
    // a later GOAWAY may not raise the ID
    assert_eq!(
        p.server.send_goaway(&mut p.pipe.server, 8),
        Err(Error::Http3(H3Error::IdError))
    );
}

/// Drive the server until its HTTP/3 layer reports a connection error, and
/// check that the QUIC connection closes with the matching code.
fn expect_server_error(p: &mut H3Pipe, want: H3Error) {
    p.pipe.advance();
    let mut result = p.poll_server();
    while result.is_ok() {
        result = p.poll_server();
    }
    assert_eq!(result, Err(Error::Http3(want)));

    let err = p.pipe.server.local_error().expect("connection closed");
    assert!(err.is_app);
    assert_eq!(err.error_code, want.to_code());

    p.pipe.advance();
    assert_eq!(p.pipe.client.peer_error().map(|e| e.error_code), Some(want.to_code()));
}

#[test]
fn second_control_stream_is_a_connection_error() {
    let mut p = H3Pipe::new();
    // type 0x00 (control) followed by an empty SETTINGS frame
    p.pipe.client.stream_send(14, &[0x00, 0x04, 0x00], false).unwrap();
    expect_server_error(&mut p, H3Error::StreamCreationError);
}

#[test]
fn closing_the_control_stream_is_a_connection_error() {
    let mut p = H3Pipe::new();
    p.pipe.client.stream_send(2, b"", true).unwrap();
    expect_server_error(&mut p, H3Error::ClosedCriticalStream);
}

#[test]
fn data_before_headers_is_a_connection_error() {
    let mut p = H3Pipe::new();
    p.pipe.client.stream_send(0, &[0x00, 0x01, 0xff], true).unwrap();
    expect_server_error(&mut p, H3Error::FrameUnexpected);
}

#[test]
fn control_stream_must_start_with_settings() {
    let mut pipe = Pipe::new(&h3::H3_ALPN);
    pipe.handshake();
    let mut server = h3::Connection::with_transport(&mut pipe.server, &h3::Config::new()).unwrap();

    // control stream type, then GOAWAY(0) where SETTINGS belongs
    pipe.client.stream_send(2, &[0x00, 0x07, 0x01, 0x00], false).unwrap();
    pipe.advance();

    let mut result = server.poll(&mut pipe.server);
    while result.is_ok() {
        result = server.poll(&mut pipe.server);
    }
    assert_eq!(result, Err(Error::Http3(H3Error::MissingSettings)));
    assert_eq!(
        pipe.server.local_error().map(|e| e.error_code),
        Some(H3Error::MissingSettings.to_code())
    );
}

#[test]
fn unknown_uni_stream_types_are_ignored() {
    let mut p = H3Pipe::new();
    // a reserved stream type: 0x1f * 1 + 0x21
    p.pipe.client.stream_send(14, &[0x40, 0x40, 1, 2, 3], false).unwrap();
    p.pipe.advance();
    assert_eq!(p.poll_server(), Err(Error::Done));
    assert!(!p.pipe.server.is_draining());
    assert!(p.pipe.server.local_error().is_none());
}

#[test]
fn early_start_is_refused() {
    let mut pipe = Pipe::new(&h3::H3_ALPN);
    assert_eq!(
        h3::Connection::with_transport(&mut pipe.client, &h3::Config::new()).unwrap_err(),
        Error::InvalidState
    );
}
