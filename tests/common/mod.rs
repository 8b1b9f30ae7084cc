//! In-memory harness: a client and a server `Connection` joined by a pipe
//! that moves datagrams between them, with a clock that only moves when a
//! test says so.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use quay::{Config, ConfigBuilder, Connection, ConnectionId, Error, Instant, MICROS_PER_MILLI};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};

pub const MAX_DATAGRAM: usize = 1350;

pub fn client_addr() -> SocketAddr {
    "127.0.0.1:50000".parse().unwrap()
}

pub fn server_addr() -> SocketAddr {
    "127.0.0.1:4433".parse().unwrap()
}

/// Route engine logs to the test output; `RUST_LOG=quay=trace` to see them.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Fresh self-signed identity for `localhost`.
pub fn identity() -> (CertificateDer<'static>, PrivateKeyDer<'static>) {
    let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let cert = certified.cert.der().clone();
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der()));
    (cert, key)
}

/// Transport limits shared by both ends unless a test overrides them.
pub fn base_builder(alpn: &[&[u8]]) -> ConfigBuilder {
    ConfigBuilder::new(alpn)
        .unwrap()
        .max_idle_timeout(30_000)
        .initial_max_data(10_000_000)
        .initial_max_stream_data_bidi_local(1_000_000)
        .initial_max_stream_data_bidi_remote(1_000_000)
        .initial_max_stream_data_uni(1_000_000)
        .initial_max_streams_bidi(100)
        .initial_max_streams_uni(100)
}

pub fn client_config(builder: ConfigBuilder) -> Arc<Config> {
    Arc::new(builder.verify_peer(false).build().unwrap())
}

pub fn server_config(builder: ConfigBuilder) -> Arc<Config> {
    let (cert, key) = identity();
    Arc::new(builder.with_cert_chain_der(vec![cert], key).build().unwrap())
}

pub fn server_scid() -> ConnectionId {
    ConnectionId::from_slice(&[0x5e; 16]).unwrap()
}

pub fn client_scid() -> ConnectionId {
    ConnectionId::from_slice(&[0xc1; 16]).unwrap()
}

/// Drain every datagram `conn` wants to send right now.
pub fn emit(conn: &mut Connection, now: Instant) -> Vec<Vec<u8>> {
    let mut out = Vec::new();
    loop {
        let mut buf = [0u8; MAX_DATAGRAM];
        match conn.send(&mut buf, now) {
            Ok((n, _)) => out.push(buf[..n].to_vec()),
            Err(Error::Done) => return out,
            Err(e) => panic!("send failed: {e:?}"),
        }
    }
}

/// Which way a datagram is travelling through the pipe.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dir {
    ToServer,
    ToClient,
}

/// Decides whether a datagram is lost on the way.
pub type LossFn = Box<dyn FnMut(Dir, &[u8]) -> bool>;

pub struct Pipe {
    pub client: Connection,
    pub server: Connection,
    pub now: Instant,
    loss: Option<LossFn>,
    /// Datagrams thrown away by the loss hook so far.
    pub dropped: usize,
}

impl Pipe {
    pub fn new(alpn: &[&[u8]]) -> Pipe {
        Pipe::with_configs(client_config(base_builder(alpn)), server_config(base_builder(alpn)))
    }

    pub fn with_configs(client: Arc<Config>, server: Arc<Config>) -> Pipe {
        init_logging();
        quay::init().unwrap();
        let now = 1_000 * MICROS_PER_MILLI;
        Pipe {
            client: quay::connect("localhost", &client_scid(), server_addr(), client, now).unwrap(),
            server: quay::accept(&server_scid(), None, client_addr(), server, now).unwrap(),
            now,
            loss: None,
            dropped: 0,
        }
    }

    /// Lose every datagram for which `f` returns true.
    pub fn lose_when(&mut self, f: impl FnMut(Dir, &[u8]) -> bool + 'static) {
        self.loss = Some(Box::new(f));
    }

    /// Lose the next `n` datagrams going in `dir`, then deliver the rest.
    pub fn lose_next(&mut self, dir: Dir, n: usize) {
        let mut left = n;
        self.lose_when(move |d, _| {
            if d == dir && left > 0 {
                left -= 1;
                return true;
            }
            false
        });
    }

    pub fn stop_losing(&mut self) {
        self.loss = None;
    }

    fn lost(&mut self, dir: Dir, dgram: &[u8]) -> bool {
        let lost = self.loss.as_mut().is_some_and(|f| f(dir, dgram));
        if lost {
            self.dropped += 1;
        }
        lost
    }

    pub fn to_server(&mut self, dgram: &[u8]) -> Result<usize, Error> {
        let mut buf = dgram.to_vec();
        self.server.recv(&mut buf, client_addr(), self.now)
    }

    pub fn to_client(&mut self, dgram: &[u8]) -> Result<usize, Error> {
        let mut buf = dgram.to_vec();
        self.client.recv(&mut buf, server_addr(), self.now)
    }

    /// Move datagrams both ways until neither side has anything to send.
    pub fn advance(&mut self) {
        for _ in 0..100 {
            let to_server = emit(&mut self.client, self.now);
            for d in &to_server {
                if !self.lost(Dir::ToServer, d) {
                    let _ = self.to_server(d);
                }
            }
            let to_client = emit(&mut self.server, self.now);
            for d in &to_client {
                if !self.lost(Dir::ToClient, d) {
                    let _ = self.to_client(d);
                }
            }
            if to_server.is_empty() && to_client.is_empty() {
                return;
            }
        }
        panic!("pipe did not settle");
    }

    /// Complete the handshake, including HANDSHAKE_DONE.
    pub fn handshake(&mut self) {
        self.advance();
        assert!(self.client.is_established(), "client: {:?}", self.client.state());
        assert!(self.server.is_established(), "server: {:?}", self.server.state());
    }

    /// Jump to the earliest pending timer of either side and fire it.
    pub fn sleep_until_timer(&mut self) {
        let next = [self.client.timeout(self.now), self.server.timeout(self.now)]
            .into_iter()
            .flatten()
            .min()
            .expect("a timer is armed");
        self.sleep(next.as_micros() as u64);
    }

    /// Move the clock forward and fire whatever timers expired.
    pub fn sleep(&mut self, micros: u64) {
        self.now += micros;
        if self.client.timeout(self.now).is_some_and(|d| d.is_zero()) {
            self.client.on_timeout(self.now);
        }
        if self.server.timeout(self.now).is_some_and(|d| d.is_zero()) {
            self.server.on_timeout(self.now);
        }
    }
}
