//! Transport machinery shared by connections: loss recovery, congestion
//! control, stream state and flow control.

pub mod buffer;
pub mod congestion;
pub mod flow_control;
pub mod hystart;
pub mod ranges;
pub mod recovery;
pub mod stream;

use rand::RngCore;

/// Timestamp in microseconds from an arbitrary epoch.
///
/// The engine never reads a clock itself; callers pass the current time into
/// every time-dependent operation.
pub type Instant = u64;

pub const MICROS_PER_MILLI: u64 = 1_000;

/// Random bytes for connection IDs, tokens and nonces.
pub trait Rng {
    /// Fill `buf` with random bytes.
    fn fill(&mut self, buf: &mut [u8]);
}

/// [`Rng`] backed by the thread-local CSPRNG of the `rand` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRng;

impl Rng for SystemRng {
    fn fill(&mut self, buf: &mut [u8]) {
        rand::rng().fill_bytes(buf);
    }
}
