//! Packet number truncation and recovery (RFC 9000 §17.1, A.2, A.3).

/// Bytes needed to encode `full_pn` so the receiver can recover it, given
/// the largest packet number the peer acknowledged.
///
/// The encoding covers at least twice the number of unacknowledged packets.
pub fn pn_length(full_pn: u64, largest_acked: Option<u64>) -> usize {
    let num_unacked = match largest_acked {
        Some(la) if full_pn > la => full_pn - la,
        Some(_) => 1,
        None => full_pn + 1,
    };
    if num_unacked < (1 << 7) {
        1
    } else if num_unacked < (1 << 15) {
        2
    } else if num_unacked < (1 << 23) {
        3
    } else {
        4
    }
}

/// The low `len` bytes of `full_pn`, big-endian.
pub fn truncate_pn(full_pn: u64, len: usize) -> [u8; 4] {
    let mut out = [0u8; 4];
    let bytes = full_pn.to_be_bytes();
    out[..len].copy_from_slice(&bytes[8 - len..]);
    out
}

/// Recover a full packet number from its truncated form, given the largest
/// packet number processed so far in the space.
pub fn decode_pn(truncated_pn: u64, pn_len: usize, largest_pn: Option<u64>) -> u64 {
    let pn_nbits = (pn_len as u64) * 8;
    let pn_win = 1u64 << pn_nbits;
    let pn_hwin = pn_win / 2;
    let pn_mask = pn_win - 1;

    let expected_pn = largest_pn.map_or(0, |pn| pn + 1);
    let candidate_pn = (expected_pn & !pn_mask) | truncated_pn;

    if candidate_pn + pn_hwin <= expected_pn && candidate_pn + pn_win < (1u64 << 62) {
        candidate_pn + pn_win
    } else if candidate_pn > expected_pn + pn_hwin && candidate_pn >= pn_win {
        candidate_pn - pn_win
    } else {
        candidate_pn
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn length_grows_with_gap() {
        assert_eq!(pn_length(0, None), 1);
        assert_eq!(pn_length(10, Some(5)), 1);
        assert_eq!(pn_length(256, Some(0)), 2);
        assert_eq!(pn_length(1 << 20, Some(0)), 3);
        assert_eq!(pn_length(1 << 30, None), 4);
        // RFC 9000 A.2 example
        assert_eq!(pn_length(0xac5c02, Some(0xabe8b3)), 2);
    }

    #[test]
    fn truncation_keeps_low_bytes() {
        assert_eq!(truncate_pn(0x0102_0304, 2), [0x03, 0x04, 0, 0]);
        assert_eq!(truncate_pn(0x0102_0304, 4), [0x01, 0x02, 0x03, 0x04]);
    }

    #[test]
    fn rfc_decode_example() {
        // RFC 9000 A.3
        assert_eq!(decode_pn(0x9b32, 2, Some(0xa82f30ea)), 0xa82f9b32);
    }

    #[test]
    fn decode_wraps_forward_and_back() {
        assert_eq!(decode_pn(0x00, 1, Some(0xff)), 0x100);
        assert_eq!(decode_pn(0xff, 1, Some(0x100)), 0xff);
        assert_eq!(decode_pn(5, 1, None), 5);
    }
}
