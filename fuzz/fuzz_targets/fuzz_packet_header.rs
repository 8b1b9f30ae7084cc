#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    for dcid_len in [0, 8, 16, 20] {
        if let Ok(hdr) = quay::Header::from_slice(data, dcid_len) {
            assert!(hdr.dcid.len() <= quay::MAX_CONN_ID_LEN);
            assert!(hdr.scid.len() <= quay::MAX_CONN_ID_LEN);
        }
    }
});
