#![no_main]

use libfuzzer_sys::fuzz_target;
use quay::varint::{decode_varint, encode_varint};

fuzz_target!(|data: &[u8]| {
    let Ok((value, consumed)) = decode_varint(data) else {
        return;
    };
    assert!(consumed <= data.len());

    // re-encoding may be shorter than a non-minimal input, never longer
    let mut buf = [0u8; 8];
    let written = encode_varint(value, &mut buf).unwrap();
    assert!(written <= consumed);
    assert_eq!(decode_varint(&buf[..written]).unwrap(), (value, written));
});
