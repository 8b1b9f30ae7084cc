#![no_main]

use libfuzzer_sys::fuzz_target;
use quay::h3::qpack::{Decoder, Encoder};

fuzz_target!(|data: &[u8]| {
    let Ok(headers) = Decoder::default().decode(data) else {
        return;
    };

    // anything we can read back must survive our own encoder
    let block = Encoder::new().encode(&headers);
    let again = Decoder::default().decode(&block).unwrap();
    assert_eq!(headers.len(), again.len());
});
