#![no_main]

use libfuzzer_sys::fuzz_target;
use quay::h3::frame::Frame;

fuzz_target!(|data: &[u8]| {
    let mut pos = 0;
    while pos < data.len() {
        match Frame::decode(&data[pos..]) {
            Ok((_, 0)) | Err(_) => break,
            Ok((_, n)) => pos += n,
        }
    }
});
