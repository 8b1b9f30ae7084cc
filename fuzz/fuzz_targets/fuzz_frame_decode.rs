#![no_main]

use libfuzzer_sys::fuzz_target;
use quay::wire::Reader;

fuzz_target!(|data: &[u8]| {
    let mut r = Reader::new(data);
    while !r.is_empty() {
        let before = r.off();
        if quay::frame::decode(&mut r).is_err() || r.off() == before {
            break;
        }
    }
});
