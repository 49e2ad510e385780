#![no_main]
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let _ = banana_jelly::Decoder::new(Default::default()).feed(data);
});
