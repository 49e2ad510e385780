#![no_main]
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let mut broker = banana_jelly::Broker::new(Default::default());
    let _ = broker.data_received(data);
    let _ = broker.take_output();
});
