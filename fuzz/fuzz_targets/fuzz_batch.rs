#![no_main]

use libfuzzer_sys::fuzz_target;
use tagwire::protocol::batcher::{unravel_batch, Batcher};

fuzz_target!(|data: &[u8]| {
    if let Ok(fragments) = unravel_batch("fuzz", data, 0) {
        let mut batcher = Batcher::new(1, 0);
        for fragment in &fragments {
            let _ = batcher.batch_packet(fragment);
        }
        if let Some(message) = batcher.flush() {
            let again = unravel_batch("fuzz", &message[1..], 0).expect("re-batched message unravels");
            assert_eq!(again, fragments);
        }
    }
});
