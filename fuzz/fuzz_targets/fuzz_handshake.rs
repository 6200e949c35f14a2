#![no_main]

use libfuzzer_sys::fuzz_target;
use tagwire::protocol::handshake::{encode_handshake, parse_handshake};

fuzz_target!(|data: &[u8]| {
    // Anything that parses must survive a re-encode
    if let Ok(handshake) = parse_handshake(data) {
        if let Ok(bytes) = encode_handshake(
            &handshake.client,
            &handshake.server,
            handshake.rate_window_secs,
        ) {
            let again = parse_handshake(&bytes).expect("re-encoded handshake parses");
            assert!(again.client.same_layout(&handshake.client));
            assert!(again.server.same_layout(&handshake.server));
        }
    }
});
