#![no_main]

use libfuzzer_sys::fuzz_target;
use tagwire::core::types::PacketType;

fuzz_target!(|data: &[u8]| {
    let Some((&selector, payload)) = data.split_first() else {
        return;
    };
    let ty = match selector % 8 {
        0 => PacketType::None,
        1 => PacketType::Raw,
        2 => PacketType::Strings,
        3 => PacketType::IntsFixed,
        4 => PacketType::IntsDynamic,
        5 => PacketType::Decimals,
        6 => PacketType::Booleans,
        _ => PacketType::Floats,
    };
    if let Ok(values) = ty.decode(payload, 255) {
        let _ = ty.encode(&values);
    }
});
