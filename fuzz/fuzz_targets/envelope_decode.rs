#![no_main]

use libfuzzer_sys::fuzz_target;

use tabmesh_wire::{should_process, RuntimeMessage};

fuzz_target!(|data: &[u8]| {
    if let Ok(message) = RuntimeMessage::decode(data) {
        let _ = should_process(&message, "fuzz", message.timestamp);
        // A decoded envelope always encodes again
        let encoded = message.encode().unwrap();
        let _ = RuntimeMessage::decode(&encoded).unwrap();
    }
});
