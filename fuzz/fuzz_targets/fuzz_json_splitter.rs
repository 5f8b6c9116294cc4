#![no_main]

use hoodlink::wire::{InboundMessage, JsonStreamSplitter};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let mut splitter = JsonStreamSplitter::new();
    for chunk in data.chunks(7) {
        splitter.push(chunk);
        // Each error drops at least one byte, so this terminates
        loop {
            match splitter.next_value() {
                Ok(Some(value)) => {
                    let _ = InboundMessage::from_value(value);
                }
                Ok(None) => break,
                Err(_) => continue,
            }
        }
    }
});
