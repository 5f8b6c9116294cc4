#![no_main]

use arbitrary::Arbitrary;
use hoodlink::{CrcPolicy, FrameReassembler, Reassembly};
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Arbitrary)]
struct Input {
    lenient: bool,
    chunks: Vec<Vec<u8>>,
}

fuzz_target!(|input: Input| {
    let policy = if input.lenient {
        CrcPolicy::Lenient
    } else {
        CrcPolicy::Strict
    };
    let mut reassembler = FrameReassembler::new(policy);

    for chunk in &input.chunks {
        reassembler.push(chunk);
        loop {
            match reassembler.next_frame() {
                Ok(Reassembly::Frame(frame)) => {
                    assert_eq!(frame.len(), 3 + frame.payload_len() + 2);
                    if policy == CrcPolicy::Strict {
                        assert!(frame.has_valid_crc());
                    }
                }
                Ok(Reassembly::Exception(_)) => {}
                Ok(Reassembly::NeedMore(missing)) => {
                    assert!(missing > 0);
                    break;
                }
                Err(_) => return,
            }
        }
    }
});
