#![no_main]

use bytes::Bytes;
use libfuzzer_sys::fuzz_target;
use mx_ether::core::packet::Frame;

fuzz_target!(|data: &[u8]| {
    // Decoding arbitrary datagrams must never panic; whatever decodes must
    // encode back to the same bytes.
    if let Ok(frame) = Frame::from_bytes(Bytes::copy_from_slice(data)) {
        let again = Frame::from_bytes(frame.to_bytes()).expect("re-decode");
        assert_eq!(again, frame);
    }
});
