#![no_main]

use libfuzzer_sys::fuzz_target;
use ssh_jump_server::forwarding::ForwardRequest;

fuzz_target!(|data: &[u8]| {
    // anything that decodes must encode back to the same bytes
    if let Ok(request) = ForwardRequest::decode(data) {
        assert_eq!(request.encode(), data);
        let _ = request.destination();
    }
});
