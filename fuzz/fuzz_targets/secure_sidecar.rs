#![no_main]

use cros_vdec::decoder::stateless::avc::secure::SecureSidecar;
use cros_vdec::decoder::stateless::avc::secure::SecureSliceAdapter;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(sidecar) = SecureSidecar::parse(data) else {
        return;
    };

    let mut adapter = SecureSliceAdapter::new();
    if let Ok(Some(_)) = adapter.prepare(&sidecar, data.len()) {
        while adapter.next_slice().is_ok() {}
    }
});
