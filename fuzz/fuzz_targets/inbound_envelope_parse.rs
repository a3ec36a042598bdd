#![no_main]

use libfuzzer_sys::fuzz_target;
use parley_connectors::parse_inbound_envelope;
use parley_orchestrator::classify_payload;

fuzz_target!(|data: &[u8]| {
    let raw = String::from_utf8_lossy(data);
    for line in raw.lines() {
        match parse_inbound_envelope(line) {
            Ok(event) => {
                assert!(!event.contact_id.trim().is_empty());
                assert_eq!(event.contact_id, event.contact_id.trim());
                assert!(!event.payload().is_empty());
                let _ = classify_payload(&event.payload(), false);
                let _ = classify_payload(&event.payload(), true);
            }
            Err(error) => {
                assert!(!error.reason_code().is_empty());
                assert!(!error.to_string().is_empty());
            }
        }
    }
});
