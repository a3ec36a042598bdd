#![no_main]

use libfuzzer_sys::fuzz_target;
use parley_orchestrator::{classify_inbound, normalize_command_text, InboundIntent};

fuzz_target!(|data: &[u8]| {
    let text = String::from_utf8_lossy(data);
    let normalized = normalize_command_text(&text);
    assert_eq!(normalized.trim(), normalized);
    assert!(!normalized.contains("  "));

    let with_session = classify_inbound(&text, true);
    assert!(!matches!(with_session, InboundIntent::OptIn));

    if text.trim().is_empty() {
        assert_eq!(classify_inbound(&text, false), InboundIntent::Empty);
    }
});
