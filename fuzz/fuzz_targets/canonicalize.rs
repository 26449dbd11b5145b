#![no_main]

use filament_core::canon::{canonicalize, content_hash, stable_stringify};
use libfuzzer_sys::fuzz_target;
use serde_json::Value;

fuzz_target!(|data: &[u8]| {
    let Ok(value) = serde_json::from_slice::<Value>(data) else {
        return;
    };
    let once = canonicalize(&value);
    assert_eq!(canonicalize(&once), once);
    assert_eq!(stable_stringify(&value), stable_stringify(&once));
    assert_eq!(content_hash(&value), content_hash(&once));
});
