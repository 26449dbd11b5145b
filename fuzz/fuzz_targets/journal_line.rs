#![no_main]

use filament_core::model::Commit;
use filament_core::store::FilamentStore;
use libfuzzer_sys::fuzz_target;

// Any line that parses as a commit either appends cleanly into an empty
// store or is rejected with an error. A store that accepted it must verify.
fuzz_target!(|data: &[u8]| {
    let Ok(line) = std::str::from_utf8(data) else {
        return;
    };
    let Ok(commit) = serde_json::from_str::<Commit>(line) else {
        return;
    };
    let mut store = FilamentStore::new();
    if store.append(commit).is_ok() {
        assert!(store.verify().is_ok());
        assert_eq!(store.len(), 1);
    } else {
        assert!(store.is_empty());
    }
});
