#![no_main]
use icalibrate_config::hcd;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &str| {
    // Whatever parses must render and parse back to the same chamber layout.
    if let Ok(file) = hcd::parse(data) {
        let again = hcd::parse(&hcd::render(&file)).expect("rendered HCD parses");
        assert_eq!(again.chambers.len(), file.chambers.len());
    }
});
