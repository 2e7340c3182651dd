#![no_main]
use libfuzzer_sys::fuzz_target;

// Parsing and validation may reject input but must never panic.
fuzz_target!(|data: &str| {
    if let Ok(cfg) = icalibrate_config::load_toml(data) {
        let _ = cfg.validate();
    }
});
