//! Fuzz target for UTF-8 validation
//!
//! One-shot and incremental validation must agree with `std::str::from_utf8`
//! however the input is split.

#![no_main]

use libfuzzer_sys::fuzz_target;
use sockudo_wstest::utf8::{validate_utf8, Utf8Validator};

fuzz_target!(|data: &[u8]| {
    let std_result = std::str::from_utf8(data).is_ok();
    assert_eq!(validate_utf8(data), std_result, "one-shot validation mismatch");

    let mut validator = Utf8Validator::new();
    let mut valid = true;
    let mut ends_on_codepoint = true;
    for chunk in data.chunks(3) {
        let status = validator.validate(chunk);
        valid = status.valid;
        ends_on_codepoint = status.ends_on_codepoint;
        if !valid {
            break;
        }
    }
    assert_eq!(valid && ends_on_codepoint, std_result, "incremental validation mismatch");
});
