//! Fuzz target for frame masking
//!
//! Masking is its own inverse, and masking in two pieces with the right
//! offset equals masking in one.

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use sockudo_wstest::mask::{apply_mask, apply_mask_offset};

#[derive(Arbitrary, Debug)]
struct MaskInput {
    data: Vec<u8>,
    mask: [u8; 4],
    split: u16,
}

fuzz_target!(|input: MaskInput| {
    let mut data = input.data.clone();
    apply_mask(&mut data, input.mask);
    apply_mask(&mut data, input.mask);
    assert_eq!(data, input.data, "masking is not self-inverse");

    let mut whole = input.data.clone();
    apply_mask(&mut whole, input.mask);

    let split = if input.data.is_empty() { 0 } else { input.split as usize % input.data.len() };
    let mut pieces = input.data.clone();
    let (head, tail) = pieces.split_at_mut(split);
    apply_mask_offset(head, input.mask, 0);
    apply_mask_offset(tail, input.mask, split % 4);
    assert_eq!(whole, pieces, "offset masking disagrees with one-shot masking");
});
