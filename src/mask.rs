//! WebSocket frame masking utilities
//!
//! Masking is XOR with a rotating 4-byte key. The harness needs the offset
//! variant because chopped and repeated payloads are masked piecewise.
//! Uses `fastrand` for fast PRNG mask generation.

/// Apply a WebSocket mask to the payload, starting at key position 0
#[inline]
pub fn apply_mask(data: &mut [u8], mask: [u8; 4]) {
    apply_mask_offset(data, mask, 0);
}

/// Apply a WebSocket mask starting at key position `offset % 4`
///
/// Processes 8 bytes at a time once the key is rotated to the offset.
pub fn apply_mask_offset(data: &mut [u8], mask: [u8; 4], offset: usize) {
    if data.is_empty() {
        return;
    }

    let start = offset & 3;
    let rotated = [
        mask[start],
        mask[(start + 1) & 3],
        mask[(start + 2) & 3],
        mask[(start + 3) & 3],
    ];
    let mask_u64 = u64::from_ne_bytes([
        rotated[0], rotated[1], rotated[2], rotated[3], rotated[0], rotated[1], rotated[2],
        rotated[3],
    ]);

    let mut chunks = data.chunks_exact_mut(8);
    for chunk in &mut chunks {
        let mut word = [0u8; 8];
        word.copy_from_slice(chunk);
        let masked = u64::from_ne_bytes(word) ^ mask_u64;
        chunk.copy_from_slice(&masked.to_ne_bytes());
    }

    // 8 is a multiple of 4, so the remainder starts at key position 0 again
    for (i, byte) in chunks.into_remainder().iter_mut().enumerate() {
        *byte ^= rotated[i & 3];
    }
}

/// Generate a random mask for WebSocket client frames
///
/// Uses fastrand which is a fast, non-cryptographic PRNG.
#[inline]
pub fn generate_mask() -> [u8; 4] {
    fastrand::u32(..).to_ne_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mask_reference(data: &mut [u8], mask: [u8; 4], offset: usize) {
        for (i, b) in data.iter_mut().enumerate() {
            *b ^= mask[(i + offset) & 3];
        }
    }

    #[test]
    fn test_apply_mask_basic() {
        let mask = [0x37, 0xfa, 0x21, 0x3d];
        let original = b"Hello, WebSocket!".to_vec();
        let mut data = original.clone();

        apply_mask(&mut data, mask);
        assert_ne!(data, original);

        apply_mask(&mut data, mask);
        assert_eq!(data, original);
    }

    #[test]
    fn test_apply_mask_rfc_example() {
        // RFC 6455 section 5.7: masked "Hello"
        let mut data = b"Hello".to_vec();
        apply_mask(&mut data, [0x37, 0xfa, 0x21, 0x3d]);
        assert_eq!(data, [0x7f, 0x9f, 0x4d, 0x51, 0x58]);
    }

    #[test]
    fn test_apply_mask_matches_reference() {
        let mask = [0x01, 0x02, 0x03, 0x04];
        for len in 0..=40 {
            for offset in 0..4 {
                let original: Vec<u8> = (0..len).map(|i| (i * 7) as u8).collect();
                let mut fast = original.clone();
                let mut slow = original.clone();
                apply_mask_offset(&mut fast, mask, offset);
                mask_reference(&mut slow, mask, offset);
                assert_eq!(fast, slow, "len {} offset {}", len, offset);
            }
        }
    }

    #[test]
    fn test_piecewise_masking_equals_whole() {
        let mask = [0xde, 0xad, 0xbe, 0xef];
        let original: Vec<u8> = (0..100u8).collect();

        let mut whole = original.clone();
        apply_mask(&mut whole, mask);

        let mut pieces = original.clone();
        let (a, b) = pieces.split_at_mut(13);
        apply_mask_offset(a, mask, 0);
        apply_mask_offset(b, mask, 13);

        assert_eq!(whole, pieces);
    }
}
