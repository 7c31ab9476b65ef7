/// Polynomial rolling hash (`h = h * 31 + byte`, wrapping) used to detect
/// corruption of segment payloads. Fast and tamper-evident, not tamper-proof.
///
/// Any single changed byte always changes the result: the difference it
/// introduces is the byte delta times an odd power of 31, which can't be a
/// multiple of 2^32.
pub fn rolling_hash(bytes: &[u8]) -> u32 {
    bytes
        .iter()
        .fold(0u32, |h, &b| h.wrapping_mul(31).wrapping_add(u32::from(b)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_values() {
        assert_eq!(rolling_hash(&[]), 0);
        assert_eq!(rolling_hash(b"a"), 97);
        assert_eq!(rolling_hash(b"ab"), 97 * 31 + 98);
    }

    #[test]
    fn test_every_single_byte_flip_detected() {
        let data: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        let original = rolling_hash(&data);
        for i in (0..data.len()).step_by(7) {
            let mut corrupted = data.clone();
            corrupted[i] ^= 0x5a;
            assert_ne!(rolling_hash(&corrupted), original, "flip at {} undetected", i);
        }
    }
}
