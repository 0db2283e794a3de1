//! Short, stable identifiers derived from arbitrary strings.

use sha2::{
    Digest,
    Sha224,
};

/// Length of the codes embedded in cluster specific load balancer names.
pub const SHORT_CODE_LENGTH: usize = 6;
/// Length of owner ids derived from a resource UID.
pub const OWNER_ID_LENGTH: usize = 8;

const BASE36_DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// SHA-224 of `input`, rendered as a lower-case base-36 number and truncated to `len` characters.
pub fn base36_hash(input: &str, len: usize) -> String {
    let digest = Sha224::digest(input.as_bytes());
    let mut encoded = to_base36(&digest);
    encoded.truncate(len);
    encoded
}

/// 6-character code used for cluster ids and resource keys.
pub fn short_code(input: &str) -> String {
    base36_hash(input, SHORT_CODE_LENGTH)
}

/// Big-endian bytes to base-36, most significant digit first, no leading zeros.
fn to_base36(bytes: &[u8]) -> String {
    let mut number: Vec<u8> = bytes.iter().copied().skip_while(|byte| *byte == 0).collect();
    let mut digits = Vec::new();

    while !number.is_empty() {
        let mut quotient = Vec::with_capacity(number.len());
        let mut remainder: u32 = 0;
        for byte in &number {
            let accumulator = (remainder << 8) | u32::from(*byte);
            let q = (accumulator / 36) as u8;
            remainder = accumulator % 36;
            if !(quotient.is_empty() && q == 0) {
                quotient.push(q);
            }
        }
        digits.push(BASE36_DIGITS[remainder as usize]);
        number = quotient;
    }

    if digits.is_empty() {
        return "0".to_string();
    }
    digits.iter().rev().map(|digit| *digit as char).collect()
}
