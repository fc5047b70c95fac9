//! ULID-based subtask IDs.
//!
//! Format: 26-character Crockford base32 string, 48 bits of millisecond
//! timestamp followed by 80 random bits. IDs minted later sort later.

use rand::Rng;

const CROCKFORD: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";

/// Generate a new subtask ID.
pub fn generate() -> String {
    let now_ms = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;
    encode(now_ms, rand::thread_rng().r#gen())
}

fn encode(timestamp_ms: u64, random: u128) -> String {
    let mut out = [b'0'; 26];

    let mut ts = timestamp_ms;
    for slot in out[..10].iter_mut().rev() {
        *slot = CROCKFORD[(ts & 0x1F) as usize];
        ts >>= 5;
    }

    // Only the low 80 bits of randomness are used.
    let mut r = random & ((1u128 << 80) - 1);
    for slot in out[10..].iter_mut().rev() {
        *slot = CROCKFORD[(r & 0x1F) as usize];
        r >>= 5;
    }

    out.iter().map(|&b| b as char).collect()
}
