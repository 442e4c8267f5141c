//! Identifier generation and the pairwise initiator rule.

use rand::Rng;

/// ASCII-ordered alphabet so that ids compare in creation order.
const PUSH_ALPHABET: &[u8] = b"-0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ_abcdefghijklmnopqrstuvwxyz";
const BASE36: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

pub const PUSH_ID_LEN: usize = 20;
const PUSH_TIME_CHARS: usize = 8;

pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Push-style key: 8 chars of the millisecond clock followed by 12 random chars.
///
/// Keys created in different milliseconds sort by creation time.
pub fn push_id<R: Rng + ?Sized>(now_ms: i64, rng: &mut R) -> String {
    let mut out = [0u8; PUSH_ID_LEN];
    let mut ts = now_ms.max(0) as u64;
    for slot in out[..PUSH_TIME_CHARS].iter_mut().rev() {
        *slot = PUSH_ALPHABET[(ts % 64) as usize];
        ts /= 64;
    }
    for slot in out[PUSH_TIME_CHARS..].iter_mut() {
        *slot = PUSH_ALPHABET[rng.gen_range(0..PUSH_ALPHABET.len())];
    }
    out.iter().map(|b| *b as char).collect()
}

fn to_base36(mut value: u64) -> String {
    if value == 0 {
        return "0".to_string();
    }
    let mut digits = Vec::new();
    while value > 0 {
        digits.push(BASE36[(value % 36) as usize]);
        value /= 36;
    }
    digits.iter().rev().map(|b| *b as char).collect()
}

/// Human-facing session id, e.g. `VS-lz3k1q2a-8fj2k`.
pub fn session_id<R: Rng + ?Sized>(now_ms: i64, rng: &mut R) -> String {
    let suffix: String = (0..5)
        .map(|_| BASE36[rng.gen_range(0..BASE36.len())] as char)
        .collect();
    format!("VS-{}-{}", to_base36(now_ms.max(0) as u64), suffix)
}

/// Whether `self_id` sends the offer to `other_id`.
///
/// The participant with the lexicographically greater id initiates. The rule
/// is evaluated per pair, so each pair in a full mesh has exactly one
/// initiator and identical ids never initiate.
pub fn is_initiator(self_id: &str, other_id: &str) -> bool {
    self_id > other_id
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn test_larger_id_initiates() {
        assert!(is_initiator("B2", "A1"));
        assert!(!is_initiator("A1", "B2"));
        assert!(!is_initiator("A1", "A1"));
    }

    #[test]
    fn test_exactly_one_initiator_per_pair() {
        let ids = ["-Nx1", "-Nx2", "Q7", "a", "Z", "zz"];
        for a in ids {
            for b in ids {
                if a == b {
                    continue;
                }
                assert!(is_initiator(a, b) ^ is_initiator(b, a), "{a} vs {b}");
            }
        }
    }

    #[test]
    fn test_push_ids_sort_by_time() {
        let mut rng = StdRng::seed_from_u64(1);
        let earlier = push_id(1_700_000_000_000, &mut rng);
        let later = push_id(1_700_000_000_001, &mut rng);
        assert_eq!(earlier.len(), PUSH_ID_LEN);
        assert!(earlier < later);
        assert!(later
            .bytes()
            .all(|b| PUSH_ALPHABET.contains(&b)));
    }

    #[test]
    fn test_session_id_shape() {
        let mut rng = StdRng::seed_from_u64(3);
        let id = session_id(36 * 36, &mut rng);
        assert!(id.starts_with("VS-100-"));
        assert_eq!(id.len(), "VS-100-".len() + 5);
    }

    #[test]
    fn test_base36() {
        assert_eq!(to_base36(0), "0");
        assert_eq!(to_base36(35), "z");
        assert_eq!(to_base36(36), "10");
    }
}
