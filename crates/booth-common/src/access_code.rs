//! Access code rules shared by the gateway and the client.
//!
//! A code is exactly six characters from `A-Z0-9`. Callers normalize user
//! input with [`normalize`] before checking it, and a code that fails
//! [`is_valid_format`] must be rejected without touching the network.

use rand::Rng;

use crate::error::{Error, Result};

pub const CODE_LEN: usize = 6;
pub const CODE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Codes that skip the issue/redeem lifecycle and always map to the demo agent.
pub const DEFAULT_DEMO_CODES: [&str; 3] = ["DEMO01", "TEST01", "BANK01"];

/// Trim surrounding whitespace and uppercase, as the join form does.
pub fn normalize(raw: &str) -> String {
    raw.trim().to_ascii_uppercase()
}

pub fn is_valid_format(code: &str) -> bool {
    code.len() == CODE_LEN
        && code
            .bytes()
            .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit())
}

/// Normalize `raw` and return it if it is a well-formed code.
pub fn parse(raw: &str) -> Result<String> {
    let code = normalize(raw);
    if code.len() != CODE_LEN {
        return Err(Error::validation(
            "access code must be exactly 6 characters",
        ));
    }
    if !is_valid_format(&code) {
        return Err(Error::validation(
            "access code must contain only letters and numbers",
        ));
    }
    Ok(code)
}

pub fn generate<R: Rng + ?Sized>(rng: &mut R) -> String {
    (0..CODE_LEN)
        .map(|_| CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn test_valid_codes() {
        assert!(is_valid_format("DEMO01"));
        assert!(is_valid_format("A1B2C3"));
        assert!(is_valid_format("000000"));
    }

    #[test]
    fn test_rejects_wrong_length() {
        assert!(!is_valid_format(""));
        assert!(!is_valid_format("ABC12"));
        assert!(!is_valid_format("ABC1234"));
    }

    #[test]
    fn test_rejects_lowercase_and_symbols() {
        assert!(!is_valid_format("demo01"));
        assert!(!is_valid_format("DEMO-1"));
        assert!(!is_valid_format("DEMO 1"));
        assert!(!is_valid_format("DÉMO01"));
    }

    #[test]
    fn test_parse_normalizes_input() {
        assert_eq!(parse("  demo01 ").unwrap(), "DEMO01");
        assert!(matches!(parse("dem01"), Err(Error::Validation(_))));
        assert!(matches!(parse("DEM_01"), Err(Error::Validation(_))));
    }

    #[test]
    fn test_generated_codes_are_valid() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..500 {
            let code = generate(&mut rng);
            assert!(is_valid_format(&code), "bad code {code}");
        }
    }
}
