//! ccid resolution
//!
//! The ccid ties a learner's submissions together across requests. It is a
//! continuity key, not a credential.

use rand::Rng;

/// Cookie (and request field) name carrying the identity
pub const CCID_COOKIE: &str = "ccid";

const CONSONANTS: &[u8] = b"bcdfghjklmnprstvwz";
const VOWELS: &[u8] = b"aeiou";
const GROUPS: usize = 4;
const GROUP_LEN: usize = 4;

/// Pick the identity for a request.
///
/// An explicit request value wins, then the stored cookie, then a fresh token.
pub fn resolve(explicit: Option<&str>, stored: Option<&str>) -> String {
    explicit
        .filter(|v| !v.is_empty())
        .or_else(|| stored.filter(|v| !v.is_empty()))
        .map(str::to_string)
        .unwrap_or_else(generate)
}

/// Generate a pronounceable identifier such as `bika-tuno-ramo-lefi`
pub fn generate() -> String {
    let mut rng = rand::rng();
    let mut out = String::with_capacity(GROUPS * (GROUP_LEN + 1));

    for group in 0..GROUPS {
        if group > 0 {
            out.push('-');
        }
        for i in 0..GROUP_LEN {
            let pool = if i % 2 == 0 { CONSONANTS } else { VOWELS };
            out.push(pool[rng.random_range(0..pool.len())] as char);
        }
    }

    out
}
