//! Bearer token generation and constant-time comparison.
//!
//! Every Execution gets a fresh 256-bit token from the OS CSPRNG. The bridge
//! compares presented tokens against the session token without leaking
//! length, prefix, or timing information.

use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Generate a fresh 256-bit bearer token, hex-encoded (64 chars).
pub fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    let mut s = String::with_capacity(64);
    for b in bytes {
        s.push_str(&format!("{:02x}", b));
    }
    s
}

/// Compare a presented token against the expected token in constant time.
///
/// Both inputs are hashed to a fixed width first so that tokens of different
/// lengths take the same time to reject.
pub fn token_matches(presented: &str, expected: &str) -> bool {
    let presented = Sha256::digest(presented.as_bytes());
    let expected = Sha256::digest(expected.as_bytes());
    presented.as_slice().ct_eq(expected.as_slice()).into()
}

/// Compare two byte slices of equal length in constant time.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}
