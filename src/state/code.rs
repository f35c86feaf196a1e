//! Session code generation and validation
//!
//! Generated codes avoid look-alike characters. Codes supplied by a
//! presenter are normalized and checked against the same length rule.

use crate::error::SessionError;
use crate::types::SessionCode;
use rand::Rng;

/// Safe character set for generated codes (excludes 0/O, 1/I/L to avoid confusion)
const CODE_CHARS: &[u8] = b"ABCDEFGHJKMNPQRSTUVWXYZ23456789";
pub const CODE_LENGTH: usize = 6;

/// Generate a random short session code
pub fn generate_code() -> SessionCode {
    let mut rng = rand::rng();
    let code: String = (0..CODE_LENGTH)
        .map(|_| CODE_CHARS[rng.random_range(0..CODE_CHARS.len())] as char)
        .collect();
    SessionCode::normalize(&code)
}

/// Validate a code supplied by a presenter resuming a session
///
/// Supplied codes may use any ASCII letter or digit; only generated codes are
/// restricted to the unambiguous alphabet.
pub fn parse_requested_code(raw: &str) -> Result<SessionCode, SessionError> {
    let code = SessionCode::normalize(raw);
    let valid = code.as_str().len() == CODE_LENGTH
        && code.as_str().chars().all(|c| c.is_ascii_alphanumeric());

    if valid {
        Ok(code)
    } else {
        Err(SessionError::InvalidSessionCode(format!(
            "expected {} letters or digits",
            CODE_LENGTH
        )))
    }
}
