//! Base64 payload encoding
//!
//! The controller carries raw USB buffers as base64 strings. Encoding uses the
//! standard padded alphabet on a single line. Decoding also accepts input that
//! was wrapped across lines.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

/// Encode a raw buffer for a JSON string field
pub fn encode_payload(data: &[u8]) -> String {
    STANDARD.encode(data)
}

/// Decode a JSON string field back into a raw buffer
///
/// ASCII whitespace anywhere in the input is ignored.
pub fn decode_payload(encoded: &str) -> crate::Result<Vec<u8>> {
    if encoded.bytes().any(|b| b.is_ascii_whitespace()) {
        let compact: String = encoded
            .chars()
            .filter(|c| !c.is_ascii_whitespace())
            .collect();
        Ok(STANDARD.decode(compact)?)
    } else {
        Ok(STANDARD.decode(encoded)?)
    }
}
