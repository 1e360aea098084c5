//! Payload encoding.
//!
//! The sender publishes the JSON encoding of a string; the consumer only
//! needs the payload to be UTF-8 text and prints it as-is.

use crate::error::DecodeError;

/// Encode a message as the UTF-8 bytes of a JSON string.
pub fn encode(message: &str) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(message)
}

/// View a payload as UTF-8 text without interpreting it.
pub fn decode_text(payload: &[u8]) -> Result<&str, DecodeError> {
    Ok(std::str::from_utf8(payload)?)
}

/// Inverse of [`encode`].
pub fn decode_json(payload: &[u8]) -> Result<String, DecodeError> {
    let text = decode_text(payload)?;
    Ok(serde_json::from_str(text)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_is_json_string() {
        assert_eq!(encode("order-123").unwrap(), b"\"order-123\"".to_vec());
        assert_eq!(encode("").unwrap(), b"\"\"".to_vec());
    }

    #[test]
    fn test_encode_escapes() {
        let bytes = encode("say \"hi\"\n").unwrap();
        assert_eq!(decode_text(&bytes).unwrap(), r#""say \"hi\"\n""#);
    }

    #[test]
    fn test_round_trip() {
        for message in ["order-123", "", "çay ☕ 注文", "{\"id\":7}", "tab\tand\\slash"] {
            let bytes = encode(message).unwrap();
            assert_eq!(decode_json(&bytes).unwrap(), message);
        }
    }

    #[test]
    fn test_decode_text_accepts_any_utf8() {
        assert_eq!(decode_text(b"not json at all").unwrap(), "not json at all");
    }

    #[test]
    fn test_decode_invalid_utf8() {
        let err = decode_text(&[0x66, 0xff, 0xfe]).unwrap_err();
        assert!(matches!(err, DecodeError::InvalidUtf8(_)));
    }

    #[test]
    fn test_decode_json_rejects_non_string() {
        let err = decode_json(b"42").unwrap_err();
        assert!(matches!(err, DecodeError::InvalidJson(_)));
    }
}
