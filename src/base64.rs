//! Base64 utilities wrapping the `base64` crate engine API.

pub(crate) use base64::DecodeError;
use base64::{engine::general_purpose::STANDARD, Engine};

pub(crate) fn encode<T: AsRef<[u8]>>(input: T) -> String {
    STANDARD.encode(input)
}

pub(crate) fn decode<T: AsRef<[u8]>>(input: T) -> Result<Vec<u8>, DecodeError> {
    STANDARD.decode(input)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        assert_eq!(encode(b"missive"), "bWlzc2l2ZQ==");
        assert_eq!(decode("bWlzc2l2ZQ==").unwrap(), b"missive");
        assert!(decode("not base64!").is_err());
    }
}
