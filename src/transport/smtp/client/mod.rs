//! SMTP client
//!
//! `SmtpConnection` drives one server connection; `NetworkStream` hides the
//! plain/TLS socket behind one type; `ClientCodec` applies SMTP transparency
//! (dot-stuffing) to the DATA payload.

mod connection;
mod net;
mod tls;

pub use self::{
    connection::{SendResult, SmtpConnection},
    net::NetworkStream,
    tls::{Tls, TlsParameters, TlsParametersBuilder},
};

/// The codec used for transparency (dot-stuffing)
///
/// [RFC 5321, section 4.5.2](https://tools.ietf.org/html/rfc5321#section-4.5.2)
///
/// Feeding it the message in arbitrary chunks produces the same output as one
/// single write, so streamed bodies can be encoded as they arrive.
#[derive(Clone, Copy, Debug)]
pub struct ClientCodec {
    escape_count: u8,
}

impl ClientCodec {
    /// Creates a new client codec
    pub fn new() -> Self {
        ClientCodec::default()
    }

    /// Adds transparency, writing the encoded chunk into `buf`
    pub fn encode(&mut self, chunk: &[u8], buf: &mut Vec<u8>) {
        if chunk.is_empty() {
            return;
        }

        let mut start = 0;
        for (idx, byte) in chunk.iter().enumerate() {
            self.escape_count = match (self.escape_count, byte) {
                (0, b'\r') => 1,
                (1, b'\n') => 2,
                (2, b'.') => 3,
                _ => u8::from(*byte == b'\r'),
            };
            if self.escape_count == 3 {
                self.escape_count = 0;
                buf.extend_from_slice(&chunk[start..idx]);
                buf.extend_from_slice(b".");
                start = idx;
            }
        }
        buf.extend_from_slice(&chunk[start..]);
    }
}

impl Default for ClientCodec {
    fn default() -> Self {
        // the start of the message counts as the start of a line
        ClientCodec { escape_count: 2 }
    }
}

/// Returns the string replacing all the CRLF with `<CRLF>`
///
/// Used for debug displays
pub(super) fn escape_crlf(string: &str) -> String {
    string.replace("\r\n", "<CRLF>")
}

/// Renders a command for the logs, masking everything at or after `from`
pub(super) fn mask_secrets(command: &str, from: usize) -> String {
    let line = command.trim_end_matches("\r\n");
    if from >= line.len() {
        return escape_crlf(command);
    }
    let mut masked = line[..from].to_string();
    masked.extend(std::iter::repeat('*').take(line.len() - from));
    escape_crlf(&format!("{masked}\r\n"))
}

#[cfg(test)]
mod tests {
    use super::{escape_crlf, mask_secrets, ClientCodec};

    fn encode_single(message: &[u8]) -> Vec<u8> {
        let mut codec = ClientCodec::new();
        let mut buf = Vec::new();
        codec.encode(message, &mut buf);
        buf
    }

    #[test]
    fn test_codec() {
        assert_eq!(encode_single(b"test\r\n"), b"test\r\n");
        assert_eq!(encode_single(b".test\r\n"), b"..test\r\n");
        assert_eq!(encode_single(b"test\r\n.test\r\n"), b"test\r\n..test\r\n");
        assert_eq!(encode_single(b"test\r\n.\r\ntest"), b"test\r\n..\r\ntest");
        assert_eq!(
            encode_single(b".\t..dot and tab\r\n"),
            b"..\t..dot and tab\r\n"
        );
        // a dot not at the start of a line is left alone
        assert_eq!(encode_single(b"test.\r\n"), b"test.\r\n");
    }

    #[test]
    fn test_codec_across_chunks() {
        let mut codec = ClientCodec::new();
        let mut buf = Vec::new();
        codec.encode(b"test\r", &mut buf);
        codec.encode(b"\n", &mut buf);
        codec.encode(b".test\r\n", &mut buf);
        assert_eq!(buf, b"test\r\n..test\r\n");
    }

    #[test]
    fn test_escape_crlf() {
        assert_eq!(escape_crlf("\r\n"), "<CRLF>");
        assert_eq!(escape_crlf("EHLO my_name\r\n"), "EHLO my_name<CRLF>");
        assert_eq!(
            escape_crlf("EHLO my_name\r\nSIZE 42\r\n"),
            "EHLO my_name<CRLF>SIZE 42<CRLF>"
        );
    }

    #[test]
    fn test_mask_secrets() {
        assert_eq!(
            mask_secrets("AUTH PLAIN AHVzZXIAcGFzcw==\r\n", 11),
            "AUTH PLAIN ****************<CRLF>"
        );
        assert_eq!(mask_secrets("c2VjcmV0\r\n", 0), "********<CRLF>");
        assert_eq!(
            mask_secrets("AUTH LOGIN\r\n", usize::MAX),
            "AUTH LOGIN<CRLF>"
        );
    }
}
