//! RFC 6376 section 3.4 canonicalization

use std::fmt::{self, Display, Formatter};

use once_cell::sync::Lazy;
use regex::Regex;

/// Canonicalization algorithm applied to headers or body before signing
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Canonicalization {
    /// Byte-for-byte, tolerating almost no change in transit
    Simple,
    /// Tolerates common whitespace and folding changes
    #[default]
    Relaxed,
}

impl Display for Canonicalization {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Canonicalization::Simple => f.write_str("simple"),
            Canonicalization::Relaxed => f.write_str("relaxed"),
        }
    }
}

static RE_HEADER_WSP: Lazy<Regex> = Lazy::new(|| Regex::new(r"[\r\n\t ]+").unwrap());

/// Canonicalizes one header field into its signed form, without a trailing
/// CRLF
///
/// Simple keeps the field as transmitted (`Name: Value`); relaxed lowercases
/// the name, unfolds the value and collapses its whitespace (`name:value`).
pub(crate) fn canonicalize_header(
    name: &str,
    value: &str,
    canonicalization: Canonicalization,
) -> String {
    match canonicalization {
        Canonicalization::Simple => format!("{name}: {value}"),
        Canonicalization::Relaxed => {
            let value = RE_HEADER_WSP.replace_all(value, " ");
            format!("{}:{}", name.trim().to_lowercase(), value.trim())
        }
    }
}

/// Canonicalizes a whole body held in memory
///
/// Convenience over [`BodyCanonicalizer`] for tests.
#[cfg(test)]
pub(crate) fn canonicalize_body(body: &[u8], canonicalization: Canonicalization) -> Vec<u8> {
    let mut canonicalizer = BodyCanonicalizer::new(canonicalization);
    let mut out = Vec::with_capacity(body.len() + 2);
    canonicalizer.update(body, &mut out);
    canonicalizer.finish(&mut out);
    out
}

/// Streaming body canonicalizer
///
/// Feed it the body bytes in any chunking; it appends the canonical form to
/// the output buffer as content becomes definite. Trailing empty lines and
/// (for relaxed) trailing whitespace stay buffered as counters until a later
/// byte proves them interior, so memory use is constant in the body size.
pub(crate) struct BodyCanonicalizer {
    canonicalization: Canonicalization,
    /// CRLFs seen but not yet known to be interior
    pending_newlines: usize,
    /// WSP run on the current line not yet known to be interior (relaxed)
    pending_wsp: bool,
    /// A CR waiting for its LF
    pending_cr: bool,
    wrote_anything: bool,
}

impl BodyCanonicalizer {
    pub(crate) fn new(canonicalization: Canonicalization) -> Self {
        Self {
            canonicalization,
            pending_newlines: 0,
            pending_wsp: false,
            pending_cr: false,
            wrote_anything: false,
        }
    }

    pub(crate) fn update(&mut self, chunk: &[u8], out: &mut Vec<u8>) {
        for &byte in chunk {
            if self.pending_cr {
                self.pending_cr = false;
                if byte == b'\n' {
                    // line break: a relaxed WSP run before it was trailing
                    self.pending_wsp = false;
                    self.pending_newlines += 1;
                    continue;
                }
                // a bare CR is ordinary content
                self.flush_content(out);
                out.push(b'\r');
            }

            match byte {
                b'\r' => self.pending_cr = true,
                b' ' | b'\t' if self.canonicalization == Canonicalization::Relaxed => {
                    self.pending_wsp = true;
                }
                _ => {
                    self.flush_content(out);
                    out.push(byte);
                }
            }
        }
    }

    /// Settles held-back whitespace before a content byte
    fn flush_content(&mut self, out: &mut Vec<u8>) {
        for _ in 0..self.pending_newlines {
            out.extend_from_slice(b"\r\n");
        }
        self.pending_newlines = 0;
        if self.pending_wsp {
            out.push(b' ');
            self.pending_wsp = false;
        }
        self.wrote_anything = true;
    }

    /// Ends the body: trailing empty lines collapse into the single final
    /// CRLF, and an empty body becomes a lone CRLF
    pub(crate) fn finish(mut self, out: &mut Vec<u8>) {
        if self.pending_cr {
            self.flush_content(out);
            out.push(b'\r');
        }
        out.extend_from_slice(b"\r\n");
    }
}
