//! Provides SASL authentication mechanisms

use std::fmt::{self, Display, Formatter, Write};

use hmac::{Hmac, Mac};
use md5::{Digest, Md5};
use rand::{distributions::Alphanumeric, Rng};

use crate::transport::smtp::error::{self, Error};

/// Accepted authentication mechanisms on an encrypted connection
///
/// Trying LOGIN last as it is deprecated.
pub const DEFAULT_ENCRYPTED_MECHANISMS: &[Mechanism] = &[Mechanism::Plain, Mechanism::Login];

/// Accepted authentication mechanisms on an unencrypted connection
///
/// Only challenge-response mechanisms, so the secret never crosses the wire
/// in the clear.
pub const DEFAULT_UNENCRYPTED_MECHANISMS: &[Mechanism] =
    &[Mechanism::DigestMd5, Mechanism::CramMd5];

/// Contains user credentials
#[derive(PartialEq, Eq, Clone, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Credentials {
    authentication_identity: String,
    secret: String,
}

impl Credentials {
    /// Create a `Credentials` struct from username and password
    pub fn new(username: String, password: String) -> Credentials {
        Credentials {
            authentication_identity: username,
            secret: password,
        }
    }
}

impl<S: Into<String>, T: Into<String>> From<(S, T)> for Credentials {
    fn from((username, password): (S, T)) -> Self {
        Credentials::new(username.into(), password.into())
    }
}

/// Represents authentication mechanisms
#[derive(PartialEq, Eq, Copy, Clone, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[non_exhaustive]
pub enum Mechanism {
    /// PLAIN authentication mechanism
    ///
    /// RFC 4616: <https://tools.ietf.org/html/rfc4616>
    Plain,
    /// LOGIN authentication mechanism
    ///
    /// Obsolete but needed for some providers (like office365)
    /// <https://www.ietf.org/archive/id/draft-murchison-sasl-login-00.txt>
    Login,
    /// CRAM-MD5 authentication mechanism
    ///
    /// RFC 2195: <https://tools.ietf.org/html/rfc2195>
    CramMd5,
    /// DIGEST-MD5 authentication mechanism
    ///
    /// RFC 2831: <https://tools.ietf.org/html/rfc2831>
    DigestMd5,
    /// Non-standard XOAUTH2 mechanism
    ///
    /// <https://developers.google.com/gmail/imap/xoauth2-protocol>
    Xoauth2,
}

impl Display for Mechanism {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match *self {
            Mechanism::Plain => "PLAIN",
            Mechanism::Login => "LOGIN",
            Mechanism::CramMd5 => "CRAM-MD5",
            Mechanism::DigestMd5 => "DIGEST-MD5",
            Mechanism::Xoauth2 => "XOAUTH2",
        })
    }
}

impl Mechanism {
    /// Does the mechanism support an initial response
    pub fn supports_initial_response(self) -> bool {
        match self {
            Mechanism::Plain | Mechanism::Xoauth2 => true,
            Mechanism::Login | Mechanism::CramMd5 | Mechanism::DigestMd5 => false,
        }
    }

    /// Returns the string to send to the server, using the provided username,
    /// password and decoded challenge in some cases
    pub fn response(
        self,
        credentials: &Credentials,
        challenge: Option<&str>,
    ) -> Result<String, Error> {
        match self {
            Mechanism::Plain => match challenge {
                Some(_) => Err(error::client("This mechanism does not expect a challenge")),
                None => Ok(format!(
                    "\u{0}{}\u{0}{}",
                    credentials.authentication_identity, credentials.secret
                )),
            },
            Mechanism::Login => {
                let decoded_challenge =
                    challenge.ok_or_else(|| error::client("This mechanism does expect a challenge"))?;

                if ["User Name", "Username:", "Username"].contains(&decoded_challenge) {
                    return Ok(credentials.authentication_identity.clone());
                }

                if ["Password", "Password:"].contains(&decoded_challenge) {
                    return Ok(credentials.secret.clone());
                }

                Err(error::client("Unrecognized challenge"))
            }
            Mechanism::CramMd5 => {
                let decoded_challenge =
                    challenge.ok_or_else(|| error::client("This mechanism does expect a challenge"))?;

                let mut hmac = Hmac::<Md5>::new_from_slice(credentials.secret.as_bytes())
                    .map_err(error::client)?;
                hmac.update(decoded_challenge.as_bytes());

                Ok(format!(
                    "{} {}",
                    credentials.authentication_identity,
                    hex(&hmac.finalize().into_bytes())
                ))
            }
            Mechanism::DigestMd5 => {
                let decoded_challenge =
                    challenge.ok_or_else(|| error::client("This mechanism does expect a challenge"))?;

                // second round: the server reports rspauth, reply with an
                // empty response to finish the exchange
                if decoded_challenge.contains("rspauth=") {
                    return Ok(String::new());
                }

                let cnonce: String = rand::thread_rng()
                    .sample_iter(&Alphanumeric)
                    .take(32)
                    .map(char::from)
                    .collect();
                digest_md5_response(credentials, decoded_challenge, &cnonce)
            }
            Mechanism::Xoauth2 => match challenge {
                Some(_) => Err(error::client("This mechanism does not expect a challenge")),
                None => Ok(format!(
                    "user={}\x01auth=Bearer {}\x01\x01",
                    credentials.authentication_identity, credentials.secret
                )),
            },
        }
    }
}

/// Computes the DIGEST-MD5 `digest-response` for a server challenge
///
/// RFC 2831 section 2.1.2, with `qop=auth` and `nc=00000001`.
pub(crate) fn digest_md5_response(
    credentials: &Credentials,
    challenge: &str,
    cnonce: &str,
) -> Result<String, Error> {
    let directives = parse_challenge(challenge);
    let nonce = directives
        .iter()
        .find(|(k, _)| k == "nonce")
        .map(|(_, v)| v.as_str())
        .ok_or_else(|| error::client("Challenge has no nonce"))?;
    let realm = directives
        .iter()
        .find(|(k, _)| k == "realm")
        .map(|(_, v)| v.as_str())
        .unwrap_or("");
    let digest_uri = format!("smtp/{realm}");
    let nc = "00000001";
    let qop = "auth";

    // A1 = H(user:realm:pass):nonce:cnonce with H kept raw (md5-sess)
    let secret = Md5::digest(
        format!(
            "{}:{}:{}",
            credentials.authentication_identity, realm, credentials.secret
        )
        .as_bytes(),
    );
    let mut a1 = Md5::new();
    a1.update(secret);
    a1.update(format!(":{nonce}:{cnonce}").as_bytes());
    let ha1 = hex(&a1.finalize());

    let ha2 = hex(&Md5::digest(format!("AUTHENTICATE:{digest_uri}").as_bytes()));
    let response = hex(&Md5::digest(
        format!("{ha1}:{nonce}:{nc}:{cnonce}:{qop}:{ha2}").as_bytes(),
    ));

    Ok(format!(
        "username=\"{}\",realm=\"{}\",nonce=\"{}\",cnonce=\"{}\",nc={},qop={},digest-uri=\"{}\",response={},charset=utf-8",
        credentials.authentication_identity, realm, nonce, cnonce, nc, qop, digest_uri, response,
    ))
}

/// Splits a DIGEST-MD5 challenge into (directive, value) pairs, stripping
/// quotes
fn parse_challenge(challenge: &str) -> Vec<(String, String)> {
    let mut directives = Vec::new();
    let mut rest = challenge;
    while let Some(eq) = rest.find('=') {
        let key = rest[..eq].trim().to_string();
        rest = &rest[eq + 1..];
        let value = if let Some(stripped) = rest.strip_prefix('"') {
            let end = stripped.find('"').unwrap_or(stripped.len());
            let value = stripped[..end].to_string();
            rest = stripped.get(end + 1..).unwrap_or("");
            value
        } else {
            let end = rest.find(',').unwrap_or(rest.len());
            let value = rest[..end].to_string();
            rest = &rest[end..];
            value
        };
        directives.push((key, value));
        rest = rest.strip_prefix(',').unwrap_or(rest);
    }
    directives
}

fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        write!(out, "{byte:02x}").expect("writing to a String cannot fail");
    }
    out
}
