//! Error and result type for the SMTP transport

use std::{error::Error as StdError, fmt};

use crate::{transport::smtp::response::{Code, Severity}, BoxError};

// Inspired by https://github.com/seanmonstar/reqwest/blob/master/src/error.rs

/// The Errors that may occur when sending an email over SMTP
pub struct Error {
    inner: Box<Inner>,
}

struct Inner {
    kind: Kind,
    source: Option<BoxError>,
}

impl Error {
    pub(crate) fn new<E>(kind: Kind, source: Option<E>) -> Error
    where
        E: Into<BoxError>,
    {
        Error {
            inner: Box::new(Inner {
                kind,
                source: source.map(Into::into),
            }),
        }
    }

    /// Returns true if the error is from an unparseable response
    pub fn is_response(&self) -> bool {
        matches!(self.inner.kind, Kind::Response)
    }

    /// Returns true if the error is from the client
    pub fn is_client(&self) -> bool {
        matches!(self.inner.kind, Kind::Client)
    }

    /// Returns true if the error is a transient SMTP error
    pub fn is_transient(&self) -> bool {
        matches!(self.inner.kind, Kind::Transient(_))
    }

    /// Returns true if the error is a permanent SMTP error
    pub fn is_permanent(&self) -> bool {
        matches!(self.inner.kind, Kind::Permanent(_))
    }

    /// Returns true if the error comes from an invalid configuration
    pub fn is_config_invalid(&self) -> bool {
        matches!(self.inner.kind, Kind::ConfigInvalid)
    }

    /// Returns true if the TCP or TLS connect failed
    pub fn is_connect_failed(&self) -> bool {
        matches!(self.inner.kind, Kind::ConnectFailed)
    }

    /// Returns true if the server greeting was negative or malformed
    pub fn is_greeting_failed(&self) -> bool {
        matches!(self.inner.kind, Kind::GreetingFailed(_))
    }

    /// Returns true if STARTTLS was required but unavailable
    pub fn is_tls_required(&self) -> bool {
        matches!(self.inner.kind, Kind::TlsRequired)
    }

    /// Returns true if no authentication mechanism matched or all were rejected
    pub fn is_auth_failed(&self) -> bool {
        matches!(self.inner.kind, Kind::AuthFailed)
    }

    /// Returns true if MAIL FROM was rejected
    pub fn is_sender_rejected(&self) -> bool {
        matches!(self.inner.kind, Kind::SenderRejected(_))
    }

    /// Returns true if a recipient (or every recipient) was rejected
    pub fn is_recipient_rejected(&self) -> bool {
        matches!(self.inner.kind, Kind::RecipientRejected(_))
    }

    /// Returns true if the message exceeded the advertised SIZE
    pub fn is_message_too_large(&self) -> bool {
        matches!(self.inner.kind, Kind::MessageTooLarge)
    }

    /// Returns true if DATA or the terminating dot was rejected
    pub fn is_data_rejected(&self) -> bool {
        matches!(self.inner.kind, Kind::DataRejected(_))
    }

    /// Returns true if the socket failed while streaming the message body
    pub fn is_body_write_failed(&self) -> bool {
        matches!(self.inner.kind, Kind::BodyWriteFailed)
    }

    /// Returns true if the DKIM private key could not be used
    pub fn is_dkim_key_invalid(&self) -> bool {
        matches!(self.inner.kind, Kind::DkimKeyInvalid)
    }

    /// Returns true if DKIM hashing or signing failed
    pub fn is_dkim_sign_failure(&self) -> bool {
        matches!(self.inner.kind, Kind::DkimSignFailure)
    }

    /// Returns true if the connection pool was closed
    pub fn is_pool_closed(&self) -> bool {
        matches!(self.inner.kind, Kind::PoolClosed)
    }

    /// Returns true if waiting for a pooled connection timed out
    pub fn is_pool_acquire_timeout(&self) -> bool {
        matches!(self.inner.kind, Kind::PoolAcquireTimeout)
    }

    /// Returns true if a reply arrived with no pending handler
    pub fn is_unexpected_reply(&self) -> bool {
        matches!(self.inner.kind, Kind::UnexpectedReply)
    }

    /// Returns true if the error is from TLS
    pub fn is_tls(&self) -> bool {
        matches!(self.inner.kind, Kind::Tls)
    }

    /// Returns true if the error is caused by a timeout
    pub fn is_timeout(&self) -> bool {
        let mut source = self.source();

        while let Some(err) = source {
            if let Some(io_err) = err.downcast_ref::<std::io::Error>() {
                return io_err.kind() == std::io::ErrorKind::TimedOut;
            }

            source = err.source();
        }

        false
    }

    /// Returns the status code, if the error was generated from a response.
    pub fn status(&self) -> Option<Code> {
        match self.inner.kind {
            Kind::Transient(code)
            | Kind::Permanent(code)
            | Kind::GreetingFailed(Some(code))
            | Kind::SenderRejected(code)
            | Kind::RecipientRejected(code)
            | Kind::DataRejected(code) => Some(code),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub(crate) enum Kind {
    /// Transient SMTP error, 4xx reply code
    ///
    /// [RFC 5321, section 4.2.1](https://tools.ietf.org/html/rfc5321#section-4.2.1)
    Transient(Code),
    /// Permanent SMTP error, 5xx reply code
    ///
    /// [RFC 5321, section 4.2.1](https://tools.ietf.org/html/rfc5321#section-4.2.1)
    Permanent(Code),
    /// Error parsing a response
    Response,
    /// Internal client error
    Client,
    /// Underlying network i/o error
    Network,
    /// TLS error
    Tls,
    /// Invalid or incomplete configuration
    ConfigInvalid,
    /// TCP or TLS connect error
    ConnectFailed,
    /// Non-2xx or malformed server greeting
    GreetingFailed(Option<Code>),
    /// STARTTLS required but unavailable
    TlsRequired,
    /// No matching mechanism or all mechanisms rejected
    AuthFailed,
    /// Non-2xx to MAIL FROM
    SenderRejected(Code),
    /// Rejected RCPT TO
    RecipientRejected(Code),
    /// Advertised SIZE exceeded
    MessageTooLarge,
    /// Non-3xx to DATA, or non-2xx after the terminating dot
    DataRejected(Code),
    /// Socket or stream failure during DATA
    BodyWriteFailed,
    /// DKIM key decoding or signature-init failure
    DkimKeyInvalid,
    /// DKIM hashing or signing failed
    DkimSignFailure,
    /// The connection pool no longer accepts acquires
    PoolClosed,
    /// Pool acquisition timed out
    PoolAcquireTimeout,
    /// Reply arrived with no pending handler
    UnexpectedReply,
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut builder = f.debug_struct("missive::transport::smtp::Error");

        builder.field("kind", &self.inner.kind);

        if let Some(ref source) = self.inner.source {
            builder.field("source", source);
        }

        builder.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.kind {
            Kind::Response => f.write_str("response error")?,
            Kind::Client => f.write_str("internal client error")?,
            Kind::Network => f.write_str("network error")?,
            Kind::Tls => f.write_str("tls error")?,
            Kind::ConfigInvalid => f.write_str("invalid configuration")?,
            Kind::ConnectFailed => f.write_str("connect failed")?,
            Kind::GreetingFailed(code) => match code {
                Some(code) => write!(f, "greeting failed ({code})")?,
                None => f.write_str("greeting failed")?,
            },
            Kind::TlsRequired => f.write_str("STARTTLS required but not available")?,
            Kind::AuthFailed => f.write_str("authentication failed")?,
            Kind::SenderRejected(ref code) => write!(f, "sender address not accepted ({code})")?,
            Kind::RecipientRejected(ref code) => {
                write!(f, "recipient address not accepted ({code})")?;
            }
            Kind::MessageTooLarge => f.write_str("message exceeds allowed size limit")?,
            Kind::DataRejected(ref code) => write!(f, "message data not accepted ({code})")?,
            Kind::BodyWriteFailed => f.write_str("writing the message body failed")?,
            Kind::DkimKeyInvalid => f.write_str("invalid dkim signing key")?,
            Kind::DkimSignFailure => f.write_str("dkim signing failed")?,
            Kind::PoolClosed => f.write_str("connection pool is closed")?,
            Kind::PoolAcquireTimeout => f.write_str("timed out waiting for a pooled connection")?,
            Kind::UnexpectedReply => f.write_str("reply arrived with no pending handler")?,
            Kind::Transient(ref code) => {
                write!(f, "transient error ({code})")?;
            }
            Kind::Permanent(ref code) => {
                write!(f, "permanent error ({code})")?;
            }
        };

        if let Some(ref e) = self.inner.source {
            write!(f, ": {e}")?;
        }

        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner.source.as_ref().map(|e| {
            let r: &(dyn StdError + 'static) = &**e;
            r
        })
    }
}

pub(crate) fn code(c: Code, s: Option<String>) -> Error {
    match c.severity {
        Severity::TransientNegativeCompletion => Error::new(Kind::Transient(c), s),
        Severity::PermanentNegativeCompletion => Error::new(Kind::Permanent(c), s),
        _ => client("unknown error code"),
    }
}

pub(crate) fn response<E: Into<BoxError>>(e: E) -> Error {
    Error::new(Kind::Response, Some(e))
}

pub(crate) fn client<E: Into<BoxError>>(e: E) -> Error {
    Error::new(Kind::Client, Some(e))
}

pub(crate) fn network<E: Into<BoxError>>(e: E) -> Error {
    Error::new(Kind::Network, Some(e))
}

pub(crate) fn connection<E: Into<BoxError>>(e: E) -> Error {
    Error::new(Kind::ConnectFailed, Some(e))
}

pub(crate) fn tls<E: Into<BoxError>>(e: E) -> Error {
    Error::new(Kind::Tls, Some(e))
}

pub(crate) fn config_invalid<E: Into<BoxError>>(e: E) -> Error {
    Error::new(Kind::ConfigInvalid, Some(e))
}

pub(crate) fn greeting_failed<E: Into<BoxError>>(code: Option<Code>, e: E) -> Error {
    Error::new(Kind::GreetingFailed(code), Some(e))
}

pub(crate) fn tls_required() -> Error {
    Error::new::<BoxError>(Kind::TlsRequired, None)
}

pub(crate) fn auth_failed<E: Into<BoxError>>(e: E) -> Error {
    Error::new(Kind::AuthFailed, Some(e))
}

pub(crate) fn sender_rejected(code: Code, line: Option<String>) -> Error {
    Error::new(Kind::SenderRejected(code), line)
}

pub(crate) fn recipient_rejected(code: Code, line: Option<String>) -> Error {
    Error::new(Kind::RecipientRejected(code), line)
}

pub(crate) fn message_too_large() -> Error {
    Error::new::<BoxError>(Kind::MessageTooLarge, None)
}

pub(crate) fn data_rejected(code: Code, line: Option<String>) -> Error {
    Error::new(Kind::DataRejected(code), line)
}

pub(crate) fn body_write_failed<E: Into<BoxError>>(e: E) -> Error {
    Error::new(Kind::BodyWriteFailed, Some(e))
}

pub(crate) fn dkim_key_invalid<E: Into<BoxError>>(e: E) -> Error {
    Error::new(Kind::DkimKeyInvalid, Some(e))
}

pub(crate) fn dkim_sign_failure<E: Into<BoxError>>(e: E) -> Error {
    Error::new(Kind::DkimSignFailure, Some(e))
}

pub(crate) fn pool_closed() -> Error {
    Error::new::<BoxError>(Kind::PoolClosed, None)
}

pub(crate) fn pool_acquire_timeout() -> Error {
    Error::new::<BoxError>(Kind::PoolAcquireTimeout, None)
}

pub(crate) fn unexpected_reply<E: Into<BoxError>>(e: E) -> Error {
    Error::new(Kind::UnexpectedReply, Some(e))
}
