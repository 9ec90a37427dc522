//! The SMTP transport sends emails using the SMTP submission protocol
//!
//! Connections are pooled and kept alive; the post-connect handshake
//! (greeting, EHLO, STARTTLS, AUTH) runs once per connection and the pool
//! issues RSET when a connection is reused.

pub mod authentication;
pub mod client;
pub mod commands;
pub(crate) mod error;
pub mod extension;
mod pool;
pub mod response;
mod transport;

pub use self::{
    client::SendResult,
    error::Error,
    pool::PoolConfig,
    transport::{LoginOption, SmtpTransport, SmtpTransportBuilder},
};

// Registered port numbers:
// https://www.iana.org/assignments/service-names-port-numbers/service-names-port-numbers.xhtml

/// Default smtp port
pub const SMTP_PORT: u16 = 25;

/// Default submission port
pub const SUBMISSION_PORT: u16 = 587;

/// Default submission over TLS port
///
/// Defined in [RFC 8314](https://tools.ietf.org/html/rfc8314)
pub const SUBMISSIONS_PORT: u16 = 465;
