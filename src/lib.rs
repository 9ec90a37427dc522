//! missive is an asynchronous SMTP submission client with DKIM signing.
//!
//! It drives the full submission dialogue (greeting, `EHLO`, `STARTTLS`,
//! SASL authentication, `MAIL FROM` / `RCPT TO` / `DATA`) over a bounded
//! pool of keep-alive connections, and can sign outgoing messages with one
//! or more `DKIM-Signature` headers (RFC 6376) before transmission.
//!
//! Message construction is out of scope: a MIME encoder hands over an
//! [`EncodedPart`] tree (ordered headers plus a body, a restartable byte
//! stream, or child parts with a boundary) and an [`Envelope`], and the
//! transport does the rest.
//!
//! ```rust,no_run
//! use missive::{
//!     Envelope, EncodedPart, SmtpTransport,
//!     transport::smtp::authentication::Credentials,
//! };
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let transport = SmtpTransport::starttls_relay("smtp.example.com")?
//!     .credentials(Credentials::new("user".to_owned(), "password".to_owned()))
//!     .build()?;
//!
//! let envelope = Envelope::new(
//!     Some("from@example.com".parse()?),
//!     vec!["to@example.com".parse()?],
//! )?;
//! let mut mail = EncodedPart::text(
//!     vec![
//!         ("From".to_owned(), "from@example.com".to_owned()),
//!         ("To".to_owned(), "to@example.com".to_owned()),
//!         ("Subject".to_owned(), "hello".to_owned()),
//!     ],
//!     "Message Body",
//! );
//!
//! let result = transport.send(&envelope, &mut mail).await?;
//! println!("accepted: {:?}", result.accepted());
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod address;
mod base64;
pub mod message;
pub mod transport;

pub use crate::{
    address::{Address, Envelope},
    message::{
        dkim::{Canonicalization, DkimConfig, DkimSigningAlgorithm, DkimSigningKey},
        BodySource, EncodedPart,
    },
    transport::smtp::{SendResult, SmtpTransport, SmtpTransportBuilder},
};

pub(crate) type BoxError = Box<dyn std::error::Error + Send + Sync>;
