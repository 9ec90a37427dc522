use super::Address;
use crate::transport::smtp::error::{self, Error};

/// Simple email envelope representation
///
/// We only accept mailboxes, and do not support source routes (as per RFC).
/// The forward path keeps the order it was built in, so callers flattening
/// To, Cc and Bcc recipient groups get them issued to the server in that
/// order.
#[derive(PartialEq, Eq, Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Envelope {
    /// The envelope recipient's addresses
    ///
    /// This can not be empty.
    forward_path: Vec<Address>,
    /// The envelope sender address
    ///
    /// When a distinct bounce address is configured the caller resolves it
    /// before building the envelope, so this is the effective reverse path.
    /// The transport refuses to send when it is absent.
    reverse_path: Option<Address>,
}

impl Envelope {
    /// Creates a new envelope, which may fail if `to` is empty.
    pub fn new(from: Option<Address>, to: Vec<Address>) -> Result<Envelope, Error> {
        if to.is_empty() {
            return Err(error::client("missing destination address"));
        }
        Ok(Envelope {
            forward_path: to,
            reverse_path: from,
        })
    }

    /// Gets the destination addresses of the envelope.
    pub fn to(&self) -> &[Address] {
        self.forward_path.as_slice()
    }

    /// Gets the sender of the envelope.
    pub fn from(&self) -> Option<&Address> {
        self.reverse_path.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::Envelope;
    use crate::Address;

    #[test]
    fn keeps_recipient_order() {
        let to: Vec<Address> = vec![
            "to@example.com".parse().unwrap(),
            "cc@example.com".parse().unwrap(),
            "bcc@example.com".parse().unwrap(),
        ];
        let envelope = Envelope::new(Some("from@example.com".parse().unwrap()), to.clone()).unwrap();
        assert_eq!(envelope.to(), to.as_slice());
    }

    #[test]
    fn rejects_empty_recipients() {
        assert!(Envelope::new(Some("from@example.com".parse().unwrap()), vec![]).is_err());
    }
}
