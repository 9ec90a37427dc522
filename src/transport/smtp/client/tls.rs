//! TLS configuration for SMTP connections

use std::{
    fmt::{self, Debug},
    sync::Arc,
    time::SystemTime,
};

use rustls::{
    client::{ServerCertVerified, ServerCertVerifier, WebPkiVerifier},
    Certificate, ClientConfig, OwnedTrustAnchor, RootCertStore, ServerName,
};

use crate::transport::smtp::error::{self, Error};

/// How to apply TLS to a client connection
#[derive(Clone)]
#[allow(missing_copy_implementations)]
pub enum Tls {
    /// Insecure (plaintext) connection only
    None,
    /// Start with insecure connection and use `STARTTLS` when available
    Opportunistic(TlsParameters),
    /// Start with insecure connection and require `STARTTLS`
    Required(TlsParameters),
    /// Use TLS wrapped connection without negotiation
    Wrapper(TlsParameters),
}

impl Debug for Tls {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self {
            Self::None => f.pad("None"),
            Self::Opportunistic(_) => f.pad("Opportunistic"),
            Self::Required(_) => f.pad("Required"),
            Self::Wrapper(_) => f.pad("Wrapper"),
        }
    }
}

/// Parameters to use for secure clients
#[derive(Clone)]
pub struct TlsParameters {
    pub(crate) connector: Arc<ClientConfig>,
    /// The domain name which is expected in the TLS certificate from the server
    domain: String,
}

impl Debug for TlsParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsParameters")
            .field("domain", &self.domain)
            .finish_non_exhaustive()
    }
}

/// Builder for `TlsParameters`
#[derive(Debug, Clone)]
pub struct TlsParametersBuilder {
    domain: String,
    accept_invalid_hostnames: bool,
    accept_invalid_certs: bool,
}

impl TlsParametersBuilder {
    /// Creates a new builder for `TlsParameters`
    pub fn new(domain: String) -> Self {
        Self {
            domain,
            accept_invalid_hostnames: false,
            accept_invalid_certs: false,
        }
    }

    /// Controls whether certificates with mismatched hostnames are accepted
    ///
    /// Defaults to `false`.
    ///
    /// # Warning
    ///
    /// Hostname verification is the only defense against an attacker serving
    /// an otherwise valid certificate of their own.
    pub fn dangerous_accept_invalid_hostnames(mut self, accept_invalid_hostnames: bool) -> Self {
        self.accept_invalid_hostnames = accept_invalid_hostnames;
        self
    }

    /// Controls whether invalid certificates are accepted
    ///
    /// Defaults to `false`.
    ///
    /// # Warning
    ///
    /// Accepting invalid certificates makes the connection vulnerable to
    /// man-in-the-middle attacks.
    pub fn dangerous_accept_invalid_certs(mut self, accept_invalid_certs: bool) -> Self {
        self.accept_invalid_certs = accept_invalid_certs;
        self
    }

    /// Creates a new `TlsParameters` using rustls with the webpki roots
    pub fn build(self) -> Result<TlsParameters, Error> {
        let mut root_cert_store = RootCertStore::empty();
        root_cert_store.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.iter().map(|ta| {
            OwnedTrustAnchor::from_subject_spki_name_constraints(
                ta.subject,
                ta.spki,
                ta.name_constraints,
            )
        }));

        let config = ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(root_cert_store.clone())
            .with_no_client_auth();

        let mut config = config;
        if self.accept_invalid_certs || self.accept_invalid_hostnames {
            config
                .dangerous()
                .set_certificate_verifier(Arc::new(InvalidCertsVerifier {
                    ignore_invalid_hostnames: self.accept_invalid_hostnames,
                    ignore_invalid_certs: self.accept_invalid_certs,
                    roots: root_cert_store,
                }));
        }

        Ok(TlsParameters {
            connector: Arc::new(config),
            domain: self.domain,
        })
    }
}

impl TlsParameters {
    /// Creates a new `TlsParameters` with the default configuration
    pub fn new(domain: String) -> Result<Self, Error> {
        TlsParametersBuilder::new(domain).build()
    }

    /// Creates a new `TlsParameters` builder
    pub fn builder(domain: String) -> TlsParametersBuilder {
        TlsParametersBuilder::new(domain)
    }

    /// Returns the domain name expected in the server certificate
    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub(crate) fn server_name(&self) -> Result<ServerName, Error> {
        ServerName::try_from(self.domain.as_str()).map_err(error::tls)
    }
}

struct InvalidCertsVerifier {
    ignore_invalid_hostnames: bool,
    ignore_invalid_certs: bool,
    roots: RootCertStore,
}

impl ServerCertVerifier for InvalidCertsVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &Certificate,
        intermediates: &[Certificate],
        server_name: &ServerName,
        scts: &mut dyn Iterator<Item = &[u8]>,
        ocsp_response: &[u8],
        now: SystemTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        if self.ignore_invalid_certs && self.ignore_invalid_hostnames {
            return Ok(ServerCertVerified::assertion());
        }

        let verifier = WebPkiVerifier::new(self.roots.clone(), None);
        match verifier.verify_server_cert(
            end_entity,
            intermediates,
            server_name,
            scts,
            ocsp_response,
            now,
        ) {
            Ok(verified) => Ok(verified),
            Err(rustls::Error::InvalidCertificate(rustls::CertificateError::NotValidForName))
                if self.ignore_invalid_hostnames =>
            {
                Ok(ServerCertVerified::assertion())
            }
            Err(e) if self.ignore_invalid_certs => {
                tracing::debug!("ignoring certificate error: {}", e);
                Ok(ServerCertVerified::assertion())
            }
            Err(e) => Err(e),
        }
    }
}
