use std::{
    fmt::{self, Debug},
    sync::{Arc, Mutex as StdMutex},
    time::Duration,
};

use super::{
    authentication::{Credentials, Mechanism, DEFAULT_ENCRYPTED_MECHANISMS},
    client::{SendResult, SmtpConnection, Tls},
    error,
    error::Error,
    extension::ClientId,
    pool::{Pool, PoolConfig, PooledConnection},
    SUBMISSIONS_PORT, SUBMISSION_PORT,
};
use crate::{
    address::Envelope,
    message::{
        dkim::{DkimConfig, DkimSigner},
        EncodedPart,
    },
};

/// How many fresh connections are tried when RSET fails on reused ones
pub(crate) const RSET_MAX_RETRY: usize = 5;

/// Whether and when the client authenticates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum LoginOption {
    /// Never send AUTH
    Disabled,
    /// Authenticate when credentials are set and the server offers a
    /// compatible mechanism
    #[default]
    IfAvailable,
    /// Fail the handshake unless authentication succeeds
    Required,
}

/// Contains client configuration
#[derive(Clone)]
pub(crate) struct SmtpInfo {
    /// Name sent during EHLO
    pub(crate) hello_name: ClientId,
    /// Server we are connecting to
    pub(crate) server: String,
    /// Port to connect to
    pub(crate) port: u16,
    /// TLS security configuration
    pub(crate) tls: Tls,
    /// Connection and command timeout
    pub(crate) timeout: Option<Duration>,
    /// Optional enforced authentication mechanism
    pub(crate) authentication: Vec<Mechanism>,
    /// Credentials
    pub(crate) credentials: Option<Credentials>,
    /// Authentication policy
    pub(crate) login: LoginOption,
}

impl Default for SmtpInfo {
    fn default() -> Self {
        Self {
            server: "localhost".to_string(),
            port: SUBMISSION_PORT,
            hello_name: ClientId::default(),
            timeout: Some(Duration::from_secs(60)),
            tls: Tls::None,
            authentication: DEFAULT_ENCRYPTED_MECHANISMS.to_vec(),
            credentials: None,
            login: LoginOption::IfAvailable,
        }
    }
}

impl Debug for SmtpInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmtpInfo")
            .field("server", &self.server)
            .field("port", &self.port)
            .field("hello_name", &self.hello_name)
            .field("timeout", &self.timeout)
            .field("tls", &self.tls)
            .field("authentication", &self.authentication)
            .field("login", &self.login)
            .finish_non_exhaustive()
    }
}

/// Establishes fully started connections: connect, greeting, EHLO, STARTTLS,
/// AUTH
#[derive(Clone)]
pub(crate) struct SmtpClient {
    info: SmtpInfo,
    /// Mechanism that last authenticated successfully, tried first on new
    /// connections
    default_auth: Arc<StdMutex<Option<Mechanism>>>,
}

impl SmtpClient {
    pub(crate) fn new(info: SmtpInfo) -> Self {
        Self {
            info,
            default_auth: Arc::new(StdMutex::new(None)),
        }
    }

    /// Creates a new connection directly usable to send emails
    ///
    /// Handles encryption and authentication
    pub(crate) async fn connection(&self) -> Result<SmtpConnection, Error> {
        let tls_parameters = match &self.info.tls {
            Tls::Wrapper(tls_parameters) => Some(tls_parameters),
            _ => None,
        };

        let mut conn = SmtpConnection::connect(
            (self.info.server.as_str(), self.info.port),
            self.info.timeout,
            &self.info.hello_name,
            tls_parameters,
        )
        .await?;

        if let Err(err) = self.handshake(&mut conn).await {
            conn.abort().await;
            return Err(err);
        }

        Ok(conn)
    }

    async fn handshake(&self, conn: &mut SmtpConnection) -> Result<(), Error> {
        match &self.info.tls {
            Tls::Opportunistic(tls_parameters) => {
                if conn.can_starttls() {
                    conn.starttls(tls_parameters, &self.info.hello_name).await?;
                }
            }
            Tls::Required(tls_parameters) => {
                conn.starttls(tls_parameters, &self.info.hello_name).await?;
            }
            _ => (),
        }

        if self.info.login == LoginOption::Disabled {
            return Ok(());
        }

        let credentials = match &self.info.credentials {
            Some(credentials) => credentials,
            None => {
                if self.info.login == LoginOption::Required {
                    return Err(error::config_invalid(
                        "authentication required but no credentials were configured",
                    ));
                }
                return Ok(());
            }
        };

        let mut mechanisms = self.info.authentication.clone();
        // sticky preference: what worked last time goes first
        let default_auth = *self.default_auth.lock().expect("poisoned default_auth");
        if let Some(default) = default_auth {
            if let Some(pos) = mechanisms.iter().position(|m| *m == default) {
                mechanisms.remove(pos);
                mechanisms.insert(0, default);
            }
        }

        let candidates = conn.server_info().get_auth_mechanisms(&mechanisms);
        if candidates.is_empty() {
            if self.info.login == LoginOption::Required {
                return Err(error::auth_failed(
                    "no compatible authentication mechanism was found",
                ));
            }
            tracing::debug!("no supported authentication mechanisms available, continuing");
            return Ok(());
        }

        let mechanism = conn.auth(&mechanisms, credentials).await?;
        *self.default_auth.lock().expect("poisoned default_auth") = Some(mechanism);
        Ok(())
    }
}

/// Asynchronous SMTP transport: pooled connections, DKIM signing, one call
/// per message
#[derive(Clone, Debug)]
pub struct SmtpTransport {
    inner: Arc<SmtpTransportInner>,
}

struct SmtpTransportInner {
    pool: Arc<Pool>,
    allow_rcpt_errors: bool,
    cache_streams_in_file: bool,
    dkim_signers: Vec<DkimSigner>,
}

impl Debug for SmtpTransportInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmtpTransportInner")
            .field("pool", &self.pool)
            .field("allow_rcpt_errors", &self.allow_rcpt_errors)
            .field("dkim_signers", &self.dkim_signers.len())
            .finish()
    }
}

impl SmtpTransport {
    /// Simple and secure transport, to be used when possible
    ///
    /// Creates a connection over the submissions port, TLS-wrapped from the
    /// start, using the provided domain to validate TLS certificates.
    pub fn relay(relay: &str) -> Result<SmtpTransportBuilder, Error> {
        let tls_parameters = super::client::TlsParameters::new(relay.into())?;

        Ok(Self::builder_dangerous(relay)
            .port(SUBMISSIONS_PORT)
            .tls(Tls::Wrapper(tls_parameters)))
    }

    /// Secure transport for servers without wrapped TLS
    ///
    /// Connects over the submission port in the clear and requires a
    /// STARTTLS upgrade before going on.
    pub fn starttls_relay(relay: &str) -> Result<SmtpTransportBuilder, Error> {
        let tls_parameters = super::client::TlsParameters::new(relay.into())?;

        Ok(Self::builder_dangerous(relay)
            .port(SUBMISSION_PORT)
            .tls(Tls::Required(tls_parameters)))
    }

    /// Creates a new local SMTP client to port 25
    ///
    /// Shortcut for a local unencrypted relay (typical local email daemon
    /// that will handle relaying).
    pub fn unencrypted_localhost() -> SmtpTransport {
        Self::builder_dangerous("localhost")
            .port(super::SMTP_PORT)
            .build()
            .expect("the default configuration is valid")
    }

    /// Creates a new SMTP client without TLS or authentication
    ///
    /// Consider using [`SmtpTransport::relay`] or
    /// [`SmtpTransport::starttls_relay`] instead, if possible.
    pub fn builder_dangerous<T: Into<String>>(server: T) -> SmtpTransportBuilder {
        SmtpTransportBuilder {
            info: SmtpInfo {
                server: server.into(),
                ..SmtpInfo::default()
            },
            pool_config: PoolConfig::default(),
            allow_rcpt_errors: false,
            cache_streams_in_file: false,
            enable_dkim: false,
            dkim_configs: Vec::new(),
        }
    }

    /// Sends one message through a pooled connection
    ///
    /// Validates the envelope, signs with DKIM when configured (prepending
    /// the `DKIM-Signature` headers to `mail`), acquires a connection (RSET
    /// on reused ones, retrying with fresh connections on failure) and
    /// drives the transaction.
    pub async fn send(
        &self,
        envelope: &Envelope,
        mail: &mut EncodedPart,
    ) -> Result<SendResult, Error> {
        // the envelope guarantees at least one recipient, but not a sender
        if envelope.from().is_none() {
            return Err(error::client("sender address is not present"));
        }

        if !self.inner.dkim_signers.is_empty() {
            mail.cache_streams(self.inner.cache_streams_in_file)
                .await
                .map_err(error::dkim_sign_failure)?;
            let mut headers = Vec::with_capacity(self.inner.dkim_signers.len());
            for signer in &self.inner.dkim_signers {
                headers.push(signer.sign(mail).await?);
            }
            mail.prepend_headers(
                headers
                    .into_iter()
                    .map(|value| (DkimSigner::HEADER.to_string(), value))
                    .collect(),
            );
        }

        let mut conn = self.checked_out_connection().await?;
        conn.send(envelope, mail, self.inner.allow_rcpt_errors).await
    }

    /// Acquires a usable connection, issuing RSET on reused ones
    async fn checked_out_connection(&self) -> Result<PooledConnection, Error> {
        let mut last_error = None;
        for _ in 0..RSET_MAX_RETRY {
            let mut conn = self.inner.pool.connection().await?;
            if !conn.is_reused() {
                return Ok(conn);
            }
            match conn.rset().await {
                Ok(_) => return Ok(conn),
                Err(err) => {
                    tracing::debug!("RSET on a reused connection failed: {}", err);
                    conn.abort().await;
                    last_error = Some(err);
                    // dropping the lease evicts the broken connection
                }
            }
        }
        Err(last_error.expect("retry loop ran at least once"))
    }

    /// Live connections held by the pool, idle and checked-out combined
    pub async fn connection_count(&self) -> u32 {
        self.inner.pool.connection_count().await
    }

    /// Closes the pool: pending waiters fail, idle connections are
    /// QUIT-closed, further sends are rejected
    pub async fn close(&self) {
        self.inner.pool.close().await;
    }
}

/// Builder for the SMTP `SmtpTransport`
#[derive(Debug, Clone)]
pub struct SmtpTransportBuilder {
    info: SmtpInfo,
    pool_config: PoolConfig,
    allow_rcpt_errors: bool,
    cache_streams_in_file: bool,
    enable_dkim: bool,
    dkim_configs: Vec<DkimConfig>,
}

impl SmtpTransportBuilder {
    /// Set the name used during EHLO
    pub fn hello_name(mut self, name: ClientId) -> Self {
        self.info.hello_name = name;
        self
    }

    /// Set the authentication credentials
    pub fn credentials<C: Into<Credentials>>(mut self, credentials: C) -> Self {
        self.info.credentials = Some(credentials.into());
        self
    }

    /// Set the authentication mechanisms, in preference order
    pub fn authentication(mut self, mechanisms: Vec<Mechanism>) -> Self {
        self.info.authentication = mechanisms;
        self
    }

    /// Set the authentication policy
    pub fn login(mut self, login: LoginOption) -> Self {
        self.info.login = login;
        self
    }

    /// Set the port to use
    pub fn port(mut self, port: u16) -> Self {
        self.info.port = port;
        self
    }

    /// Set the connection and command timeout
    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.info.timeout = timeout;
        self
    }

    /// Set the TLS settings to use
    pub fn tls(mut self, tls: Tls) -> Self {
        self.info.tls = tls;
        self
    }

    /// Use a custom configuration for the connection pool
    pub fn pool_config(mut self, pool_config: PoolConfig) -> Self {
        self.pool_config = pool_config;
        self
    }

    /// Keep sending when individual recipients are rejected
    ///
    /// The transaction still fails when every recipient is rejected.
    /// Defaults to `false`.
    pub fn allow_rcpt_errors(mut self, allow_rcpt_errors: bool) -> Self {
        self.allow_rcpt_errors = allow_rcpt_errors;
        self
    }

    /// Spill non-restartable attachment streams to temp files instead of
    /// memory when DKIM signing needs to read them twice
    pub fn cache_streams_in_file(mut self, cache_streams_in_file: bool) -> Self {
        self.cache_streams_in_file = cache_streams_in_file;
        self
    }

    /// Enable DKIM signing of outgoing messages
    pub fn enable_dkim(mut self, enable_dkim: bool) -> Self {
        self.enable_dkim = enable_dkim;
        self
    }

    /// Add a DKIM signing configuration; one signature header is produced
    /// per configuration, in the order they were added
    pub fn dkim_config(mut self, config: DkimConfig) -> Self {
        self.enable_dkim = true;
        self.dkim_configs.push(config);
        self
    }

    /// Build the transport
    ///
    /// Validates the DKIM configurations; the connection pool starts its
    /// cleaner task, so this must run inside a Tokio runtime.
    pub fn build(self) -> Result<SmtpTransport, Error> {
        let dkim_signers = if self.enable_dkim {
            if self.dkim_configs.is_empty() {
                return Err(error::config_invalid(
                    "PubSecKeyOptions must be specified to perform sign",
                ));
            }
            self.dkim_configs
                .into_iter()
                .map(DkimSigner::new)
                .collect::<Result<Vec<_>, Error>>()?
        } else {
            Vec::new()
        };

        let client = SmtpClient::new(self.info);
        let pool = Pool::new(self.pool_config, client);

        Ok(SmtpTransport {
            inner: Arc::new(SmtpTransportInner {
                pool,
                allow_rcpt_errors: self.allow_rcpt_errors,
                cache_streams_in_file: self.cache_streams_in_file,
                dkim_signers,
            }),
        })
    }
}
