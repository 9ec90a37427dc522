use std::{fmt::Display, time::Duration};

use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::ToSocketAddrs,
};

use super::{escape_crlf, mask_secrets, NetworkStream, TlsParameters};
use crate::{
    address::{Address, Envelope},
    message::EncodedPart,
    transport::smtp::{
        authentication::{Credentials, Mechanism},
        commands::{Auth, Data, Ehlo, Helo, Mail, Noop, Quit, Rcpt, Rset, Starttls},
        error,
        error::Error,
        extension::{ClientId, Extension, MailParameter, ServerInfo},
        response::{parse_response, Response, Severity},
    },
};

macro_rules! try_smtp (
    ($err: expr, $client: ident) => ({
        match $err {
            Ok(val) => val,
            Err(err) => {
                $client.abort().await;
                return Err(From::from(err))
            },
        }
    })
);

/// Result of a successful mail transaction
#[derive(Debug, Clone)]
pub struct SendResult {
    message_id: Option<String>,
    accepted: Vec<Address>,
    response: Response,
}

impl SendResult {
    /// The `Message-ID` of the transmitted message, when it carried one
    pub fn message_id(&self) -> Option<&str> {
        self.message_id.as_deref()
    }

    /// The recipients the server accepted
    pub fn accepted(&self) -> &[Address] {
        &self.accepted
    }

    /// The reply to the end-of-data dot
    pub fn response(&self) -> &Response {
        &self.response
    }
}

/// Structure that implements the SMTP client
pub struct SmtpConnection {
    /// TCP stream between client and server
    stream: BufReader<NetworkStream>,
    /// Panic state
    panic: bool,
    /// Whether QUIT was already sent
    sent_quit: bool,
    /// Information about the server
    server_info: ServerInfo,
}

impl SmtpConnection {
    /// Get information about the server
    pub fn server_info(&self) -> &ServerInfo {
        &self.server_info
    }

    /// Connects to the configured server
    ///
    /// Awaits the greeting, then sends EHLO (falling back to HELO on a
    /// permanent rejection) and parses the server capabilities. The stream is
    /// TLS-wrapped from the start when `tls_parameters` is given.
    pub async fn connect<T: ToSocketAddrs>(
        server: T,
        timeout: Option<Duration>,
        hello_name: &ClientId,
        tls_parameters: Option<&TlsParameters>,
    ) -> Result<SmtpConnection, Error> {
        let stream = NetworkStream::connect(server, timeout, tls_parameters).await?;
        let stream = BufReader::new(stream);
        let mut conn = SmtpConnection {
            stream,
            panic: false,
            sent_quit: false,
            server_info: ServerInfo::default(),
        };

        let greeting = match conn.read_response_raw().await {
            Ok(greeting) => greeting,
            Err(err) => {
                conn.abort().await;
                return Err(error::greeting_failed(None, err));
            }
        };
        if greeting.code().severity != Severity::PositiveCompletion {
            let code = greeting.code();
            conn.abort().await;
            return Err(error::greeting_failed(
                Some(code),
                greeting.first_line().unwrap_or_default().to_owned(),
            ));
        }

        conn.ehlo(hello_name).await?;

        tracing::debug!("server {}", conn.server_info);
        Ok(conn)
    }

    /// Drives one message through the connection
    ///
    /// MAIL FROM, RCPT TO for each envelope recipient in order, DATA, the
    /// dot-stuffed message stream and the terminating dot. Application-level
    /// rejections leave the connection usable; socket failures mark it
    /// broken.
    pub async fn send(
        &mut self,
        envelope: &Envelope,
        mail: &EncodedPart,
        allow_rcpt_errors: bool,
    ) -> Result<SendResult, Error> {
        // Size check against the advertised limit, before any command
        if let (Some(max_size), Some(size)) = (self.server_info.max_size(), mail.size()) {
            if size > max_size {
                return Err(error::message_too_large());
            }
        }

        // Mail
        let mut mail_options = vec![];
        if self.server_info.max_size().is_some() {
            if let Some(size) = mail.size() {
                mail_options.push(MailParameter::Size(size));
            }
        }
        let mail_response = try_smtp!(
            self.command_raw(Mail::new(envelope.from().cloned(), mail_options))
                .await,
            self
        );
        if mail_response.code().severity != Severity::PositiveCompletion {
            return Err(error::sender_rejected(
                mail_response.code(),
                mail_response.first_line().map(ToOwned::to_owned),
            ));
        }

        // Recipients, pipelined as one group when the server allows it
        let accepted = if envelope.to().len() > 1
            && self.server_info.supports_feature(Extension::Pipelining)
        {
            let commands: Vec<Rcpt> = envelope
                .to()
                .iter()
                .map(|to_address| Rcpt::new(to_address.clone()))
                .collect();
            let responses = try_smtp!(self.pipeline(&commands).await, self);
            self.check_rcpt_responses(envelope, &responses, allow_rcpt_errors)?
        } else {
            let mut responses = Vec::with_capacity(envelope.to().len());
            for to_address in envelope.to() {
                let response = try_smtp!(
                    self.command_raw(Rcpt::new(to_address.clone())).await,
                    self
                );
                responses.push(response);
            }
            self.check_rcpt_responses(envelope, &responses, allow_rcpt_errors)?
        };

        // Data
        let data_response = try_smtp!(self.command_raw(Data).await, self);
        if data_response.code().severity != Severity::PositiveIntermediate {
            return Err(error::data_rejected(
                data_response.code(),
                data_response.first_line().map(ToOwned::to_owned),
            ));
        }

        // Message content
        let response = self.message(mail).await?;
        if response.code().severity != Severity::PositiveCompletion {
            return Err(error::data_rejected(
                response.code(),
                response.first_line().map(ToOwned::to_owned),
            ));
        }

        Ok(SendResult {
            message_id: mail.message_id().map(ToOwned::to_owned),
            accepted,
            response,
        })
    }

    fn check_rcpt_responses(
        &self,
        envelope: &Envelope,
        responses: &[Response],
        allow_rcpt_errors: bool,
    ) -> Result<Vec<Address>, Error> {
        let mut accepted = Vec::with_capacity(responses.len());
        let mut last_rejection = None;
        for (to_address, response) in envelope.to().iter().zip(responses) {
            if response.code().severity == Severity::PositiveCompletion {
                accepted.push(to_address.clone());
            } else if allow_rcpt_errors {
                tracing::warn!(
                    "recipient {} not accepted ({}), continuing",
                    to_address,
                    response.code()
                );
                last_rejection = Some(response);
            } else {
                return Err(error::recipient_rejected(
                    response.code(),
                    response.first_line().map(ToOwned::to_owned),
                ));
            }
        }
        if accepted.is_empty() {
            let response = last_rejection.expect("an empty accepted list implies a rejection");
            return Err(error::recipient_rejected(
                response.code(),
                response.first_line().map(ToOwned::to_owned),
            ));
        }
        Ok(accepted)
    }

    /// Whether the connection can no longer be reused
    pub fn has_broken(&self) -> bool {
        self.panic || self.sent_quit
    }

    /// Whether the connection is plaintext and the server offers STARTTLS
    pub fn can_starttls(&self) -> bool {
        !self.is_encrypted() && self.server_info.supports_feature(Extension::StartTls)
    }

    /// Upgrades the connection with STARTTLS and repeats EHLO
    pub async fn starttls(
        &mut self,
        tls_parameters: &TlsParameters,
        hello_name: &ClientId,
    ) -> Result<(), Error> {
        if !self.server_info.supports_feature(Extension::StartTls) {
            return Err(error::tls_required());
        }
        try_smtp!(self.command(Starttls).await, self);
        self.stream.get_mut().upgrade_tls(tls_parameters).await?;
        tracing::debug!("connection encrypted");
        // Send EHLO again
        self.ehlo(hello_name).await?;
        Ok(())
    }

    /// Send EHLO and update server info, falling back to HELO when the
    /// server permanently rejects EHLO
    async fn ehlo(&mut self, hello_name: &ClientId) -> Result<(), Error> {
        let ehlo_response = match self.command(Ehlo::new(hello_name.clone())).await {
            Ok(response) => response,
            Err(err) if err.is_permanent() => {
                try_smtp!(self.command(Helo::new(hello_name.clone())).await, self)
            }
            Err(err) => {
                self.abort().await;
                return Err(err);
            }
        };
        self.server_info = try_smtp!(ServerInfo::from_response(&ehlo_response), self);
        Ok(())
    }

    /// Ends the session politely; the connection is unusable afterwards
    pub async fn quit(&mut self) -> Result<Response, Error> {
        self.sent_quit = true;
        Ok(try_smtp!(self.command(Quit).await, self))
    }

    /// Closes the connection, sending QUIT first when still possible
    ///
    /// Idempotent; never fails.
    pub async fn abort(&mut self) {
        // Only try to quit if we are not already broken
        if !self.panic && !self.sent_quit {
            self.panic = true;
            self.sent_quit = true;
            let _ = self.command(Quit).await;
        }
        self.panic = true;
        let _ = self.stream.get_mut().close().await;
    }

    /// Tells if the underlying stream is currently encrypted
    pub fn is_encrypted(&self) -> bool {
        self.stream.get_ref().is_encrypted()
    }

    /// Checks if the server is connected using the NOOP SMTP command
    pub async fn test_connected(&mut self) -> bool {
        self.command(Noop).await.is_ok()
    }

    /// Resets the server transaction state, for connection reuse
    pub async fn rset(&mut self) -> Result<Response, Error> {
        self.command(Rset).await
    }

    /// A reply sitting in the buffer while no command is in flight
    ///
    /// Seen after a recycled transaction; the connection can no longer be
    /// trusted to match replies to commands.
    pub(crate) fn check_no_pending_reply(&mut self) -> Result<(), Error> {
        if self.stream.buffer().is_empty() {
            Ok(())
        } else {
            self.panic = true;
            Err(error::unexpected_reply(String::from_utf8_lossy(
                self.stream.buffer(),
            )
            .into_owned()))
        }
    }

    /// Runs the AUTH exchange, trying each candidate mechanism in order
    ///
    /// Returns the mechanism that succeeded so callers can remember it.
    pub async fn auth(
        &mut self,
        mechanisms: &[Mechanism],
        credentials: &Credentials,
    ) -> Result<Mechanism, Error> {
        let candidates = self.server_info.get_auth_mechanisms(mechanisms);
        if candidates.is_empty() {
            return Err(error::auth_failed(
                "no compatible authentication mechanism was found",
            ));
        }

        for mechanism in candidates {
            match self.auth_mechanism(mechanism, credentials).await {
                Ok(_) => return Ok(mechanism),
                Err(err) if err.is_permanent() => {
                    tracing::debug!("mechanism {} rejected, trying the next one", mechanism);
                }
                Err(err) => return Err(err),
            }
        }
        Err(error::auth_failed("all authentication mechanisms were rejected"))
    }

    /// Sends an AUTH command with the given mechanism, and handles the
    /// challenge loop if needed
    async fn auth_mechanism(
        &mut self,
        mechanism: Mechanism,
        credentials: &Credentials,
    ) -> Result<Response, Error> {
        // Limit challenges to avoid blocking
        let mut challenges: u8 = 10;
        let mut response = self
            .command_auth(Auth::new(mechanism, credentials.clone(), None)?)
            .await?;

        while challenges > 0 && response.has_code(334) {
            challenges -= 1;
            response = self
                .command_auth(Auth::new_from_response(
                    mechanism,
                    credentials.clone(),
                    &response,
                )?)
                .await?;
        }

        if challenges == 0 {
            Err(error::response("unexpected number of challenges"))
        } else {
            Ok(response)
        }
    }

    /// Sends the message content and the terminating dot
    pub async fn message(&mut self, mail: &EncodedPart) -> Result<Response, Error> {
        if let Err(err) = mail.write_to(self.stream.get_mut()).await {
            self.abort().await;
            return Err(error::body_write_failed(err));
        }
        if let Err(err) = self.write_raw(b"\r\n.\r\n").await {
            self.abort().await;
            return Err(error::body_write_failed(err));
        }
        Ok(try_smtp!(self.read_response_raw().await, self))
    }

    /// Sends an SMTP command, erroring on negative replies
    pub async fn command<C: Display>(&mut self, command: C) -> Result<Response, Error> {
        let response = self.command_raw(command).await?;
        if response.is_positive() {
            Ok(response)
        } else {
            Err(error::code(
                response.code(),
                response.first_line().map(ToOwned::to_owned),
            ))
        }
    }

    /// Sends an SMTP command and returns the reply whatever its code
    pub async fn command_raw<C: Display>(&mut self, command: C) -> Result<Response, Error> {
        self.write(command.to_string().as_bytes(), usize::MAX).await?;
        self.read_response_raw().await
    }

    /// Sends an AUTH command, masking secret material in the logs
    async fn command_auth(&mut self, command: Auth) -> Result<Response, Error> {
        let mask_from = command.log_mask_from();
        self.write(command.to_string().as_bytes(), mask_from).await?;
        let response = self.read_response_raw().await?;
        if response.is_positive() {
            Ok(response)
        } else {
            Err(error::code(
                response.code(),
                response.first_line().map(ToOwned::to_owned),
            ))
        }
    }

    /// Writes a group of commands as a single payload and reads one reply
    /// per command, matched positionally
    pub async fn pipeline<C: Display>(&mut self, commands: &[C]) -> Result<Vec<Response>, Error> {
        let mut payload = String::new();
        for command in commands {
            payload.push_str(&command.to_string());
        }
        self.write(payload.as_bytes(), usize::MAX).await?;

        let mut responses = Vec::with_capacity(commands.len());
        for _ in 0..commands.len() {
            responses.push(self.read_response_raw().await?);
        }
        Ok(responses)
    }

    /// Writes a string to the server
    async fn write(&mut self, string: &[u8], mask_from: usize) -> Result<(), Error> {
        self.write_raw(string).await?;
        tracing::debug!(
            "Wrote: {}",
            mask_secrets(&String::from_utf8_lossy(string), mask_from)
        );
        Ok(())
    }

    async fn write_raw(&mut self, string: &[u8]) -> Result<(), Error> {
        self.stream
            .get_mut()
            .write_all(string)
            .await
            .map_err(error::network)?;
        self.stream
            .get_mut()
            .flush()
            .await
            .map_err(error::network)
    }

    /// Gets the SMTP response, whatever its code
    pub async fn read_response_raw(&mut self) -> Result<Response, Error> {
        let mut buffer = String::with_capacity(100);

        while self
            .stream
            .read_line(&mut buffer)
            .await
            .map_err(error::network)?
            > 0
        {
            tracing::debug!("<< {}", escape_crlf(&buffer));
            match parse_response(&buffer) {
                Ok((_remaining, response)) => {
                    return Ok(response);
                }
                Err(nom::Err::Failure(e)) => {
                    return Err(error::response(e.to_string()));
                }
                Err(nom::Err::Incomplete(_)) => { /* read more */ }
                Err(nom::Err::Error(e)) => {
                    return Err(error::response(e.to_string()));
                }
            }
        }

        Err(error::response("incomplete response"))
    }
}
