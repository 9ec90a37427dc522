//! A trait to implement SMTP connections over plain TCP or TLS

use std::{
    io,
    net::SocketAddr,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf},
    net::{TcpStream, ToSocketAddrs},
};
use tokio_rustls::{client::TlsStream, TlsConnector};

use super::TlsParameters;
use crate::transport::smtp::error::{self, Error};

/// A network stream
#[allow(clippy::large_enum_variant)]
pub enum NetworkStream {
    /// Plain TCP stream
    Tcp(TcpStream),
    /// Encrypted TCP stream
    Tls(Box<TlsStream<TcpStream>>),
    /// Placeholder used during the in-place TLS upgrade; can't be read or
    /// written
    None,
}

impl NetworkStream {
    /// Returns peer's address
    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        match self {
            NetworkStream::Tcp(stream) => stream.peer_addr(),
            NetworkStream::Tls(stream) => stream.get_ref().0.peer_addr(),
            NetworkStream::None => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "no stream available",
            )),
        }
    }

    /// Opens a TCP or a TLS-wrapped connection, with an optional timeout
    pub async fn connect<T: ToSocketAddrs>(
        server: T,
        timeout: Option<Duration>,
        tls_parameters: Option<&TlsParameters>,
    ) -> Result<NetworkStream, Error> {
        let tcp_stream = match timeout {
            Some(duration) => tokio::time::timeout(duration, TcpStream::connect(server))
                .await
                .map_err(error::connection)?
                .map_err(error::connection)?,
            None => TcpStream::connect(server).await.map_err(error::connection)?,
        };

        let mut stream = NetworkStream::Tcp(tcp_stream);
        if let Some(tls_parameters) = tls_parameters {
            stream.upgrade_tls(tls_parameters).await?;
        }
        Ok(stream)
    }

    /// Upgrades the stream to TLS in place
    pub async fn upgrade_tls(&mut self, tls_parameters: &TlsParameters) -> Result<(), Error> {
        match std::mem::replace(self, NetworkStream::None) {
            NetworkStream::Tcp(stream) => {
                let connector = TlsConnector::from(tls_parameters.connector.clone());
                let server_name = tls_parameters.server_name()?;
                let tls_stream = connector
                    .connect(server_name, stream)
                    .await
                    .map_err(error::tls)?;
                *self = NetworkStream::Tls(Box::new(tls_stream));
                Ok(())
            }
            stream => {
                // already encrypted or broken, put it back untouched
                *self = stream;
                Ok(())
            }
        }
    }

    /// Tells whether the underlying stream is currently encrypted
    pub fn is_encrypted(&self) -> bool {
        matches!(self, NetworkStream::Tls(_))
    }

    /// Shuts down the write half of the stream
    pub async fn close(&mut self) -> io::Result<()> {
        match self {
            NetworkStream::Tcp(stream) => stream.shutdown().await,
            NetworkStream::Tls(stream) => stream.shutdown().await,
            NetworkStream::None => Ok(()),
        }
    }
}

impl AsyncRead for NetworkStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match Pin::get_mut(self) {
            NetworkStream::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
            NetworkStream::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
            NetworkStream::None => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "no stream available",
            ))),
        }
    }
}

impl AsyncWrite for NetworkStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match Pin::get_mut(self) {
            NetworkStream::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
            NetworkStream::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
            NetworkStream::None => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "no stream available",
            ))),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match Pin::get_mut(self) {
            NetworkStream::Tcp(stream) => Pin::new(stream).poll_flush(cx),
            NetworkStream::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
            NetworkStream::None => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match Pin::get_mut(self) {
            NetworkStream::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
            NetworkStream::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
            NetworkStream::None => Poll::Ready(Ok(())),
        }
    }
}
