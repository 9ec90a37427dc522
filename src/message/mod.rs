//! Encoded message model
//!
//! The MIME encoder lives outside this crate; it hands over an [`EncodedPart`]
//! tree whose leaves carry either an in-memory body or a byte stream, and
//! whose inner nodes carry a boundary and child parts. This module turns that
//! tree into the exact byte sequence written during `DATA`, and exposes the
//! same bytes (without transparency) to the DKIM signer.

pub mod dkim;

use std::{
    io,
    pin::Pin,
    sync::{Arc, Mutex as StdMutex},
    task::{Context, Poll},
};

use futures_util::{future::BoxFuture, FutureExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

use crate::transport::smtp::client::ClientCodec;

/// Prefix of the temp files used to replay non-restartable streams
const SPOOL_FILE_PREFIX: &str = "missive-spool-";

const COPY_BUF_SIZE: usize = 8 * 1024;

/// Whether dot-stuffing is applied while writing
enum Transparency {
    /// `DATA` pass: lines starting with a dot get the dot doubled
    DotStuffed(ClientCodec),
    /// Hashing pass: the bytes as they are before transparency
    Raw,
}

/// A message part ready for the wire
///
/// Headers keep their insertion order; the content is either a body, a
/// byte stream, or an ordered list of child parts with a boundary.
pub struct EncodedPart {
    headers: Vec<(String, String)>,
    content: PartContent,
}

enum PartContent {
    /// Wire-ready body bytes with CRLF line endings
    Body(Vec<u8>),
    /// Streamed body, e.g. a base64-encoded attachment
    Stream(BodySource),
    /// Child parts, each framed by the boundary
    Multipart {
        boundary: String,
        parts: Vec<EncodedPart>,
    },
}

impl EncodedPart {
    /// Creates a leaf part with a text body
    ///
    /// Line endings are normalized to CRLF, so the transmitted and signed
    /// bytes are the same whatever convention the encoder used.
    pub fn text(headers: Vec<(String, String)>, body: impl AsRef<str>) -> Self {
        Self {
            headers,
            content: PartContent::Body(normalize_crlf(body.as_ref())),
        }
    }

    /// Creates a leaf part with already-encoded body bytes
    ///
    /// The bytes go out verbatim and must use CRLF line endings, e.g. the
    /// 76-character base64 lines of an encoded attachment.
    pub fn binary(headers: Vec<(String, String)>, body: Vec<u8>) -> Self {
        Self {
            headers,
            content: PartContent::Body(body),
        }
    }

    /// Creates a leaf part streaming its body from a [`BodySource`]
    pub fn stream(headers: Vec<(String, String)>, source: BodySource) -> Self {
        Self {
            headers,
            content: PartContent::Stream(source),
        }
    }

    /// Creates a multipart node
    ///
    /// Children are framed with `--boundary` lines and closed with
    /// `--boundary--`, in the given order. Child bodies must end with CRLF
    /// so the boundary lands at the start of a line; text bodies always do
    /// after normalization.
    pub fn multipart(
        headers: Vec<(String, String)>,
        boundary: impl Into<String>,
        parts: Vec<EncodedPart>,
    ) -> Self {
        Self {
            headers,
            content: PartContent::Multipart {
                boundary: boundary.into(),
                parts,
            },
        }
    }

    /// The part headers, in insertion order
    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// First value of the named header, case-insensitive
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// All values of the named header, in appearance order
    pub fn header_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.headers
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Inserts headers at the top of the part, keeping their given order
    pub fn prepend_headers(&mut self, headers: Vec<(String, String)>) {
        let mut merged = headers;
        merged.append(&mut self.headers);
        self.headers = merged;
    }

    /// The `Message-ID` header value without its angle brackets
    pub fn message_id(&self) -> Option<&str> {
        self.header("Message-ID")
            .map(|value| value.trim().trim_start_matches('<').trim_end_matches('>'))
    }

    /// The exact number of bytes this part produces on the wire, headers
    /// included, before dot-stuffing
    ///
    /// `None` when a stream source has no declared size.
    pub fn size(&self) -> Option<u64> {
        let mut size: u64 = 0;
        for (name, value) in &self.headers {
            size += name.len() as u64 + 2 + value.len() as u64 + 2;
        }
        size += 2; // blank line after the headers
        match &self.content {
            PartContent::Body(body) => Some(size + body.len() as u64),
            PartContent::Stream(source) => source.declared_size.map(|s| size + s),
            PartContent::Multipart { boundary, parts } => {
                let boundary_line = boundary.len() as u64 + 4; // "--" + CRLF
                for part in parts {
                    size += boundary_line + part.size()?;
                }
                size += boundary_line + 2; // "--boundary--" + CRLF
                Some(size)
            }
        }
    }

    /// Materializes every single-shot stream in the tree so the body can be
    /// read more than once, in memory or in a tagged temp file
    pub(crate) fn cache_streams(&mut self, in_file: bool) -> BoxFuture<'_, io::Result<()>> {
        async move {
            match &mut self.content {
                PartContent::Stream(source) => source.ensure_restartable(in_file).await,
                PartContent::Multipart { parts, .. } => {
                    for part in parts {
                        part.cache_streams(in_file).await?;
                    }
                    Ok(())
                }
                PartContent::Body(_) => Ok(()),
            }
        }
        .boxed()
    }

    /// Writes the whole part (headers and body) dot-stuffed, as sent during
    /// `DATA`
    pub(crate) async fn write_to<W>(&self, out: &mut W) -> io::Result<()>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let mut transparency = Transparency::DotStuffed(ClientCodec::new());
        self.write_wire(out, &mut transparency).await
    }

    /// Writes the part body (everything after the top blank line) without
    /// transparency, as hashed by the DKIM signer
    pub(crate) async fn write_body_to<W>(&self, out: &mut W) -> io::Result<()>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let mut transparency = Transparency::Raw;
        self.write_content(out, &mut transparency).await
    }

    fn write_wire<'a, W>(
        &'a self,
        out: &'a mut W,
        transparency: &'a mut Transparency,
    ) -> BoxFuture<'a, io::Result<()>>
    where
        W: AsyncWrite + Unpin + Send,
    {
        async move {
            for (name, value) in &self.headers {
                emit(out, transparency, name.as_bytes()).await?;
                emit(out, transparency, b": ").await?;
                emit(out, transparency, value.as_bytes()).await?;
                emit(out, transparency, b"\r\n").await?;
            }
            emit(out, transparency, b"\r\n").await?;
            self.write_content(out, transparency).await
        }
        .boxed()
    }

    fn write_content<'a, W>(
        &'a self,
        out: &'a mut W,
        transparency: &'a mut Transparency,
    ) -> BoxFuture<'a, io::Result<()>>
    where
        W: AsyncWrite + Unpin + Send,
    {
        async move {
            match &self.content {
                PartContent::Body(body) => emit(out, transparency, body).await,
                PartContent::Stream(source) => {
                    let mut reader = source.open()?;
                    let mut buf = vec![0u8; COPY_BUF_SIZE];
                    loop {
                        let read = reader.read(&mut buf).await?;
                        if read == 0 {
                            break;
                        }
                        emit(out, transparency, &buf[..read]).await?;
                    }
                    Ok(())
                }
                PartContent::Multipart { boundary, parts } => {
                    for part in parts {
                        emit(out, transparency, format!("--{boundary}\r\n").as_bytes()).await?;
                        part.write_wire(out, transparency).await?;
                    }
                    emit(
                        out,
                        transparency,
                        format!("--{boundary}--\r\n").as_bytes(),
                    )
                    .await
                }
            }
        }
        .boxed()
    }
}

async fn emit<W>(out: &mut W, transparency: &mut Transparency, bytes: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin + Send,
{
    match transparency {
        Transparency::DotStuffed(codec) => {
            let mut buf = Vec::with_capacity(bytes.len() + 8);
            codec.encode(bytes, &mut buf);
            out.write_all(&buf).await
        }
        Transparency::Raw => out.write_all(bytes).await,
    }
}

/// Converts any line ending convention to CRLF and terminates the last line
fn normalize_crlf(body: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + 2);
    let mut bytes = body.bytes().peekable();
    while let Some(byte) = bytes.next() {
        match byte {
            b'\r' => {
                if bytes.peek() == Some(&b'\n') {
                    bytes.next();
                }
                out.extend_from_slice(b"\r\n");
            }
            b'\n' => out.extend_from_slice(b"\r\n"),
            other => out.push(other),
        }
    }
    if !out.is_empty() && !out.ends_with(b"\r\n") {
        out.extend_from_slice(b"\r\n");
    }
    out
}

type ReaderFactory =
    dyn Fn() -> io::Result<Box<dyn AsyncRead + Send + Unpin>> + Send + Sync + 'static;

/// A leaf part body delivered as bytes
///
/// Streamed attachments must be readable twice when DKIM signing is enabled
/// (once for the body hash, once for `DATA`); factory sources restart
/// naturally, single-shot readers get cached the first time around.
pub struct BodySource {
    kind: SourceKind,
    declared_size: Option<u64>,
}

enum SourceKind {
    /// Restartable: every call opens a fresh reader over the same bytes
    Factory(Arc<ReaderFactory>),
    /// Single-shot reader; usable once unless cached first
    Once(StdMutex<Option<Box<dyn AsyncRead + Send + Unpin>>>),
    /// Replayable cache, in memory or in a temp file
    Cached(BodyCache),
}

enum BodyCache {
    Memory(Vec<u8>),
    File(tempfile::NamedTempFile),
}

impl BodySource {
    /// A body held in memory
    pub fn memory(bytes: Vec<u8>) -> Self {
        let declared_size = Some(bytes.len() as u64);
        Self {
            kind: SourceKind::Cached(BodyCache::Memory(bytes)),
            declared_size,
        }
    }

    /// A restartable source: `factory` is called once per pass over the body
    pub fn factory<F>(declared_size: Option<u64>, factory: F) -> Self
    where
        F: Fn() -> io::Result<Box<dyn AsyncRead + Send + Unpin>> + Send + Sync + 'static,
    {
        Self {
            kind: SourceKind::Factory(Arc::new(factory)),
            declared_size,
        }
    }

    /// A single-shot reader
    ///
    /// Without a declared size the part has an unknown size and the client
    /// skips the SIZE pre-check.
    pub fn reader<R>(declared_size: Option<u64>, reader: R) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        Self {
            kind: SourceKind::Once(StdMutex::new(Some(Box::new(reader)))),
            declared_size,
        }
    }

    /// Drains a single-shot reader into a replayable cache
    async fn ensure_restartable(&mut self, in_file: bool) -> io::Result<()> {
        let mut reader = match &mut self.kind {
            SourceKind::Once(slot) => slot
                .get_mut()
                .expect("poisoned body source")
                .take()
                .ok_or_else(|| {
                    io::Error::new(io::ErrorKind::Other, "body stream already consumed")
                })?,
            _ => return Ok(()),
        };

        let cache = if in_file {
            let tmp = tempfile::Builder::new()
                .prefix(SPOOL_FILE_PREFIX)
                .tempfile()?;
            let mut file = tokio::fs::File::from_std(tmp.reopen()?);
            let copied = tokio::io::copy(&mut reader, &mut file).await?;
            file.flush().await?;
            self.declared_size.get_or_insert(copied);
            BodyCache::File(tmp)
        } else {
            let mut bytes = Vec::new();
            reader.read_to_end(&mut bytes).await?;
            self.declared_size.get_or_insert(bytes.len() as u64);
            BodyCache::Memory(bytes)
        };
        self.kind = SourceKind::Cached(cache);
        Ok(())
    }

    fn open(&self) -> io::Result<BodyReader<'_>> {
        match &self.kind {
            SourceKind::Factory(factory) => Ok(BodyReader::Boxed(factory()?)),
            SourceKind::Once(slot) => {
                let reader = slot
                    .lock()
                    .expect("poisoned body source")
                    .take()
                    .ok_or_else(|| {
                        io::Error::new(io::ErrorKind::Other, "body stream already consumed")
                    })?;
                Ok(BodyReader::Boxed(reader))
            }
            SourceKind::Cached(BodyCache::Memory(bytes)) => Ok(BodyReader::Slice(bytes)),
            SourceKind::Cached(BodyCache::File(tmp)) => {
                let file = tokio::fs::File::from_std(tmp.reopen()?);
                Ok(BodyReader::File(file))
            }
        }
    }
}

enum BodyReader<'a> {
    Slice(&'a [u8]),
    File(tokio::fs::File),
    Boxed(Box<dyn AsyncRead + Send + Unpin>),
}

impl AsyncRead for BodyReader<'_> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match Pin::get_mut(self) {
            BodyReader::Slice(slice) => Pin::new(slice).poll_read(cx, buf),
            BodyReader::File(file) => Pin::new(file).poll_read(cx, buf),
            BodyReader::Boxed(reader) => Pin::new(reader.as_mut()).poll_read(cx, buf),
        }
    }
}
