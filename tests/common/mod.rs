//! In-process SMTP server for exercising the client against a real socket

#![allow(dead_code)]

use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    sync::Mutex,
};

/// Behavior knobs for one server instance
#[derive(Default, Clone)]
pub struct ServerOptions {
    /// Greeting line; defaults to a friendly 220
    pub greeting: Option<String>,
    /// Extra EHLO capability lines, e.g. `SIZE 1000` or `AUTH PLAIN`
    pub extensions: Vec<String>,
    /// Expected PLAIN credentials; any AUTH fails when they don't match
    pub plain_credentials: Option<(String, String)>,
    /// Recipients containing this string are rejected with 550
    pub reject_rcpt_containing: Option<String>,
    /// Reply 554 to the end-of-data dot
    pub reject_data: bool,
    /// Delay before answering the end-of-data dot
    pub data_delay: Option<Duration>,
}

/// One delivered message as the server saw it
pub struct ReceivedMessage {
    pub mail_from: String,
    pub rcpt_to: Vec<String>,
    /// Raw DATA payload as received (still dot-stuffed), without the
    /// terminating `.` line
    pub data: String,
}

pub struct ServerState {
    options: ServerOptions,
    pub connections: AtomicUsize,
    pub rset_count: AtomicUsize,
    pub auth_successes: AtomicUsize,
    pub messages: Mutex<Vec<ReceivedMessage>>,
}

pub struct MockSmtpServer {
    pub addr: SocketAddr,
    pub state: Arc<ServerState>,
}

/// Routes client wire logs to the console when RUST_LOG is set
pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });
}

impl MockSmtpServer {
    pub async fn start(options: ServerOptions) -> Self {
        init_tracing();
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock server");
        let addr = listener.local_addr().expect("local addr");
        let state = Arc::new(ServerState {
            options,
            connections: AtomicUsize::new(0),
            rset_count: AtomicUsize::new(0),
            auth_successes: AtomicUsize::new(0),
            messages: Mutex::new(Vec::new()),
        });

        let accept_state = Arc::clone(&state);
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                accept_state.connections.fetch_add(1, Ordering::SeqCst);
                let state = Arc::clone(&accept_state);
                tokio::spawn(async move {
                    let _ = handle_client(stream, state).await;
                });
            }
        });

        Self { addr, state }
    }

    pub async fn messages(&self) -> tokio::sync::MutexGuard<'_, Vec<ReceivedMessage>> {
        self.state.messages.lock().await
    }
}

async fn handle_client(stream: TcpStream, state: Arc<ServerState>) -> std::io::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let greeting = state
        .options
        .greeting
        .clone()
        .unwrap_or_else(|| "220 mock ESMTP ready".to_string());
    write_half.write_all(format!("{greeting}\r\n").as_bytes()).await?;
    if !greeting.starts_with("220") {
        return Ok(());
    }

    let mut mail_from = String::new();
    let mut rcpt_to: Vec<String> = Vec::new();

    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(());
        }
        let command = line.trim_end().to_string();
        let upper = command.to_ascii_uppercase();

        if upper.starts_with("EHLO") {
            let mut lines = vec!["mock".to_string()];
            lines.extend(state.options.extensions.iter().cloned());
            let last = lines.len() - 1;
            for (i, capability) in lines.iter().enumerate() {
                let sep = if i == last { ' ' } else { '-' };
                write_half
                    .write_all(format!("250{sep}{capability}\r\n").as_bytes())
                    .await?;
            }
        } else if upper.starts_with("HELO") {
            write_half.write_all(b"250 mock\r\n").await?;
        } else if upper.starts_with("AUTH PLAIN ") {
            let response = match &state.options.plain_credentials {
                Some((user, pass)) => {
                    let decoded = BASE64
                        .decode(command["AUTH PLAIN ".len()..].trim())
                        .unwrap_or_default();
                    let expected = format!("\0{user}\0{pass}").into_bytes();
                    if decoded == expected {
                        state.auth_successes.fetch_add(1, Ordering::SeqCst);
                        "235 2.7.0 authentication successful"
                    } else {
                        "535 5.7.8 authentication credentials invalid"
                    }
                }
                None => "535 5.7.8 authentication not enabled",
            };
            write_half.write_all(format!("{response}\r\n").as_bytes()).await?;
        } else if upper.starts_with("AUTH") {
            write_half
                .write_all(b"504 5.5.4 mechanism not supported\r\n")
                .await?;
        } else if upper.starts_with("MAIL FROM:") {
            mail_from = address_of(&command);
            rcpt_to.clear();
            write_half.write_all(b"250 2.1.0 sender ok\r\n").await?;
        } else if upper.starts_with("RCPT TO:") {
            let address = address_of(&command);
            let rejected = state
                .options
                .reject_rcpt_containing
                .as_ref()
                .is_some_and(|needle| address.contains(needle.as_str()));
            if rejected {
                write_half.write_all(b"550 5.1.1 no such user\r\n").await?;
            } else {
                rcpt_to.push(address);
                write_half.write_all(b"250 2.1.5 recipient ok\r\n").await?;
            }
        } else if upper == "DATA" {
            write_half
                .write_all(b"354 end data with <CR><LF>.<CR><LF>\r\n")
                .await?;
            let mut data = String::new();
            loop {
                let mut body_line = String::new();
                if reader.read_line(&mut body_line).await? == 0 {
                    return Ok(());
                }
                if body_line == ".\r\n" {
                    break;
                }
                data.push_str(&body_line);
            }
            if let Some(delay) = state.options.data_delay {
                tokio::time::sleep(delay).await;
            }
            if state.options.reject_data {
                write_half.write_all(b"554 5.3.0 transaction failed\r\n").await?;
            } else {
                state.messages.lock().await.push(ReceivedMessage {
                    mail_from: std::mem::take(&mut mail_from),
                    rcpt_to: std::mem::take(&mut rcpt_to),
                    data,
                });
                write_half.write_all(b"250 2.0.0 queued\r\n").await?;
            }
        } else if upper == "RSET" {
            state.rset_count.fetch_add(1, Ordering::SeqCst);
            mail_from.clear();
            rcpt_to.clear();
            write_half.write_all(b"250 2.0.0 ok\r\n").await?;
        } else if upper == "NOOP" {
            write_half.write_all(b"250 2.0.0 ok\r\n").await?;
        } else if upper == "QUIT" {
            write_half.write_all(b"221 2.0.0 bye\r\n").await?;
            return Ok(());
        } else {
            write_half.write_all(b"500 5.5.1 unknown command\r\n").await?;
        }
    }
}

fn address_of(command: &str) -> String {
    let start = command.find('<').map(|i| i + 1).unwrap_or(0);
    let end = command.find('>').unwrap_or(command.len());
    command[start..end].to_string()
}

/// Undoes SMTP transparency: one leading dot is removed from every line
/// that starts with one
pub fn unstuff(data: &str) -> String {
    data.split_inclusive("\r\n")
        .map(|line| line.strip_prefix('.').unwrap_or(line))
        .collect()
}

/// The received DATA payload without the CRLF the client appends before the
/// terminating dot
pub fn message_bytes(received: &ReceivedMessage) -> String {
    let data = unstuff(&received.data);
    data.strip_suffix("\r\n")
        .map(ToOwned::to_owned)
        .unwrap_or(data)
}
