//! DKIM signing tests: messages go through a real socket to the mock server
//! and the captured bytes are checked with an independent verifier

mod common;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rsa::{pkcs8::DecodePublicKey, Pkcs1v15Sign, RsaPublicKey};
use sha2::{Digest, Sha256};

use missive::{
    Canonicalization, DkimConfig, DkimSigningAlgorithm, DkimSigningKey, EncodedPart, Envelope,
    SmtpTransport,
};

use common::{message_bytes, MockSmtpServer, ReceivedMessage, ServerOptions};

// 1024-bit RSA test key pair, PKCS#8 private and SPKI public
const PRIVATE_KEY: &str = "MIICdgIBADANBgkqhkiG9w0BAQEFAASCAmAwggJcAgEAAoGBAKqSazYC8pj/JQmo\n\
    2ep0m3Shs6WGyHarknUzRJxiHWIVl2CvvOz2aCo4QCFk7nHjJbSQigA/xRrQ+Mzg\n\
    uNv4n/c+0MjMQscpyhrMYhza89jP3yMRjIEPJxiQzeMgGHTQifiBfB+2a8959YkB\n\
    oOJZuoY0TOEyB+Lm3j000B4evsRdAgMBAAECgYAdSw38dZ8iJVdABG6ANExqSEbo\n\
    22/b6XU6iXZ0AOmY6apYoXWpoFudPJHO6l2E04SrMNNyXYFFLLQ9wy4cIOOfs5yB\n\
    bdZ17tvOqSWT7nsCcuHpUvF89JNXnQvV2xwS6npp/tIuehMfxOxPLdN87Nge7BEy\n\
    6DCSW7U72pX9zjl1BQJBANv56R9X+XLWjW6n4s0tZ271XVYI4DlRxQHYHP3B7eLm\n\
    4DJtoHk65WU3kfHUeBNy/9TmpC25Gw6WTDco+mOS8wsCQQDGgVPCqhNDUcZYMeOH\n\
    X6hm+l8zBeTMF2udQbkl0dRdLFpbMtw3cg+WUjHg3AYv38P2ikSJZzgzdDyZzcxF\n\
    Hcc3AkBXoBNm8upg/mpUW/gSdzWuk3rcnKiE7LenZmkWBDw4mHNSYyz7XaSnTx2J\n\
    0XMLfFHAgyd/Ny85/lDZ4C7tn0nFAkEAkS2mz9lJa1PUZ05dZPWuGVqF47AszKNY\n\
    XlPiEGntEhPNJaQF8TsncT4+IoFouPzDun0XcRKfxOn/JFGiUu5bcwJAGbai+kPl\n\
    AoyfGLxOLu40IMNOHKhHOq8cm3dOC+HpQYpx96JGaQPY4kl3fos6e43DGp9vyOxv\n\
    VMj5fan+wzHLcw==";

const PUBLIC_KEY: &str = "MIGfMA0GCSqGSIb3DQEBAQUAA4GNADCBiQKBgQCqkms2AvKY/yUJqNnqdJt0obOl\
    hsh2q5J1M0ScYh1iFZdgr7zs9mgqOEAhZO5x4yW0kIoAP8Ua0PjM4Ljb+J/3PtDI\
    zELHKcoazGIc2vPYz98jEYyBDycYkM3jIBh00In4gXwftmvPefWJAaDiWbqGNEzh\
    Mgfi5t49NNAeHr7EXQIDAQAB";

const TEXT_BODY: &str = "This is a Multiple Lines Text\n\n.Some lines start with one dot\n\
    ..Some lines start with 2 dots.\n.\t..Some lines start with dot and HT.\n";

fn signing_key() -> DkimSigningKey {
    DkimSigningKey::from_pkcs8_base64(PRIVATE_KEY).unwrap()
}

fn dkim_config(header: Canonicalization, body: Canonicalization) -> DkimConfig {
    DkimConfig::new(
        "example.com",
        "lgao",
        signing_key(),
        DkimSigningAlgorithm::RsaSha256,
    )
    .identity("from@example.com")
    .header_canonicalization(header)
    .body_canonicalization(body)
}

fn example_message(subject: &str, body: &str) -> EncodedPart {
    EncodedPart::text(
        vec![
            ("From".to_string(), "from@example.com".to_string()),
            ("To".to_string(), "to@example.com".to_string()),
            ("Subject".to_string(), subject.to_string()),
        ],
        body,
    )
}

fn envelope() -> Envelope {
    Envelope::new(
        Some("from@example.com".parse().unwrap()),
        vec!["to@example.com".parse().unwrap()],
    )
    .unwrap()
}

async fn send_signed(configs: Vec<DkimConfig>, mut mail: EncodedPart) -> MockSmtpServer {
    let server = MockSmtpServer::start(ServerOptions::default()).await;
    let mut builder = SmtpTransport::builder_dangerous("127.0.0.1").port(server.addr.port());
    for config in configs {
        builder = builder.dkim_config(config);
    }
    let transport = builder.build().unwrap();
    transport.send(&envelope(), &mut mail).await.unwrap();
    server
}

// ------- independent verifier, reimplementing RFC 6376 section 3.4 -------

struct ParsedMessage {
    headers: Vec<(String, String)>,
    body: String,
}

fn parse_message(received: &ReceivedMessage) -> ParsedMessage {
    let payload = message_bytes(received);
    let (head, body) = payload.split_once("\r\n\r\n").expect("blank line");
    let headers = head
        .split("\r\n")
        .map(|line| {
            let (name, value) = line.split_once(": ").expect("header line");
            (name.to_string(), value.to_string())
        })
        .collect();
    ParsedMessage {
        headers,
        body: body.to_string(),
    }
}

fn verifier_canonical_header(name: &str, value: &str, relaxed: bool) -> String {
    if relaxed {
        let mut collapsed = String::new();
        let mut in_wsp = false;
        for c in value.chars() {
            if c == ' ' || c == '\t' || c == '\r' || c == '\n' {
                in_wsp = true;
            } else {
                if in_wsp && !collapsed.is_empty() {
                    collapsed.push(' ');
                }
                in_wsp = false;
                collapsed.push(c);
            }
        }
        format!("{}:{}", name.to_lowercase(), collapsed)
    } else {
        format!("{name}: {value}")
    }
}

fn verifier_canonical_body(body: &str, relaxed: bool) -> String {
    let mut lines: Vec<String> = body
        .split("\r\n")
        .map(|line| {
            if relaxed {
                let mut collapsed = String::new();
                let mut in_wsp = false;
                for c in line.chars() {
                    if c == ' ' || c == '\t' {
                        in_wsp = true;
                    } else {
                        if in_wsp && !collapsed.is_empty() {
                            collapsed.push(' ');
                        }
                        if in_wsp && collapsed.is_empty() {
                            collapsed.push(' ');
                        }
                        in_wsp = false;
                        collapsed.push(c);
                    }
                }
                collapsed
            } else {
                line.to_string()
            }
        })
        .collect();
    while lines.last().is_some_and(|line| line.is_empty()) {
        lines.pop();
    }
    if lines.is_empty() {
        return "\r\n".to_string();
    }
    let mut out = lines.join("\r\n");
    out.push_str("\r\n");
    out
}

fn tag_map(header_value: &str) -> Vec<(String, String)> {
    header_value
        .split(';')
        .filter(|part| !part.trim().is_empty())
        .map(|part| {
            let (name, value) = part.trim().split_once('=').expect("tag");
            (name.to_string(), value.to_string())
        })
        .collect()
}

fn get<'a>(tags: &'a [(String, String)], name: &str) -> &'a str {
    tags.iter()
        .find(|(n, _)| n == name)
        .map(|(_, v)| v.as_str())
        .unwrap_or_else(|| panic!("missing tag {name}"))
}

/// Full RFC 6376 verification of the first DKIM-Signature in the message,
/// given the matching public key record
fn verify_dkim(message: &ParsedMessage) {
    let dkim_headers: Vec<&(String, String)> = message
        .headers
        .iter()
        .filter(|(n, _)| n.eq_ignore_ascii_case("DKIM-Signature"))
        .collect();
    assert_eq!(dkim_headers.len(), 1, "exactly one signature expected");
    let signature_value = &dkim_headers[0].1;

    let tags = tag_map(signature_value);
    assert_eq!(get(&tags, "v"), "1");
    assert_eq!(get(&tags, "a"), "rsa-sha256");
    assert_eq!(get(&tags, "d"), "example.com");
    assert_eq!(get(&tags, "i"), "from@example.com");
    assert_eq!(get(&tags, "s"), "lgao");
    assert_eq!(get(&tags, "h"), "from:reply-to:subject:date:to:cc");

    let (header_canon, body_canon) = get(&tags, "c").split_once('/').unwrap();
    let relaxed_header = header_canon == "relaxed";
    let relaxed_body = body_canon == "relaxed";

    // body hash
    let canonical_body = verifier_canonical_body(&message.body, relaxed_body);
    let bh = BASE64.encode(Sha256::digest(canonical_body.as_bytes()));
    assert_eq!(get(&tags, "bh"), bh, "body hash mismatch");

    // header hash: signed headers in h= order, then the signature header
    // with the b= value removed
    let mut data = String::new();
    for name in get(&tags, "h").split(':') {
        for (header_name, value) in &message.headers {
            if header_name.eq_ignore_ascii_case(name) {
                data.push_str(&verifier_canonical_header(header_name, value, relaxed_header));
                data.push_str("\r\n");
            }
        }
    }
    let b_start = signature_value.find("; b=").expect("b= tag") + 4;
    let without_signature = &signature_value[..b_start];
    data.push_str(&verifier_canonical_header(
        "DKIM-Signature",
        without_signature,
        relaxed_header,
    ));

    let compact: String = PUBLIC_KEY.chars().filter(|c| !c.is_whitespace()).collect();
    let public_key =
        RsaPublicKey::from_public_key_der(&BASE64.decode(compact).unwrap()).unwrap();
    let signature = BASE64.decode(&signature_value[b_start..]).unwrap();
    public_key
        .verify(
            Pkcs1v15Sign::new::<Sha256>(),
            &Sha256::digest(data.as_bytes()),
            &signature,
        )
        .expect("signature must verify");
}

// ------------------------------ tests ------------------------------

#[tokio::test]
async fn relaxed_relaxed_plain_text() {
    let mail = example_message("relaxed/relaxed plain text email", "Message Body");
    let server = send_signed(
        vec![dkim_config(Canonicalization::Relaxed, Canonicalization::Relaxed)],
        mail,
    )
    .await;

    let messages = server.messages().await;
    let parsed = parse_message(&messages[0]);

    let signature = parsed
        .headers
        .iter()
        .find(|(n, _)| n == "DKIM-Signature")
        .map(|(_, v)| v.clone())
        .expect("signature header");
    let tags = tag_map(&signature);
    assert_eq!(get(&tags, "c"), "relaxed/relaxed");

    verify_dkim(&parsed);
}

#[tokio::test]
async fn simple_simple_multiline_body_with_dots() {
    let mail = example_message("simple/simple multi line email", TEXT_BODY);
    let server = send_signed(
        vec![dkim_config(Canonicalization::Simple, Canonicalization::Simple)],
        mail,
    )
    .await;

    let messages = server.messages().await;

    // transparency applied on the wire, one extra dot per dot-leading line
    let raw = &messages[0].data;
    assert!(raw.contains("\r\n..Some lines start with one dot\r\n"));
    assert!(raw.contains("\r\n...Some lines start with 2 dots.\r\n"));
    assert!(raw.contains("\r\n..\t..Some lines start with dot and HT.\r\n"));

    // the body hash covers the original bytes, not the stuffed ones
    let parsed = parse_message(&messages[0]);
    assert!(parsed.body.starts_with("This is a Multiple Lines Text"));
    assert!(parsed.body.contains("\r\n.Some lines start with one dot\r\n"));
    verify_dkim(&parsed);
}

#[tokio::test]
async fn simple_relaxed_and_relaxed_simple() {
    for (header, body) in [
        (Canonicalization::Simple, Canonicalization::Relaxed),
        (Canonicalization::Relaxed, Canonicalization::Simple),
    ] {
        let mail = example_message("mixed canonicalization", TEXT_BODY);
        let server = send_signed(vec![dkim_config(header, body)], mail).await;
        let messages = server.messages().await;
        verify_dkim(&parse_message(&messages[0]));
    }
}

#[tokio::test]
async fn multiple_configurations_emit_multiple_headers() {
    let mail = example_message("two signatures", "Message Body");
    let sha1_config = DkimConfig::new(
        "example.com",
        "legacy",
        signing_key(),
        DkimSigningAlgorithm::RsaSha1,
    )
    .identity("from@example.com");
    let server = send_signed(
        vec![
            dkim_config(Canonicalization::Relaxed, Canonicalization::Relaxed),
            sha1_config,
        ],
        mail,
    )
    .await;

    let messages = server.messages().await;
    let parsed = parse_message(&messages[0]);
    let signatures: Vec<&(String, String)> = parsed
        .headers
        .iter()
        .filter(|(n, _)| n == "DKIM-Signature")
        .collect();
    assert_eq!(signatures.len(), 2);

    // configuration order is preserved
    let first = tag_map(&signatures[0].1);
    let second = tag_map(&signatures[1].1);
    assert_eq!(get(&first, "s"), "lgao");
    assert_eq!(get(&first, "a"), "rsa-sha256");
    assert_eq!(get(&second, "s"), "legacy");
    assert_eq!(get(&second, "a"), "rsa-sha1");
}

#[tokio::test]
async fn enabling_dkim_without_configs_is_invalid() {
    let err = SmtpTransport::builder_dangerous("127.0.0.1")
        .enable_dkim(true)
        .build()
        .unwrap_err();
    assert!(err.is_config_invalid());
    assert_eq!(
        err.to_string(),
        "invalid configuration: PubSecKeyOptions must be specified to perform sign"
    );
}

#[tokio::test]
async fn streamed_attachment_is_hashed_and_sent() {
    // a restartable source lets the signer and the DATA pass both read it
    let attachment = EncodedPart::stream(
        vec![
            ("Content-Type".to_string(), "application/octet-stream".to_string()),
            ("Content-Transfer-Encoding".to_string(), "base64".to_string()),
        ],
        missive::BodySource::factory(None, || {
            Ok(Box::new(std::io::Cursor::new(b"YXR0YWNobWVudA==\r\n".to_vec())))
        }),
    );
    let mail = EncodedPart::multipart(
        vec![
            ("From".to_string(), "from@example.com".to_string()),
            ("To".to_string(), "to@example.com".to_string()),
            ("Subject".to_string(), "with attachment".to_string()),
            (
                "Content-Type".to_string(),
                "multipart/mixed; boundary=\"frontier\"".to_string(),
            ),
        ],
        "frontier",
        vec![
            EncodedPart::text(
                vec![("Content-Type".to_string(), "text/plain".to_string())],
                "see attachment\n",
            ),
            attachment,
        ],
    );

    let server = send_signed(
        vec![dkim_config(Canonicalization::Relaxed, Canonicalization::Relaxed)],
        mail,
    )
    .await;

    let messages = server.messages().await;
    let parsed = parse_message(&messages[0]);
    assert!(parsed.body.contains("--frontier\r\n"));
    assert!(parsed.body.contains("YXR0YWNobWVudA==\r\n"));
    assert!(parsed.body.contains("--frontier--\r\n"));
    verify_dkim(&parsed);
}
