//! SMTP login check: EHLO, optional STARTTLS, AUTH PLAIN, QUIT.

use anyhow::{Context, Result, bail};
use base64::Engine;
use tracing::debug;

use mailbridge_core::{Security, ServerSettings};

use super::stream::MailStream;

/// Name announced in EHLO.
const CLIENT_NAME: &str = "mailbridge.localhost";

/// Final line of a server reply.
#[derive(Debug)]
struct Reply {
    code: u16,
    text: String,
}

/// Authenticates with `username` and `password`.
pub async fn login(server: &ServerSettings, username: &str, password: &str) -> Result<String> {
    let mut stream = MailStream::connect(server).await?;
    expect(read_reply(&mut stream).await?, 220).context("unexpected greeting")?;
    command(&mut stream, &format!("EHLO {CLIENT_NAME}"), 250).await?;

    if server.security == Security::StartTls {
        command(&mut stream, "STARTTLS", 220).await?;
        stream = stream.upgrade(&server.host).await?;
        command(&mut stream, &format!("EHLO {CLIENT_NAME}"), 250).await?;
    }

    let token =
        base64::engine::general_purpose::STANDARD.encode(format!("\0{username}\0{password}"));
    command(&mut stream, &format!("AUTH PLAIN {token}"), 235)
        .await
        .context("authentication rejected")?;

    if let Err(e) = command(&mut stream, "QUIT", 221).await {
        debug!(host = %server.host, error = %e, "SMTP QUIT failed");
    }
    Ok(format!("authenticated with {}:{}", server.host, server.port))
}

async fn command(stream: &mut MailStream, line: &str, expected: u16) -> Result<Reply> {
    stream.write_line(line).await?;
    expect(read_reply(stream).await?, expected)
}

/// Reads a possibly multi-line reply (`250-...` continues, `250 ...` ends).
async fn read_reply(stream: &mut MailStream) -> Result<Reply> {
    loop {
        let line = stream.read_line().await?;
        let code = line
            .get(..3)
            .and_then(|code| code.parse().ok())
            .with_context(|| format!("malformed SMTP reply: {line}"))?;
        if line.as_bytes().get(3) != Some(&b'-') {
            return Ok(Reply {
                code,
                text: line.get(4..).unwrap_or_default().to_string(),
            });
        }
    }
}

fn expect(reply: Reply, expected: u16) -> Result<Reply> {
    if reply.code != expected {
        bail!("{} {}", reply.code, reply.text);
    }
    Ok(reply)
}
