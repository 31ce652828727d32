//! IMAP login check: optional STARTTLS, LOGIN, LOGOUT.

use anyhow::{Context, Result, bail};
use tracing::debug;

use mailbridge_core::{Security, ServerSettings};

use super::stream::MailStream;

/// Logs in with `username` and `password`.
pub async fn login(server: &ServerSettings, username: &str, password: &str) -> Result<String> {
    let mut stream = MailStream::connect(server).await?;
    let greeting = stream.read_line().await?;
    if !greeting.starts_with("* OK") {
        bail!("unexpected greeting: {greeting}");
    }

    if server.security == Security::StartTls {
        tagged(&mut stream, "a1", "STARTTLS").await?;
        stream = stream.upgrade(&server.host).await?;
    }

    let login = format!("LOGIN {} {}", quote(username)?, quote(password)?);
    tagged(&mut stream, "a2", &login)
        .await
        .context("login rejected")?;

    if let Err(e) = tagged(&mut stream, "a3", "LOGOUT").await {
        debug!(host = %server.host, error = %e, "IMAP LOGOUT failed");
    }
    Ok(format!("logged in to {}:{}", server.host, server.port))
}

/// Sends a tagged command and waits for its completion.
async fn tagged(stream: &mut MailStream, tag: &str, command: &str) -> Result<()> {
    stream.write_line(&format!("{tag} {command}")).await?;
    loop {
        let line = stream.read_line().await?;
        let Some(status) = line.strip_prefix(tag).and_then(|rest| rest.strip_prefix(' ')) else {
            continue;
        };
        if status.starts_with("OK") {
            return Ok(());
        }
        bail!("{status}");
    }
}

/// Encodes `value` as an IMAP quoted string.
fn quote(value: &str) -> Result<String> {
    if value.contains(['\r', '\n']) {
        bail!("credentials contain a line break");
    }
    let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
    Ok(format!("\"{escaped}\""))
}
