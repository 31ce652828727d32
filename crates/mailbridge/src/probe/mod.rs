//! Login checks against SMTP and IMAP servers.

mod imap;
mod smtp;
mod stream;

use async_trait::async_trait;
use tracing::{debug, warn};

use mailbridge_core::{MailProbe, ProbeReport, ServerSettings};

/// Authenticates against the configured mail servers and logs out again.
#[derive(Debug, Clone, Copy, Default)]
pub struct ServerProbe;

#[async_trait]
impl MailProbe for ServerProbe {
    async fn test_send(
        &self,
        server: &ServerSettings,
        username: &str,
        password: &str,
    ) -> ProbeReport {
        report("SMTP", server, smtp::login(server, username, password).await)
    }

    async fn test_receive(
        &self,
        server: &ServerSettings,
        username: &str,
        password: &str,
    ) -> ProbeReport {
        report("IMAP", server, imap::login(server, username, password).await)
    }
}

fn report(kind: &str, server: &ServerSettings, outcome: anyhow::Result<String>) -> ProbeReport {
    match outcome {
        Ok(detail) => {
            debug!(host = %server.host, port = server.port, "{kind} login succeeded");
            ProbeReport::ok(detail)
        }
        Err(e) => {
            let detail = format!("{e:#}");
            warn!(host = %server.host, port = server.port, error = %detail, "{kind} login failed");
            ProbeReport::failed(detail)
        }
    }
}
