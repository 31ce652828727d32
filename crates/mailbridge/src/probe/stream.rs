//! Plain and TLS connections to mail servers.

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use rustls::pki_types::ServerName;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;

use mailbridge_core::{Security, ServerSettings};

/// Line-oriented connection to a mail server.
#[derive(Debug)]
pub enum MailStream {
    /// Plain TCP, before STARTTLS or for unencrypted servers.
    Plain(BufReader<TcpStream>),
    /// TLS-encrypted connection (boxed to reduce enum size).
    Tls(Box<BufReader<TlsStream<TcpStream>>>),
}

impl MailStream {
    /// Connects to `server`; implicit TLS is negotiated right away.
    pub async fn connect(server: &ServerSettings) -> Result<Self> {
        let tcp = TcpStream::connect((server.host.as_str(), server.port))
            .await
            .with_context(|| format!("cannot reach {}:{}", server.host, server.port))?;
        let stream = Self::Plain(BufReader::new(tcp));
        match server.security {
            Security::Tls => stream.upgrade(&server.host).await,
            Security::StartTls | Security::None => Ok(stream),
        }
    }

    /// Wraps a plain connection in TLS.
    pub async fn upgrade(self, host: &str) -> Result<Self> {
        let Self::Plain(reader) = self else {
            bail!("connection is already encrypted");
        };
        let server_name = ServerName::try_from(host.to_string())
            .with_context(|| format!("invalid server name {host}"))?;
        let tls = connector()?
            .connect(server_name, reader.into_inner())
            .await
            .with_context(|| format!("TLS handshake with {host} failed"))?;
        Ok(Self::Tls(Box::new(BufReader::new(tls))))
    }

    /// Reads one line without its terminator.
    pub async fn read_line(&mut self) -> Result<String> {
        let mut line = String::new();
        let read = match self {
            Self::Plain(reader) => reader.read_line(&mut line).await?,
            Self::Tls(reader) => reader.read_line(&mut line).await?,
        };
        if read == 0 {
            bail!("server closed the connection");
        }
        Ok(line.trim_end().to_string())
    }

    /// Writes `line` followed by CRLF.
    pub async fn write_line(&mut self, line: &str) -> Result<()> {
        let data = format!("{line}\r\n");
        match self {
            Self::Plain(reader) => {
                reader.get_mut().write_all(data.as_bytes()).await?;
                reader.get_mut().flush().await?;
            }
            Self::Tls(reader) => {
                reader.get_mut().write_all(data.as_bytes()).await?;
                reader.get_mut().flush().await?;
            }
        }
        Ok(())
    }
}

/// TLS connector trusting the bundled web PKI roots.
fn connector() -> Result<TlsConnector> {
    let roots = rustls::RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    };
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .context("unsupported TLS configuration")?
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(TlsConnector::from(Arc::new(config)))
}
