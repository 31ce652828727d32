//! `mailbridge` - administration of connected mailbox accounts
//!
//! Thin command-line front end over `mailbridge-core`.

#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

mod command;
mod probe;

use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mailbridge_core::{
    AccountManager, Config, CredentialCipher, EncryptionKey, ListRequest, OAuthConnection,
    load_encryption_key,
};

use command::{Command, USAGE};
use probe::ServerProbe;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mailbridge=info,mailbridge_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let command = Command::parse(std::env::args().skip(1))?;
    run(command).await
}

async fn run(command: Command) -> Result<()> {
    match command {
        Command::Help => {
            println!("{USAGE}");
            return Ok(());
        }
        Command::InitKey => {
            let key = EncryptionKey::generate();
            key.store_in_keyring()
                .context("failed to store the master key in the OS keyring")?;
            info!("Stored a new master key in the OS keyring");
            return Ok(());
        }
        _ => {}
    }

    let config = Config::from_env()?;
    let oauth = config.oauth_clients()?;

    if let Command::Authorize { provider, state } = &command {
        let url = oauth.authorization_url(*provider, state)?;
        println!("{url}");
        return Ok(());
    }

    let key = load_encryption_key()?
        .context("no master key: set MAILBRIDGE_ENCRYPTION_KEY or run `mailbridge init-key`")?;
    let manager = AccountManager::open(
        &config,
        CredentialCipher::new(&key),
        Arc::new(oauth),
        Arc::new(ServerProbe),
    )
    .await?;

    match command {
        Command::Connect {
            user,
            provider,
            code,
        } => {
            let connection = OAuthConnection {
                provider,
                code,
                display_name: None,
            };
            print_json(&manager.create_from_oauth(&user, connection).await?)
        }
        Command::Accounts { user, page, limit } => {
            let request = ListRequest {
                page,
                limit,
                ..ListRequest::default()
            };
            print_json(&manager.list(&user, request).await?)
        }
        Command::Show(user, id) => print_json(&manager.get_detail(&user, id).await?),
        Command::SetDefault(user, id) => print_json(&manager.set_default(&user, id).await?),
        Command::Disconnect(user, id) => {
            manager.disconnect(&user, id).await?;
            println!("disconnected {id}");
            Ok(())
        }
        Command::Test(user, id) => print_json(&manager.test_connection(&user, id).await?),
        Command::Refresh(user) => print_json(&manager.refresh_all_for_user(&user).await?),
        Command::Cleanup(max) => {
            let removed = manager
                .cleanup_failed_accounts(max.unwrap_or(config.max_error_count))
                .await?;
            println!("removed {removed} account(s)");
            Ok(())
        }
        Command::Help | Command::InitKey | Command::Authorize { .. } => Ok(()),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
