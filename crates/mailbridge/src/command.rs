//! Command-line parsing.

use anyhow::{Context, Result, bail};

use mailbridge_core::{AccountId, MailProvider, UserId};

pub const USAGE: &str = "\
Usage: mailbridge <command> [args]

Commands:
  init-key                           Generate a master key and store it in the OS keyring
  authorize <provider> <state>       Print the consent URL of an OAuth provider
  connect <user> <provider> <code>   Connect an OAuth mailbox from an authorization code
  accounts <user> [page] [limit]     List a user's accounts
  show <user> <account>              Show one account
  set-default <user> <account>       Make an account the user's default
  disconnect <user> <account>        Remove an account
  test <user> <account>              Test an account's credentials
  refresh <user>                     Refresh every stale token of a user
  cleanup [max-errors]               Delete deactivated accounts that kept failing

Configuration is read from MAILBRIDGE_* environment variables.";

/// A parsed invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    InitKey,
    Authorize {
        provider: MailProvider,
        state: String,
    },
    Connect {
        user: UserId,
        provider: MailProvider,
        code: String,
    },
    Accounts {
        user: UserId,
        page: u32,
        limit: u32,
    },
    Show(UserId, AccountId),
    SetDefault(UserId, AccountId),
    Disconnect(UserId, AccountId),
    Test(UserId, AccountId),
    Refresh(UserId),
    Cleanup(Option<u32>),
    Help,
}

impl Command {
    /// Parses arguments, excluding the program name.
    pub fn parse<I>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = String>,
    {
        let mut args = args.into_iter();
        let Some(name) = args.next() else {
            return Ok(Self::Help);
        };
        let rest: Vec<String> = args.collect();

        let command = match (name.as_str(), rest.as_slice()) {
            ("init-key", []) => Self::InitKey,
            ("authorize", [provider, state]) => Self::Authorize {
                provider: provider_arg(provider)?,
                state: state.clone(),
            },
            ("connect", [user, provider, code]) => Self::Connect {
                user: UserId::new(user.as_str()),
                provider: provider_arg(provider)?,
                code: code.clone(),
            },
            ("accounts", [user, paging @ ..]) if paging.len() <= 2 => Self::Accounts {
                user: UserId::new(user.as_str()),
                page: paging.first().map_or(Ok(1), |p| number_arg("page", p))?,
                limit: paging.get(1).map_or(Ok(20), |l| number_arg("limit", l))?,
            },
            ("show", [user, id]) => Self::Show(UserId::new(user.as_str()), account_arg(id)?),
            ("set-default", [user, id]) => {
                Self::SetDefault(UserId::new(user.as_str()), account_arg(id)?)
            }
            ("disconnect", [user, id]) => {
                Self::Disconnect(UserId::new(user.as_str()), account_arg(id)?)
            }
            ("test", [user, id]) => Self::Test(UserId::new(user.as_str()), account_arg(id)?),
            ("refresh", [user]) => Self::Refresh(UserId::new(user.as_str())),
            ("cleanup", []) => Self::Cleanup(None),
            ("cleanup", [max]) => Self::Cleanup(Some(number_arg("max-errors", max)?)),
            ("help" | "-h" | "--help", _) => Self::Help,
            (other, _) => bail!("unknown command or wrong arguments: {other}"),
        };
        Ok(command)
    }
}

fn provider_arg(value: &str) -> Result<MailProvider> {
    value
        .parse()
        .map_err(|_| anyhow::anyhow!("unknown provider: {value}"))
}

fn account_arg(value: &str) -> Result<AccountId> {
    value
        .parse()
        .map_err(|_| anyhow::anyhow!("invalid account ID: {value}"))
}

fn number_arg(name: &str, value: &str) -> Result<u32> {
    value
        .parse()
        .with_context(|| format!("{name} must be a non-negative number, got {value}"))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Command> {
        Command::parse(args.iter().map(ToString::to_string))
    }

    #[test]
    fn no_arguments_prints_help() {
        assert_eq!(parse(&[]).unwrap(), Command::Help);
        assert_eq!(parse(&["--help"]).unwrap(), Command::Help);
    }

    #[test]
    fn accounts_paging_defaults() {
        assert_eq!(
            parse(&["accounts", "alice"]).unwrap(),
            Command::Accounts {
                user: UserId::new("alice"),
                page: 1,
                limit: 20,
            }
        );
        assert_eq!(
            parse(&["accounts", "alice", "3", "50"]).unwrap(),
            Command::Accounts {
                user: UserId::new("alice"),
                page: 3,
                limit: 50,
            }
        );
        assert!(parse(&["accounts", "alice", "x"]).is_err());
        assert!(parse(&["accounts", "alice", "1", "2", "3"]).is_err());
    }

    #[test]
    fn account_commands_need_valid_ids() {
        let id = AccountId::generate();
        assert_eq!(
            parse(&["set-default", "alice", &id.to_string()]).unwrap(),
            Command::SetDefault(UserId::new("alice"), id)
        );
        assert!(parse(&["show", "alice", "not-an-id"]).is_err());
    }

    #[test]
    fn provider_names() {
        assert_eq!(
            parse(&["connect", "alice", "gmail", "4/0Ab"]).unwrap(),
            Command::Connect {
                user: UserId::new("alice"),
                provider: MailProvider::Gmail,
                code: "4/0Ab".into(),
            }
        );
        assert!(parse(&["authorize", "aol", "state"]).is_err());
    }

    #[test]
    fn cleanup_threshold_is_optional() {
        assert_eq!(parse(&["cleanup"]).unwrap(), Command::Cleanup(None));
        assert_eq!(parse(&["cleanup", "5"]).unwrap(), Command::Cleanup(Some(5)));
        assert!(parse(&["frobnicate"]).is_err());
    }
}
