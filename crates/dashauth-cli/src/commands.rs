//! Command parsing and handlers for the `dashauth` binary.

use std::io::{self, BufRead, Write};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Local, Utc};
use dashauth_core::{AuthState, Config, SessionManager};
use tracing::warn;

const ENV_IDENTIFIER: &str = "DASHAUTH_IDENTIFIER";
const ENV_PASSWORD: &str = "DASHAUTH_PASSWORD";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Login {
        identifier: Option<String>,
        remember: bool,
    },
    Logout,
    Status,
    Refresh,
    Token,
    Watch,
    Help,
}

impl Command {
    pub fn parse(args: &[String]) -> Result<Self> {
        let Some((name, rest)) = args.split_first() else {
            return Ok(Command::Status);
        };

        let command = match name.as_str() {
            "login" => {
                let mut identifier = None;
                let mut remember = false;
                for arg in rest {
                    match arg.as_str() {
                        "--remember" | "-r" => remember = true,
                        flag if flag.starts_with('-') => bail!("Unknown login option: {}", flag),
                        value if identifier.is_none() => identifier = Some(value.to_string()),
                        extra => bail!("Unexpected argument: {}", extra),
                    }
                }
                return Ok(Command::Login { identifier, remember });
            }
            "logout" => Command::Logout,
            "status" => Command::Status,
            "refresh" => Command::Refresh,
            "token" => Command::Token,
            "watch" => Command::Watch,
            "help" | "--help" | "-h" => Command::Help,
            other => bail!("Unknown command: {} (try `dashauth help`)", other),
        };

        if let Some(extra) = rest.first() {
            bail!("Unexpected argument: {}", extra);
        }
        Ok(command)
    }
}

pub fn print_usage() {
    println!("Usage: dashauth <command>");
    println!();
    println!("Commands:");
    println!("  login [identifier] [--remember]  Sign in (password from {} or prompt)", ENV_PASSWORD);
    println!("  logout                           Sign out and clear the stored session");
    println!("  status                           Show the current session (default)");
    println!("  refresh                          Refresh the access token now");
    println!("  token                            Print the access token");
    println!("  watch                            Keep the session alive until Ctrl+C");
}

pub async fn run(command: Command, manager: &SessionManager, config: &mut Config) -> Result<()> {
    match command {
        Command::Login { identifier, remember } => login(manager, config, identifier, remember).await,
        Command::Logout => {
            manager.logout().await;
            println!("Logged out");
            Ok(())
        }
        Command::Status => {
            print_status(manager);
            Ok(())
        }
        Command::Refresh => {
            if !manager.refresh_session().await {
                bail!("Refresh failed; you are now logged out");
            }
            print_status(manager);
            Ok(())
        }
        Command::Token => match manager.access_token() {
            Some(token) => {
                println!("{}", token);
                Ok(())
            }
            None => bail!("Not logged in"),
        },
        Command::Watch => watch(manager).await,
        Command::Help => {
            print_usage();
            Ok(())
        }
    }
}

async fn login(
    manager: &SessionManager,
    config: &mut Config,
    identifier: Option<String>,
    remember: bool,
) -> Result<()> {
    let identifier = match identifier
        .or_else(|| std::env::var(ENV_IDENTIFIER).ok())
        .filter(|s| !s.trim().is_empty())
    {
        Some(identifier) => identifier,
        None => prompt_identifier(config.last_identifier.as_deref())?,
    };

    let password = match std::env::var(ENV_PASSWORD) {
        Ok(password) if !password.is_empty() => password,
        _ => rpassword::prompt_password("Password: ").context("Failed to read password")?,
    };

    if !manager.login(&identifier, &password, remember).await {
        bail!("Login failed - check your credentials and the API URL");
    }

    config.last_identifier = Some(identifier);
    if let Err(e) = config.save() {
        warn!(error = %e, "Failed to save config");
    }

    if let Some(user) = manager.user() {
        println!("Logged in as {}", user.display_name());
    }
    Ok(())
}

fn prompt_identifier(last: Option<&str>) -> Result<String> {
    match last {
        Some(last) => print!("Email or username [{}]: ", last),
        None => print!("Email or username: "),
    }
    io::stdout().flush()?;

    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    let entered = line.trim();

    match (entered.is_empty(), last) {
        (false, _) => Ok(entered.to_string()),
        (true, Some(last)) => Ok(last.to_string()),
        (true, None) => bail!("An email or username is required"),
    }
}

fn local_time(at: DateTime<Utc>) -> String {
    at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string()
}

fn print_status(manager: &SessionManager) {
    let Some(info) = manager.session_info() else {
        println!("State:        {}", manager.state());
        return;
    };

    println!("State:        {}", manager.state());
    println!("User:         {} (id {})", info.user.display_name(), info.user.id);
    if let Some(ref role) = info.user.role {
        println!("Role:         {}", role);
    }
    println!(
        "Expires:      {} ({} min left)",
        local_time(info.expires_at),
        info.minutes_until_expiry()
    );
    match info.next_refresh_at {
        Some(at) => println!("Next refresh: {}", local_time(at)),
        None => println!("Next refresh: not scheduled"),
    }
    println!(
        "Refresh token: {}",
        if info.has_refresh_token { "yes" } else { "no (cookie session)" }
    );
    if let Some(at) = info.refresh_expires_at {
        println!("Refresh token expires: {}", local_time(at));
    }
}

async fn watch(manager: &SessionManager) -> Result<()> {
    if !manager.is_authenticated() {
        bail!("Not logged in - run `dashauth login` first");
    }

    let mut states = manager.subscribe();
    print_status(manager);
    println!("Watching session (Ctrl+C to stop)...");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("Stopped; session kept for next run");
                return Ok(());
            }
            changed = states.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
                let state = *states.borrow_and_update();
                println!("[{}] {}", Local::now().format("%H:%M:%S"), state);
                match state {
                    AuthState::Authenticated => print_status(manager),
                    AuthState::Anonymous => bail!("Session ended - log in again"),
                    AuthState::Refreshing => {}
                }
            }
        }
    }
}
