//! Subcommand handlers.

use std::io::{self, Write};

use anyhow::{Context, Result};
use chrono::Local;
use serde_json::Value;
use tracing::warn;

use fitkit_core::{ApiError, Config, FitkitClient};

use crate::Command;

pub(crate) async fn run(
    command: Command,
    client: &FitkitClient,
    config: &mut Config,
) -> Result<()> {
    let result = match command {
        Command::Login { username } => login(client, config, username).await,
        Command::Register { username, email } => {
            let password = prompt_password("Password: ")?;
            let identity = client.register(&username, &email, &password).await?;
            remember_username(config, &username);
            println!(
                "Registered and logged in as {}",
                identity.map(|u| u.display_name()).unwrap_or(username)
            );
            Ok(())
        }
        Command::ResetPassword { username, code } => {
            let password = prompt_password("New password: ")?;
            client.reset_password_with_code(&username, &code, &password).await?;
            println!("Password updated. You can now log in.");
            Ok(())
        }
        Command::Logout => {
            client.logout();
            println!("Logged out");
            Ok(())
        }
        Command::Status => {
            status(client);
            Ok(())
        }
        Command::Me => {
            let me = client.me().await?;
            println!("{}", me.display_name());
            if let Some(joined) = me.date_joined {
                println!("Member since {}", joined);
            }
            Ok(())
        }
        Command::Stats => print_json(client.dashboard_stats().await),
        Command::Log { date } => {
            let date = date.unwrap_or_else(|| Local::now().date_naive());
            print_json(client.log_for_date(date).await)
        }
        Command::Journals { page, size } => print_json(client.recent_journals(page, size).await),
        Command::Audit { date, page, size } => {
            print_json(client.audit_log_for_date(date, page, size).await)
        }
        Command::RecoveryCodes => {
            let codes = client.generate_recovery_codes().await?;
            for code in &codes.codes {
                println!("{}", code);
            }
            if let Some(message) = codes.message {
                println!("\n{}", message);
            }
            Ok(())
        }
    };

    // Renewal failures already cleared the session; point the user at login.
    if let Err(ref e) = result {
        if let Some(api_error) = e.downcast_ref::<ApiError>() {
            if api_error.requires_login() {
                eprintln!("Your session has ended. Run `fitkit login` to sign in again.");
            }
        }
    }
    result
}

async fn login(client: &FitkitClient, config: &mut Config, username: Option<String>) -> Result<()> {
    let username = match username.or_else(|| config.last_username.clone()) {
        Some(username) => username,
        None => prompt("Username: ")?,
    };
    let password = prompt_password("Password: ")?;

    let identity = client.login(&username, &password).await?;
    remember_username(config, &username);
    println!(
        "Logged in as {}",
        identity.map(|u| u.display_name()).unwrap_or(username)
    );
    Ok(())
}

fn status(client: &FitkitClient) {
    let session = client.store().snapshot();
    if session.access_token.is_none() {
        println!("Not logged in");
        return;
    }
    match session.identity {
        Some(ref user) => println!("Logged in as {}", user.display_name()),
        None => println!("Logged in"),
    }
    if let Some(updated_at) = session.updated_at {
        println!("Session updated {}", updated_at.with_timezone(&Local).format("%Y-%m-%d %H:%M"));
    }
    if session.refresh_token.is_none() {
        println!("No refresh token stored; you will need to log in again when the session expires");
    }
}

fn remember_username(config: &mut Config, username: &str) {
    config.last_username = Some(username.to_string());
    if let Err(e) = config.save() {
        warn!(error = %e, "Failed to save config");
    }
}

fn print_json(result: Result<Value, ApiError>) -> Result<()> {
    let value = result?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

fn prompt(label: &str) -> Result<String> {
    print!("{}", label);
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().read_line(&mut line).context("Failed to read input")?;
    Ok(line.trim().to_string())
}

fn prompt_password(label: &str) -> Result<String> {
    rpassword::prompt_password(label).context("Failed to read password")
}
