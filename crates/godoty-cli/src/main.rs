//! godoty-account - terminal front end for godoty accounts.
//!
//! Sign in, check the credit balance, fetch the virtual key used for model
//! access, and buy credits, all from the command line.

use std::io::{self, Write};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Local;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use godoty_core::auth::SignUpOutcome;
use godoty_core::{Account, AccountSnapshot, AuthPhase, Config, Redirect};

// ============================================================================
// Constants
// ============================================================================

/// How long to wait for the provider to report a new session after sign-in
const SIGN_IN_TIMEOUT: Duration = Duration::from_secs(15);

/// Log file prefix inside `<cache_dir>/logs`
const LOG_FILE: &str = "godoty-account.log";

const USAGE: &str = "\
Usage: godoty-account <command> [args]

Commands:
  status               Show sign-in state and balance
  login [email]        Sign in with email and password
  signup <email>       Create an account
  magic-link <email>   Email a sign-in link
  oauth <provider>     Sign in with an OAuth provider (github, google, ...)
  callback <url>       Finish an OAuth or magic-link sign-in
  logout               Sign out and forget the virtual key
  balance              Refresh and show the credit balance
  key [--refresh]      Print the virtual key, issuing one if needed
  buy <price-id>       Open checkout for a credit pack
  watch                Print balance changes until Ctrl-C";

/// Prints URLs for the user to open.
struct PrintRedirect;

impl Redirect for PrintRedirect {
    fn open(&self, url: &str) -> Result<()> {
        eprintln!("Open this URL in your browser:");
        println!("{}", url);
        Ok(())
    }
}

/// Initialize the tracing subscriber: stderr plus a daily log file.
/// The returned guard must live until exit or buffered lines are lost.
fn init_tracing(config: &Config) -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let log_dir = config
        .cache_dir()
        .ok()
        .map(|dir| dir.join("logs"))
        .filter(|dir| std::fs::create_dir_all(dir).is_ok());

    match log_dir {
        Some(dir) => {
            let (writer, guard) =
                tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, LOG_FILE));
            tracing_subscriber::registry()
                .with(fmt::layer().with_writer(io::stderr))
                .with(fmt::layer().with_writer(writer).with_ansi(false))
                .with(filter)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(fmt::layer().with_writer(io::stderr))
                .with(filter)
                .init();
            None
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first().map(String::as_str) else {
        println!("{}", USAGE);
        return Ok(());
    };
    if matches!(command, "-h" | "--help" | "help") {
        println!("{}", USAGE);
        return Ok(());
    }

    let mut config = Config::load().context("Failed to load config")?;
    let _log_guard = init_tracing(&config);
    info!(command, "godoty-account starting");

    let account = Account::from_config(&config, Arc::new(PrintRedirect))?;
    account.session().init().await;

    let result = run(&account, &mut config, command, &args[1..]).await;
    account.session().shutdown();
    result
}

async fn run(account: &Account, config: &mut Config, command: &str, rest: &[String]) -> Result<()> {
    let arg = rest.first().map(String::as_str);

    match command {
        "status" => {
            print_status(&account.store().snapshot());
        }
        "login" => {
            let email = match arg {
                Some(email) => email.to_string(),
                None => prompt_email(config.last_email.as_deref())?,
            };
            let password = rpassword::prompt_password("Password: ")?;
            account.session().sign_in_with_password(&email, &password).await?;
            let snapshot = wait_for_sign_in(account).await?;
            remember_email(config, &email);
            println!("Signed in as {}", describe_user(&snapshot));
        }
        "signup" => {
            let email = required(arg, "signup <email>")?;
            let password = rpassword::prompt_password("Choose a password: ")?;
            match account.session().sign_up(email, &password).await? {
                SignUpOutcome::ConfirmationSent => {
                    println!("Check {} for a confirmation link, then run `callback <url>`", email)
                }
                SignUpOutcome::SignedIn(_) => {
                    let snapshot = wait_for_sign_in(account).await?;
                    println!("Account created, signed in as {}", describe_user(&snapshot));
                }
            }
            remember_email(config, email);
        }
        "magic-link" => {
            let email = required(arg, "magic-link <email>")?;
            account.session().sign_in_with_magic_link(email).await?;
            remember_email(config, email);
            println!("Sign-in link sent to {}", email);
            println!("Open it, then run `godoty-account callback <url>` with the address it lands on");
        }
        "oauth" => {
            let provider = required(arg, "oauth <provider>")?;
            account.session().sign_in_with_oauth(provider).await?;
            eprintln!("After signing in, run `godoty-account callback <url>` with the redirect address");
        }
        "callback" => {
            let url = required(arg, "callback <url>")?;
            account.session().complete_redirect(url).await?;
            let snapshot = wait_for_sign_in(account).await?;
            println!("Signed in as {}", describe_user(&snapshot));
        }
        "logout" => {
            if !account.store().snapshot().is_authenticated() {
                println!("Not signed in");
                return Ok(());
            }
            account.session().sign_out().await?;
            println!("Signed out");
        }
        "balance" => {
            require_sign_in(account)?;
            account.credits().fetch_balance().await;
            println!("{}", format_credits(account.store().snapshot().balance));
        }
        "key" => {
            let refresh = rest.iter().any(|a| a == "--refresh");
            let key = account.keys().generate_key(refresh).await?;
            eprintln!(
                "Expires {} (refresh due in {} min)",
                key.expires_at.with_timezone(&Local).format("%Y-%m-%d %H:%M"),
                key.minutes_until_refresh()
            );
            if let Some(balance) = key.remaining_balance() {
                eprintln!("Remaining: {}", format_credits(balance));
            }
            println!("{}", key.token);
        }
        "buy" => {
            let price_id = required(arg, "buy <price-id>")?;
            account.checkout().purchase_credits(price_id).await?;
            eprintln!("Your balance updates once payment completes (see `godoty-account watch`)");
        }
        "watch" => {
            require_sign_in(account)?;
            watch_balance(account).await?;
        }
        other => {
            eprintln!("Unknown command: {}\n", other);
            println!("{}", USAGE);
        }
    }

    Ok(())
}

fn required<'a>(arg: Option<&'a str>, usage: &str) -> Result<&'a str> {
    arg.ok_or_else(|| anyhow::anyhow!("Usage: godoty-account {}", usage))
}

fn require_sign_in(account: &Account) -> Result<()> {
    if account.store().snapshot().is_authenticated() {
        Ok(())
    } else {
        anyhow::bail!("Not signed in. Run `godoty-account login` first.")
    }
}

fn prompt_email(default: Option<&str>) -> Result<String> {
    match default {
        Some(email) => eprint!("Email [{}]: ", email),
        None => eprint!("Email: "),
    }
    io::stderr().flush()?;

    let mut line = String::new();
    io::stdin().read_line(&mut line)?;
    let line = line.trim();
    match (line.is_empty(), default) {
        (false, _) => Ok(line.to_string()),
        (true, Some(email)) => Ok(email.to_string()),
        (true, None) => anyhow::bail!("Email is required"),
    }
}

fn remember_email(config: &mut Config, email: &str) {
    if config.last_email.as_deref() == Some(email) {
        return;
    }
    config.last_email = Some(email.to_string());
    if let Err(e) = config.save() {
        tracing::warn!(error = %e, "Failed to save config");
    }
}

/// Sign-in calls return before the session is applied; wait for the
/// provider's event to land in the store.
async fn wait_for_sign_in(account: &Account) -> Result<AccountSnapshot> {
    let mut rx = account.store().watch();
    let snapshot = tokio::time::timeout(SIGN_IN_TIMEOUT, rx.wait_for(|s| s.is_authenticated()))
        .await
        .context("Timed out waiting for sign-in")?
        .context("Account state closed")?
        .clone();
    Ok(snapshot)
}

async fn watch_balance(account: &Account) -> Result<()> {
    let mut rx = account.store().watch();
    let mut last = rx.borrow_and_update().balance;
    println!("{}  {}", Local::now().format("%H:%M:%S"), format_credits(last));
    eprintln!("Watching for balance changes, Ctrl-C to stop");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = rx.borrow_and_update().clone();
                if !snapshot.is_authenticated() {
                    eprintln!("Signed out");
                    break;
                }
                if snapshot.balance != last {
                    last = snapshot.balance;
                    println!("{}  {}", Local::now().format("%H:%M:%S"), format_credits(last));
                }
            }
        }
    }
    Ok(())
}

fn print_status(snapshot: &AccountSnapshot) {
    match snapshot.phase {
        AuthPhase::Authenticated => {
            println!("Signed in as {}", describe_user(snapshot));
            println!("Balance:  {}", format_credits(snapshot.balance));
            println!(
                "Realtime: {}",
                if snapshot.subscribed { "connected" } else { "not connected" }
            );
        }
        AuthPhase::Authenticating => println!("Signing in..."),
        AuthPhase::Unauthenticated => println!("Not signed in"),
    }
    if let Some(ref error) = snapshot.last_error {
        println!("Last error: {}", error);
    }
}

fn describe_user(snapshot: &AccountSnapshot) -> String {
    match (&snapshot.email, &snapshot.user_id) {
        (Some(email), _) => email.clone(),
        (None, Some(id)) => id.clone(),
        (None, None) => "unknown user".to_string(),
    }
}

fn format_credits(balance: f64) -> String {
    format!("${:.2}", balance)
}
