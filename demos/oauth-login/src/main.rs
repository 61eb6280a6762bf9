//! Claude subscription sign-in demo
//!
//! Signs in with OAuth + PKCE, keeps the session in the platform config
//! directory, and sends a message on the user's behalf.
//!
//! Run with:
//!   cargo run -p oauth-login -- login
//!   cargo run -p oauth-login -- ask "Explain photosynthesis to a 10 year old"
//!   cargo run -p oauth-login -- status
//!   cargo run -p oauth-login -- logout
//!
//! Set `RUST_LOG=anthropic_oauth_session=debug` to watch the flow.

use std::io::{BufRead, Write};
use std::sync::Arc;

use anthropic_oauth_session::auth::RedirectParams;
use anthropic_oauth_session::types::{ChatMessage, MessageRequest};
use anthropic_oauth_session::{OAuthClient, OAuthConfig, SessionEvent};
use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use console::style;

/// Sign in with a Claude subscription
#[derive(Parser, Debug)]
#[command(name = "oauth-login")]
#[command(about = "Sign in with a Claude subscription and send messages")]
struct Args {
    /// Do not try to open a browser during login
    #[arg(long)]
    no_browser: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the sign-in flow
    Login,
    /// Show the current session
    Status,
    /// Send one message
    Ask {
        /// Prompt text
        prompt: String,
        /// Model to use
        #[arg(long, default_value = "claude-sonnet-4-5")]
        model: String,
    },
    /// Sign out and clear stored credentials
    Logout,
}

/// Open URL in default browser
fn open_browser(url: &str) -> std::io::Result<()> {
    #[cfg(target_os = "macos")]
    std::process::Command::new("open").arg(url).spawn()?;

    #[cfg(target_os = "linux")]
    std::process::Command::new("xdg-open").arg(url).spawn()?;

    #[cfg(target_os = "windows")]
    std::process::Command::new("cmd")
        .args(["/C", "start", "", url])
        .spawn()?;

    Ok(())
}

/// Prompt for the `code#state` text shown by the callback page
fn prompt_for_code() -> anyhow::Result<RedirectParams> {
    print!("Paste the authorization code (or 'cancel' to abort): ");
    std::io::stdout().flush()?;

    let mut input = String::new();
    std::io::stdin().lock().read_line(&mut input)?;
    let input = input.trim();
    if input.is_empty() || input.eq_ignore_ascii_case("cancel") {
        bail!("sign-in cancelled");
    }
    Ok(RedirectParams::from_pasted(input))
}

async fn login(client: &OAuthClient, open: bool) -> anyhow::Result<()> {
    if client.is_authenticated() {
        println!("{} Already signed in", style("✓").green());
        return Ok(());
    }

    let url = client.start_flow()?;
    println!();
    println!("{}", style("Claude sign-in").cyan().bold());
    println!("  1. Open the URL below and sign in");
    println!("  2. Copy the code shown after approval");
    println!("  3. Paste it here");
    println!();
    println!("  {url}");
    println!();

    if open {
        if let Err(e) = open_browser(&url) {
            tracing::debug!("Could not open browser: {e}");
            println!("(Could not open a browser - please open the URL manually)");
        }
    }

    let params = prompt_for_code()?;
    let code = params.code.unwrap_or_default();
    let Some(state) = params.state else {
        bail!("expected the code in `code#state` form, as shown on the callback page");
    };

    let session = client.handle_callback(&code, &state).await?;
    println!();
    println!(
        "{} Signed in (session {})",
        style("✓").green(),
        style(session.session_id.as_str()).dim()
    );
    Ok(())
}

fn status(client: &OAuthClient) {
    match client.session_state() {
        Some(state) if client.is_authenticated() => {
            println!("{} Signed in", style("●").green());
            println!("  session:  {}", state.session_id);
            if let Some(expiry) = state.token_expiry {
                println!("  token expires at (unix ms): {expiry}");
            }
            if let Some(profile) = state.user_info {
                println!("  profile:  {profile}");
            }
        }
        _ => println!("{} Not signed in", style("○").dim()),
    }
}

async fn ask(client: &OAuthClient, prompt: String, model: String) -> anyhow::Result<()> {
    if !client.is_authenticated() {
        bail!("not signed in; run `oauth-login login` first");
    }
    let request = MessageRequest::builder()
        .model(model)
        .messages(vec![ChatMessage::user(prompt)])
        .build();
    let reply = client
        .send_message(&request)
        .await
        .context("message request failed")?;
    println!("{}", reply.text());
    println!(
        "{}",
        style(format!(
            "[{} in / {} out tokens]",
            reply.usage.input_tokens, reply.usage.output_tokens
        ))
        .dim()
    );
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let client = OAuthClient::builder()
        .config(OAuthConfig::from_env())
        .listener(Arc::new(|event: &SessionEvent| {
            tracing::info!(event = event.name(), "Session event");
        }))
        .build();

    match args.command {
        Command::Login => login(&client, !args.no_browser).await?,
        Command::Status => status(&client),
        Command::Ask { prompt, model } => ask(&client, prompt, model).await?,
        Command::Logout => {
            client.logout();
            println!("{} Signed out", style("✓").green());
        }
    }
    Ok(())
}
