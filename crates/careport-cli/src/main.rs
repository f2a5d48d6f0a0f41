//! careport - command-line client for the careport telehealth portal.
//!
//! Logs in, keeps the session token alive across runs, and issues
//! authenticated requests against the portal backend.

use std::io::{self, Write};
use std::path::Path;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::Value;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use careport_core::config::API_URL_ENV;
use careport_core::{ApiError, ApiRequest, Config, Gateway};

/// File name prefix for the rolling log in `log_dir`
const LOG_FILE: &str = "careport.log";

/// Exit code when the session is gone and the user has to log in again
const EXIT_SESSION_EXPIRED: u8 = 2;

#[derive(Parser)]
#[command(name = "careport", version, about = "careport telehealth portal client")]
struct Cli {
    /// Backend URL, overriding the config file
    #[arg(long, env = API_URL_ENV)]
    api_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Log in and store the session
    Login {
        /// Account email; defaults to the last one used
        #[arg(long)]
        email: Option<String>,
    },
    /// Forget the stored session
    Logout,
    /// Show who is logged in and when the token expires
    Status,
    /// Ask the backend whether the stored session is still accepted
    Validate,
    /// Renew the session token now
    Refresh,
    /// Send a request through the gateway
    Request {
        #[arg(value_enum)]
        method: HttpMethod,
        /// Backend path, e.g. /api/patient/appointments
        path: String,
        /// JSON request body
        #[arg(long)]
        body: Option<String>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
}

/// Initialize the tracing subscriber for logging.
/// Use RUST_LOG to control the level (e.g. RUST_LOG=careport_core=debug).
fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(fmt::layer().with_ansi(false).with_writer(writer)), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();

    guard
}

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let mut config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            return ExitCode::FAILURE;
        }
    };
    if let Some(url) = cli.api_url.clone() {
        config.api_url = url;
    }

    let _guard = init_tracing(config.log_dir.as_deref());
    info!(api_url = %config.api_url, "careport starting");

    match run(cli.command, &config).await {
        Ok(code) => code,
        Err(e) => match e.downcast_ref::<ApiError>().and_then(ApiError::login_redirect) {
            Some(login_path) => {
                eprintln!("Session expired. Please log in again ({}).", login_path);
                ExitCode::from(EXIT_SESSION_EXPIRED)
            }
            None => {
                eprintln!("Error: {:#}", e);
                ExitCode::FAILURE
            }
        },
    }
}

async fn run(command: Commands, config: &Config) -> Result<ExitCode> {
    let gateway = Gateway::from_config(config)?;

    match command {
        Commands::Login { email } => cmd_login(&gateway, config, email).await?,
        Commands::Logout => {
            gateway.logout()?;
            println!("Logged out");
        }
        Commands::Status => cmd_status(&gateway),
        Commands::Validate => {
            if !gateway.validate_session().await {
                println!("Session is not valid");
                return Ok(ExitCode::FAILURE);
            }
            println!("Session is valid");
        }
        Commands::Refresh => {
            let role = gateway.store().role();
            match gateway.renewal().renew().await {
                Ok(record) => {
                    println!("Token refreshed for {}", record.user.email);
                    print_expiry(&gateway);
                }
                Err(e) => {
                    let login_path = role
                        .map(|r| r.login_path())
                        .unwrap_or_else(|| "/login/patient".to_string());
                    eprintln!("Token refresh failed: {}", e);
                    eprintln!("Please log in again ({}).", login_path);
                    return Ok(ExitCode::from(EXIT_SESSION_EXPIRED));
                }
            }
        }
        Commands::Request { method, path, body } => {
            cmd_request(&gateway, method, path, body.as_deref()).await?;
        }
    }

    Ok(ExitCode::SUCCESS)
}

async fn cmd_login(gateway: &Gateway, config: &Config, email: Option<String>) -> Result<()> {
    let email = match email.or_else(|| config.last_email.clone()) {
        Some(email) => email,
        None => prompt_email()?,
    };
    let password = rpassword::prompt_password(format!("Password for {}: ", email))?;

    let record = gateway.login(&email, &password).await?;

    if let Err(e) = Config::remember_email(&email) {
        tracing::warn!(error = %e, "Failed to save last email");
    }

    println!("Logged in as {} ({})", record.user.email, record.user.role);
    print_expiry(gateway);
    Ok(())
}

fn prompt_email() -> Result<String> {
    print!("Email: ");
    io::stdout().flush()?;

    let mut email = String::new();
    io::stdin().read_line(&mut email)?;
    Ok(email.trim().to_string())
}

fn cmd_status(gateway: &Gateway) {
    let store = gateway.store();
    match store.user() {
        Some(user) => {
            let name = if user.display_name.is_empty() { &user.email } else { &user.display_name };
            println!("User:    {} <{}>", name, user.email);
            println!("Role:    {}", user.role);
            println!("Valid:   {}", store.is_authenticated());
            if store.should_renew(None) {
                println!("Renewal: due");
            }
            print_expiry(gateway);
        }
        None => println!("Not logged in"),
    }
}

fn print_expiry(gateway: &Gateway) {
    if let Some(secs) = gateway.store().seconds_until_expiry() {
        if secs > 0 {
            println!("Expires: in {}m {}s", secs / 60, secs % 60);
        } else {
            println!("Expires: expired {}m ago", -secs / 60);
        }
    }
}

async fn cmd_request(
    gateway: &Gateway,
    method: HttpMethod,
    path: String,
    body: Option<&str>,
) -> Result<()> {
    let body: Option<Value> = body
        .map(|b| serde_json::from_str(b).context("Invalid JSON body"))
        .transpose()?;

    let payload = || body.clone().unwrap_or_else(|| serde_json::json!({}));
    let request = match method {
        HttpMethod::Get => ApiRequest::get(path),
        HttpMethod::Post => ApiRequest::post(path, payload()),
        HttpMethod::Put => ApiRequest::put(path, payload()),
        HttpMethod::Delete => ApiRequest::delete(path),
    };
    let request = match (method, body) {
        (HttpMethod::Delete, Some(body)) => request.with_body(body),
        _ => request,
    };

    let response = gateway.send(request).await?;
    match serde_json::from_str::<Value>(&response.body) {
        Ok(json) => println!("{}", serde_json::to_string_pretty(&json)?),
        Err(_) => println!("{}", response.body),
    }
    Ok(())
}
