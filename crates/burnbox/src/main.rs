use std::io::Read;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use reqwest::Client;
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;

// ── CLI definition ─────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "burnbox", about = "Burnbox — passphrase-sealed, read-once secrets", version)]
struct Cli {
    /// Burnbox server URL (default: http://localhost:8080 or $BURNBOX_SERVER)
    #[arg(long, env = "BURNBOX_SERVER", default_value = "http://localhost:8080")]
    server: String,

    /// Bearer token for server auth ($BURNBOX_TOKEN)
    #[arg(long, env = "BURNBOX_TOKEN")]
    token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the Burnbox HTTP server
    Serve {
        /// Port to listen on (default: $BURNBOX_PORT or 8080)
        #[arg(long, env = "BURNBOX_PORT", default_value = "8080")]
        port: u16,
        /// Host to bind (default: $BURNBOX_HOST or 0.0.0.0)
        #[arg(long, env = "BURNBOX_HOST", default_value = "0.0.0.0")]
        host: String,
        /// Keep secrets in memory only
        #[arg(long)]
        ephemeral: bool,
    },
    /// Seal a secret and print its one-time key
    Generate {
        /// Secret text, or `-` to read it from stdin
        secret: String,
        /// Passphrase needed to open the secret
        #[arg(long, env = "BURNBOX_PASSPHRASE")]
        passphrase: String,
    },
    /// Open a secret by key (it is destroyed on success)
    Get {
        /// Secret key returned by `generate`
        key: String,
        /// Passphrase the secret was sealed with
        #[arg(long, env = "BURNBOX_PASSPHRASE")]
        passphrase: String,
    },
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = match cli.command {
        Commands::Serve { .. } => "info",
        _ => "warn",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("BURNBOX_LOG_LEVEL")
                .unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    match cli.command {
        Commands::Serve {
            port,
            host,
            ephemeral,
        } => cmd_serve(host, port, ephemeral).await,

        Commands::Generate { secret, passphrase } => {
            let secret = if secret == "-" {
                read_stdin()?
            } else {
                secret
            };
            cmd_generate(&cli.server, cli.token.as_deref(), &secret, &passphrase).await
        }

        Commands::Get { key, passphrase } => {
            cmd_get(&cli.server, cli.token.as_deref(), &key, &passphrase).await
        }
    }
}

// ── Command implementations ───────────────────────────────────────────────────

async fn cmd_serve(host: String, port: u16, ephemeral: bool) -> Result<()> {
    let cfg = burnbox_server::ServerConfig {
        host,
        port,
        ephemeral,
        ..Default::default()
    };

    burnbox_server::run(cfg).await
}

async fn cmd_generate(
    server: &str,
    token: Option<&str>,
    secret: &str,
    passphrase: &str,
) -> Result<()> {
    let body = json!({ "secret": secret, "passphrase": passphrase });
    let json = post_json(server, token, "/generate", &body).await?;
    let key = json["secret_key"]
        .as_str()
        .context("response is missing secret_key")?;
    println!("{key}");
    Ok(())
}

async fn cmd_get(server: &str, token: Option<&str>, key: &str, passphrase: &str) -> Result<()> {
    let body = json!({ "passphrase": passphrase });
    let json = post_json(server, token, &format!("/secrets/{key}"), &body).await?;
    let secret = json["secret"]
        .as_str()
        .context("response is missing secret")?;
    println!("{secret}");
    Ok(())
}

// ── Helpers ───────────────────────────────────────────────────────────────────

async fn post_json(server: &str, token: Option<&str>, path: &str, body: &Value) -> Result<Value> {
    let mut req = Client::new()
        .post(format!("{}{}", server.trim_end_matches('/'), path))
        .json(body);
    if let Some(t) = token {
        req = req.bearer_auth(t);
    }

    let resp = req.send().await.context("HTTP request failed")?;
    let status = resp.status();
    let json: Value = resp.json().await.unwrap_or_default();

    if status.is_success() {
        Ok(json)
    } else {
        let error = json["error"].as_str().unwrap_or("unknown error");
        anyhow::bail!("server returned {status}: {error}");
    }
}

fn read_stdin() -> Result<String> {
    let mut buf = String::new();
    std::io::stdin()
        .read_to_string(&mut buf)
        .context("read secret from stdin")?;
    Ok(buf.trim_end_matches('\n').to_owned())
}
