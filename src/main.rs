//! smartrpc - bzr smart protocol client
//!
//! Issues single smart-protocol calls against a server, for probing and
//! debugging.

mod config;

use bytes::Bytes;
use clap::{Parser, Subcommand};
use colored::Colorize;
use config::Config;
use smartrpc_client::{ClientError, ErrorContext, SmartClient, SmartUrl};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "smartrpc")]
#[command(about = "Talk to a bzr smart server")]
#[command(version)]
struct Cli {
    /// YAML config file
    #[arg(short, long, env = "SMARTRPC_CONFIG")]
    config: Option<PathBuf>,

    /// Print results as JSON
    #[arg(long)]
    json: bool,

    /// Never re-send a request after a connection reset
    #[arg(long)]
    no_retry: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Call a verb and print the response
    Call {
        /// Server URL (bzr://, bzr+ssh://, bzr+http://, http://, ...)
        url: String,

        /// Verb name, e.g. Branch.get_parent
        method: String,

        /// Verb arguments
        args: Vec<String>,

        /// Request body (or @file to read it from a file)
        #[arg(short, long)]
        body: Option<String>,

        /// Read and print the response body
        #[arg(short, long)]
        expect_body: bool,
    },

    /// Negotiate a protocol version and report it
    Probe {
        /// Server URL
        url: String,
    },

    /// Print the path a server would be sent for a URL
    RemotePath {
        /// Medium base URL
        base: String,

        /// Transport URL below the base (defaults to the base)
        url: Option<String>,
    },
}

struct CallOutput {
    args: Vec<Bytes>,
    body: Option<Bytes>,
}

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

fn read_body(arg: &str) -> Result<Bytes, Box<dyn std::error::Error>> {
    match arg.strip_prefix('@') {
        Some(path) => Ok(Bytes::from(std::fs::read(path)?)),
        None => Ok(Bytes::copy_from_slice(arg.as_bytes())),
    }
}

async fn run_call(
    client: &mut SmartClient,
    method: &str,
    args: &[String],
    body: Option<Bytes>,
    expect_body: bool,
) -> Result<CallOutput, ClientError> {
    match (body, expect_body) {
        (None, false) => Ok(CallOutput {
            args: client.call(method, args).await?,
            body: None,
        }),
        (Some(body), false) => Ok(CallOutput {
            args: client.call_with_body_bytes(method, args, body).await?,
            body: None,
        }),
        (None, true) => {
            let (args, body) = client.call_expecting_body(method, args).await?;
            Ok(CallOutput {
                args,
                body: Some(body.read_all().await?),
            })
        }
        (Some(body), true) => {
            let (args, body) = client
                .call_with_body_bytes_expecting_body(method, args, body)
                .await?;
            Ok(CallOutput {
                args,
                body: Some(body.read_all().await?),
            })
        }
    }
}

fn print_call(output: &CallOutput, json: bool) {
    if json {
        let value = serde_json::json!({
            "args": output.args.iter().map(|a| lossy(a)).collect::<Vec<_>>(),
            "body": output.body.as_deref().map(lossy),
        });
        println!("{}", value);
        return;
    }
    for (i, arg) in output.args.iter().enumerate() {
        println!("{} {}", format!("[{}]", i).dimmed(), lossy(arg));
    }
    if let Some(body) = &output.body {
        println!("{} {} bytes", "body:".dimmed(), body.len());
        println!("{}", lossy(body));
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}: {}", "Error".red(), e);
            std::process::exit(2);
        }
    };
    let connection = config.connection_config();
    let no_retry = cli.no_retry || config.connection.no_retry;

    match cli.command {
        Commands::Call {
            url,
            method,
            args,
            body,
            expect_body,
        } => {
            let body = body.as_deref().map(read_body).transpose()?;
            let mut client = SmartClient::for_url(&url, &connection)?.with_no_retry(no_retry);
            match run_call(&mut client, &method, &args, body, expect_body).await {
                Ok(output) => print_call(&output, cli.json),
                Err(e) => {
                    let e = e.translate(&ErrorContext::new());
                    eprintln!("{}: {}", "Call failed".red(), e);
                    std::process::exit(1);
                }
            }
        }
        Commands::Probe { url } => {
            let mut client = SmartClient::for_url(&url, &connection)?.with_no_retry(no_retry);
            let result = client.call("hello", &[] as &[&str]).await;
            // Any well-formed answer, even a refusal, settles the version.
            let version = client.protocol_version();
            let remote_before = client.medium().state().remote_is_before();
            if cli.json {
                let value = serde_json::json!({
                    "url": url,
                    "protocol": version.map(|v| v.number()),
                    "remote_is_before": remote_before.map(|v| v.to_string()),
                    "hello": result.as_ref().ok().map(|args| args.iter().map(|a| lossy(a)).collect::<Vec<_>>()),
                    "error": result.as_ref().err().map(|e| e.to_string()),
                });
                println!("{}", value);
            } else {
                match version {
                    Some(v) => println!("{} speaks protocol {}", url, v.number().to_string().green()),
                    None => println!("{} {}", url, "did not negotiate a protocol".red()),
                }
                if let Some(before) = remote_before {
                    println!("  remote is older than bzr {}", before);
                }
                if let Err(e) = &result {
                    println!("  hello: {}", e);
                }
            }
            if version.is_none() {
                std::process::exit(1);
            }
        }
        Commands::RemotePath { base, url } => {
            let client = SmartClient::for_url(&base, &connection)?;
            let target = SmartUrl::parse(url.as_deref().unwrap_or(&base))?;
            let path = client.remote_path_from_transport(&target);
            if cli.json {
                println!("{}", serde_json::json!({ "path": path }));
            } else {
                println!("{}", path);
            }
        }
    }

    Ok(())
}
