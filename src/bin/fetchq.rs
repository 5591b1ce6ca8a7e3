//! fetchq CLI — exercise the dispatch engine against live endpoints.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use fetchq::config::Config;
use fetchq::dispatcher::Dispatcher;
use fetchq::model::{HttpMethod, RequestOptions};
use fetchq::telemetry::init_tracing;
use fetchq::transport::HttpTransport;
use tracing::info;

#[derive(Parser)]
#[command(name = "fetchq", about = "Request-deduplicating fetch dispatcher")]
struct Cli {
    /// Run the executor in-process instead of on a worker task.
    #[arg(long)]
    inline: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Fetch a JSON endpoint through the dispatcher
    Get {
        url: String,
        /// HTTP method
        #[arg(long, default_value = "GET")]
        method: String,
        /// Request headers as name=value pairs
        #[arg(long)]
        header: Vec<String>,
        /// Raw request body
        #[arg(long)]
        body: Option<String>,
        /// Per-call timeout in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// Load several text resources concurrently
    Batch { urls: Vec<String> },
}

fn parse_method(raw: &str) -> anyhow::Result<HttpMethod> {
    match raw.to_ascii_uppercase().as_str() {
        "GET" => Ok(HttpMethod::Get),
        "POST" => Ok(HttpMethod::Post),
        "PUT" => Ok(HttpMethod::Put),
        "PATCH" => Ok(HttpMethod::Patch),
        "DELETE" => Ok(HttpMethod::Delete),
        other => anyhow::bail!("unsupported method: {other}"),
    }
}

fn parse_header(raw: &str) -> anyhow::Result<(String, String)> {
    raw.split_once('=')
        .map(|(name, value)| (name.to_string(), value.to_string()))
        .ok_or_else(|| anyhow::anyhow!("header must be name=value, got: {raw}"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing("info")?;

    let cli = Cli::parse();
    let config = Config::from_env()?;

    let mut transport = HttpTransport::new();
    if let Some(token) = config.auth_token.clone() {
        transport = transport.auth_token(token);
    }
    let transport = Arc::new(transport);

    let dispatcher = if cli.inline {
        Dispatcher::new_inline(transport, config)
    } else {
        Dispatcher::new(transport, config)
    };

    let subscription = dispatcher.subscribe_telemetry(|event| {
        info!(seq = event.seq, kind = ?event.kind, "telemetry");
    });

    match cli.command {
        Command::Get {
            url,
            method,
            header,
            body,
            timeout_ms,
        } => {
            let mut options = RequestOptions::new().method(parse_method(&method)?);
            for raw in &header {
                let (name, value) = parse_header(raw)?;
                options = options.header(name, value);
            }
            if let Some(body) = body {
                options = options.body(body);
            }
            if let Some(ms) = timeout_ms {
                options = options.timeout_ms(ms);
            }

            let value = dispatcher.fetch(&url, options).await?;
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        Command::Batch { urls } => {
            let texts = dispatcher.load_batch(urls).await?;
            for (index, text) in texts.iter().enumerate() {
                println!("--- resource {index} ({} bytes)", text.len());
                println!("{text}");
            }
        }
    }

    subscription.unsubscribe();
    dispatcher.terminate();
    Ok(())
}
