mod cli;
mod completion;
mod config;
mod error;
mod openai_client;

use std::env;
use std::io;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use dotenv::dotenv;
use eyre::{Result, eyre};
use tracing::{Level, info};
use tracing_subscriber::FmtSubscriber;

use crate::cli::chat::ChatContext;
use crate::cli::chat::session::Session;
use crate::completion::Credential;
use crate::config::{
    ChatConfig, DEFAULT_BASE_URL, DEFAULT_HISTORY_WINDOW, DEFAULT_MODEL, DEFAULT_TIMEOUT_SECS,
};
use crate::openai_client::OpenAiClient;

const API_KEY_VAR: &str = "OPENAI_API_KEY";

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Input to send to the chat
    #[arg(short, long)]
    input: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Chat model to request completions from
    #[arg(long, global = true, env = "OPENAI_MODEL", default_value = DEFAULT_MODEL)]
    model: String,

    /// Base URL of the OpenAI-compatible API
    #[arg(long, global = true, env = "OPENAI_BASE_URL", default_value = DEFAULT_BASE_URL)]
    base_url: String,

    /// Upper bound in seconds for a whole request, including the streamed reply
    #[arg(long, global = true, env = "OPENAI_TIMEOUT_SECS", default_value_t = DEFAULT_TIMEOUT_SECS)]
    timeout_secs: u64,

    /// Most recent messages replayed with each request (0 replays everything)
    #[arg(long, global = true, env = "CHAT_HISTORY_WINDOW", default_value_t = DEFAULT_HISTORY_WINDOW)]
    history_window: usize,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a chat session
    Chat {
        /// Input to send to the chat
        #[arg(short, long)]
        input: Option<String>,

        /// Enable verbose logging
        #[arg(short, long)]
        verbose: bool,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Load environment variables from .env file
    dotenv().ok();

    let cli = Cli::parse();

    let (input, verbose) = match cli.command {
        Some(Commands::Chat { input, verbose }) => (input.or(cli.input), verbose || cli.verbose),
        None => (cli.input, cli.verbose),
    };

    // The chat owns stdout, so logs go to stderr and stay quiet by default.
    let log_level = if verbose { Level::DEBUG } else { Level::WARN };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_writer(io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| eyre!("Failed to set tracing subscriber: {}", e))?;

    info!("Starting GPT Chat CLI");

    let config = ChatConfig::new(&cli.model, &cli.base_url, cli.timeout_secs, cli.history_window)?;

    let client = match OpenAiClient::new(&config) {
        Ok(client) => client,
        Err(e) => {
            eprintln!("Failed to initialize OpenAI client: {}", e);
            return Ok(ExitCode::FAILURE);
        }
    };

    let credential = env::var(API_KEY_VAR).ok().and_then(Credential::new);
    if credential.is_some() {
        info!("Using API key from {}", API_KEY_VAR);
    }

    let interactive = input.is_none();
    let session = Session::new(client, credential, config.history_window);
    let mut chat_context = ChatContext::new(Box::new(io::stdout()), input, interactive, session);
    chat_context.run().await
}
