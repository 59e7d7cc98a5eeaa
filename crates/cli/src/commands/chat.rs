//! `capstan chat` — Interactive or single-message chat mode.

use std::io::Write;
use std::sync::Arc;

use tokio::io::AsyncBufReadExt;
use tokio_util::sync::CancellationToken;

use capstan_config::AppConfig;
use capstan_core::error::Error;
use capstan_core::message::Conversation;
use capstan_engine::Engine;

use crate::host::TerminalHost;

pub async fn run(message: Option<String>) -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;

    // Check for an API key early when the endpoint will demand one
    if config.provider.api_key.is_none() && config.provider.base_url.contains("api.openai.com") {
        eprintln!();
        eprintln!("  ERROR: No API key configured!");
        eprintln!();
        eprintln!("  Set one of these environment variables:");
        eprintln!("    CAPSTAN_API_KEY='sk-...'");
        eprintln!("    OPENAI_API_KEY='sk-...'");
        eprintln!();
        eprintln!("  Or add it to your config file:");
        eprintln!(
            "    {}",
            AppConfig::config_dir().join("config.toml").display()
        );
        eprintln!();
        return Err("No API key found. See above for setup instructions.".into());
    }

    let host = Arc::new(TerminalHost::new());
    let engine = Engine::from_config(config.clone(), host.clone())?;

    if !config.remote_servers.is_empty() {
        eprintln!("  Connecting to remote servers...");
        let connected = engine.connect_remote_servers().await;
        eprintln!(
            "  {connected}/{} remote server(s) connected",
            config.remote_servers.len()
        );
    }

    let result = match message {
        Some(msg) => single_message(&engine, &host, &msg).await,
        None => interactive(&engine, &host, &config).await,
    };

    engine.shutdown().await;
    result
}

async fn single_message(
    engine: &Engine,
    host: &Arc<TerminalHost>,
    message: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut conversation = Conversation::new();
    host.begin_turn();
    let cancel = CancellationToken::new();

    match run_turn_interruptible(engine, &mut conversation, message, &cancel).await {
        Ok(response) => {
            if host.streamed_output() {
                host.finish_line();
            } else {
                println!("{response}");
            }
            Ok(())
        }
        Err(e) => {
            host.finish_line();
            Err(e.to_string().into())
        }
    }
}

async fn interactive(
    engine: &Engine,
    host: &Arc<TerminalHost>,
    config: &AppConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    let catalog = engine.catalog().await?;
    let mut tool_names = catalog.names();
    tool_names.sort_unstable();

    println!();
    println!("  Capstan — Interactive Mode");
    println!("  ==========================");
    println!();
    println!("  Endpoint:  {}", config.provider.base_url);
    println!("  Model:     {}", config.provider.model);
    if tool_names.is_empty() {
        println!("  Tools:     none");
    } else {
        println!("  Tools:     {}", tool_names.join(", "));
    }
    println!();
    println!("  Type your message and press Enter.");
    println!("  Type 'exit' or Ctrl+C to quit.");
    println!();

    let mut conversation = Conversation::new();
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();

    print!("  You > ");
    std::io::stdout().flush()?;

    while let Some(line) = lines.next_line().await? {
        let line = line.trim().to_string();
        if line.is_empty() {
            print!("  You > ");
            std::io::stdout().flush()?;
            continue;
        }
        if matches!(line.as_str(), "exit" | "quit" | "/exit" | "/quit" | ":q") {
            break;
        }

        println!();
        host.begin_turn();
        let cancel = CancellationToken::new();

        match run_turn_interruptible(engine, &mut conversation, &line, &cancel).await {
            Ok(response) => {
                if host.streamed_output() {
                    host.finish_line();
                } else {
                    println!("{response}");
                }
                println!();
            }
            Err(Error::Cancelled) => {
                host.finish_line();
                println!();
                println!("  [Turn cancelled]");
                println!();
            }
            Err(e) => {
                host.finish_line();
                eprintln!("  [Error] {e}");
                println!();
            }
        }

        print!("  You > ");
        std::io::stdout().flush()?;
    }

    println!();
    println!("  Goodbye!");
    println!();
    Ok(())
}

/// Drive one turn while listening for Ctrl+C. The first interrupt cancels
/// the turn; the loop then waits for the engine to unwind and report
/// [`Error::Cancelled`].
async fn run_turn_interruptible(
    engine: &Engine,
    conversation: &mut Conversation,
    message: &str,
    cancel: &CancellationToken,
) -> Result<String, Error> {
    let turn = engine.run_turn(conversation, message, cancel);
    tokio::pin!(turn);
    loop {
        tokio::select! {
            result = &mut turn => return result,
            _ = tokio::signal::ctrl_c() => {
                eprintln!();
                eprintln!("  Cancelling turn...");
                cancel.cancel();
            }
        }
    }
}
