//! `capstan tools` — List the configured tool catalog.

use capstan_config::AppConfig;
use capstan_core::tool::ToolEnvironment;

pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;
    let definitions = config
        .tool_definitions()
        .map_err(|e| format!("Invalid tool configuration: {e}"))?;

    println!("Capstan Tools");
    println!("=============\n");

    if definitions.is_empty() {
        println!("  No tools configured.");
        println!("  Add [[tools]] entries to {}", config_path_hint());
    } else {
        for definition in &definitions {
            let environment = match &definition.environment {
                ToolEnvironment::Local { .. } => "local".to_string(),
                ToolEnvironment::Host => "host".to_string(),
                ToolEnvironment::Remote { server, .. } => format!("remote:{server}"),
            };
            let state = if definition.enabled { "" } else { "  (disabled)" };
            println!(
                "  {:<24} {:<14} {:>8}ms{}",
                definition.name, environment, definition.timeout_ms, state
            );
            if !definition.description.is_empty() {
                println!("      {}", definition.description);
            }
        }
        println!("\n  {} tool(s) configured.", definitions.len());
    }

    if !config.remote_servers.is_empty() {
        println!(
            "\n  {} remote server(s) configured. Run `capstan remote` to list their tools.",
            config.remote_servers.len()
        );
    }

    Ok(())
}

fn config_path_hint() -> String {
    AppConfig::config_dir()
        .join("config.toml")
        .display()
        .to_string()
}
