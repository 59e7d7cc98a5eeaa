//! `capstan remote` — Connect to remote tool servers and list their tools.

use capstan_config::AppConfig;
use capstan_mcp::ConnectionManager;

pub async fn run(only: Option<String>) -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;

    if config.remote_servers.is_empty() {
        println!("  No remote servers configured.");
        println!(
            "  Add [remote_servers.<name>] sections to {}",
            AppConfig::config_dir().join("config.toml").display()
        );
        return Ok(());
    }

    if let Some(name) = &only {
        if !config.remote_servers.contains_key(name) {
            return Err(format!("No remote server named \"{name}\" in the config").into());
        }
    }

    println!("Capstan Remote Servers");
    println!("======================\n");

    let manager = ConnectionManager::new();
    let mut failures = 0;

    let mut names: Vec<&String> = config
        .remote_servers
        .keys()
        .filter(|name| only.as_ref().is_none_or(|wanted| wanted == *name))
        .collect();
    names.sort();

    for name in names {
        let server = &config.remote_servers[name];
        match manager.connect(name, server).await {
            Ok(tools) => {
                println!("  ✅ {name} — {} tool(s)", tools.len());
                for tool in &tools {
                    let description = tool.description.lines().next().unwrap_or("");
                    if description.is_empty() {
                        println!("       {}", tool.name);
                    } else {
                        println!("       {:<28} {description}", tool.name);
                    }
                }
            }
            Err(e) => {
                println!("  ❌ {name} — {e}");
                failures += 1;
            }
        }
        println!();
    }

    manager.shutdown().await;

    if failures > 0 {
        return Err(format!("{failures} server(s) failed to connect").into());
    }
    Ok(())
}
