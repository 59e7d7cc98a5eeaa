//! `capstan doctor` — Diagnose configuration and environment.

use capstan_config::AppConfig;
use capstan_mcp::ConnectionManager;

pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    println!("Capstan Doctor — Diagnostics");
    println!("============================\n");

    let mut issues = 0;

    // Config file
    let config_path = AppConfig::config_dir().join("config.toml");
    let config = if config_path.exists() {
        match AppConfig::load() {
            Ok(config) => {
                println!("  ✅ Config file valid");
                Some(config)
            }
            Err(e) => {
                println!("  ❌ Config file invalid: {e}");
                issues += 1;
                None
            }
        }
    } else {
        println!("  ❌ No config file — run `capstan onboard`");
        issues += 1;
        None
    };

    let Some(config) = config else {
        println!("\n  ⚠️  {issues} issue(s) found. See above for details.");
        return Ok(());
    };

    // API key
    if config.provider.api_key.is_some() {
        println!("  ✅ API key configured");
    } else if config.provider.base_url.contains("api.openai.com") {
        println!("  ⚠️  No API key — set CAPSTAN_API_KEY or add api_key to config.toml");
        issues += 1;
    } else {
        println!("  ✅ No API key needed for {}", config.provider.base_url);
    }

    // Tool definitions
    match config.tool_definitions() {
        Ok(definitions) => {
            println!("  ✅ {} tool(s) configured", definitions.len());
        }
        Err(e) => {
            println!("  ❌ Tool configuration invalid: {e}");
            issues += 1;
        }
    }

    // Sandbox runtime
    let runtime = match config.sandbox.runtime.as_str() {
        "command" => config.sandbox.command.clone().unwrap_or_default(),
        _ => "node".to_string(),
    };
    match tokio::process::Command::new(&runtime)
        .arg("--version")
        .output()
        .await
    {
        Ok(output) if output.status.success() => {
            let version = String::from_utf8_lossy(&output.stdout).trim().to_string();
            println!("  ✅ Sandbox runtime found: {runtime} {version}");
        }
        Ok(_) => {
            println!("  ⚠️  Sandbox runtime {runtime} did not report a version");
            issues += 1;
        }
        Err(e) => {
            println!("  ❌ Sandbox runtime {runtime} not runnable: {e}");
            issues += 1;
        }
    }

    // Remote servers
    if config.remote_servers.is_empty() {
        println!("  ✅ No remote servers configured");
    } else {
        let manager = ConnectionManager::new();
        let mut names: Vec<&String> = config.remote_servers.keys().collect();
        names.sort();
        for name in names {
            match manager.connect(name, &config.remote_servers[name]).await {
                Ok(tools) => {
                    println!("  ✅ Remote server {name} reachable ({} tools)", tools.len());
                }
                Err(e) => {
                    println!("  ❌ Remote server {name}: {e}");
                    issues += 1;
                }
            }
        }
        manager.shutdown().await;
    }

    // Summary
    println!();
    if issues == 0 {
        println!("  All checks passed.");
    } else {
        println!("  ⚠️  {issues} issue(s) found. See above for details.");
    }

    Ok(())
}
