//! `capstan onboard` — First-time setup.

use capstan_config::AppConfig;

/// Commented-out starter sections appended to the generated config so the
/// file documents its own extension points.
const EXAMPLE_SECTIONS: &str = r#"
# --- Example tool definitions ---
#
# [[tools]]
# name = "get_time"
# description = "Current UTC time as an ISO-8601 string"
# environment = "local"
# code = "return { now: new Date().toISOString() };"
#
# [[tools]]
# name = "get_weather"
# description = "Look up the weather for a location"
# environment = "local"
# code = "return { location: parameters.location, temperature: 72 };"
# [tools.parameters]
# type = "object"
# required = ["location"]
# [tools.parameters.properties.location]
# type = "string"

# --- Example remote tool servers ---
#
# [remote_servers.files]
# transport = "stdio"
# command = "npx"
# args = ["-y", "@modelcontextprotocol/server-filesystem", "/tmp"]
#
# [remote_servers.search]
# transport = "http"
# url = "http://localhost:8931/mcp"
"#;

pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config_dir = AppConfig::config_dir();
    let config_path = config_dir.join("config.toml");

    println!("Capstan — First-Time Setup");
    println!("==========================\n");

    if !config_dir.exists() {
        std::fs::create_dir_all(&config_dir)?;
        println!("✅ Created config directory: {}", config_dir.display());
    } else {
        println!("  Config directory exists: {}", config_dir.display());
    }

    if config_path.exists() {
        println!("\n⚠️  Config already exists at: {}", config_path.display());
        println!("   Edit it manually or delete and re-run onboard.\n");
    } else {
        let mut default_toml = AppConfig::default_toml();
        default_toml.push_str(EXAMPLE_SECTIONS);
        std::fs::write(&config_path, &default_toml)?;
        println!("✅ Created config.toml at: {}", config_path.display());
        println!("\n📝 Next steps:");
        println!("   1. Edit {} and add your API key", config_path.display());
        println!("      (or set CAPSTAN_API_KEY / OPENAI_API_KEY)");
        println!("   2. Run: capstan chat");
        println!("   3. Start chatting!\n");
    }

    println!("Setup complete. Run `capstan chat` to start chatting.\n");

    Ok(())
}
