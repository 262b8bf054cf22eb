//! telecord setup wizard.
//!
//! Prompts for the bot token and the chat → webhook routes, then writes
//! `config.toml` to the project root (`TELECORD_ROOT`, default cwd).

use anyhow::{bail, Context, Result};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

struct ConfigParams<'a> {
    bot_token: &'a str,
    /// (chat id, webhook URL) pairs
    routes: &'a [(String, String)],
    max_file_size_mb: f64,
    auto_compress: bool,
    watermark_prefix: &'a str,
    port: u16,
}

/// Normalise a chat id the way the bot reads `WEBHOOK_<id>`: group and
/// channel ids are negative, so a missing sign is added.
fn normalize_chat_id(raw: &str) -> Option<String> {
    let raw = raw.trim();
    let id = if raw.starts_with('-') {
        raw.to_string()
    } else {
        format!("-{raw}")
    };
    id.parse::<i64>().ok().map(|_| id)
}

/// Produces a valid config.toml string. Extracted so it can be unit-tested.
fn format_config(p: &ConfigParams<'_>) -> String {
    let bot_token = p.bot_token;
    let max_file_size_mb = p.max_file_size_mb;
    let auto_compress = p.auto_compress;
    let port = p.port;

    let webhooks: String = p
        .routes
        .iter()
        .map(|(chat_id, url)| format!("\"{chat_id}\" = \"{url}\"\n"))
        .collect();

    let watermark = if p.watermark_prefix.is_empty() {
        "[watermark]\nenabled = false\n# text_prefix = \"[Telegram]\"\n".to_owned()
    } else {
        format!(
            "[watermark]\nenabled = true\ntext_prefix = \"{}\"\n",
            p.watermark_prefix
        )
    };

    format!(
        r#"[telegram]
bot_token = "{bot_token}"
# api_url = "http://localhost:8081"

[discord]
max_retries = 3

[discord.webhooks]
{webhooks}
[replication]
max_file_size_mb = {max_file_size_mb:.1}
auto_compress = {auto_compress}
compression_quality = 75
processing_timeout_secs = 300
max_concurrent_processing = 10

{watermark}
[server]
host = "0.0.0.0"
port = {port}

[storage]
temp_dir = "temp_files"
max_age_hours = 24
"#
    )
}

fn read_line(prompt: &str) -> Result<String> {
    print!("{prompt}");
    io::stdout().flush()?;
    let mut buf = String::new();
    io::stdin().read_line(&mut buf)?;
    Ok(buf.trim().to_owned())
}

fn run_cli(project_root: &Path) -> Result<()> {
    println!("=== telecord setup ===\n");

    let bot_token = read_line("Telegram bot token: ")?;
    if bot_token.is_empty() {
        bail!("A bot token is required");
    }

    let mut routes = Vec::new();
    loop {
        let chat = read_line("Telegram chat id to replicate (empty to finish): ")?;
        if chat.is_empty() {
            break;
        }
        let Some(chat_id) = normalize_chat_id(&chat) else {
            println!("  '{chat}' is not a numeric chat id, try again");
            continue;
        };
        let url = read_line(&format!("Discord webhook URL for {chat_id}: "))?;
        if url.is_empty() {
            println!("  skipped {chat_id}: no webhook given");
            continue;
        }
        routes.push((chat_id, url));
    }
    if routes.is_empty() {
        println!("No routes configured; add WEBHOOK_<chat_id> variables or edit config.toml later.");
    }

    let max_file_size_mb = match read_line("Max attachment size in MB [25]: ")?.as_str() {
        "" => 25.0,
        s => s.parse::<f64>().context("Max size must be a number")?,
    };
    let auto_compress = !matches!(
        read_line("Compress oversized media? [Y/n]: ")?.to_lowercase().as_str(),
        "n" | "no"
    );
    let watermark_prefix = read_line("Text watermark prefix (optional): ")?;

    let config = format_config(&ConfigParams {
        bot_token: &bot_token,
        routes: &routes,
        max_file_size_mb,
        auto_compress,
        watermark_prefix: &watermark_prefix,
        port: 8000,
    });

    let config_path = project_root.join("config.toml");
    std::fs::write(&config_path, &config)
        .with_context(|| format!("Could not write {}", config_path.display()))?;

    println!("\n✓  config.toml saved to {}", config_path.display());
    println!("   Run the bridge with:  cargo run --bin telecord");
    Ok(())
}

fn main() -> Result<()> {
    let project_root =
        PathBuf::from(std::env::var("TELECORD_ROOT").unwrap_or_else(|_| ".".to_string()));
    run_cli(&project_root)
}
