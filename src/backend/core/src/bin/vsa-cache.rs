//! vsa-cache - admin and debugging CLI for the two-tier cache
//!
//! Inspects and evicts shared tier keys, watches the invalidation channel,
//! checks lock status, and validates configuration.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use colored::*;
use futures::StreamExt;
use serde::Serialize;
use serde_json::json;
use std::time::Duration;

use vsa_cache::cache::{CacheKey, CachePattern, HybridCoordinator, InvalidationScope, KeyConvention};
use vsa_cache::config::Settings;
use vsa_cache::telemetry::{init_logging, LogFormat, LoggingConfig};

// ═══════════════════════════════════════════════════════════════════════════════
// CLI Structure
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Parser)]
#[command(
    name = "vsa-cache",
    version,
    about = "Inspect and manage the VSA two-tier cache",
    propagate_version = true
)]
struct Cli {
    /// Output format
    #[arg(short, long, global = true, default_value = "text")]
    format: OutputFormat,

    /// Configuration file path
    #[arg(short, long, global = true, env = "VSA_CONFIG")]
    config: Option<String>,

    /// Log cache internals to stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum, Default)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Build a key or pattern with the configured namespace and version
    Key {
        resource: String,

        /// Identifier; omit to build the resource pattern
        identifier: Option<String>,

        /// Tenant segment
        #[arg(short, long)]
        tenant: Option<String>,
    },

    /// Show the raw shared tier value of a key
    Get { key: String },

    /// Check whether a key exists in the shared tier
    Exists { key: String },

    /// Show the remaining shared tier TTL of a key
    Ttl { key: String },

    /// Evict a key from the shared tier and notify every instance
    Evict { key: String },

    /// Evict every shared key matching a glob and notify every instance
    EvictPattern {
        pattern: String,

        /// Skip the confirmation guard for namespace-wide patterns
        #[arg(long)]
        yes: bool,
    },

    /// Print invalidation events as they arrive
    Listen {
        /// Stop after this many events
        #[arg(short = 'n', long)]
        count: Option<usize>,
    },

    /// Show whether a distributed lock is held
    LockStatus { lock_key: String },

    /// Configuration commands
    #[command(subcommand)]
    Config(ConfigCommands),
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Load and validate the configuration
    Check,

    /// Print the effective configuration
    Show {
        /// Show the Redis URL unredacted
        #[arg(long)]
        show_secrets: bool,
    },
}

// ═══════════════════════════════════════════════════════════════════════════════
// Output Helpers
// ═══════════════════════════════════════════════════════════════════════════════

struct OutputHelper {
    format: OutputFormat,
}

impl OutputHelper {
    fn new(format: OutputFormat, no_color: bool) -> Self {
        if no_color {
            colored::control::set_override(false);
        }
        Self { format }
    }

    fn is_json(&self) -> bool {
        matches!(self.format, OutputFormat::Json)
    }

    fn print_success(&self, message: &str) {
        if self.is_json() {
            println!("{}", json!({ "status": "success", "message": message }));
        } else {
            println!("{} {}", "[OK]".green().bold(), message);
        }
    }

    fn print_error(&self, message: &str) {
        if self.is_json() {
            eprintln!("{}", json!({ "status": "error", "message": message }));
        } else {
            eprintln!("{} {}", "[ERROR]".red().bold(), message);
        }
    }

    fn print_warning(&self, message: &str) {
        if self.is_json() {
            println!("{}", json!({ "status": "warning", "message": message }));
        } else {
            println!("{} {}", "[WARN]".yellow().bold(), message);
        }
    }

    fn print_info(&self, message: &str) {
        if self.is_json() {
            println!("{}", json!({ "status": "info", "message": message }));
        } else {
            println!("{} {}", "[INFO]".blue().bold(), message);
        }
    }

    fn print_json<T: Serialize>(&self, data: &T) -> Result<()> {
        let json = serde_json::to_string_pretty(data)?;
        println!("{}", json);
        Ok(())
    }

    fn print_header(&self, title: &str) {
        if !self.is_json() {
            println!();
            println!("{}", title.bold().underline());
            println!();
        }
    }

    fn print_key_value(&self, key: &str, value: &str) {
        if !self.is_json() {
            println!("  {}: {}", key.cyan(), value);
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Command Handlers
// ═══════════════════════════════════════════════════════════════════════════════

fn load_settings(path: Option<&str>) -> Result<Settings> {
    let settings = match path {
        Some(path) => Settings::from_file(path)
            .with_context(|| format!("Failed to load configuration from {}", path))?,
        None => Settings::load().context("Failed to load configuration")?,
    };
    Ok(settings)
}

async fn connect(settings: &Settings, output: &OutputHelper) -> Result<HybridCoordinator> {
    if !output.is_json() {
        output.print_info(&format!("Connecting to {}", settings.redis.redacted_url()));
    }
    HybridCoordinator::connect_redis(settings)
        .await
        .context("Failed to connect to the shared store")
}

fn parse_key(raw: &str) -> Result<CacheKey> {
    CacheKey::parse(raw).with_context(|| {
        format!(
            "'{}' is not a cache key (expected namespace:version:resource:tenant:identifier)",
            raw
        )
    })
}

fn handle_key_command(
    settings: &Settings,
    resource: &str,
    identifier: Option<&str>,
    tenant: Option<&str>,
    output: &OutputHelper,
) -> Result<()> {
    let keys = KeyConvention::from_settings(&settings.cache)?;

    let built = match (identifier, tenant) {
        (Some(identifier), tenant) => keys.build(resource, identifier, tenant).map(|k| k.into_string()),
        (None, Some(tenant)) => keys
            .build_tenant_pattern(resource, tenant)
            .map(|p| p.as_str().to_string()),
        (None, None) => keys.build_pattern(resource).map(|p| p.as_str().to_string()),
    };

    match built {
        Some(value) if output.is_json() => output.print_json(&json!({ "value": value })),
        Some(value) => {
            println!("{}", value);
            Ok(())
        }
        None => anyhow::bail!("Segments must be non-empty and contain neither ':' nor a glob metacharacter"),
    }
}

async fn handle_get_command(cache: &HybridCoordinator, raw: &str, output: &OutputHelper) -> Result<()> {
    let key = parse_key(raw)?;
    let value = cache.shared().get::<serde_json::Value>(key.as_str()).await;
    let ttl = cache.shared().ttl(key.as_str()).await;

    if output.is_json() {
        return output.print_json(&json!({
            "key": key.as_str(),
            "value": value,
            "ttl_ms": ttl.map(|t| t.as_millis() as u64),
        }));
    }

    match value {
        Some(value) => {
            output.print_header(key.as_str());
            println!("{}", serde_json::to_string_pretty(&value)?);
            output.print_key_value("ttl", &format_ttl(ttl));
        }
        None => output.print_warning(&format!("{} is not cached", key)),
    }
    Ok(())
}

async fn handle_exists_command(cache: &HybridCoordinator, raw: &str, output: &OutputHelper) -> Result<()> {
    let key = parse_key(raw)?;
    let exists = cache.shared().exists(key.as_str()).await;

    if output.is_json() {
        return output.print_json(&json!({ "key": key.as_str(), "exists": exists }));
    }
    if exists {
        output.print_success(&format!("{} exists", key));
    } else {
        output.print_warning(&format!("{} does not exist", key));
    }
    Ok(())
}

async fn handle_ttl_command(cache: &HybridCoordinator, raw: &str, output: &OutputHelper) -> Result<()> {
    let key = parse_key(raw)?;
    let ttl = cache.shared().ttl(key.as_str()).await;

    if output.is_json() {
        return output.print_json(&json!({
            "key": key.as_str(),
            "ttl_ms": ttl.map(|t| t.as_millis() as u64),
        }));
    }
    output.print_key_value(key.as_str(), &format_ttl(ttl));
    Ok(())
}

async fn handle_evict_command(cache: &HybridCoordinator, raw: &str, output: &OutputHelper) -> Result<()> {
    let key = parse_key(raw)?;
    let existed = cache.evict(&key).await;

    if output.is_json() {
        return output.print_json(&json!({ "key": key.as_str(), "evicted": existed }));
    }
    if existed {
        output.print_success(&format!("Evicted {} and notified peers", key));
    } else {
        output.print_info(&format!("{} was not cached, peers notified anyway", key));
    }
    Ok(())
}

async fn handle_evict_pattern_command(
    cache: &HybridCoordinator,
    raw: &str,
    yes: bool,
    output: &OutputHelper,
) -> Result<()> {
    let pattern = CachePattern::parse(raw).context("Pattern must not be blank")?;

    let namespace_wide = pattern.as_str() == "*"
        || pattern.as_str() == cache.keys().namespace_pattern().as_str();
    if namespace_wide && !yes {
        anyhow::bail!(
            "'{}' matches the whole namespace and scans the entire keyspace; pass --yes to proceed",
            pattern
        );
    }

    let deleted = cache.evict_pattern(&pattern).await;

    if output.is_json() {
        return output.print_json(&json!({ "pattern": pattern.as_str(), "deleted": deleted }));
    }
    output.print_success(&format!("Deleted {} shared keys matching {} and notified peers", deleted, pattern));
    Ok(())
}

async fn handle_listen_command(cache: &HybridCoordinator, count: Option<usize>, output: &OutputHelper) -> Result<()> {
    let mut events = cache.bus().events().await.context("Failed to subscribe")?;

    if !output.is_json() {
        output.print_info(&format!("Listening on {} (Ctrl+C to stop)", cache.bus().channel()));
    }

    let mut seen = 0usize;
    loop {
        let event = tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            next = events.next() => match next {
                Some(event) => event,
                None => {
                    output.print_warning("Subscription ended");
                    break;
                }
            },
        };

        if output.is_json() {
            println!("{}", serde_json::to_string(&event)?);
        } else {
            let target = match &event.scope {
                InvalidationScope::SingleKey { key } => key.as_str(),
                InvalidationScope::Pattern { pattern } => pattern.as_str(),
            };
            println!(
                "{} {:<10} {} {}",
                event.origin_timestamp.format("%H:%M:%S%.3f").to_string().dimmed(),
                format_kind(event.kind()),
                target,
                format!("from {}", event.origin).dimmed()
            );
        }

        seen += 1;
        if count.is_some_and(|limit| seen >= limit) {
            break;
        }
    }
    Ok(())
}

async fn handle_lock_status_command(cache: &HybridCoordinator, lock_key: &str, output: &OutputHelper) -> Result<()> {
    let full_key = cache.mutex().full_key(lock_key);
    let locked = cache.mutex().is_locked(lock_key).await;
    let ttl = if locked {
        cache.shared().ttl(&full_key).await
    } else {
        None
    };

    if output.is_json() {
        return output.print_json(&json!({
            "lock_key": full_key,
            "locked": locked,
            "lease_remaining_ms": ttl.map(|t| t.as_millis() as u64),
        }));
    }

    output.print_header("Lock Status");
    output.print_key_value("key", &full_key);
    output.print_key_value(
        "state",
        &if locked {
            "held".red().bold().to_string()
        } else {
            "free".green().to_string()
        },
    );
    if locked {
        output.print_key_value("lease remaining", &format_ttl(ttl));
    }
    Ok(())
}

fn handle_config_command(
    cmd: ConfigCommands,
    config_path: Option<&str>,
    output: &OutputHelper,
) -> Result<()> {
    match cmd {
        ConfigCommands::Check => {
            let settings = load_settings(config_path)?;
            output.print_success("Configuration is valid");
            output.print_key_value("file", config_path.unwrap_or("(environment only)"));
            output.print_key_value("redis", &settings.redis.redacted_url());
            output.print_key_value("local ttl", &format!("{}s", settings.cache.local.ttl_secs));
            output.print_key_value(
                "shared ttl",
                &format!("{}m", settings.cache.shared.default_ttl_minutes),
            );
        }

        ConfigCommands::Show { show_secrets } => {
            let mut settings = load_settings(config_path)?;
            if !show_secrets {
                settings.redis.url = settings.redis.redacted_url();
            }

            if output.is_json() {
                output.print_json(&settings)?;
            } else {
                output.print_header("Configuration");
                println!("{}", toml::to_string_pretty(&settings)?);
            }
        }
    }
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════════
// Formatting Helpers
// ═══════════════════════════════════════════════════════════════════════════════

fn format_ttl(ttl: Option<Duration>) -> String {
    match ttl {
        Some(ttl) => humantime_serde::re::humantime::format_duration(Duration::from_secs(ttl.as_secs())).to_string(),
        None => "none".dimmed().to_string(),
    }
}

fn format_kind(kind: &str) -> String {
    match kind {
        "single_key" => kind.cyan().to_string(),
        "pattern" => kind.yellow().bold().to_string(),
        _ => kind.to_string(),
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Main Entry Point
// ═══════════════════════════════════════════════════════════════════════════════

async fn run(cli: Cli, output: &OutputHelper) -> Result<()> {
    let config_path = cli.config.as_deref();

    match cli.command {
        Commands::Config(cmd) => handle_config_command(cmd, config_path, output),
        Commands::Key { resource, identifier, tenant } => {
            let settings = load_settings(config_path)?;
            handle_key_command(&settings, &resource, identifier.as_deref(), tenant.as_deref(), output)
        }
        command => {
            let settings = load_settings(config_path)?;
            let cache = connect(&settings, output).await?;
            run_store_command(&cache, command, output).await
        }
    }
}

async fn run_store_command(cache: &HybridCoordinator, command: Commands, output: &OutputHelper) -> Result<()> {
    match command {
        Commands::Get { key } => handle_get_command(cache, &key, output).await,
        Commands::Exists { key } => handle_exists_command(cache, &key, output).await,
        Commands::Ttl { key } => handle_ttl_command(cache, &key, output).await,
        Commands::Evict { key } => handle_evict_command(cache, &key, output).await,
        Commands::EvictPattern { pattern, yes } => {
            handle_evict_pattern_command(cache, &pattern, yes, output).await
        }
        Commands::Listen { count } => handle_listen_command(cache, count, output).await,
        Commands::LockStatus { lock_key } => handle_lock_status_command(cache, &lock_key, output).await,
        Commands::Key { .. } | Commands::Config(_) => Ok(()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let output = OutputHelper::new(cli.format, cli.no_color);

    if cli.verbose {
        let logging = LoggingConfig {
            level: "debug".to_string(),
            format: LogFormat::Compact,
            include_location: false,
            ..Default::default()
        };
        init_logging(&logging, "cli")?;
    }

    if let Err(e) = run(cli, &output).await {
        output.print_error(&format!("{:#}", e));
        std::process::exit(1);
    }

    Ok(())
}
