// credreader: credential reader command-line tool
//
// Key enrolment helpers, configuration, and a loopback demo that runs the
// reader and a simulated handset in one process.

mod config;
mod validation_ws;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use credreader_core::{
    ConnectionId, CredentialStatus, DeviceId, LoopbackTransport, MasterKey, MobileSession,
    ProtocolHandler, ReaderService, ValidationDelegate,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Well-known development key; never use it on a deployed reader.
const DEMO_MASTER_KEY: &str = "00112233445566778899aabbccddeeff";
const DEMO_DEVICE_ID: &str = "a1b2c3d4e5f6a1b2c3d4e5f6a1b2c3d4";

#[derive(Parser)]
#[command(name = "credreader")]
#[command(about = "BLE credential reader: challenge-response authentication and validation", long_about = None)]
#[command(version)]
struct Cli {
    /// Master key in hex (overrides the config file)
    #[arg(long, global = true)]
    master_key: Option<String>,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Derive a handset's device key (enrolment)
    DeriveKey {
        /// Device ID in hex
        #[arg(long, default_value = DEMO_DEVICE_ID)]
        device_id: String,
    },
    /// Show the master key fingerprint
    Fingerprint,
    /// Run a reader and a simulated handset over the loopback transport
    Demo {
        /// Device ID in hex
        #[arg(long, default_value = DEMO_DEVICE_ID)]
        device_id: String,
        /// Credential payload to present
        #[arg(long, default_value = "EMP-000451")]
        credential: String,
        /// Serve the WebSocket validation endpoint during the demo
        #[arg(long)]
        websocket: bool,
        /// Seconds to wait for a validator to connect before presenting
        #[arg(long, default_value = "0")]
        wait: u64,
    },
    /// Configure settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    Set { key: String, value: String },
    Get { key: String },
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .init();

    let master_flag = cli.master_key.as_deref();
    match cli.command {
        Commands::DeriveKey { device_id } => cmd_derive_key(master_flag, &device_id),
        Commands::Fingerprint => cmd_fingerprint(master_flag),
        Commands::Demo {
            device_id,
            credential,
            websocket,
            wait,
        } => cmd_demo(master_flag, &device_id, &credential, websocket, wait).await,
        Commands::Config { action } => cmd_config(action),
    }
}

/// Master key for commands that may fall back to the development key
fn demo_master_key(config: &config::Config, flag: Option<&str>) -> Result<MasterKey> {
    match config.master_key(flag) {
        Ok(key) => Ok(key),
        Err(config::ConfigError::MissingMasterKey) => {
            println!(
                "{} No master key configured, using the development key",
                "!".yellow()
            );
            Ok(MasterKey::from_hex(DEMO_MASTER_KEY)?)
        }
        Err(e) => Err(e.into()),
    }
}

fn cmd_derive_key(master_flag: Option<&str>, device_id: &str) -> Result<()> {
    let config = config::Config::load()?;
    let master = demo_master_key(&config, master_flag)?;
    let device_id = DeviceId::from_hex(device_id).context("Invalid device ID")?;
    let device_key = master.derive(&device_id)?;

    println!("{}", "Device Key Derivation".bold());
    println!();
    println!("  Master key: fingerprint {}", master.fingerprint().bright_cyan());
    println!("  Device ID:  {}", device_id.to_hex());
    println!("  Device key: {}", device_key.to_hex().bright_yellow());
    println!();
    println!(
        "{}",
        "Provision this key to the handset over a secure channel.".dimmed()
    );

    Ok(())
}

fn cmd_fingerprint(master_flag: Option<&str>) -> Result<()> {
    let config = config::Config::load()?;
    let master = config.master_key(master_flag)?;
    println!("{}", master.fingerprint());
    Ok(())
}

async fn cmd_demo(
    master_flag: Option<&str>,
    device_id: &str,
    credential: &str,
    websocket: bool,
    wait: u64,
) -> Result<()> {
    let config = config::Config::load()?;
    let master = demo_master_key(&config, master_flag)?;
    let device_id = DeviceId::from_hex(device_id).context("Invalid device ID")?;

    println!("{}", "Credential Reader Demo".bold());
    println!();

    let mut mobile = MobileSession::enrol(&master, device_id)?;
    let handler = Arc::new(ProtocolHandler::with_config(master, config.handler_config()));
    let delegate = Arc::new(ValidationDelegate::new(config.validation_config()));
    let transport = Arc::new(LoopbackTransport::new());
    let service = ReaderService::new(handler, delegate.clone(), transport.clone());
    println!("{} Reader ready", "✓".green());

    let ws_task = if websocket || config.validation.enabled {
        let addr = validation_ws::bind_addr(&config.validation.host, config.validation.port)?;
        let task = validation_ws::start(addr, delegate.clone());
        println!(
            "{} Validation endpoint: {}",
            "✓".green(),
            format!("ws://{}/ws", addr).bright_cyan()
        );
        if wait > 0 {
            println!("  Waiting up to {}s for a validator...", wait);
            let deadline = tokio::time::Instant::now() + Duration::from_secs(wait);
            while delegate.subscriber_count() == 0 && tokio::time::Instant::now() < deadline {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            println!("  Validators connected: {}", delegate.subscriber_count());
        }
        Some(task)
    } else {
        None
    };

    let conn = ConnectionId::from("demo-handset");
    service.on_connect(&conn);
    println!("{} Handset connected ({})", "✓".green(), device_id);

    // Handshake
    service.on_receive(&conn, &mobile.auth_request()?);
    let reply = recv(&transport, &conn).await?;
    match mobile.verify_auth_response(&reply) {
        Ok(_) => println!("{} Mutual authentication", "✓".green()),
        Err(e) => {
            println!("{} Authentication failed: {}", "✗".red(), e);
            service.shutdown();
            return Ok(());
        }
    }

    // Credential
    service.on_receive(&conn, &mobile.credential(credential.as_bytes())?);
    let reply = recv(&transport, &conn).await?;
    match MobileSession::parse_credential_response(&reply) {
        Ok(status) => print_status(status),
        Err(e) => println!("{} Reader refused credential: {}", "✗".red(), e),
    }

    service.on_disconnect(&conn);
    let stats = service.stats();
    info!(
        created = stats.sessions_created,
        closed = stats.sessions_closed,
        "Demo finished"
    );
    service.shutdown();
    if let Some(task) = ws_task {
        task.abort();
    }

    Ok(())
}

async fn recv(transport: &LoopbackTransport, conn: &ConnectionId) -> Result<Vec<u8>> {
    transport
        .recv(conn)
        .await
        .context("Reader closed without replying")
}

fn print_status(status: CredentialStatus) {
    let label = if status.is_success() {
        status.name().green().bold()
    } else {
        status.name().red().bold()
    };
    println!("{} Credential: {} ({})", "→".bright_blue(), label, status.describe());
}

fn cmd_config(action: ConfigAction) -> Result<()> {
    let mut config = config::Config::load()?;

    match action {
        ConfigAction::Set { key, value } => {
            config.set(&key, &value)?;
            config.save()?;
            let shown = config.get(&key).unwrap_or(value);
            println!("{} Set {} = {}", "✓".green(), key.bright_cyan(), shown);
        }

        ConfigAction::Get { key } => {
            if let Some(value) = config.get(&key) {
                println!("{} = {}", key.bright_cyan(), value);
            } else {
                anyhow::bail!("Unknown config key: {}", key);
            }
        }

        ConfigAction::List => {
            println!("{}", "Configuration".bold());
            println!();

            for (key, value) in config.list() {
                println!("  {:<26} {}", key.bright_cyan(), value);
            }

            println!();
            println!(
                "  {}",
                config::Config::config_file()?.display().to_string().dimmed()
            );
        }
    }

    Ok(())
}
