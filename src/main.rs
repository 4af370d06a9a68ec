use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use sona::config::BridgeConfig;
use sona::speaker::CloudSpeaker;
use sona::App;

/// Sona - bridge a smart speaker's voice assistant to a streaming LLM
#[derive(Parser)]
#[command(name = "sona", version, about)]
struct Cli {
    /// Config file path (defaults to ~/.config/sona/config.toml)
    #[arg(short, long, env = "SONA_CONFIG")]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Poll the speaker and bridge queries to the chat endpoint (default)
    Run,
    /// List the speaker devices registered to the account
    Devices,
    /// Write a config template to fill in
    Init,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("sona=info")),
        1 => EnvFilter::new("sona=debug"),
        2 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run_bridge(cli.config.as_deref()).await,
        Command::Devices => list_devices(cli.config.as_deref()).await,
        Command::Init => write_template(cli.config.as_deref()),
    }
}

async fn run_bridge(path: Option<&Path>) -> anyhow::Result<()> {
    let mut config = BridgeConfig::load_or_default(path)?;
    config.apply_env();
    config.validate()?;

    let mut app = App::new(config);
    app.run().await?;
    Ok(())
}

async fn list_devices(path: Option<&Path>) -> anyhow::Result<()> {
    let mut config = BridgeConfig::load_or_default(path)?;
    config.apply_env();
    if config.speaker.account.is_empty() || config.speaker.password.is_empty() {
        anyhow::bail!("set speaker.account and speaker.password (or SONA_ACCOUNT/SONA_PASSWORD)");
    }

    let speaker = CloudSpeaker::new(config.speaker, config.timing);
    let devices = speaker.device_list().await?;
    if devices.is_empty() {
        println!("No devices registered to this account");
        return Ok(());
    }

    println!("{:<40} {:<16} NAME", "DEVICE ID", "HARDWARE");
    for device in &devices {
        println!(
            "{:<40} {:<16} {}",
            device.device_id, device.hardware, device.name
        );
    }
    Ok(())
}

fn write_template(path: Option<&Path>) -> anyhow::Result<()> {
    let target = path
        .map(Path::to_path_buf)
        .unwrap_or_else(BridgeConfig::default_config_path);
    if target.exists() {
        anyhow::bail!("config already exists at {}", target.display());
    }

    BridgeConfig::default().save_to_file(&target)?;
    println!("Wrote config template to {}", target.display());
    println!("Fill in speaker.account, speaker.password, speaker.hardware and chat.api_key");
    Ok(())
}
