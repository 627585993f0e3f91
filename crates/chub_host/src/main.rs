mod demo;
mod stats;

use anyhow::Result;
use chub_host::ChubConfig;
use clap::{Parser, Subcommand};

#[derive(Parser)]
struct Cli {
    /// Bootloader image; uses the built-in simulator images when omitted.
    #[arg(long, requires = "os")]
    bootloader: Option<String>,
    /// Firmware image.
    #[arg(long, requires = "bootloader")]
    os: Option<String>,
    #[arg(long)]
    no_verify: bool,
    #[arg(long)]
    kernel_log: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Echo packets through the data channels and report latency.
    Echo {
        #[arg(short, long, default_value_t = 1000)]
        packets: usize,
        #[arg(short, long, default_value_t = 64)]
        size: usize,
    },
    /// Corrupt a channel and watch the controller recover.
    Recover {
        #[arg(short, long, default_value_t = 10)]
        packets: usize,
    },
    /// Send a debug command by name or code.
    Utc { command: String },
    /// Send hex bytes and print the echo.
    Send { payload: String },
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let config = ChubConfig {
        verify_firmware: !cli.no_verify,
        kernel_log: cli.kernel_log,
        ..ChubConfig::default()
    };
    let images = cli.bootloader.zip(cli.os);
    let rig = demo::Rig::start(images, config)?;

    match cli.command {
        Commands::Echo { packets, size } => demo::run_echo(&rig, packets, size)?,
        Commands::Recover { packets } => demo::run_recover(&rig, packets)?,
        Commands::Utc { command } => demo::run_utc(&rig, &command)?,
        Commands::Send { payload } => demo::run_send(&rig, &payload)?,
    }
    rig.stop()
}
