//! Command-line access to the lab instruments.
//!
//! ```bash
//! labinst resources
//! labinst idn TCPIP0::192.168.0.10::inst0::INSTR
//! labinst grab oscilloscope --key bk
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use lab_instruments::manipulator::pos_str;
use lab_instruments::resource::{identify, Resource};
use lab_instruments::{factory, logging, Settings};
use tokio::time::timeout;

#[derive(Parser)]
#[command(name = "labinst")]
#[command(about = "Discover and query lab instruments", long_about = None)]
struct Cli {
    /// Settings file (TOML)
    #[arg(long, default_value = lab_instruments::config::DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Override the configured log level
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List configured VISA resources and available serial ports
    Resources,

    /// Print the *IDN? reply of a VISA resource
    Idn {
        /// Resource name, e.g. TCPIP0::10.0.0.2::inst0::INSTR
        resource: String,
    },

    /// Connect to the first detected instrument of a kind
    Grab {
        kind: Kind,

        /// Only try this driver (e.g. bk, keysight, rigol, sutter)
        #[arg(long)]
        key: Option<String>,
    },

    /// Print the effective settings as TOML
    Config,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Kind {
    Generator,
    Oscilloscope,
    Manipulator,
    Camera,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut settings = Settings::load_from(&cli.config)?;
    if let Some(level) = cli.log_level {
        settings.log_level = level;
    }
    logging::init(&settings.log_level)?;

    match cli.command {
        Commands::Resources => list_resources(&settings),
        Commands::Idn { resource } => print_idn(&settings, &resource).await,
        Commands::Grab { kind, key } => grab(&settings, kind, key.as_deref()).await,
        Commands::Config => {
            print!("{}", settings.to_toml()?);
            Ok(())
        }
    }
}

fn list_resources(settings: &Settings) -> Result<()> {
    println!("VISA resources:");
    if settings.visa.resources.is_empty() {
        println!("  (none configured)");
    }
    for name in &settings.visa.resources {
        match name.parse::<Resource>() {
            Ok(res) if res.is_openable() => println!("  {res}"),
            Ok(res) => println!("  {res} (not openable)"),
            Err(e) => println!("  {name} (invalid: {e})"),
        }
    }

    println!("Serial ports:");
    let ports = tokio_serial::available_ports().context("failed to enumerate serial ports")?;
    if ports.is_empty() {
        println!("  (none)");
    }
    for port in ports {
        match port.port_type {
            tokio_serial::SerialPortType::UsbPort(info) => println!(
                "  {} (USB {:04x}:{:04x}, serial {})",
                port.port_name,
                info.vid,
                info.pid,
                info.serial_number.as_deref().unwrap_or("?")
            ),
            _ => println!("  {}", port.port_name),
        }
    }
    Ok(())
}

async fn print_idn(settings: &Settings, name: &str) -> Result<()> {
    let res: Resource = name.parse()?;
    let to = settings.visa.timeout();
    let mut link = res.open(to).await?;
    let idn = timeout(to, identify(link.as_mut()))
        .await
        .with_context(|| format!("{res} did not answer *IDN? within {to:?}"))??;
    println!("{idn}");
    link.close().await
}

async fn grab(settings: &Settings, kind: Kind, key: Option<&str>) -> Result<()> {
    // Links are released even when the report query fails.
    match kind {
        Kind::Generator => {
            let mut generator = factory::grab_generator(settings, key).await?;
            let idn = generator.idn().await;
            generator.disconnect().await?;
            println!("{}", idn?);
        }
        Kind::Oscilloscope => {
            let mut scope = factory::grab_oscilloscope(settings, key).await?;
            let idn = scope.idn().await;
            scope.disconnect().await?;
            println!("{}", idn?);
        }
        Kind::Manipulator => {
            let mut stage = factory::grab_manipulator(settings, key).await?;
            let position = stage.position().await;
            stage.disconnect().await?;
            println!("position: {}", pos_str(&position?));
        }
        Kind::Camera => {
            let mut camera = factory::grab_camera(key).await?;
            let camera_settings = camera.settings();
            camera.disconnect()?;
            println!("{}", camera_settings?);
        }
    }
    Ok(())
}
