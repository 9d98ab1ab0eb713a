use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod cmd;

#[derive(Parser)]
#[command(name = "warden")]
#[command(version, about = "Game server supervisor with a WebSocket operator console")]
pub struct Cli {
    /// Path to the settings file
    #[arg(short, long, global = true, default_value = warden::config::CONFIG_FILE_NAME)]
    pub config: PathBuf,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Diagnostic log format
    #[arg(long, global = true, value_enum, default_value = "text")]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Write a default settings file and create the directory layout
    Init {
        /// Overwrite an existing settings file
        #[arg(long)]
        force: bool,
    },
    /// Run the monitor until Ctrl+C or `:kill monitor`
    Serve {
        /// Override the listener port
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
}

fn init_tracing(verbose: bool, format: LogFormat) {
    let default = if verbose { "warden=debug" } else { "warden=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_format);

    match &cli.command {
        Commands::Init { force } => cmd::cmd_init(&cli.config, *force)?,
        Commands::Serve { port } => cmd::cmd_serve(&cli.config, *port).await?,
        Commands::Config { command } => cmd::cmd_config(&cli.config, command.clone())?,
    }

    Ok(())
}
