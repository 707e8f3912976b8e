use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use vaultsync::{Result, cmd};

/// Command-line arguments for the vaultsync application
#[derive(Parser)]
#[command(name = "vaultsync")]
#[command(about = "Live change propagation for shared document vaults")]
#[command(version)]
struct Cli {
   #[command(subcommand)]
   command: Cmd,
}

/// Available subcommands for vaultsync
#[derive(Subcommand)]
enum Cmd {
   #[command(about = "Watch a vault directory and stream changes to an attached viewer")]
   Watch {
      #[arg(help = "Vault root directory")]
      root: PathBuf,

      #[arg(long, env = "VAULTSYNC_VAULT", help = "Vault name (default: root directory name)")]
      vault: Option<String>,
   },

   #[command(about = "Print the effective configuration")]
   Config {
      #[arg(long, help = "Also merge <root>/.vaultsync.toml")]
      root: Option<PathBuf>,
   },
}

#[tokio::main]
async fn main() {
   let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("vaultsync=info"));
   tracing_subscriber::fmt().with_env_filter(filter).init();

   let cli = Cli::parse();
   if let Err(err) = run(cli).await {
      eprintln!("{err}");
      std::process::exit(err.exit_code());
   }
}

async fn run(cli: Cli) -> Result<()> {
   match cli.command {
      Cmd::Watch { root, vault } => cmd::watch::execute(root, vault).await,
      Cmd::Config { root } => cmd::config::execute(root),
   }
}
