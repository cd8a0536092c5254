use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
    name = "multilink-server",
    version,
    about = "Multilink server: terminates bonded client sessions"
)]
pub struct Cli {
    /// Path to config file (TOML)
    #[arg(long)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Accept clients and relay their traffic until Ctrl-C
    ///
    /// This is what runs when no subcommand is given.
    Run,

    /// Write a default config file with a fresh pre-shared key
    /// (does not overwrite unless --force)
    InitConfig {
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,

        /// Use this base64 pre-shared key instead of generating one
        #[arg(long)]
        psk: Option<String>,
    },

    /// Print the resolved config file path
    PrintConfigPath,
}
