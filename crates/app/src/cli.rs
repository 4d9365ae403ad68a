use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version, about = "Serverless planning poker rooms", long_about = None)]
pub struct Cli {
    /// TOML configuration file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Directory holding the identity and saved-session database
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Open a new room and act as its relay.
    Create(CreateArgs),
    /// Join a room from its room code.
    Join(JoinArgs),
    /// Rejoin the room saved by the previous run.
    Resume,
}

#[derive(Args, Debug, Clone)]
pub struct CreateArgs {
    /// Display name.
    #[arg(long)]
    pub name: String,

    /// Socket address to listen on. Defaults to the configured address.
    #[arg(long)]
    pub listen: Option<SocketAddr>,

    /// IP written into the room code when listening on all interfaces.
    #[arg(long)]
    pub advertise: Option<IpAddr>,

    /// Reveal automatically once all but one participant have voted.
    #[arg(long)]
    pub auto_reveal: bool,

    /// Auto-reveal countdown in seconds.
    #[arg(long)]
    pub duration: Option<u32>,
}

#[derive(Args, Debug, Clone)]
pub struct JoinArgs {
    /// Room code, as printed by `tally create`.
    pub room_code: String,

    /// Display name.
    #[arg(long)]
    pub name: String,
}
