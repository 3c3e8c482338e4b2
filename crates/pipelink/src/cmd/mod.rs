use clap::{Args, Subcommand};
use pipelink_transport::PipeNamespace;

use crate::exit::CliResult;
use crate::output::OutputFormat;

pub mod send;
pub mod serve;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a JSON server and print what clients send.
    Serve(ServeArgs),
    /// Connect as a client and send one JSON message.
    Send(SendArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, namespace: &PipeNamespace, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Serve(args) => serve::run(args, namespace, format),
        Command::Send(args) => send::run(args, namespace, format),
        Command::Version(args) => version::run(args),
    }
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Rendezvous pipe name to listen on.
    pub name: String,
    /// Send every message back to the client that sent it.
    #[arg(long, conflicts_with = "broadcast")]
    pub echo: bool,
    /// Send every message to all connected clients.
    #[arg(long, conflicts_with = "echo")]
    pub broadcast: bool,
    /// Exit after handling N messages.
    #[arg(long)]
    pub count: Option<usize>,
}

#[derive(Args, Debug)]
pub struct SendArgs {
    /// Rendezvous pipe name of the server.
    pub name: String,
    /// JSON message to send.
    #[arg(long)]
    pub json: String,
    /// Wait for one reply and print it.
    #[arg(long)]
    pub wait: bool,
    /// How long to wait for the server and for a reply (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub timeout: String,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}
